use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::exchange::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::message::MessageId;

/// Informed when a message id's reuse-protection window elapses. The reliability
///  scheduler registers itself here so an exchange that somehow outlives its own id
///  (scheduler delay, very long grace period) is force-cancelled instead of colliding
///  with a reallocation.
#[async_trait::async_trait]
pub trait MidReclaimListener: Send + Sync + 'static {
    async fn on_mid_reclaimed(&self, peer: SocketAddr, message_id: MessageId);
}

/// Issues 16-bit message ids, scoped per peer. An id stays reserved for the full
///  exchange-lifetime window after allocation - deliberately much longer than any
///  retransmission sequence - so stale duplicates arriving after an exchange has ended
///  still match the reservation instead of a fresh exchange.
pub struct MessageIdAllocator {
    lifetime: Duration,
    probe_limit: u32,
    inner: Arc<RwLock<MidTable>>,
}

#[derive(Default)]
struct MidTable {
    peers: FxHashMap<SocketAddr, FxHashMap<u16, JoinHandle<()>>>,
    reclaim_listener: Option<Weak<dyn MidReclaimListener>>,
}

impl MessageIdAllocator {
    pub fn new(config: &ExchangeConfig) -> MessageIdAllocator {
        MessageIdAllocator {
            lifetime: config.exchange_lifetime,
            probe_limit: config.mid_probe_limit,
            inner: Default::default(),
        }
    }

    pub async fn set_reclaim_listener(&self, listener: Weak<dyn MidReclaimListener>) {
        self.inner.write().await.reclaim_listener = Some(listener);
    }

    pub async fn next(&self, peer: SocketAddr) -> Result<MessageId, ExchangeError> {
        let mut table = self.inner.write().await;
        let in_use = table.peers.entry(peer).or_default();

        if in_use.len() == u16::MAX as usize + 1 {
            return Err(ExchangeError::MessageIdsExhausted { peer });
        }

        let mut rng = rand::thread_rng();
        let mut candidate: u16 = rng.gen();
        let mut probes = 0;
        while in_use.contains_key(&candidate) {
            probes += 1;
            if probes < self.probe_limit {
                candidate = rng.gen();
            }
            else {
                // table is crowded - fall back to a wrapping scan, which must hit a
                //  free id because the table is not full
                candidate = candidate.wrapping_add(1);
            }
        }

        let expiry = self.spawn_expiry(peer, MessageId(candidate));
        in_use.insert(candidate, expiry);

        trace!(?peer, message_id = ?MessageId(candidate), "allocated message id");
        Ok(MessageId(candidate))
    }

    fn spawn_expiry(&self, peer: SocketAddr, message_id: MessageId) -> JoinHandle<()> {
        let lifetime = self.lifetime;
        let inner = self.inner.clone();

        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;

            let listener = {
                let mut table = inner.write().await;
                let removed = table.peers.get_mut(&peer)
                    .and_then(|in_use| in_use.remove(&message_id.0));
                if removed.is_none() {
                    return;
                }
                if table.peers.get(&peer).is_some_and(|in_use| in_use.is_empty()) {
                    table.peers.remove(&peer);
                }
                table.reclaim_listener.clone()
            };

            debug!(?peer, ?message_id, "message id aged out");
            if let Some(listener) = listener.and_then(|l| l.upgrade()) {
                listener.on_mid_reclaimed(peer, message_id).await;
            }
        })
    }

    /// Drop a reservation early, without notifying the reclaim listener. Returns whether
    ///  the id was actually reserved.
    pub async fn release(&self, peer: SocketAddr, message_id: MessageId) -> bool {
        let mut table = self.inner.write().await;
        let Some(in_use) = table.peers.get_mut(&peer) else {
            return false;
        };
        let Some(expiry) = in_use.remove(&message_id.0) else {
            return false;
        };
        expiry.abort();
        if in_use.is_empty() {
            table.peers.remove(&peer);
        }
        true
    }

    pub async fn num_allocated(&self, peer: SocketAddr) -> usize {
        self.inner.read().await
            .peers.get(&peer)
            .map(|in_use| in_use.len())
            .unwrap_or(0)
    }
}
