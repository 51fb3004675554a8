use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::exchange::config::ExchangeConfig;
use crate::message::{Message, MessageId};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Delivery {
    /// first delivery - hand the request to the application
    Fresh,
    /// re-delivery of a known message id - suppress, the original handling continues
    Duplicate,
}

/// How the response to a confirmable request must travel: riding on the acknowledgement
///  (the response *is* the ack), or as a message of its own because a bare ack already
///  went out.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseMode {
    Piggybacked,
    Separate,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PendingState {
    /// no response yet, the bare-ack timer is still pending
    AwaitingResponse,
    /// the bare-ack timer fired first
    AckSent,
    /// the application's response went out (either way)
    Responded,
}

struct PendingRequest {
    state: PendingState,
    ack_task: JoinHandle<()>,
}

type RequestTable = Arc<RwLock<FxHashMap<(SocketAddr, MessageId), PendingRequest>>>;

/// Inbound half of the reliability story: recognizes re-delivered confirmable requests
///  by their (peer, message id), and decides whether an application response may be
///  piggybacked on the acknowledgement or whether a bare ack goes out first because the
///  application took too long.
///
/// Entries stay in the table for the full exchange lifetime so late duplicates are still
///  recognized long after the response went out.
pub struct DedupTable {
    config: Arc<ExchangeConfig>,
    transport: Arc<dyn Transport>,
    requests: RequestTable,
}

impl DedupTable {
    pub fn new(config: Arc<ExchangeConfig>, transport: Arc<dyn Transport>) -> DedupTable {
        DedupTable {
            config,
            transport,
            requests: Default::default(),
        }
    }

    pub async fn on_confirmable_request(&self, peer: SocketAddr, message_id: MessageId) -> Delivery {
        let mut requests = self.requests.write().await;

        if requests.contains_key(&(peer, message_id)) {
            debug!(?peer, ?message_id, "duplicate confirmable request - suppressing delivery");
            return Delivery::Duplicate;
        }

        let ack_task = self.spawn_ack_timer(peer, message_id);
        self.spawn_cleanup(peer, message_id);
        requests.insert((peer, message_id), PendingRequest {
            state: PendingState::AwaitingResponse,
            ack_task,
        });

        trace!(?peer, ?message_id, "recorded confirmable request");
        Delivery::Fresh
    }

    fn spawn_ack_timer(&self, peer: SocketAddr, message_id: MessageId) -> JoinHandle<()> {
        let delay = self.config.separate_ack_delay;
        let requests = self.requests.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut requests = requests.write().await;
                match requests.get_mut(&(peer, message_id)) {
                    Some(pending) if pending.state == PendingState::AwaitingResponse => {
                        pending.state = PendingState::AckSent;
                    }
                    // the response won the race, or the entry is gone
                    _ => return,
                }
            }

            debug!(?peer, ?message_id, "no response in time - sending bare acknowledgement");
            let ack = Message::empty_ack(message_id).to_bytes();
            if let Err(e) = transport.send(peer, &ack).await {
                warn!(?peer, ?message_id, "sending bare acknowledgement failed: {}", e);
            }
        })
    }

    /// Entries are only ever removed here, at the end of the exchange lifetime, so the
    ///  task runs detached - there is no early-removal path that would want to abort it.
    fn spawn_cleanup(&self, peer: SocketAddr, message_id: MessageId) {
        let lifetime = self.config.exchange_lifetime;
        let requests = self.requests.clone();

        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;

            if let Some(pending) = requests.write().await.remove(&(peer, message_id)) {
                pending.ack_task.abort();
                if pending.state == PendingState::AwaitingResponse {
                    // neither a response nor the ack timer released this entry in two
                    //  minutes - something upstream dropped the request on the floor
                    warn!(?peer, ?message_id, "inbound request was never answered - reclaiming its entry");
                }
            }
        });
    }

    /// The application produced a response for (peer, message id). Decides piggybacked
    ///  vs. separate delivery and stops the bare-ack timer if it has not fired yet.
    pub async fn claim_for_response(&self, peer: SocketAddr, message_id: MessageId) -> ResponseMode {
        let mut requests = self.requests.write().await;

        match requests.get_mut(&(peer, message_id)) {
            Some(pending) if pending.state == PendingState::AwaitingResponse => {
                pending.ack_task.abort();
                pending.state = PendingState::Responded;
                ResponseMode::Piggybacked
            }
            Some(pending) if pending.state == PendingState::AckSent => {
                pending.state = PendingState::Responded;
                ResponseMode::Separate
            }
            Some(_) => {
                debug!(?peer, ?message_id, "second response for the same request - sending separately");
                ResponseMode::Separate
            }
            None => ResponseMode::Separate,
        }
    }

    pub async fn num_pending(&self) -> usize {
        self.requests.read().await.len()
    }
}
