use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::exchange::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::message_id::{MessageIdAllocator, MidReclaimListener};
use crate::message::{Message, MessageId, Token};
use crate::transport::Transport;

/// Typed events the reliability layer posts upstream. Whoever initiated an exchange
///  (client dispatcher, observation registry) decides what a timeout or reset means;
///  this layer only reports them. Terminal events are emitted at most once per
///  exchange: the remover of the table entry is the only emitter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExchangeEvent {
    Acked { peer: SocketAddr, message_id: MessageId, token: Token },
    ResetReceived { peer: SocketAddr, message_id: MessageId, token: Token },
    /// all retransmissions exhausted - an expected termination, not a failure
    TimedOut { peer: SocketAddr, message_id: MessageId, token: Token },
    Retransmitted { peer: SocketAddr, message_id: MessageId, token: Token, attempt: u32 },
    /// a confirmable observe notification went out again; sequence bookkeeping stays
    ///  with the observation registry, this is purely informational
    NotificationRetransmitted { peer: SocketAddr, token: Token, attempt: u32 },
}

#[async_trait::async_trait]
pub trait ExchangeEventSink: Send + Sync + 'static {
    async fn on_exchange_event(&self, event: ExchangeEvent);
}


struct OpenExchange {
    token: Token,
    /// the identical encoded bytes are re-sent on every attempt
    encoded: Bytes,
    is_notification: bool,
    retransmit_task: JoinHandle<()>,
}

type ExchangeTable = Arc<RwLock<FxHashMap<(SocketAddr, MessageId), OpenExchange>>>;
type EventSinkSlot = Arc<RwLock<Option<Weak<dyn ExchangeEventSink>>>>;

/// Outbound reliability for confirmable messages: assigns a message id, sends, and
///  drives a bounded sequence of retransmissions with randomized exponential backoff,
///  ending in a timeout event unless a matching ACK or RST arrives first.
///
/// Per exchange the state machine is `Sent(0) -> ... -> Sent(max) -> TimedOut`, with
///  `Acked` / `Reset` possible from every `Sent(n)`. The classic race - timeout firing
///  concurrently with an arriving ACK - is resolved by the atomic table removal: only
///  the caller that actually removed the entry emits the corresponding event.
pub struct ReliabilityScheduler {
    config: Arc<ExchangeConfig>,
    transport: Arc<dyn Transport>,
    mids: Arc<MessageIdAllocator>,
    event_sink: EventSinkSlot,
    exchanges: ExchangeTable,
}

impl ReliabilityScheduler {
    pub fn new(config: Arc<ExchangeConfig>, transport: Arc<dyn Transport>, mids: Arc<MessageIdAllocator>) -> ReliabilityScheduler {
        ReliabilityScheduler {
            config,
            transport,
            mids,
            event_sink: Default::default(),
            exchanges: Default::default(),
        }
    }

    /// The sink is held weakly: the engine wiring owns it, and a torn-down engine must
    ///  not be kept alive by its own in-flight timers.
    pub async fn set_event_sink(&self, sink: Weak<dyn ExchangeEventSink>) {
        *self.event_sink.write().await = Some(sink);
    }

    /// Sends `message` confirmably, assigning a fresh message id (whatever the caller
    ///  left in the field is overwritten). Returns the assigned id so the caller can
    ///  correlate later events with this transmission.
    pub async fn send_confirmable(&self, peer: SocketAddr, mut message: Message, is_notification: bool) -> Result<MessageId, ExchangeError> {
        debug_assert!(message.message_type.is_confirmable());

        let message_id = self.mids.next(peer).await?;
        message.message_id = message_id;
        let token = message.token;
        let encoded = message.to_bytes();

        // one jitter factor per exchange, applied to the whole backoff sequence
        let factor = 1.0 + rand::thread_rng().gen::<f64>() * (self.config.ack_random_factor - 1.0);
        let delays = (0..self.config.max_retransmit)
            .map(|i| self.config.ack_timeout.mul_f64(factor * (1u64 << i) as f64))
            .collect::<Vec<_>>();

        // the table entry must exist before the first transmission: the peer may
        //  acknowledge while the datagram is still on its way out, and that ack has to
        //  find its exchange. The retransmit task's first sleep is at least ack_timeout,
        //  so spawning it up front is safe.
        let retransmit_task = self.spawn_retransmit_task(peer, message_id, token, delays);
        self.exchanges.write().await.insert((peer, message_id), OpenExchange {
            token,
            encoded: encoded.clone(),
            is_notification,
            retransmit_task,
        });

        trace!(?peer, ?message_id, ?token, "sending confirmable message");
        if let Err(e) = self.transport.send(peer, &encoded).await {
            if let Some(exchange) = self.exchanges.write().await.remove(&(peer, message_id)) {
                exchange.retransmit_task.abort();
            }
            return Err(e.into());
        }

        Ok(message_id)
    }

    fn spawn_retransmit_task(&self, peer: SocketAddr, message_id: MessageId, token: Token, delays: Vec<Duration>) -> JoinHandle<()> {
        let final_wait = delays.last().copied().unwrap_or(self.config.ack_timeout)
            + self.config.timeout_grace_period;

        let transport = self.transport.clone();
        let exchanges = self.exchanges.clone();
        let event_sink = self.event_sink.clone();

        tokio::spawn(async move {
            for (i, delay) in delays.iter().enumerate() {
                let attempt = i as u32 + 1;
                tokio::time::sleep(*delay).await;

                let Some((encoded, is_notification)) = exchanges.read().await
                    .get(&(peer, message_id))
                    .map(|exchange| (exchange.encoded.clone(), exchange.is_notification))
                else {
                    // acked or reset in the meantime
                    return;
                };

                trace!(?peer, ?message_id, attempt, "retransmitting");
                if let Err(e) = transport.send(peer, &encoded).await {
                    // a failed attempt does not end the schedule, later attempts may get through
                    warn!(?peer, ?message_id, attempt, "retransmission failed: {}", e);
                }

                emit(&event_sink, ExchangeEvent::Retransmitted { peer, message_id, token, attempt }).await;
                if is_notification {
                    emit(&event_sink, ExchangeEvent::NotificationRetransmitted { peer, token, attempt }).await;
                }
            }

            tokio::time::sleep(final_wait).await;

            // first remover wins - an ACK arriving right now must not produce a second event
            if exchanges.write().await.remove(&(peer, message_id)).is_some() {
                debug!(?peer, ?message_id, "exchange timed out");
                emit(&event_sink, ExchangeEvent::TimedOut { peer, message_id, token }).await;
            }
        })
    }

    /// An acknowledgement arrived. A match must be exact on both peer and message id;
    ///  anything else is reported and ignored.
    pub async fn on_ack(&self, peer: SocketAddr, message_id: MessageId) {
        match self.exchanges.write().await.remove(&(peer, message_id)) {
            Some(exchange) => {
                exchange.retransmit_task.abort();
                emit(&self.event_sink, ExchangeEvent::Acked { peer, message_id, token: exchange.token }).await;
            }
            None => debug!(?peer, ?message_id, "acknowledgement without a matching exchange - ignoring"),
        }
    }

    pub async fn on_reset(&self, peer: SocketAddr, message_id: MessageId) {
        match self.exchanges.write().await.remove(&(peer, message_id)) {
            Some(exchange) => {
                exchange.retransmit_task.abort();
                emit(&self.event_sink, ExchangeEvent::ResetReceived { peer, message_id, token: exchange.token }).await;
            }
            None => debug!(?peer, ?message_id, "reset without a matching exchange - ignoring"),
        }
    }

    pub async fn num_open(&self) -> usize {
        self.exchanges.read().await.len()
    }
}

/// The edge case this guards against: an exchange whose retransmission sequence somehow
///  outlives the reuse-protection window of its own message id. Letting it continue
///  would alias a future exchange, so it is force-cancelled as a timeout.
#[async_trait::async_trait]
impl MidReclaimListener for ReliabilityScheduler {
    async fn on_mid_reclaimed(&self, peer: SocketAddr, message_id: MessageId) {
        if let Some(exchange) = self.exchanges.write().await.remove(&(peer, message_id)) {
            exchange.retransmit_task.abort();
            warn!(?peer, ?message_id, "exchange outlived its message id - force-cancelling");
            emit(&self.event_sink, ExchangeEvent::TimedOut { peer, message_id, token: exchange.token }).await;
        }
    }
}

async fn emit(event_sink: &EventSinkSlot, event: ExchangeEvent) {
    let sink = event_sink.read().await.clone();
    match sink.and_then(|s| s.upgrade()) {
        Some(sink) => sink.on_exchange_event(event).await,
        None => debug!("no event sink registered - dropping {:?}", event),
    }
}
