use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::exchange::config::ExchangeConfig;
use crate::exchange::message_id::MessageIdAllocator;
use crate::exchange::reliability::ReliabilityScheduler;
use crate::message::{Code, Message, MessageId, MessageType, Options, Token};
use crate::resource::{ReprError, Representation, ResourceListener, ResourceModel};
use crate::transport::Transport;

/// One observer of one resource. Exclusively owned by the registry: the resource model
///  only emits change events, it never touches this state.
struct Subscription {
    uri_path: String,
    /// notification sequence number, strictly increasing, advanced only here - never by
    ///  the reliability layer, no matter how often a notification is retransmitted
    seq: u32,
    /// message id of the most recently sent notification, for RST correlation
    last_message_id: MessageId,
    /// negotiated representation format
    accept: Option<u16>,
    /// entity tags the observer told us it already holds
    known_etags: Vec<Bytes>,
}

/// Server-side observation: the table of (peer, token) <-> resource-path subscriptions,
///  and the update-notification fan-out on resource changes.
///
/// State machine per subscription: `Registered -> Notifying(1) -> Notifying(2) -> ... ->
///  Cancelled`, where cancellation has five independent triggers: a non-observe request
///  to the same path, a reset matching the last notification, retransmission timeout of
///  a confirmable notification, resource removal, and an error representation.
pub struct ObserveRegistry {
    config: Arc<ExchangeConfig>,
    transport: Arc<dyn Transport>,
    mids: Arc<MessageIdAllocator>,
    reliability: Arc<ReliabilityScheduler>,
    resources: Arc<dyn ResourceModel>,
    subscriptions: RwLock<FxHashMap<(SocketAddr, Token), Subscription>>,
}

enum Outcome {
    Representation(Representation),
    /// terminal for the subscription: one final error notification, then drop
    Error(Code),
}

impl ObserveRegistry {
    pub fn new(
        config: Arc<ExchangeConfig>,
        transport: Arc<dyn Transport>,
        mids: Arc<MessageIdAllocator>,
        reliability: Arc<ReliabilityScheduler>,
        resources: Arc<dyn ResourceModel>,
    ) -> ObserveRegistry {
        ObserveRegistry {
            config,
            transport,
            mids,
            reliability,
            resources,
            subscriptions: Default::default(),
        }
    }

    /// Registers `peer` as an observer of the request's path. A second registration from
    ///  the same peer for the same path replaces the first (new token allowed). Returns
    ///  the observe value for the initial response.
    pub async fn register(&self, peer: SocketAddr, request: &Message) -> u32 {
        let uri_path = request.options.uri_path.clone();
        let mut subscriptions = self.subscriptions.write().await;

        let replaced = subscriptions.iter()
            .find(|((p, _), s)| *p == peer && s.uri_path == uri_path)
            .map(|(key, _)| *key);
        if let Some(key) = replaced {
            debug!(?peer, path = %uri_path, "replacing previous observation of the same resource");
            subscriptions.remove(&key);
        }

        subscriptions.insert((peer, request.token), Subscription {
            uri_path: uri_path.clone(),
            seq: 0,
            last_message_id: request.message_id,
            accept: request.options.content_format,
            known_etags: request.options.etags.clone(),
        });
        trace!(?peer, token = ?request.token, path = %uri_path, "observation registered");

        0
    }

    /// A plain (non-observe) request to a path ends any observation the peer holds on it.
    pub async fn cancel_for_request(&self, peer: SocketAddr, uri_path: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        let keys = subscriptions.iter()
            .filter(|((p, _), s)| *p == peer && s.uri_path == uri_path)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in keys {
            debug!(?peer, path = %uri_path, "observation cancelled by non-observe request");
            subscriptions.remove(&key);
        }
    }

    /// A reset whose message id equals the most recently sent notification of a
    ///  subscription cancels exactly that subscription - not other subscriptions of the
    ///  same peer on other paths.
    pub async fn on_reset(&self, peer: SocketAddr, message_id: MessageId) {
        let mut subscriptions = self.subscriptions.write().await;
        let matching = subscriptions.iter()
            .find(|((p, _), s)| *p == peer && s.last_message_id == message_id)
            .map(|(key, _)| *key);
        if let Some(key) = matching {
            debug!(?peer, ?message_id, "observation cancelled by reset");
            subscriptions.remove(&key);
        }
    }

    /// A confirmable notification exhausted its retransmissions: the observer is
    ///  unreachable and its subscription ends.
    pub async fn on_exchange_timed_out(&self, peer: SocketAddr, token: Token) {
        if self.subscriptions.write().await.remove(&(peer, token)).is_some() {
            debug!(?peer, ?token, "observer did not acknowledge notification - cancelling observation");
        }
    }

    /// A confirmable notification went out again. Purely informational: its sequence
    ///  number was assigned when the notification was built and never changes.
    pub async fn on_notification_retransmitted(&self, peer: SocketAddr, token: Token, attempt: u32) {
        trace!(?peer, ?token, attempt, "notification retransmitted");
    }

    pub async fn num_subscriptions(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    async fn outcome_for(
        &self,
        uri_path: &str,
        accept: Option<u16>,
        cache: &mut FxHashMap<Option<u16>, Outcome>,
    ) -> Outcome {
        if let Some(cached) = cache.get(&accept) {
            return match cached {
                Outcome::Representation(repr) => Outcome::Representation(repr.clone()),
                Outcome::Error(code) => Outcome::Error(*code),
            };
        }

        let outcome = match self.resources.representation(uri_path, accept).await {
            Ok(repr) => Outcome::Representation(repr),
            Err(ReprError::NotFound) => Outcome::Error(Code::NOT_FOUND),
            Err(ReprError::UnsupportedFormat) => Outcome::Error(Code::NOT_ACCEPTABLE),
            Err(ReprError::Failed(e)) => {
                // an application failure must not crash the pipeline - it becomes a
                //  best-effort error notification
                warn!(path = %uri_path, "building notification representation failed: {}", e);
                Outcome::Error(Code::INTERNAL_SERVER_ERROR)
            }
        };
        cache.insert(accept, match &outcome {
            Outcome::Representation(repr) => Outcome::Representation(repr.clone()),
            Outcome::Error(code) => Outcome::Error(*code),
        });
        outcome
    }

    async fn notify_subscribers(&self, uri_path: &str) {
        // sequence numbers are assigned under the write lock, in change-event order, so a
        //  later change can not overtake an earlier one. The lock is released before the
        //  representation fetch: that is application code, and it must be free to call
        //  back into the registry.
        let pending = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.iter_mut()
                .filter(|(_, s)| s.uri_path == uri_path)
                .map(|(key, s)| {
                    s.seq += 1;
                    (*key, s.seq, s.accept, s.known_etags.clone())
                })
                .collect::<Vec<_>>()
        };
        if pending.is_empty() {
            return;
        }

        // one representation fetch per distinct format, shared across subscribers
        let mut cache: FxHashMap<Option<u16>, Outcome> = Default::default();

        for (key, seq, accept, known_etags) in pending {
            let (peer, token) = key;

            match self.outcome_for(uri_path, accept, &mut cache).await {
                Outcome::Representation(repr) => {
                    let confirmable = seq % self.config.con_notification_interval == 0;
                    let not_modified = known_etags.contains(&repr.etag);

                    let notification = Message {
                        message_type: if confirmable { MessageType::Confirmable } else { MessageType::NonConfirmable },
                        code: if not_modified { Code::VALID } else { Code::CONTENT },
                        message_id: MessageId(0), // assigned below
                        token,
                        options: Options {
                            observe: Some(seq),
                            max_age: Some(repr.max_age_seconds),
                            content_format: Some(repr.content_format),
                            etags: vec![repr.etag.clone()],
                            uri_path: uri_path.to_string(),
                            ..Options::default()
                        },
                        payload: if not_modified { Bytes::new() } else { repr.payload.clone() },
                    };

                    // the subscription may have been cancelled while the lock was released
                    if !self.subscriptions.read().await.contains_key(&key) {
                        continue;
                    }

                    let sent_message_id = if confirmable {
                        match self.reliability.send_confirmable(peer, notification, true).await {
                            Ok(message_id) => Some(message_id),
                            // the subscription stays - the next change tries again
                            Err(e) => {
                                warn!(?peer, ?token, "sending notification failed: {}", e);
                                None
                            }
                        }
                    }
                    else {
                        self.send_non_confirmable(peer, notification).await
                    };

                    if let Some(message_id) = sent_message_id {
                        if let Some(subscription) = self.subscriptions.write().await.get_mut(&key) {
                            subscription.last_message_id = message_id;
                        }
                    }
                }
                Outcome::Error(code) => {
                    debug!(?peer, ?token, path = %uri_path, ?code, "ending observation with error notification");
                    self.send_final(peer, token, code).await;
                    self.subscriptions.write().await.remove(&key);
                }
            }
        }
    }

    async fn remove_all_for_path(&self, uri_path: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        let keys = subscriptions.iter()
            .filter(|(_, s)| s.uri_path == uri_path)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in keys {
            let (peer, token) = key;
            debug!(?peer, ?token, path = %uri_path, "resource removed - ending observation");
            self.send_final(peer, token, Code::NOT_FOUND).await;
            subscriptions.remove(&key);
        }
    }

    /// final notification ending a subscription: non-confirmable, best-effort, no
    ///  observe option
    async fn send_final(&self, peer: SocketAddr, token: Token, code: Code) {
        let message_id = match self.mids.next(peer).await {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!(?peer, "no message id for final notification: {}", e);
                return;
            }
        };
        let message = Message {
            message_type: MessageType::NonConfirmable,
            code,
            message_id,
            token,
            options: Options::default(),
            payload: Bytes::new(),
        };
        if let Err(e) = self.transport.send(peer, &message.to_bytes()).await {
            warn!(?peer, ?token, "sending final notification failed: {}", e);
        }
    }

    async fn send_non_confirmable(&self, peer: SocketAddr, mut message: Message) -> Option<MessageId> {
        let message_id = match self.mids.next(peer).await {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!(?peer, "no message id for notification: {}", e);
                return None;
            }
        };
        message.message_id = message_id;
        match self.transport.send(peer, &message.to_bytes()).await {
            Ok(()) => Some(message_id),
            Err(e) => {
                warn!(?peer, "sending notification failed: {}", e);
                // the id is burned either way; the subscription keeps its previous one
                Some(message_id)
            }
        }
    }
}

/// The registry is the engine's ear on the resource model: explicit typed change /
///  removal callbacks instead of a shared observable base class.
#[async_trait::async_trait]
impl ResourceListener for ObserveRegistry {
    async fn on_changed(&self, uri_path: &str) {
        self.notify_subscribers(uri_path).await;
    }

    async fn on_removed(&self, uri_path: &str) {
        self.remove_all_for_path(uri_path).await;
    }
}
