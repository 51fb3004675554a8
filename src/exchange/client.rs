use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::exchange::error::ExchangeError;
use crate::exchange::message_id::MessageIdAllocator;
use crate::exchange::reliability::ReliabilityScheduler;
use crate::exchange::token::TokenAllocator;
use crate::message::{Message, MessageId, Token};
use crate::transport::Transport;

/// Returned by [ResponseHandler::on_response] for observe notifications: keep the
///  observation running, or cancel it. For regular (non-notification) responses the
///  value is ignored.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ObserveAction {
    Continue,
    Cancel,
}

/// Application callback for one outstanding request. `on_response` is invoked exactly
///  once for a regular exchange; only an ongoing observation delivers it repeatedly.
///  The remaining hooks are optional progress / termination notifications.
#[async_trait::async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
    async fn on_response(&self, response: &Message) -> ObserveAction;

    /// the confirmable transmission was acknowledged by the peer
    async fn on_ack(&self) {}

    async fn on_retransmit(&self, _attempt: u32) {}

    /// all retransmissions exhausted - terminal
    async fn on_timeout(&self) {}

    /// the peer sent a reset - terminal (and the expected answer to a ping)
    async fn on_reset(&self) {}
}


struct Registration {
    handler: Arc<dyn ResponseHandler>,
    observing: bool,
    /// pings use the empty token and never allocate one
    is_ping: bool,
}

/// Maps (peer, token) to the application callback waiting for that exchange, and routes
///  every inbound event there at most once - except for ongoing observations, which keep
///  their registration across notifications until something terminal happens.
pub struct ClientDispatcher {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenAllocator>,
    mids: Arc<MessageIdAllocator>,
    reliability: Arc<ReliabilityScheduler>,
    registrations: RwLock<FxHashMap<(SocketAddr, Token), Registration>>,
}

impl ClientDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenAllocator>,
        mids: Arc<MessageIdAllocator>,
        reliability: Arc<ReliabilityScheduler>,
    ) -> ClientDispatcher {
        ClientDispatcher {
            transport,
            tokens,
            mids,
            reliability,
            registrations: Default::default(),
        }
    }

    /// Sends a request to `peer`, allocating a fresh token and registering `handler`
    ///  for everything that comes back. Token exhaustion is surfaced here as an error
    ///  rather than blocking or silently dropping the send.
    pub async fn send_request(&self, peer: SocketAddr, request: Message, handler: Arc<dyn ResponseHandler>) -> Result<Token, ExchangeError> {
        let token = self.tokens.allocate(peer).await?;
        let mut request = request;
        request.token = token;

        self.registrations.write().await.insert((peer, token), Registration {
            handler,
            observing: false,
            is_ping: false,
        });

        let send_result = if request.message_type.is_confirmable() {
            self.reliability.send_confirmable(peer, request, false).await.map(|_| ())
        }
        else {
            match self.mids.next(peer).await {
                Ok(message_id) => {
                    request.message_id = message_id;
                    self.transport.send(peer, &request.to_bytes()).await.map_err(ExchangeError::from)
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = send_result {
            self.registrations.write().await.remove(&(peer, token));
            self.release_token(peer, token).await;
            return Err(e);
        }

        trace!(?peer, ?token, "request sent");
        Ok(token)
    }

    /// Liveness probe: an empty confirmable message the peer answers with a reset,
    ///  which arrives at the handler's `on_reset` hook. Pings share the empty token, so
    ///  at most one per peer can be in flight - a second one is rejected rather than
    ///  registered on top of the first, whose eventual reset or timeout would consume
    ///  the wrong registration.
    pub async fn send_ping(&self, peer: SocketAddr, handler: Arc<dyn ResponseHandler>) -> Result<(), ExchangeError> {
        {
            let mut registrations = self.registrations.write().await;
            if registrations.contains_key(&(peer, Token::EMPTY)) {
                return Err(ExchangeError::PingOutstanding { peer });
            }
            registrations.insert((peer, Token::EMPTY), Registration {
                handler,
                observing: false,
                is_ping: true,
            });
        }

        if let Err(e) = self.reliability.send_confirmable(peer, Message::ping(), false).await {
            self.registrations.write().await.remove(&(peer, Token::EMPTY));
            return Err(e);
        }
        Ok(())
    }

    /// Routes an inbound response (piggybacked, separate or notification) to its
    ///  callback. A response nobody is waiting for is answered with a reset so the peer
    ///  stops retransmitting or observing - a silent drop would leave it waiting
    ///  indefinitely.
    pub async fn on_response(&self, peer: SocketAddr, response: &Message) {
        let key = (peer, response.token);

        let mut registrations = self.registrations.write().await;
        let Some(registration) = registrations.get_mut(&key) else {
            drop(registrations);
            debug!(?peer, token = ?response.token, "response with no matching request - sending reset");
            self.send_reset(peer, response.message_id).await;
            return;
        };
        let handler = registration.handler.clone();

        if response.is_notification() {
            if !registration.observing {
                registration.observing = true;
                trace!(?peer, token = ?response.token, "first notification - marking registration as observing");
            }
            drop(registrations);

            match handler.on_response(response).await {
                ObserveAction::Continue => {
                    if response.message_type.is_confirmable() {
                        self.send_ack(peer, response.message_id).await;
                    }
                }
                ObserveAction::Cancel => {
                    // the registration goes away now; the next notification (or a
                    //  retransmission of this one) hits the no-match path above and is
                    //  answered with a reset, which ends the observation at the peer
                    self.registrations.write().await.remove(&key);
                    self.release_token(peer, response.token).await;
                    debug!(?peer, token = ?response.token, "observation cancelled by application");
                }
            }
        }
        else {
            // a regular response, or an error / non-notification response ending an
            //  observation: terminal either way
            registrations.remove(&key);
            drop(registrations);

            if response.message_type.is_confirmable() {
                self.send_ack(peer, response.message_id).await;
            }
            let _ = handler.on_response(response).await;
            self.release_token(peer, response.token).await;
        }
    }

    pub async fn on_acked(&self, peer: SocketAddr, token: Token) {
        if let Some(registration) = self.registrations.read().await.get(&(peer, token)) {
            registration.handler.on_ack().await;
        }
    }

    pub async fn on_retransmitted(&self, peer: SocketAddr, token: Token, attempt: u32) {
        if let Some(registration) = self.registrations.read().await.get(&(peer, token)) {
            registration.handler.on_retransmit(attempt).await;
        }
    }

    pub async fn on_timed_out(&self, peer: SocketAddr, token: Token) {
        if let Some(registration) = self.registrations.write().await.remove(&(peer, token)) {
            if !registration.is_ping {
                self.release_token(peer, token).await;
            }
            registration.handler.on_timeout().await;
        }
    }

    pub async fn on_reset_received(&self, peer: SocketAddr, token: Token) {
        if let Some(registration) = self.registrations.write().await.remove(&(peer, token)) {
            if !registration.is_ping {
                self.release_token(peer, token).await;
            }
            registration.handler.on_reset().await;
        }
    }

    async fn release_token(&self, peer: SocketAddr, token: Token) {
        if token.is_empty() {
            return;
        }
        if let Err(e) = self.tokens.release(peer, token).await {
            warn!("releasing token failed: {}", e);
        }
    }

    async fn send_ack(&self, peer: SocketAddr, message_id: MessageId) {
        if let Err(e) = self.transport.send(peer, &Message::empty_ack(message_id).to_bytes()).await {
            warn!(?peer, ?message_id, "sending acknowledgement failed: {}", e);
        }
    }

    async fn send_reset(&self, peer: SocketAddr, message_id: MessageId) {
        if let Err(e) = self.transport.send(peer, &Message::reset(message_id).to_bytes()).await {
            warn!(?peer, ?message_id, "sending reset failed: {}", e);
        }
    }

    pub async fn num_registered(&self) -> usize {
        self.registrations.read().await.len()
    }
}
