use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::exchange::client::{ClientDispatcher, ResponseHandler};
use crate::exchange::config::ExchangeConfig;
use crate::exchange::dedup::{DedupTable, Delivery, ResponseMode};
use crate::exchange::error::ExchangeError;
use crate::exchange::message_id::{MessageIdAllocator, MidReclaimListener};
use crate::exchange::observe::ObserveRegistry;
use crate::exchange::reliability::{ExchangeEvent, ExchangeEventSink, ReliabilityScheduler};
use crate::exchange::token::TokenAllocator;
use crate::message::{Code, Message, MessageType, Options, Token, OBSERVE_REGISTER};
use crate::resource::{ReprError, ResourceListener, ResourceModel};
use crate::transport::{MessageHandler, Transport};

/// Fans reliability-layer events out to the parties that own the affected state. Both
///  sides ignore keys they do not know: a timed-out client request means nothing to the
///  observation registry and vice versa.
struct EventRouter {
    client: Arc<ClientDispatcher>,
    observations: Arc<ObserveRegistry>,
}

#[async_trait]
impl ExchangeEventSink for EventRouter {
    async fn on_exchange_event(&self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Acked { peer, token, .. } =>
                self.client.on_acked(peer, token).await,
            ExchangeEvent::Retransmitted { peer, token, attempt, .. } =>
                self.client.on_retransmitted(peer, token, attempt).await,
            ExchangeEvent::TimedOut { peer, token, .. } => {
                self.client.on_timed_out(peer, token).await;
                self.observations.on_exchange_timed_out(peer, token).await;
            }
            ExchangeEvent::ResetReceived { peer, token, .. } =>
                self.client.on_reset_received(peer, token).await,
            ExchangeEvent::NotificationRetransmitted { peer, token, attempt } =>
                self.observations.on_notification_retransmitted(peer, token, attempt).await,
        }
    }
}


/// Decodes and routes everything that arrives from the transport. This is the single
///  entry point for inbound traffic, client and server side alike: the message type and
///  code decide where a datagram goes, not which API the application happens to use.
struct InboundDispatcher {
    transport: Arc<dyn Transport>,
    mids: Arc<MessageIdAllocator>,
    reliability: Arc<ReliabilityScheduler>,
    dedup: Arc<DedupTable>,
    client: Arc<ClientDispatcher>,
    observations: Arc<ObserveRegistry>,
    resources: Arc<dyn ResourceModel>,
}

#[async_trait]
impl MessageHandler for InboundDispatcher {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        let mut b = buf;
        let message = match Message::try_deser(&mut b) {
            Ok(message) => message,
            Err(e) => {
                warn!(?sender, "undecodable datagram: {}", e);
                // a decodable header of a confirmable message still gets a reset so the
                //  peer stops retransmitting
                if let Some((message_type, message_id)) = Message::try_peek_header(buf) {
                    if message_type.is_confirmable() {
                        self.send_best_effort(sender, Message::reset(message_id)).await;
                    }
                }
                return;
            }
        };

        match message.message_type {
            MessageType::Acknowledgement => {
                self.reliability.on_ack(sender, message.message_id).await;
                if message.code.is_response() {
                    // piggybacked response riding on the ack
                    self.client.on_response(sender, &message).await;
                }
            }
            MessageType::Reset => {
                self.reliability.on_reset(sender, message.message_id).await;
                self.observations.on_reset(sender, message.message_id).await;
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                if message.code.is_empty() {
                    if message.message_type.is_confirmable() {
                        // a ping - the mandated answer is a reset
                        debug!(?sender, "ping received - answering with reset");
                        self.send_best_effort(sender, Message::reset(message.message_id)).await;
                    }
                    else {
                        debug!(?sender, "empty non-confirmable message - ignoring");
                    }
                }
                else if message.code.is_request() {
                    self.handle_request(sender, &message).await;
                }
                else if message.code.is_response() {
                    // separate response or observe notification
                    self.client.on_response(sender, &message).await;
                }
                else {
                    warn!(?sender, code = ?message.code, "message with reserved code class");
                    if message.message_type.is_confirmable() {
                        self.send_best_effort(sender, Message::reset(message.message_id)).await;
                    }
                }
            }
        }
    }
}

impl InboundDispatcher {
    async fn handle_request(&self, peer: SocketAddr, request: &Message) {
        if request.message_type.is_confirmable()
            && self.dedup.on_confirmable_request(peer, request.message_id).await == Delivery::Duplicate
        {
            debug!(?peer, message_id = ?request.message_id, "duplicate request - suppressing");
            return;
        }

        if request.options.unknown_critical {
            self.respond(peer, request, Code::BAD_OPTION, Options::default(), Bytes::new()).await;
            return;
        }
        if request.code != Code::GET {
            self.respond(peer, request, Code::METHOD_NOT_ALLOWED, Options::default(), Bytes::new()).await;
            return;
        }

        let observe_requested = request.options.observe == Some(OBSERVE_REGISTER);
        if !observe_requested {
            // explicit deregistration and plain requests both end a previous observation
            self.observations.cancel_for_request(peer, &request.options.uri_path).await;
        }

        match self.resources.representation(&request.options.uri_path, request.options.content_format).await {
            Ok(representation) => {
                // only a successful response establishes the observation
                let observe = if observe_requested {
                    Some(self.observations.register(peer, request).await)
                }
                else {
                    None
                };

                let not_modified = request.options.etags.contains(&representation.etag);
                let options = Options {
                    observe,
                    max_age: Some(representation.max_age_seconds),
                    content_format: Some(representation.content_format),
                    etags: vec![representation.etag.clone()],
                    uri_path: request.options.uri_path.clone(),
                    ..Options::default()
                };
                if not_modified {
                    self.respond(peer, request, Code::VALID, options, Bytes::new()).await;
                }
                else {
                    self.respond(peer, request, Code::CONTENT, options, representation.payload).await;
                }
            }
            Err(e) => {
                let code = match e {
                    ReprError::NotFound => Code::NOT_FOUND,
                    ReprError::UnsupportedFormat => Code::NOT_ACCEPTABLE,
                    ReprError::Failed(e) => {
                        warn!(?peer, path = %request.options.uri_path, "building representation failed: {}", e);
                        Code::INTERNAL_SERVER_ERROR
                    }
                };
                self.respond(peer, request, code, Options::default(), Bytes::new()).await;
            }
        }
    }

    /// Sends a response, picking the shape the exchange is still eligible for: an ack
    ///  with the response piggybacked onto it, a separate confirmable message if the bare
    ///  ack already went out, or a plain non-confirmable answer to a non-confirmable
    ///  request.
    async fn respond(&self, peer: SocketAddr, request: &Message, code: Code, options: Options, payload: Bytes) {
        let mut response = Message {
            message_type: MessageType::NonConfirmable,
            code,
            message_id: request.message_id,
            token: request.token,
            options,
            payload,
        };

        if request.message_type.is_confirmable() {
            match self.dedup.claim_for_response(peer, request.message_id).await {
                ResponseMode::Piggybacked => {
                    response.message_type = MessageType::Acknowledgement;
                    self.send_best_effort(peer, response).await;
                }
                ResponseMode::Separate => {
                    response.message_type = MessageType::Confirmable;
                    if let Err(e) = self.reliability.send_confirmable(peer, response, false).await {
                        warn!(?peer, "sending separate response failed: {}", e);
                    }
                }
            }
        }
        else {
            match self.mids.next(peer).await {
                Ok(message_id) => {
                    response.message_id = message_id;
                    self.send_best_effort(peer, response).await;
                }
                Err(e) => warn!(?peer, "no message id for response: {}", e),
            }
        }
    }

    async fn send_best_effort(&self, peer: SocketAddr, message: Message) {
        if let Err(e) = self.transport.send(peer, &message.to_bytes()).await {
            warn!(?peer, "send failed: {}", e);
        }
    }
}


/// One endpoint of the request / response protocol, client and server role in one: the
///  fully wired stack of allocators, reliability, deduplication, client dispatch and
///  observation handling on top of a [Transport].
pub struct CoapEndpoint {
    transport: Arc<dyn Transport>,
    client: Arc<ClientDispatcher>,
    observations: Arc<ObserveRegistry>,
    inbound: Arc<InboundDispatcher>,
    // the reliability layer and mid allocator only hold weak references upstream; the
    //  router must be owned here to stay alive
    _router: Arc<EventRouter>,
}

impl CoapEndpoint {
    pub async fn new(
        config: ExchangeConfig,
        transport: Arc<dyn Transport>,
        resources: Arc<dyn ResourceModel>,
    ) -> Arc<CoapEndpoint> {
        let config = Arc::new(config);
        let tokens = Arc::new(TokenAllocator::new(&config));
        let mids = Arc::new(MessageIdAllocator::new(&config));
        let reliability = Arc::new(ReliabilityScheduler::new(config.clone(), transport.clone(), mids.clone()));
        let dedup = Arc::new(DedupTable::new(config.clone(), transport.clone()));
        let client = Arc::new(ClientDispatcher::new(transport.clone(), tokens, mids.clone(), reliability.clone()));
        let observations = Arc::new(ObserveRegistry::new(
            config.clone(),
            transport.clone(),
            mids.clone(),
            reliability.clone(),
            resources.clone(),
        ));

        let router = Arc::new(EventRouter {
            client: client.clone(),
            observations: observations.clone(),
        });
        reliability.set_event_sink(Arc::downgrade(&router) as Weak<dyn ExchangeEventSink>).await;
        mids.set_reclaim_listener(Arc::downgrade(&reliability) as Weak<dyn MidReclaimListener>).await;

        let inbound = Arc::new(InboundDispatcher {
            transport: transport.clone(),
            mids,
            reliability,
            dedup,
            client: client.clone(),
            observations: observations.clone(),
            resources,
        });

        Arc::new(CoapEndpoint {
            transport,
            client,
            observations,
            inbound,
            _router: router,
        })
    }

    /// Runs the transport's receive loop, feeding this endpoint. Does not return until
    ///  [CoapEndpoint::shut_down] is called.
    pub async fn recv(&self) -> anyhow::Result<()> {
        self.transport.recv_loop(self.inbound.clone()).await
    }

    pub fn shut_down(&self) {
        self.transport.cancel_recv_loop();
    }

    /// the endpoint's inbound entry point, for wiring it to an externally driven
    ///  transport
    pub fn message_handler(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        self.inbound.clone()
    }

    /// the listener to register with the application's resource model so changes turn
    ///  into observe notifications
    pub fn resource_listener(self: &Arc<Self>) -> Arc<dyn ResourceListener> {
        self.observations.clone()
    }

    pub async fn send_request(&self, peer: SocketAddr, request: Message, handler: Arc<dyn ResponseHandler>) -> Result<Token, ExchangeError> {
        self.client.send_request(peer, request, handler).await
    }

    pub async fn send_ping(&self, peer: SocketAddr, handler: Arc<dyn ResponseHandler>) -> Result<(), ExchangeError> {
        self.client.send_ping(peer, handler).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::runtime::Builder;

    use crate::exchange::client::ObserveAction;
    use crate::message::MessageId;
    use crate::resource::Representation;
    use crate::test_util::{peer_addr, RecordingTransport, TestResources};

    use super::*;

    struct RecordingHandler {
        responses: Mutex<Vec<Message>>,
        hooks: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                responses: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ResponseHandler for RecordingHandler {
        async fn on_response(&self, response: &Message) -> ObserveAction {
            self.responses.lock().unwrap().push(response.clone());
            ObserveAction::Continue
        }

        async fn on_retransmit(&self, attempt: u32) {
            self.hooks.lock().unwrap().push(format!("retransmit:{}", attempt));
        }

        async fn on_timeout(&self) {
            self.hooks.lock().unwrap().push("timeout".to_string());
        }

        async fn on_reset(&self) {
            self.hooks.lock().unwrap().push("reset".to_string());
        }
    }

    struct Fixture {
        endpoint: Arc<CoapEndpoint>,
        transport: Arc<RecordingTransport>,
        resources: Arc<TestResources>,
    }

    async fn fixture(config: ExchangeConfig) -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let resources = Arc::new(TestResources::new());
        Fixture {
            endpoint: CoapEndpoint::new(config, transport.clone(), resources.clone()).await,
            transport,
            resources,
        }
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    fn repr(payload: &'static [u8], etag: &'static [u8]) -> Representation {
        Representation {
            payload: Bytes::from_static(payload),
            etag: Bytes::from_static(etag),
            max_age_seconds: 60,
            content_format: 0,
        }
    }

    async fn inject(f: &Fixture, from: SocketAddr, message: &Message) {
        f.endpoint.message_handler().handle_message(&message.to_bytes(), from).await;
    }

    async fn sent_messages(transport: &RecordingTransport) -> Vec<Message> {
        transport.sent().await.iter()
            .map(|(_, buf)| Message::try_deser(&mut buf.as_slice()).unwrap())
            .collect()
    }

    fn con_get(uri_path: &str, message_id: u16, token: &[u8]) -> Message {
        let mut request = Message::request(MessageType::Confirmable, Code::GET, uri_path);
        request.message_id = MessageId(message_id);
        request.token = Token::from_bytes(token);
        request
    }

    #[test]
    fn test_request_to_unresponsive_peer_retransmits_then_times_out() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            let handler = RecordingHandler::new();

            f.endpoint.send_request(
                peer,
                Message::request(MessageType::Confirmable, Code::GET, "temperature"),
                handler.clone(),
            ).await.unwrap();

            tokio::time::sleep(Duration::from_secs(120)).await;

            let sent = f.transport.sent().await;
            assert_eq!(sent.len(), 5);
            assert!(sent.iter().all(|(_, buf)| *buf == sent[0].1));

            let hooks = handler.hooks.lock().unwrap().clone();
            assert_eq!(hooks, vec!["retransmit:1", "retransmit:2", "retransmit:3", "retransmit:4", "timeout"]);
            assert!(handler.responses.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_piggybacked_response_reaches_the_handler() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            let handler = RecordingHandler::new();

            f.endpoint.send_request(
                peer,
                Message::request(MessageType::Confirmable, Code::GET, "temperature"),
                handler.clone(),
            ).await.unwrap();
            let request = sent_messages(&f.transport).await.pop().unwrap();

            let response = Message {
                message_type: MessageType::Acknowledgement,
                code: Code::CONTENT,
                message_id: request.message_id,
                token: request.token,
                options: Options::default(),
                payload: Bytes::from_static(b"21.5"),
            };
            inject(&f, peer, &response).await;

            let responses = handler.responses.lock().unwrap().clone();
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].payload.as_ref(), b"21.5");

            // the exchange is closed: no retransmissions ever happen
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_eq!(f.transport.sent().await.len(), 1);
        });
    }

    #[test]
    fn test_inbound_request_gets_piggybacked_response() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            f.resources.set("temperature", repr(b"21.5", b"v1")).await;

            inject(&f, peer, &con_get("temperature", 7, b"\xab")).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].message_type, MessageType::Acknowledgement);
            assert_eq!(sent[0].message_id, MessageId(7));
            assert_eq!(sent[0].token, Token::from_bytes(b"\xab"));
            assert_eq!(sent[0].code, Code::CONTENT);
            assert_eq!(sent[0].payload.as_ref(), b"21.5");
            assert_eq!(sent[0].options.content_format, Some(0));
            assert_eq!(sent[0].options.max_age, Some(60));
        });
    }

    #[test]
    fn test_duplicate_confirmable_request_is_answered_once() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            f.resources.set("temperature", repr(b"21.5", b"v1")).await;

            let request = con_get("temperature", 7, b"\xab");
            inject(&f, peer, &request).await;
            inject(&f, peer, &request).await;

            assert_eq!(f.transport.sent().await.len(), 1);
        });
    }

    #[test]
    fn test_request_for_missing_resource_yields_not_found() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;

            inject(&f, peer_addr(1), &con_get("nowhere", 7, b"\x01")).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent[0].code, Code::NOT_FOUND);
            assert_eq!(sent[0].message_type, MessageType::Acknowledgement);
        });
    }

    #[test]
    fn test_unknown_critical_option_is_rejected() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            f.resources.set("temperature", repr(b"x", b"v1")).await;

            let mut request = con_get("temperature", 7, b"\x01");
            request.options.unknown_critical = true;
            inject(&f, peer_addr(1), &request).await;

            assert_eq!(sent_messages(&f.transport).await[0].code, Code::BAD_OPTION);
        });
    }

    #[test]
    fn test_non_get_request_is_rejected() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;

            let mut request = con_get("temperature", 7, b"\x01");
            request.code = Code::new(0, 2);
            inject(&f, peer_addr(1), &request).await;

            assert_eq!(sent_messages(&f.transport).await[0].code, Code::METHOD_NOT_ALLOWED);
        });
    }

    #[test]
    fn test_matching_etag_yields_valid_without_payload() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            f.resources.set("temperature", repr(b"21.5", b"v1")).await;

            let mut request = con_get("temperature", 7, b"\x01");
            request.options.etags = vec![Bytes::from_static(b"v1")];
            inject(&f, peer_addr(1), &request).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent[0].code, Code::VALID);
            assert!(sent[0].payload.is_empty());
        });
    }

    #[test]
    fn test_non_confirmable_request_gets_non_confirmable_response() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            f.resources.set("temperature", repr(b"21.5", b"v1")).await;

            let mut request = Message::request(MessageType::NonConfirmable, Code::GET, "temperature");
            request.message_id = MessageId(7);
            request.token = Token::from_bytes(b"\x01");
            inject(&f, peer, &request).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent[0].message_type, MessageType::NonConfirmable);
            assert_eq!(sent[0].code, Code::CONTENT);
            assert_eq!(sent[0].token, Token::from_bytes(b"\x01"));
            // the response has its own message id, not the request's
            assert_ne!(sent[0].message_id, MessageId(7));
        });
    }

    #[test]
    fn test_ping_is_answered_with_reset() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);

            let mut ping = Message::ping();
            ping.message_id = MessageId(42);
            inject(&f, peer, &ping).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].message_type, MessageType::Reset);
            assert_eq!(sent[0].message_id, MessageId(42));
        });
    }

    #[test]
    fn test_undecodable_confirmable_datagram_is_answered_with_reset() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);

            // a valid header (type confirmable, message id 0x1234) followed by garbage
            let datagram = [0u8, 0x45, 0x12, 0x34, 0xff, 0xff, 0xff];
            f.endpoint.message_handler().handle_message(&datagram, peer).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].message_type, MessageType::Reset);
            assert_eq!(sent[0].message_id, MessageId(0x1234));
        });
    }

    #[test]
    fn test_observe_register_then_changes_notify_with_increasing_sequence() {
        paused_rt().block_on(async {
            let mut config = ExchangeConfig::new();
            config.con_notification_interval = 1;
            let f = fixture(config).await;
            let peer = peer_addr(1);
            f.resources.set("temperature", repr(b"20.0", b"v1")).await;

            let mut request = con_get("temperature", 7, b"\xab");
            request.options.observe = Some(OBSERVE_REGISTER);
            inject(&f, peer, &request).await;

            let initial = sent_messages(&f.transport).await.pop().unwrap();
            assert_eq!(initial.code, Code::CONTENT);
            assert_eq!(initial.options.observe, Some(0));
            f.transport.clear().await;

            // two changes before anything is acknowledged: both notifications go out,
            //  with sequence numbers 1 and 2
            f.resources.set("temperature", repr(b"21.0", b"v2")).await;
            f.endpoint.resource_listener().on_changed("temperature").await;
            f.resources.set("temperature", repr(b"22.0", b"v3")).await;
            f.endpoint.resource_listener().on_changed("temperature").await;

            let notifications = sent_messages(&f.transport).await;
            assert_eq!(notifications.len(), 2);
            assert_eq!(notifications[0].options.observe, Some(1));
            assert_eq!(notifications[0].payload.as_ref(), b"21.0");
            assert_eq!(notifications[1].options.observe, Some(2));
            assert_eq!(notifications[1].payload.as_ref(), b"22.0");
            assert!(notifications.iter().all(|n| n.token == Token::from_bytes(b"\xab")));

            // a reset to the second notification ends the observation
            inject(&f, peer, &Message::reset(notifications[1].message_id)).await;
            f.transport.clear().await;

            f.endpoint.resource_listener().on_changed("temperature").await;
            assert!(f.transport.sent().await.is_empty());
        });
    }

    #[test]
    fn test_plain_request_cancels_running_observation() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            f.resources.set("temperature", repr(b"20.0", b"v1")).await;

            let mut request = con_get("temperature", 7, b"\xab");
            request.options.observe = Some(OBSERVE_REGISTER);
            inject(&f, peer, &request).await;

            inject(&f, peer, &con_get("temperature", 8, b"\xcd")).await;
            f.transport.clear().await;

            f.endpoint.resource_listener().on_changed("temperature").await;
            assert!(f.transport.sent().await.is_empty());
        });
    }

    #[test]
    fn test_failed_registration_does_not_observe() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);

            // no such resource: 4.04, and no subscription is established
            let mut request = con_get("temperature", 7, b"\xab");
            request.options.observe = Some(OBSERVE_REGISTER);
            inject(&f, peer, &request).await;

            let sent = sent_messages(&f.transport).await;
            assert_eq!(sent[0].code, Code::NOT_FOUND);
            assert_eq!(sent[0].options.observe, None);

            f.transport.clear().await;
            f.resources.set("temperature", repr(b"20.0", b"v1")).await;
            f.endpoint.resource_listener().on_changed("temperature").await;
            assert!(f.transport.sent().await.is_empty());
        });
    }

    #[test]
    fn test_outbound_ping_and_inbound_reset_complete_the_probe() {
        paused_rt().block_on(async {
            let f = fixture(ExchangeConfig::new()).await;
            let peer = peer_addr(1);
            let handler = RecordingHandler::new();

            f.endpoint.send_ping(peer, handler.clone()).await.unwrap();
            let ping = sent_messages(&f.transport).await.pop().unwrap();
            assert!(ping.code.is_empty());
            assert_eq!(ping.message_type, MessageType::Confirmable);

            inject(&f, peer, &Message::reset(ping.message_id)).await;

            assert_eq!(handler.hooks.lock().unwrap().as_slice(), &["reset".to_string()]);

            // the reliability layer is done with the exchange: no retransmissions
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_eq!(f.transport.sent().await.len(), 1);
        });
    }
}
