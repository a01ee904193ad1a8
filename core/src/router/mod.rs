//! Router: accepts client connections, peels its cipher layers off each
//! envelope, enforces session nonces and dispatches payloads.
//!
//! Request pipeline, all of which must pass before any state changes:
//! decrypt → unpack → per-payload validity and size limits → session lookup
//! (or handshake) → dispatch preconditions → replay guard. The payloads are
//! applied while the replay guard is held and the nonce is only recorded
//! once they all succeed. The response envelope echoes the request nonce and
//! is encrypted with the same chain.

pub mod dispatch;
pub mod state;

pub use dispatch::{MAX_DELIVERIES_PER_POLL, MAX_SEARCH_RESULTS};
pub use state::{RouterState, RouterStats, MAX_TRANSFER_BYTES};

use crate::command::{check_request, CommandError};
use crate::config::{ConfigError, RouterConfig};
use crate::crypto::{CipherChain, CipherError};
use crate::entity::{SessionComponent, TimerComponent};
use crate::message::{Body, Data, HandshakeBody, Kind, MessageError, MessagePacker};
use crate::session::ReplayError;
use crate::transport::{
    Acceptor, AcceptorOptions, ConnectionHandler, HttpRequest, HttpResponse, Throttle,
    TransportError,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Smallest interval between idle-session sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Replay rejected: {0}")]
    Replay(#[from] ReplayError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No session cookie; handshake first")]
    HandshakeRequired,
    #[error("Unknown session {0}")]
    UnknownSession(String),
}

// ============================================================================
// REQUEST HANDLER
// ============================================================================

/// Turns one framed request into one framed response
pub struct RouterHandler {
    state: Arc<RouterState>,
}

impl RouterHandler {
    pub fn new(state: Arc<RouterState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    /// Process one request body. An error leaves router state unchanged.
    pub fn process(&self, request: &HttpRequest) -> Result<HttpResponse, RouterError> {
        let plaintext = self.state.chain().decrypt(&request.body)?;
        let envelope = MessagePacker::unpack(&plaintext)?;
        if envelope.is_empty() {
            return Err(MessageError::EmptyEnvelope.into());
        }

        let limits = self.state.limits();
        let last = envelope.len() - 1;
        for (index, data) in envelope.data().iter().enumerate() {
            if !data.valid() {
                return Err(CommandError::Validation(format!(
                    "{} payload is missing mandatory fields",
                    data.kind().name()
                ))
                .into());
            }
            check_request(data, limits)?;
            if data.kind() == Kind::Quit && index != last {
                return Err(CommandError::Validation("quit must be the last payload".into()).into());
            }
        }

        if envelope.data()[0].kind() == Kind::Handshake {
            if envelope.len() != 1 {
                return Err(
                    CommandError::Validation("handshake must travel alone".into()).into(),
                );
            }
            return self.handshake(envelope);
        }

        let session_id = request.session().ok_or(RouterError::HandshakeRequired)?;
        let session = self
            .state
            .session(session_id)
            .ok_or_else(|| RouterError::UnknownSession(session_id.to_string()))?;

        for data in envelope.data() {
            dispatch::check(&self.state, &session, data)?;
        }
        dispatch::check_uploads(&self.state, session_id, envelope.data())?;

        let component = session
            .get::<SessionComponent>()
            .ok_or(CommandError::MissingComponent("session"))?;
        let nonce = envelope.nonce();
        let quit = envelope.data().iter().any(|data| data.kind() == Kind::Quit);
        let responses = component.replay.accept_with(nonce, || {
            dispatch::apply_envelope(&self.state, session_id, &session, envelope.into_data())
                .map_err(RouterError::from)
        })?;
        if !quit {
            if let Some(timer) = session.get::<TimerComponent>() {
                timer.touch();
            }
        }

        debug!(
            "Session {} nonce {} answered with {} payloads",
            session_id,
            nonce,
            responses.len()
        );
        self.respond(nonce, responses, session_id, quit)
    }

    /// Open a new session, or resume the one named in the request.
    fn handshake(&self, envelope: MessagePacker) -> Result<HttpResponse, RouterError> {
        let nonce = envelope.nonce();
        let Some(Data {
            body: Body::Handshake(body),
            ..
        }) = envelope.into_data().into_iter().next()
        else {
            return Err(CommandError::Protocol("handshake payload expected".into()).into());
        };

        let (session_id, session) = match self.state.resume(&body.session_id, &body.client_id) {
            Some(session) => {
                // The resume nonce becomes the new high-water mark, so
                // anything sent before the resume is now stale.
                let component = session
                    .get::<SessionComponent>()
                    .ok_or(CommandError::MissingComponent("session"))?;
                component.replay.accept(nonce)?;
                info!("Resumed session {} at nonce {}", body.session_id, nonce);
                (body.session_id.clone(), session)
            }
            None => {
                if !body.session_id.is_empty() {
                    debug!("Session {} not resumable, opening a new one", body.session_id);
                }
                self.state.open_session(&body.client_id, &body.name)
            }
        };
        if let Some(timer) = session.get::<TimerComponent>() {
            timer.touch();
        }

        let response = Data::response(Body::Handshake(HandshakeBody {
            client_id: body.client_id,
            name: body.name,
            session_id: session_id.clone(),
        }));
        self.respond(nonce, vec![response], &session_id, false)
    }

    fn respond(
        &self,
        nonce: u64,
        payloads: Vec<Data>,
        session_id: &str,
        close: bool,
    ) -> Result<HttpResponse, RouterError> {
        let mut packer = MessagePacker::with_nonce(nonce);
        packer.extend(payloads);
        let body = self.state.chain().encrypt(&packer.pack(0)?)?;

        let mut response = HttpResponse::ok(body);
        response.set_session(session_id);
        if close {
            response.close_connection();
        }
        Ok(response)
    }
}

#[async_trait]
impl ConnectionHandler for RouterHandler {
    async fn handle(
        &self,
        peer: SocketAddr,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        self.state.record_request();
        self.process(&request).map_err(|e| {
            self.state.record_rejected();
            warn!("Rejected request from {}: {}", peer, e);
            TransportError::Rejected(e.to_string())
        })
    }

    async fn on_close(&self, peer: SocketAddr) {
        debug!("Connection from {} closed", peer);
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// A running router. Sessions outlive connections until they quit or idle out.
pub struct Router {
    state: Arc<RouterState>,
    throttle: Arc<Throttle>,
    acceptor: Acceptor,
    sweeper: JoinHandle<()>,
}

impl Router {
    /// Validate the configuration, derive the cipher chain and start
    /// accepting connections. Must run inside a Tokio runtime.
    pub async fn start(config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        let chain = Arc::new(CipherChain::from_config(&config.security)?);
        let state = Arc::new(RouterState::new(chain, config.limits));

        let throttle = Arc::new(Throttle::new(
            config.throttle.read_bytes_per_sec,
            config.throttle.write_bytes_per_sec,
        ));
        throttle.start();

        let handler = Arc::new(RouterHandler::new(state.clone()));
        let options = AcceptorOptions {
            read_timeout: config.read_timeout(),
            max_connections: config.max_connections,
            ..Default::default()
        };
        let acceptor = match Acceptor::open(endpoint, handler, throttle.clone(), options).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                throttle.stop();
                return Err(e.into());
            }
        };

        let sweeper = spawn_sweeper(Arc::downgrade(&state), config.session_timeout());

        info!(
            "Router listening on {} with {} cipher layers",
            acceptor.local_addr(),
            state.chain().len()
        );
        Ok(Self {
            state,
            throttle,
            acceptor,
            sweeper,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    pub fn stats(&self) -> RouterStats {
        let acceptor = self.acceptor.stats();
        RouterStats {
            connections_accepted: acceptor.accepted,
            connections_active: acceptor.active,
            bytes_read: self.throttle.read.total(),
            bytes_written: self.throttle.write.total(),
            ..self.state.stats()
        }
    }

    /// Close the acceptor and wait for every connection, then stop the
    /// throttle. Call before shutting the runtime down.
    pub async fn shutdown(self) {
        self.sweeper.abort();
        self.acceptor.close().await;
        self.throttle.stop();
        info!("Router stopped ({} sessions dropped)", self.state.session_count());
    }
}

fn spawn_sweeper(state: std::sync::Weak<RouterState>, timeout: Duration) -> JoinHandle<()> {
    let period = std::cmp::max(timeout / 4, MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            state.sweep_idle(timeout);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::entity::MailboxComponent;
    use crate::message::{MessageBody, PingBody, SearchBody, TransferBody};

    fn handler() -> RouterHandler {
        RouterHandler::new(Arc::new(RouterState::new(
            Arc::new(CipherChain::identity()),
            Limits::default(),
        )))
    }

    fn post(nonce: u64, payloads: Vec<Data>, session: Option<&str>) -> HttpRequest {
        let mut packer = MessagePacker::with_nonce(nonce);
        packer.extend(payloads);
        let mut request = HttpRequest::post("/", packer.pack(0).unwrap());
        if let Some(session) = session {
            request.set_session(session);
        }
        request
    }

    fn hello(client_id: &str) -> Data {
        Data::request(Body::Handshake(HandshakeBody {
            client_id: client_id.into(),
            name: "Alice".into(),
            session_id: String::new(),
        }))
    }

    fn ping() -> Data {
        Data::request(Body::Ping(PingBody::default()))
    }

    fn open(handler: &RouterHandler) -> String {
        let response = handler.process(&post(0, vec![hello("alice")], None)).unwrap();
        response.session().unwrap().to_string()
    }

    #[test]
    fn test_handshake_sets_cookie() {
        let handler = handler();
        let session = open(&handler);
        assert!(!session.is_empty());
        assert_eq!(handler.state().session_count(), 1);
    }

    #[test]
    fn test_requests_need_a_session() {
        let handler = handler();
        assert!(matches!(
            handler.process(&post(0, vec![ping()], None)),
            Err(RouterError::HandshakeRequired)
        ));
        assert!(matches!(
            handler.process(&post(0, vec![ping()], Some("nope"))),
            Err(RouterError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_replay_rejected_without_mutation() {
        let handler = handler();
        let session = open(&handler);

        handler.process(&post(0, vec![ping()], Some(&session))).unwrap();
        handler.process(&post(1, vec![ping()], Some(&session))).unwrap();
        assert!(matches!(
            handler.process(&post(1, vec![ping()], Some(&session))),
            Err(RouterError::Replay(_))
        ));

        let entity = handler.state().session(&session).unwrap();
        let component = entity.get::<SessionComponent>().unwrap();
        assert_eq!(component.replay.last_accepted(), Some(1));
    }

    #[test]
    fn test_invalid_payload_does_not_consume_nonce() {
        let handler = handler();
        let session = open(&handler);
        let oversized = Data::request(Body::Search(SearchBody {
            search_id: "s".into(),
            keyword: "k".repeat(129),
            results: Vec::new(),
        }));

        assert!(handler.process(&post(5, vec![oversized], Some(&session))).is_err());
        // Nonce 5 is still available
        handler.process(&post(5, vec![ping()], Some(&session))).unwrap();
    }

    #[test]
    fn test_rejected_upload_keeps_mailbox_and_nonce() {
        let handler = handler();
        let session = open(&handler);
        let state = handler.state();
        let (bob_id, _) = state.open_session("bob", "Bob");
        state.store_chunk(&bob_id, "t1", 0, vec![1, 2, 3]).unwrap();

        let alice = state.session(&session).unwrap();
        let mailbox = alice.get::<MailboxComponent>().unwrap();
        state.deliver(
            &alice,
            Data::response(Body::Message(MessageBody {
                client_id: "bob".into(),
                text: "hi".into(),
            })),
        );

        let upload = |chunk_id: u64| {
            Data::request(Body::Upload(TransferBody {
                transfer_id: "t1".into(),
                chunk_id,
                chunk: vec![9],
            }))
        };
        for chunk_id in [0, 5] {
            assert!(handler
                .process(&post(0, vec![ping(), upload(chunk_id)], Some(&session)))
                .is_err());
        }
        assert_eq!(mailbox.len(), 1);
        assert_eq!(state.fetch_chunk("t1", 0), Some(vec![1, 2, 3]));
        assert!(!state.has_chunk("t1", 5));
        let component = alice.get::<SessionComponent>().unwrap();
        assert_eq!(component.replay.last_accepted(), None);

        // Same nonce, now without the foreign upload
        let response = handler.process(&post(0, vec![ping()], Some(&session))).unwrap();
        let envelope = MessagePacker::unpack(&response.body).unwrap();
        assert_eq!(envelope.len(), 2);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_uploads_checked_against_cap_as_a_whole() {
        let handler = handler();
        let session = open(&handler);
        let state = handler.state();
        let (bob_id, _) = state.open_session("bob", "Bob");
        state
            .store_chunk(&bob_id, "big", 0, vec![0; MAX_TRANSFER_BYTES - 8])
            .unwrap();

        let upload = |chunk_id: u64| {
            Data::request(Body::Upload(TransferBody {
                transfer_id: "t2".into(),
                chunk_id,
                chunk: vec![0; 6],
            }))
        };
        // Each chunk fits on its own, both together do not
        assert!(handler
            .process(&post(0, vec![upload(0), upload(1)], Some(&session)))
            .is_err());
        assert!(!state.has_chunk("t2", 0));
        assert_eq!(state.transfer_bytes(), MAX_TRANSFER_BYTES - 8);

        handler.process(&post(0, vec![upload(0)], Some(&session))).unwrap();
        assert!(state.has_chunk("t2", 0));
    }

    #[test]
    fn test_responses_follow_payload_order() {
        let handler = handler();
        let session = open(&handler);
        let join = Data::request(Body::Join(crate::message::JoinBody {
            group_id: "g1".into(),
            members: 0,
        }));
        let upload = Data::request(Body::Upload(TransferBody {
            transfer_id: "t1".into(),
            chunk_id: 0,
            chunk: vec![1],
        }));

        let response = handler
            .process(&post(0, vec![ping(), join, upload], Some(&session)))
            .unwrap();
        let envelope = MessagePacker::unpack(&response.body).unwrap();
        let kinds: Vec<Kind> = envelope.data().iter().map(Data::kind).collect();
        assert_eq!(kinds, vec![Kind::Ping, Kind::Join, Kind::Upload]);
    }

    #[test]
    fn test_handshake_must_travel_alone() {
        let handler = handler();
        assert!(handler
            .process(&post(0, vec![hello("alice"), ping()], None))
            .is_err());
        assert_eq!(handler.state().session_count(), 0);
    }

    #[test]
    fn test_resume_rejects_older_nonces() {
        let handler = handler();
        let session = open(&handler);
        handler.process(&post(0, vec![ping()], Some(&session))).unwrap();

        let resume = Data::request(Body::Handshake(HandshakeBody {
            client_id: "alice".into(),
            name: "Alice".into(),
            session_id: session.clone(),
        }));
        let response = handler.process(&post(4, vec![resume], Some(&session))).unwrap();
        assert_eq!(response.session(), Some(session.as_str()));

        // In flight before the resume
        assert!(handler.process(&post(3, vec![ping()], Some(&session))).is_err());
        handler.process(&post(5, vec![ping()], Some(&session))).unwrap();
    }

    #[test]
    fn test_quit_closes_session_and_connection() {
        let handler = handler();
        let session = open(&handler);
        let quit = Data::request(Body::Quit(crate::message::QuitBody {}));

        assert!(handler
            .process(&post(0, vec![quit.clone(), ping()], Some(&session)))
            .is_err());

        let response = handler.process(&post(0, vec![quit], Some(&session))).unwrap();
        assert!(!response.keep_alive());
        assert_eq!(handler.state().session_count(), 0);
    }

    #[test]
    fn test_garbage_body_rejected() {
        let handler = handler();
        let request = HttpRequest::post("/", vec![0xAB; 40]);
        assert!(handler.process(&request).is_err());
    }
}
