//! End-to-end tests for the relay overlay
//!
//! These run real routers and clients over loopback TCP:
//! 1. Layered encryption and nonce sequencing seen from the router side
//! 2. Group search, browse, chat, mute and private messages
//! 3. Chunk upload/download and tunnelling
//! 4. Replay rejection and field size boundaries
//! 5. Session quit and resume
//!
//! Run with: cargo test --test integration_relay

use async_trait::async_trait;
use parking_lot::Mutex;
use shade_core::config::{LayerConfig, SecurityConfig};
use shade_core::message::{
    Body, ChatBody, Data, FileEntry, HandshakeBody, MessageBody, PingBody, SearchBody,
};
use shade_core::transport::{
    Acceptor, AcceptorOptions, ConnectionHandler, HttpRequest, HttpResponse, RouterLink, Throttle,
    TransportError,
};
use shade_core::{
    ClientConfig, ClientError, ClientSession, CommandError, CipherAlgorithm, CipherChain, Delivery,
    MessagePacker, Router, RouterConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

const GROUP: &str = "friday movie night";

fn security() -> SecurityConfig {
    SecurityConfig {
        layers: vec![
            LayerConfig::new("aes", "first layer secret", 32),
            LayerConfig::new("serpent", "second layer secret", 32),
        ],
        iterations: 1000,
        salt: "shade-integration".to_string(),
    }
}

fn router_config() -> RouterConfig {
    RouterConfig {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        worker_threads: 1,
        security: security(),
        ..Default::default()
    }
}

fn client_config(router: SocketAddr, name: &str) -> ClientConfig {
    ClientConfig {
        router_address: router.to_string(),
        name: name.to_string(),
        group_passphrase: Some(GROUP.to_string()),
        connect_timeout_secs: 2,
        read_timeout_secs: 5,
        connect_retries: 2,
        security: security(),
        ..Default::default()
    }
}

/// Connect, handshake and join the shared group.
async fn join(router: &Router, client_id: &str, name: &str) -> ClientSession {
    let session = ClientSession::connect_as(client_config(router.local_addr(), name), client_id)
        .await
        .unwrap();
    session.handshake().await.unwrap();
    session.join_configured().await.unwrap().unwrap();
    session
}

/// Seal `payloads` at `nonce` and post them on a fresh connection.
async fn post_raw(
    router: &Router,
    chain: &CipherChain,
    session: &str,
    nonce: u64,
    payloads: Vec<Data>,
) -> HttpResponse {
    let mut packer = MessagePacker::with_nonce(nonce);
    packer.extend(payloads);
    let body = chain.encrypt(&packer.pack(0).unwrap()).unwrap();
    post_sealed(router, session, body).await
}

async fn post_sealed(router: &Router, session: &str, body: Vec<u8>) -> HttpResponse {
    let stream = TcpStream::connect(router.local_addr()).await.unwrap();
    let mut link = RouterLink::new(stream, Duration::from_secs(5));
    link.exchange(body, Some(session)).await.unwrap()
}

fn search_request(keyword: &str) -> Data {
    Data::request(Body::Search(SearchBody {
        search_id: "raw-search".into(),
        keyword: keyword.to_string(),
        results: Vec::new(),
    }))
}

fn assert_rejected<T: std::fmt::Debug>(result: Result<T, ClientError>) {
    assert!(
        matches!(result, Err(ClientError::Command(CommandError::Validation(_)))),
        "expected a validation error, got {:?}",
        result
    );
}

// ============================================================================
// WIRE: what the router actually receives
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    nonce: u64,
    kind: &'static str,
    keyword: Option<String>,
}

/// Router stand-in that opens every envelope and echoes it back
struct Recorder {
    chain: CipherChain,
    seen: Mutex<Vec<Seen>>,
    wire: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn handle(
        &self,
        _peer: SocketAddr,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        self.wire.lock().push(request.body.clone());

        let plaintext = self
            .chain
            .decrypt(&request.body)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let envelope = MessagePacker::unpack(&plaintext)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let mut reply = MessagePacker::with_nonce(envelope.nonce());
        for data in envelope.data() {
            let keyword = match &data.body {
                Body::Search(b) => Some(b.keyword.clone()),
                _ => None,
            };
            self.seen.lock().push(Seen {
                nonce: envelope.nonce(),
                kind: data.kind().name(),
                keyword,
            });

            let body = match &data.body {
                Body::Handshake(b) => Body::Handshake(HandshakeBody {
                    session_id: "recorded-session".into(),
                    ..b.clone()
                }),
                other => other.clone(),
            };
            reply.push(Data::response(body));
        }

        let packed = reply
            .pack(0)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let sealed = self
            .chain
            .encrypt(&packed)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        Ok(HttpResponse::ok(sealed))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_movies_search_through_two_layer_chain() {
    let recorder = Arc::new(Recorder {
        chain: CipherChain::from_config(&security()).unwrap(),
        seen: Mutex::new(Vec::new()),
        wire: Mutex::new(Vec::new()),
    });
    let acceptor = Acceptor::open(
        "127.0.0.1:0".parse().unwrap(),
        recorder.clone(),
        Arc::new(Throttle::default()),
        AcceptorOptions::default(),
    )
    .await
    .unwrap();

    let mut config = client_config(acceptor.local_addr(), "Alice");
    config.group_passphrase = None;
    let client = ClientSession::connect_as(config, "alice").await.unwrap();
    assert_eq!(
        client.handshake().await.unwrap(),
        "recorded-session".to_string()
    );
    client.search("movies").await.unwrap();
    client.search("series").await.unwrap();

    let seen: Vec<Seen> = recorder
        .seen
        .lock()
        .iter()
        .filter(|seen| seen.kind != "handshake")
        .cloned()
        .collect();
    assert_eq!(
        seen,
        vec![
            Seen {
                nonce: 0,
                kind: "search",
                keyword: Some("movies".into()),
            },
            Seen {
                nonce: 1,
                kind: "search",
                keyword: Some("series".into()),
            },
        ]
    );

    // Nothing readable crossed the wire
    let wire = recorder.wire.lock();
    assert_eq!(wire.len(), 3);
    assert!(wire
        .iter()
        .all(|body| !body.windows(6).any(|window| window == b"movies")));

    // One layer alone does not open it
    let aes_only = CipherChain::new(vec![shade_core::crypto::create(
        "aes",
        &shade_core::crypto::derive_key("first layer secret", b"shade-integration", 1000, 32)
            .unwrap(),
    )
    .unwrap()])
    .unwrap();
    let partial = aes_only.decrypt(&wire[1]).unwrap_or_default();
    assert!(MessagePacker::unpack(&partial).is_err());

    drop(wire);
    client.disconnect().await;
    acceptor.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_router_chain_matches_configured_order() {
    let router = Router::start(router_config()).await.unwrap();
    assert_eq!(
        router.state().chain().algorithms(),
        vec![CipherAlgorithm::Aes, CipherAlgorithm::Serpent]
    );
    router.shutdown().await;
}

// ============================================================================
// GROUP FEATURES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_search_and_browse() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;

    let accepted = alice
        .share(vec![
            FileEntry::new("movies/Alien (1979).mkv", 700_000_000),
            FileEntry::new("movies/Aliens (1986).mkv", 800_000_000),
            FileEntry::new("docs/notes.txt", 1_024),
        ])
        .await
        .unwrap();
    assert_eq!(accepted, 3);

    let results = bob.search("alien 1979").await.unwrap();
    assert_eq!(results.len(), 2);
    // Both tokens match the first file; it ranks first
    assert_eq!(results[0].file.path, "movies/Alien (1979).mkv");
    assert_eq!(results[0].client_id, "alice");
    assert_eq!(results[0].name, "Alice");
    assert_eq!(results[0].weight, 2);

    // A quoted keyword needs every token
    let exact = bob.search("\"alien 1979\"").await.unwrap();
    assert_eq!(exact.len(), 1);

    // Own files never come back
    assert!(alice.search("alien").await.unwrap().is_empty());

    let listing = bob.browse("alice", "movies/").await.unwrap();
    assert_eq!(listing.len(), 2);
    assert!(listing.iter().all(|entry| entry.path.starts_with("movies/")));

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_browse_outside_group_rejected() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    alice
        .share(vec![FileEntry::new("secret.txt", 1)])
        .await
        .unwrap();

    let mut config = client_config(router.local_addr(), "Mallory");
    config.group_passphrase = Some("another group".into());
    let mallory = ClientSession::connect_as(config, "mallory").await.unwrap();
    mallory.handshake().await.unwrap();
    mallory.join_configured().await.unwrap();

    assert!(matches!(
        mallory.browse("alice", "").await,
        Err(ClientError::Command(CommandError::Rejected))
    ));
    assert!(mallory.search("secret").await.unwrap().is_empty());

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_reaches_group_except_muting_members() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;
    let carol = join(&router, "carol", "Carol").await;

    carol.mute("alice", true).await.unwrap();
    alice.chat("popcorn is ready").await.unwrap();

    assert_eq!(
        bob.ping().await.unwrap(),
        vec![Delivery::Chat {
            client_id: "alice".into(),
            name: "Alice".into(),
            text: "popcorn is ready".into(),
        }]
    );
    assert!(carol.ping().await.unwrap().is_empty());
    // The sender gets no copy
    assert!(alice.ping().await.unwrap().is_empty());
    // Deliveries are handed out once
    assert!(bob.ping().await.unwrap().is_empty());

    carol.mute("alice", false).await.unwrap();
    alice.chat("starting now").await.unwrap();
    assert_eq!(carol.ping().await.unwrap().len(), 1);

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_private_message_and_tunnel() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;

    alice.message("bob", "psst").await.unwrap();
    alice.tunnel("bob", "clip", 0, vec![1, 2, 3]).await.unwrap();

    let deliveries = bob.ping().await.unwrap();
    assert_eq!(
        deliveries,
        vec![
            Delivery::Message {
                client_id: "alice".into(),
                text: "psst".into(),
            },
            Delivery::Tunnel {
                client_id: "alice".into(),
                transfer_id: "clip".into(),
                chunk_id: 0,
                chunk: vec![1, 2, 3],
            },
        ]
    );

    assert!(matches!(
        alice.message("nobody", "hello?").await,
        Err(ClientError::Command(CommandError::Rejected))
    ));
    // Refused before it leaves the client
    assert_rejected(alice.message("alice", "me").await);
    // The rejected request dropped the link; the next call reconnects
    alice.message("bob", "still here").await.unwrap();

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_router_refuses_message_to_self() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let _bob = join(&router, "bob", "Bob").await;
    let chain = CipherChain::from_config(&security()).unwrap();
    let session = alice.session_id().unwrap();

    let message = |to: &str| {
        Data::request(Body::Message(MessageBody {
            client_id: to.into(),
            text: "me".into(),
        }))
    };
    let to_self = post_raw(&router, &chain, &session, 100, vec![message("alice")]).await;
    assert_eq!(to_self.status, 400);
    assert!(to_self.body.is_empty());
    assert!(alice.ping().await.unwrap().is_empty());

    // Nothing was queued and the nonce is still free
    let to_bob = post_raw(&router, &chain, &session, 100, vec![message("bob")]).await;
    assert!(to_bob.is_success());

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_then_download() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;

    let chunk: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    alice.upload("trailer", 0, chunk.clone()).await.unwrap();
    alice.upload("trailer", 1, vec![0xFF; 16]).await.unwrap();

    assert_eq!(bob.download("trailer", 0).await.unwrap(), chunk);
    assert_eq!(bob.download("trailer", 1).await.unwrap(), vec![0xFF; 16]);
    assert!(matches!(
        bob.download("trailer", 2).await,
        Err(ClientError::Command(CommandError::Rejected))
    ));

    // Another client may not write into alice's transfer, new chunk id or not
    for chunk_id in [1, 3] {
        assert!(matches!(
            bob.upload("trailer", chunk_id, vec![1]).await,
            Err(ClientError::Command(CommandError::Rejected))
        ));
    }
    assert_eq!(bob.download("trailer", 1).await.unwrap(), vec![0xFF; 16]);
    assert!(bob.download("trailer", 3).await.is_err());

    // Transfers go away with their owner
    alice.quit().await.unwrap();
    assert!(bob.download("trailer", 0).await.is_err());

    router.shutdown().await;
}

// ============================================================================
// REPLAY AND LIMITS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replayed_request_rejected_without_effect() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;
    let chain = CipherChain::from_config(&security()).unwrap();
    let session = alice.session_id().unwrap();

    let chat = Data::request(Body::Chat(ChatBody {
        text: "only once".into(),
        ..Default::default()
    }));
    let mut packer = MessagePacker::with_nonce(40);
    packer.push(chat);
    let sealed = chain.encrypt(&packer.pack(0).unwrap()).unwrap();

    let first = post_sealed(&router, &session, sealed.clone()).await;
    assert!(first.is_success());

    let rejected_before = router.stats().rejected;
    let replay = post_sealed(&router, &session, sealed).await;
    assert_eq!(replay.status, 400);
    assert!(replay.body.is_empty());
    assert_eq!(router.stats().rejected, rejected_before + 1);

    // An older nonce is just as stale
    let older = post_raw(
        &router,
        &chain,
        &session,
        39,
        vec![Data::request(Body::Ping(PingBody::default()))],
    )
    .await;
    assert_eq!(older.status, 400);

    // Bob saw the chat exactly once
    assert_eq!(bob.ping().await.unwrap().len(), 1);

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_keep_nonce_order() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = Arc::new(join(&router, "alice", "Alice").await);
    let rejected_before = router.stats().rejected;

    let mut calls = JoinSet::new();
    for _ in 0..8 {
        let alice = alice.clone();
        calls.spawn(async move {
            for _ in 0..5 {
                alice.ping().await.unwrap();
            }
        });
    }
    while let Some(result) = calls.join_next().await {
        result.unwrap();
    }
    let (first, second) = tokio::join!(alice.ping(), alice.ping());
    first.unwrap();
    second.unwrap();

    assert_eq!(router.stats().rejected, rejected_before);
    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_size_limits_at_boundaries_client_side() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let _bob = join(&router, "bob", "Bob").await;

    alice.search(&"k".repeat(128)).await.unwrap();
    assert_rejected(alice.search(&"k".repeat(129)).await);

    alice.chat(&"c".repeat(1024)).await.unwrap();
    assert_rejected(alice.chat(&"c".repeat(1025)).await);

    alice.message("bob", &"m".repeat(4096)).await.unwrap();
    assert_rejected(alice.message("bob", &"m".repeat(4097)).await);

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_size_limits_at_boundaries_router_side() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let _bob = join(&router, "bob", "Bob").await;
    let chain = CipherChain::from_config(&security()).unwrap();
    let session = alice.session_id().unwrap();

    let chat = |len: usize| {
        Data::request(Body::Chat(ChatBody {
            text: "c".repeat(len),
            ..Default::default()
        }))
    };
    let message = |len: usize| {
        Data::request(Body::Message(MessageBody {
            client_id: "bob".into(),
            text: "m".repeat(len),
        }))
    };

    let cases = [
        (search_request(&"k".repeat(128)), search_request(&"k".repeat(129))),
        (chat(1024), chat(1025)),
        (message(4096), message(4097)),
    ];

    let mut nonce = 100;
    for (fits, oversized) in cases {
        let response = post_raw(&router, &chain, &session, nonce, vec![oversized]).await;
        assert_eq!(response.status, 400);
        // The rejected nonce was not consumed
        let response = post_raw(&router, &chain, &session, nonce, vec![fits]).await;
        assert!(response.is_success());
        nonce += 1;
    }

    router.shutdown().await;
}

// ============================================================================
// SESSION LIFECYCLE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quit_then_new_session() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let first = alice.session_id().unwrap();
    assert_eq!(router.stats().active_sessions, 1);

    alice.quit().await.unwrap();
    assert_eq!(alice.session_id(), None);
    assert_eq!(router.stats().active_sessions, 0);
    assert_eq!(router.stats().sessions_closed, 1);

    // The old cookie is dead
    let chain = CipherChain::from_config(&security()).unwrap();
    let stale = post_raw(
        &router,
        &chain,
        &first,
        50,
        vec![Data::request(Body::Ping(PingBody::default()))],
    )
    .await;
    assert_eq!(stale.status, 400);

    let second = alice.handshake().await.unwrap();
    assert_ne!(first, second);
    alice.ping().await.unwrap();

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_after_reconnect_keeps_session() {
    let router = Router::start(router_config()).await.unwrap();
    let alice = join(&router, "alice", "Alice").await;
    let bob = join(&router, "bob", "Bob").await;
    let session = alice.session_id().unwrap();

    alice.ping().await.unwrap();
    alice.disconnect().await;
    bob.message("alice", "while you were away").await.unwrap();

    assert_eq!(alice.handshake().await.unwrap(), session);
    assert_eq!(router.stats().active_sessions, 2);
    assert_eq!(
        alice.ping().await.unwrap(),
        vec![Delivery::Message {
            client_id: "bob".into(),
            text: "while you were away".into(),
        }]
    );
    assert!(alice.idle().unwrap() < Duration::from_secs(5));

    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_chain_cannot_talk_to_router() {
    let router = Router::start(router_config()).await.unwrap();

    let mut config = client_config(router.local_addr(), "Eve");
    config.security.layers[1].passphrase = "guessed wrong".into();
    let eve = ClientSession::connect_as(config, "eve").await.unwrap();
    assert!(matches!(
        eve.handshake().await,
        Err(ClientError::Command(CommandError::Rejected))
    ));
    assert_eq!(router.stats().active_sessions, 0);
    assert!(router.stats().rejected >= 1);

    router.shutdown().await;
}
