// Acceptor — TCP listener that hands each socket to a `Connection`
//
// The accept loop runs as one task. Every accepted socket gets its own
// connection task in a `JoinSet`. `close()` stops accepting, signals every
// connection through the shutdown channel and waits until all of them have
// reached `Closed`.

use super::connection::Connection;
use super::http::MAX_BODY_SIZE;
use super::throttle::Throttle;
use super::{ConnectionHandler, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Idle time allowed between requests on one connection
    pub read_timeout: Duration,
    /// Sockets above this many are closed on accept
    pub max_connections: usize,
    pub max_body: usize,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            max_connections: 256,
            max_body: MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    refused: AtomicU64,
    active: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    pub refused: u64,
    pub active: u64,
}

pub struct Acceptor {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Acceptor {
    /// Bind `endpoint` and start accepting.
    pub async fn open(
        endpoint: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        throttle: Arc<Throttle>,
        options: AcceptorOptions,
    ) -> Result<Self, TransportError> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(endpoint)?;
        let listener = socket.listen(BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            throttle,
            options,
            shutdown_rx,
            counters.clone(),
        ));

        info!("Acceptor listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
            counters,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> AcceptorStats {
        AcceptorStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
        }
    }

    pub fn is_open(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop accepting and wait for every connection to close. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Acceptor task failed: {}", e);
            }
            info!("Acceptor on {} closed", self.local_addr);
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    throttle: Arc<Throttle>,
    options: AcceptorOptions,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    let mut connections = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };

                if connections.len() >= options.max_connections {
                    counters.refused.fetch_add(1, Ordering::Relaxed);
                    warn!("Refusing {}: {} connections open", peer, connections.len());
                    drop(stream);
                    continue;
                }

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer, e);
                }

                next_id += 1;
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                counters.active.fetch_add(1, Ordering::Relaxed);
                debug!("Accepted connection {} from {}", next_id, peer);

                let connection = Arc::new(Connection::new(next_id, peer));
                let handler = handler.clone();
                let throttle = throttle.clone();
                let shutdown = shutdown.clone();
                let counters = counters.clone();
                let options = options.clone();
                connections.spawn(async move {
                    connection
                        .serve(
                            stream,
                            handler,
                            throttle,
                            options.read_timeout,
                            options.max_body,
                            shutdown,
                        )
                        .await;
                    counters.active.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }

    drop(listener);
    debug!("Waiting for {} connections to close", connections.len());
    while connections.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::http::{HttpRequest, HttpResponse};
    use async_trait::async_trait;
    use tokio::io::BufReader;
    use tokio::net::TcpStream;

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(
            &self,
            _peer: SocketAddr,
            request: HttpRequest,
        ) -> Result<HttpResponse, TransportError> {
            if request.body.is_empty() {
                return Err(TransportError::Rejected("empty".into()));
            }
            Ok(HttpResponse::ok(request.body))
        }
    }

    async fn open(options: AcceptorOptions) -> Acceptor {
        Acceptor::open(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Echo),
            Arc::new(Throttle::default()),
            options,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_response_keep_alive() {
        let acceptor = open(AcceptorOptions::default()).await;
        let stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        for body in [b"one".to_vec(), b"two".to_vec()] {
            HttpRequest::post("/", body.clone())
                .write_to(&mut write_half)
                .await
                .unwrap();
            let (response, _) = HttpResponse::read_from(&mut reader, MAX_BODY_SIZE)
                .await
                .unwrap();
            assert!(response.is_success());
            assert_eq!(response.body, body);
        }

        assert_eq!(acceptor.stats().accepted, 1);
        acceptor.close().await;
        assert!(!acceptor.is_open());
        assert_eq!(acceptor.stats().active, 0);
    }

    #[tokio::test]
    async fn test_rejected_request_gets_400_and_close() {
        let acceptor = open(AcceptorOptions::default()).await;
        let stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        HttpRequest::post("/", Vec::new())
            .write_to(&mut write_half)
            .await
            .unwrap();
        let (response, _) = HttpResponse::read_from(&mut reader, MAX_BODY_SIZE)
            .await
            .unwrap();
        assert_eq!(response.status, 400);
        assert!(response.body.is_empty());
        assert!(!response.keep_alive());

        // The server side hangs up afterwards
        let next = HttpResponse::read_from(&mut reader, MAX_BODY_SIZE).await;
        assert!(next.is_err());

        acceptor.close().await;
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let acceptor = open(AcceptorOptions {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let mut reader = BufReader::new(stream);

        let closed = tokio::time::timeout(
            Duration::from_secs(2),
            HttpResponse::read_from(&mut reader, MAX_BODY_SIZE),
        )
        .await
        .unwrap();
        assert!(matches!(closed, Err(TransportError::Closed)));
        acceptor.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let acceptor = open(AcceptorOptions::default()).await;
        acceptor.close().await;
        acceptor.close().await;
        assert!(!acceptor.is_open());
    }
}
