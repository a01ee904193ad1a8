// Connection — per-socket state machine and request/response loop
//
//   Connecting -> Handshaking -> Active -> Closing -> Closed
//
// Accepting the socket moves to Handshaking. The first request the handler
// accepts moves to Active. A rejected request, a framing error, an idle
// read timeout or acceptor shutdown moves to Closing; releasing the socket
// moves to Closed. Any other transition is refused.

use super::http::{HttpRequest, HttpResponse};
use super::strand::Strand;
use super::throttle::Throttle;
use super::{ConnectionHandler, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Handshaking)
                | (Connecting, Closing)
                | (Handshaking, Active)
                | (Handshaking, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// One accepted socket
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
    strand: Strand,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Connection {
    /// Must be called from within a Tokio runtime (the strand spawns).
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(ConnectionState::Connecting),
            strand: Strand::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn transition(&self, to: ConnectionState) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.can_transition(to) {
            return Err(TransportError::InvalidTransition { from: *state, to });
        }
        trace!("Connection {} {:?} -> {:?}", self.id, *state, to);
        *state = to;
        Ok(())
    }

    /// Move to Closing unless already closing or closed.
    fn begin_close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        *state = ConnectionState::Closing;
    }

    /// Serve requests until the peer leaves, a request is rejected, the
    /// connection idles past `read_timeout`, or `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        handler: Arc<dyn ConnectionHandler>,
        throttle: Arc<Throttle>,
        read_timeout: Duration,
        max_body: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.transition(ConnectionState::Handshaking) {
            warn!("Connection {}: {}", self.id, e);
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        loop {
            throttle.read.ready().await;

            let read = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Connection {} closing for shutdown", self.id);
                    break;
                }
                read = tokio::time::timeout(read_timeout, HttpRequest::read_from(&mut reader, max_body)) => read,
            };

            let request = match read {
                Err(_) => {
                    debug!("Connection {} idle for {:?}, closing", self.id, read_timeout);
                    break;
                }
                Ok(Ok(None)) => {
                    trace!("Connection {} closed by peer", self.id);
                    break;
                }
                Ok(Ok(Some((request, size)))) => {
                    throttle.read.record(size as u64);
                    self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
                    request
                }
                Ok(Err(e)) => {
                    warn!("Connection {} framing error: {}", self.id, e);
                    let _ = self.reject(&writer, &throttle).await;
                    break;
                }
            };

            let keep_alive = request.keep_alive();
            match self.dispatch(request, &handler, &writer, &throttle).await {
                Ok(response_keep_alive) => {
                    if self.state() == ConnectionState::Handshaking {
                        let _ = self.transition(ConnectionState::Active);
                    }
                    if !keep_alive || !response_keep_alive {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Connection {} request failed: {}", self.id, e);
                    break;
                }
            }
        }

        self.begin_close();
        self.strand.close();
        {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        }
        drop(reader);
        let _ = self.transition(ConnectionState::Closed);
        handler.on_close(self.peer).await;
        debug!(
            "Connection {} closed ({} B read, {} B written)",
            self.id,
            self.bytes_read(),
            self.bytes_written()
        );
    }

    /// Run the handler and write its response on this connection's strand.
    /// Returns whether the response keeps the connection open.
    async fn dispatch(
        self: &Arc<Self>,
        request: HttpRequest,
        handler: &Arc<dyn ConnectionHandler>,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        throttle: &Arc<Throttle>,
    ) -> Result<bool, TransportError> {
        let connection = self.clone();
        let handler = handler.clone();
        let writer = writer.clone();
        let throttle = throttle.clone();

        self.strand
            .run(async move {
                match handler.handle(connection.peer, request).await {
                    Ok(response) => {
                        connection.write(&writer, &throttle, &response).await?;
                        Ok(response.keep_alive())
                    }
                    Err(e) => {
                        warn!("Connection {} rejected request: {}", connection.id, e);
                        connection.begin_close();
                        connection.write(&writer, &throttle, &HttpResponse::bad_request()).await?;
                        Err(e)
                    }
                }
            })
            .await?
    }

    async fn reject(
        &self,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        throttle: &Arc<Throttle>,
    ) -> Result<(), TransportError> {
        self.begin_close();
        self.write(writer, throttle, &HttpResponse::bad_request()).await
    }

    async fn write(
        &self,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        throttle: &Arc<Throttle>,
        response: &HttpResponse,
    ) -> Result<(), TransportError> {
        throttle.write.ready().await;
        let mut writer = writer.lock().await;
        let written = response.write_to(&mut *writer).await?;
        throttle.write.record(written as u64);
        self.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }
}
