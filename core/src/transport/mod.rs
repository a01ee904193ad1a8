// Transport module — HTTP-like framing over TCP, per-connection strands,
// process-wide throttling, the acceptor service and the client connector

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod http;
pub mod strand;
pub mod throttle;

pub use acceptor::{Acceptor, AcceptorOptions, AcceptorStats};
pub use client::{ConnectorConfig, RouterConnector, RouterLink};
pub use connection::{Connection, ConnectionState};
pub use http::{HttpRequest, HttpResponse};
pub use strand::Strand;
pub use throttle::{ByteCounter, Throttle};

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation timed out")]
    Timeout,
    #[error("Header block too large: {0} bytes")]
    HeaderTooLarge(usize),
    #[error("Body too large: {0} bytes")]
    BodyTooLarge(usize),
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Illegal connection transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Could not connect to {address} after {attempts} attempts")]
    ConnectFailed { address: String, attempts: u32 },
}

/// Application seam between the connection service and the router
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one framed request. An error answers `400 Bad Request` and
    /// closes the connection.
    async fn handle(
        &self,
        peer: SocketAddr,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError>;

    /// Called once after the connection reached `Closed`.
    async fn on_close(&self, _peer: SocketAddr) {}
}
