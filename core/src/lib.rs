// Shade Core — layered-cipher relay overlay
//
// Clients wrap every request in an envelope bound to a session nonce,
// seal it with a chain of independent cipher layers and post it to a
// router over an HTTP-like keep-alive connection. The router peels the
// layers, checks the nonce, dispatches the payloads and answers in kind.

pub mod client;
pub mod command;
pub mod config;
pub mod crypto;
pub mod entity;
pub mod message;
pub mod router;
pub mod session;
pub mod transport;

pub use client::{ClientError, ClientSession, Delivery};
pub use command::CommandError;
pub use config::{ClientConfig, ConfigError, Limits, RouterConfig, SecurityConfig};
pub use crypto::{CipherAlgorithm, CipherChain, CipherError};
pub use entity::Entity;
pub use message::{Data, MessageError, MessagePacker};
pub use router::{Router, RouterError, RouterStats};
pub use session::ReplayError;
pub use transport::TransportError;

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Every error the library can produce
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Replay rejected: {0}")]
    Replay(#[from] ReplayError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Config(e) => Error::Config(e),
            ClientError::Cipher(e) => Error::Cipher(e),
            ClientError::Message(e) => Error::Message(e),
            ClientError::Command(e) => Error::Command(e),
            ClientError::Transport(e) => Error::Transport(e),
        }
    }
}

impl From<RouterError> for Error {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Config(e) => Error::Config(e),
            RouterError::Cipher(e) => Error::Cipher(e),
            RouterError::Message(e) => Error::Message(e),
            RouterError::Command(e) => Error::Command(e),
            RouterError::Replay(e) => Error::Replay(e),
            RouterError::Transport(e) => Error::Transport(e),
            RouterError::HandshakeRequired | RouterError::UnknownSession(_) => {
                Error::Command(CommandError::Rejected)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
