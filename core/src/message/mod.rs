// Message module — payload types and the binary envelope

pub mod data;
pub mod packer;

pub use data::{
    Body, BrowseBody, ChatBody, Data, FileEntry, HandshakeBody, JoinBody, Kind, MessageBody,
    MuteBody, PingBody, QuitBody, Role, SearchBody, SearchResult, ShareBody, TransferBody,
    TunnelBody, DATA_VERSION,
};
pub use packer::MessagePacker;

use thiserror::Error;

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Maximum encoded envelope size: 8 MB
pub const MAX_ENVELOPE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Envelope carries no payloads")]
    EmptyEnvelope,
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("Envelope checksum mismatch")]
    ChecksumMismatch,
    #[error("Buffer too short: need {need}, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("Envelope too large: {0} bytes (max {MAX_ENVELOPE_SIZE})")]
    TooLarge(usize),
    #[error("Too many payloads: {0}")]
    TooManyPayloads(usize),
    #[error("{0} unexpected bytes after the last payload")]
    TrailingBytes(usize),
    #[error("Invalid role: {0}")]
    InvalidRole(u8),
    #[error("Body decode failed: {0}")]
    Body(String),
    #[error("Entity has no session")]
    MissingSession,
}
