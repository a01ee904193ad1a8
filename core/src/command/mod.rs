// Command layer — typed requests and response validation
//
// Each command is a small struct bound to the issuing entity. `request()`
// builds a Data payload after enforcing field limits; `validate()` checks
// that a router response matches the request (same kind, same ids) and
// applies its effect to the entity.
//
// The router runs the same `check_request()` on every inbound payload, so
// both ends agree on what is oversized.

pub mod chat;
pub mod group;
pub mod search;
pub mod session;
pub mod transfer;

pub use chat::{Chat, PrivateMessage};
pub use group::{Join, Mute};
pub use search::{Browse, Search, Share};
pub use session::{Handshake, Ping, Quit};
pub use transfer::{Download, Tunnel, Upload};

use crate::config::Limits;
use crate::message::{Body, Data, MessageError};
use thiserror::Error;

/// Maximum number of files a client may publish
pub const MAX_SHARED_FILES: usize = 10_000;

/// Maximum length of a shared path or browse prefix
pub const MAX_PATH_SIZE: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Request rejected by router")]
    Rejected,
    #[error("Entity is missing its {0} component")]
    MissingComponent(&'static str),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

/// Mandatory text field: non-empty and at most `max` bytes.
pub(crate) fn require(field: &str, value: &str, max: usize) -> Result<(), CommandError> {
    if value.is_empty() {
        return Err(CommandError::Validation(format!("{} must not be empty", field)));
    }
    limit(field, value.len(), max)
}

/// Size ceiling for an optional field.
pub(crate) fn limit(field: &str, len: usize, max: usize) -> Result<(), CommandError> {
    if len > max {
        return Err(CommandError::Validation(format!(
            "{} too large: {} bytes (max {})",
            field, len, max
        )));
    }
    Ok(())
}

/// Enforce size limits and mandatory fields on an inbound or outbound request.
pub fn check_request(data: &Data, limits: &Limits) -> Result<(), CommandError> {
    if !data.is_request() {
        return Err(CommandError::Validation(format!(
            "{} payload is not a request",
            data.kind().name()
        )));
    }

    match &data.body {
        Body::Handshake(b) => {
            require("client_id", &b.client_id, limits.name)?;
            require("name", &b.name, limits.name)?;
            limit("session_id", b.session_id.len(), limits.name)?;
        }
        Body::Join(b) => require("group_id", &b.group_id, limits.name)?,
        Body::Share(b) => {
            limit("files", b.files.len(), MAX_SHARED_FILES)?;
            for file in &b.files {
                require("path", &file.path, MAX_PATH_SIZE)?;
            }
        }
        Body::Search(b) => {
            require("search_id", &b.search_id, limits.name)?;
            require("keyword", &b.keyword, limits.keyword)?;
        }
        Body::Browse(b) => {
            require("client_id", &b.client_id, limits.name)?;
            limit("path", b.path.len(), MAX_PATH_SIZE)?;
        }
        Body::Upload(b) => {
            require("transfer_id", &b.transfer_id, limits.name)?;
            if b.chunk.is_empty() {
                return Err(CommandError::Validation("chunk must not be empty".into()));
            }
            limit("chunk", b.chunk.len(), limits.chunk)?;
        }
        Body::Download(b) => require("transfer_id", &b.transfer_id, limits.name)?,
        Body::Tunnel(b) => {
            require("client_id", &b.client_id, limits.name)?;
            require("transfer_id", &b.transfer_id, limits.name)?;
            if b.chunk.is_empty() {
                return Err(CommandError::Validation("chunk must not be empty".into()));
            }
            limit("chunk", b.chunk.len(), limits.chunk)?;
        }
        Body::Chat(b) => require("text", &b.text, limits.chat)?,
        Body::Message(b) => {
            require("client_id", &b.client_id, limits.name)?;
            require("text", &b.text, limits.message)?;
        }
        Body::Mute(b) => require("client_id", &b.client_id, limits.name)?,
        Body::Ping(_) | Body::Quit(_) => {}
    }

    Ok(())
}

/// Match a response against its request: response role, same kind, valid.
pub(crate) fn response_for<'a>(
    request: &Data,
    response: &'a Data,
) -> Result<&'a Body, CommandError> {
    if !response.is_response() {
        return Err(CommandError::Protocol(format!(
            "expected {} response, got a request",
            request.kind().name()
        )));
    }
    if response.kind() != request.kind() {
        return Err(CommandError::Protocol(format!(
            "expected {} response, got {}",
            request.kind().name(),
            response.kind().name()
        )));
    }
    if !response.valid() {
        return Err(CommandError::Protocol(format!(
            "{} response is missing mandatory fields",
            response.kind().name()
        )));
    }
    Ok(&response.body)
}

/// Mismatched echo field in a response
pub(crate) fn mismatch(field: &str, expected: &str, actual: &str) -> CommandError {
    CommandError::Protocol(format!(
        "{} mismatch: expected {:?}, got {:?}",
        field, expected, actual
    ))
}
