// Transfer commands — chunked upload, download and client-to-client tunnel
//
// Chunks are opaque byte blobs identified by (transfer_id, chunk_id).

use super::{check_request, mismatch, response_for, CommandError};
use crate::config::Limits;
use crate::entity::{ClientComponent, Entity, SessionComponent};
use crate::message::{Body, Data, TransferBody, TunnelBody};
use std::sync::Arc;
use uuid::Uuid;

/// Fresh transfer id for a new upload or tunnel stream.
pub fn new_transfer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Transfers only run inside an established session.
fn require_session(entity: &Entity) -> Result<(), CommandError> {
    entity
        .get::<SessionComponent>()
        .and_then(|session| session.id())
        .map(|_| ())
        .ok_or(CommandError::MissingComponent("session"))
}

fn check_ids(
    sent_transfer: &str,
    sent_chunk: u64,
    received_transfer: &str,
    received_chunk: u64,
) -> Result<(), CommandError> {
    if sent_transfer != received_transfer {
        return Err(mismatch("transfer_id", sent_transfer, received_transfer));
    }
    if sent_chunk != received_chunk {
        return Err(CommandError::Protocol(format!(
            "chunk_id mismatch: expected {}, got {}",
            sent_chunk, received_chunk
        )));
    }
    Ok(())
}

/// Store one chunk on the router.
pub struct Upload {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Upload {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(
        &self,
        transfer_id: &str,
        chunk_id: u64,
        chunk: Vec<u8>,
    ) -> Result<Data, CommandError> {
        require_session(&self.entity)?;
        let data = Data::request(Body::Upload(TransferBody {
            transfer_id: transfer_id.to_string(),
            chunk_id,
            chunk,
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        let (Body::Upload(sent), Body::Upload(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("upload response expected".into()));
        };
        check_ids(&sent.transfer_id, sent.chunk_id, &received.transfer_id, received.chunk_id)
    }
}

/// Fetch one chunk from the router.
pub struct Download {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Download {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, transfer_id: &str, chunk_id: u64) -> Result<Data, CommandError> {
        require_session(&self.entity)?;
        let data = Data::request(Body::Download(TransferBody {
            transfer_id: transfer_id.to_string(),
            chunk_id,
            chunk: Vec::new(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    /// Returns the chunk bytes.
    pub fn validate(&self, request: &Data, response: &Data) -> Result<Vec<u8>, CommandError> {
        let (Body::Download(sent), Body::Download(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("download response expected".into()));
        };
        check_ids(&sent.transfer_id, sent.chunk_id, &received.transfer_id, received.chunk_id)?;
        if received.chunk.len() > self.limits.chunk {
            return Err(CommandError::Protocol(format!(
                "chunk too large: {} bytes",
                received.chunk.len()
            )));
        }
        Ok(received.chunk.clone())
    }
}

/// Relay a chunk to another client through the router.
pub struct Tunnel {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Tunnel {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(
        &self,
        client_id: &str,
        transfer_id: &str,
        chunk_id: u64,
        chunk: Vec<u8>,
    ) -> Result<Data, CommandError> {
        require_session(&self.entity)?;
        if let Some(client) = self.entity.get::<ClientComponent>() {
            if client.client_id == client_id {
                return Err(CommandError::Validation("cannot tunnel to self".into()));
            }
        }

        let data = Data::request(Body::Tunnel(TunnelBody {
            client_id: client_id.to_string(),
            transfer_id: transfer_id.to_string(),
            chunk_id,
            chunk,
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        let (Body::Tunnel(sent), Body::Tunnel(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("tunnel response expected".into()));
        };
        if sent.client_id != received.client_id {
            return Err(mismatch("client_id", &sent.client_id, &received.client_id));
        }
        check_ids(&sent.transfer_id, sent.chunk_id, &received.transfer_id, received.chunk_id)
    }
}
