// Group commands — join a group, mute a member

use super::{check_request, mismatch, response_for, CommandError};
use crate::config::{Limits, SecurityConfig};
use crate::crypto::kdf;
use crate::entity::{Entity, GroupComponent, MuteComponent};
use crate::message::{Body, Data, JoinBody, MuteBody};
use std::sync::Arc;

pub struct Join {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Join {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, group_id: &str) -> Result<Data, CommandError> {
        let data = Data::request(Body::Join(JoinBody {
            group_id: group_id.to_string(),
            members: 0,
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    /// Join the group named by a shared passphrase. Only its fingerprint
    /// leaves the client.
    pub fn request_passphrase(
        &self,
        passphrase: &str,
        security: &SecurityConfig,
    ) -> Result<Data, CommandError> {
        if passphrase.is_empty() {
            return Err(CommandError::Validation("group passphrase must not be empty".into()));
        }
        let group_id = kdf::group_id(passphrase, security.salt.as_bytes(), security.iterations)
            .map_err(|e| CommandError::Validation(e.to_string()))?;
        self.request(&group_id)
    }

    /// Returns the member count and records membership on the entity.
    pub fn validate(&self, request: &Data, response: &Data) -> Result<u32, CommandError> {
        let (Body::Join(sent), Body::Join(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("join response expected".into()));
        };

        if sent.group_id != received.group_id {
            return Err(mismatch("group_id", &sent.group_id, &received.group_id));
        }

        self.entity
            .add(GroupComponent::default())
            .set_id(received.group_id.clone());
        Ok(received.members)
    }
}

pub struct Mute {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Mute {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, client_id: &str, mute: bool) -> Result<Data, CommandError> {
        let data = Data::request(Body::Mute(MuteBody {
            client_id: client_id.to_string(),
            mute,
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        let (Body::Mute(sent), Body::Mute(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("mute response expected".into()));
        };

        if sent.client_id != received.client_id {
            return Err(mismatch("client_id", &sent.client_id, &received.client_id));
        }
        if sent.mute != received.mute {
            return Err(CommandError::Protocol("mute flag mismatch".into()));
        }

        self.entity
            .add(MuteComponent::default())
            .set(&received.client_id, received.mute);
        Ok(())
    }
}
