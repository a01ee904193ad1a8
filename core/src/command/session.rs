// Session commands — handshake, keep-alive ping and quit

use super::{check_request, response_for, CommandError};
use crate::config::Limits;
use crate::entity::{ClientComponent, Entity, SessionComponent, TimerComponent};
use crate::message::{Body, Data, HandshakeBody, PingBody, QuitBody};
use std::sync::Arc;

/// Open a session, or resume the one recorded in the entity's session.
pub struct Handshake {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Handshake {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self) -> Result<Data, CommandError> {
        let client = self
            .entity
            .get::<ClientComponent>()
            .ok_or(CommandError::MissingComponent("client"))?;
        let session = self
            .entity
            .get::<SessionComponent>()
            .ok_or(CommandError::MissingComponent("session"))?;

        let data = Data::request(Body::Handshake(HandshakeBody {
            client_id: client.client_id.clone(),
            name: client.name.clone(),
            session_id: session.id().unwrap_or_default(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    /// Record the session id the router assigned (or confirmed).
    pub fn validate(&self, request: &Data, response: &Data) -> Result<String, CommandError> {
        match response_for(request, response)? {
            Body::Handshake(body) => {
                if let Some(session) = self.entity.get::<SessionComponent>() {
                    session.set_id(body.session_id.clone());
                }
                Ok(body.session_id.clone())
            }
            other => Err(CommandError::Protocol(format!(
                "unexpected {} body",
                other.kind().name()
            ))),
        }
    }
}

/// Keep-alive. The response reports how many deliveries follow it.
pub struct Ping {
    entity: Arc<Entity>,
}

impl Ping {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self { entity }
    }

    pub fn request(&self) -> Result<Data, CommandError> {
        Ok(Data::request(Body::Ping(PingBody::default())))
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<u32, CommandError> {
        match response_for(request, response)? {
            Body::Ping(body) => {
                if let Some(timer) = self.entity.get::<TimerComponent>() {
                    timer.touch();
                }
                Ok(body.pending)
            }
            other => Err(CommandError::Protocol(format!(
                "unexpected {} body",
                other.kind().name()
            ))),
        }
    }
}

/// Close the session on the router.
pub struct Quit {
    entity: Arc<Entity>,
}

impl Quit {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self { entity }
    }

    pub fn request(&self) -> Result<Data, CommandError> {
        Ok(Data::request(Body::Quit(QuitBody {})))
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        response_for(request, response)?;
        if let Some(session) = self.entity.get::<SessionComponent>() {
            session.clear_id();
            session.nonce.set(0);
        }
        Ok(())
    }
}
