// Chat commands — group chat and private messages

use super::{check_request, mismatch, response_for, CommandError};
use crate::config::Limits;
use crate::entity::{ClientComponent, Entity, GroupComponent};
use crate::message::{Body, ChatBody, Data, MessageBody};
use std::sync::Arc;

/// Broadcast text to every member of the entity's group.
pub struct Chat {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Chat {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, text: &str) -> Result<Data, CommandError> {
        let joined = self
            .entity
            .get::<GroupComponent>()
            .and_then(|group| group.id())
            .is_some();
        if !joined {
            return Err(CommandError::MissingComponent("group"));
        }

        let data = Data::request(Body::Chat(ChatBody {
            client_id: String::new(),
            name: String::new(),
            text: text.to_string(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        response_for(request, response)?;
        Ok(())
    }
}

/// Send text to a single client.
pub struct PrivateMessage {
    entity: Arc<Entity>,
    limits: Limits,
}

impl PrivateMessage {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, client_id: &str, text: &str) -> Result<Data, CommandError> {
        if let Some(client) = self.entity.get::<ClientComponent>() {
            if client.client_id == client_id {
                return Err(CommandError::Validation("cannot message self".into()));
            }
        }

        let data = Data::request(Body::Message(MessageBody {
            client_id: client_id.to_string(),
            text: text.to_string(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<(), CommandError> {
        let (Body::Message(sent), Body::Message(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("message response expected".into()));
        };
        if sent.client_id != received.client_id {
            return Err(mismatch("client_id", &sent.client_id, &received.client_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Arc<Entity> {
        let entity = Entity::new();
        entity.add(GroupComponent::new("group-1"));
        entity
    }

    #[test]
    fn test_chat_boundary() {
        let chat = Chat::new(member());
        assert!(chat.request(&"a".repeat(1024)).is_ok());
        assert!(matches!(
            chat.request(&"a".repeat(1025)),
            Err(CommandError::Validation(_))
        ));
        assert!(chat.request("").is_err());
    }

    #[test]
    fn test_chat_requires_group() {
        let chat = Chat::new(Entity::new());
        assert_eq!(
            chat.request("hello").unwrap_err(),
            CommandError::MissingComponent("group")
        );
    }

    #[test]
    fn test_message_boundary() {
        let message = PrivateMessage::new(Entity::new());
        assert!(message.request("bob", &"m".repeat(4096)).is_ok());
        assert!(matches!(
            message.request("bob", &"m".repeat(4097)),
            Err(CommandError::Validation(_))
        ));
        assert!(message.request("", "hi").is_err());
    }

    #[test]
    fn test_message_self_rejected() {
        let entity = Entity::new();
        entity.add(ClientComponent::new("alice", "Alice"));
        let message = PrivateMessage::new(entity);
        assert!(message.request("alice", "hi").is_err());
    }

    #[test]
    fn test_message_validate_target() {
        let message = PrivateMessage::new(Entity::new());
        let request = message.request("bob", "hi").unwrap();

        let ok = Data::response(Body::Message(MessageBody {
            client_id: "bob".to_string(),
            text: String::new(),
        }));
        message.validate(&request, &ok).unwrap();

        let wrong = Data::response(Body::Message(MessageBody {
            client_id: "carol".to_string(),
            text: String::new(),
        }));
        assert!(message.validate(&request, &wrong).is_err());
    }
}
