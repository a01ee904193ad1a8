// Client session — command round trips against one router
//
// A `ClientSession` owns the client entity (identity, session, timer), the
// cipher chain derived from its security config and a lazily (re)opened
// keep-alive link. Every call builds one request with the matching command,
// seals it into an envelope, and validates the response with the same
// command. A transport failure drops the link; the next call reconnects.

use crate::command::{
    Browse, Chat, CommandError, Download, Handshake, Join, Mute, Ping, PrivateMessage, Quit,
    Search, Share, Tunnel, Upload,
};
use crate::config::{ClientConfig, ConfigError};
use crate::crypto::{CipherChain, CipherError};
use crate::entity::{ClientComponent, Entity, SessionComponent, TimerComponent};
use crate::message::{Body, Data, FileEntry, Kind, MessageError, MessagePacker, SearchResult};
use crate::transport::{ConnectorConfig, RouterConnector, RouterLink, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Something another client sent, picked up by `ping`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Chat {
        client_id: String,
        name: String,
        text: String,
    },
    Message {
        client_id: String,
        text: String,
    },
    Tunnel {
        client_id: String,
        transfer_id: String,
        chunk_id: u64,
        chunk: Vec<u8>,
    },
}

impl Delivery {
    /// `None` for payload kinds that are never delivered.
    pub fn from_data(data: Data) -> Option<Self> {
        if !data.is_response() || !data.valid() {
            return None;
        }
        match data.body {
            Body::Chat(b) => Some(Delivery::Chat {
                client_id: b.client_id,
                name: b.name,
                text: b.text,
            }),
            Body::Message(b) => Some(Delivery::Message {
                client_id: b.client_id,
                text: b.text,
            }),
            Body::Tunnel(b) => Some(Delivery::Tunnel {
                client_id: b.client_id,
                transfer_id: b.transfer_id,
                chunk_id: b.chunk_id,
                chunk: b.chunk,
            }),
            _ => None,
        }
    }
}

pub struct ClientSession {
    entity: Arc<Entity>,
    config: ClientConfig,
    chain: Arc<CipherChain>,
    connector: RouterConnector,
    link: tokio::sync::Mutex<Option<RouterLink>>,
}

impl ClientSession {
    /// Validate the configuration, derive the cipher chain and open the
    /// first connection. No handshake yet.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_as(config, &Uuid::new_v4().simple().to_string()).await
    }

    /// Like `connect`, with a fixed client id.
    pub async fn connect_as(config: ClientConfig, client_id: &str) -> Result<Self, ClientError> {
        config.validate()?;
        let chain = Arc::new(CipherChain::from_config(&config.security)?);

        let entity = Entity::new();
        entity.add(ClientComponent::new(client_id, config.name.clone()));
        entity.add(SessionComponent::new(chain.clone()));
        entity.add(TimerComponent::default());

        let connector = RouterConnector::new(ConnectorConfig {
            address: config.router_address.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            retries: config.connect_retries,
            ..Default::default()
        });
        let link = connector.connect().await?;

        info!("Client {} connected to {}", client_id, config.router_address);
        Ok(Self {
            entity,
            config,
            chain,
            connector,
            link: tokio::sync::Mutex::new(Some(link)),
        })
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> String {
        self.entity
            .get::<ClientComponent>()
            .map(|client| client.client_id.clone())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<String> {
        self.entity
            .get::<SessionComponent>()
            .and_then(|session| session.id())
    }

    /// Time since the router last answered.
    pub fn idle(&self) -> Option<Duration> {
        self.entity
            .get::<TimerComponent>()
            .and_then(|timer| timer.elapsed())
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Open a session, or resume the current one. Returns the session id.
    pub async fn handshake(&self) -> Result<String, ClientError> {
        let command = Handshake::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request()?;
        let (response, _) = self.exchange(&request).await?;
        let session_id = command.validate(&request, &response)?;
        debug!("Handshake complete, session {}", session_id);
        Ok(session_id)
    }

    /// Join the group of the configured passphrase. `None` when no
    /// passphrase is configured.
    pub async fn join_configured(&self) -> Result<Option<u32>, ClientError> {
        match self.config.group_passphrase.clone() {
            Some(passphrase) => self.join_group(&passphrase).await.map(Some),
            None => Ok(None),
        }
    }

    /// Join the group derived from `passphrase`. Returns the member count.
    pub async fn join_group(&self, passphrase: &str) -> Result<u32, ClientError> {
        let command = Join::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request_passphrase(passphrase, &self.config.security)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn share(&self, files: Vec<FileEntry>) -> Result<u32, ClientError> {
        let command = Share::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(files)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<SearchResult>, ClientError> {
        let command = Search::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(keyword)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn browse(&self, client_id: &str, path: &str) -> Result<Vec<FileEntry>, ClientError> {
        let command = Browse::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(client_id, path)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn upload(
        &self,
        transfer_id: &str,
        chunk_id: u64,
        chunk: Vec<u8>,
    ) -> Result<(), ClientError> {
        let command = Upload::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(transfer_id, chunk_id, chunk)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn download(&self, transfer_id: &str, chunk_id: u64) -> Result<Vec<u8>, ClientError> {
        let command = Download::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(transfer_id, chunk_id)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn tunnel(
        &self,
        client_id: &str,
        transfer_id: &str,
        chunk_id: u64,
        chunk: Vec<u8>,
    ) -> Result<(), ClientError> {
        let command = Tunnel::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(client_id, transfer_id, chunk_id, chunk)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn chat(&self, text: &str) -> Result<(), ClientError> {
        let command = Chat::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(text)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn message(&self, client_id: &str, text: &str) -> Result<(), ClientError> {
        let command = PrivateMessage::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(client_id, text)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    pub async fn mute(&self, client_id: &str, mute: bool) -> Result<(), ClientError> {
        let command = Mute::with_limits(self.entity.clone(), self.config.limits);
        let request = command.request(client_id, mute)?;
        let (response, _) = self.exchange(&request).await?;
        Ok(command.validate(&request, &response)?)
    }

    /// Keep the session alive and collect queued deliveries.
    pub async fn ping(&self) -> Result<Vec<Delivery>, ClientError> {
        let command = Ping::new(self.entity.clone());
        let request = command.request()?;
        let (response, extra) = self.exchange(&request).await?;
        let pending = command.validate(&request, &response)?;

        if pending as usize != extra.len() {
            return Err(CommandError::Protocol(format!(
                "ping announced {} deliveries, got {}",
                pending,
                extra.len()
            ))
            .into());
        }
        Ok(extra.into_iter().filter_map(Delivery::from_data).collect())
    }

    /// End the session on the router and hang up.
    pub async fn quit(&self) -> Result<(), ClientError> {
        let command = Quit::new(self.entity.clone());
        let request = command.request()?;
        let (response, _) = self.exchange(&request).await?;
        command.validate(&request, &response)?;
        self.link.lock().await.take();
        info!("Session closed");
        Ok(())
    }

    /// Drop the connection without ending the session.
    pub async fn disconnect(&self) {
        self.link.lock().await.take();
    }

    // ========================================================================
    // EXCHANGE
    // ========================================================================

    /// Seal one request, send it, and open the response envelope. Returns
    /// the response to `request` plus any payloads batched behind it.
    async fn exchange(&self, request: &Data) -> Result<(Data, Vec<Data>), ClientError> {
        let session = self
            .entity
            .get::<SessionComponent>()
            .ok_or(MessageError::MissingSession)?;

        // The nonce is drawn under the link lock so send order matches nonce order
        let mut link = self.link.lock().await;
        let session_id = session.id();

        // A fresh handshake travels outside the nonce sequence
        let mut packer = if request.kind() == Kind::Handshake && session_id.is_none() {
            MessagePacker::with_nonce(0)
        } else {
            MessagePacker::create(&self.entity)?
        };
        packer.push(request.clone());
        let body = self.chain.encrypt(&packer.pack(0)?)?;

        if link.is_none() {
            debug!("Reconnecting to {}", self.config.router_address);
            *link = Some(self.connector.connect().await?);
        }
        let Some(active) = link.as_mut() else {
            return Err(TransportError::Closed.into());
        };

        let response = match active.exchange(body, session_id.as_deref()).await {
            Ok(response) => response,
            Err(e) => {
                *link = None;
                return Err(e.into());
            }
        };
        if !response.keep_alive() {
            *link = None;
        }
        drop(link);

        if !response.is_success() || response.body.is_empty() {
            return Err(CommandError::Rejected.into());
        }

        let plaintext = self.chain.decrypt(&response.body)?;
        let envelope = MessagePacker::unpack(&plaintext)?;
        if envelope.nonce() != packer.nonce() {
            return Err(CommandError::Protocol(format!(
                "response nonce {} does not answer request nonce {}",
                envelope.nonce(),
                packer.nonce()
            ))
            .into());
        }

        if let Some(timer) = self.entity.get::<TimerComponent>() {
            timer.touch();
        }

        let mut payloads = envelope.into_data().into_iter();
        let first = payloads.next().ok_or(MessageError::EmptyEnvelope)?;
        Ok((first, payloads.collect()))
    }
}
