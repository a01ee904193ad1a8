// Data — typed payloads carried inside an envelope
//
// Every payload has a kind, a role (request or response) and a schema
// version. Bodies are bincode-encoded field structs; decoding ignores
// trailing bytes, so a newer peer may append fields without breaking
// older readers.

use super::MessageError;
use serde::{Deserialize, Serialize};

/// Schema version written for every kind
pub const DATA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Handshake = 0x01,
    Join = 0x02,
    Share = 0x03,
    Search = 0x04,
    Browse = 0x05,
    Upload = 0x06,
    Download = 0x07,
    Tunnel = 0x08,
    Chat = 0x09,
    Message = 0x0A,
    Mute = 0x0B,
    Ping = 0x0C,
    Quit = 0x0D,
}

impl Kind {
    /// `None` for ids this build does not know about.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Kind::Handshake),
            0x02 => Some(Kind::Join),
            0x03 => Some(Kind::Share),
            0x04 => Some(Kind::Search),
            0x05 => Some(Kind::Browse),
            0x06 => Some(Kind::Upload),
            0x07 => Some(Kind::Download),
            0x08 => Some(Kind::Tunnel),
            0x09 => Some(Kind::Chat),
            0x0A => Some(Kind::Message),
            0x0B => Some(Kind::Mute),
            0x0C => Some(Kind::Ping),
            0x0D => Some(Kind::Quit),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kind::Handshake => "handshake",
            Kind::Join => "join",
            Kind::Share => "share",
            Kind::Search => "search",
            Kind::Browse => "browse",
            Kind::Upload => "upload",
            Kind::Download => "download",
            Kind::Tunnel => "tunnel",
            Kind::Chat => "chat",
            Kind::Message => "message",
            Kind::Mute => "mute",
            Kind::Ping => "ping",
            Kind::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Request = 0,
    Response = 1,
}

impl Role {
    pub fn from_u8(value: u8) -> Result<Self, MessageError> {
        match value {
            0 => Ok(Role::Request),
            1 => Ok(Role::Response),
            other => Err(MessageError::InvalidRole(other)),
        }
    }
}

// ============================================================================
// FIELD STRUCTS
// ============================================================================

/// A published file. Contents are opaque to the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// Request: `session_id` empty for a new session, or the session to resume.
/// Response: the (possibly new) session id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub client_id: String,
    pub name: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBody {
    pub group_id: String,
    /// Response only: members currently in the group
    pub members: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBody {
    pub files: Vec<FileEntry>,
    /// Response only
    pub accepted: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub client_id: String,
    pub name: String,
    pub file: FileEntry,
    /// Number of keyword tokens the file matched
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBody {
    pub search_id: String,
    pub keyword: String,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseBody {
    pub client_id: String,
    pub path: String,
    pub entries: Vec<FileEntry>,
}

/// Upload and download share one layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBody {
    pub transfer_id: String,
    pub chunk_id: u64,
    pub chunk: Vec<u8>,
}

/// `client_id` is the target on requests and the sender on deliveries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelBody {
    pub client_id: String,
    pub transfer_id: String,
    pub chunk_id: u64,
    pub chunk: Vec<u8>,
}

/// Group chat. Sender fields are filled in by the router on delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBody {
    pub client_id: String,
    pub name: String,
    pub text: String,
}

/// `client_id` is the target on requests and the sender on deliveries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub client_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteBody {
    pub client_id: String,
    pub mute: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    /// Response only: deliveries batched behind this response
    pub pending: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuitBody {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Handshake(HandshakeBody),
    Join(JoinBody),
    Share(ShareBody),
    Search(SearchBody),
    Browse(BrowseBody),
    Upload(TransferBody),
    Download(TransferBody),
    Tunnel(TunnelBody),
    Chat(ChatBody),
    Message(MessageBody),
    Mute(MuteBody),
    Ping(PingBody),
    Quit(QuitBody),
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Handshake(_) => Kind::Handshake,
            Body::Join(_) => Kind::Join,
            Body::Share(_) => Kind::Share,
            Body::Search(_) => Kind::Search,
            Body::Browse(_) => Kind::Browse,
            Body::Upload(_) => Kind::Upload,
            Body::Download(_) => Kind::Download,
            Body::Tunnel(_) => Kind::Tunnel,
            Body::Chat(_) => Kind::Chat,
            Body::Message(_) => Kind::Message,
            Body::Mute(_) => Kind::Mute,
            Body::Ping(_) => Kind::Ping,
            Body::Quit(_) => Kind::Quit,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = match self {
            Body::Handshake(body) => bincode::serialize(body),
            Body::Join(body) => bincode::serialize(body),
            Body::Share(body) => bincode::serialize(body),
            Body::Search(body) => bincode::serialize(body),
            Body::Browse(body) => bincode::serialize(body),
            Body::Upload(body) | Body::Download(body) => bincode::serialize(body),
            Body::Tunnel(body) => bincode::serialize(body),
            Body::Chat(body) => bincode::serialize(body),
            Body::Message(body) => bincode::serialize(body),
            Body::Mute(body) => bincode::serialize(body),
            Body::Ping(body) => bincode::serialize(body),
            Body::Quit(body) => bincode::serialize(body),
        };
        bytes.map_err(|e| MessageError::Body(e.to_string()))
    }

    pub fn decode(kind: Kind, bytes: &[u8]) -> Result<Self, MessageError> {
        fn de<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, MessageError> {
            bincode::deserialize(bytes).map_err(|e| MessageError::Body(e.to_string()))
        }

        Ok(match kind {
            Kind::Handshake => Body::Handshake(de(bytes)?),
            Kind::Join => Body::Join(de(bytes)?),
            Kind::Share => Body::Share(de(bytes)?),
            Kind::Search => Body::Search(de(bytes)?),
            Kind::Browse => Body::Browse(de(bytes)?),
            Kind::Upload => Body::Upload(de(bytes)?),
            Kind::Download => Body::Download(de(bytes)?),
            Kind::Tunnel => Body::Tunnel(de(bytes)?),
            Kind::Chat => Body::Chat(de(bytes)?),
            Kind::Message => Body::Message(de(bytes)?),
            Kind::Mute => Body::Mute(de(bytes)?),
            Kind::Ping => Body::Ping(de(bytes)?),
            Kind::Quit => Body::Quit(de(bytes)?),
        })
    }
}

/// One payload inside an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub role: Role,
    pub version: u8,
    pub body: Body,
}

impl Data {
    pub fn request(body: Body) -> Self {
        Self {
            role: Role::Request,
            version: DATA_VERSION,
            body,
        }
    }

    pub fn response(body: Body) -> Self {
        Self {
            role: Role::Response,
            version: DATA_VERSION,
            body,
        }
    }

    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    pub fn is_request(&self) -> bool {
        self.role == Role::Request
    }

    pub fn is_response(&self) -> bool {
        self.role == Role::Response
    }

    /// Mandatory fields for this kind and role are non-empty.
    pub fn valid(&self) -> bool {
        let request = self.is_request();
        match &self.body {
            Body::Handshake(b) => {
                if request {
                    !b.client_id.is_empty() && !b.name.is_empty()
                } else {
                    !b.session_id.is_empty()
                }
            }
            Body::Join(b) => !b.group_id.is_empty(),
            Body::Share(_) => true,
            Body::Search(b) => !b.search_id.is_empty() && (!request || !b.keyword.is_empty()),
            Body::Browse(b) => !b.client_id.is_empty(),
            Body::Upload(b) => !b.transfer_id.is_empty() && (!request || !b.chunk.is_empty()),
            Body::Download(b) => !b.transfer_id.is_empty() && (request || !b.chunk.is_empty()),
            Body::Tunnel(b) => {
                !b.client_id.is_empty()
                    && !b.transfer_id.is_empty()
                    && (!request || !b.chunk.is_empty())
            }
            Body::Chat(b) => !request || !b.text.is_empty(),
            Body::Message(b) => !b.client_id.is_empty() && (!request || !b.text.is_empty()),
            Body::Mute(b) => !b.client_id.is_empty(),
            Body::Ping(_) | Body::Quit(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_roundtrip() {
        for id in 0x01..=0x0D {
            let kind = Kind::from_u8(id).unwrap();
            assert_eq!(kind.as_u8(), id);
        }
        assert_eq!(Kind::from_u8(0x00), None);
        assert_eq!(Kind::from_u8(0x7F), None);
    }

    #[test]
    fn test_role_conversion() {
        assert_eq!(Role::from_u8(0).unwrap(), Role::Request);
        assert_eq!(Role::from_u8(1).unwrap(), Role::Response);
        assert!(Role::from_u8(2).is_err());
    }

    #[test]
    fn test_search_validity() {
        let mut body = SearchBody {
            search_id: "s1".to_string(),
            keyword: "movies".to_string(),
            results: vec![],
        };
        assert!(Data::request(Body::Search(body.clone())).valid());

        body.keyword.clear();
        assert!(!Data::request(Body::Search(body.clone())).valid());
        // Responses need only the search id
        assert!(Data::response(Body::Search(body.clone())).valid());

        body.search_id.clear();
        assert!(!Data::response(Body::Search(body)).valid());
    }

    #[test]
    fn test_download_validity_by_role() {
        let request = TransferBody {
            transfer_id: "t".to_string(),
            chunk_id: 0,
            chunk: vec![],
        };
        assert!(Data::request(Body::Download(request.clone())).valid());
        assert!(!Data::response(Body::Download(request)).valid());
    }

    #[test]
    fn test_handshake_validity_by_role() {
        let body = HandshakeBody {
            client_id: "c".to_string(),
            name: "alice".to_string(),
            session_id: String::new(),
        };
        assert!(Data::request(Body::Handshake(body.clone())).valid());
        assert!(!Data::response(Body::Handshake(body)).valid());
    }

    #[test]
    fn test_body_decode_ignores_trailing_fields() {
        let body = Body::Mute(MuteBody {
            client_id: "bob".to_string(),
            mute: true,
        });
        let mut bytes = body.encode().unwrap();
        // A newer schema appending a field
        bytes.extend_from_slice(&42u32.to_le_bytes());

        assert_eq!(Body::decode(Kind::Mute, &bytes).unwrap(), body);
    }

    #[test]
    fn test_body_decode_truncated() {
        let body = Body::Message(MessageBody {
            client_id: "bob".to_string(),
            text: "hello".to_string(),
        });
        let bytes = body.encode().unwrap();
        assert!(Body::decode(Kind::Message, &bytes[..bytes.len() - 2]).is_err());
    }
}
