// Message packer — binary envelope of 1..N payloads bound to a nonce
//
// Format (little endian):
// [1 byte]  envelope version
// [8 bytes] nonce (u64)
// [2 bytes] payload count (u16, >= 1)
// repeated count times:
//   [1 byte]  kind id
//   [1 byte]  role (0 request, 1 response)
//   [1 byte]  data version
//   [4 bytes] body length (u32)
//   [N bytes] body
// [4 bytes] CRC32 over everything above

use super::data::{Body, Data, Kind, Role};
use super::{MessageError, ENVELOPE_VERSION, MAX_ENVELOPE_SIZE};
use crate::entity::{Entity, SessionComponent};
use crc32fast::Hasher;
use tracing::trace;

/// Envelope header: version + nonce + count
pub const HEADER_SIZE: usize = 1 + 8 + 2;

/// Per-payload header: kind + role + version + length
pub const PAYLOAD_HEADER_SIZE: usize = 1 + 1 + 1 + 4;

const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePacker {
    nonce: u64,
    data: Vec<Data>,
}

impl MessagePacker {
    /// Packer bound to the entity's session; draws the next nonce.
    pub fn create(entity: &Entity) -> Result<Self, MessageError> {
        let session = entity
            .get::<SessionComponent>()
            .ok_or(MessageError::MissingSession)?;
        Ok(Self::with_nonce(session.nonce.next()))
    }

    pub fn with_nonce(nonce: u64) -> Self {
        Self {
            nonce,
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, data: Data) -> &mut Self {
        self.data.push(data);
        self
    }

    pub fn extend(&mut self, data: impl IntoIterator<Item = Data>) -> &mut Self {
        self.data.extend(data);
        self
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn data(&self) -> &[Data] {
        &self.data
    }

    pub fn into_data(self) -> Vec<Data> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Non-empty and every payload valid.
    pub fn valid(&self) -> bool {
        !self.data.is_empty() && self.data.iter().all(Data::valid)
    }

    /// Serialize. `reserve_hint` only sizes the initial allocation.
    pub fn pack(&self, reserve_hint: usize) -> Result<Vec<u8>, MessageError> {
        if self.data.is_empty() {
            return Err(MessageError::EmptyEnvelope);
        }
        if self.data.len() > u16::MAX as usize {
            return Err(MessageError::TooManyPayloads(self.data.len()));
        }

        let mut buf = Vec::with_capacity(reserve_hint.max(HEADER_SIZE + CRC_SIZE));
        buf.push(ENVELOPE_VERSION);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());

        for data in &self.data {
            let body = data.body.encode()?;
            let body_len =
                u32::try_from(body.len()).map_err(|_| MessageError::TooLarge(body.len()))?;

            buf.push(data.kind().as_u8());
            buf.push(data.role as u8);
            buf.push(data.version);
            buf.extend_from_slice(&body_len.to_le_bytes());
            buf.extend_from_slice(&body);

            if buf.len() + CRC_SIZE > MAX_ENVELOPE_SIZE {
                return Err(MessageError::TooLarge(buf.len() + CRC_SIZE));
            }
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        trace!(
            "Packed envelope nonce={} payloads={} bytes={}",
            self.nonce,
            self.data.len(),
            buf.len()
        );
        Ok(buf)
    }

    /// Parse an envelope. Payloads of unknown kinds are skipped.
    pub fn unpack(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(MessageError::TooLarge(bytes.len()));
        }
        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(MessageError::Truncated {
                need: HEADER_SIZE + CRC_SIZE,
                got: bytes.len(),
            });
        }

        let (content, crc) = bytes.split_at(bytes.len() - CRC_SIZE);
        let received = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let mut hasher = Hasher::new();
        hasher.update(content);
        if hasher.finalize() != received {
            return Err(MessageError::ChecksumMismatch);
        }

        let mut reader = Reader::new(content);
        let version = reader.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let nonce = reader.u64()?;
        let count = reader.u16()? as usize;
        if count == 0 {
            return Err(MessageError::EmptyEnvelope);
        }

        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            let kind_id = reader.u8()?;
            let role = reader.u8()?;
            let version = reader.u8()?;
            let len = reader.u32()? as usize;
            let body = reader.take(len)?;

            let Some(kind) = Kind::from_u8(kind_id) else {
                trace!("Skipping payload of unknown kind 0x{:02x}", kind_id);
                continue;
            };

            data.push(Data {
                role: Role::from_u8(role)?,
                version,
                body: Body::decode(kind, body)?,
            });
        }

        if !reader.is_empty() {
            return Err(MessageError::TrailingBytes(reader.remaining()));
        }

        Ok(Self { nonce, data })
    }
}

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MessageError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MessageError::Truncated {
                need: self.offset.saturating_add(len),
                got: self.bytes.len(),
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, MessageError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, MessageError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, MessageError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
