//! Wire format for write-path messages.
//!
//! - [`stream`] - Resumable field writer and reader
//! - [`encoding`] - Composite field encoding
//! - [`messages`] - Message shapes and their field layouts
//!
//! # Framing
//!
//! ```text
//! +------+-------------+----------+----------+-----+
//! | kind | field count | field 0  | field 1  | ... |
//! | u8   | u8          | cache id | partition|     |
//! +------+-------------+----------+----------+-----+
//! ```
//!
//! Messages are self-delimiting: the kind selects the field layout and every field
//! has a fixed or length-prefixed size. [`MessageEncoder`] and [`MessageDecoder`]
//! keep their position between calls, so a message may be produced into or
//! consumed from any number of partial buffers.

pub mod encoding;
pub mod messages;
pub mod stream;

use crate::core::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use messages::{
    BackupNearResponse, BackupUpdateRequest, CheckUpdateRequest, NearMappingResponse,
    NearUpdateRequest, UpdateResponse, WireMessage,
};
use stream::{MessageReader, MessageWriter};

/// Message kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    NearUpdateRequest = 1,
    BackupUpdateRequest = 2,
    UpdateResponse = 3,
    NearMappingResponse = 4,
    BackupNearResponse = 5,
    CheckUpdateRequest = 6,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::NearUpdateRequest),
            2 => Some(Self::BackupUpdateRequest),
            3 => Some(Self::UpdateResponse),
            4 => Some(Self::NearMappingResponse),
            5 => Some(Self::BackupNearResponse),
            6 => Some(Self::CheckUpdateRequest),
            _ => None,
        }
    }

    /// Get the kind name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NearUpdateRequest => "near_update_request",
            Self::BackupUpdateRequest => "backup_update_request",
            Self::UpdateResponse => "update_response",
            Self::NearMappingResponse => "near_mapping_response",
            Self::BackupNearResponse => "backup_near_response",
            Self::CheckUpdateRequest => "check_update_request",
        }
    }

    fn field_count(&self) -> u8 {
        match self {
            Self::NearUpdateRequest => NearUpdateRequest::FIELD_COUNT,
            Self::BackupUpdateRequest => BackupUpdateRequest::FIELD_COUNT,
            Self::UpdateResponse => UpdateResponse::FIELD_COUNT,
            Self::NearMappingResponse => NearMappingResponse::FIELD_COUNT,
            Self::BackupNearResponse => BackupNearResponse::FIELD_COUNT,
            Self::CheckUpdateRequest => CheckUpdateRequest::FIELD_COUNT,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Any write-path message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMessage {
    NearUpdateRequest(NearUpdateRequest),
    BackupUpdateRequest(BackupUpdateRequest),
    UpdateResponse(UpdateResponse),
    NearMappingResponse(NearMappingResponse),
    BackupNearResponse(BackupNearResponse),
    CheckUpdateRequest(CheckUpdateRequest),
}

impl CacheMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::NearUpdateRequest(_) => MessageKind::NearUpdateRequest,
            Self::BackupUpdateRequest(_) => MessageKind::BackupUpdateRequest,
            Self::UpdateResponse(_) => MessageKind::UpdateResponse,
            Self::NearMappingResponse(_) => MessageKind::NearMappingResponse,
            Self::BackupNearResponse(_) => MessageKind::BackupNearResponse,
            Self::CheckUpdateRequest(_) => MessageKind::CheckUpdateRequest,
        }
    }

    pub fn cache_id(&self) -> u32 {
        match self {
            Self::NearUpdateRequest(m) => m.cache_id,
            Self::BackupUpdateRequest(m) => m.cache_id,
            Self::UpdateResponse(m) => m.cache_id,
            Self::NearMappingResponse(m) => m.cache_id,
            Self::BackupNearResponse(m) => m.cache_id,
            Self::CheckUpdateRequest(m) => m.cache_id,
        }
    }

    pub fn partition(&self) -> u32 {
        match self {
            Self::NearUpdateRequest(m) => m.partition,
            Self::BackupUpdateRequest(m) => m.partition,
            Self::UpdateResponse(m) => m.partition,
            Self::NearMappingResponse(m) => m.partition,
            Self::BackupNearResponse(m) => m.partition,
            Self::CheckUpdateRequest(m) => m.partition,
        }
    }

    /// Future id the message refers to.
    pub fn future_id(&self) -> u64 {
        match self {
            Self::NearUpdateRequest(m) => m.future_id,
            Self::BackupUpdateRequest(m) => m.future_id,
            Self::UpdateResponse(m) => m.future_id,
            Self::NearMappingResponse(m) => m.future_id,
            Self::BackupNearResponse(m) => m.future_id,
            Self::CheckUpdateRequest(m) => m.future_id,
        }
    }
}

/// Incremental message encoder.
///
/// [`encode`](Self::encode) must be called with the same message until it returns
/// `true`.
#[derive(Debug, Default)]
pub struct MessageEncoder {
    writer: MessageWriter,
}

impl MessageEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write as much of `message` as `buf` accepts. Returns `true` once the whole
    /// message has been written; the encoder is then ready for the next message.
    pub fn encode<B: BufMut>(&mut self, message: &CacheMessage, buf: &mut B) -> bool {
        let done = match message {
            CacheMessage::NearUpdateRequest(m) => m.write_to(buf, &mut self.writer),
            CacheMessage::BackupUpdateRequest(m) => m.write_to(buf, &mut self.writer),
            CacheMessage::UpdateResponse(m) => m.write_to(buf, &mut self.writer),
            CacheMessage::NearMappingResponse(m) => m.write_to(buf, &mut self.writer),
            CacheMessage::BackupNearResponse(m) => m.write_to(buf, &mut self.writer),
            CacheMessage::CheckUpdateRequest(m) => m.write_to(buf, &mut self.writer),
        };
        if done {
            self.writer.reset();
        }
        done
    }

    /// Encode a whole message into a fresh buffer.
    pub fn encode_to_bytes(message: &CacheMessage) -> Bytes {
        let mut encoder = Self::new();
        let mut buf = BytesMut::new();
        // An unbounded buffer always takes the whole message.
        while !encoder.encode(message, &mut buf) {}
        buf.freeze()
    }
}

/// Message being decoded.
#[derive(Debug)]
enum Partial {
    NearUpdateRequest(NearUpdateRequest),
    BackupUpdateRequest(BackupUpdateRequest),
    UpdateResponse(UpdateResponse),
    NearMappingResponse(NearMappingResponse),
    BackupNearResponse(BackupNearResponse),
    CheckUpdateRequest(CheckUpdateRequest),
}

impl Partial {
    fn new(kind: MessageKind) -> Self {
        match kind {
            MessageKind::NearUpdateRequest => Self::NearUpdateRequest(Default::default()),
            MessageKind::BackupUpdateRequest => Self::BackupUpdateRequest(Default::default()),
            MessageKind::UpdateResponse => Self::UpdateResponse(Default::default()),
            MessageKind::NearMappingResponse => Self::NearMappingResponse(Default::default()),
            MessageKind::BackupNearResponse => Self::BackupNearResponse(Default::default()),
            MessageKind::CheckUpdateRequest => Self::CheckUpdateRequest(Default::default()),
        }
    }

    fn read(&mut self, buf: &mut BytesMut, reader: &mut MessageReader) -> Result<bool, WireError> {
        match self {
            Self::NearUpdateRequest(m) => m.read_from(buf, reader),
            Self::BackupUpdateRequest(m) => m.read_from(buf, reader),
            Self::UpdateResponse(m) => m.read_from(buf, reader),
            Self::NearMappingResponse(m) => m.read_from(buf, reader),
            Self::BackupNearResponse(m) => m.read_from(buf, reader),
            Self::CheckUpdateRequest(m) => m.read_from(buf, reader),
        }
    }

    fn finish(self) -> CacheMessage {
        match self {
            Self::NearUpdateRequest(m) => CacheMessage::NearUpdateRequest(m),
            Self::BackupUpdateRequest(m) => CacheMessage::BackupUpdateRequest(m),
            Self::UpdateResponse(m) => CacheMessage::UpdateResponse(m),
            Self::NearMappingResponse(m) => CacheMessage::NearMappingResponse(m),
            Self::BackupNearResponse(m) => CacheMessage::BackupNearResponse(m),
            Self::CheckUpdateRequest(m) => CacheMessage::CheckUpdateRequest(m),
        }
    }
}

/// Incremental message decoder for one inbound byte stream.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    reader: MessageReader,
    partial: Option<Partial>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `buf` and return the next complete message, if any.
    ///
    /// Returns `Ok(None)` when `buf` ran out mid-message; the decoder keeps its
    /// position and continues with the next call. After an error the decoder is
    /// reset and the stream should be dropped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<CacheMessage>, WireError> {
        let result = self.decode_inner(buf);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn decode_inner(&mut self, buf: &mut BytesMut) -> Result<Option<CacheMessage>, WireError> {
        if self.partial.is_none() {
            let Some((raw_kind, declared)) = self.reader.read_header(buf) else {
                return Ok(None);
            };
            let kind = MessageKind::from_u8(raw_kind).ok_or(WireError::UnknownKind(raw_kind))?;
            let expected = kind.field_count();
            if declared != expected {
                return Err(WireError::FieldCount { declared, expected });
            }
            self.partial = Some(Partial::new(kind));
        }

        let done = match self.partial.as_mut() {
            Some(partial) => partial.read(buf, &mut self.reader)?,
            None => false,
        };
        if !done {
            return Ok(None);
        }

        self.reader.reset();
        Ok(self.partial.take().map(Partial::finish))
    }

    /// Whether a message is partially decoded.
    pub fn is_mid_message(&self) -> bool {
        self.partial.is_some()
    }

    /// Drop any partially decoded message.
    pub fn reset(&mut self) {
        self.reader.reset();
        self.partial = None;
    }
}
