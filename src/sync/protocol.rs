//! Binary WebSocket protocol for document synchronization.
//!
//! Every transport frame carries exactly one message:
//!
//! ```text
//! frame    := varuint kind, payload
//! CONTENT  := varuint sub_kind, varbytes data
//! PRESENCE := varbytes presence_update
//! ```
//!
//! Integers are unsigned LEB128 ("varuint"). CONTENT data is produced and
//! consumed by the replica; PRESENCE updates are produced and consumed by
//! [`super::presence::PresenceState`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Message kind for replicated content
pub const MESSAGE_CONTENT: u64 = 0;

/// Message kind for ephemeral presence
pub const MESSAGE_PRESENCE: u64 = 1;

/// Maximum frame size accepted from a peer (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A varuint never needs more than ten bytes for a u64.
const MAX_VARUINT_BYTES: usize = 10;

/// Content sub-message identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Summary of what the sender has seen
    StateVector = 0,
    /// Reply to a state vector with everything the requester lacks
    MissingOperations = 1,
    /// Newly applied operations
    Update = 2,
}

impl TryFrom<u64> for ContentKind {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ContentKind::StateVector),
            1 => Ok(ContentKind::MissingOperations),
            2 => Ok(ContentKind::Update),
            _ => Err(ProtocolError::UnknownContentKind(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unexpected end of message")]
    UnexpectedEof,

    #[error("Varuint overflows 64 bits")]
    VarUintOverflow,

    #[error("Unknown content message kind: {0}")]
    UnknownContentKind(u64),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Trailing bytes after message: {0}")]
    TrailingBytes(usize),
}

/// A CONTENT sub-message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentMessage {
    StateVector(Bytes),
    MissingOperations(Bytes),
    Update(Bytes),
}

impl ContentMessage {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentMessage::StateVector(_) => ContentKind::StateVector,
            ContentMessage::MissingOperations(_) => ContentKind::MissingOperations,
            ContentMessage::Update(_) => ContentKind::Update,
        }
    }

    fn data(&self) -> &Bytes {
        match self {
            ContentMessage::StateVector(data)
            | ContentMessage::MissingOperations(data)
            | ContentMessage::Update(data) => data,
        }
    }
}

/// A decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Content(ContentMessage),
    /// Raw presence update. Decoding of the inner blob is left to the
    /// presence map, which treats malformed input as "no clients".
    Presence(Bytes),
    /// A kind this server does not understand
    Unknown(u64),
}

/// Encode a CONTENT frame
pub fn encode_content(msg: &ContentMessage) -> Bytes {
    let data = msg.data();
    let mut buf = BytesMut::with_capacity(data.len() + 2 * MAX_VARUINT_BYTES + 1);
    write_var_uint(&mut buf, MESSAGE_CONTENT);
    write_var_uint(&mut buf, msg.kind() as u64);
    write_var_bytes(&mut buf, data);
    buf.freeze()
}

/// Encode a PRESENCE frame around an encoded presence update
pub fn encode_presence(update: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(update.len() + 2 * MAX_VARUINT_BYTES);
    write_var_uint(&mut buf, MESSAGE_PRESENCE);
    write_var_bytes(&mut buf, update);
    buf.freeze()
}

/// Decode one inbound frame.
///
/// Truncated or malformed CONTENT is an error. A malformed PRESENCE blob is
/// returned as an empty update rather than an error.
pub fn decode_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let mut cursor = data;
    let kind = read_var_uint(&mut cursor)?;

    match kind {
        MESSAGE_CONTENT => {
            let sub_kind = ContentKind::try_from(read_var_uint(&mut cursor)?)?;
            let payload = read_var_bytes(&mut cursor)?;
            if cursor.has_remaining() {
                return Err(ProtocolError::TrailingBytes(cursor.remaining()));
            }
            let payload = Bytes::copy_from_slice(payload);
            Ok(Frame::Content(match sub_kind {
                ContentKind::StateVector => ContentMessage::StateVector(payload),
                ContentKind::MissingOperations => ContentMessage::MissingOperations(payload),
                ContentKind::Update => ContentMessage::Update(payload),
            }))
        }
        MESSAGE_PRESENCE => {
            let update = read_var_bytes(&mut cursor)
                .map(Bytes::copy_from_slice)
                .unwrap_or_default();
            Ok(Frame::Presence(update))
        }
        other => Ok(Frame::Unknown(other)),
    }
}

// ============================================================================
// PRIMITIVES
// ============================================================================

pub fn write_var_uint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn write_var_bytes(buf: &mut BytesMut, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn write_var_string(buf: &mut BytesMut, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

pub fn read_var_uint(cursor: &mut &[u8]) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARUINT_BYTES {
        if !cursor.has_remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let byte = cursor.get_u8();
        let bits = u64::from(byte & 0x7F);
        if i == MAX_VARUINT_BYTES - 1 && bits > 1 {
            return Err(ProtocolError::VarUintOverflow);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::VarUintOverflow)
}

pub fn read_var_bytes<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_uint(cursor)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::UnexpectedEof)?;
    if cursor.remaining() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    let slice: &'a [u8] = *cursor;
    let (head, tail) = slice.split_at(len);
    *cursor = tail;
    Ok(head)
}

pub fn read_var_string<'a>(cursor: &mut &'a [u8]) -> Result<&'a str, ProtocolError> {
    let raw = read_var_bytes(cursor)?;
    std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
}
