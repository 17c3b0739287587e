//! Frame encoding and decoding.
//!
//! Pure transformations between byte slices and [`Message`] values. Failure
//! is always reported through [`ProtocolError`], never silently truncated.

use crate::protocol::{PROTOCOL_MAGIC, PROTOCOL_VERSION};

/// Byte size of the frame header.
pub const HEADER_SIZE: usize = 8;

/// Byte size of an install/remove request frame (header + vid + pid).
pub const DRIVER_OP_SIZE: usize = HEADER_SIZE + 4;

/// Byte size of a reply frame (header + u32 status).
pub const REPLY_SIZE: usize = HEADER_SIZE + 4;

const TYPE_INSTALL: u16 = 1;
const TYPE_REMOVE: u16 = 2;
const TYPE_SESSION_INSTALL: u16 = 3;
const TYPE_REPLY: u16 = 4;

/// A decoded protocol frame.
///
/// Constructed from one read, consumed by one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Bind the managed driver to the device, persisting past this session.
    Install { vid: u16, pid: u16 },
    /// Bind the managed driver, reverted when the requesting connection closes.
    SessionInstall { vid: u16, pid: u16 },
    /// Unbind the managed driver from the device.
    Remove { vid: u16, pid: u16 },
    /// Broker verdict for the preceding request.
    Reply { status: bool },
}

/// Errors raised while decoding an incoming frame.
///
/// Any of these closes the connection with no reply: a peer that cannot
/// produce a well-formed envelope is not trusted with one.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// First header field did not match the protocol magic.
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    /// Peer speaks a protocol version this broker does not.
    #[error("unsupported protocol version {0}")]
    BadVersion(u16),

    /// Declared size does not match the exact frame size for the type.
    #[error("wrong size {size} for message type {msg_type}")]
    BadSize { msg_type: u16, size: u16 },

    /// Unknown message type.
    #[error("unknown message type {0}")]
    UnknownType(u16),

    /// Fewer bytes on the wire than the header promises.
    #[error("truncated frame: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
}

impl Message {
    fn type_code(self) -> u16 {
        match self {
            Message::Install { .. } => TYPE_INSTALL,
            Message::Remove { .. } => TYPE_REMOVE,
            Message::SessionInstall { .. } => TYPE_SESSION_INSTALL,
            Message::Reply { .. } => TYPE_REPLY,
        }
    }

    /// Exact frame size, header included, for a message type code.
    fn frame_size(msg_type: u16) -> Option<usize> {
        match msg_type {
            TYPE_INSTALL | TYPE_REMOVE | TYPE_SESSION_INSTALL => Some(DRIVER_OP_SIZE),
            TYPE_REPLY => Some(REPLY_SIZE),
            _ => None,
        }
    }

    /// Encodes the message to its fixed-width wire form.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let msg_type = self.type_code();
        // frame_size is total under Some for every constructible message
        let size = Self::frame_size(msg_type).unwrap_or(HEADER_SIZE);
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&msg_type.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(size as u16).to_le_bytes());
        match self {
            Message::Install { vid, pid }
            | Message::SessionInstall { vid, pid }
            | Message::Remove { vid, pid } => {
                buf.extend_from_slice(&vid.to_le_bytes());
                buf.extend_from_slice(&pid.to_le_bytes());
            }
            Message::Reply { status } => {
                buf.extend_from_slice(&u32::from(status).to_le_bytes());
            }
        }
        buf
    }

    /// Decodes one frame from `bytes`.
    ///
    /// Magic and version are validated first, then the declared size against
    /// the exact size for the declared type; the payload is never touched
    /// before the envelope checks out.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first envelope violation.
    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                got: bytes.len(),
                need: HEADER_SIZE,
            });
        }
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([bytes[2], bytes[3]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let msg_type = u16::from_le_bytes([bytes[4], bytes[5]]);
        let size = u16::from_le_bytes([bytes[6], bytes[7]]);
        let Some(expected) = Self::frame_size(msg_type) else {
            return Err(ProtocolError::UnknownType(msg_type));
        };
        if usize::from(size) != expected {
            return Err(ProtocolError::BadSize { msg_type, size });
        }
        if bytes.len() < expected {
            return Err(ProtocolError::Truncated {
                got: bytes.len(),
                need: expected,
            });
        }
        let payload = &bytes[HEADER_SIZE..expected];
        let msg = match msg_type {
            TYPE_INSTALL | TYPE_REMOVE | TYPE_SESSION_INSTALL => {
                let vid = u16::from_le_bytes([payload[0], payload[1]]);
                let pid = u16::from_le_bytes([payload[2], payload[3]]);
                match msg_type {
                    TYPE_INSTALL => Message::Install { vid, pid },
                    TYPE_REMOVE => Message::Remove { vid, pid },
                    _ => Message::SessionInstall { vid, pid },
                }
            }
            _ => {
                let status =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Message::Reply { status: status != 0 }
            }
        };
        Ok(msg)
    }

    /// Payload byte count the header promises, once the header has been
    /// validated. Used by readers that fetch the header first.
    ///
    /// # Errors
    ///
    /// Same envelope checks as [`Message::decode`], without a payload.
    pub fn payload_size(header: &[u8]) -> Result<usize, ProtocolError> {
        if header.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                got: header.len(),
                need: HEADER_SIZE,
            });
        }
        let magic = u16::from_le_bytes([header[0], header[1]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([header[2], header[3]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let msg_type = u16::from_le_bytes([header[4], header[5]]);
        let size = u16::from_le_bytes([header[6], header[7]]);
        let Some(expected) = Self::frame_size(msg_type) else {
            return Err(ProtocolError::UnknownType(msg_type));
        };
        if usize::from(size) != expected {
            return Err(ProtocolError::BadSize { msg_type, size });
        }
        Ok(expected - HEADER_SIZE)
    }
}
