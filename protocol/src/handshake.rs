//! Parsing for the handshake and login-start packets, and the legacy
//! server-list-ping prefix that predates them.

use crate::var_int::{VarInt, VarIntDecodeError};

/// First byte of a legacy (pre-1.7) server list ping.
pub const LEGACY_PING_FIRST_BYTE: u8 = 0xFE;
/// Second byte that confirms a legacy ping request (as opposed to noise).
pub const LEGACY_PING_SECOND_BYTE: u8 = 0x01;

/// The `nextState` field of a handshake packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NextState {
    Status,
    Login,
}

impl NextState {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(NextState::Status),
            0x02 => Some(NextState::Login),
            _ => None,
        }
    }
}

/// A parsed modern handshake packet (packet id `0x00`).
#[derive(Debug)]
pub struct ServerHandshake {
    pub packet_id: u8,
    pub protocol_version: u8,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// A parsed login-start packet: packet id followed by the claimed username.
#[derive(Debug)]
pub struct LoginStart {
    pub packet_id: u8,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeDecodeError {
    #[error("packet too short: need {needed} bytes, have {have}")]
    TooShort { needed: usize, have: usize },
    #[error("invalid VarInt-prefixed string")]
    BadString(#[from] VarIntDecodeError),
    #[error("string length exceeds remaining packet data")]
    StringOverrun,
    #[error("unknown nextState byte {0:#x}")]
    UnknownNextState(u8),
    #[error("string is not valid UTF-8")]
    NotUtf8,
}

/// Decodes a VarInt-length-prefixed UTF-8 string from the front of `data`,
/// returning the string and the number of bytes consumed (length prefix +
/// payload). This is the one VarInt call site the original handshake
/// actually performs — the handshake's own outer length byte is a raw byte,
/// not a VarInt (see `protocol`'s module docs).
pub fn decode_string(data: &[u8]) -> Result<(String, usize), HandshakeDecodeError> {
    let (VarInt(len), prefix_len) = VarInt::decode(data)?;
    let len = len.max(0) as usize;
    let end = prefix_len
        .checked_add(len)
        .ok_or(HandshakeDecodeError::StringOverrun)?;
    let bytes = data
        .get(prefix_len..end)
        .ok_or(HandshakeDecodeError::StringOverrun)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| HandshakeDecodeError::NotUtf8)?
        .to_owned();
    Ok((s, end))
}

/// Parses the handshake payload that follows the modern (post-1.7) length
/// prefix: `packet-id (1) | protocol-version (1) | reserved (1) |
/// server-address (VarInt string) | port (u16) | nextState (1)`.
pub fn decode_handshake(payload: &[u8]) -> Result<ServerHandshake, HandshakeDecodeError> {
    if payload.len() < 3 {
        return Err(HandshakeDecodeError::TooShort {
            needed: 3,
            have: payload.len(),
        });
    }
    let packet_id = payload[0];
    let protocol_version = payload[1];
    // payload[2] is the reserved/unused byte.
    let (server_address, used) = decode_string(&payload[3..])?;
    let offset = 3 + used;

    if payload.len() < offset + 3 {
        return Err(HandshakeDecodeError::TooShort {
            needed: offset + 3,
            have: payload.len(),
        });
    }
    let server_port = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
    let next_state_byte = payload[offset + 2];
    let next_state = NextState::from_byte(next_state_byte)
        .ok_or(HandshakeDecodeError::UnknownNextState(next_state_byte))?;

    Ok(ServerHandshake {
        packet_id,
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

/// Parses a login-start payload: `packet-id (1) | username (VarInt string)`.
pub fn decode_login_start(payload: &[u8]) -> Result<LoginStart, HandshakeDecodeError> {
    if payload.is_empty() {
        return Err(HandshakeDecodeError::TooShort {
            needed: 1,
            have: 0,
        });
    }
    let packet_id = payload[0];
    let (username, _used) = decode_string(&payload[1..])?;
    Ok(LoginStart {
        packet_id,
        username,
    })
}
