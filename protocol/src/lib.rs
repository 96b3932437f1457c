//! Wire-level primitives for the Minecraft handshake/login prefix.
//!
//! This crate only understands as much of the Java Edition protocol as is
//! needed to classify an inbound connection and pull the claimed username out
//! of a login packet. It does not attempt to model the rest of the protocol.

mod handshake;
mod var_int;

pub use handshake::{
    HandshakeDecodeError, LEGACY_PING_FIRST_BYTE, LEGACY_PING_SECOND_BYTE, LoginStart, NextState,
    ServerHandshake, decode_handshake, decode_login_start, decode_string,
};
pub use var_int::{VarInt, VarIntDecodeError, VarIntDecoder};
