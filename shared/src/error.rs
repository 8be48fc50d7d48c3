use crate::opcode::Direction;
use thiserror::Error;

/// Failure to turn raw bytes into a packet.
///
/// Any of these is fatal for the connection that produced the bytes: the
/// packet is never partially dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("unknown opcode 0x{opcode:02x} for {direction:?}")]
    UnknownOpcode { opcode: u8, direction: Direction },

    #[error("opcode 0x{opcode:02x} expects {expected} payload bytes, got {actual}")]
    Truncated {
        opcode: u8,
        expected: usize,
        actual: usize,
    },

    #[error("invalid value for field `{field}` in opcode 0x{opcode:02x}")]
    InvalidField { opcode: u8, field: &'static str },
}

/// Failure to unpack a compressed level stream.
#[derive(Error, Debug)]
pub enum LevelError {
    #[error("level stream i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("level stream is missing its 4-byte length header")]
    MissingHeader,

    #[error("level header declares {declared} blocks but stream holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}
