use shared::{LevelError, Opcode, PacketError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(#[from] PacketError),

    #[error("level data: {0}")]
    Level(#[from] LevelError),

    #[error("kicked: {0}")]
    Kicked(String),

    #[error("unexpected {0:?} packet")]
    Unexpected(Opcode),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("level holds {actual} blocks, dimensions need {expected}")]
    MapSizeMismatch { expected: usize, actual: usize },
}
