//! Error types for the server core

use shared::{Opcode, PacketError};
use thiserror::Error;

/// Reasons a session ends.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] PacketError),

    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(Opcode),

    #[error("client speaks protocol {actual}, server expects {expected}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("invalid player name {0:?}")]
    InvalidName(String),

    #[error("server is full")]
    RegistryFull,

    #[error("name already in use")]
    DuplicateName,

    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("no data received within the idle timeout")]
    IdleTimeout,

    #[error("session closed")]
    Closed,

    #[error("level stream: {0}")]
    Level(#[from] shared::LevelError),
}

impl SessionError {
    /// Message shown to the client before the socket is closed, if the
    /// connection is still usable.
    pub fn kick_reason(&self) -> Option<&'static str> {
        match self {
            SessionError::Protocol(PacketError::UnknownOpcode { .. }) => Some("Unknown packet type!"),
            SessionError::Protocol(_) => Some("Malformed packet!"),
            SessionError::UnexpectedPacket(_) => Some("Unexpected packet!"),
            SessionError::VersionMismatch { .. } => Some("Incompatible protocol version!"),
            SessionError::InvalidName(_) => Some("Invalid name!"),
            SessionError::RegistryFull => Some("Server is full!"),
            SessionError::DuplicateName => Some("Already logged in!"),
            SessionError::IdleTimeout => Some("Timed out"),
            SessionError::Level(_) => Some("Failed to send map"),
            SessionError::Io(_) | SessionError::Closed => None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no free slot")]
    Full,
    #[error("name already registered")]
    DuplicateName,
    #[error("session is closing")]
    Closed,
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Full => SessionError::RegistryFull,
            RegistryError::DuplicateName => SessionError::DuplicateName,
            RegistryError::Closed => SessionError::Closed,
        }
    }
}

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint answered with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("response is not a url: {0:?}")]
    InvalidUrl(String),

    #[error("writing external url: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,

    #[error("lockdown requested from the scheduler thread")]
    LockdownFromSchedulerThread,

    #[error("lockdown not ready in time")]
    LockdownTimeout,

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Error, Debug)]
pub enum WorldError {
    #[error("map i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("map encoding: {0}")]
    Encode(#[from] bincode::Error),

    #[error("invalid map dimensions {0}x{1}x{2}")]
    InvalidDimensions(u16, u16, u16),

    #[error("map holds {actual} blocks, dimensions need {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("world: {0}")]
    World(#[from] WorldError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("server has been shut down; build a new one to restart")]
    Stopped,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
