//! # Classic Wire Protocol
//!
//! Everything a client and the server have to agree on byte-for-byte lives in
//! this crate: the opcode table, the fixed-size packet layouts for both
//! directions, fixed-width string handling, chat line wrapping and the
//! gzip-framed level stream sent during map transfer.
//!
//! Every packet is an opcode byte followed by a payload whose length is a pure
//! function of the opcode and the direction of travel. Numeric fields are
//! big-endian, strings are 64 bytes padded with spaces, and entity positions
//! are fixed-point with 32 units per block.
//!
//! ```rust
//! use shared::{ClientPacket, Packet, PROTOCOL_VERSION};
//!
//! let hello = ClientPacket::Handshake {
//!     protocol_version: PROTOCOL_VERSION,
//!     username: "notch".to_string(),
//!     verification_key: "-".to_string(),
//!     unused: 0,
//! };
//! let frame = hello.encode();
//! assert_eq!(frame.len(), 131);
//!
//! let decoded = ClientPacket::decode(frame[0], &frame[1..]).unwrap();
//! assert_eq!(decoded, hello);
//! ```

pub mod error;
pub mod level;
pub mod opcode;
pub mod packet;
pub mod text;

pub use error::{LevelError, PacketError};
pub use opcode::{Direction, Opcode};
pub use packet::{BlockMode, BlockPos, ClientPacket, Packet, Position, ServerPacket};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 7;

/// Entity id a client uses to refer to itself.
pub const SELF_ENTITY_ID: i8 = -1;

/// Fixed-point units per block for entity positions.
pub const UNITS_PER_BLOCK: i16 = 32;

/// User type byte for regular players.
pub const USER_TYPE_NORMAL: u8 = 0x00;

/// User type byte for operators, allowed to break bedrock client-side.
pub const USER_TYPE_OP: u8 = 0x64;

/// Block ids that the server needs to reason about.
pub mod block {
    pub const AIR: u8 = 0;
    pub const STONE: u8 = 1;
    pub const GRASS: u8 = 2;
    pub const DIRT: u8 = 3;
    pub const BEDROCK: u8 = 7;
    pub const WATER: u8 = 8;
    pub const STILL_WATER: u8 = 9;
    pub const LAVA: u8 = 10;
    pub const STILL_LAVA: u8 = 11;

    /// Highest block id defined by protocol version 7.
    pub const MAX_BLOCK: u8 = 49;

    pub fn is_liquid(id: u8) -> bool {
        matches!(id, WATER | STILL_WATER | LAVA | STILL_LAVA)
    }
}
