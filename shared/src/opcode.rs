//! Opcode table
//!
//! The frame length of every packet is fixed by its opcode and the direction it
//! travels in. Lengths here include the opcode byte itself.

use crate::error::PacketError;
use serde::{Deserialize, Serialize};

/// Which way a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0x00,
    Ping = 0x01,
    MapChunkBegin = 0x02,
    MapChunk = 0x03,
    MapChunkEnd = 0x04,
    /// Client asks to place or destroy a block.
    SetBlockRequest = 0x05,
    /// Server announces a block change.
    SetBlock = 0x06,
    AddEntity = 0x07,
    Teleport = 0x08,
    MoveRotate = 0x09,
    Move = 0x0a,
    Rotate = 0x0b,
    RemoveEntity = 0x0c,
    Message = 0x0d,
    Kick = 0x0e,
    SetPermission = 0x0f,
}

impl Opcode {
    pub const ALL: [Opcode; 16] = [
        Opcode::Handshake,
        Opcode::Ping,
        Opcode::MapChunkBegin,
        Opcode::MapChunk,
        Opcode::MapChunkEnd,
        Opcode::SetBlockRequest,
        Opcode::SetBlock,
        Opcode::AddEntity,
        Opcode::Teleport,
        Opcode::MoveRotate,
        Opcode::Move,
        Opcode::Rotate,
        Opcode::RemoveEntity,
        Opcode::Message,
        Opcode::Kick,
        Opcode::SetPermission,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Total frame length, opcode included, or `None` when the opcode is
    /// never sent in `direction`.
    pub const fn frame_len(self, direction: Direction) -> Option<usize> {
        use Direction::*;
        match (self, direction) {
            (Opcode::Handshake, _) => Some(131),
            (Opcode::SetBlockRequest, ClientToServer) => Some(9),
            (Opcode::Teleport, _) => Some(10),
            (Opcode::Message, _) => Some(66),

            (Opcode::Ping, ServerToClient) => Some(1),
            (Opcode::MapChunkBegin, ServerToClient) => Some(1),
            (Opcode::MapChunk, ServerToClient) => Some(1028),
            (Opcode::MapChunkEnd, ServerToClient) => Some(7),
            (Opcode::SetBlock, ServerToClient) => Some(8),
            (Opcode::AddEntity, ServerToClient) => Some(74),
            (Opcode::MoveRotate, ServerToClient) => Some(7),
            (Opcode::Move, ServerToClient) => Some(5),
            (Opcode::Rotate, ServerToClient) => Some(4),
            (Opcode::RemoveEntity, ServerToClient) => Some(2),
            (Opcode::Kick, ServerToClient) => Some(65),
            (Opcode::SetPermission, ServerToClient) => Some(2),

            _ => None,
        }
    }

    /// Payload length, opcode excluded.
    pub const fn payload_len(self, direction: Direction) -> Option<usize> {
        match self.frame_len(direction) {
            Some(len) => Some(len - 1),
            None => None,
        }
    }
}

/// Resolves a raw opcode byte for `direction`, returning the opcode and its
/// payload length.
pub fn lookup(byte: u8, direction: Direction) -> Result<(Opcode, usize), PacketError> {
    Opcode::from_byte(byte)
        .and_then(|op| op.payload_len(direction).map(|len| (op, len)))
        .ok_or(PacketError::UnknownOpcode {
            opcode: byte,
            direction,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_byte_matches_discriminant() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_byte(op.as_byte()), Some(op));
        }
        assert_eq!(Opcode::from_byte(0x10), None);
        assert_eq!(Opcode::from_byte(0xff), None);
    }

    #[test]
    fn test_handshake_lengths() {
        assert_eq!(Opcode::Handshake.frame_len(Direction::ServerToClient), Some(131));
        assert_eq!(Opcode::Handshake.payload_len(Direction::ClientToServer), Some(130));
    }

    #[test]
    fn test_set_block_opcodes_are_directional() {
        assert_eq!(Opcode::SetBlockRequest.frame_len(Direction::ClientToServer), Some(9));
        assert_eq!(Opcode::SetBlockRequest.frame_len(Direction::ServerToClient), None);
        assert_eq!(Opcode::SetBlock.frame_len(Direction::ServerToClient), Some(8));
        assert_eq!(Opcode::SetBlock.frame_len(Direction::ClientToServer), None);
    }

    #[test]
    fn test_server_only_opcodes_rejected_inbound() {
        for op in [Opcode::MapChunk, Opcode::Kick, Opcode::AddEntity, Opcode::Ping] {
            assert_eq!(
                lookup(op.as_byte(), Direction::ClientToServer),
                Err(PacketError::UnknownOpcode {
                    opcode: op.as_byte(),
                    direction: Direction::ClientToServer,
                })
            );
        }
    }

    #[test]
    fn test_lookup_unknown_byte() {
        let err = lookup(0x42, Direction::ServerToClient).unwrap_err();
        assert!(matches!(err, PacketError::UnknownOpcode { opcode: 0x42, .. }));
    }

    #[test]
    fn test_canonical_frame_table() {
        let expected = [
            (Opcode::MapChunkBegin, 1),
            (Opcode::MapChunk, 1028),
            (Opcode::MapChunkEnd, 7),
            (Opcode::AddEntity, 74),
            (Opcode::Teleport, 10),
            (Opcode::MoveRotate, 7),
            (Opcode::Move, 5),
            (Opcode::Rotate, 4),
            (Opcode::RemoveEntity, 2),
            (Opcode::Message, 66),
            (Opcode::Kick, 65),
            (Opcode::SetPermission, 2),
        ];
        for (op, len) in expected {
            assert_eq!(op.frame_len(Direction::ServerToClient), Some(len), "{:?}", op);
        }
    }
}
