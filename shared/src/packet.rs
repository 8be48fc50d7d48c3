//! Packet layouts for both directions of the connection

use crate::error::PacketError;
use crate::opcode::{lookup, Direction, Opcode};
use crate::text::{read_fixed_string, write_fixed_string, STRING_LEN};
use crate::UNITS_PER_BLOCK;
use serde::{Deserialize, Serialize};

/// Size of the block data carried by one map chunk.
pub const CHUNK_DATA_LEN: usize = 1024;

/// Entity position in fixed-point units (1/32 block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Position {
    pub fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }

    /// Converts block coordinates into fixed-point units, rounding to nearest.
    pub fn from_blocks(x: f32, y: f32, z: f32) -> Self {
        let unit = UNITS_PER_BLOCK as f32;
        Self {
            x: (x * unit).round() as i16,
            y: (y * unit).round() as i16,
            z: (z * unit).round() as i16,
        }
    }

    pub fn to_blocks(self) -> (f32, f32, f32) {
        let unit = UNITS_PER_BLOCK as f32;
        (self.x as f32 / unit, self.y as f32 / unit, self.z as f32 / unit)
    }

    /// Per-axis difference if every axis fits a relative move.
    pub fn delta_from(self, previous: Position) -> Option<(i8, i8, i8)> {
        let dx = i8::try_from(i32::from(self.x) - i32::from(previous.x)).ok()?;
        let dy = i8::try_from(i32::from(self.y) - i32::from(previous.y)).ok()?;
        let dz = i8::try_from(i32::from(self.z) - i32::from(previous.z)).ok()?;
        Some((dx, dy, dz))
    }
}

/// Block coordinates in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl BlockPos {
    pub fn new(x: u16, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Destroy,
    Place,
}

/// Packets a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Handshake {
        protocol_version: u8,
        username: String,
        verification_key: String,
        unused: u8,
    },
    SetBlock {
        pos: BlockPos,
        mode: BlockMode,
        block: u8,
    },
    /// Position and orientation report. The id is always -1 in practice.
    Teleport {
        player_id: i8,
        position: Position,
        yaw: u8,
        pitch: u8,
    },
    Message {
        unused: u8,
        text: String,
    },
}

/// Packets the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Handshake {
        protocol_version: u8,
        server_name: String,
        motd: String,
        user_type: u8,
    },
    Ping,
    MapChunkBegin,
    /// `data` holds only the meaningful bytes; padding is added on encode.
    MapChunk {
        data: Vec<u8>,
        percent: u8,
    },
    MapChunkEnd {
        width: u16,
        height: u16,
        length: u16,
    },
    SetBlock {
        pos: BlockPos,
        block: u8,
    },
    AddEntity {
        entity_id: i8,
        name: String,
        position: Position,
        yaw: u8,
        pitch: u8,
    },
    Teleport {
        entity_id: i8,
        position: Position,
        yaw: u8,
        pitch: u8,
    },
    MoveRotate {
        entity_id: i8,
        dx: i8,
        dy: i8,
        dz: i8,
        yaw: u8,
        pitch: u8,
    },
    Move {
        entity_id: i8,
        dx: i8,
        dy: i8,
        dz: i8,
    },
    Rotate {
        entity_id: i8,
        yaw: u8,
        pitch: u8,
    },
    RemoveEntity {
        entity_id: i8,
    },
    Message {
        entity_id: i8,
        text: String,
    },
    Kick {
        reason: String,
    },
    SetPermission {
        user_type: u8,
    },
}

/// A packet with a fixed wire layout in one direction.
pub trait Packet: Sized {
    const DIRECTION: Direction;

    fn opcode(&self) -> Opcode;

    /// Appends the payload (opcode excluded).
    fn write_payload(&self, out: &mut Vec<u8>);

    /// Parses a payload whose length has already been checked.
    fn read_payload(opcode: Opcode, payload: &mut PayloadReader<'_>) -> Result<Self, PacketError>;

    /// Full frame including the opcode byte.
    fn encode(&self) -> Vec<u8> {
        let opcode = self.opcode();
        let len = opcode.frame_len(Self::DIRECTION).unwrap_or(1);
        let mut out = Vec::with_capacity(len);
        out.push(opcode.as_byte());
        self.write_payload(&mut out);
        debug_assert_eq!(out.len(), len, "{:?} encoded to the wrong length", opcode);
        out
    }

    /// Decodes the payload that followed `opcode` on the wire.
    fn decode(opcode: u8, payload: &[u8]) -> Result<Self, PacketError> {
        let (op, expected) = lookup(opcode, Self::DIRECTION)?;
        if payload.len() != expected {
            return Err(PacketError::Truncated {
                opcode,
                expected,
                actual: payload.len(),
            });
        }
        let mut reader = PayloadReader::new(opcode, payload);
        Self::read_payload(op, &mut reader)
    }

    /// Decodes a complete frame, opcode first.
    fn decode_frame(frame: &[u8]) -> Result<Self, PacketError> {
        match frame.split_first() {
            Some((&opcode, payload)) => Self::decode(opcode, payload),
            None => Err(PacketError::Truncated {
                opcode: 0,
                expected: 1,
                actual: 0,
            }),
        }
    }
}

/// Cursor over a length-checked payload.
pub struct PayloadReader<'a> {
    opcode: u8,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(opcode: u8, buf: &'a [u8]) -> Self {
        Self { opcode, buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or(PacketError::Truncated {
            opcode: self.opcode,
            expected: end,
            actual: self.buf.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, PacketError> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, PacketError> {
        Ok(self.u16()? as i16)
    }

    pub fn string(&mut self) -> Result<String, PacketError> {
        Ok(read_fixed_string(self.take(STRING_LEN)?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        self.take(n)
    }

    pub fn position(&mut self) -> Result<Position, PacketError> {
        Ok(Position::new(self.i16()?, self.i16()?, self.i16()?))
    }

    pub fn block_pos(&mut self) -> Result<BlockPos, PacketError> {
        Ok(BlockPos::new(self.u16()?, self.u16()?, self.u16()?))
    }

    fn invalid(&self, field: &'static str) -> PacketError {
        PacketError::InvalidField {
            opcode: self.opcode,
            field,
        }
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_position(out: &mut Vec<u8>, p: Position) {
    for v in [p.x, p.y, p.z] {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

fn put_block_pos(out: &mut Vec<u8>, p: BlockPos) {
    for v in [p.x, p.y, p.z] {
        put_u16(out, v);
    }
}

impl Packet for ClientPacket {
    const DIRECTION: Direction = Direction::ClientToServer;

    fn opcode(&self) -> Opcode {
        match self {
            ClientPacket::Handshake { .. } => Opcode::Handshake,
            ClientPacket::SetBlock { .. } => Opcode::SetBlockRequest,
            ClientPacket::Teleport { .. } => Opcode::Teleport,
            ClientPacket::Message { .. } => Opcode::Message,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            ClientPacket::Handshake {
                protocol_version,
                username,
                verification_key,
                unused,
            } => {
                out.push(*protocol_version);
                write_fixed_string(out, username);
                write_fixed_string(out, verification_key);
                out.push(*unused);
            }
            ClientPacket::SetBlock { pos, mode, block } => {
                put_block_pos(out, *pos);
                out.push(match mode {
                    BlockMode::Destroy => 0,
                    BlockMode::Place => 1,
                });
                out.push(*block);
            }
            ClientPacket::Teleport {
                player_id,
                position,
                yaw,
                pitch,
            } => {
                out.push(*player_id as u8);
                put_position(out, *position);
                out.push(*yaw);
                out.push(*pitch);
            }
            ClientPacket::Message { unused, text } => {
                out.push(*unused);
                write_fixed_string(out, text);
            }
        }
    }

    fn read_payload(opcode: Opcode, r: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(match opcode {
            Opcode::Handshake => ClientPacket::Handshake {
                protocol_version: r.u8()?,
                username: r.string()?,
                verification_key: r.string()?,
                unused: r.u8()?,
            },
            Opcode::SetBlockRequest => {
                let pos = r.block_pos()?;
                let mode = match r.u8()? {
                    0 => BlockMode::Destroy,
                    1 => BlockMode::Place,
                    _ => return Err(r.invalid("mode")),
                };
                ClientPacket::SetBlock {
                    pos,
                    mode,
                    block: r.u8()?,
                }
            }
            Opcode::Teleport => ClientPacket::Teleport {
                player_id: r.i8()?,
                position: r.position()?,
                yaw: r.u8()?,
                pitch: r.u8()?,
            },
            Opcode::Message => ClientPacket::Message {
                unused: r.u8()?,
                text: r.string()?,
            },
            other => {
                return Err(PacketError::UnknownOpcode {
                    opcode: other.as_byte(),
                    direction: Self::DIRECTION,
                })
            }
        })
    }
}

impl Packet for ServerPacket {
    const DIRECTION: Direction = Direction::ServerToClient;

    fn opcode(&self) -> Opcode {
        match self {
            ServerPacket::Handshake { .. } => Opcode::Handshake,
            ServerPacket::Ping => Opcode::Ping,
            ServerPacket::MapChunkBegin => Opcode::MapChunkBegin,
            ServerPacket::MapChunk { .. } => Opcode::MapChunk,
            ServerPacket::MapChunkEnd { .. } => Opcode::MapChunkEnd,
            ServerPacket::SetBlock { .. } => Opcode::SetBlock,
            ServerPacket::AddEntity { .. } => Opcode::AddEntity,
            ServerPacket::Teleport { .. } => Opcode::Teleport,
            ServerPacket::MoveRotate { .. } => Opcode::MoveRotate,
            ServerPacket::Move { .. } => Opcode::Move,
            ServerPacket::Rotate { .. } => Opcode::Rotate,
            ServerPacket::RemoveEntity { .. } => Opcode::RemoveEntity,
            ServerPacket::Message { .. } => Opcode::Message,
            ServerPacket::Kick { .. } => Opcode::Kick,
            ServerPacket::SetPermission { .. } => Opcode::SetPermission,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            ServerPacket::Handshake {
                protocol_version,
                server_name,
                motd,
                user_type,
            } => {
                out.push(*protocol_version);
                write_fixed_string(out, server_name);
                write_fixed_string(out, motd);
                out.push(*user_type);
            }
            ServerPacket::Ping | ServerPacket::MapChunkBegin => {}
            ServerPacket::MapChunk { data, percent } => {
                let len = data.len().min(CHUNK_DATA_LEN);
                put_u16(out, len as u16);
                out.extend_from_slice(&data[..len]);
                out.resize(out.len() + (CHUNK_DATA_LEN - len), 0);
                out.push(*percent);
            }
            ServerPacket::MapChunkEnd {
                width,
                height,
                length,
            } => {
                put_u16(out, *width);
                put_u16(out, *height);
                put_u16(out, *length);
            }
            ServerPacket::SetBlock { pos, block } => {
                put_block_pos(out, *pos);
                out.push(*block);
            }
            ServerPacket::AddEntity {
                entity_id,
                name,
                position,
                yaw,
                pitch,
            } => {
                out.push(*entity_id as u8);
                write_fixed_string(out, name);
                put_position(out, *position);
                out.push(*yaw);
                out.push(*pitch);
            }
            ServerPacket::Teleport {
                entity_id,
                position,
                yaw,
                pitch,
            } => {
                out.push(*entity_id as u8);
                put_position(out, *position);
                out.push(*yaw);
                out.push(*pitch);
            }
            ServerPacket::MoveRotate {
                entity_id,
                dx,
                dy,
                dz,
                yaw,
                pitch,
            } => {
                out.extend_from_slice(&[
                    *entity_id as u8,
                    *dx as u8,
                    *dy as u8,
                    *dz as u8,
                    *yaw,
                    *pitch,
                ]);
            }
            ServerPacket::Move {
                entity_id,
                dx,
                dy,
                dz,
            } => {
                out.extend_from_slice(&[*entity_id as u8, *dx as u8, *dy as u8, *dz as u8]);
            }
            ServerPacket::Rotate {
                entity_id,
                yaw,
                pitch,
            } => {
                out.extend_from_slice(&[*entity_id as u8, *yaw, *pitch]);
            }
            ServerPacket::RemoveEntity { entity_id } => out.push(*entity_id as u8),
            ServerPacket::Message { entity_id, text } => {
                out.push(*entity_id as u8);
                write_fixed_string(out, text);
            }
            ServerPacket::Kick { reason } => write_fixed_string(out, reason),
            ServerPacket::SetPermission { user_type } => out.push(*user_type),
        }
    }

    fn read_payload(opcode: Opcode, r: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(match opcode {
            Opcode::Handshake => ServerPacket::Handshake {
                protocol_version: r.u8()?,
                server_name: r.string()?,
                motd: r.string()?,
                user_type: r.u8()?,
            },
            Opcode::Ping => ServerPacket::Ping,
            Opcode::MapChunkBegin => ServerPacket::MapChunkBegin,
            Opcode::MapChunk => {
                let len = r.u16()? as usize;
                if len > CHUNK_DATA_LEN {
                    return Err(r.invalid("chunk length"));
                }
                let data = r.bytes(CHUNK_DATA_LEN)?[..len].to_vec();
                ServerPacket::MapChunk {
                    data,
                    percent: r.u8()?,
                }
            }
            Opcode::MapChunkEnd => ServerPacket::MapChunkEnd {
                width: r.u16()?,
                height: r.u16()?,
                length: r.u16()?,
            },
            Opcode::SetBlock => ServerPacket::SetBlock {
                pos: r.block_pos()?,
                block: r.u8()?,
            },
            Opcode::AddEntity => ServerPacket::AddEntity {
                entity_id: r.i8()?,
                name: r.string()?,
                position: r.position()?,
                yaw: r.u8()?,
                pitch: r.u8()?,
            },
            Opcode::Teleport => ServerPacket::Teleport {
                entity_id: r.i8()?,
                position: r.position()?,
                yaw: r.u8()?,
                pitch: r.u8()?,
            },
            Opcode::MoveRotate => ServerPacket::MoveRotate {
                entity_id: r.i8()?,
                dx: r.i8()?,
                dy: r.i8()?,
                dz: r.i8()?,
                yaw: r.u8()?,
                pitch: r.u8()?,
            },
            Opcode::Move => ServerPacket::Move {
                entity_id: r.i8()?,
                dx: r.i8()?,
                dy: r.i8()?,
                dz: r.i8()?,
            },
            Opcode::Rotate => ServerPacket::Rotate {
                entity_id: r.i8()?,
                yaw: r.u8()?,
                pitch: r.u8()?,
            },
            Opcode::RemoveEntity => ServerPacket::RemoveEntity {
                entity_id: r.i8()?,
            },
            Opcode::Message => ServerPacket::Message {
                entity_id: r.i8()?,
                text: r.string()?,
            },
            Opcode::Kick => ServerPacket::Kick { reason: r.string()? },
            Opcode::SetPermission => ServerPacket::SetPermission { user_type: r.u8()? },
            Opcode::SetBlockRequest => {
                return Err(PacketError::UnknownOpcode {
                    opcode: opcode.as_byte(),
                    direction: Self::DIRECTION,
                })
            }
        })
    }
}
