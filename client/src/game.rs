use log::debug;
use shared::{BlockPos, Position, ServerPacket, SELF_ENTITY_ID};
use std::collections::HashMap;

/// Another player as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlayer {
    pub name: String,
    pub position: Position,
    pub yaw: u8,
    pub pitch: u8,
}

/// Client-side copy of the level and everyone in it, kept up to date from
/// server packets.
#[derive(Debug, Clone)]
pub struct ClientWorld {
    pub width: u16,
    pub height: u16,
    pub length: u16,
    blocks: Vec<u8>,
    pub players: HashMap<i8, RemotePlayer>,
    pub own_position: Option<Position>,
    pub chat: Vec<String>,
}

impl ClientWorld {
    pub fn new(width: u16, height: u16, length: u16, blocks: Vec<u8>) -> Self {
        Self {
            width,
            height,
            length,
            blocks,
            players: HashMap::new(),
            own_position: None,
            chat: Vec::new(),
        }
    }

    fn index(&self, pos: BlockPos) -> Option<usize> {
        if pos.x >= self.width || pos.y >= self.height || pos.z >= self.length {
            return None;
        }
        let (w, l) = (usize::from(self.width), usize::from(self.length));
        Some((usize::from(pos.y) * l + usize::from(pos.z)) * w + usize::from(pos.x))
    }

    pub fn block_at(&self, pos: BlockPos) -> Option<u8> {
        self.index(pos).map(|i| self.blocks[i])
    }

    pub fn player_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.players.values().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    /// Updates local state from one server packet.
    pub fn apply(&mut self, packet: &ServerPacket) {
        match packet {
            ServerPacket::SetBlock { pos, block } => {
                if let Some(i) = self.index(*pos) {
                    self.blocks[i] = *block;
                }
            }
            ServerPacket::AddEntity {
                entity_id,
                name,
                position,
                yaw,
                pitch,
            } => {
                if *entity_id == SELF_ENTITY_ID {
                    self.own_position = Some(*position);
                } else {
                    debug!("{} appeared as entity {}", name, entity_id);
                    self.players.insert(
                        *entity_id,
                        RemotePlayer {
                            name: name.clone(),
                            position: *position,
                            yaw: *yaw,
                            pitch: *pitch,
                        },
                    );
                }
            }
            ServerPacket::RemoveEntity { entity_id } => {
                self.players.remove(entity_id);
            }
            ServerPacket::Teleport {
                entity_id,
                position,
                yaw,
                pitch,
            } => {
                if *entity_id == SELF_ENTITY_ID {
                    self.own_position = Some(*position);
                } else if let Some(player) = self.players.get_mut(entity_id) {
                    player.position = *position;
                    player.yaw = *yaw;
                    player.pitch = *pitch;
                }
            }
            ServerPacket::MoveRotate {
                entity_id,
                dx,
                dy,
                dz,
                yaw,
                pitch,
            } => {
                if let Some(player) = self.players.get_mut(entity_id) {
                    player.position = offset(player.position, *dx, *dy, *dz);
                    player.yaw = *yaw;
                    player.pitch = *pitch;
                }
            }
            ServerPacket::Move { entity_id, dx, dy, dz } => {
                if let Some(player) = self.players.get_mut(entity_id) {
                    player.position = offset(player.position, *dx, *dy, *dz);
                }
            }
            ServerPacket::Rotate { entity_id, yaw, pitch } => {
                if let Some(player) = self.players.get_mut(entity_id) {
                    player.yaw = *yaw;
                    player.pitch = *pitch;
                }
            }
            ServerPacket::Message { text, .. } => self.chat.push(text.clone()),
            _ => {}
        }
    }
}

fn offset(position: Position, dx: i8, dy: i8, dz: i8) -> Position {
    Position::new(
        position.x.wrapping_add(i16::from(dx)),
        position.y.wrapping_add(i16::from(dy)),
        position.z.wrapping_add(i16::from(dz)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> ClientWorld {
        ClientWorld::new(4, 4, 4, vec![0; 64])
    }

    #[test]
    fn test_set_block_updates_grid() {
        let mut world = world();
        let pos = BlockPos::new(1, 2, 3);
        world.apply(&ServerPacket::SetBlock { pos, block: 5 });
        assert_eq!(world.block_at(pos), Some(5));
        assert_eq!(world.block_at(BlockPos::new(4, 0, 0)), None);
    }

    #[test]
    fn test_entity_tracking() {
        let mut world = world();
        world.apply(&ServerPacket::AddEntity {
            entity_id: 3,
            name: "bob".into(),
            position: Position::new(64, 64, 64),
            yaw: 0,
            pitch: 0,
        });
        world.apply(&ServerPacket::Move {
            entity_id: 3,
            dx: -4,
            dy: 0,
            dz: 8,
        });
        assert_eq!(world.players[&3].position, Position::new(60, 64, 72));

        world.apply(&ServerPacket::Rotate {
            entity_id: 3,
            yaw: 128,
            pitch: 10,
        });
        assert_eq!(world.players[&3].yaw, 128);

        world.apply(&ServerPacket::RemoveEntity { entity_id: 3 });
        assert!(world.players.is_empty());
    }

    #[test]
    fn test_self_spawn_recorded() {
        let mut world = world();
        world.apply(&ServerPacket::AddEntity {
            entity_id: SELF_ENTITY_ID,
            name: "me".into(),
            position: Position::new(1, 2, 3),
            yaw: 0,
            pitch: 0,
        });
        assert_eq!(world.own_position, Some(Position::new(1, 2, 3)));
        assert!(world.players.is_empty());
    }
}
