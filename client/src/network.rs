use crate::error::ClientError;
use crate::game::ClientWorld;
use log::{debug, info, trace};
use shared::level::decompress_level;
use shared::opcode::lookup;
use shared::{BlockMode, BlockPos, ClientPacket, Direction, Packet, Position, ServerPacket, PROTOCOL_VERSION, SELF_ENTITY_ID};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// What the server said about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub motd: String,
    pub user_type: u8,
}

/// A headless client over any byte stream.
#[derive(Debug)]
pub struct Client<S> {
    stream: S,
    name: String,
    pub info: ServerInfo,
    pub world: ClientWorld,
    payload: Vec<u8>,
}

impl Client<TcpStream> {
    /// Connects and joins with protocol version 7.
    pub async fn connect<A: ToSocketAddrs>(addr: A, name: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::join(stream, name, PROTOCOL_VERSION).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Performs the handshake, downloads the level and waits to be admitted.
    pub async fn join(mut stream: S, name: &str, protocol_version: u8) -> Result<Self, ClientError> {
        let hello = ClientPacket::Handshake {
            protocol_version,
            username: name.to_string(),
            verification_key: "-".to_string(),
            unused: 0,
        };
        stream.write_all(&hello.encode()).await?;
        let mut payload = Vec::with_capacity(1024);

        let info = match read_packet(&mut stream, &mut payload).await? {
            ServerPacket::Handshake {
                server_name,
                motd,
                user_type,
                ..
            } => ServerInfo {
                name: server_name,
                motd,
                user_type,
            },
            other => return Err(unexpected(other)),
        };
        info!("Joined {} ({})", info.name, info.motd);

        match read_packet(&mut stream, &mut payload).await? {
            ServerPacket::MapChunkBegin => {}
            other => return Err(unexpected(other)),
        }

        let mut level = Vec::new();
        let (width, height, length) = loop {
            match read_packet(&mut stream, &mut payload).await? {
                ServerPacket::MapChunk { data, percent } => {
                    trace!("level {}%", percent);
                    level.extend_from_slice(&data);
                }
                ServerPacket::MapChunkEnd { width, height, length } => break (width, height, length),
                other => return Err(unexpected(other)),
            }
        };

        let blocks = decompress_level(&level)?;
        let expected = usize::from(width) * usize::from(height) * usize::from(length);
        if blocks.len() != expected {
            return Err(ClientError::MapSizeMismatch {
                expected,
                actual: blocks.len(),
            });
        }
        debug!("received {}x{}x{} level ({} bytes compressed)", width, height, length, level.len());
        let mut world = ClientWorld::new(width, height, length, blocks);

        // Admission is decided after the map: either our own spawn or a kick.
        loop {
            let packet = read_packet(&mut stream, &mut payload).await?;
            if let ServerPacket::Kick { reason } = packet {
                return Err(ClientError::Kicked(reason));
            }
            world.apply(&packet);
            if matches!(packet, ServerPacket::AddEntity { entity_id: SELF_ENTITY_ID, .. }) {
                break;
            }
        }

        Ok(Self {
            stream,
            name: name.to_string(),
            info,
            world,
            payload,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads the next packet and applies it to the local world. A kick is
    /// returned as an error.
    pub async fn next_packet(&mut self) -> Result<ServerPacket, ClientError> {
        let packet = read_packet(&mut self.stream, &mut self.payload).await?;
        if let ServerPacket::Kick { reason } = packet {
            return Err(ClientError::Kicked(reason));
        }
        self.world.apply(&packet);
        Ok(packet)
    }

    pub async fn next_packet_timeout(&mut self, timeout: Duration) -> Result<ServerPacket, ClientError> {
        tokio::time::timeout(timeout, self.next_packet())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Reads packets until one matches `accept`, returning it.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut accept: F) -> Result<ServerPacket, ClientError>
    where
        F: FnMut(&ServerPacket) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let packet = tokio::time::timeout_at(deadline, self.next_packet())
                .await
                .map_err(|_| ClientError::Timeout)??;
            if accept(&packet) {
                return Ok(packet);
            }
        }
    }

    async fn send(&mut self, packet: &ClientPacket) -> Result<(), ClientError> {
        self.stream.write_all(&packet.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn chat(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(&ClientPacket::Message {
            unused: 0xff,
            text: text.to_string(),
        })
        .await
    }

    pub async fn set_block(&mut self, pos: BlockPos, mode: BlockMode, block: u8) -> Result<(), ClientError> {
        self.send(&ClientPacket::SetBlock { pos, mode, block }).await
    }

    pub async fn move_to(&mut self, position: Position, yaw: u8, pitch: u8) -> Result<(), ClientError> {
        self.world.own_position = Some(position);
        self.send(&ClientPacket::Teleport {
            player_id: SELF_ENTITY_ID,
            position,
            yaw,
            pitch,
        })
        .await
    }

    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S, payload: &mut Vec<u8>) -> Result<ServerPacket, ClientError> {
    let mut opcode = [0u8; 1];
    stream.read_exact(&mut opcode).await?;
    let (_, len) = lookup(opcode[0], Direction::ServerToClient)?;
    payload.resize(len, 0);
    stream.read_exact(payload).await?;
    Ok(ServerPacket::decode(opcode[0], payload)?)
}

fn unexpected(packet: ServerPacket) -> ClientError {
    match packet {
        ServerPacket::Kick { reason } => ClientError::Kicked(reason),
        other => ClientError::Unexpected(other.opcode()),
    }
}
