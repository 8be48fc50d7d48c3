//! Per-client protocol state machine
//!
//! Each connection is driven by two tasks. The input side reads one packet at
//! a time and reacts to it; it only ever reaches other players through the
//! registry and world. The output side drains this session's own bounded FIFO
//! queue into the socket, so a slow peer only ever backs up its own queue.
//!
//! Teardown is funnelled through [`Session::close`], which runs at most once
//! no matter how many paths race into it.

use crate::connection::{split_stream, PacketReader, PacketWriter};
use crate::error::SessionError;
use crate::registry::Registry;
use crate::server::ServerContext;
use crate::utils::{lock, wait_for_flag};
use log::{debug, info, trace, warn};
use shared::level::{compress_level, level_chunks};
use shared::text::wrap_chat;
use shared::{BlockMode, BlockPos, ClientPacket, Opcode, Packet, Position, ServerPacket, SELF_ENTITY_ID};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// An encoded packet, shared between every queue it is broadcast to.
pub type Frame = Arc<[u8]>;

/// Prefix for continuation lines of wrapped chat.
pub const CHAT_CONTINUATION: &str = "> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeWait,
    MapTransfer,
    Ready,
    Disconnecting,
    Closed,
}

/// How a queued packet reacts to a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Dropped when the queue is full (movement relays).
    Low,
    /// Tears the session down when the queue is full.
    Normal,
}

/// Where a player stands and looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pose {
    pub position: Position,
    pub yaw: u8,
    pub pitch: u8,
}

pub struct Session {
    id: u64,
    addr: SocketAddr,
    registry: Arc<Registry>,
    outbound: mpsc::Sender<Frame>,
    state: Mutex<SessionState>,
    slot: Mutex<Option<u8>>,
    name: Mutex<String>,
    pose: Mutex<Pose>,
    last_activity: Mutex<Instant>,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Creates a session and the receiving end of its outbound queue.
    pub fn new(addr: SocketAddr, registry: Arc<Registry>, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: registry.next_session_id(),
            addr,
            registry,
            outbound,
            state: Mutex::new(SessionState::Connecting),
            slot: Mutex::new(None),
            name: Mutex::new(String::new()),
            pose: Mutex::new(Pose::default()),
            last_activity: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
            shutdown,
        });
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub fn set_name(&self, name: &str) {
        *lock(&self.name) = name.to_string();
    }

    pub fn slot(&self) -> Option<u8> {
        *lock(&self.slot)
    }

    pub(crate) fn set_slot(&self, slot: Option<u8>) {
        *lock(&self.slot) = slot;
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        trace!("session {} {:?} -> {:?}", self.id, *current, state);
        *current = state;
    }

    pub fn pose(&self) -> Pose {
        *lock(&self.pose)
    }

    fn set_pose(&self, pose: Pose) {
        *lock(&self.pose) = pose;
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Queues a frame without waiting. Returns whether it was queued.
    pub fn enqueue(&self, frame: Frame, priority: Priority) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) if priority == Priority::Low => {
                trace!("session {} queue full, dropping low priority frame", self.id);
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!("{} ({}) outbound queue overflowed", self.name(), self.addr);
                self.close(None);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close(None);
                false
            }
        }
    }

    pub fn send(&self, packet: &ServerPacket) -> bool {
        self.enqueue(Frame::from(packet.encode()), Priority::Normal)
    }

    /// Sends chat text to this session only, wrapped as needed.
    pub fn send_message(&self, text: &str) {
        for line in wrap_chat(text, CHAT_CONTINUATION) {
            self.send(&ServerPacket::Message { entity_id: 0, text: line });
        }
    }

    /// Queues a frame, waiting for room. Used by the session's own task for
    /// traffic that must not be dropped, such as the map.
    async fn send_direct(&self, packet: &ServerPacket) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }
        self.outbound
            .send(Frame::from(packet.encode()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tears the session down. Only the first call has any effect; it
    /// returns `true` for that call.
    ///
    /// With a reason, a Kick is queued ahead of the shutdown so the output
    /// task flushes it before closing the socket.
    pub fn close(&self, reason: Option<&str>) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(SessionState::Disconnecting);

        if let Some(reason) = reason {
            let kick = ServerPacket::Kick {
                reason: reason.to_string(),
            };
            let _ = self.outbound.try_send(Frame::from(kick.encode()));
        }

        let name = self.name();
        if let Some(slot) = self.registry.unregister(self) {
            self.registry.broadcast(
                &ServerPacket::RemoveEntity { entity_id: slot as i8 },
                Some(self),
                Priority::Normal,
            );
            self.registry
                .broadcast_text(&format!("&e{} left the game", name), CHAT_CONTINUATION, Some(self));
        }

        match reason {
            Some(reason) => info!("{} ({}) disconnected: {}", name, self.addr, reason),
            None => info!("{} ({}) disconnected", name, self.addr),
        }
        self.shutdown.send_replace(true);
        true
    }
}

/// Drives one connection from handshake to teardown.
pub async fn drive<S>(ctx: Arc<ServerContext>, session: Arc<Session>, outbound: mpsc::Receiver<Frame>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = split_stream(stream, ctx.config.idle_timeout, ctx.config.write_timeout);
    let output = tokio::spawn(output_loop(Arc::clone(&session), writer, outbound));

    let mut shutdown = session.shutdown_signal();
    let result = tokio::select! {
        result = run_protocol(&ctx, &session, &mut reader) => result,
        _ = wait_for_flag(&mut shutdown) => Err(SessionError::Closed),
    };
    match result {
        Ok(()) => {
            session.close(None);
        }
        Err(e) => {
            debug!("session {} ({}) ended: {}", session.id(), session.addr(), e);
            session.close(e.kick_reason());
        }
    }

    if let Err(e) = output.await {
        warn!("output task for session {} failed: {}", session.id(), e);
    }
    session.set_state(SessionState::Closed);
}

async fn output_loop<W>(session: Arc<Session>, mut writer: PacketWriter<W>, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = session.shutdown_signal();
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!("write to session {} failed: {}", session.id(), e);
                    session.close(None);
                    break;
                }
            }
            _ = wait_for_flag(&mut shutdown) => {
                // Deliver whatever was queued before the close, usually a kick.
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.close().await;
}

async fn run_protocol<R>(ctx: &ServerContext, session: &Arc<Session>, reader: &mut PacketReader<R>) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    session.set_state(SessionState::HandshakeWait);
    let hello = timeout(ctx.config.handshake_timeout, reader.read_packet::<ClientPacket>())
        .await
        .map_err(|_| SessionError::IdleTimeout)??;

    let (version, username) = match hello {
        ClientPacket::Handshake {
            protocol_version,
            username,
            ..
        } => (protocol_version, username),
        other => return Err(SessionError::UnexpectedPacket(other.opcode())),
    };
    if version != ctx.config.protocol_version {
        return Err(SessionError::VersionMismatch {
            expected: ctx.config.protocol_version,
            actual: version,
        });
    }
    validate_name(&username)?;
    session.set_name(&username);
    info!("{} connecting from {}", username, session.addr());

    session.set_state(SessionState::MapTransfer);
    session
        .send_direct(&ServerPacket::Handshake {
            protocol_version: ctx.config.protocol_version,
            server_name: ctx.config.server_name.clone(),
            motd: ctx.config.motd.clone(),
            user_type: shared::USER_TYPE_NORMAL,
        })
        .await?;
    send_map(ctx, session).await?;

    let slot = ctx.registry.try_register(session)?;
    session.set_state(SessionState::Ready);
    announce_join(ctx, session, slot);

    input_loop(ctx, session, reader).await
}

/// Player names: 1 to 16 characters of letters, digits, `_` and `.`.
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    let valid = (1..=16).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_string()))
    }
}

async fn send_map(ctx: &ServerContext, session: &Session) -> Result<(), SessionError> {
    let blocks = ctx.world.blocks();
    let stream = tokio::task::spawn_blocking(move || compress_level(&blocks))
        .await
        .map_err(|_| SessionError::Closed)??;
    let (width, height, length) = ctx.world.dimensions();

    session.send_direct(&ServerPacket::MapChunkBegin).await?;
    for chunk in level_chunks(&stream) {
        session.send_direct(&chunk).await?;
    }
    session
        .send_direct(&ServerPacket::MapChunkEnd { width, height, length })
        .await?;
    debug!("sent {} byte level to {}", stream.len(), session.name());
    Ok(())
}

fn announce_join(ctx: &ServerContext, session: &Session, slot: u8) {
    let name = session.name();
    let spawn = ctx.world.spawn();
    session.set_pose(spawn);

    session.send(&ServerPacket::AddEntity {
        entity_id: SELF_ENTITY_ID,
        name: name.clone(),
        position: spawn.position,
        yaw: spawn.yaw,
        pitch: spawn.pitch,
    });
    for (other_slot, other) in ctx.registry.snapshot() {
        if other.id() == session.id() {
            continue;
        }
        let pose = other.pose();
        session.send(&ServerPacket::AddEntity {
            entity_id: other_slot as i8,
            name: other.name(),
            position: pose.position,
            yaw: pose.yaw,
            pitch: pose.pitch,
        });
    }

    ctx.registry.broadcast(
        &ServerPacket::AddEntity {
            entity_id: slot as i8,
            name: name.clone(),
            position: spawn.position,
            yaw: spawn.yaw,
            pitch: spawn.pitch,
        },
        Some(session),
        Priority::Normal,
    );
    ctx.registry
        .broadcast_text(&format!("&e{} joined the game", name), CHAT_CONTINUATION, None);
}

async fn input_loop<R>(ctx: &ServerContext, session: &Arc<Session>, reader: &mut PacketReader<R>) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = reader.read_packet::<ClientPacket>().await?;
        session.touch();
        trace!("{} <- {:?}", session.name(), packet.opcode());

        match packet {
            ClientPacket::Handshake { .. } => return Err(SessionError::UnexpectedPacket(Opcode::Handshake)),
            ClientPacket::SetBlock { pos, mode, block } => handle_block(ctx, session, pos, mode, block),
            ClientPacket::Teleport {
                position, yaw, pitch, ..
            } => handle_move(ctx, session, Pose { position, yaw, pitch }),
            ClientPacket::Message { text, .. } => handle_chat(ctx, session, &text),
        }
    }
}

fn handle_block(ctx: &ServerContext, session: &Session, pos: BlockPos, mode: BlockMode, block: u8) {
    if let Some(current) = ctx.world.request_block_change(&session.name(), pos, mode, block) {
        // Denied: put the client's copy back.
        session.send(&ServerPacket::SetBlock { pos, block: current });
    }
}

fn handle_move(ctx: &ServerContext, session: &Session, next: Pose) {
    let previous = session.pose();
    session.set_pose(next);
    let Some(slot) = session.slot() else { return };
    if let Some(packet) = movement_packet(slot as i8, previous, next) {
        ctx.registry.broadcast(&packet, Some(session), Priority::Low);
    }
}

/// Smallest packet that moves `entity_id` from `previous` to `next`.
pub fn movement_packet(entity_id: i8, previous: Pose, next: Pose) -> Option<ServerPacket> {
    let moved = previous.position != next.position;
    let turned = previous.yaw != next.yaw || previous.pitch != next.pitch;

    match (moved, turned, next.position.delta_from(previous.position)) {
        (false, false, _) => None,
        (false, true, _) => Some(ServerPacket::Rotate {
            entity_id,
            yaw: next.yaw,
            pitch: next.pitch,
        }),
        (true, false, Some((dx, dy, dz))) => Some(ServerPacket::Move { entity_id, dx, dy, dz }),
        (true, true, Some((dx, dy, dz))) => Some(ServerPacket::MoveRotate {
            entity_id,
            dx,
            dy,
            dz,
            yaw: next.yaw,
            pitch: next.pitch,
        }),
        (true, _, None) => Some(ServerPacket::Teleport {
            entity_id,
            position: next.position,
            yaw: next.yaw,
            pitch: next.pitch,
        }),
    }
}

fn handle_chat(ctx: &ServerContext, session: &Session, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if let Some(command) = text.strip_prefix('/') {
        ctx.dispatcher.dispatch(session, command);
        return;
    }
    let line = format!("{}: {}", session.name(), text);
    info!("{}", line);
    ctx.registry.broadcast_text(&line, CHAT_CONTINUATION, None);
}
