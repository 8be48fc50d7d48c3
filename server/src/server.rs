//! Server lifecycle
//!
//! [`Server::init`] loads the world and validates configuration,
//! [`Server::start`] binds the listener and starts the scheduler and
//! heartbeats, and [`Server::shutdown`] tears everything down in an order
//! that lets the world be saved with no edits in flight.

use crate::commands::{BasicCommands, CommandDispatcher};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::heartbeat::{generate_salt, spawn_heartbeats, HeartbeatSettings, ServerStats};
use crate::listener::Listener;
use crate::registry::{Registry, RosterEvent};
use crate::scheduler::{Scheduler, TaskResult, TaskSpec};
use crate::session::Priority;
use crate::world::{BlockPolicy, DefaultBlockPolicy, FileMapStore, MapStore, World};
use log::{debug, info, warn};
use shared::ServerPacket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Shared state every session and task works against.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub world: Arc<World>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub stats: watch::Sender<ServerStats>,
    pub external_url: watch::Sender<Option<String>>,
    pub salt: String,
}

impl ServerContext {
    pub fn new(config: ServerConfig, world: World, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        let registry = Arc::new(Registry::new(config.max_players));
        let (stats, _) = watch::channel(ServerStats {
            current_players: 0,
            max_players: config.max_players,
        });
        let (external_url, _) = watch::channel(None);
        Self {
            config,
            registry,
            world: Arc::new(world),
            dispatcher,
            stats,
            external_url,
            salt: generate_salt(),
        }
    }

    /// Context over an in-memory flat map.
    #[cfg(test)]
    pub(crate) fn for_tests(config: ServerConfig) -> Arc<Self> {
        let (w, h, l) = config.map_size;
        let world = World::new(
            crate::world::MapData::flat(w, h, l).unwrap(),
            Box::new(crate::world::MemoryMapStore::default()),
            Box::new(DefaultBlockPolicy),
        )
        .unwrap();
        Arc::new(Self::new(config, world, Arc::new(BasicCommands)))
    }

    /// Applies queued block edits and sends them to every player.
    fn flush_block_updates(&self) -> usize {
        let applied = self.world.tick();
        for change in &applied {
            self.registry.broadcast(
                &ServerPacket::SetBlock {
                    pos: change.pos,
                    block: change.block,
                },
                None,
                Priority::Normal,
            );
        }
        applied.len()
    }

    fn publish_stats(&self) {
        let current = ServerStats {
            current_players: self.registry.count(),
            max_players: self.registry.max_players(),
        };
        self.stats.send_if_modified(|stats| {
            let changed = *stats != current;
            *stats = current;
            changed
        });
    }
}

pub struct Server {
    ctx: Arc<ServerContext>,
    scheduler: Scheduler,
    listener: Option<Listener>,
    heartbeats: Vec<JoinHandle<()>>,
    heartbeat_stop: watch::Sender<bool>,
    stopped: bool,
}

impl Server {
    /// Validates `config` and loads the world through `store`.
    pub fn init(
        config: ServerConfig,
        store: Box<dyn MapStore>,
        policy: Box<dyn BlockPolicy>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let world = World::load_or_create(store, policy, config.map_size)?;
        if config.backup_on_startup {
            world.backup()?;
        }

        let scheduler = Scheduler::new(config.lockdown_grace);
        let (heartbeat_stop, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(ServerContext::new(config, world, dispatcher)),
            scheduler,
            listener: None,
            heartbeats: Vec::new(),
            heartbeat_stop,
            stopped: false,
        })
    }

    /// [`Server::init`] with file storage, the default block rules and the
    /// built-in commands.
    pub fn init_default(config: ServerConfig) -> Result<Self, ServerError> {
        let store = FileMapStore::new(config.map_path.clone(), config.backup_dir.clone());
        Self::init(config, Box::new(store), Box::new(DefaultBlockPolicy), Arc::new(BasicCommands))
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    pub fn roster_events(&self) -> broadcast::Receiver<RosterEvent> {
        self.ctx.registry.subscribe()
    }

    pub fn external_url(&self) -> watch::Receiver<Option<String>> {
        self.ctx.external_url.subscribe()
    }

    /// Binds the listener, then starts maintenance and heartbeats. A bind
    /// failure is returned before any of them run. A server runs at most
    /// once.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.listener.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        if self.stopped {
            return Err(ServerError::Stopped);
        }
        let listener = Listener::bind(Arc::clone(&self.ctx)).await?;
        let addr = listener.local_addr();
        self.listener = Some(listener);

        self.schedule_builtin_tasks();
        self.scheduler.start()?;

        self.ctx.publish_stats();
        let config = &self.ctx.config;
        let settings = HeartbeatSettings {
            server_name: config.server_name.clone(),
            port: addr.port(),
            public: config.public,
            salt: self.ctx.salt.clone(),
            protocol_version: config.protocol_version,
            interval: config.heartbeat_interval,
            error_delay: config.heartbeat_error_delay,
            timeout: config.heartbeat_timeout,
            external_url_path: Some(config.external_url_path.clone()),
        };
        self.heartbeats = spawn_heartbeats(
            &config.heartbeat_urls,
            &settings,
            &self.ctx.stats.subscribe(),
            &self.ctx.external_url,
            &self.heartbeat_stop.subscribe(),
        );

        info!(
            "{} started on {} ({} players max, {} heartbeat targets)",
            config.server_name,
            addr,
            config.max_players,
            self.heartbeats.len()
        );
        Ok(addr)
    }

    fn schedule_builtin_tasks(&self) {
        let config = &self.ctx.config;

        let ctx = Arc::clone(&self.ctx);
        self.scheduler
            .add_task(TaskSpec::every("world-tick", config.tick_interval), move || {
                ctx.flush_block_updates();
                Ok(())
            });

        let ctx = Arc::clone(&self.ctx);
        self.scheduler.add_lockdown_hook("flush-block-updates", move || {
            let flushed = ctx.flush_block_updates();
            debug!("flushed {} block updates for lockdown", flushed);
            Ok(())
        });

        let ctx = Arc::clone(&self.ctx);
        self.scheduler
            .add_task(TaskSpec::every("ping", config.ping_interval), move || {
                ctx.registry.broadcast(&ServerPacket::Ping, None, Priority::Normal);
                Ok(())
            });

        let ctx = Arc::clone(&self.ctx);
        self.scheduler
            .add_task(TaskSpec::every("stats", config.stats_interval), move || {
                ctx.publish_stats();
                Ok(())
            });

        let world = Arc::clone(&self.ctx.world);
        self.scheduler
            .add_task(TaskSpec::every("autosave", config.autosave_interval), move || -> TaskResult {
                if world.save_if_dirty()? {
                    info!("Autosaved map");
                }
                Ok(())
            });

        // With backup_on_startup the first backup was already taken in init.
        let world = Arc::clone(&self.ctx.world);
        self.scheduler
            .add_task(TaskSpec::every("backup", config.backup_interval), move || -> TaskResult {
                world.backup()?;
                Ok(())
            });
    }

    /// Stops the listener and kicks everyone, then saves the world under
    /// lockdown and stops background work.
    pub async fn shutdown(&mut self, reason: &str) -> Result<(), ServerError> {
        let Some(mut listener) = self.listener.take() else {
            return Err(ServerError::NotStarted);
        };
        self.stopped = true;
        info!("Shutting down: {}", reason);

        let stragglers = listener.shutdown(reason).await;
        if stragglers > 0 {
            warn!("{} sessions still closing", stragglers);
        }
        self.ctx.registry.kick_all(reason);

        let scheduler = self.scheduler.clone();
        let timeout = self.ctx.config.shutdown_timeout;
        let guard = match tokio::task::spawn_blocking(move || scheduler.lockdown(timeout)).await? {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("saving without lockdown: {}", e);
                // The hook did not run; flush here instead.
                self.ctx.flush_block_updates();
                None
            }
        };

        let world = Arc::clone(&self.ctx.world);
        let saved = tokio::task::spawn_blocking(move || world.save()).await?;
        match &saved {
            Ok(()) => info!("Saved map"),
            Err(e) => warn!("Failed to save map: {}", e),
        }
        drop(guard);

        let scheduler = self.scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.stop()).await?;

        self.heartbeat_stop.send_replace(true);
        for task in self.heartbeats.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                warn!("heartbeat loop did not stop in time");
            }
        }

        saved?;
        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::MemoryMapStore;
    use shared::{BlockMode, BlockPos, ClientPacket, Direction, Packet};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_test::assert_ok;

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            max_players: 4,
            map_size: (16, 16, 16),
            tick_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            lockdown_grace: Duration::from_millis(5),
            ..ServerConfig::default()
        }
    }

    fn memory_server(store: &Arc<MemoryMapStore>) -> Server {
        Server::init(
            config(),
            Box::new(Arc::clone(store)),
            Box::new(DefaultBlockPolicy),
            Arc::new(BasicCommands),
        )
        .unwrap()
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<ServerPacket> {
        let mut opcode = [0u8; 1];
        stream.read_exact(&mut opcode).await.ok()?;
        let (_, len) = shared::opcode::lookup(opcode[0], Direction::ServerToClient).ok()?;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;
        ServerPacket::decode(opcode[0], &payload).ok()
    }

    async fn join(addr: SocketAddr, name: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = ClientPacket::Handshake {
            protocol_version: 7,
            username: name.into(),
            verification_key: "-".into(),
            unused: 0,
        };
        stream.write_all(&hello.encode()).await.unwrap();
        while let Some(packet) = read_packet(&mut stream).await {
            if matches!(packet, ServerPacket::AddEntity { entity_id: shared::SELF_ENTITY_ID, .. }) {
                break;
            }
        }
        stream
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let store = Arc::new(MemoryMapStore::default());
        let result = Server::init(
            ServerConfig {
                max_players: 0,
                ..config()
            },
            Box::new(store),
            Box::new(DefaultBlockPolicy),
            Arc::new(BasicCommands),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let store = Arc::new(MemoryMapStore::default());
        let mut server = memory_server(&store);
        assert!(matches!(server.shutdown("bye").await, Err(ServerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_block_edit_broadcast_and_saved_on_shutdown() {
        let store = Arc::new(MemoryMapStore::default());
        let mut server = memory_server(&store);
        let addr = assert_ok!(server.start().await);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));

        let mut editor = join(addr, "builder").await;
        let mut watcher = join(addr, "watcher").await;

        let pos = BlockPos::new(3, 12, 3);
        let edit = ClientPacket::SetBlock {
            pos,
            mode: BlockMode::Place,
            block: shared::block::STONE,
        };
        editor.write_all(&edit.encode()).await.unwrap();

        let expected = ServerPacket::SetBlock {
            pos,
            block: shared::block::STONE,
        };
        for stream in [&mut editor, &mut watcher] {
            let seen = tokio::time::timeout(Duration::from_secs(2), async {
                while let Some(packet) = read_packet(stream).await {
                    if packet == expected {
                        return true;
                    }
                }
                false
            })
            .await;
            assert_eq!(seen, Ok(true));
        }

        assert_ok!(server.shutdown("Server shutting down").await);
        assert!(!server.scheduler().is_running());
        let saved = store.last_saved().unwrap();
        assert_eq!(saved.get(pos), Some(shared::block::STONE));

        let mut kicked = false;
        while let Some(packet) = read_packet(&mut watcher).await {
            kicked |= packet
                == ServerPacket::Kick {
                    reason: "Server shutting down".into(),
                };
        }
        assert!(kicked);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown_refused() {
        let store = Arc::new(MemoryMapStore::default());
        let mut server = memory_server(&store);
        server.start().await.unwrap();
        let tasks = server.scheduler().task_count();
        assert_ok!(server.shutdown("done").await);

        assert!(matches!(server.start().await, Err(ServerError::Stopped)));
        assert!(server.local_addr().is_none());
        assert!(!server.scheduler().is_running());
        assert_eq!(server.scheduler().task_count(), tasks);
        assert!(matches!(server.shutdown("again").await, Err(ServerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_denied_edit_reverted_for_requester() {
        let store = Arc::new(MemoryMapStore::default());
        let mut server = memory_server(&store);
        let addr = server.start().await.unwrap();
        let mut editor = join(addr, "griefer").await;

        let bedrock = BlockPos::new(1, 0, 1);
        let edit = ClientPacket::SetBlock {
            pos: bedrock,
            mode: BlockMode::Destroy,
            block: 0,
        };
        editor.write_all(&edit.encode()).await.unwrap();
        let revert = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match read_packet(&mut editor).await {
                    Some(packet @ ServerPacket::SetBlock { .. }) => return Some(packet),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            revert,
            Some(ServerPacket::SetBlock {
                pos: bedrock,
                block: shared::block::BEDROCK
            })
        );
        server.shutdown("done").await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_published() {
        let store = Arc::new(MemoryMapStore::default());
        let mut server = memory_server(&store);
        let addr = server.start().await.unwrap();
        let _player = join(addr, "counted").await;

        server.context().publish_stats();
        let stats = *server.context().stats.subscribe().borrow();
        assert_eq!(
            stats,
            ServerStats {
                current_players: 1,
                max_players: 4
            }
        );
        server.shutdown("done").await.unwrap();
    }
}
