//! # Classic Server Core
//!
//! The multiplayer core of a classic block-game server. It accepts TCP
//! clients, speaks the fixed-size protocol from the `shared` crate, keeps the
//! roster of connected players and relays moves, block edits, chat, joins and
//! leaves to everyone else.
//!
//! ## Architecture
//!
//! ### Sessions
//! Every connection is driven by an input task and an output task. The input
//! task decodes one packet at a time and only reaches other players through
//! the registry and the world. The output task drains the session's own
//! bounded queue, so one slow client never holds up delivery to the others.
//!
//! ### Registry
//! A fixed table of player slots behind one lock. Broadcasts copy the occupied
//! slots out of the lock and then enqueue onto each session's queue.
//!
//! ### Scheduler
//! A single dedicated thread runs world ticks, pings, autosaves, backups and
//! heartbeat statistics. Its lockdown protocol quiesces maintenance work so
//! the world can be saved with no edits in flight.
//!
//! ### Heartbeats
//! One async loop per server list endpoint, independent of the scheduler,
//! retrying forever on failure.
//!
//! ## Module Organization
//!
//! - `connection`: framed reads and writes over a byte stream
//! - `session`: per-client state machine and handlers
//! - `registry`: roster, admission control and broadcast
//! - `world`: block grid, pending edits and map persistence
//! - `scheduler`: maintenance thread and lockdown
//! - `heartbeat`: server list announcements
//! - `listener`: accept loop and connection shutdown
//! - `server`: lifecycle tying the pieces together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 25565,
//!         max_players: 16,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Loads maps/main.map, or creates a flat map on first run
//!     let mut server = Server::init_default(config)?;
//!     let addr = server.start().await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown("Server shutting down").await?;
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod utils;
pub mod world;

pub use commands::{BasicCommands, CommandDispatcher};
pub use config::ServerConfig;
pub use error::{ServerError, SessionError};
pub use registry::{Registry, RosterEvent};
pub use server::{Server, ServerContext};
pub use session::{Priority, Session, SessionState};
pub use world::{BlockPolicy, DefaultBlockPolicy, FileMapStore, MapData, MapStore, MemoryMapStore, World};
