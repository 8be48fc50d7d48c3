//! # Headless Protocol Client
//!
//! A scriptable client for the classic protocol. It performs the handshake,
//! downloads and inflates the level, and then sends chat, block edits and
//! movement while keeping a local copy of the world and the other players up
//! to date from server packets.
//!
//! It exists to exercise a server end to end: the workspace integration
//! tests drive it, and the `client` binary is a quick way to check a running
//! server by hand.
//!
//! ## Module Organization
//!
//! - `network`: the connection, the join sequence and packet I/O
//! - `game`: client-side level and player tracking
//! - `error`: what can go wrong while talking to a server
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut bot = Client::connect("127.0.0.1:25565", "bot").await?;
//!     println!("{}x{}x{} level", bot.world.width, bot.world.height, bot.world.length);
//!
//!     bot.chat("hello").await?;
//!     let echo = bot
//!         .wait_for(Duration::from_secs(5), |p| matches!(p, shared::ServerPacket::Message { .. }))
//!         .await?;
//!     println!("{:?}", echo);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod game;
pub mod network;

pub use error::ClientError;
pub use game::{ClientWorld, RemotePlayer};
pub use network::{Client, ServerInfo};
