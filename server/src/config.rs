//! Server configuration
//!
//! Every tunable the core reads lives in [`ServerConfig`]. The binary fills it
//! from command-line flags; embedders and tests start from `Default` and
//! override what they need.

use crate::error::ServerError;
use std::path::PathBuf;
use std::time::Duration;

/// Largest map extent accepted on any axis.
pub const MAX_MAP_EXTENT: u16 = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Networked players; slot 0 is reserved for the console on top of this.
    pub max_players: usize,
    pub protocol_version: u8,
    pub server_name: String,
    pub motd: String,
    pub public: bool,

    pub heartbeat_urls: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_error_delay: Duration,
    pub heartbeat_timeout: Duration,

    pub tick_interval: Duration,
    pub ping_interval: Duration,
    pub stats_interval: Duration,
    pub autosave_interval: Duration,
    pub backup_interval: Duration,
    pub backup_on_startup: bool,
    pub lockdown_grace: Duration,

    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub outbound_queue: usize,
    pub shutdown_timeout: Duration,

    pub map_path: PathBuf,
    pub backup_dir: PathBuf,
    pub external_url_path: PathBuf,
    /// Width, height and length of the map created when none exists.
    pub map_size: (u16, u16, u16),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 25565,
            max_players: 32,
            protocol_version: shared::PROTOCOL_VERSION,
            server_name: "Classic Server".to_string(),
            motd: "Welcome!".to_string(),
            public: false,

            heartbeat_urls: Vec::new(),
            heartbeat_interval: Duration::from_secs(45),
            heartbeat_error_delay: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),

            tick_interval: Duration::from_millis(100),
            ping_interval: Duration::from_secs(2),
            stats_interval: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(300),
            backup_interval: Duration::from_secs(3600),
            backup_on_startup: false,
            lockdown_grace: Duration::from_millis(50),

            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            outbound_queue: 512,
            shutdown_timeout: Duration::from_secs(5),

            map_path: PathBuf::from("maps/main.map"),
            backup_dir: PathBuf::from("maps/backups"),
            external_url_path: PathBuf::from("externalurl.txt"),
            map_size: (128, 64, 128),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if !(1..=127).contains(&self.max_players) {
            return Err(ServerError::Config(format!(
                "max_players must be between 1 and 127, got {}",
                self.max_players
            )));
        }
        if self.outbound_queue == 0 {
            return Err(ServerError::Config("outbound_queue must be positive".into()));
        }

        let intervals = [
            ("tick_interval", self.tick_interval),
            ("ping_interval", self.ping_interval),
            ("stats_interval", self.stats_interval),
            ("autosave_interval", self.autosave_interval),
            ("backup_interval", self.backup_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_error_delay", self.heartbeat_error_delay),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("idle_timeout", self.idle_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("write_timeout", self.write_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ServerError::Config(format!("{} must be non-zero", name)));
        }

        let (w, h, l) = self.map_size;
        if [w, h, l].iter().any(|&d| d == 0 || d > MAX_MAP_EXTENT) {
            return Err(ServerError::Config(format!(
                "map size {}x{}x{} out of range",
                w, h, l
            )));
        }
        Ok(())
    }
}
