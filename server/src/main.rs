use clap::Parser;
use log::{error, info};
use server::{Server, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "25565")]
    port: u16,

    /// Maximum number of players
    #[arg(short, long, default_value = "32")]
    max_players: usize,

    /// Name shown in the server list and on join
    #[arg(short, long, default_value = "Classic Server")]
    name: String,

    /// Message of the day shown while joining
    #[arg(long, default_value = "Welcome!")]
    motd: String,

    /// List the server publicly on heartbeat endpoints
    #[arg(long)]
    public: bool,

    /// Heartbeat endpoint; repeat for several server lists
    #[arg(long = "heartbeat")]
    heartbeat_urls: Vec<String>,

    /// World tick interval in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Autosave interval in seconds
    #[arg(long, default_value = "300")]
    autosave_secs: u64,

    /// Backup interval in seconds
    #[arg(long, default_value = "3600")]
    backup_secs: u64,

    /// Take a backup as soon as the map is loaded
    #[arg(long)]
    backup_on_startup: bool,

    /// Map file
    #[arg(long, default_value = "maps/main.map")]
    map: PathBuf,

    /// Directory for map backups
    #[arg(long, default_value = "maps/backups")]
    backup_dir: PathBuf,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            max_players: self.max_players,
            server_name: self.name,
            motd: self.motd,
            public: self.public,
            heartbeat_urls: self.heartbeat_urls,
            tick_interval: Duration::from_millis(self.tick_ms),
            autosave_interval: Duration::from_secs(self.autosave_secs),
            backup_interval: Duration::from_secs(self.backup_secs),
            backup_on_startup: self.backup_on_startup,
            map_path: self.map,
            backup_dir: self.backup_dir,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let mut server = Server::init_default(config)?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    if let Err(e) = server.shutdown("Server shutting down").await {
        error!("Shutdown failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
