use clap::Parser;
use client::{Client, ClientError};
use log::{error, info};
use shared::{ServerPacket, SELF_ENTITY_ID};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:25565")]
    server: String,

    /// Player name to join as
    #[arg(short = 'n', long, default_value = "bot")]
    name: String,

    /// Chat message to send after joining
    #[arg(short = 'm', long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Connecting to {} as {}", args.server, args.name);

    let mut bot = Client::connect(args.server.as_str(), &args.name).await?;
    info!(
        "Level is {}x{}x{}",
        bot.world.width, bot.world.height, bot.world.length
    );
    if let Some(message) = &args.message {
        bot.chat(message).await?;
    }

    loop {
        tokio::select! {
            packet = bot.next_packet() => match packet {
                Ok(ServerPacket::Message { text, .. }) => info!("{}", text),
                Ok(ServerPacket::AddEntity { entity_id, name, .. }) if entity_id != SELF_ENTITY_ID => {
                    info!("{} is here", name);
                }
                Ok(_) => {}
                Err(ClientError::Kicked(reason)) => {
                    info!("Kicked: {}", reason);
                    break;
                }
                Err(e) => {
                    error!("Connection lost: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Disconnecting");
                bot.disconnect().await?;
                break;
            }
        }
    }
    Ok(())
}
