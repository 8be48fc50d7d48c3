//! Integration tests for the server core
//!
//! These tests start a real server on an ephemeral port and drive it with the
//! headless client over TCP.

use assert_approx_eq::assert_approx_eq;
use client::{Client, ClientError};
use server::{MapData, Server, ServerConfig};
use shared::{BlockMode, BlockPos, Position, ServerPacket};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);

fn scratch_dir() -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "classic-it-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn test_config(dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        max_players: 8,
        server_name: "Integration".into(),
        map_size: (32, 16, 32),
        tick_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        lockdown_grace: Duration::from_millis(5),
        map_path: dir.join("main.map"),
        backup_dir: dir.join("backups"),
        external_url_path: dir.join("externalurl.txt"),
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> (Server, SocketAddr) {
    let mut server = assert_ok!(Server::init_default(config));
    let addr = assert_ok!(server.start().await);
    (server, addr)
}

/// PROTOCOL TESTS
mod protocol_tests {
    use super::*;
    use shared::{Direction, Opcode};

    /// The frame length table is the interoperability contract
    #[test]
    fn frame_lengths_match_classic_protocol() {
        let inbound = [
            (Opcode::Handshake, 131),
            (Opcode::SetBlockRequest, 9),
            (Opcode::Teleport, 10),
            (Opcode::Message, 66),
        ];
        for (opcode, len) in inbound {
            assert_eq!(opcode.frame_len(Direction::ClientToServer), Some(len), "{:?}", opcode);
        }

        let outbound = [
            (Opcode::Handshake, 131),
            (Opcode::Ping, 1),
            (Opcode::MapChunkBegin, 1),
            (Opcode::MapChunk, 1028),
            (Opcode::MapChunkEnd, 7),
            (Opcode::SetBlock, 8),
            (Opcode::AddEntity, 74),
            (Opcode::Teleport, 10),
            (Opcode::MoveRotate, 7),
            (Opcode::Move, 5),
            (Opcode::Rotate, 4),
            (Opcode::RemoveEntity, 2),
            (Opcode::Message, 66),
            (Opcode::Kick, 65),
            (Opcode::SetPermission, 2),
        ];
        for (opcode, len) in outbound {
            assert_eq!(opcode.frame_len(Direction::ServerToClient), Some(len), "{:?}", opcode);
        }
    }

    /// Positions survive the trip through fixed-point units
    #[test]
    fn fixed_point_positions() {
        let position = Position::from_blocks(12.5, 33.0, 7.25);
        let (x, y, z) = position.to_blocks();
        assert_approx_eq!(x, 12.5, 1.0 / 32.0);
        assert_approx_eq!(y, 33.0, 1.0 / 32.0);
        assert_approx_eq!(z, 7.25, 1.0 / 32.0);
    }
}

/// ADMISSION TESTS
mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn third_client_rejected_when_full() {
        let dir = scratch_dir();
        let (mut server, addr) = start(ServerConfig {
            max_players: 2,
            ..test_config(&dir)
        })
        .await;

        let _first = Client::connect(addr, "first").await.unwrap();
        let _second = Client::connect(addr, "second").await.unwrap();

        // The map arrives before admission is decided.
        let err = assert_err!(Client::connect(addr, "third").await);
        assert!(matches!(err, ClientError::Kicked(ref reason) if reason == "Server is full!"), "{}", err);
        assert_eq!(server.context().registry.count(), 2);

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn wrong_protocol_version_kicked() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let err = assert_err!(Client::join(stream, "old", 6).await);
        assert!(matches!(err, ClientError::Kicked(ref reason) if reason == "Incompatible protocol version!"));
        assert_eq!(server.context().registry.count(), 0);

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_name_kicked() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let _steve = Client::connect(addr, "Steve").await.unwrap();
        let err = assert_err!(Client::connect(addr, "steve").await);
        assert!(matches!(err, ClientError::Kicked(ref reason) if reason == "Already logged in!"));

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn downloaded_level_matches_world() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let bot = Client::connect(addr, "mapper").await.unwrap();
        assert_eq!((bot.world.width, bot.world.height, bot.world.length), (32, 16, 32));
        assert_eq!(bot.info.name, "Integration");
        let world = &server.context().world;
        for pos in [BlockPos::new(0, 0, 0), BlockPos::new(5, 8, 9), BlockPos::new(31, 15, 31)] {
            assert_eq!(bot.world.block_at(pos), world.block_at(pos));
        }

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn join_chat_and_leave_are_relayed() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let mut alice = Client::connect(addr, "alice").await.unwrap();
        let mut bob = Client::connect(addr, "bob").await.unwrap();

        alice
            .wait_for(WAIT, |p| matches!(p, ServerPacket::AddEntity { name, .. } if name == "bob"))
            .await
            .unwrap();
        assert_eq!(alice.world.player_names(), vec!["bob".to_string()]);

        bob.chat("hi alice").await.unwrap();
        alice
            .wait_for(WAIT, |p| matches!(p, ServerPacket::Message { text, .. } if text == "bob: hi alice"))
            .await
            .unwrap();

        bob.disconnect().await.unwrap();
        alice
            .wait_for(WAIT, |p| matches!(p, ServerPacket::RemoveEntity { .. }))
            .await
            .unwrap();
        assert!(alice.world.players.is_empty());

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn long_chat_arrives_in_order() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let mut listener = Client::connect(addr, "reader").await.unwrap();
        let mut talker = Client::connect(addr, "writer").await.unwrap();

        let words: Vec<String> = (0..25).map(|i| format!("w{:02}", i)).collect();
        talker.chat(&words[..15].join(" ")).await.unwrap();

        let first = listener
            .wait_for(WAIT, |p| matches!(p, ServerPacket::Message { text, .. } if text.starts_with("writer:")))
            .await
            .unwrap();
        let ServerPacket::Message { text, .. } = first else { unreachable!() };
        assert!(text.len() <= 64);
        assert!(text.contains("w00"));

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn movement_relayed_as_relative_or_teleport() {
        let dir = scratch_dir();
        let (mut server, addr) = start(test_config(&dir)).await;

        let mut watcher = Client::connect(addr, "watcher").await.unwrap();
        let mut mover = Client::connect(addr, "mover").await.unwrap();
        watcher
            .wait_for(WAIT, |p| matches!(p, ServerPacket::AddEntity { name, .. } if name == "mover"))
            .await
            .unwrap();

        let start = mover.world.own_position.unwrap();
        let step = Position::new(start.x + 16, start.y, start.z);
        mover.move_to(step, 0, 0).await.unwrap();
        let relayed = watcher
            .wait_for(WAIT, |p| matches!(p, ServerPacket::Move { .. } | ServerPacket::MoveRotate { .. }))
            .await
            .unwrap();
        assert!(matches!(relayed, ServerPacket::Move { dx: 16, dy: 0, dz: 0, .. }));

        let far = Position::new(step.x + 500, step.y, step.z);
        mover.move_to(far, 0, 0).await.unwrap();
        watcher
            .wait_for(WAIT, |p| matches!(p, ServerPacket::Teleport { position, .. } if *position == far))
            .await
            .unwrap();

        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

/// WORLD AND LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn block_edits_propagate_and_are_saved() {
        let dir = scratch_dir();
        let config = test_config(&dir);
        let map_path = config.map_path.clone();
        let (mut server, addr) = start(config).await;

        let mut builder = Client::connect(addr, "builder").await.unwrap();
        let mut viewer = Client::connect(addr, "viewer").await.unwrap();

        let pos = BlockPos::new(10, 12, 10);
        builder
            .set_block(pos, BlockMode::Place, shared::block::STONE)
            .await
            .unwrap();
        for bot in [&mut builder, &mut viewer] {
            bot.wait_for(WAIT, |p| matches!(p, ServerPacket::SetBlock { pos: at, .. } if *at == pos))
                .await
                .unwrap();
            assert_eq!(bot.world.block_at(pos), Some(shared::block::STONE));
        }

        assert_ok!(server.shutdown("Server shutting down").await);
        let err = viewer.wait_for(WAIT, |_| false).await.unwrap_err();
        assert!(matches!(err, ClientError::Kicked(ref reason) if reason == "Server shutting down"));

        let saved: MapData = bincode::deserialize(&std::fs::read(&map_path).unwrap()).unwrap();
        assert_eq!(saved.get(pos), Some(shared::block::STONE));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn restart_loads_saved_map() {
        let dir = scratch_dir();
        let pos = BlockPos::new(4, 9, 4);

        let (mut server, addr) = start(test_config(&dir)).await;
        let mut builder = Client::connect(addr, "builder").await.unwrap();
        builder.set_block(pos, BlockMode::Place, shared::block::GRASS).await.unwrap();
        builder
            .wait_for(WAIT, |p| matches!(p, ServerPacket::SetBlock { .. }))
            .await
            .unwrap();
        assert_ok!(server.shutdown("restart").await);

        let (mut server, addr) = start(test_config(&dir)).await;
        let reader = Client::connect(addr, "reader").await.unwrap();
        assert_eq!(reader.world.block_at(pos), Some(shared::block::GRASS));
        assert_ok!(server.shutdown("done").await);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn heartbeat_publishes_external_url() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/heartbeat", http.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = http.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = "http://list.example/server/abc";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let dir = scratch_dir();
        let config = ServerConfig {
            heartbeat_urls: vec![endpoint],
            ..test_config(&dir)
        };
        let url_path = config.external_url_path.clone();
        let (mut server, _addr) = start(config).await;

        let mut url = server.external_url();
        tokio::time::timeout(WAIT, async {
            while url.borrow().is_none() {
                url.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(url.borrow().as_deref(), Some("http://list.example/server/abc"));

        assert_ok!(server.shutdown("done").await);
        let written = std::fs::read_to_string(&url_path).unwrap();
        assert_eq!(written.trim(), "http://list.example/server/abc");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
