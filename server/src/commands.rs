//! Slash commands typed into chat

use crate::session::Session;
use log::info;

/// Handles chat text that starts with `/`. `command` has the slash removed.
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, session: &Session, command: &str);
}

/// Built-in commands available without any plugins.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCommands;

impl CommandDispatcher for BasicCommands {
    fn dispatch(&self, session: &Session, command: &str) {
        let mut words = command.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        info!("{} issued /{}", session.name(), command);

        match name.as_str() {
            "players" | "who" => {
                let registry = session.registry();
                let mut names: Vec<String> = registry.snapshot().iter().map(|(_, s)| s.name()).collect();
                names.sort_by_key(|n| n.to_ascii_lowercase());
                session.send_message(&format!(
                    "&ePlayers online ({}/{}): {}",
                    names.len(),
                    registry.max_players(),
                    names.join(", ")
                ));
            }
            _ => session.send_message("&cUnknown command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::session::Frame;
    use shared::{Packet, ServerPacket};
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;

    fn messages(rx: &mut Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Ok(ServerPacket::Message { text, .. }) = ServerPacket::decode_frame(&frame) {
                out.push(text);
            }
        }
        out
    }

    #[test]
    fn test_players_lists_roster() {
        let registry = Arc::new(Registry::new(4));
        let (a, mut ra) = Session::new("127.0.0.1:1".parse().unwrap(), Arc::clone(&registry), 8);
        let (b, _rb) = Session::new("127.0.0.1:2".parse().unwrap(), Arc::clone(&registry), 8);
        a.set_name("zed");
        b.set_name("amy");
        registry.try_register(&a).unwrap();
        registry.try_register(&b).unwrap();

        BasicCommands.dispatch(&a, "players");
        assert_eq!(messages(&mut ra), vec!["&ePlayers online (2/4): amy, zed".to_string()]);
    }

    #[test]
    fn test_unknown_command() {
        let registry = Arc::new(Registry::new(4));
        let (a, mut ra) = Session::new("127.0.0.1:1".parse().unwrap(), registry, 8);
        BasicCommands.dispatch(&a, "fly now");
        assert_eq!(messages(&mut ra), vec!["&cUnknown command".to_string()]);
    }
}
