//! Player roster
//!
//! A fixed array of `max_players + 1` slots behind a single lock. Slot 0 is the
//! console and never holds a network session, so slot numbers double as the
//! entity ids other clients see. Broadcasts copy the occupied slots out of
//! the lock before touching any session queue.

use crate::error::RegistryError;
use crate::session::{Frame, Priority, Session};
use crate::utils::lock;
use log::{debug, info};
use shared::text::wrap_chat;
use shared::{Packet, ServerPacket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Slot reserved for the non-networked console actor.
pub const CONSOLE_SLOT: u8 = 0;

/// Change in who is online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    Joined { slot: u8, name: String },
    Left { slot: u8, name: String },
}

struct Roster {
    slots: Vec<Option<Arc<Session>>>,
    count: usize,
}

pub struct Registry {
    max_players: usize,
    roster: Mutex<Roster>,
    events: broadcast::Sender<RosterEvent>,
    next_session_id: AtomicU64,
}

impl Registry {
    pub fn new(max_players: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            max_players,
            roster: Mutex::new(Roster {
                slots: vec![None; max_players + 1],
                count: 0,
            }),
            events,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Number of admitted sessions.
    pub fn count(&self) -> usize {
        lock(&self.roster).count
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }

    /// Admits `session` into the lowest free slot. A session that has
    /// started closing is never admitted.
    pub fn try_register(&self, session: &Arc<Session>) -> Result<u8, RegistryError> {
        let name = session.name();
        let slot = {
            let mut roster = lock(&self.roster);
            if session.is_closing() {
                return Err(RegistryError::Closed);
            }

            let taken = roster
                .slots
                .iter()
                .flatten()
                .any(|s| s.id() == session.id() || s.name().eq_ignore_ascii_case(&name));
            if taken {
                return Err(RegistryError::DuplicateName);
            }

            let free = roster
                .slots
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, s)| s.is_none())
                .map(|(i, _)| i);
            let Some(index) = free else {
                return Err(RegistryError::Full);
            };

            roster.slots[index] = Some(Arc::clone(session));
            roster.count += 1;
            session.set_slot(Some(index as u8));
            index as u8
        };

        info!("{} admitted to slot {} ({}/{})", name, slot, self.count(), self.max_players);
        let _ = self.events.send(RosterEvent::Joined { slot, name });

        // close() raced the insert; whichever side unregisters first wins.
        if session.is_closing() {
            self.unregister(session);
            return Err(RegistryError::Closed);
        }
        Ok(slot)
    }

    /// Removes `session` if present and returns the slot it held.
    pub fn unregister(&self, session: &Session) -> Option<u8> {
        let slot = {
            let mut roster = lock(&self.roster);
            let index = roster
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.id() == session.id()))?;
            roster.slots[index] = None;
            roster.count -= 1;
            session.set_slot(None);
            index as u8
        };

        let name = session.name();
        info!("{} left slot {}", name, slot);
        let _ = self.events.send(RosterEvent::Left { slot, name });
        Some(slot)
    }

    /// Point-in-time copy of the occupied slots.
    pub fn snapshot(&self) -> Vec<(u8, Arc<Session>)> {
        lock(&self.roster)
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as u8, Arc::clone(s))))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Session>> {
        lock(&self.roster)
            .slots
            .iter()
            .flatten()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Enqueues `packet` on every admitted session except `except`.
    /// Returns the number of sessions that accepted it.
    pub fn broadcast(&self, packet: &ServerPacket, except: Option<&Session>, priority: Priority) -> usize {
        self.broadcast_frame(Frame::from(packet.encode()), except, priority)
    }

    pub fn broadcast_frame(&self, frame: Frame, except: Option<&Session>, priority: Priority) -> usize {
        let targets = self.snapshot();
        let except_id = except.map(Session::id);

        let delivered = targets
            .iter()
            .filter(|(_, s)| Some(s.id()) != except_id)
            .filter(|(_, s)| s.enqueue(Frame::clone(&frame), priority))
            .count();
        debug!("broadcast opcode 0x{:02x} to {} sessions", frame.first().copied().unwrap_or(0), delivered);
        delivered
    }

    /// Sends chat text, wrapping it over several messages when it does not
    /// fit one. Returns the number of lines sent.
    pub fn broadcast_text(&self, text: &str, prefix: &str, except: Option<&Session>) -> usize {
        let lines = wrap_chat(text, prefix);
        for line in &lines {
            let packet = ServerPacket::Message {
                entity_id: 0,
                text: line.clone(),
            };
            self.broadcast(&packet, except, Priority::Normal);
        }
        lines.len()
    }

    /// Closes every admitted session with `reason`.
    pub fn kick_all(&self, reason: &str) -> usize {
        let targets = self.snapshot();
        for (_, session) in &targets {
            session.close(Some(reason));
        }
        targets.len()
    }
}
