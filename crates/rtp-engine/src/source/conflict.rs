use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Transport addresses that have collided with the local SSRC.
///
/// Packets carrying our SSRC from a listed address are our own traffic
/// looping back (or a third party that already collided) and are dropped
/// silently. Entries age out (RFC 3550 Section 8.2).
#[derive(Debug, Clone, Default)]
pub struct ConflictList {
    entries: Vec<(SocketAddr, SystemTime)>,
}

impl ConflictList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.iter().any(|(a, _)| a == addr)
    }

    /// Add an address, or refresh its timestamp if already listed.
    /// Returns `true` when the address is new.
    pub fn add(&mut self, addr: SocketAddr, now: SystemTime) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(a, _)| *a == addr) {
            entry.1 = now;
            return false;
        }
        self.entries.push((addr, now));
        true
    }

    /// Drop entries not seen for longer than `max_age`
    pub fn expire(&mut self, now: SystemTime, max_age: Duration) {
        self.entries.retain(|(_, seen)| {
            now.duration_since(*seen).map(|age| age <= max_age).unwrap_or(true)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
