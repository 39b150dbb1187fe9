//! Reorder buffer
//!
//! Received packets sit in an arena of slots. Every occupied slot is linked
//! into two index-based doubly linked lists: the global list of all queued
//! packets and the list of its own source, which is kept in sequence order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use tracing::trace;

use crate::packet::RtpPacket;
use crate::time::seq_after;
use crate::{RtpSsrc, RtpTimestamp};

/// A validated data packet waiting for the application
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub packet: RtpPacket,

    /// Transport address it arrived from
    pub from: SocketAddr,

    pub arrival: SystemTime,

    /// Packet timestamp relative to the first timestamp seen from its source
    pub link_timestamp: RtpTimestamp,
}

impl ReceivedPacket {
    pub fn ssrc(&self) -> RtpSsrc {
        self.packet.ssrc()
    }

    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }
}

#[derive(Debug)]
struct Link {
    item: ReceivedPacket,
    prev: Option<usize>,
    next: Option<usize>,
    src_prev: Option<usize>,
    src_next: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct SourceEnds {
    first: usize,
    last: usize,
}

/// Arena-backed reorder queue
#[derive(Debug, Default)]
pub struct ReorderArena {
    slots: Vec<Option<Link>>,
    free: Vec<usize>,
    first: Option<usize>,
    last: Option<usize>,
    sources: HashMap<RtpSsrc, SourceEnds>,
    len: usize,
}

impl ReorderArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, index: usize) -> Option<&Link> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn link_mut(&mut self, index: usize) -> Option<&mut Link> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn seq_at(&self, index: usize) -> Option<u16> {
        self.link(index).map(|l| l.item.packet.sequence_number())
    }

    fn allocate(&mut self, item: ReceivedPacket) -> usize {
        let link = Link {
            item,
            prev: None,
            next: None,
            src_prev: None,
            src_next: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(link);
                index
            }
            None => {
                self.slots.push(Some(link));
                self.slots.len() - 1
            }
        }
    }

    fn append_global(&mut self, index: usize) {
        let last = self.last;
        if let Some(link) = self.link_mut(index) {
            link.prev = last;
            link.next = None;
        }
        match last {
            Some(last) => {
                if let Some(link) = self.link_mut(last) {
                    link.next = Some(index);
                }
            }
            None => self.first = Some(index),
        }
        self.last = Some(index);
    }

    fn insert_global_before(&mut self, index: usize, successor: usize) {
        let prev = self.link(successor).and_then(|l| l.prev);
        if let Some(link) = self.link_mut(index) {
            link.prev = prev;
            link.next = Some(successor);
        }
        if let Some(link) = self.link_mut(successor) {
            link.prev = Some(index);
        }
        match prev {
            Some(prev) => {
                if let Some(link) = self.link_mut(prev) {
                    link.next = Some(index);
                }
            }
            None => self.first = Some(index),
        }
    }

    /// Queue a packet in sequence order within its source.
    ///
    /// Returns `false` (and drops the packet) if a packet with the same
    /// sequence number from the same source is already queued.
    pub fn insert(&mut self, item: ReceivedPacket) -> bool {
        let ssrc = item.ssrc();
        let seq = item.packet.sequence_number();

        let Some(ends) = self.sources.get(&ssrc).copied() else {
            let index = self.allocate(item);
            self.append_global(index);
            self.sources.insert(ssrc, SourceEnds { first: index, last: index });
            self.len += 1;
            return true;
        };

        let last_seq = self.seq_at(ends.last).unwrap_or(seq);
        if seq_after(seq, last_seq) {
            let index = self.allocate(item);
            if let Some(link) = self.link_mut(index) {
                link.src_prev = Some(ends.last);
            }
            if let Some(link) = self.link_mut(ends.last) {
                link.src_next = Some(index);
            }
            self.append_global(index);
            self.sources.insert(ssrc, SourceEnds { first: ends.first, last: index });
            self.len += 1;
            return true;
        }

        // Out of order: walk back to the last packet that precedes it
        let mut cursor = Some(ends.last);
        while let Some(current) = cursor {
            let Some(current_seq) = self.seq_at(current) else { break };
            if current_seq == seq {
                trace!("Duplicate packet seq {} from {:08x}", seq, ssrc);
                return false;
            }
            if seq_after(seq, current_seq) {
                break;
            }
            cursor = self.link(current).and_then(|l| l.src_prev);
        }

        let successor = match cursor {
            Some(pred) => self.link(pred).and_then(|l| l.src_next),
            None => Some(ends.first),
        };
        let Some(successor) = successor else {
            return false;
        };

        let index = self.allocate(item);
        if let Some(link) = self.link_mut(index) {
            link.src_prev = cursor;
            link.src_next = Some(successor);
        }
        if let Some(link) = self.link_mut(successor) {
            link.src_prev = Some(index);
        }
        match cursor {
            Some(pred) => {
                if let Some(link) = self.link_mut(pred) {
                    link.src_next = Some(index);
                }
            }
            None => {
                self.sources.insert(ssrc, SourceEnds { first: index, last: ends.last });
            }
        }
        self.insert_global_before(index, successor);
        self.len += 1;
        trace!("Reordered packet seq {} from {:08x}", seq, ssrc);
        true
    }

    /// Unlink a slot from both lists and hand back its packet
    fn unlink(&mut self, index: usize) -> Option<ReceivedPacket> {
        let link = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        self.len -= 1;

        match link.prev {
            Some(prev) => {
                if let Some(l) = self.link_mut(prev) {
                    l.next = link.next;
                }
            }
            None => self.first = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(l) = self.link_mut(next) {
                    l.prev = link.prev;
                }
            }
            None => self.last = link.prev,
        }

        let ssrc = link.item.ssrc();
        if let Some(l) = link.src_prev.and_then(|p| self.link_mut(p)) {
            l.src_next = link.src_next;
        }
        if let Some(l) = link.src_next.and_then(|n| self.link_mut(n)) {
            l.src_prev = link.src_prev;
        }
        match (link.src_prev, link.src_next) {
            (None, None) => {
                self.sources.remove(&ssrc);
            }
            (prev, next) => {
                if let Some(ends) = self.sources.get_mut(&ssrc) {
                    if prev.is_none() {
                        if let Some(next) = next {
                            ends.first = next;
                        }
                    }
                    if next.is_none() {
                        if let Some(prev) = prev {
                            ends.last = prev;
                        }
                    }
                }
            }
        }

        Some(link.item)
    }

    fn first_index(&self, ssrc: Option<RtpSsrc>) -> Option<usize> {
        match ssrc {
            Some(ssrc) => self.sources.get(&ssrc).map(|ends| ends.first),
            None => self.first,
        }
    }

    fn next_index(&self, index: usize, by_source: bool) -> Option<usize> {
        self.link(index).and_then(|l| if by_source { l.src_next } else { l.next })
    }

    /// Head of the global queue, or of one source's queue
    pub fn front(&self, ssrc: Option<RtpSsrc>) -> Option<&ReceivedPacket> {
        self.first_index(ssrc).and_then(|i| self.link(i)).map(|l| &l.item)
    }

    pub fn pop_front(&mut self, ssrc: Option<RtpSsrc>) -> Option<ReceivedPacket> {
        let index = self.first_index(ssrc)?;
        self.unlink(index)
    }

    /// Remove every queued packet (globally, or of one source) matching `pred`,
    /// in list order.
    pub fn drain_where<F>(&mut self, ssrc: Option<RtpSsrc>, mut pred: F) -> Vec<ReceivedPacket>
    where
        F: FnMut(&ReceivedPacket) -> bool,
    {
        let by_source = ssrc.is_some();
        let mut taken = Vec::new();
        let mut cursor = self.first_index(ssrc);
        while let Some(index) = cursor {
            cursor = self.next_index(index, by_source);
            let matches = self.link(index).map(|l| pred(&l.item)).unwrap_or(false);
            if matches {
                if let Some(item) = self.unlink(index) {
                    taken.push(item);
                }
            }
        }
        taken
    }

    /// Queued packets in global order
    pub fn iter(&self) -> impl Iterator<Item = &ReceivedPacket> + '_ {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            let link = self.link(cursor?)?;
            cursor = link.next;
            Some(&link.item)
        })
    }

    /// Queued packets of one source in sequence order
    pub fn iter_source(&self, ssrc: RtpSsrc) -> impl Iterator<Item = &ReceivedPacket> + '_ {
        let mut cursor = self.sources.get(&ssrc).map(|ends| ends.first);
        std::iter::from_fn(move || {
            let link = self.link(cursor?)?;
            cursor = link.src_next;
            Some(&link.item)
        })
    }

    /// Drop every packet of one source
    pub fn remove_source(&mut self, ssrc: RtpSsrc) -> usize {
        self.drain_where(Some(ssrc), |_| true).len()
    }

    pub fn contains_source(&self, ssrc: RtpSsrc) -> bool {
        self.sources.contains_key(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(ssrc: RtpSsrc, seq: u16, ts: u32) -> ReceivedPacket {
        ReceivedPacket {
            packet: RtpPacket::new_with_payload(0, seq, ts, ssrc, &seq.to_be_bytes()).unwrap(),
            from: "198.51.100.7:4000".parse().unwrap(),
            arrival: SystemTime::UNIX_EPOCH,
            link_timestamp: ts,
        }
    }

    fn seqs(arena: &ReorderArena, ssrc: Option<RtpSsrc>) -> Vec<u16> {
        match ssrc {
            Some(ssrc) => arena.iter_source(ssrc).map(|p| p.packet.sequence_number()).collect(),
            None => arena.iter().map(|p| p.packet.sequence_number()).collect(),
        }
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut arena = ReorderArena::new();
        assert!(arena.insert(received(1, 100, 0)));
        assert!(arena.insert(received(1, 102, 320)));
        assert!(arena.insert(received(1, 101, 160)));

        assert_eq!(seqs(&arena, Some(1)), vec![100, 101, 102]);
        assert_eq!(seqs(&arena, None), vec![100, 101, 102]);

        let order: Vec<u16> = std::iter::from_fn(|| arena.pop_front(None))
            .map(|p| p.packet.sequence_number())
            .collect();
        assert_eq!(order, vec![100, 101, 102]);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut arena = ReorderArena::new();
        assert!(arena.insert(received(1, 10, 0)));
        assert!(arena.insert(received(1, 12, 0)));
        assert!(!arena.insert(received(1, 12, 0)));
        assert!(!arena.insert(received(1, 10, 0)));
        assert!(arena.insert(received(1, 11, 0)));
        assert!(!arena.insert(received(1, 11, 0)));
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_insert_before_first_of_source() {
        let mut arena = ReorderArena::new();
        arena.insert(received(1, 50, 0));
        arena.insert(received(2, 7, 0));
        arena.insert(received(1, 51, 0));
        arena.insert(received(1, 49, 0));

        assert_eq!(seqs(&arena, Some(1)), vec![49, 50, 51]);
        // 49 lands in front of its source successor in the global list as well
        assert_eq!(seqs(&arena, None), vec![49, 50, 7, 51]);
        assert_eq!(arena.front(Some(1)).map(|p| p.packet.sequence_number()), Some(49));
    }

    #[test]
    fn test_sequence_wrap_is_in_order() {
        let mut arena = ReorderArena::new();
        arena.insert(received(3, 65534, 0));
        arena.insert(received(3, 0, 320));
        arena.insert(received(3, 65535, 160));
        assert_eq!(seqs(&arena, Some(3)), vec![65534, 65535, 0]);
    }

    #[test]
    fn test_drain_and_slot_reuse() {
        let mut arena = ReorderArena::new();
        for seq in 0..6u16 {
            arena.insert(received(if seq % 2 == 0 { 1 } else { 2 }, seq, seq as u32 * 10));
        }

        let taken = arena.drain_where(None, |p| p.link_timestamp <= 20);
        assert_eq!(taken.iter().map(|p| p.packet.sequence_number()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(seqs(&arena, Some(1)), vec![4]);
        assert_eq!(seqs(&arena, Some(2)), vec![3, 5]);

        assert_eq!(arena.remove_source(2), 2);
        assert!(!arena.contains_source(2));
        assert_eq!(arena.len(), 1);

        arena.insert(received(2, 9, 0));
        assert_eq!(seqs(&arena, None), vec![4, 9]);
    }
}
