//! SSRC-keyed registry of session members
//!
//! Records live in an index arena. Each record is threaded on a collision
//! chain of its hash bucket (kept in ascending SSRC order so lookups stop
//! early) and on a doubly linked membership list in insertion order.

use tracing::{debug, trace};

use super::{SourceRecord, SourceState};
use crate::RtpSsrc;

/// Default number of hash buckets
pub const DEFAULT_BUCKETS: usize = 11;

#[derive(Debug)]
struct Slot {
    record: SourceRecord,
    chain_next: Option<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Session membership table
#[derive(Debug)]
pub struct SourceRegistry {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    buckets: Vec<Option<usize>>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    members: u32,
    senders: u32,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl SourceRegistry {
    /// Create a registry with `buckets` hash buckets (at least one)
    pub fn new(buckets: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; buckets.max(1)],
            head: None,
            tail: None,
            len: 0,
            members: 0,
            senders: 0,
        }
    }

    fn bucket(&self, ssrc: RtpSsrc) -> usize {
        (ssrc.wrapping_add(ssrc >> 8) as usize) % self.buckets.len()
    }

    fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Walk the bucket chain. Returns the matching slot, or the slot after
    /// which a record with `ssrc` would be inserted.
    fn locate(&self, ssrc: RtpSsrc) -> (Option<usize>, Option<usize>) {
        let mut before = None;
        let mut cursor = self.buckets[self.bucket(ssrc)];
        while let Some(index) = cursor {
            let Some(slot) = self.slot(index) else { break };
            let current = slot.record.ssrc();
            if current == ssrc {
                return (Some(index), before);
            }
            if current > ssrc {
                break;
            }
            before = Some(index);
            cursor = slot.chain_next;
        }
        (None, before)
    }

    pub fn is_registered(&self, ssrc: RtpSsrc) -> bool {
        self.locate(ssrc).0.is_some()
    }

    pub fn get(&self, ssrc: RtpSsrc) -> Option<&SourceRecord> {
        let index = self.locate(ssrc).0?;
        self.slot(index).map(|slot| &slot.record)
    }

    pub fn get_mut(&mut self, ssrc: RtpSsrc) -> Option<&mut SourceRecord> {
        let index = self.locate(ssrc).0?;
        self.slot_mut(index).map(|slot| &mut slot.record)
    }

    /// Look up a source, creating it when absent.
    ///
    /// Returns the record and whether it was created by this call.
    pub fn get_or_create(&mut self, ssrc: RtpSsrc) -> (&mut SourceRecord, bool) {
        let (found, before) = self.locate(ssrc);
        let (index, created) = match found {
            Some(index) => (index, false),
            None => (self.insert(ssrc, before), true),
        };

        // The slot was either found or just filled
        let slot = self.slots[index].get_or_insert_with(|| Slot {
            record: SourceRecord::new(ssrc),
            chain_next: None,
            prev: None,
            next: None,
        });
        (&mut slot.record, created)
    }

    fn insert(&mut self, ssrc: RtpSsrc, before: Option<usize>) -> usize {
        let bucket = self.bucket(ssrc);
        let chain_next = match before {
            Some(prev) => self.slot(prev).and_then(|s| s.chain_next),
            None => self.buckets[bucket],
        };

        let slot = Slot {
            record: SourceRecord::new(ssrc),
            chain_next,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        match before {
            Some(prev) => {
                if let Some(prev) = self.slot_mut(prev) {
                    prev.chain_next = Some(index);
                }
            }
            None => self.buckets[bucket] = Some(index),
        }

        match self.tail {
            Some(tail) => {
                if let Some(tail) = self.slot_mut(tail) {
                    tail.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);

        self.len += 1;
        self.members += 1;
        debug!("Registered source {:08x} ({} members)", ssrc, self.members);
        index
    }

    /// Remove a source from the registry. Returns `false` if it was unknown.
    pub fn remove(&mut self, ssrc: RtpSsrc) -> bool {
        let (Some(index), before) = self.locate(ssrc) else {
            return false;
        };
        let Some(slot) = self.slots[index].take() else {
            return false;
        };

        match before {
            Some(prev) => {
                if let Some(prev) = self.slot_mut(prev) {
                    prev.chain_next = slot.chain_next;
                }
            }
            None => {
                let bucket = self.bucket(ssrc);
                self.buckets[bucket] = slot.chain_next;
            }
        }

        match slot.prev {
            Some(prev) => {
                if let Some(prev) = self.slot_mut(prev) {
                    prev.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => {
                if let Some(next) = self.slot_mut(next) {
                    next.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }

        self.free.push(index);
        self.len -= 1;
        // A leaving source was already taken out of the member count
        if slot.record.state != SourceState::Leaving {
            self.members = self.members.saturating_sub(1);
        }
        if slot.record.sender {
            self.senders = self.senders.saturating_sub(1);
        }
        debug!("Removed source {:08x} ({} members)", ssrc, self.members);
        true
    }

    /// Record a BYE: the source stops counting as a member but stays known.
    pub fn mark_leaving(&mut self, ssrc: RtpSsrc) -> bool {
        let Some(record) = self.get_mut(ssrc) else {
            return false;
        };
        if record.state == SourceState::Leaving {
            return false;
        }
        record.state = SourceState::Leaving;
        self.members = self.members.saturating_sub(1);
        trace!("Source {:08x} leaving", ssrc);
        true
    }

    /// Bring a leaving source back into membership, on probation again.
    pub fn revive(&mut self, ssrc: RtpSsrc) -> bool {
        let Some(record) = self.get_mut(ssrc) else {
            return false;
        };
        if record.state != SourceState::Leaving {
            return false;
        }
        record.state = SourceState::Probation;
        self.members += 1;
        debug!("Source {:08x} rejoined after BYE", ssrc);
        true
    }

    /// Change a source's state, keeping the member count right.
    pub fn set_state(&mut self, ssrc: RtpSsrc, state: SourceState) -> bool {
        match state {
            SourceState::Leaving => self.mark_leaving(ssrc),
            _ => {
                if self.get(ssrc).map(|r| r.state) == Some(SourceState::Leaving) {
                    self.revive(ssrc);
                }
                match self.get_mut(ssrc) {
                    Some(record) => {
                        record.state = state;
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Flag or unflag a source as an active sender
    pub fn set_sender(&mut self, ssrc: RtpSsrc, sender: bool) -> bool {
        let Some(record) = self.get_mut(ssrc) else {
            return false;
        };
        if record.sender == sender {
            return false;
        }
        record.sender = sender;
        if sender {
            self.senders += 1;
        } else {
            self.senders = self.senders.saturating_sub(1);
        }
        true
    }

    /// Records in membership (insertion) order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    /// SSRCs in membership order
    pub fn ssrcs(&self) -> Vec<RtpSsrc> {
        self.iter().map(SourceRecord::ssrc).collect()
    }

    pub fn members_count(&self) -> u32 {
        self.members
    }

    pub fn senders_count(&self) -> u32 {
        self.senders
    }

    /// Records stored, including leaving ones
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        let buckets = self.buckets.len();
        *self = Self::new(buckets);
    }
}

/// Iterator over the membership list
pub struct Iter<'a> {
    registry: &'a SourceRegistry,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a SourceRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.registry.slot(self.cursor?)?;
        self.cursor = slot.next;
        Some(&slot.record)
    }
}
