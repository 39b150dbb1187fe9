//! Inbound data path
//!
//! [`IncomingQueue::admit`] takes one received datagram through the whole
//! admission pipeline: parsing, SRTP, the application veto, SSRC collision and
//! loop checks, sequence validation, statistics and finally insertion into the
//! [`ReorderArena`]. The application later pulls packets out by timestamp.

pub mod reorder;
pub mod sequence;

pub use reorder::{ReceivedPacket, ReorderArena};
pub use sequence::{SequencePolicy, SequenceVerdict};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::packet::RtpPacket;
use crate::session::SessionHooks;
use crate::source::{ConflictList, SourceRegistry, SourceState};
use crate::srtp::{self, CryptoContexts, CryptoFailure};
use crate::time::{duration_to_rtp_units, rtp_units_to_duration, timestamp_not_after};
use crate::{RtpSsrc, RtpTimestamp};

/// Why a received packet was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("malformed packet")]
    Malformed,

    #[error("{0}")]
    CryptoFailure(CryptoFailure),

    #[error("rejected by application")]
    Rejected,

    /// Repeated SSRC collision from the same foreign address
    #[error("SSRC collision")]
    Collision,

    /// Our own SSRC from an address already known to collide
    #[error("looped packet")]
    Loop,

    #[error("source on probation")]
    Probation,

    #[error("bad sequence number")]
    BadSequence,

    #[error("duplicate packet")]
    Duplicate,
}

/// Outcome of [`IncomingQueue::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Dropped(DropReason),

    /// A new address is sending with the local SSRC. The caller must leave
    /// with a BYE and pick a new local SSRC.
    LocalCollision,
}

/// Per-reason drop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub malformed: u64,
    pub crypto: u64,
    pub rejected: u64,
    pub collision: u64,
    pub looped: u64,
    pub probation: u64,
    pub bad_sequence: u64,
    pub duplicate: u64,
}

impl DropCounts {
    fn record(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &mut self.malformed,
            DropReason::CryptoFailure(_) => &mut self.crypto,
            DropReason::Rejected => &mut self.rejected,
            DropReason::Collision => &mut self.collision,
            DropReason::Loop => &mut self.looped,
            DropReason::Probation => &mut self.probation,
            DropReason::BadSequence => &mut self.bad_sequence,
            DropReason::Duplicate => &mut self.duplicate,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.malformed
            + self.crypto
            + self.rejected
            + self.collision
            + self.looped
            + self.probation
            + self.bad_sequence
            + self.duplicate
    }
}

/// Session state the admission pipeline reads and updates
pub struct AdmissionContext<'a> {
    pub registry: &'a mut SourceRegistry,
    pub crypto: &'a mut CryptoContexts,
    pub conflicts: &'a mut ConflictList,
    pub local_ssrc: RtpSsrc,

    /// Our own data address; packets from it are looped back, not colliding
    pub local_addr: Option<SocketAddr>,
    pub hooks: &'a dyn SessionHooks,
}

/// Reorder queue plus the validation policy applied on the way in
#[derive(Debug)]
pub struct IncomingQueue {
    arena: ReorderArena,
    policy: SequencePolicy,
    clock_rate: u32,
    end_to_end_delay: Duration,
    drops: DropCounts,
}

impl IncomingQueue {
    /// `end_to_end_delay` of zero disables the delay filter
    pub fn new(policy: SequencePolicy, clock_rate: u32, end_to_end_delay: Duration) -> Self {
        Self {
            arena: ReorderArena::new(),
            policy,
            clock_rate,
            end_to_end_delay,
            drops: DropCounts::default(),
        }
    }

    pub fn policy(&self) -> &SequencePolicy {
        &self.policy
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate;
    }

    pub fn set_end_to_end_delay(&mut self, delay: Duration) {
        self.end_to_end_delay = delay;
    }

    pub fn drop_counts(&self) -> DropCounts {
        self.drops
    }

    fn reject(&mut self, reason: DropReason, ssrc: Option<RtpSsrc>) -> Admission {
        match reason {
            DropReason::Collision | DropReason::CryptoFailure(_) => {
                warn!("Dropped packet from {:08x?}: {}", ssrc, reason)
            }
            _ => trace!("Dropped packet from {:08x?}: {}", ssrc, reason),
        }
        self.drops.record(reason);
        Admission::Dropped(reason)
    }

    /// Run one datagram through admission and queue it if it survives.
    pub fn admit(&mut self, datagram: &[u8], from: SocketAddr, now: SystemTime, ctx: AdmissionContext<'_>) -> Admission {
        let (mut packet, pad_set) = match RtpPacket::parse_deferring_padding(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("Unparseable data packet from {}: {}", from, e);
                return self.reject(DropReason::Malformed, None);
            }
        };
        if !packet.is_valid_data_header() {
            return self.reject(DropReason::Malformed, None);
        }
        let ssrc = packet.ssrc();

        match ctx.crypto.get_or_derive(ssrc) {
            Ok(Some(context)) => {
                if let Err(failure) = srtp::unprotect(&mut packet, context.as_mut()) {
                    if !ctx.hooks.on_srtp_error(ssrc, failure) {
                        return self.reject(DropReason::CryptoFailure(failure), Some(ssrc));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("No usable crypto context for {:08x}: {}", ssrc, e);
                return self.reject(DropReason::CryptoFailure(CryptoFailure::Authentication), Some(ssrc));
            }
        }
        if packet.recompute_payload_length(pad_set).is_err() {
            return self.reject(DropReason::Malformed, Some(ssrc));
        }

        if !ctx.hooks.on_rtp_packet_recv(&packet, from) {
            return self.reject(DropReason::Rejected, Some(ssrc));
        }

        if ssrc == ctx.local_ssrc {
            if ctx.local_addr == Some(from) {
                return self.reject(DropReason::Loop, Some(ssrc));
            }
            if ctx.conflicts.contains(&from) {
                ctx.conflicts.add(from, now);
                return self.reject(DropReason::Loop, Some(ssrc));
            }
            ctx.conflicts.add(from, now);
            warn!("SSRC collision: {} is sending with our SSRC {:08x}", from, ssrc);
            ctx.hooks.on_ssrc_collision(ssrc, from);
            return Admission::LocalCollision;
        }

        let seq = packet.sequence_number();
        let known = ctx.registry.is_registered(ssrc);
        if known && ctx.registry.get(ssrc).map(|r| r.state()) == Some(SourceState::Leaving) {
            // A BYE does not carry over: the source must prove itself again
            ctx.registry.revive(ssrc);
            if let Some(record) = ctx.registry.get_mut(ssrc) {
                record.start_probation(seq, self.policy.min_sequential);
            }
        }

        let (record, created) = ctx.registry.get_or_create(ssrc);
        if created {
            record.data_addr = Some(from);
            record.initial_data_time = Some(now);
            record.start_probation(seq, self.policy.min_sequential);
            ctx.hooks.on_new_source(record);
        } else {
            match record.data_addr {
                Some(addr) if addr != from => {
                    if record.prev_conflict == Some(from) {
                        return self.reject(DropReason::Collision, Some(ssrc));
                    }
                    debug!("Source {:08x} moved from {} to {}", ssrc, addr, from);
                    record.prev_conflict = Some(from);
                    record.data_addr = Some(from);
                }
                Some(_) => {}
                None => {
                    // Known from RTCP only so far
                    record.data_addr = Some(from);
                    record.start_probation(seq, self.policy.min_sequential);
                }
            }
            if record.initial_data_time.is_none() {
                record.initial_data_time = Some(now);
            }
        }

        match sequence::record_reception(&mut record.stats, seq, &self.policy) {
            SequenceVerdict::Accepted => {}
            SequenceVerdict::Probation => return self.reject(DropReason::Probation, Some(ssrc)),
            SequenceVerdict::BadSequence => return self.reject(DropReason::BadSequence, Some(ssrc)),
        }

        if record.state == SourceState::Probation {
            debug!("Source {:08x} validated", ssrc);
            record.state = SourceState::Valid;
        }

        let timestamp = packet.timestamp();
        record.stats.octets += packet.payload_size() as u64;
        record.last_packet_time = Some(now);
        record.data_since_report = true;

        let first_data = record.initial_data_timestamp.is_none();
        let initial_timestamp = *record.initial_data_timestamp.get_or_insert(timestamp);

        let since_start = record
            .initial_data_time
            .and_then(|start| now.duration_since(start).ok())
            .unwrap_or(Duration::ZERO);
        let arrival = duration_to_rtp_units(since_start, self.clock_rate);
        record.stats.update_jitter(arrival, timestamp.wrapping_sub(initial_timestamp));

        if first_data {
            ctx.registry.set_sender(ssrc, true);
        }

        let item = ReceivedPacket {
            packet,
            from,
            arrival: now,
            link_timestamp: timestamp.wrapping_sub(initial_timestamp),
        };
        if !self.arena.insert(item) {
            return self.reject(DropReason::Duplicate, Some(ssrc));
        }
        trace!("Queued seq {} from {:08x} ({} waiting)", seq, ssrc, self.arena.len());
        Admission::Queued
    }

    /// Whether a packet's end-to-end delay, judged against the source's last
    /// sender report, exceeds the configured bound.
    fn is_delayed(&self, item: &ReceivedPacket, now: SystemTime, registry: &SourceRegistry) -> bool {
        if self.end_to_end_delay.is_zero() {
            return false;
        }
        let Some(report) = registry.get(item.ssrc()).and_then(|r| r.sender_report) else {
            return false;
        };

        let reference = report.ntp_timestamp().to_system_time();
        let offset = item.packet.timestamp().wrapping_sub(report.info.rtp_timestamp) as i32;
        let packet_time = if offset >= 0 {
            reference + rtp_units_to_duration(offset as u32, self.clock_rate)
        } else {
            let before = rtp_units_to_duration(offset.unsigned_abs(), self.clock_rate);
            reference.checked_sub(before).unwrap_or(reference)
        };

        now.duration_since(packet_time)
            .map(|late| late > self.end_to_end_delay)
            .unwrap_or(false)
    }

    fn expire(&mut self, expired: Vec<ReceivedPacket>, hooks: &dyn SessionHooks) {
        for item in &expired {
            trace!("Expired seq {} from {:08x}", item.packet.sequence_number(), item.ssrc());
            hooks.on_expire_recv(item);
        }
    }

    /// Remove and return every packet whose link timestamp is at or before
    /// `timestamp`, for one source or all of them.
    ///
    /// Packets that exceed the end-to-end delay bound are discarded first and
    /// reported through [`SessionHooks::on_expire_recv`]. An unfiltered batch
    /// comes back sorted by timestamp.
    pub fn take_ready(
        &mut self,
        timestamp: RtpTimestamp,
        source: Option<RtpSsrc>,
        now: SystemTime,
        registry: &SourceRegistry,
        hooks: &dyn SessionHooks,
    ) -> Vec<ReceivedPacket> {
        let delayed: Vec<bool> = self
            .source_iter(source)
            .map(|item| self.is_delayed(item, now, registry))
            .collect();
        let mut flags = delayed.into_iter();
        let expired = self.arena.drain_where(source, |_| flags.next().unwrap_or(false));
        self.expire(expired, hooks);

        let ready = self
            .arena
            .drain_where(source, |item| timestamp_not_after(item.link_timestamp, timestamp));
        match source {
            Some(_) => ready,
            None => merge_by_age(ready, timestamp),
        }
    }

    /// Single-unit extraction: discard everything older than `timestamp`
    /// (and anything delayed beyond the bound), then return the head if it
    /// is not newer than `timestamp`.
    pub fn get_data(
        &mut self,
        timestamp: RtpTimestamp,
        source: Option<RtpSsrc>,
        now: SystemTime,
        registry: &SourceRegistry,
        hooks: &dyn SessionHooks,
    ) -> Option<ReceivedPacket> {
        let stale: Vec<bool> = self
            .source_iter(source)
            .map(|item| {
                (item.link_timestamp != timestamp && timestamp_not_after(item.link_timestamp, timestamp))
                    || self.is_delayed(item, now, registry)
            })
            .collect();
        let mut flags = stale.into_iter();
        let expired = self.arena.drain_where(source, |_| flags.next().unwrap_or(false));
        self.expire(expired, hooks);

        let head = self.arena.front(source)?;
        if timestamp_not_after(head.link_timestamp, timestamp) {
            self.arena.pop_front(source)
        } else {
            None
        }
    }

    fn source_iter(&self, source: Option<RtpSsrc>) -> Box<dyn Iterator<Item = &ReceivedPacket> + '_> {
        match source {
            Some(ssrc) => Box::new(self.arena.iter_source(ssrc)),
            None => Box::new(self.arena.iter()),
        }
    }

    /// Whether any packet is queued, for one source or overall
    pub fn is_waiting(&self, source: Option<RtpSsrc>) -> bool {
        match source {
            Some(ssrc) => self.arena.contains_source(ssrc),
            None => !self.arena.is_empty(),
        }
    }

    /// Link timestamp of the oldest queued packet
    pub fn first_timestamp(&self, source: Option<RtpSsrc>) -> Option<RtpTimestamp> {
        self.arena.front(source).map(|item| item.link_timestamp)
    }

    /// Drop all queued packets of one source
    pub fn remove_source(&mut self, ssrc: RtpSsrc) -> usize {
        self.arena.remove_source(ssrc)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Discard everything queued
    pub fn purge(&mut self) {
        debug!("Purging {} queued packets", self.arena.len());
        self.arena.clear();
    }
}

/// Interleave per-source runs so the oldest packet relative to `point`
/// comes first. Each source keeps its own queue order.
fn merge_by_age(ready: Vec<ReceivedPacket>, point: RtpTimestamp) -> Vec<ReceivedPacket> {
    let mut runs: Vec<VecDeque<ReceivedPacket>> = Vec::new();
    for item in ready {
        match runs.iter_mut().find(|run| run.front().map(|head| head.ssrc()) == Some(item.ssrc())) {
            Some(run) => run.push_back(item),
            None => runs.push(VecDeque::from([item])),
        }
    }

    let total = runs.iter().map(VecDeque::len).sum();
    let mut merged = Vec::with_capacity(total);
    loop {
        // Every packet here is at or before `point`, so the serial distance back
        // from it orders them even across a timestamp wrap.
        let oldest = runs
            .iter()
            .enumerate()
            .filter_map(|(i, run)| run.front().map(|head| (i, point.wrapping_sub(head.link_timestamp))))
            .fold(None, |best: Option<(usize, u32)>, (i, age)| match best {
                Some((_, best_age)) if best_age >= age => best,
                _ => Some((i, age)),
            });
        let Some((index, _)) = oldest else {
            break;
        };
        if let Some(item) = runs[index].pop_front() {
            merged.push(item);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::{NtpTimestamp, RtcpSenderInfo};
    use crate::packet::RtpHeader;
    use crate::session::hooks::NoopHooks;
    use crate::source::SenderSnapshot;
    use crate::srtp::{CryptoContext, SrtpContext, SrtpCryptoKey, SRTP_AES128_CM_SHA1_80};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCAL: RtpSsrc = 0x1000_0001;
    const OWN_ADDR: &str = "10.0.0.1:5004";
    const REMOTE: RtpSsrc = 0x2000_0002;

    struct Harness {
        queue: IncomingQueue,
        registry: SourceRegistry,
        crypto: CryptoContexts,
        conflicts: ConflictList,
        now: SystemTime,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                queue: IncomingQueue::new(SequencePolicy::default(), 8000, Duration::ZERO),
                registry: SourceRegistry::default(),
                crypto: CryptoContexts::new(),
                conflicts: ConflictList::new(),
                now: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000),
            }
        }

        fn admit_with(&mut self, bytes: &[u8], from: &str, hooks: &dyn SessionHooks) -> Admission {
            self.now += Duration::from_millis(20);
            let ctx = AdmissionContext {
                registry: &mut self.registry,
                crypto: &mut self.crypto,
                conflicts: &mut self.conflicts,
                local_ssrc: LOCAL,
                local_addr: Some(OWN_ADDR.parse().unwrap()),
                hooks,
            };
            self.queue.admit(bytes, from.parse().unwrap(), self.now, ctx)
        }

        fn admit(&mut self, ssrc: RtpSsrc, seq: u16) -> Admission {
            let bytes = datagram(ssrc, seq);
            self.admit_with(&bytes, "192.0.2.10:5004", &NoopHooks)
        }

        fn take_all(&mut self, source: Option<RtpSsrc>) -> Vec<u16> {
            self.queue
                .take_ready(u32::MAX / 2, source, self.now, &self.registry, &NoopHooks)
                .iter()
                .map(|p| p.packet.sequence_number())
                .collect()
        }
    }

    fn datagram(ssrc: RtpSsrc, seq: u16) -> Vec<u8> {
        RtpPacket::new_with_payload(0, seq, seq as u32 * 160, ssrc, &[seq as u8; 20])
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_probation_then_delivery() {
        let mut h = Harness::new();
        assert_eq!(h.admit(REMOTE, 100), Admission::Dropped(DropReason::Probation));
        assert_eq!(h.registry.get(REMOTE).map(|r| r.state()), Some(SourceState::Probation));
        assert_eq!(h.admit(REMOTE, 101), Admission::Queued);

        let record = h.registry.get(REMOTE).unwrap();
        assert!(record.is_valid());
        assert!(record.is_sender());
        assert_eq!(record.initial_data_timestamp, Some(101 * 160));
        assert_eq!(h.registry.senders_count(), 1);

        assert_eq!(h.admit(REMOTE, 102), Admission::Queued);
        assert_eq!(h.queue.first_timestamp(Some(REMOTE)), Some(0));
        assert_eq!(h.take_all(None), vec![101, 102]);
        assert_eq!(h.queue.drop_counts().probation, 1);
    }

    #[test]
    fn test_reordered_arrival_comes_out_in_order() {
        let mut h = Harness::new();
        h.admit(REMOTE, 98);
        h.admit(REMOTE, 99);
        assert_eq!(h.admit(REMOTE, 100), Admission::Queued);
        assert_eq!(h.admit(REMOTE, 102), Admission::Queued);
        assert_eq!(h.admit(REMOTE, 101), Admission::Queued);
        assert_eq!(h.admit(REMOTE, 101), Admission::Dropped(DropReason::Duplicate));

        assert_eq!(h.take_all(Some(REMOTE)), vec![99, 100, 101, 102]);
        assert!(!h.queue.is_waiting(None));
    }

    #[test]
    fn test_extraction_is_ordered_without_repeats() {
        let mut h = Harness::new();
        let other: RtpSsrc = 0x3000_0003;
        for seq in [10u16, 11, 14, 12, 13] {
            h.admit(REMOTE, seq);
            h.admit(other, seq + 500);
        }

        let mut seen = Vec::new();
        let mut last = 0;
        for ts in (0..=5).map(|i| i * 160) {
            for item in h.queue.take_ready(ts, None, h.now, &h.registry, &NoopHooks) {
                assert!(item.link_timestamp >= last);
                last = item.link_timestamp;
                let key = (item.ssrc(), item.packet.sequence_number());
                assert!(!seen.contains(&key));
                seen.push(key);
            }
        }
        assert!(h.queue.is_empty());
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_packet_older_than_first_delivered_keeps_its_place() {
        let mut h = Harness::new();
        let other: RtpSsrc = 0x3000_0003;
        assert_eq!(h.admit(REMOTE, 100), Admission::Dropped(DropReason::Probation));
        assert_eq!(h.admit(REMOTE, 101), Admission::Queued);
        assert_eq!(h.admit(REMOTE, 102), Admission::Queued);
        assert_eq!(h.admit(REMOTE, 99), Admission::Queued);
        h.admit(other, 7);
        h.admit(other, 8);

        // 99 sits one unit before the source's initial timestamp, so its link
        // timestamp wraps below zero.
        let first = h.queue.first_timestamp(Some(REMOTE)).unwrap();
        assert_eq!(first, 0u32.wrapping_sub(320));

        let got: Vec<(RtpSsrc, u16)> = h
            .queue
            .take_ready(1000, None, h.now, &h.registry, &NoopHooks)
            .iter()
            .map(|p| (p.ssrc(), p.packet.sequence_number()))
            .collect();
        assert_eq!(got, vec![(REMOTE, 99), (REMOTE, 101), (other, 8), (REMOTE, 102)]);
    }

    #[test]
    fn test_get_data_expires_older_units() {
        let mut h = Harness::new();
        struct Counting(AtomicUsize);
        impl SessionHooks for Counting {
            fn on_expire_recv(&self, _packet: &ReceivedPacket) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hooks = Counting(AtomicUsize::new(0));

        for seq in 0..5u16 {
            h.admit(REMOTE, seq);
        }
        // Queued link timestamps: 0, 160, 320, 480
        let item = h.queue.get_data(320, Some(REMOTE), h.now, &h.registry, &hooks).unwrap();
        assert_eq!(item.link_timestamp, 320);
        assert_eq!(hooks.0.load(Ordering::SeqCst), 2);

        assert!(h.queue.get_data(400, Some(REMOTE), h.now, &h.registry, &hooks).is_none());
        assert_eq!(h.queue.len(), 1);
    }

    #[test]
    fn test_bye_then_data_requires_probation() {
        let mut h = Harness::new();
        h.admit(REMOTE, 1);
        h.admit(REMOTE, 2);
        assert!(h.registry.get(REMOTE).unwrap().is_valid());

        assert!(h.registry.mark_leaving(REMOTE));
        assert_eq!(h.registry.members_count(), 0);

        assert_eq!(h.admit(REMOTE, 3), Admission::Dropped(DropReason::Probation));
        assert_eq!(h.registry.get(REMOTE).map(|r| r.state()), Some(SourceState::Probation));
        assert_eq!(h.registry.members_count(), 1);

        assert_eq!(h.admit(REMOTE, 4), Admission::Queued);
        assert!(h.registry.get(REMOTE).unwrap().is_valid());
    }

    #[test]
    fn test_source_address_change() {
        let mut h = Harness::new();
        h.admit(REMOTE, 1);
        h.admit(REMOTE, 2);

        // Moving to a new address is accepted once and remembered
        let moved = datagram(REMOTE, 3);
        assert_eq!(h.admit_with(&moved, "192.0.2.99:6000", &NoopHooks), Admission::Queued);
        let record = h.registry.get(REMOTE).unwrap();
        assert_eq!(record.data_addr, Some("192.0.2.99:6000".parse().unwrap()));
        assert_eq!(record.prev_conflict, Some("192.0.2.99:6000".parse().unwrap()));

        // The remembered conflicting address may not take over again
        h.registry.get_mut(REMOTE).unwrap().data_addr = Some("192.0.2.10:5004".parse().unwrap());
        let again = datagram(REMOTE, 4);
        assert_eq!(
            h.admit_with(&again, "192.0.2.99:6000", &NoopHooks),
            Admission::Dropped(DropReason::Collision)
        );
    }

    #[test]
    fn test_local_ssrc_collision_then_loop() {
        let mut h = Harness::new();
        h.registry.get_or_create(LOCAL);

        assert_eq!(h.admit(LOCAL, 7), Admission::LocalCollision);
        assert_eq!(h.conflicts.len(), 1);
        assert_eq!(h.admit(LOCAL, 8), Admission::Dropped(DropReason::Loop));
        assert!(h.queue.is_empty());

        // Our own packets coming back are a loop, never a collision
        let own = datagram(LOCAL, 9);
        assert_eq!(h.admit_with(&own, OWN_ADDR, &NoopHooks), Admission::Dropped(DropReason::Loop));
        assert_eq!(h.conflicts.len(), 1);
    }

    #[test]
    fn test_application_veto() {
        struct Veto;
        impl SessionHooks for Veto {
            fn on_rtp_packet_recv(&self, _packet: &RtpPacket, _from: SocketAddr) -> bool {
                false
            }
        }
        let mut h = Harness::new();
        let bytes = datagram(REMOTE, 1);
        assert_eq!(h.admit_with(&bytes, "192.0.2.10:5004", &Veto), Admission::Dropped(DropReason::Rejected));
        assert!(!h.registry.is_registered(REMOTE));
    }

    #[test]
    fn test_malformed_and_rtcp_on_data_port() {
        let mut h = Harness::new();
        assert_eq!(
            h.admit_with(&[0x80, 0x00, 0x01], "192.0.2.10:5004", &NoopHooks),
            Admission::Dropped(DropReason::Malformed)
        );

        let mut sr_like = datagram(REMOTE, 1);
        sr_like[1] = 200;
        assert_eq!(
            h.admit_with(&sr_like, "192.0.2.10:5004", &NoopHooks),
            Admission::Dropped(DropReason::Malformed)
        );
        assert_eq!(h.queue.drop_counts().malformed, 2);
    }

    #[test]
    fn test_srtp_packets_decrypted_on_admission() {
        let mut h = Harness::new();
        let master = SrtpCryptoKey::new(vec![9; 16], vec![3; 14]);
        let template = SrtpContext::new(0, 0, 0, SRTP_AES128_CM_SHA1_80, master).unwrap();
        h.crypto.insert(Box::new(template.clone()));

        let mut sender = template.derive_for_ssrc(REMOTE, 0, 0);
        sender.derive_keys(0).unwrap();

        for seq in [40u16, 41] {
            let header = RtpHeader::new(0, seq, seq as u32 * 160, REMOTE);
            let mut packet = RtpPacket::build(header, b"secret audio", 4, 10).unwrap();
            srtp::protect(&mut packet, sender.as_mut()).unwrap();
            let bytes = packet.as_bytes().to_vec();
            h.admit_with(&bytes, "192.0.2.10:5004", &NoopHooks);

            if seq == 41 {
                // Replayed copy
                assert_eq!(
                    h.admit_with(&bytes, "192.0.2.10:5004", &NoopHooks),
                    Admission::Dropped(DropReason::CryptoFailure(CryptoFailure::Replay))
                );
            }
        }

        let ready = h.queue.take_ready(0, Some(REMOTE), h.now, &h.registry, &NoopHooks);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].payload(), b"secret audio");
    }

    #[test]
    fn test_end_to_end_delay_filter() {
        let mut h = Harness::new();
        h.queue.set_end_to_end_delay(Duration::from_millis(100));
        h.admit(REMOTE, 1);
        h.admit(REMOTE, 2);
        h.admit(REMOTE, 3);

        // Without a sender report nothing is considered late
        let later = h.now + Duration::from_secs(10);
        assert!(h.queue.is_waiting(Some(REMOTE)));

        // SR maps RTP timestamp 320 (seq 2) to the arrival wallclock
        let info = RtcpSenderInfo {
            ntp_timestamp: NtpTimestamp::from_system_time(h.now),
            rtp_timestamp: 320,
            packet_count: 3,
            octet_count: 60,
        };
        h.registry.get_mut(REMOTE).unwrap().sender_report = Some(SenderSnapshot { info, received_at: h.now });

        let ready = h.queue.take_ready(u32::MAX / 2, Some(REMOTE), later, &h.registry, &NoopHooks);
        assert!(ready.is_empty());
        assert!(h.queue.is_empty());
    }
}
