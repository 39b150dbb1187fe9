//! RTCP engine
//!
//! Schedules compound reports with timer and reverse reconsideration
//! (RFC 3550 Section 6.3), builds SR/RR + SDES compounds from the source
//! registry, applies received compounds to it and handles BYE, including the
//! back-off for large sessions.
//!
//! The engine does no I/O. The session hands it received datagrams and sends
//! what it builds.

pub mod interval;

pub use interval::{compute_interval, deterministic_interval, IntervalParams};

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::packet::rtcp::{
    NtpTimestamp, RtcpCompoundPacket, RtcpGoodbye, RtcpPacket, RtcpReceiverReport, RtcpReportBlock,
    RtcpSdesChunk, RtcpSdesItem, RtcpSdesItemType, RtcpSenderInfo, RtcpSenderReport, RtcpSourceDescription,
    RTCP_HEADER_SIZE, RTCP_MAX_REPORT_BLOCKS,
};
use crate::session::config::{RtcpConfig, SdesConfig};
use crate::session::SessionHooks;
use crate::source::{ConflictList, ReceiverSnapshot, SenderSnapshot, SourceRegistry, SourceState};
use crate::time::duration_to_dlsr;
use crate::{Result, RtpSsrc, RtpTimestamp};

use interval::{INITIAL_AVG_SIZE, LOWER_HEADERS_SIZE, TIMEOUT_MULTIPLIER};

/// Sessions larger than this hold their BYE back (RFC 3550 Section 6.3.7)
pub const BYE_BACKOFF_MEMBERS: u32 = 50;

/// Local sending state carried in sender reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderState {
    pub packet_count: u32,
    pub octet_count: u32,

    /// Wire RTP timestamp matching the report's wallclock time
    pub rtp_timestamp: RtpTimestamp,
}

/// Session state touched while applying a received compound
pub struct ControlContext<'a> {
    pub registry: &'a mut SourceRegistry,
    pub conflicts: &'a mut ConflictList,
    pub local_ssrc: RtpSsrc,

    /// Our own control address; packets from it are looped back
    pub local_addr: Option<SocketAddr>,
    pub hooks: &'a dyn SessionHooks,
}

/// Outcome of [`RtcpEngine::take_in_control_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAdmission {
    Processed,

    /// Failed the compound validity checks
    Malformed,

    /// Our own SSRC from an address already known to collide
    Loop,

    /// A new address is reporting with the local SSRC
    LocalCollision,
}

/// When a BYE may go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByeSchedule {
    /// Nothing was ever sent, so no BYE is due
    Never,
    Immediate,

    /// Held back; call [`RtcpEngine::bye_reconsideration`] at this time
    Deferred(SystemTime),
}

/// A compound report ready for the wire
#[derive(Debug, Clone)]
pub struct ControlReport {
    pub bytes: Bytes,

    /// Sources removed for inactivity while the report was produced
    pub expired: Vec<RtpSsrc>,
}

enum SourceCheck {
    Accept,
    Skip,
    Loop,
    LocalCollision,
}

/// RTCP scheduling state and compound packet handling
#[derive(Debug)]
pub struct RtcpEngine {
    config: RtcpConfig,

    /// Last transmission
    tp: SystemTime,
    /// Next scheduled transmission
    tn: SystemTime,
    pmembers: u32,
    avg_rtcp_size: f64,
    initial: bool,
    we_sent: bool,
    last_packet_count: u32,
    reports_sent: u32,
    next_sdes_item: usize,

    /// Members counted while a BYE is held back
    bye_members: Option<u32>,
}

impl RtcpEngine {
    /// Create an engine whose first report is scheduled from `now`
    pub fn new(config: RtcpConfig, now: SystemTime) -> Self {
        let mut engine = Self {
            config,
            tp: now,
            tn: now,
            pmembers: 1,
            avg_rtcp_size: INITIAL_AVG_SIZE,
            initial: true,
            we_sent: false,
            last_packet_count: 0,
            reports_sent: 0,
            next_sdes_item: 0,
            bye_members: None,
        };
        engine.tn = now + engine.interval(1, 0);
        engine
    }

    fn params(&self, members: u32, senders: u32) -> IntervalParams {
        let (members, senders) = match self.bye_members {
            Some(count) => (count, 0),
            None => (members, senders),
        };
        IntervalParams {
            members,
            senders,
            we_sent: self.we_sent,
            initial: self.initial,
            avg_rtcp_size: self.avg_rtcp_size,
            session_bandwidth: self.config.session_bandwidth,
            control_fraction: self.config.control_fraction,
            min_interval: self.config.min_interval,
        }
    }

    /// Randomized interval for the given membership
    pub fn interval(&self, members: u32, senders: u32) -> Duration {
        compute_interval(&self.params(members, senders))
    }

    pub fn deterministic_interval(&self, members: u32, senders: u32) -> Duration {
        deterministic_interval(&self.params(members, senders))
    }

    pub fn next_transmission(&self) -> SystemTime {
        self.tn
    }

    pub fn previous_transmission(&self) -> SystemTime {
        self.tp
    }

    pub fn pmembers(&self) -> u32 {
        self.pmembers
    }

    pub fn avg_rtcp_size(&self) -> f64 {
        self.avg_rtcp_size
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn reports_sent(&self) -> u32 {
        self.reports_sent
    }

    pub fn config(&self) -> &RtcpConfig {
        &self.config
    }

    /// Fold one compound's size into the running average
    pub fn update_avg_size(&mut self, len: usize) {
        let size = (len + LOWER_HEADERS_SIZE) as f64;
        self.avg_rtcp_size += (size - self.avg_rtcp_size) / 16.0;
    }

    /// Recompute the next transmission time from the last one. Returns
    /// `true`, and records `now` as the last transmission, when it has
    /// arrived.
    pub fn timer_reconsideration(&mut self, now: SystemTime, members: u32, senders: u32) -> bool {
        self.tn = self.tp + self.interval(members, senders);
        if now >= self.tn {
            self.tp = now;
            true
        } else {
            trace!("Timer reconsideration moved the next report to {:?}", self.tn);
            false
        }
    }

    /// Pull the schedule in after members left (RFC 3550 Section 6.3.4)
    pub fn reverse_reconsideration(&mut self, now: SystemTime, members: u32) {
        if members < self.pmembers && self.pmembers > 0 {
            let ratio = members as f64 / self.pmembers as f64;
            self.tn = scale_around(now, self.tn, ratio);
            self.tp = scale_around(now, self.tp, ratio);
            debug!("Reverse reconsideration: {} -> {} members", self.pmembers, members);
        }
        self.pmembers = members;
    }

    fn schedule_sdes_item(&mut self, sdes: &SdesConfig) -> Option<(RtcpSdesItemType, String)> {
        let rotation = RtcpSdesItemType::ROTATION;
        for step in 0..rotation.len() {
            let index = (self.next_sdes_item + step) % rotation.len();
            if let Some(value) = sdes.item(rotation[index]) {
                self.next_sdes_item = (index + 1) % rotation.len();
                return Some((rotation[index], value.to_string()));
            }
        }
        None
    }

    fn local_sdes(&mut self, local_ssrc: RtpSsrc, sdes: &SdesConfig) -> RtcpSourceDescription {
        let mut chunk = RtcpSdesChunk::new(local_ssrc);
        chunk.add_item(RtcpSdesItem::cname(&sdes.cname));
        if let Some((item, value)) = self.schedule_sdes_item(sdes) {
            chunk.add_item(RtcpSdesItem::new(item, Bytes::from(value.into_bytes())));
        }
        let mut description = RtcpSourceDescription::new();
        description.add_chunk(chunk);
        description
    }

    fn report_block(registry: &mut SourceRegistry, ssrc: RtpSsrc, now: SystemTime) -> Option<RtcpReportBlock> {
        let record = registry.get_mut(ssrc)?;
        let (lsr, dlsr) = match record.sender_report {
            Some(report) => {
                let delay = now.duration_since(report.received_at).unwrap_or(Duration::ZERO);
                (report.ntp_timestamp().to_u32(), duration_to_dlsr(delay))
            }
            None => (0, 0),
        };
        let block = record.stats.report_block(ssrc, lsr, dlsr);
        record.last_fraction_lost = block.fraction_lost;
        record.data_since_report = false;
        Some(block)
    }

    /// Build the next compound report: SR when data went out since the last
    /// report, RR otherwise, then one SDES chunk for the local source.
    ///
    /// Report blocks cover valid sources that sent data since the last
    /// report. Past 31 blocks they continue in chained RRs, as long as the
    /// compound stays within the path MTU.
    pub fn build_report(
        &mut self,
        now: SystemTime,
        sender: SenderState,
        registry: &mut SourceRegistry,
        local_ssrc: RtpSsrc,
        sdes: &SdesConfig,
    ) -> RtcpCompoundPacket {
        let send_sr = sender.packet_count != self.last_packet_count;
        self.last_packet_count = sender.packet_count;
        self.we_sent = send_sr;
        registry.set_sender(local_ssrc, send_sr);

        let description = self.local_sdes(local_ssrc, sdes);
        let sdes_size = RTCP_HEADER_SIZE + description.size();
        let first_size = if send_sr {
            RTCP_HEADER_SIZE + 4 + RtcpSenderInfo::SIZE
        } else {
            RTCP_HEADER_SIZE + 4
        };
        let mut budget = self
            .config
            .path_mtu
            .saturating_sub(LOWER_HEADERS_SIZE + sdes_size + first_size);

        let candidates: Vec<RtpSsrc> = registry
            .iter()
            .filter(|r| r.ssrc() != local_ssrc && r.is_valid() && r.data_since_report)
            .map(|r| r.ssrc())
            .collect();

        let mut groups: Vec<Vec<RtcpReportBlock>> = vec![Vec::new()];
        for ssrc in candidates {
            let full = groups.last().map(|g| g.len() >= RTCP_MAX_REPORT_BLOCKS).unwrap_or(false);
            if full {
                if budget < RTCP_HEADER_SIZE + 4 + RtcpReportBlock::SIZE {
                    break;
                }
                budget -= RTCP_HEADER_SIZE + 4;
                groups.push(Vec::new());
            }
            if budget < RtcpReportBlock::SIZE {
                break;
            }
            if let Some(block) = Self::report_block(registry, ssrc, now) {
                budget -= RtcpReportBlock::SIZE;
                if let Some(group) = groups.last_mut() {
                    group.push(block);
                }
            }
        }

        let mut compound = RtcpCompoundPacket::new();
        let mut groups = groups.into_iter();
        let first_blocks = groups.next().unwrap_or_default();
        if send_sr {
            let info = RtcpSenderInfo {
                ntp_timestamp: NtpTimestamp::from_system_time(now),
                rtp_timestamp: sender.rtp_timestamp,
                packet_count: sender.packet_count,
                octet_count: sender.octet_count,
            };
            let mut sr = RtcpSenderReport::new(local_ssrc, info);
            sr.report_blocks = first_blocks;
            compound.add(RtcpPacket::SenderReport(sr));
        } else {
            compound.add(RtcpPacket::ReceiverReport(RtcpReceiverReport::with_blocks(local_ssrc, first_blocks)));
        }
        for blocks in groups {
            compound.add(RtcpPacket::ReceiverReport(RtcpReceiverReport::with_blocks(local_ssrc, blocks)));
        }
        compound.add(RtcpPacket::SourceDescription(description));
        compound
    }

    /// Check the reporting SSRC of one sub-packet against its origin
    fn check_source(&self, ssrc: RtpSsrc, from: SocketAddr, now: SystemTime, ctx: &mut ControlContext<'_>) -> SourceCheck {
        if ssrc == ctx.local_ssrc {
            if ctx.local_addr == Some(from) {
                return SourceCheck::Loop;
            }
            if ctx.conflicts.contains(&from) {
                ctx.conflicts.add(from, now);
                return SourceCheck::Loop;
            }
            ctx.conflicts.add(from, now);
            warn!("SSRC collision: {} is reporting with our SSRC {:08x}", from, ssrc);
            ctx.hooks.on_ssrc_collision(ssrc, from);
            return SourceCheck::LocalCollision;
        }

        let (record, created) = ctx.registry.get_or_create(ssrc);
        record.last_rtcp_time = Some(now);
        if created {
            record.control_addr = Some(from);
            ctx.hooks.on_new_source(record);
            return SourceCheck::Accept;
        }
        match record.control_addr {
            None => {
                record.control_addr = Some(from);
                SourceCheck::Accept
            }
            Some(addr) if addr == from => SourceCheck::Accept,
            Some(addr) => {
                if record.prev_conflict == Some(from) {
                    warn!("Dropping RTCP from {}: {:08x} already reports from {}", from, ssrc, addr);
                    return SourceCheck::Skip;
                }
                debug!("Source {:08x} now reports from {} instead of {}", ssrc, from, addr);
                record.prev_conflict = Some(from);
                record.control_addr = Some(from);
                SourceCheck::Accept
            }
        }
    }

    fn store_blocks(ctx: &mut ControlContext<'_>, reporter: RtpSsrc, blocks: &[RtcpReportBlock], now: SystemTime) {
        for block in blocks.iter().filter(|b| b.ssrc == ctx.local_ssrc) {
            if let Some(record) = ctx.registry.get_mut(reporter) {
                record.receiver_report = Some(ReceiverSnapshot {
                    block: block.clone(),
                    received_at: now,
                });
            }
        }
    }

    fn apply_sdes(ctx: &mut ControlContext<'_>, description: &RtcpSourceDescription, now: SystemTime) {
        for chunk in &description.chunks {
            if chunk.ssrc == ctx.local_ssrc {
                continue;
            }
            let (record, created) = ctx.registry.get_or_create(chunk.ssrc);
            record.last_rtcp_time = Some(now);
            let mut cname = false;
            for item in &chunk.items {
                if item.item_type == RtcpSdesItemType::End {
                    continue;
                }
                record.participant.set(item.item_type, item.value_str());
                cname |= item.item_type == RtcpSdesItemType::CName;
            }
            if created {
                ctx.hooks.on_new_source(record);
            }
            if cname && record.state() == SourceState::Probation {
                ctx.registry.set_state(chunk.ssrc, SourceState::Valid);
            }
            if let Some(record) = ctx.registry.get(chunk.ssrc) {
                ctx.hooks.on_got_sdes_chunk(record, chunk);
            }
        }
    }

    fn apply_bye(&mut self, ctx: &mut ControlContext<'_>, bye: &RtcpGoodbye, now: SystemTime) {
        for &ssrc in &bye.sources {
            if ssrc == ctx.local_ssrc || !ctx.registry.is_registered(ssrc) {
                continue;
            }
            ctx.hooks.on_got_goodbye(ssrc, bye.reason.as_deref());
            if ctx.registry.mark_leaving(ssrc) {
                debug!("Source {:08x} said goodbye: {:?}", ssrc, bye.reason);
            }
            self.reverse_reconsideration(now, ctx.registry.members_count());
        }
    }

    /// Apply one received compound packet.
    ///
    /// Each sub-packet is first checked for SSRC collisions on its reporting
    /// source. While a BYE is held back only BYE packets are counted.
    pub fn take_in_control_packet(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: SystemTime,
        mut ctx: ControlContext<'_>,
    ) -> ControlAdmission {
        let compound = match RtcpCompoundPacket::parse(datagram) {
            Ok(compound) => compound,
            Err(e) => {
                trace!("Dropped malformed RTCP from {}: {}", from, e);
                return ControlAdmission::Malformed;
            }
        };

        if let Some(count) = self.bye_members.as_mut() {
            for packet in &compound.packets {
                if let RtcpPacket::Goodbye(bye) = packet {
                    *count += bye.sources.len() as u32;
                    for &ssrc in &bye.sources {
                        ctx.hooks.on_got_goodbye(ssrc, bye.reason.as_deref());
                    }
                }
            }
            return ControlAdmission::Processed;
        }

        for packet in &compound.packets {
            let reporter = match packet {
                RtcpPacket::SenderReport(sr) => Some(sr.ssrc),
                RtcpPacket::ReceiverReport(rr) => Some(rr.ssrc),
                RtcpPacket::SourceDescription(sdes) => sdes.chunks.first().map(|c| c.ssrc),
                RtcpPacket::Goodbye(bye) => bye.sources.first().copied(),
                RtcpPacket::ApplicationDefined(app) => Some(app.ssrc),
                RtcpPacket::Unknown { packet_type, .. } => {
                    trace!("Ignoring RTCP packet type {}", packet_type);
                    None
                }
            };
            let Some(reporter) = reporter else { continue };

            match self.check_source(reporter, from, now, &mut ctx) {
                SourceCheck::Accept => {}
                SourceCheck::Skip => continue,
                SourceCheck::Loop => return ControlAdmission::Loop,
                SourceCheck::LocalCollision => return ControlAdmission::LocalCollision,
            }

            match packet {
                RtcpPacket::SenderReport(sr) => {
                    if let Some(record) = ctx.registry.get_mut(sr.ssrc) {
                        record.sender_report = Some(SenderSnapshot {
                            info: sr.sender_info,
                            received_at: now,
                        });
                    }
                    ctx.hooks.on_got_sr(sr.ssrc, sr);
                    Self::store_blocks(&mut ctx, sr.ssrc, &sr.report_blocks, now);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    ctx.hooks.on_got_rr(rr.ssrc, rr);
                    Self::store_blocks(&mut ctx, rr.ssrc, &rr.report_blocks, now);
                }
                RtcpPacket::SourceDescription(sdes) => Self::apply_sdes(&mut ctx, sdes, now),
                RtcpPacket::Goodbye(bye) => self.apply_bye(&mut ctx, bye, now),
                RtcpPacket::ApplicationDefined(app) => ctx.hooks.on_got_app(app),
                RtcpPacket::Unknown { .. } => {}
            }
        }

        self.update_avg_size(datagram.len());
        ControlAdmission::Processed
    }

    /// Remove members silent for `TIMEOUT_MULTIPLIER` intervals and demote
    /// senders quiet for two (RFC 3550 Section 6.3.5).
    pub fn expire_sources(&mut self, now: SystemTime, registry: &mut SourceRegistry, local_ssrc: RtpSsrc) -> Vec<RtpSsrc> {
        let t = self.deterministic_interval(registry.members_count(), registry.senders_count());
        let member_timeout = t * TIMEOUT_MULTIPLIER;
        let sender_timeout = t * 2;
        let silent_for = |last: Option<SystemTime>| last.and_then(|l| now.duration_since(l).ok());

        let mut expired = Vec::new();
        let mut quiet = Vec::new();
        for record in registry.iter().filter(|r| r.ssrc() != local_ssrc) {
            if silent_for(record.last_activity()).map_or(false, |d| d > member_timeout) {
                expired.push(record.ssrc());
            } else if record.is_sender() && silent_for(record.last_packet_time).map_or(false, |d| d > sender_timeout) {
                quiet.push(record.ssrc());
            }
        }

        for ssrc in quiet {
            trace!("Source {:08x} is no longer a sender", ssrc);
            registry.set_sender(ssrc, false);
        }
        for &ssrc in &expired {
            debug!("Source {:08x} timed out", ssrc);
            registry.remove(ssrc);
        }
        expired
    }

    /// Periodic transmission check.
    ///
    /// Once the scheduled time has arrived and timer reconsideration agrees,
    /// builds the next report, expires stale sources and schedules the next
    /// transmission. Returns `None` when nothing is due.
    pub fn control_transmission_service(
        &mut self,
        now: SystemTime,
        sender: SenderState,
        registry: &mut SourceRegistry,
        local_ssrc: RtpSsrc,
        sdes: &SdesConfig,
    ) -> Result<Option<ControlReport>> {
        if now < self.tn || self.bye_members.is_some() {
            return Ok(None);
        }
        if !self.timer_reconsideration(now, registry.members_count(), registry.senders_count()) {
            return Ok(None);
        }

        let report = self.build_report(now, sender, registry, local_ssrc, sdes);
        let bytes = report.serialize()?;
        self.update_avg_size(bytes.len());
        self.reports_sent = self.reports_sent.wrapping_add(1);
        self.initial = false;

        let expired = self.expire_sources(now, registry, local_ssrc);
        let members = registry.members_count();
        self.tp = now;
        self.tn = now + self.interval(members, registry.senders_count());
        self.pmembers = members;
        trace!("Sent {} byte report, next at {:?}", bytes.len(), self.tn);

        Ok(Some(ControlReport { bytes, expired }))
    }

    /// Empty RR followed by a BYE for the local source
    pub fn build_bye(&self, local_ssrc: RtpSsrc, reason: Option<&str>) -> RtcpCompoundPacket {
        let mut compound = RtcpCompoundPacket::new();
        compound.add(RtcpPacket::ReceiverReport(RtcpReceiverReport::new(local_ssrc)));
        let bye = match reason {
            Some(reason) => RtcpGoodbye::new_with_reason(local_ssrc, reason),
            None => RtcpGoodbye::new_for_source(local_ssrc),
        };
        compound.add(RtcpPacket::Goodbye(bye));
        compound
    }

    /// Decide when the BYE for the local source may go out.
    ///
    /// No BYE is due when neither data nor reports were ever sent. Sessions
    /// above [`BYE_BACKOFF_MEMBERS`] restart the schedule as if the local
    /// source had just joined and count only BYE packets until timer
    /// reconsideration allows the send.
    pub fn schedule_bye(&mut self, now: SystemTime, members: u32, packets_sent: u32, reason: Option<&str>) -> ByeSchedule {
        if packets_sent == 0 && self.reports_sent == 0 {
            return ByeSchedule::Never;
        }
        if members <= BYE_BACKOFF_MEMBERS {
            return ByeSchedule::Immediate;
        }

        let bye = match reason {
            Some(reason) => RtcpGoodbye::new_with_reason(0, reason),
            None => RtcpGoodbye::new_for_source(0),
        };
        self.tp = now;
        self.pmembers = 1;
        self.bye_members = Some(1);
        self.initial = true;
        self.we_sent = false;
        self.avg_rtcp_size = RtcpPacket::Goodbye(bye).size() as f64;
        self.tn = self.tp + self.interval(1, 0);
        debug!("Holding BYE back in a session of {} members until {:?}", members, self.tn);
        if now >= self.tn {
            ByeSchedule::Immediate
        } else {
            ByeSchedule::Deferred(self.tn)
        }
    }

    /// Timer reconsideration for a held-back BYE. `None` when it may be sent
    /// now, otherwise the time to check again.
    pub fn bye_reconsideration(&mut self, now: SystemTime) -> Option<SystemTime> {
        if self.timer_reconsideration(now, 1, 0) {
            None
        } else {
            Some(self.tn)
        }
    }

    /// Whether a BYE is being held back
    pub fn is_leaving(&self) -> bool {
        self.bye_members.is_some()
    }
}

/// Move `t` towards `now` by `ratio`, on either side of it
fn scale_around(now: SystemTime, t: SystemTime, ratio: f64) -> SystemTime {
    match t.duration_since(now) {
        Ok(ahead) => now + ahead.mul_f64(ratio),
        Err(e) => now.checked_sub(e.duration().mul_f64(ratio)).unwrap_or(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::{RtcpApplicationDefined, NTP_UNIX_OFFSET};
    use crate::session::hooks::NoopHooks;
    use parking_lot::Mutex;

    const LOCAL: RtpSsrc = 0x0A0A_0001;
    const REMOTE: RtpSsrc = 0x0B0B_0002;

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(3_900_000_000 - NTP_UNIX_OFFSET)
    }

    fn sdes() -> SdesConfig {
        SdesConfig {
            cname: "local@example.com".to_string(),
            name: Some("Local".to_string()),
            email: None,
            phone: None,
            location: None,
            tool: Some("tool".to_string()),
            note: None,
            private: None,
        }
    }

    fn registry_with_local() -> SourceRegistry {
        let mut registry = SourceRegistry::default();
        registry.get_or_create(LOCAL);
        registry.set_state(LOCAL, SourceState::Valid);
        registry
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SessionHooks for Recorder {
        fn on_got_sr(&self, ssrc: RtpSsrc, _report: &RtcpSenderReport) {
            self.events.lock().push(format!("sr {:08x}", ssrc));
        }
        fn on_got_goodbye(&self, ssrc: RtpSsrc, reason: Option<&str>) {
            self.events.lock().push(format!("bye {:08x} {:?}", ssrc, reason));
        }
        fn on_got_app(&self, app: &RtcpApplicationDefined) {
            self.events.lock().push(format!("app {}", String::from_utf8_lossy(&app.name)));
        }
        fn on_ssrc_collision(&self, ssrc: RtpSsrc, _from: SocketAddr) {
            self.events.lock().push(format!("collision {:08x}", ssrc));
        }
    }

    fn take_in(
        engine: &mut RtcpEngine,
        registry: &mut SourceRegistry,
        conflicts: &mut ConflictList,
        bytes: &[u8],
        from: &str,
        now: SystemTime,
        hooks: &dyn SessionHooks,
    ) -> ControlAdmission {
        let ctx = ControlContext {
            registry,
            conflicts,
            local_ssrc: LOCAL,
            local_addr: Some("10.0.0.1:5005".parse().unwrap()),
            hooks,
        };
        engine.take_in_control_packet(bytes, from.parse().unwrap(), now, ctx)
    }

    fn remote_report(sdes_cname: bool, bye: bool) -> Vec<u8> {
        let info = RtcpSenderInfo {
            ntp_timestamp: NtpTimestamp::new(3_900_000_000, 0x8000_0000),
            rtp_timestamp: 16000,
            packet_count: 100,
            octet_count: 16000,
        };
        let mut sr = RtcpSenderReport::new(REMOTE, info);
        let mut about_us = RtcpReportBlock::new(LOCAL);
        about_us.fraction_lost = 12;
        sr.add_report_block(about_us);

        let mut compound = RtcpCompoundPacket::new();
        compound.add(RtcpPacket::SenderReport(sr));
        let mut chunk = RtcpSdesChunk::new(REMOTE);
        if sdes_cname {
            chunk.add_item(RtcpSdesItem::cname("remote@example.com"));
        }
        chunk.add_item(RtcpSdesItem::new(RtcpSdesItemType::Tool, Bytes::from_static(b"peer")));
        let mut description = RtcpSourceDescription::new();
        description.add_chunk(chunk);
        compound.add(RtcpPacket::SourceDescription(description));
        if bye {
            compound.add(RtcpPacket::Goodbye(RtcpGoodbye::new_with_reason(REMOTE, "done")));
        }
        compound.serialize().unwrap().to_vec()
    }

    #[test]
    fn test_reverse_reconsideration() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        engine.pmembers = 10;
        engine.tn = now + Duration::from_secs(10);
        engine.tp = now - Duration::from_secs(4);

        engine.reverse_reconsideration(now, 5);
        assert_eq!(engine.next_transmission(), now + Duration::from_secs(5));
        assert_eq!(engine.previous_transmission(), now - Duration::from_secs(2));
        assert_eq!(engine.pmembers(), 5);

        // Growth only records the new count
        engine.reverse_reconsideration(now, 8);
        assert_eq!(engine.next_transmission(), now + Duration::from_secs(5));
        assert_eq!(engine.pmembers(), 8);
    }

    #[test]
    fn test_timer_reconsideration() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        assert!(engine.is_initial());
        // Initial interval: 2.5 s floor, randomized and compensated
        let first = engine.next_transmission().duration_since(now).unwrap();
        assert!(first >= Duration::from_secs_f64(1.25 / interval::RECONSIDERATION_COMPENSATION));
        assert!(first < Duration::from_secs_f64(3.75 / interval::RECONSIDERATION_COMPENSATION));

        assert!(!engine.timer_reconsideration(now, 1, 0));
        assert!(engine.timer_reconsideration(now + Duration::from_secs(10), 1, 0));
        assert_eq!(engine.previous_transmission(), now + Duration::from_secs(10));
    }

    #[test]
    fn test_avg_size_update() {
        let mut engine = RtcpEngine::new(RtcpConfig::default(), start());
        assert_eq!(engine.avg_rtcp_size(), 28.0);
        engine.update_avg_size(100);
        assert_eq!(engine.avg_rtcp_size(), 28.0 + (128.0 - 28.0) / 16.0);
    }

    #[test]
    fn test_receiver_report_with_sdes_rotation() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let config = sdes();

        let report = engine.build_report(now, SenderState::default(), &mut registry, LOCAL, &config);
        assert_eq!(report.packets.len(), 2);
        assert!(matches!(report.packets[0], RtcpPacket::ReceiverReport(ref rr) if rr.report_blocks.is_empty()));
        let RtcpPacket::SourceDescription(ref description) = report.packets[1] else {
            panic!("expected SDES");
        };
        let items = &description.chunks[0].items;
        assert_eq!(items[0].item_type, RtcpSdesItemType::CName);
        assert_eq!(items[1].item_type, RtcpSdesItemType::Name);

        // Next report rotates to the next non-empty item
        let report = engine.build_report(now, SenderState::default(), &mut registry, LOCAL, &config);
        let RtcpPacket::SourceDescription(ref description) = report.packets[1] else {
            panic!("expected SDES");
        };
        assert_eq!(description.chunks[0].items[1].item_type, RtcpSdesItemType::Tool);

        // The compound survives its own validity checks
        let bytes = report.serialize().unwrap();
        assert!(RtcpCompoundPacket::parse(&bytes).is_ok());
    }

    #[test]
    fn test_sender_report_with_blocks() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();

        let (record, _) = registry.get_or_create(REMOTE);
        record.state = SourceState::Valid;
        record.data_since_report = true;
        record.stats.received = 10;
        record.stats.max_seq = 19;
        record.stats.base_seq = 10;
        record.sender_report = Some(SenderSnapshot {
            info: RtcpSenderInfo {
                ntp_timestamp: NtpTimestamp::new(0x1234_5678, 0x9ABC_DEF0),
                ..RtcpSenderInfo::default()
            },
            received_at: now - Duration::from_secs(2),
        });

        let sender = SenderState { packet_count: 5, octet_count: 800, rtp_timestamp: 4242 };
        let report = engine.build_report(now, sender, &mut registry, LOCAL, &sdes());
        let RtcpPacket::SenderReport(ref sr) = report.packets[0] else {
            panic!("expected SR");
        };
        assert_eq!(sr.sender_info.packet_count, 5);
        assert_eq!(sr.sender_info.rtp_timestamp, 4242);
        assert_eq!(sr.report_blocks.len(), 1);
        let block = &sr.report_blocks[0];
        assert_eq!(block.ssrc, REMOTE);
        assert_eq!(block.highest_seq, 19);
        assert_eq!(block.last_sr, 0x5678_9ABC);
        assert_eq!(block.delay_since_last_sr, 2 * 65536);
        assert!(registry.get(LOCAL).unwrap().is_sender());
        assert!(!registry.get(REMOTE).unwrap().data_since_report);

        // Nothing new sent: back to RR, and no block without fresh data
        let report = engine.build_report(now, sender, &mut registry, LOCAL, &sdes());
        assert!(matches!(report.packets[0], RtcpPacket::ReceiverReport(ref rr) if rr.report_blocks.is_empty()));
        assert!(!registry.get(LOCAL).unwrap().is_sender());
    }

    #[test]
    fn test_report_blocks_chain_past_31() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        for ssrc in 1..=40u32 {
            let (record, _) = registry.get_or_create(ssrc);
            record.state = SourceState::Valid;
            record.data_since_report = true;
        }

        let report = engine.build_report(now, SenderState::default(), &mut registry, LOCAL, &sdes());
        let counts: Vec<usize> = report
            .packets
            .iter()
            .filter_map(|p| match p {
                RtcpPacket::ReceiverReport(rr) => Some(rr.report_blocks.len()),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![31, 9]);
        assert!(report.size() + LOWER_HEADERS_SIZE <= 1500);
    }

    #[test]
    fn test_report_blocks_bounded_by_mtu() {
        let now = start();
        let config = RtcpConfig { path_mtu: 300, ..RtcpConfig::default() };
        let mut engine = RtcpEngine::new(config, now);
        let mut registry = registry_with_local();
        for ssrc in 1..=20u32 {
            let (record, _) = registry.get_or_create(ssrc);
            record.state = SourceState::Valid;
            record.data_since_report = true;
        }

        let report = engine.build_report(now, SenderState::default(), &mut registry, LOCAL, &sdes());
        assert!(report.size() + LOWER_HEADERS_SIZE <= 300);
        // Sources left out keep their pending data for the next report
        assert!(registry.iter().any(|r| r.data_since_report));
    }

    #[test]
    fn test_take_in_sender_report_and_sdes() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();
        let hooks = Recorder::default();

        let bytes = remote_report(true, false);
        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &hooks);
        assert_eq!(outcome, ControlAdmission::Processed);

        let record = registry.get(REMOTE).unwrap();
        assert!(record.is_valid());
        assert_eq!(record.participant.cname(), Some("remote@example.com"));
        assert_eq!(record.participant.get(RtcpSdesItemType::Tool), Some("peer"));
        assert_eq!(record.sender_report.unwrap().info.rtp_timestamp, 16000);
        assert_eq!(record.receiver_report.as_ref().unwrap().block.fraction_lost, 12);
        assert_eq!(record.control_addr, Some("192.0.2.20:5005".parse().unwrap()));
        assert_eq!(hooks.events.lock().clone(), vec![format!("sr {:08x}", REMOTE)]);
        assert!(engine.avg_rtcp_size() > 28.0);
    }

    #[test]
    fn test_sdes_without_cname_keeps_probation() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();

        let bytes = remote_report(false, false);
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &NoopHooks);
        assert_eq!(registry.get(REMOTE).unwrap().state(), SourceState::Probation);
    }

    #[test]
    fn test_bye_marks_leaving_and_reconsiders() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();
        let hooks = Recorder::default();

        let bytes = remote_report(true, false);
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &hooks);
        engine.pmembers = registry.members_count();
        assert_eq!(engine.pmembers(), 2);
        engine.tn = now + Duration::from_secs(8);

        let bytes = remote_report(true, true);
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &hooks);
        assert_eq!(registry.get(REMOTE).unwrap().state(), SourceState::Leaving);
        assert_eq!(registry.members_count(), 1);
        assert_eq!(engine.next_transmission(), now + Duration::from_secs(4));
        assert!(hooks.events.lock().contains(&format!("bye {:08x} Some(\"done\")", REMOTE)));
    }

    #[test]
    fn test_malformed_compounds() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();

        // Starts with SDES instead of a report
        let mut description = RtcpSourceDescription::new();
        description.add_chunk(RtcpSdesChunk::new(REMOTE));
        let mut compound = RtcpCompoundPacket::new();
        compound.add(RtcpPacket::SourceDescription(description));
        let bytes = compound.serialize().unwrap();
        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &NoopHooks);
        assert_eq!(outcome, ControlAdmission::Malformed);

        // Trailing garbage breaks the length sum
        let mut bytes = remote_report(true, false);
        bytes.extend_from_slice(&[0x80, 0xCA]);
        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &NoopHooks);
        assert_eq!(outcome, ControlAdmission::Malformed);
        assert!(!registry.is_registered(REMOTE));
    }

    #[test]
    fn test_local_ssrc_collision_on_control() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();
        let hooks = Recorder::default();

        let mut compound = RtcpCompoundPacket::new();
        compound.add(RtcpPacket::ReceiverReport(RtcpReceiverReport::new(LOCAL)));
        let bytes = compound.serialize().unwrap();

        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.30:5005", now, &hooks);
        assert_eq!(outcome, ControlAdmission::LocalCollision);
        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.30:5005", now, &hooks);
        assert_eq!(outcome, ControlAdmission::Loop);
        let outcome = take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "10.0.0.1:5005", now, &hooks);
        assert_eq!(outcome, ControlAdmission::Loop);
        assert_eq!(hooks.events.lock().len(), 1);
    }

    #[test]
    fn test_control_address_flip_flop() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();
        let hooks = Recorder::default();

        let mut compound = RtcpCompoundPacket::new();
        compound.add(RtcpPacket::ReceiverReport(RtcpReceiverReport::new(REMOTE)));
        compound.add(RtcpPacket::ApplicationDefined(RtcpApplicationDefined::new(
            REMOTE,
            *b"TEST",
            Bytes::from_static(b"data"),
        )));
        let bytes = compound.serialize().unwrap();

        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &hooks);
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.21:5005", now, &hooks);
        assert_eq!(registry.get(REMOTE).unwrap().control_addr, Some("192.0.2.21:5005".parse().unwrap()));

        // The same conflicting address again is dropped
        registry.get_mut(REMOTE).unwrap().control_addr = Some("192.0.2.20:5005".parse().unwrap());
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.21:5005", now, &hooks);
        assert_eq!(registry.get(REMOTE).unwrap().control_addr, Some("192.0.2.20:5005".parse().unwrap()));
        assert_eq!(hooks.events.lock().iter().filter(|e| e.starts_with("app")).count(), 2);
    }

    #[test]
    fn test_transmission_service_and_expiry() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let config = sdes();

        let (record, _) = registry.get_or_create(REMOTE);
        record.last_packet_time = Some(now);
        registry.set_sender(REMOTE, true);
        let (record, _) = registry.get_or_create(REMOTE + 1);
        record.last_rtcp_time = Some(now);

        assert!(engine
            .control_transmission_service(now, SenderState::default(), &mut registry, LOCAL, &config)
            .unwrap()
            .is_none());

        // Eleven seconds later: the sender went quiet, nobody timed out yet
        let later = now + Duration::from_secs(11);
        let report = engine
            .control_transmission_service(later, SenderState::default(), &mut registry, LOCAL, &config)
            .unwrap()
            .unwrap();
        assert!(report.expired.is_empty());
        assert!(!engine.is_initial());
        assert_eq!(engine.reports_sent(), 1);
        assert!(!registry.get(REMOTE).unwrap().is_sender());
        assert!(engine.next_transmission() > later);

        // Past five intervals everyone but the local source is gone
        let much_later = now + Duration::from_secs(60);
        let expired = engine.expire_sources(much_later, &mut registry, LOCAL);
        assert_eq!(expired.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bye_scheduling() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        assert_eq!(engine.schedule_bye(now, 3, 0, None), ByeSchedule::Never);
        assert_eq!(engine.schedule_bye(now, 3, 10, Some("bye")), ByeSchedule::Immediate);

        let bye = engine.build_bye(LOCAL, Some("bye"));
        let bytes = bye.serialize().unwrap();
        let parsed = RtcpCompoundPacket::parse(&bytes).unwrap();
        assert!(matches!(parsed.packets[0], RtcpPacket::ReceiverReport(ref rr) if rr.report_blocks.is_empty()));
        assert!(matches!(parsed.packets[1], RtcpPacket::Goodbye(ref b) if b.sources == vec![LOCAL]));
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn test_bye_backoff_in_large_sessions() {
        let now = start();
        let mut engine = RtcpEngine::new(RtcpConfig::default(), now);
        let mut registry = registry_with_local();
        let mut conflicts = ConflictList::new();

        let ByeSchedule::Deferred(at) = engine.schedule_bye(now, 80, 10, Some("bye")) else {
            panic!("expected the BYE to be held back");
        };
        assert!(engine.is_leaving());
        assert!(at > now);
        assert!(engine.is_initial());

        // Only BYEs count while waiting; reports are ignored
        let bytes = remote_report(true, true);
        take_in(&mut engine, &mut registry, &mut conflicts, &bytes, "192.0.2.20:5005", now, &NoopHooks);
        assert!(!registry.is_registered(REMOTE));
        assert_eq!(engine.bye_members, Some(2));

        assert!(engine.bye_reconsideration(now).is_some());
        assert!(engine.bye_reconsideration(now + Duration::from_secs(30)).is_none());
    }
}
