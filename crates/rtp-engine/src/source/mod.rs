//! Source membership
//!
//! Every synchronization source heard in a session (and the local one) has a
//! [`SourceRecord`] in the [`SourceRegistry`]. Records carry sequence
//! validation state, the last sender/receiver reports and the participant's
//! SDES items.

pub mod conflict;
pub mod registry;

pub use conflict::ConflictList;
pub use registry::SourceRegistry;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::packet::rtcp::{NtpTimestamp, RtcpReportBlock, RtcpSdesItemType, RtcpSenderInfo};
use crate::stats::{ReceptionStats, RTP_SEQ_MOD};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Lifecycle of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Heard from, not yet validated
    Probation,
    /// Validated by sequential data or a CNAME
    Valid,
    /// Sent a BYE
    Leaving,
}

/// Last sender report received from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderSnapshot {
    pub info: RtcpSenderInfo,
    pub received_at: SystemTime,
}

impl SenderSnapshot {
    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        self.info.ntp_timestamp
    }
}

/// Last reception report a source sent about the local SSRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSnapshot {
    pub block: RtcpReportBlock,
    pub received_at: SystemTime,
}

/// SDES items describing a participant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    items: BTreeMap<RtcpSdesItemType, String>,
}

impl Participant {
    pub fn cname(&self) -> Option<&str> {
        self.get(RtcpSdesItemType::CName)
    }

    pub fn get(&self, item: RtcpSdesItemType) -> Option<&str> {
        self.items.get(&item).map(String::as_str)
    }

    pub fn set(&mut self, item: RtcpSdesItemType, value: impl Into<String>) {
        self.items.insert(item, value.into());
    }

    pub fn is_bound(&self) -> bool {
        self.items.contains_key(&RtcpSdesItemType::CName)
    }
}

/// Everything known about one synchronization source
#[derive(Debug, Clone)]
pub struct SourceRecord {
    ssrc: RtpSsrc,
    pub(crate) state: SourceState,
    pub(crate) sender: bool,

    /// Address data packets arrive from
    pub data_addr: Option<SocketAddr>,

    /// Address control packets arrive from
    pub control_addr: Option<SocketAddr>,

    /// Last address that collided with this source's recorded address
    pub prev_conflict: Option<SocketAddr>,

    pub stats: ReceptionStats,

    /// Fraction lost computed for the last report block about this source
    pub last_fraction_lost: u8,

    /// RTP timestamp of the first data packet accepted
    pub initial_data_timestamp: Option<RtpTimestamp>,
    pub initial_data_time: Option<SystemTime>,
    pub last_packet_time: Option<SystemTime>,
    pub last_rtcp_time: Option<SystemTime>,

    /// Data arrived since the last report we sent
    pub data_since_report: bool,

    pub sender_report: Option<SenderSnapshot>,
    pub receiver_report: Option<ReceiverSnapshot>,
    pub participant: Participant,
}

impl SourceRecord {
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            state: SourceState::Probation,
            sender: false,
            data_addr: None,
            control_addr: None,
            prev_conflict: None,
            stats: ReceptionStats::default(),
            last_fraction_lost: 0,
            initial_data_timestamp: None,
            initial_data_time: None,
            last_packet_time: None,
            last_rtcp_time: None,
            data_since_report: false,
            sender_report: None,
            receiver_report: None,
            participant: Participant::default(),
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    pub fn is_valid(&self) -> bool {
        self.state == SourceState::Valid
    }

    /// Start sequence validation at `seq` with `probation` sequential
    /// packets still required.
    pub fn start_probation(&mut self, seq: RtpSequenceNumber, probation: u32) {
        self.stats.max_seq = seq.wrapping_sub(1);
        self.stats.base_seq = seq as u32;
        self.stats.bad_seq = RTP_SEQ_MOD + 1;
        self.stats.probation = probation;
    }

    /// Most recent activity, data or control
    pub fn last_activity(&self) -> Option<SystemTime> {
        match (self.last_packet_time, self.last_rtcp_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_participant_binding() {
        let mut participant = Participant::default();
        assert!(!participant.is_bound());

        participant.set(RtcpSdesItemType::Tool, "rvoip");
        assert!(!participant.is_bound());

        participant.set(RtcpSdesItemType::CName, "carol@pc.example");
        assert!(participant.is_bound());
        assert_eq!(participant.cname(), Some("carol@pc.example"));
        assert_eq!(participant.get(RtcpSdesItemType::Tool), Some("rvoip"));
    }

    #[test]
    fn test_last_activity() {
        let mut record = SourceRecord::new(5);
        assert!(record.last_activity().is_none());

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        record.last_rtcp_time = Some(t0);
        assert_eq!(record.last_activity(), Some(t0));

        record.last_packet_time = Some(t0 + Duration::from_secs(3));
        assert_eq!(record.last_activity(), Some(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_start_probation() {
        let mut record = SourceRecord::new(5);
        record.start_probation(0, 2);
        assert_eq!(record.stats.max_seq, 65535);
        assert_eq!(record.stats.probation, 2);
        assert_eq!(record.state(), SourceState::Probation);
    }
}
