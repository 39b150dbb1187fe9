//! Reception statistics
//!
//! Per-source sequence bookkeeping, loss accounting and interarrival jitter
//! as described in RFC 3550 Appendix A.1, A.3 and A.8.

use serde::{Deserialize, Serialize};

use crate::packet::rtcp::RtcpReportBlock;
use crate::{RtpSequenceNumber, RtpSsrc};

/// Sequence number modulus
pub const RTP_SEQ_MOD: u32 = 1 << 16;

/// Reception state kept for every remote source
#[derive(Debug, Clone, Default)]
pub struct ReceptionStats {
    /// Highest sequence number seen
    pub max_seq: RtpSequenceNumber,

    /// Shifted count of sequence number cycles (multiples of 2^16)
    pub cycles: u32,

    /// First sequence number of the current validation epoch
    pub base_seq: u32,

    /// Last 'bad' sequence number + 1
    pub bad_seq: u32,

    /// Sequential packets still required before the source is valid
    pub probation: u32,

    /// Packets accepted
    pub received: u32,

    /// Payload octets accepted
    pub octets: u64,

    /// `expected` at the previous report
    pub expected_prior: u32,

    /// `received` at the previous report
    pub received_prior: u32,

    /// Relative transit time of the previous packet
    pub transit: Option<u32>,

    /// Interarrival jitter estimate, in timestamp units
    pub jitter: f64,
}

/// Loss figures for one reporting interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossReport {
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_max_seq: u32,
}

impl ReceptionStats {
    /// Extended highest sequence number received
    pub fn extended_max(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }

    /// Packets expected since the base sequence number
    pub fn expected(&self) -> u32 {
        self.extended_max().wrapping_sub(self.base_seq).wrapping_add(1)
    }

    /// Cumulative packets lost; zero until something was received
    pub fn cumulative_lost(&self) -> i64 {
        if self.received == 0 {
            return 0;
        }
        self.expected() as i64 - self.received as i64
    }

    /// Compute the loss figures for a report block and start a new interval.
    pub fn compute(&mut self) -> LossReport {
        let expected = self.expected();
        let expected_interval = expected.wrapping_sub(self.expected_prior) as i64;
        let received_interval = self.received.wrapping_sub(self.received_prior) as i64;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval - received_interval;
        let fraction_lost = if self.received == 0 || expected_interval <= 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        // Negative totals (duplicates) report as zero, and the field is 24 bits
        let cumulative_lost = self.cumulative_lost().clamp(0, 0x00FF_FFFF) as u32;

        LossReport {
            fraction_lost,
            cumulative_lost,
            extended_max_seq: self.extended_max(),
        }
    }

    /// Update the jitter estimate with one packet's relative transit time.
    ///
    /// `arrival` is the arrival time expressed in timestamp units.
    pub fn update_jitter(&mut self, arrival: u32, timestamp: u32) {
        let transit = arrival.wrapping_sub(timestamp);
        if let Some(last) = self.transit {
            let d = (transit.wrapping_sub(last) as i32).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    /// Build a report block about this source
    pub fn report_block(&mut self, ssrc: RtpSsrc, last_sr: u32, delay_since_last_sr: u32) -> RtcpReportBlock {
        let loss = self.compute();
        RtcpReportBlock {
            ssrc,
            fraction_lost: loss.fraction_lost,
            cumulative_lost: loss.cumulative_lost,
            highest_seq: loss.extended_max_seq,
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }
}

/// Point-in-time view of a remote source's reception quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub ssrc: RtpSsrc,
    pub packets_received: u32,
    pub octets_received: u64,
    pub cumulative_lost: i64,
    /// Fraction lost over the last reporting interval, 0..=255
    pub fraction_lost: u8,
    pub extended_max_seq: u32,
    /// Interarrival jitter in milliseconds
    pub jitter_ms: f64,
}

impl SourceStats {
    pub fn from_reception(ssrc: RtpSsrc, stats: &ReceptionStats, last_fraction: u8, clock_rate: u32) -> Self {
        let jitter_ms = if clock_rate > 0 {
            stats.jitter * 1000.0 / clock_rate as f64
        } else {
            0.0
        };
        Self {
            ssrc,
            packets_received: stats.received,
            octets_received: stats.octets,
            cumulative_lost: stats.cumulative_lost(),
            fraction_lost: last_fraction,
            extended_max_seq: stats.extended_max(),
            jitter_ms,
        }
    }
}
