//! Sequence number validation (RFC 3550 Appendix A.1)

use serde::{Deserialize, Serialize};

use crate::stats::{ReceptionStats, RTP_SEQ_MOD};
use crate::RtpSequenceNumber;

/// Default number of sequential packets before a source is valid
pub const MIN_SEQUENTIAL: u32 = 2;

/// Default forward jump still treated as ordinary loss
pub const MAX_DROPOUT: u16 = 3000;

/// Default backward jump still treated as reordering
pub const MAX_MISORDER: u16 = 100;

/// Thresholds for sequence validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePolicy {
    pub min_sequential: u32,
    pub max_dropout: u16,
    pub max_misorder: u16,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        Self {
            min_sequential: MIN_SEQUENTIAL,
            max_dropout: MAX_DROPOUT,
            max_misorder: MAX_MISORDER,
        }
    }
}

/// Outcome of validating one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    Accepted,
    /// Source still on probation
    Probation,
    /// Jump too large, waiting to see if the sender restarted
    BadSequence,
}

/// Reset the sequence state to start counting at `seq`
pub fn init_sequence(stats: &mut ReceptionStats, seq: RtpSequenceNumber) {
    stats.base_seq = seq as u32;
    stats.max_seq = seq;
    stats.bad_seq = RTP_SEQ_MOD + 1;
    stats.cycles = 0;
    stats.received = 0;
    stats.received_prior = 0;
    stats.expected_prior = 0;
}

/// Validate `seq` against the source state and update it.
///
/// Accepted packets are counted in `stats.received`.
pub fn record_reception(
    stats: &mut ReceptionStats,
    seq: RtpSequenceNumber,
    policy: &SequencePolicy,
) -> SequenceVerdict {
    if stats.probation > 0 {
        let verdict = if seq == stats.max_seq.wrapping_add(1) {
            stats.probation -= 1;
            if stats.probation == 0 {
                init_sequence(stats, seq);
                SequenceVerdict::Accepted
            } else {
                SequenceVerdict::Probation
            }
        } else {
            stats.probation = policy.min_sequential.saturating_sub(1);
            SequenceVerdict::Probation
        };
        stats.max_seq = seq;
        if verdict == SequenceVerdict::Accepted {
            stats.received += 1;
        }
        return verdict;
    }

    let step = seq.wrapping_sub(stats.max_seq);
    if step < policy.max_dropout {
        if seq < stats.max_seq {
            stats.cycles = stats.cycles.wrapping_add(RTP_SEQ_MOD);
        }
        stats.max_seq = seq;
    } else if (step as u32) <= RTP_SEQ_MOD - policy.max_misorder as u32 {
        if seq as u32 == stats.bad_seq {
            // Two sequential packets after a big jump: the sender restarted
            init_sequence(stats, seq);
        } else {
            stats.bad_seq = (seq as u32 + 1) & (RTP_SEQ_MOD - 1);
            if stats.received > 0 {
                return SequenceVerdict::BadSequence;
            }
            // The very first packet from a source is never discarded
            stats.max_seq = seq;
        }
    }
    // else: duplicate or reordered, accepted without moving max_seq

    stats.received += 1;
    SequenceVerdict::Accepted
}
