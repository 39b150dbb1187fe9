//! Clock conversions shared by the queues and the RTCP engine
//!
//! RTP timestamps tick at the payload clock rate and wrap at 2^32; sequence
//! numbers wrap at 2^16. Both are compared with serial-number arithmetic.

use std::time::Duration;

use crate::{RtpSequenceNumber, RtpTimestamp};

/// Convert a span of RTP timestamp units to wallclock time
pub fn rtp_units_to_duration(units: u32, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let seconds = units / clock_rate;
    let remainder = units % clock_rate;
    let nanos = ((remainder as u64) * 1_000_000_000) / (clock_rate as u64);
    Duration::new(seconds as u64, nanos as u32)
}

/// Convert wallclock time to RTP timestamp units. Wraps at 2^32.
pub fn duration_to_rtp_units(duration: Duration, clock_rate: u32) -> u32 {
    let whole = duration.as_secs().wrapping_mul(clock_rate as u64);
    let fraction = ((duration.subsec_nanos() as u64) * (clock_rate as u64)) / 1_000_000_000;
    whole.wrapping_add(fraction) as u32
}

/// Convert a duration to the 1/65536 s units of the DLSR report field
pub fn duration_to_dlsr(duration: Duration) -> u32 {
    let units = (duration.as_micros() << 16) / 1_000_000;
    units.min(u32::MAX as u128) as u32
}

/// `true` when `a` comes strictly after `b` in 16-bit serial order
pub fn seq_after(a: RtpSequenceNumber, b: RtpSequenceNumber) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// `true` when `a` comes strictly before `b` in 16-bit serial order
pub fn seq_before(a: RtpSequenceNumber, b: RtpSequenceNumber) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// `true` when timestamp `a` is at or before `b` in 32-bit serial order
pub fn timestamp_not_after(a: RtpTimestamp, b: RtpTimestamp) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Typical clock rates for common payload formats
pub mod clock_rates {
    /// G.711, G.726, G.729 (8kHz)
    pub const AUDIO_8KHZ: u32 = 8000;

    /// G.722 (16kHz)
    pub const AUDIO_16KHZ: u32 = 16000;

    /// Opus (48kHz)
    pub const AUDIO_48KHZ: u32 = 48000;

    /// Video (90kHz)
    pub const VIDEO_90KHZ: u32 = 90000;
}
