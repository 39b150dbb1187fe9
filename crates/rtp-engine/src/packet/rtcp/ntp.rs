use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// NTP timestamp representation (64 bits)
/// As defined in RFC 3550 Section 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    /// NTP timestamp for the current wallclock time
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a wallclock instant. Times before the UNIX epoch map to the epoch.
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self::from_duration_since_unix_epoch(since_epoch)
    }

    /// Wallclock instant this timestamp refers to
    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.to_duration_since_unix_epoch()
    }

    /// Convert to a 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | (self.fraction as u64)
    }

    /// Convert from a 64-bit representation
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits of the 64-bit timestamp, as carried in the LSR field
    /// of report blocks (RFC 3550 Section 6.4.1).
    pub fn to_u32(&self) -> u32 {
        ((self.seconds & 0x0000FFFF) << 16) | ((self.fraction & 0xFFFF0000) >> 16)
    }

    /// Convert to a Duration since UNIX epoch
    pub fn to_duration_since_unix_epoch(&self) -> Duration {
        let seconds = (self.seconds as u64).saturating_sub(NTP_UNIX_OFFSET);

        // fraction * 10^9 / 2^32
        let nanos = ((self.fraction as u64) * 1_000_000_000) >> 32;

        Duration::new(seconds, nanos as u32)
    }

    /// Create a new NTP timestamp from a Duration since UNIX epoch
    pub fn from_duration_since_unix_epoch(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_UNIX_OFFSET;

        // nanos * 2^32 / 10^9
        let nanos = duration.subsec_nanos();
        let fraction = ((nanos as u64) << 32) / 1_000_000_000;

        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }
}
