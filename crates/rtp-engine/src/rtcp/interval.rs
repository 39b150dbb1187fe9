//! RTCP transmission interval (RFC 3550 Section 6.3 and Appendix A.7)

use std::time::Duration;

use rand::Rng;

/// Silent intervals after which a member is timed out
pub const TIMEOUT_MULTIPLIER: u32 = 5;

/// Divides the randomized interval to compensate for timer reconsideration
/// converging below the intended average
pub const RECONSIDERATION_COMPENSATION: f64 = std::f64::consts::E - 1.5;

/// Share of the session bandwidth used by RTCP
pub const CONTROL_BANDWIDTH_FRACTION: f64 = 0.05;

/// Share of the RTCP bandwidth reserved for senders when they are few
pub const SENDER_BANDWIDTH_FRACTION: f64 = 0.25;

pub const RECEIVER_BANDWIDTH_FRACTION: f64 = 1.0 - SENDER_BANDWIDTH_FRACTION;

pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence at which the control channel is polled
pub const CHECK_INTERVAL: Duration = Duration::from_millis(250);

pub const LEAVING_DELAY: Duration = Duration::from_secs(1);

/// IPv4 + UDP header bytes added to every RTCP packet size
pub const LOWER_HEADERS_SIZE: usize = 28;

pub const INITIAL_AVG_SIZE: f64 = LOWER_HEADERS_SIZE as f64;

/// Interval used when no RTCP bandwidth is available
const NO_BANDWIDTH_INTERVAL: Duration = Duration::from_secs(100);

/// Inputs to the interval computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalParams {
    pub members: u32,
    pub senders: u32,
    pub we_sent: bool,
    pub initial: bool,

    /// Average compound packet size in octets, lower headers included
    pub avg_rtcp_size: f64,

    /// Session bandwidth in octets per second
    pub session_bandwidth: f64,
    pub control_fraction: f64,
    pub min_interval: Duration,
}

/// Interval before randomization: `participants * avg_size / bandwidth`,
/// floored at the minimum interval (halved before the first report).
pub fn deterministic_interval(params: &IntervalParams) -> Duration {
    let mut bandwidth = params.control_fraction * params.session_bandwidth;
    let mut participants = params.members;

    let senders = params.senders as f64;
    if params.senders > 0 && senders < params.members as f64 * SENDER_BANDWIDTH_FRACTION {
        if params.we_sent {
            bandwidth *= SENDER_BANDWIDTH_FRACTION;
            participants = params.senders;
        } else {
            bandwidth *= RECEIVER_BANDWIDTH_FRACTION;
            participants = params.members - params.senders;
        }
    }

    if bandwidth <= 0.0 {
        return NO_BANDWIDTH_INTERVAL;
    }

    let min = if params.initial {
        params.min_interval / 2
    } else {
        params.min_interval
    };
    let seconds = participants.max(1) as f64 * params.avg_rtcp_size / bandwidth;
    Duration::from_secs_f64(seconds).max(min)
}

/// Randomized interval: the deterministic value times a factor in
/// `[0.5, 1.5)`, divided by [`RECONSIDERATION_COMPENSATION`].
pub fn compute_interval(params: &IntervalParams) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    deterministic_interval(params).mul_f64(factor / RECONSIDERATION_COMPENSATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(members: u32, senders: u32) -> IntervalParams {
        IntervalParams {
            members,
            senders,
            we_sent: false,
            initial: false,
            avg_rtcp_size: 100.0,
            session_bandwidth: 8000.0,
            control_fraction: CONTROL_BANDWIDTH_FRACTION,
            min_interval: MIN_INTERVAL,
        }
    }

    #[test]
    fn test_interval_core() {
        // 400 B/s of RTCP, 100 members of 100 bytes: 25 s
        let p = params(100, 0);
        assert_eq!(deterministic_interval(&p), Duration::from_secs(25));

        // Small sessions hit the floor, halved before the first report
        let p = params(2, 0);
        assert_eq!(deterministic_interval(&p), MIN_INTERVAL);
        let p = IntervalParams { initial: true, ..params(2, 0) };
        assert_eq!(deterministic_interval(&p), Duration::from_millis(2500));
    }

    #[test]
    fn test_sender_share() {
        // 4 senders out of 100 members: senders split 100 B/s among themselves
        let p = IntervalParams { we_sent: true, ..params(100, 4) };
        assert_eq!(deterministic_interval(&p), Duration::from_secs(5));

        // Receivers split 300 B/s among 96
        let p = params(100, 4);
        assert_eq!(deterministic_interval(&p), Duration::from_secs(32));

        // Senders are not a minority: everyone shares
        let p = IntervalParams { we_sent: true, ..params(100, 50) };
        assert_eq!(deterministic_interval(&p), Duration::from_secs(25));
    }

    #[test]
    fn test_no_bandwidth() {
        let p = IntervalParams { session_bandwidth: 0.0, ..params(3, 0) };
        assert_eq!(deterministic_interval(&p), Duration::from_secs(100));
    }

    #[test]
    fn test_randomized_bounds() {
        let p = params(100, 0);
        let low = Duration::from_secs(25).mul_f64(0.5 / RECONSIDERATION_COMPENSATION);
        let high = Duration::from_secs(25).mul_f64(1.5 / RECONSIDERATION_COMPENSATION);
        for _ in 0..100 {
            let t = compute_interval(&p);
            assert!(t >= low && t < high, "{:?} outside [{:?}, {:?})", t, low, high);
        }
    }
}
