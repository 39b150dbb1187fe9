//! Session configuration
//!
//! Plain serde structs with defaults matching RFC 3550's recommendations.
//! [`SessionConfigBuilder`] covers the settings most callers change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::inbound::SequencePolicy;
use crate::packet::rtcp::RtcpSdesItemType;
use crate::rtcp::interval;
use crate::source::registry::DEFAULT_BUCKETS;
use crate::{Result, DEFAULT_MAX_PACKET_SIZE};

/// Default largest payload carried by one outgoing packet
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 65536;

/// Default wait when nothing is queued for sending
pub const DEFAULT_SCHEDULING_TIMEOUT: Duration = Duration::from_millis(8);

/// Default lateness after which a queued outgoing packet is discarded
pub const DEFAULT_EXPIRE_TIMEOUT: Duration = Duration::from_secs(40);

/// Default session bandwidth in octets per second (64 kbit/s)
pub const DEFAULT_SESSION_BANDWIDTH: f64 = 8000.0;

/// Inbound queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Sequence validation thresholds
    pub sequence: SequencePolicy,

    /// Largest datagram accepted
    pub max_packet_size: usize,

    /// Maximum end-to-end delay before a queued packet is discarded;
    /// zero disables the check
    pub end_to_end_delay: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            sequence: SequencePolicy::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            end_to_end_delay: Duration::ZERO,
        }
    }
}

/// Outbound queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub max_segment_size: usize,
    pub scheduling_timeout: Duration,
    pub expire_timeout: Duration,

    /// Pad packets to a multiple of this many bytes (0 disables padding)
    pub padding: u8,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            scheduling_timeout: DEFAULT_SCHEDULING_TIMEOUT,
            expire_timeout: DEFAULT_EXPIRE_TIMEOUT,
            padding: 0,
        }
    }
}

/// RTCP timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcpConfig {
    /// Session bandwidth in octets per second
    pub session_bandwidth: f64,

    /// Share of the session bandwidth used for RTCP
    pub control_fraction: f64,

    pub min_interval: Duration,

    /// How often the control channel is serviced
    pub check_interval: Duration,

    /// Pause between sending a BYE and shutting down
    pub leaving_delay: Duration,

    /// Path MTU used to size compound packets
    pub path_mtu: usize,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        Self {
            session_bandwidth: DEFAULT_SESSION_BANDWIDTH,
            control_fraction: interval::CONTROL_BANDWIDTH_FRACTION,
            min_interval: interval::MIN_INTERVAL,
            check_interval: interval::CHECK_INTERVAL,
            leaving_delay: interval::LEAVING_DELAY,
            path_mtu: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Local participant description sent in SDES
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdesConfig {
    pub cname: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
    pub private: Option<String>,
}

impl Default for SdesConfig {
    fn default() -> Self {
        Self {
            cname: default_cname(),
            name: None,
            email: None,
            phone: None,
            location: None,
            tool: Some(format!("rvoip-rtp-engine {}", env!("CARGO_PKG_VERSION"))),
            note: None,
            private: None,
        }
    }
}

impl SdesConfig {
    /// Value configured for a non-CNAME item
    pub fn item(&self, item: RtcpSdesItemType) -> Option<&str> {
        let value = match item {
            RtcpSdesItemType::CName => return Some(&self.cname),
            RtcpSdesItemType::Name => &self.name,
            RtcpSdesItemType::Email => &self.email,
            RtcpSdesItemType::Phone => &self.phone,
            RtcpSdesItemType::Location => &self.location,
            RtcpSdesItemType::Tool => &self.tool,
            RtcpSdesItemType::Note => &self.note,
            RtcpSdesItemType::Private => &self.private,
            RtcpSdesItemType::End => return None,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }
}

/// `user@host` from the `USER` environment variable and the host name
pub fn default_cname() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "rtp".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub payload_type: u8,

    /// RTP clock rate of the payload format in Hz
    pub clock_rate: u32,

    /// Hash buckets in the source registry
    pub membership_buckets: usize,

    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
    pub rtcp: RtcpConfig,
    pub sdes: SdesConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload_type: 0,
            clock_rate: 8000,
            membership_buckets: DEFAULT_BUCKETS,
            inbound: InboundConfig::default(),
            outbound: OutboundConfig::default(),
            rtcp: RtcpConfig::default(),
            sdes: SdesConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Reject settings the queues cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.clock_rate == 0 {
            return Err(Error::InvalidParameter("Clock rate must be positive".to_string()));
        }
        if self.payload_type > 127 {
            return Err(Error::InvalidParameter(format!("Payload type {} out of range", self.payload_type)));
        }
        if self.outbound.max_segment_size == 0 {
            return Err(Error::InvalidParameter("Maximum segment size must be positive".to_string()));
        }
        if self.membership_buckets == 0 {
            return Err(Error::InvalidParameter("Membership table needs at least one bucket".to_string()));
        }
        if self.inbound.max_packet_size < crate::packet::RTP_MIN_HEADER_SIZE {
            return Err(Error::InvalidParameter(format!(
                "Receive buffer of {} bytes cannot hold an RTP header",
                self.inbound.max_packet_size
            )));
        }
        if !(self.rtcp.control_fraction > 0.0 && self.rtcp.control_fraction <= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "RTCP bandwidth fraction {} out of range",
                self.rtcp.control_fraction
            )));
        }
        if self.sdes.cname.is_empty() || self.sdes.cname.len() > 255 {
            return Err(Error::InvalidParameter("CNAME must be 1 to 255 bytes".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload type and its clock rate
    pub fn payload_format(mut self, payload_type: u8, clock_rate: u32) -> Self {
        self.config.payload_type = payload_type;
        self.config.clock_rate = clock_rate;
        self
    }

    pub fn session_bandwidth(mut self, octets_per_second: f64) -> Self {
        self.config.rtcp.session_bandwidth = octets_per_second;
        self
    }

    pub fn min_sequential(mut self, packets: u32) -> Self {
        self.config.inbound.sequence.min_sequential = packets;
        self
    }

    pub fn end_to_end_delay(mut self, delay: Duration) -> Self {
        self.config.inbound.end_to_end_delay = delay;
        self
    }

    pub fn padding(mut self, pad_to: u8) -> Self {
        self.config.outbound.padding = pad_to;
        self
    }

    pub fn max_segment_size(mut self, size: usize) -> Self {
        self.config.outbound.max_segment_size = size;
        self
    }

    pub fn cname(mut self, cname: impl Into<String>) -> Self {
        self.config.sdes.cname = cname.into();
        self
    }

    pub fn sdes(mut self, sdes: SdesConfig) -> Self {
        self.config.sdes = sdes;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
