//! RTP/RTCP media transport engine for the RVOIP project
//!
//! This crate frames, validates, reorders, schedules and accounts for
//! real-time media packets over an unreliable datagram transport, and
//! reports reception quality to peers via RTCP.
//!
//! The library is organized into several modules:
//!
//! - `packet`: RTP and RTCP wire codec
//! - `source`: per-SSRC records and session membership
//! - `inbound`: admission, sequence validation and the reorder queue
//! - `outbound`: segmentation and the paced send queue
//! - `rtcp`: report scheduling, compound building and parsing, BYE
//! - `srtp`: crypto context trait and the AES-CM / HMAC-SHA1 context
//! - `transport`: datagram transport trait, destinations and UDP
//! - `session`: configuration, hooks and the service loop
//! - `stats`: reception statistics
//! - `time`: RTP clock conversions and serial arithmetic

mod error;

pub mod inbound;
pub mod outbound;
pub mod packet;
pub mod rtcp;
pub mod session;
pub mod source;
pub mod srtp;
pub mod stats;
pub mod time;
pub mod transport;

pub use error::Error;

pub use packet::{RtpHeader, RtpPacket};
pub use packet::rtcp::{
    NtpTimestamp, RtcpApplicationDefined, RtcpCompoundPacket, RtcpGoodbye, RtcpPacket, RtcpReceiverReport,
    RtcpReportBlock, RtcpSenderReport, RtcpSourceDescription,
};

pub use session::{RtpSession, SessionConfig, SessionHooks};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for RTP contributing source identifier
pub type RtpCsrc = u32;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        RtpPacket, RtpHeader, RtpSession, SessionConfig, SessionHooks,
        RtpTimestamp, RtpSequenceNumber, RtpSsrc, RtpCsrc,
        Error, Result,
    };

    pub use crate::inbound::{Admission, DropReason, ReceivedPacket};
    pub use crate::transport::{Transport, UdpTransport};

    pub use crate::packet::rtcp::{
        RtcpPacket, RtcpSenderReport, RtcpReceiverReport,
        RtcpReportBlock, NtpTimestamp
    };
}

/// Set up a simple test logger
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
