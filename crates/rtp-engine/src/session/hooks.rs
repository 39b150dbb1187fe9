//! Application callbacks and SSRC generation

use std::net::SocketAddr;

use rand::Rng;

use crate::inbound::reorder::ReceivedPacket;
use crate::packet::rtcp::{RtcpApplicationDefined, RtcpReceiverReport, RtcpSdesChunk, RtcpSenderReport};
use crate::packet::RtpPacket;
use crate::source::SourceRecord;
use crate::srtp::CryptoFailure;
use crate::RtpSsrc;

/// Callbacks fired by the session as packets and reports arrive.
///
/// Every method has a no-op default, so implementors only override what
/// they care about. Callbacks run while session locks are held and must not
/// call back into the session.
pub trait SessionHooks: Send + Sync {
    /// A data or control packet created a new source
    fn on_new_source(&self, _source: &SourceRecord) {}

    /// Inspect a data packet before it is accounted. Return `false` to drop it.
    fn on_rtp_packet_recv(&self, _packet: &RtpPacket, _from: SocketAddr) -> bool {
        true
    }

    /// A queued packet was discarded without being delivered
    fn on_expire_recv(&self, _packet: &ReceivedPacket) {}

    /// An outgoing packet missed its send deadline
    fn on_expire_send(&self, _packet: &RtpPacket) {}

    /// An inbound packet failed SRTP processing. Return `true` to keep it anyway.
    fn on_srtp_error(&self, _ssrc: RtpSsrc, _failure: CryptoFailure) -> bool {
        false
    }

    fn on_got_sr(&self, _ssrc: RtpSsrc, _report: &RtcpSenderReport) {}

    fn on_got_rr(&self, _ssrc: RtpSsrc, _report: &RtcpReceiverReport) {}

    /// Fired after the chunk's items were stored on the source
    fn on_got_sdes_chunk(&self, _source: &SourceRecord, _chunk: &RtcpSdesChunk) {}

    fn on_got_goodbye(&self, _ssrc: RtpSsrc, _reason: Option<&str>) {}

    fn on_got_app(&self, _app: &RtcpApplicationDefined) {}

    /// Another participant is using the local SSRC
    fn on_ssrc_collision(&self, _ssrc: RtpSsrc, _from: SocketAddr) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// Source of local SSRC values
pub trait SsrcGenerator: Send + Sync {
    fn next_ssrc(&self) -> RtpSsrc;
}

/// Random SSRCs from the thread-local RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSsrc;

impl SsrcGenerator for RandomSsrc {
    fn next_ssrc(&self) -> RtpSsrc {
        rand::thread_rng().gen()
    }
}
