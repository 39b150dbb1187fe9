use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Report block in RTCP SR/RR packets
/// Defined in RFC 3550 Section 6.4.1 and 6.4.2
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpReportBlock {
    /// SSRC of the source this block reports on
    pub ssrc: RtpSsrc,

    /// Fraction of packets lost since the previous report (8-bit fixed point)
    pub fraction_lost: u8,

    /// Cumulative number of packets lost (24 bits on the wire)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub highest_seq: u32,

    /// Interarrival jitter estimate, in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the NTP timestamp of the last SR from this source
    pub last_sr: u32,

    /// Delay since that SR, in units of 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Size of a report block in bytes
    pub const SIZE: usize = 24;

    /// Create a new empty report block
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    /// Parse a report block from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();

        // Fraction lost (8 bits) + cumulative lost (24 bits)
        let loss = buf.get_u32();
        let fraction_lost = (loss >> 24) as u8;
        let cumulative_lost = loss & 0x00FF_FFFF;

        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    /// Serialize a report block to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32((self.fraction_lost as u32) << 24 | (self.cumulative_lost.min(0x00FF_FFFF)));
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

/// Read `count` consecutive report blocks
pub(super) fn read_blocks(buf: &mut impl Buf, count: u8) -> Result<Vec<RtcpReportBlock>> {
    let needed = count as usize * RtcpReportBlock::SIZE;
    if buf.remaining() < needed {
        return Err(Error::BufferTooSmall {
            required: needed,
            available: buf.remaining(),
        });
    }
    (0..count).map(|_| RtcpReportBlock::parse(buf)).collect()
}

pub(super) fn write_blocks(blocks: &[RtcpReportBlock], buf: &mut impl BufMut) {
    for block in blocks {
        block.serialize(buf);
    }
}
