//! Sender and receiver reports (RFC 3550 6.4)
//!
//! Both carry the reporter's SSRC and up to 31 reception report blocks; an SR
//! adds the sender information section in between.

use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};
use super::ntp::NtpTimestamp;
use super::report_block::{read_blocks, write_blocks, RtcpReportBlock};

fn read_reporter(buf: &mut impl Buf) -> Result<RtpSsrc> {
    if buf.remaining() < 4 {
        return Err(Error::BufferTooSmall {
            required: 4,
            available: buf.remaining(),
        });
    }
    Ok(buf.get_u32())
}

/// Sender information section of an SR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpSenderInfo {
    /// Wallclock time when the report was sent
    pub ntp_timestamp: NtpTimestamp,

    /// RTP timestamp corresponding to `ntp_timestamp`
    pub rtp_timestamp: RtpTimestamp,

    /// Total RTP data packets sent
    pub packet_count: u32,

    /// Total payload octets sent
    pub octet_count: u32,
}

impl RtcpSenderInfo {
    pub const SIZE: usize = 20;

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }
        Ok(Self {
            ntp_timestamp: NtpTimestamp::from_u64(buf.get_u64()),
            rtp_timestamp: buf.get_u32(),
            packet_count: buf.get_u32(),
            octet_count: buf.get_u32(),
        })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.ntp_timestamp.to_u64());
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
    }
}

/// Sender report: what an active sender says about its own stream and what
/// it received from others
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    pub ssrc: RtpSsrc,
    pub sender_info: RtcpSenderInfo,
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    pub fn new(ssrc: RtpSsrc, sender_info: RtcpSenderInfo) -> Self {
        Self {
            ssrc,
            sender_info,
            report_blocks: Vec::new(),
        }
    }

    pub fn add_report_block(&mut self, block: RtcpReportBlock) {
        self.report_blocks.push(block);
    }

    /// Body size in bytes, without the common header
    pub fn size(&self) -> usize {
        4 + RtcpSenderInfo::SIZE + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        self.sender_info.serialize(buf);
        write_blocks(&self.report_blocks, buf);
    }

    /// Parse an SR body carrying `report_count` blocks
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        let ssrc = read_reporter(buf)?;
        let sender_info = RtcpSenderInfo::parse(buf)?;
        Ok(Self {
            ssrc,
            sender_info,
            report_blocks: read_blocks(buf, report_count)?,
        })
    }
}

/// Receiver report: reception blocks from a participant that has not sent
/// data since its previous report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    pub ssrc: RtpSsrc,
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    /// A receiver report carrying an already built batch of blocks
    pub fn with_blocks(ssrc: RtpSsrc, report_blocks: Vec<RtcpReportBlock>) -> Self {
        Self { ssrc, report_blocks }
    }

    pub fn add_report_block(&mut self, block: RtcpReportBlock) {
        self.report_blocks.push(block);
    }

    pub fn size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        write_blocks(&self.report_blocks, buf);
    }

    /// Parse an RR body carrying `report_count` blocks
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        let ssrc = read_reporter(buf)?;
        Ok(Self {
            ssrc,
            report_blocks: read_blocks(buf, report_count)?,
        })
    }

    /// The block a peer sent about `ssrc`, if any
    pub fn block_for(&self, ssrc: RtpSsrc) -> Option<&RtcpReportBlock> {
        self.report_blocks.iter().find(|block| block.ssrc == ssrc)
    }
}
