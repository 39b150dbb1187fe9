//! RTCP Packet module
//!
//! Structures for the RTCP packets defined in RFC 3550 (SR, RR, SDES, BYE,
//! APP) and for compound packets, which is how RTCP always travels on the
//! wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// Size of the common header shared by every RTCP packet
pub const RTCP_HEADER_SIZE: usize = 4;

/// Most report blocks a single SR/RR can carry (5-bit count field)
pub const RTCP_MAX_REPORT_BLOCKS: usize = 31;

/// RTCP packet types as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report (SR)
    SenderReport = 200,

    /// Receiver Report (RR)
    ReceiverReport = 201,

    /// Source Description (SDES)
    SourceDescription = 202,

    /// Goodbye (BYE)
    Goodbye = 203,

    /// Application-Defined (APP)
    ApplicationDefined = 204,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(RtcpPacketType::SenderReport),
            201 => Ok(RtcpPacketType::ReceiverReport),
            202 => Ok(RtcpPacketType::SourceDescription),
            203 => Ok(RtcpPacketType::Goodbye),
            204 => Ok(RtcpPacketType::ApplicationDefined),
            _ => Err(Error::RtcpError(format!("Unknown RTCP packet type: {}", value))),
        }
    }
}

mod report;
mod sdes;
mod bye;
mod app;
mod report_block;
mod ntp;

pub use report_block::RtcpReportBlock;
pub use ntp::{NtpTimestamp, NTP_UNIX_OFFSET};
pub use report::{RtcpReceiverReport, RtcpSenderInfo, RtcpSenderReport};
pub use sdes::{RtcpSourceDescription, RtcpSdesChunk, RtcpSdesItem, RtcpSdesItemType};
pub use bye::RtcpGoodbye;
pub use app::RtcpApplicationDefined;

/// RTCP packet variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(RtcpSenderReport),
    ReceiverReport(RtcpReceiverReport),
    SourceDescription(RtcpSourceDescription),
    Goodbye(RtcpGoodbye),
    ApplicationDefined(RtcpApplicationDefined),

    /// A packet type this engine does not interpret (XR, feedback, ...).
    /// Kept so the remaining packets of a compound can still be processed.
    Unknown {
        packet_type: u8,
        count: u8,
        payload: Bytes,
    },
}

impl RtcpPacket {
    /// Wire packet type
    pub fn packet_type(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport(_) => RtcpPacketType::SenderReport as u8,
            RtcpPacket::ReceiverReport(_) => RtcpPacketType::ReceiverReport as u8,
            RtcpPacket::SourceDescription(_) => RtcpPacketType::SourceDescription as u8,
            RtcpPacket::Goodbye(_) => RtcpPacketType::Goodbye as u8,
            RtcpPacket::ApplicationDefined(_) => RtcpPacketType::ApplicationDefined as u8,
            RtcpPacket::Unknown { packet_type, .. } => *packet_type,
        }
    }

    /// Value of the 5-bit count field
    fn count(&self) -> u8 {
        let count = match self {
            RtcpPacket::SenderReport(sr) => sr.report_blocks.len(),
            RtcpPacket::ReceiverReport(rr) => rr.report_blocks.len(),
            RtcpPacket::SourceDescription(sdes) => sdes.chunks.len(),
            RtcpPacket::Goodbye(bye) => bye.sources.len(),
            RtcpPacket::ApplicationDefined(app) => app.subtype as usize,
            RtcpPacket::Unknown { count, .. } => *count as usize,
        };
        count.min(RTCP_MAX_REPORT_BLOCKS) as u8
    }

    fn body_size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(sr) => sr.size(),
            RtcpPacket::ReceiverReport(rr) => rr.size(),
            RtcpPacket::SourceDescription(sdes) => sdes.size(),
            RtcpPacket::Goodbye(bye) => bye.size(),
            RtcpPacket::ApplicationDefined(app) => app.size(),
            RtcpPacket::Unknown { payload, .. } => (payload.len() + 3) / 4 * 4,
        }
    }

    /// Size on the wire, including the common header
    pub fn size(&self) -> usize {
        RTCP_HEADER_SIZE + self.body_size()
    }

    /// Serialize the packet, common header included
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        let count = match self {
            RtcpPacket::SenderReport(sr) => sr.report_blocks.len(),
            RtcpPacket::ReceiverReport(rr) => rr.report_blocks.len(),
            RtcpPacket::SourceDescription(sdes) => sdes.chunks.len(),
            RtcpPacket::Goodbye(bye) => bye.sources.len(),
            _ => 0,
        };
        if count > RTCP_MAX_REPORT_BLOCKS {
            return Err(Error::EncodeError(format!(
                "RTCP packet type {} has {} entries, at most {} fit in the count field",
                self.packet_type(), count, RTCP_MAX_REPORT_BLOCKS
            )));
        }

        let size = self.size();
        let words = size / 4 - 1;
        if words > u16::MAX as usize {
            return Err(Error::EncodeError(format!("RTCP packet too long: {} bytes", size)));
        }

        buf.put_u8((RTCP_VERSION << 6) | self.count());
        buf.put_u8(self.packet_type());
        buf.put_u16(words as u16);

        match self {
            RtcpPacket::SenderReport(sr) => sr.serialize(buf),
            RtcpPacket::ReceiverReport(rr) => rr.serialize(buf),
            RtcpPacket::SourceDescription(sdes) => sdes.serialize(buf),
            RtcpPacket::Goodbye(bye) => bye.serialize(buf),
            RtcpPacket::ApplicationDefined(app) => app.serialize(buf),
            RtcpPacket::Unknown { payload, .. } => {
                buf.put_slice(payload);
                buf.put_bytes(0, (4 - payload.len() % 4) % 4);
            }
        }
        Ok(())
    }

    /// Parse a single RTCP packet at the start of `data`.
    ///
    /// Returns the packet and the number of bytes it occupies.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTCP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let first_byte = data[0];
        let version = first_byte >> 6;
        if version != RTCP_VERSION {
            return Err(Error::RtcpError(format!("Invalid RTCP version: {}", version)));
        }
        let padding = first_byte & 0x20 != 0;
        let count = first_byte & 0x1F;
        let packet_type = data[1];
        let total = (u16::from_be_bytes([data[2], data[3]]) as usize + 1) * 4;

        if data.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: data.len(),
            });
        }

        let mut body = &data[RTCP_HEADER_SIZE..total];
        if padding {
            let pad = body.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > body.len() {
                return Err(Error::RtcpError(format!("Invalid RTCP padding: {}", pad)));
            }
            body = &body[..body.len() - pad];
        }

        let packet = match RtcpPacketType::try_from(packet_type) {
            Ok(RtcpPacketType::SenderReport) => {
                RtcpPacket::SenderReport(RtcpSenderReport::parse(&mut body, count)?)
            }
            Ok(RtcpPacketType::ReceiverReport) => {
                RtcpPacket::ReceiverReport(RtcpReceiverReport::parse(&mut body, count)?)
            }
            Ok(RtcpPacketType::SourceDescription) => {
                RtcpPacket::SourceDescription(sdes::parse_sdes(&mut body, count)?)
            }
            Ok(RtcpPacketType::Goodbye) => RtcpPacket::Goodbye(bye::parse_bye(&mut body, count)?),
            Ok(RtcpPacketType::ApplicationDefined) => {
                RtcpPacket::ApplicationDefined(app::parse_app(&mut body, count)?)
            }
            Err(_) => RtcpPacket::Unknown {
                packet_type,
                count,
                payload: Bytes::copy_from_slice(body),
            },
        };

        Ok((packet, total))
    }
}

/// A compound RTCP packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpCompoundPacket {
    pub packets: Vec<RtcpPacket>,
}

impl RtcpCompoundPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, packet: RtcpPacket) {
        self.packets.push(packet);
    }

    pub fn size(&self) -> usize {
        self.packets.iter().map(RtcpPacket::size).sum()
    }

    /// SSRCs of every SR/RR in the compound
    pub fn reporters(&self) -> impl Iterator<Item = RtpSsrc> + '_ {
        self.packets.iter().filter_map(|p| match p {
            RtcpPacket::SenderReport(sr) => Some(sr.ssrc),
            RtcpPacket::ReceiverReport(rr) => Some(rr.ssrc),
            _ => None,
        })
    }

    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        for packet in &self.packets {
            packet.serialize(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Validate and parse a compound packet.
    ///
    /// The first packet must be an SR or RR with version 2 and no padding,
    /// and the sub-packet lengths must add up to exactly the datagram length
    /// (RFC 3550 Appendix A.2).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTCP_HEADER_SIZE,
                available: data.len(),
            });
        }

        // Version 2, no padding, SR or RR (201 differs from 200 in the lowest bit only)
        let mask = u16::from_be_bytes([data[0], data[1]]) & 0xE0FE;
        if mask != ((RTCP_VERSION as u16) << 14) | RtcpPacketType::SenderReport as u16 {
            return Err(Error::RtcpError(format!(
                "Invalid compound header: first bytes {:02x} {:02x}",
                data[0], data[1]
            )));
        }

        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (packet, used) = RtcpPacket::parse(&data[offset..])?;
            packets.push(packet);
            offset += used;
        }

        if offset != data.len() {
            return Err(Error::RtcpError(format!(
                "Compound length mismatch: sub-packets cover {} of {} bytes",
                offset, data.len()
            )));
        }

        Ok(Self { packets })
    }
}
