//! RTP packet codec
//!
//! [`RtpHeader`] holds the parsed fixed header, CSRC list and header
//! extension. [`RtpPacket`] owns the complete wire buffer and tracks where the
//! header, payload, padding and SRTP trailer (tag + MKI) start, so the crypto
//! layer can transform the payload in place.

pub mod rtcp;

use bytes::{Buf, BufMut, Bytes};
use bitvec::prelude::*;
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Padding flag position in the first byte
pub const RTP_PADDING_FLAG: usize = 2;

/// Extension flag position in the first byte
pub const RTP_EXTENSION_FLAG: usize = 3;

/// CSRC count position in the first byte (4 bits)
pub const RTP_CC_OFFSET: usize = 4;

/// Marker bit position in the second byte
pub const RTP_MARKER_FLAG: usize = 0;

/// Payload type position in the second byte (7 bits)
pub const RTP_PT_OFFSET: usize = 1;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Maximum number of CSRC identifiers in one header
pub const RTP_MAX_CSRC: usize = 15;

/// Second-byte mask and value matching RTCP SR/RR packet types (200/201)
/// landing on the data port: the marker bit overlaps the top bit of the
/// RTCP packet type.
pub const RTP_INVALID_PT_MASK: u8 = 0x7e;
pub const RTP_INVALID_PT_VALUE: u8 = 0x48;

/// RTP header implementation according to RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Extension flag
    pub extension: bool,

    /// CSRC count (number of contributing sources)
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,

    /// Extension header profile identifier
    pub extension_id: Option<u16>,

    /// Extension data (without the 4-byte extension header)
    pub extension_data: Option<Bytes>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

impl RtpHeader {
    /// Create a new RTP header with default values
    pub fn new(payload_type: u8, sequence_number: RtpSequenceNumber,
               timestamp: RtpTimestamp, ssrc: RtpSsrc) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_id: None,
            extension_data: None,
        }
    }

    /// Attach a CSRC list, keeping `cc` consistent
    pub fn with_csrc(mut self, csrc: Vec<RtpCsrc>) -> Self {
        self.cc = csrc.len() as u8;
        self.csrc = csrc;
        self
    }

    /// Attach a header extension, keeping the extension flag consistent
    pub fn with_extension(mut self, profile_id: u16, data: Bytes) -> Self {
        self.extension = true;
        self.extension_id = Some(profile_id);
        self.extension_data = Some(data);
        self
    }

    /// Get the size of the header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;

        if self.extension {
            // 4 bytes for the extension header, data rounded up to 32-bit words
            let ext_len = self.extension_data.as_ref().map(|d| d.len()).unwrap_or(0);
            size += 4 + (ext_len + 3) / 4 * 4;
        }

        size
    }

    /// Parse an RTP header from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // First byte: version (2 bits), padding (1 bit), extension (1 bit), CSRC count (4 bits)
        let first_byte = buf.get_u8();
        let bits = first_byte.view_bits::<Msb0>();

        let version = bits[0..2].load_be::<u8>();
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("Invalid RTP version: {}", version)));
        }

        let padding = bits[RTP_PADDING_FLAG];
        let extension = bits[RTP_EXTENSION_FLAG];
        let cc = bits[RTP_CC_OFFSET..RTP_CC_OFFSET + 4].load_be::<u8>();

        // Second byte: marker (1 bit), payload type (7 bits)
        let second_byte = buf.get_u8();
        let bits = second_byte.view_bits::<Msb0>();

        let marker = bits[RTP_MARKER_FLAG];
        let payload_type = bits[RTP_PT_OFFSET..RTP_PT_OFFSET + 7].load_be::<u8>();

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_len = cc as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::BufferTooSmall {
                required: csrc_len,
                available: buf.remaining(),
            });
        }
        let csrc = (0..cc).map(|_| buf.get_u32()).collect();

        let (extension_id, extension_data) = if extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }

            let ext_id = buf.get_u16();
            let ext_length = buf.get_u16() as usize * 4; // Length in 32-bit words

            if buf.remaining() < ext_length {
                return Err(Error::BufferTooSmall {
                    required: ext_length,
                    available: buf.remaining(),
                });
            }

            (Some(ext_id), Some(buf.copy_to_bytes(ext_length)))
        } else {
            (None, None)
        };

        Ok(Self {
            version,
            padding,
            extension,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_id,
            extension_data,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<()> {
        if self.cc as usize != self.csrc.len() || self.csrc.len() > RTP_MAX_CSRC {
            return Err(Error::InvalidParameter(format!(
                "CSRC count ({}) does not match CSRC list length ({})",
                self.cc, self.csrc.len()
            )));
        }

        let mut first_byte = 0u8;
        first_byte |= (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 1 << 5;
        }
        if self.extension {
            first_byte |= 1 << 4;
        }
        first_byte |= self.cc & 0x0F;
        buf.put_u8(first_byte);

        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 1 << 7;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let (Some(ext_id), Some(ext_data)) = (self.extension_id, &self.extension_data) else {
                return Err(Error::InvalidParameter(
                    "Extension flag is set but extension data is missing".to_string()
                ));
            };
            let words = (ext_data.len() + 3) / 4;
            if words > u16::MAX as usize {
                return Err(Error::EncodeError(format!(
                    "Header extension too long: {} bytes", ext_data.len()
                )));
            }
            buf.put_u16(ext_id);
            buf.put_u16(words as u16);
            buf.put_slice(ext_data);
            buf.put_bytes(0, words * 4 - ext_data.len());
        }

        Ok(())
    }
}

/// An RTP packet together with its wire buffer
///
/// `header_size + payload_size + padding_size + trailer_size` always equals
/// the buffer length.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Parsed header view
    pub header: RtpHeader,

    data: Vec<u8>,
    header_size: usize,
    payload_size: usize,
    padding_size: usize,
    trailer_size: usize,
}

impl RtpPacket {
    /// Build an outgoing packet.
    ///
    /// `pad_to` rounds the packet up to a multiple of that many bytes (0 disables
    /// padding). `trailer_len` reserves room at the end for an SRTP tag and MKI.
    pub fn build(mut header: RtpHeader, payload: &[u8], pad_to: u8, trailer_len: usize) -> Result<Self> {
        header.cc = header.csrc.len() as u8;
        header.extension = header.extension_data.is_some();
        if header.extension && header.extension_id.is_none() {
            header.extension_id = Some(0);
        }

        let header_size = header.size();
        let unpadded = header_size + payload.len();
        let padding_size = if pad_to != 0 {
            pad_to as usize - unpadded % pad_to as usize
        } else {
            0
        };
        header.padding = padding_size > 0;

        let total = unpadded + padding_size + trailer_len;
        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| Error::ResourceExhausted(format!("packet buffer of {} bytes: {}", total, e)))?;

        header.serialize(&mut data)?;
        data.put_slice(payload);
        if padding_size > 0 {
            data.put_bytes(0, padding_size - 1);
            data.put_u8(padding_size as u8);
        }
        data.put_bytes(0, trailer_len);

        Ok(Self {
            header,
            data,
            header_size,
            payload_size: payload.len(),
            padding_size,
            trailer_size: trailer_len,
        })
    }

    /// Create a packet with basic parameters and no padding
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: &[u8],
    ) -> Result<Self> {
        let header = RtpHeader::new(payload_type, sequence_number, timestamp, ssrc);
        Self::build(header, payload, 0, 0)
    }

    /// Parse an RTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::from_vec(data.to_vec(), true)
    }

    /// Parse an inbound packet whose padding length may still be encrypted.
    ///
    /// The padding bit is ignored while computing the payload boundaries; the
    /// wire bytes are left untouched so authentication still covers them.
    /// Returns whether the padding bit was set, for a later call to
    /// [`RtpPacket::recompute_payload_length`].
    pub fn parse_deferring_padding(data: &[u8]) -> Result<(Self, bool)> {
        let pad_set = data.first().map(|b| b & 0x20 != 0).unwrap_or(false);
        let mut packet = Self::from_vec(data.to_vec(), false)?;
        packet.header.padding = false;
        Ok((packet, pad_set))
    }

    fn from_vec(data: Vec<u8>, honour_padding: bool) -> Result<Self> {
        let mut cursor = &data[..];
        let header = RtpHeader::parse(&mut cursor)?;
        let header_size = data.len() - cursor.len();

        let padding_size = if honour_padding && header.padding {
            let pad = data.last().copied().unwrap_or(0) as usize;
            if pad == 0 || header_size + pad > data.len() {
                return Err(Error::InvalidPacket(format!(
                    "Invalid padding value: {} exceeds remaining bytes: {}",
                    pad, data.len() - header_size
                )));
            }
            pad
        } else {
            0
        };

        let payload_size = data.len() - header_size - padding_size;
        Ok(Self {
            header,
            data,
            header_size,
            payload_size,
            padding_size,
            trailer_size: 0,
        })
    }

    /// Re-derive the payload length after decryption when the padding bit was
    /// set on the wire.
    pub fn recompute_payload_length(&mut self, padding: bool) -> Result<()> {
        if !padding {
            return Ok(());
        }
        let last = self.header_size + self.payload_size;
        let pad = if self.payload_size > 0 { self.data[last - 1] as usize } else { 0 };
        if pad == 0 || pad > self.payload_size {
            return Err(Error::InvalidPacket(format!(
                "Invalid padding value: {} exceeds payload size: {}",
                pad, self.payload_size
            )));
        }
        self.header.padding = true;
        self.payload_size -= pad;
        self.padding_size = pad;
        Ok(())
    }

    /// Mark the last `len` bytes of the payload region as SRTP trailer.
    pub fn strip_trailer(&mut self, len: usize) -> Result<()> {
        if len > self.payload_size {
            return Err(Error::InvalidPacket(format!(
                "SRTP trailer of {} bytes does not fit in payload of {} bytes",
                len, self.payload_size
            )));
        }
        self.payload_size -= len;
        self.trailer_size += len;
        Ok(())
    }

    /// Generic validity check for packets received on the data port.
    pub fn is_valid_data_header(&self) -> bool {
        let second = self.data[1];
        self.header.version == RTP_VERSION
            && (second & RTP_INVALID_PT_MASK) != RTP_INVALID_PT_VALUE
    }

    /// Complete wire bytes, including the SRTP trailer
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Wire bytes covered by SRTP authentication (everything but the trailer)
    pub fn authenticated_bytes(&self) -> &[u8] {
        &self.data[..self.data.len() - self.trailer_size]
    }

    /// Payload region
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_size..self.header_size + self.payload_size]
    }

    /// Mutable payload region for in-place encryption
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_size;
        &mut self.data[start..start + self.payload_size]
    }

    /// Payload plus padding, the region SRTP encrypts
    pub fn encrypted_region_mut(&mut self) -> &mut [u8] {
        let start = self.header_size;
        let end = self.data.len() - self.trailer_size;
        &mut self.data[start..end]
    }

    /// SRTP trailer region (MKI followed by the authentication tag)
    pub fn trailer(&self) -> &[u8] {
        &self.data[self.data.len() - self.trailer_size..]
    }

    pub fn trailer_mut(&mut self) -> &mut [u8] {
        let start = self.data.len() - self.trailer_size;
        &mut self.data[start..]
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn padding_size(&self) -> usize {
        self.padding_size
    }

    pub fn trailer_size(&self) -> usize {
        self.trailer_size
    }

    /// Total size on the wire
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.header.ssrc
    }

    pub fn sequence_number(&self) -> RtpSequenceNumber {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> RtpTimestamp {
        self.header.timestamp
    }

    pub fn set_sequence_number(&mut self, seq: RtpSequenceNumber) {
        self.header.sequence_number = seq;
        self.data[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_timestamp(&mut self, timestamp: RtpTimestamp) {
        self.header.timestamp = timestamp;
        self.data[4..8].copy_from_slice(&timestamp.to_be_bytes());
    }

    pub fn set_ssrc(&mut self, ssrc: RtpSsrc) {
        self.header.ssrc = ssrc;
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.header.marker = marker;
        let bits = self.data[1].view_bits_mut::<Msb0>();
        bits.set(RTP_MARKER_FLAG, marker);
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.header.payload_type = payload_type & 0x7F;
        self.data[1] = (self.data[1] & 0x80) | (payload_type & 0x7F);
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload_size)
            .field("padding", &self.padding_size)
            .field("trailer", &self.trailer_size)
            .finish()
    }
}

/// Format bytes as a space separated hex string, for trace logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_serialize_parse() {
        let original = RtpHeader::new(96, 1000, 0x12345678, 0xabcdef01);

        let mut buf = Vec::new();
        original.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), RTP_MIN_HEADER_SIZE);

        let parsed = RtpHeader::parse(&mut &buf[..]).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_build_parse_round_trip_without_padding() {
        let header = RtpHeader::new(0, 4242, 160, 0x01020304)
            .with_csrc(vec![0x11111111, 0x22222222])
            .with_extension(0xBEDE, Bytes::from_static(&[1, 2, 3, 4, 5]));
        let payload = b"voice frame";

        let built = RtpPacket::build(header, payload, 0, 0).unwrap();
        let parsed = RtpPacket::parse(built.as_bytes()).unwrap();

        assert_eq!(parsed.payload(), payload);
        assert_eq!(parsed.padding_size(), 0);
        assert!(!parsed.header.padding);
        assert_eq!(parsed.header.csrc, vec![0x11111111, 0x22222222]);
        assert_eq!(parsed.header.extension_id, Some(0xBEDE));
        // Extension data is padded to a whole word
        assert_eq!(parsed.header.extension_data.as_deref(), Some(&[1, 2, 3, 4, 5, 0, 0, 0][..]));
        assert_eq!(parsed.header_size(), 12 + 8 + 4 + 8);
    }

    #[test]
    fn test_build_with_padding() {
        let header = RtpHeader::new(8, 1, 0, 7);
        // 12 header + 5 payload = 17, padded to 20
        let built = RtpPacket::build(header, b"hello", 4, 0).unwrap();
        assert_eq!(built.size(), 20);
        assert_eq!(built.padding_size(), 3);
        assert_eq!(*built.as_bytes().last().unwrap(), 3);
        assert!(built.header.padding);

        let parsed = RtpPacket::parse(built.as_bytes()).unwrap();
        assert_eq!(parsed.payload(), b"hello");
        assert_eq!(parsed.padding_size(), 3);

        // An already aligned packet still receives a full block of padding
        let aligned = RtpPacket::build(RtpHeader::new(8, 1, 0, 7), b"abcd", 4, 0).unwrap();
        assert_eq!(aligned.padding_size(), 4);
    }

    #[test]
    fn test_size_invariant_with_trailer() {
        let mut packet = RtpPacket::build(RtpHeader::new(0, 1, 2, 3), b"payload!", 4, 10).unwrap();
        assert_eq!(
            packet.header_size() + packet.payload_size() + packet.padding_size() + packet.trailer_size(),
            packet.size()
        );
        assert_eq!(packet.trailer().len(), 10);
        assert_eq!(packet.authenticated_bytes().len(), packet.size() - 10);
        packet.trailer_mut().copy_from_slice(&[0xAA; 10]);
        assert_eq!(packet.payload(), b"payload!");
    }

    #[test]
    fn test_deferred_padding() {
        let built = RtpPacket::build(RtpHeader::new(0, 1, 2, 3), b"abcde", 8, 0).unwrap();
        let (mut packet, pad_set) = RtpPacket::parse_deferring_padding(built.as_bytes()).unwrap();
        assert!(pad_set);
        assert_eq!(packet.padding_size(), 0);
        assert_eq!(packet.payload_size(), 5 + built.padding_size());

        packet.recompute_payload_length(pad_set).unwrap();
        assert_eq!(packet.payload(), b"abcde");
        assert!(packet.header.padding);
    }

    #[test]
    fn test_rtcp_collision_mask() {
        let mut data = RtpPacket::new_with_payload(0, 1, 2, 3, b"x").unwrap().as_bytes().to_vec();
        assert!(RtpPacket::parse(&data).unwrap().is_valid_data_header());

        // An RTCP SR (type 200) has the same leading version bits
        data[1] = 200;
        assert!(!RtpPacket::parse(&data).unwrap().is_valid_data_header());
        data[1] = 201;
        assert!(!RtpPacket::parse(&data).unwrap().is_valid_data_header());
        data[1] = 202;
        assert!(RtpPacket::parse(&data).unwrap().is_valid_data_header());
    }

    #[test]
    fn test_setters_keep_wire_in_sync() {
        let mut packet = RtpPacket::new_with_payload(0, 1, 2, 3, b"data").unwrap();
        packet.set_sequence_number(0xfd70);
        packet.set_timestamp(0xdeadbeef);
        packet.set_ssrc(0x0badcafe);
        packet.set_marker(true);
        packet.set_payload_type(96);

        let parsed = RtpPacket::parse(packet.as_bytes()).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert!(parsed.header.marker);
        assert_eq!(parsed.header.payload_type, 96);
    }

    #[test]
    fn test_parse_real_world_packet() {
        // 0x80 = Version 2, no padding, no extension, 0 CSRCs; PT 0 (PCMU)
        let packet_data = [
            0x80, 0x00, 0xfd, 0x70, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x54, 0x65, 0x73, 0x74
        ];

        let parsed = RtpPacket::parse(&packet_data).unwrap();
        assert_eq!(parsed.header.version, 2);
        assert_eq!(parsed.header.payload_type, 0);
        assert_eq!(parsed.header.sequence_number, 0xfd70);
        assert_eq!(parsed.payload(), b"Test");
    }

    #[test]
    fn test_malformed_packets() {
        assert!(matches!(RtpPacket::parse(&[0x80, 0x00]), Err(Error::BufferTooSmall { .. })));

        // Version 1
        let mut data = RtpPacket::new_with_payload(0, 1, 2, 3, b"x").unwrap().as_bytes().to_vec();
        data[0] = 0x40;
        assert!(matches!(RtpPacket::parse(&data), Err(Error::InvalidPacket(_))));

        // CC claims two CSRCs that are not there
        let mut data = RtpPacket::new_with_payload(0, 1, 2, 3, b"").unwrap().as_bytes().to_vec();
        data[0] |= 0x02;
        assert!(RtpPacket::parse(&data).is_err());

        // Padding longer than the payload
        let mut data = RtpPacket::new_with_payload(0, 1, 2, 3, b"ab").unwrap().as_bytes().to_vec();
        data[0] |= 0x20;
        *data.last_mut().unwrap() = 40;
        assert!(matches!(RtpPacket::parse(&data), Err(Error::InvalidPacket(_))));
    }
}
