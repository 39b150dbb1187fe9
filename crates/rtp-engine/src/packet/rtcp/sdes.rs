use bytes::{Buf, BufMut, Bytes};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item types, RFC 3550 Section 6.5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RtcpSdesItemType {
    End = 0,
    CName = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Location = 5,
    Tool = 6,
    Note = 7,
    Private = 8,
}

impl RtcpSdesItemType {
    /// Non-CNAME items, in the order the periodic reports rotate through them
    pub const ROTATION: [RtcpSdesItemType; 7] = [
        RtcpSdesItemType::Name,
        RtcpSdesItemType::Email,
        RtcpSdesItemType::Phone,
        RtcpSdesItemType::Location,
        RtcpSdesItemType::Tool,
        RtcpSdesItemType::Note,
        RtcpSdesItemType::Private,
    ];
}

impl TryFrom<u8> for RtcpSdesItemType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RtcpSdesItemType::End),
            1 => Ok(RtcpSdesItemType::CName),
            2 => Ok(RtcpSdesItemType::Name),
            3 => Ok(RtcpSdesItemType::Email),
            4 => Ok(RtcpSdesItemType::Phone),
            5 => Ok(RtcpSdesItemType::Location),
            6 => Ok(RtcpSdesItemType::Tool),
            7 => Ok(RtcpSdesItemType::Note),
            8 => Ok(RtcpSdesItemType::Private),
            _ => Err(Error::RtcpError(format!("Unknown SDES item type: {}", value))),
        }
    }
}

/// One SDES item. Values are at most 255 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesItem {
    pub item_type: RtcpSdesItemType,
    pub value: Bytes,
}

impl RtcpSdesItem {
    pub fn new(item_type: RtcpSdesItemType, value: impl Into<Bytes>) -> Self {
        let mut value: Bytes = value.into();
        value.truncate(255);
        Self { item_type, value }
    }

    pub fn cname(value: &str) -> Self {
        Self::new(RtcpSdesItemType::CName, Bytes::copy_from_slice(value.as_bytes()))
    }

    /// Value as text, replacing invalid UTF-8
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    fn size(&self) -> usize {
        2 + self.value.len()
    }
}

/// SDES chunk: one source and its items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesChunk {
    pub ssrc: RtpSsrc,
    pub items: Vec<RtcpSdesItem>,
}

impl RtcpSdesChunk {
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self { ssrc, items: Vec::new() }
    }

    pub fn add_item(&mut self, item: RtcpSdesItem) {
        self.items.push(item);
    }

    /// Chunk size including the END marker and padding to 32 bits
    pub fn size(&self) -> usize {
        let raw = 4 + self.items.iter().map(RtcpSdesItem::size).sum::<usize>() + 1;
        (raw + 3) / 4 * 4
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        let mut written = 4;
        for item in &self.items {
            buf.put_u8(item.item_type as u8);
            buf.put_u8(item.value.len() as u8);
            buf.put_slice(&item.value);
            written += item.size();
        }
        // END item plus zero padding up to the boundary
        let end = self.size() - written;
        buf.put_bytes(0, end);
    }
}

/// RTCP Source Description (SDES) packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpSourceDescription {
    pub chunks: Vec<RtcpSdesChunk>,
}

impl RtcpSourceDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, chunk: RtcpSdesChunk) {
        self.chunks.push(chunk);
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(RtcpSdesChunk::size).sum()
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        for chunk in &self.chunks {
            chunk.serialize(buf);
        }
    }
}

/// Parse an SDES body holding `chunk_count` chunks
pub fn parse_sdes(buf: &mut impl Buf, chunk_count: u8) -> Result<RtcpSourceDescription> {
    let mut chunks = Vec::with_capacity(chunk_count as usize);

    for _ in 0..chunk_count {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }
        let mut chunk = RtcpSdesChunk::new(buf.get_u32());
        let mut consumed = 4usize;

        loop {
            if !buf.has_remaining() {
                return Err(Error::RtcpError("SDES chunk without END item".to_string()));
            }
            let kind = buf.get_u8();
            consumed += 1;
            if kind == RtcpSdesItemType::End as u8 {
                break;
            }
            if !buf.has_remaining() {
                return Err(Error::RtcpError("Truncated SDES item".to_string()));
            }
            let len = buf.get_u8() as usize;
            consumed += 1;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            let value = buf.copy_to_bytes(len);
            consumed += len;

            match RtcpSdesItemType::try_from(kind) {
                Ok(item_type) => chunk.add_item(RtcpSdesItem { item_type, value }),
                // Unknown items are skipped
                Err(_) => {}
            }
        }

        let padding = (4 - consumed % 4) % 4;
        buf.advance(padding.min(buf.remaining()));
        chunks.push(chunk);
    }

    Ok(RtcpSourceDescription { chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_and_padding() {
        let mut chunk = RtcpSdesChunk::new(0x11223344);
        // SSRC (4) + END (1) -> 8
        assert_eq!(chunk.size(), 8);

        // SSRC (4) + CNAME item (2 + 11) + END (1) = 18 -> 20
        chunk.add_item(RtcpSdesItem::cname("alice@host1"));
        assert_eq!(chunk.size(), 20);

        let mut buf = Vec::new();
        chunk.serialize(&mut buf);
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[17..], &[0, 0, 0]);
    }

    #[test]
    fn test_serialize_parse() {
        let mut sdes = RtcpSourceDescription::new();
        let mut first = RtcpSdesChunk::new(1);
        first.add_item(RtcpSdesItem::cname("user@example.com"));
        first.add_item(RtcpSdesItem::new(RtcpSdesItemType::Tool, Bytes::from_static(b"rvoip")));
        sdes.add_chunk(first);
        let mut second = RtcpSdesChunk::new(2);
        second.add_item(RtcpSdesItem::cname("bob@host"));
        sdes.add_chunk(second);

        let mut buf = Vec::new();
        sdes.serialize(&mut buf);
        assert_eq!(buf.len(), sdes.size());
        assert_eq!(buf.len() % 4, 0);

        let parsed = parse_sdes(&mut &buf[..], 2).unwrap();
        assert_eq!(parsed, sdes);
        assert_eq!(parsed.chunks[0].items[1].value_str(), "rvoip");
    }

    #[test]
    fn test_value_truncated_to_255() {
        let item = RtcpSdesItem::new(RtcpSdesItemType::Note, Bytes::from(vec![b'n'; 400]));
        assert_eq!(item.value.len(), 255);
    }

    #[test]
    fn test_missing_end() {
        let buf = [0, 0, 0, 1, 1, 3, b'a', b'b', b'c'];
        assert!(parse_sdes(&mut &buf[..], 1).is_err());
    }
}
