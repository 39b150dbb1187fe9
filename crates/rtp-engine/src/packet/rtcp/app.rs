use bytes::{Buf, BufMut, Bytes};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Application-Defined (APP) packet, RFC 3550 Section 6.7
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpApplicationDefined {
    /// Subtype, carried in the count field of the common header
    pub subtype: u8,

    pub ssrc: RtpSsrc,

    /// Four ASCII characters naming the application
    pub name: [u8; 4],

    /// Application data, a multiple of 32 bits on the wire
    pub data: Bytes,
}

impl RtcpApplicationDefined {
    pub fn new(ssrc: RtpSsrc, name: [u8; 4], data: Bytes) -> Self {
        Self {
            subtype: 0,
            ssrc,
            name,
            data,
        }
    }

    pub fn size(&self) -> usize {
        8 + (self.data.len() + 3) / 4 * 4
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
        buf.put_bytes(0, (4 - self.data.len() % 4) % 4);
    }
}

pub fn parse_app(buf: &mut impl Buf, subtype: u8) -> Result<RtcpApplicationDefined> {
    if buf.remaining() < 8 {
        return Err(Error::BufferTooSmall {
            required: 8,
            available: buf.remaining(),
        });
    }
    let ssrc = buf.get_u32();
    let mut name = [0u8; 4];
    buf.copy_to_slice(&mut name);
    let data = buf.copy_to_bytes(buf.remaining());

    Ok(RtcpApplicationDefined {
        subtype,
        ssrc,
        name,
        data,
    })
}
