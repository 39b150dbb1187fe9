use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Goodbye (BYE) packet
/// Defined in RFC 3550 Section 6.6
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpGoodbye {
    /// SSRC/CSRC identifiers leaving the session
    pub sources: Vec<RtpSsrc>,

    /// Reason for leaving (optional, at most 255 bytes on the wire)
    pub reason: Option<String>,
}

impl RtcpGoodbye {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new BYE packet for a single source
    pub fn new_for_source(ssrc: RtpSsrc) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    /// Create a new BYE packet for a single source with a reason
    pub fn new_with_reason(ssrc: RtpSsrc, reason: impl Into<String>) -> Self {
        Self {
            sources: vec![ssrc],
            reason: Some(reason.into()),
        }
    }

    fn reason_bytes(&self) -> &[u8] {
        match &self.reason {
            Some(reason) => {
                let bytes = reason.as_bytes();
                &bytes[..bytes.len().min(255)]
            }
            None => &[],
        }
    }

    /// Body size in bytes: identifiers, then the length-prefixed reason padded
    /// to a 32-bit boundary
    pub fn size(&self) -> usize {
        let mut size = self.sources.len() * 4;
        if self.reason.is_some() {
            size += (1 + self.reason_bytes().len() + 3) / 4 * 4;
        }
        size
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }

        if self.reason.is_some() {
            let reason = self.reason_bytes();
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason);
            let padding = (4 - ((1 + reason.len()) % 4)) % 4;
            buf.put_bytes(0, padding);
        }
    }
}

/// Parse a BYE body
pub fn parse_bye(buf: &mut impl Buf, source_count: u8) -> Result<RtcpGoodbye> {
    let needed = source_count as usize * 4;
    if buf.remaining() < needed {
        return Err(Error::BufferTooSmall {
            required: needed,
            available: buf.remaining(),
        });
    }
    let sources = (0..source_count).map(|_| buf.get_u32()).collect();

    let reason = if buf.has_remaining() {
        let reason_len = buf.get_u8() as usize;
        if buf.remaining() < reason_len {
            return Err(Error::BufferTooSmall {
                required: reason_len,
                available: buf.remaining(),
            });
        }
        let mut reason_bytes = vec![0u8; reason_len];
        buf.copy_to_slice(&mut reason_bytes);

        // Padding up to the 32-bit boundary
        let padding = (4 - ((1 + reason_len) % 4)) % 4;
        buf.advance(padding.min(buf.remaining()));

        Some(String::from_utf8_lossy(&reason_bytes).into_owned())
    } else {
        None
    };

    Ok(RtcpGoodbye { sources, reason })
}
