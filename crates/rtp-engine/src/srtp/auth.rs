use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::Error;
use crate::Result;
use super::SrtpAuthenticationAlgorithm;

type HmacSha1 = Hmac<Sha1>;

/// Number of packet indices tracked behind the highest one
pub const REPLAY_WINDOW_SIZE: i64 = 64;

/// SRTP authentication (RFC 3711 Section 4.2)
#[derive(Clone)]
pub struct SrtpAuthenticator {
    algorithm: SrtpAuthenticationAlgorithm,
    auth_key: Vec<u8>,
    tag_length: usize,
}

impl std::fmt::Debug for SrtpAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpAuthenticator")
            .field("algorithm", &self.algorithm)
            .field("tag_length", &self.tag_length)
            .finish()
    }
}

impl SrtpAuthenticator {
    pub fn new(algorithm: SrtpAuthenticationAlgorithm, auth_key: Vec<u8>, tag_length: usize) -> Self {
        Self {
            algorithm,
            auth_key,
            tag_length,
        }
    }

    /// HMAC-SHA1 over the packet followed by the big-endian ROC, truncated
    /// to the tag length
    pub fn calculate_auth_tag(&self, packet_data: &[u8], roc: u32) -> Result<Vec<u8>> {
        if self.algorithm == SrtpAuthenticationAlgorithm::Null {
            return Ok(Vec::new());
        }

        let mut mac = HmacSha1::new_from_slice(&self.auth_key)
            .map_err(|e| Error::SrtpError(format!("Failed to create HMAC: {}", e)))?;
        mac.update(packet_data);
        mac.update(&roc.to_be_bytes());

        let result = mac.finalize().into_bytes();
        Ok(result[..self.tag_length.min(result.len())].to_vec())
    }

    /// Constant-time tag comparison
    pub fn verify_auth_tag(&self, packet_data: &[u8], tag: &[u8], roc: u32) -> Result<bool> {
        if self.algorithm == SrtpAuthenticationAlgorithm::Null {
            return Ok(true);
        }
        let expected = self.calculate_auth_tag(packet_data, roc)?;
        Ok(tags_equal(&expected, tag))
    }

    pub fn tag_length(&self) -> usize {
        self.tag_length
    }
}

/// Compare two tags without an early exit
pub fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Sliding bitmask of recently accepted packet indices.
///
/// Bit `n` is set when the index `highest - n` was accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    bits: u64,
}

impl ReplayWindow {
    /// `delta` is the candidate index minus the highest accepted index.
    pub fn check(&self, delta: i64) -> bool {
        if delta > 0 {
            return true;
        }
        let behind = -delta;
        if behind >= REPLAY_WINDOW_SIZE {
            return false;
        }
        (self.bits >> behind) & 1 == 0
    }

    /// Record an accepted index
    pub fn update(&mut self, delta: i64) {
        if delta > 0 {
            self.bits = if delta >= REPLAY_WINDOW_SIZE { 0 } else { self.bits << delta };
            self.bits |= 1;
        } else if -delta < REPLAY_WINDOW_SIZE {
            self.bits |= 1 << -delta;
        }
    }
}
