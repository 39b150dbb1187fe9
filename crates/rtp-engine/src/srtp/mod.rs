//! Secure RTP (SRTP) implementation
//!
//! The queues only see the [`CryptoContext`] trait. [`SrtpContext`] is the
//! shipped AES-CM / HMAC-SHA1 implementation (RFC 3711). Contexts are kept
//! per SSRC in a [`CryptoContexts`] collection, where SSRC 0 acts as a
//! template for sources that have no context of their own yet.

pub mod auth;
pub mod context;
pub mod key_derivation;

pub use auth::{ReplayWindow, SrtpAuthenticator, REPLAY_WINDOW_SIZE};
pub use context::{SrtpContext, SrtpCryptoKey};
pub use key_derivation::{create_kdf_iv, srtp_kdf, KeyDerivationLabel};

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::Error;
use crate::packet::RtpPacket;
use crate::{Result, RtpSsrc};

/// SSRC of the template context
pub const WILDCARD_SSRC: RtpSsrc = 0;

/// SRTP encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpEncryptionAlgorithm {
    /// AES Counter Mode (Default in SRTP)
    AesCm,

    /// Null encryption (for debugging/testing only)
    Null,
}

/// SRTP authentication algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpAuthenticationAlgorithm {
    /// HMAC-SHA1 truncated to 80 bits (Default in SRTP)
    HmacSha1_80,

    /// HMAC-SHA1 truncated to 32 bits
    HmacSha1_32,

    /// Null authentication (for debugging/testing only)
    Null,
}

/// SRTP crypto suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpCryptoSuite {
    pub encryption: SrtpEncryptionAlgorithm,
    pub authentication: SrtpAuthenticationAlgorithm,

    /// Session encryption key length in bytes
    pub key_length: usize,

    /// Authentication tag length in bytes
    pub tag_length: usize,
}

/// Default SRTP crypto suite: AES-CM-128 + HMAC-SHA1-80
pub const SRTP_AES128_CM_SHA1_80: SrtpCryptoSuite = SrtpCryptoSuite {
    encryption: SrtpEncryptionAlgorithm::AesCm,
    authentication: SrtpAuthenticationAlgorithm::HmacSha1_80,
    key_length: 16,
    tag_length: 10,
};

/// Smaller tag SRTP crypto suite: AES-CM-128 + HMAC-SHA1-32
pub const SRTP_AES128_CM_SHA1_32: SrtpCryptoSuite = SrtpCryptoSuite {
    encryption: SrtpEncryptionAlgorithm::AesCm,
    authentication: SrtpAuthenticationAlgorithm::HmacSha1_32,
    key_length: 16,
    tag_length: 4,
};

/// No encryption or authentication (testing only)
pub const SRTP_NULL_NULL: SrtpCryptoSuite = SrtpCryptoSuite {
    encryption: SrtpEncryptionAlgorithm::Null,
    authentication: SrtpAuthenticationAlgorithm::Null,
    key_length: 16,
    tag_length: 0,
};

/// Why an inbound SRTP packet failed to unprotect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoFailure {
    #[error("SRTP authentication failed")]
    Authentication,

    #[error("SRTP replay detected")]
    Replay,
}

/// Per-SSRC cryptographic state used to protect and unprotect RTP packets
pub trait CryptoContext: Send + Sync + fmt::Debug {
    fn ssrc(&self) -> RtpSsrc;

    /// Apply the keystream for packet `index` of `ssrc` to `data`
    fn encrypt_in_place(&self, data: &mut [u8], index: u64, ssrc: RtpSsrc) -> Result<()>;

    /// Authentication tag over `data` with the rollover counter appended
    fn authenticate(&self, data: &[u8], roc: u32) -> Result<Vec<u8>>;

    /// `false` if `seq` was already accepted or is too old
    fn check_replay(&self, seq: u16) -> bool;

    /// Estimate the 48-bit packet index for `seq` (RFC 3711 Section 3.3.1)
    fn guess_index(&self, seq: u16) -> u64;

    /// Record `seq` as accepted
    fn update(&mut self, seq: u16);

    fn roc(&self) -> u32;
    fn set_roc(&mut self, roc: u32);

    fn tag_length(&self) -> usize;
    fn mki_length(&self) -> usize;

    /// Derive session keys from the master key at packet `index`
    fn derive_keys(&mut self, index: u64) -> Result<()>;

    /// New context for `ssrc` sharing this context's master key and suite
    fn derive_for_ssrc(&self, ssrc: RtpSsrc, roc: u32, key_derivation_rate: u64) -> Box<dyn CryptoContext>;
}

/// Crypto contexts keyed by SSRC
#[derive(Debug, Default)]
pub struct CryptoContexts {
    contexts: HashMap<RtpSsrc, Box<dyn CryptoContext>>,
}

impl CryptoContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context, replacing any existing one for the same SSRC
    pub fn insert(&mut self, context: Box<dyn CryptoContext>) -> Option<Box<dyn CryptoContext>> {
        let ssrc = context.ssrc();
        debug!("Installing crypto context for SSRC {:08x}", ssrc);
        self.contexts.insert(ssrc, context)
    }

    pub fn get(&self, ssrc: RtpSsrc) -> Option<&dyn CryptoContext> {
        self.contexts.get(&ssrc).map(|c| c.as_ref())
    }

    /// Context for `ssrc`, deriving one from the wildcard template when
    /// there is none yet.
    pub fn get_or_derive(&mut self, ssrc: RtpSsrc) -> Result<Option<&mut Box<dyn CryptoContext>>> {
        if !self.contexts.contains_key(&ssrc) {
            let Some(template) = self.contexts.get(&WILDCARD_SSRC) else {
                return Ok(None);
            };
            let mut context = template.derive_for_ssrc(ssrc, 0, 0);
            context.derive_keys(0)?;
            trace!("Derived crypto context for SSRC {:08x} from template", ssrc);
            self.contexts.insert(ssrc, context);
        }
        Ok(self.contexts.get_mut(&ssrc))
    }

    pub fn remove(&mut self, ssrc: RtpSsrc) -> bool {
        self.contexts.remove(&ssrc).is_some()
    }

    pub fn remove_all(&mut self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Encrypt and authenticate an outgoing packet in place.
///
/// The packet must have been built with `tag_length + mki_length` trailer
/// bytes. Advances the rollover counter after sequence number 0xFFFF.
pub fn protect(packet: &mut RtpPacket, context: &mut dyn CryptoContext) -> Result<()> {
    let trailer = context.tag_length() + context.mki_length();
    if packet.trailer_size() != trailer {
        return Err(Error::SrtpError(format!(
            "Packet reserves {} trailer bytes, crypto context needs {}",
            packet.trailer_size(), trailer
        )));
    }

    let seq = packet.sequence_number();
    let ssrc = packet.ssrc();
    let roc = context.roc();
    let index = ((roc as u64) << 16) | seq as u64;

    context.encrypt_in_place(packet.encrypted_region_mut(), index, ssrc)?;

    if context.tag_length() > 0 {
        let tag = context.authenticate(packet.authenticated_bytes(), roc)?;
        let mki = context.mki_length();
        packet.trailer_mut()[mki..].copy_from_slice(&tag);
    }

    if seq == 0xFFFF {
        context.set_roc(roc.wrapping_add(1));
    }
    Ok(())
}

/// Verify and decrypt an incoming packet in place.
///
/// On success the SRTP trailer is excluded from the payload and the replay
/// state is updated.
pub fn unprotect(packet: &mut RtpPacket, context: &mut dyn CryptoContext) -> std::result::Result<(), CryptoFailure> {
    let tag_length = context.tag_length();
    let mki = context.mki_length();
    packet
        .strip_trailer(tag_length + mki)
        .map_err(|_| CryptoFailure::Authentication)?;

    let seq = packet.sequence_number();
    if !context.check_replay(seq) {
        return Err(CryptoFailure::Replay);
    }

    let index = context.guess_index(seq);
    let roc = (index >> 16) as u32;

    if tag_length > 0 {
        let expected = context
            .authenticate(packet.authenticated_bytes(), roc)
            .map_err(|_| CryptoFailure::Authentication)?;
        if !auth::tags_equal(&expected, &packet.trailer()[mki..]) {
            return Err(CryptoFailure::Authentication);
        }
    }

    let ssrc = packet.ssrc();
    context
        .encrypt_in_place(packet.payload_mut(), index, ssrc)
        .map_err(|_| CryptoFailure::Authentication)?;
    context.update(seq);
    Ok(())
}
