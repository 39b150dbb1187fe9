use ctr::cipher::{KeyIvInit, StreamCipher};
use tracing::debug;

use crate::error::Error;
use crate::{Result, RtpSsrc};
use super::auth::{ReplayWindow, SrtpAuthenticator};
use super::key_derivation::{srtp_kdf, Aes128Ctr, KeyDerivationLabel, SRTP_MASTER_KEY_LEN, SRTP_SALT_LEN};
use super::{CryptoContext, SrtpAuthenticationAlgorithm, SrtpCryptoSuite, SrtpEncryptionAlgorithm};

/// Session authentication key length for HMAC-SHA1
const SRTP_AUTH_KEY_LEN: usize = 20;

/// Master keying material shared by a crypto suite
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpCryptoKey {
    key: Vec<u8>,
    salt: Vec<u8>,
}

impl SrtpCryptoKey {
    pub fn new(key: Vec<u8>, salt: Vec<u8>) -> Self {
        Self { key, salt }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

impl std::fmt::Debug for SrtpCryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpCryptoKey")
            .field("key_len", &self.key.len())
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

/// Session keys derived from the master key
#[derive(Clone)]
struct SessionKeys {
    cipher_key: Vec<u8>,
    cipher_salt: Vec<u8>,
    authenticator: SrtpAuthenticator,
}

/// AES-CM / HMAC-SHA1 crypto context for one SSRC
#[derive(Clone)]
pub struct SrtpContext {
    ssrc: RtpSsrc,
    suite: SrtpCryptoSuite,
    master: SrtpCryptoKey,
    key_derivation_rate: u64,
    mki_length: usize,

    roc: u32,
    /// Highest sequence number accepted so far
    s_l: Option<u16>,
    replay: ReplayWindow,

    keys: Option<SessionKeys>,
}

impl std::fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpContext")
            .field("ssrc", &format_args!("{:08x}", self.ssrc))
            .field("suite", &self.suite)
            .field("roc", &self.roc)
            .field("s_l", &self.s_l)
            .field("keys_derived", &self.keys.is_some())
            .finish()
    }
}

impl SrtpContext {
    /// Create a context. Session keys are not available until
    /// [`CryptoContext::derive_keys`] runs.
    ///
    /// SSRC 0 makes a wildcard template from which per-source contexts are
    /// derived on demand.
    pub fn new(
        ssrc: RtpSsrc,
        roc: u32,
        key_derivation_rate: u64,
        suite: SrtpCryptoSuite,
        master: SrtpCryptoKey,
    ) -> Result<Self> {
        if suite.encryption != SrtpEncryptionAlgorithm::Null && master.key.len() != SRTP_MASTER_KEY_LEN {
            return Err(Error::SrtpError(format!(
                "Master key must be {} bytes, got {}",
                SRTP_MASTER_KEY_LEN, master.key.len()
            )));
        }
        if master.salt.len() != SRTP_SALT_LEN {
            return Err(Error::SrtpError(format!(
                "Master salt must be {} bytes, got {}",
                SRTP_SALT_LEN, master.salt.len()
            )));
        }

        Ok(Self {
            ssrc,
            suite,
            master,
            key_derivation_rate,
            mki_length: 0,
            roc,
            s_l: None,
            replay: ReplayWindow::default(),
            keys: None,
        })
    }

    /// Install session keys directly, bypassing derivation
    pub fn with_session_keys(mut self, cipher_key: Vec<u8>, cipher_salt: Vec<u8>, auth_key: Vec<u8>) -> Self {
        self.keys = Some(SessionKeys {
            cipher_key,
            cipher_salt,
            authenticator: SrtpAuthenticator::new(self.suite.authentication, auth_key, self.suite.tag_length),
        });
        self
    }

    pub fn suite(&self) -> &SrtpCryptoSuite {
        &self.suite
    }

    fn keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::SrtpError(format!("Session keys not derived for SSRC {:08x}", self.ssrc)))
    }

    fn local_index(&self, s_l: u16) -> i64 {
        ((self.roc as i64) << 16) | s_l as i64
    }

    fn guessed_roc(&self, seq: u16) -> u32 {
        let s_l = self.s_l.unwrap_or(seq) as i32;
        let seq = seq as i32;
        if s_l < 32768 {
            if seq - s_l > 32768 {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        } else if s_l - 32768 > seq {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }
}

impl CryptoContext for SrtpContext {
    fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    fn encrypt_in_place(&self, data: &mut [u8], index: u64, ssrc: RtpSsrc) -> Result<()> {
        if self.suite.encryption == SrtpEncryptionAlgorithm::Null {
            return Ok(());
        }
        let keys = self.keys()?;
        if keys.cipher_salt.len() < SRTP_SALT_LEN {
            return Err(Error::SrtpError("Session salt too short".to_string()));
        }

        // IV = (k_s * 2^16) XOR (SSRC * 2^64) XOR (index * 2^16)
        let mut iv = [0u8; 16];
        iv[..14].copy_from_slice(&keys.cipher_salt[..14]);
        for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
            iv[4 + i] ^= b;
        }
        let index = (index & 0xFFFF_FFFF_FFFF).to_be_bytes();
        for i in 0..6 {
            iv[8 + i] ^= index[2 + i];
        }

        let mut cipher = Aes128Ctr::new_from_slices(&keys.cipher_key, &iv)
            .map_err(|e| Error::SrtpError(format!("Invalid session key: {}", e)))?;
        cipher.apply_keystream(data);
        Ok(())
    }

    fn authenticate(&self, data: &[u8], roc: u32) -> Result<Vec<u8>> {
        if self.suite.authentication == SrtpAuthenticationAlgorithm::Null {
            return Ok(Vec::new());
        }
        self.keys()?.authenticator.calculate_auth_tag(data, roc)
    }

    fn check_replay(&self, seq: u16) -> bool {
        if self.suite.encryption == SrtpEncryptionAlgorithm::Null
            && self.suite.authentication == SrtpAuthenticationAlgorithm::Null
        {
            return true;
        }
        let s_l = self.s_l.unwrap_or(seq);
        let delta = self.guess_index(seq) as i64 - self.local_index(s_l);
        self.replay.check(delta)
    }

    fn guess_index(&self, seq: u16) -> u64 {
        ((self.guessed_roc(seq) as u64) << 16) | seq as u64
    }

    fn update(&mut self, seq: u16) {
        let s_l = *self.s_l.get_or_insert(seq);
        let guessed_roc = self.guessed_roc(seq);
        let delta = self.guess_index(seq) as i64 - self.local_index(s_l);
        self.replay.update(delta);

        if seq > s_l {
            self.s_l = Some(seq);
        }
        if guessed_roc > self.roc {
            self.roc = guessed_roc;
            self.s_l = Some(seq);
        }
    }

    fn roc(&self) -> u32 {
        self.roc
    }

    fn set_roc(&mut self, roc: u32) {
        self.roc = roc;
    }

    fn tag_length(&self) -> usize {
        if self.suite.authentication == SrtpAuthenticationAlgorithm::Null {
            0
        } else {
            self.suite.tag_length
        }
    }

    fn mki_length(&self) -> usize {
        self.mki_length
    }

    fn derive_keys(&mut self, index: u64) -> Result<()> {
        let kdr = self.key_derivation_rate;
        let (cipher_key, cipher_salt) = if self.suite.encryption == SrtpEncryptionAlgorithm::Null {
            (Vec::new(), vec![0u8; SRTP_SALT_LEN])
        } else {
            (
                srtp_kdf(&self.master.key, &self.master.salt, KeyDerivationLabel::RtpEncryption, index, kdr, self.suite.key_length)?,
                srtp_kdf(&self.master.key, &self.master.salt, KeyDerivationLabel::RtpSalt, index, kdr, SRTP_SALT_LEN)?,
            )
        };
        let auth_key = if self.suite.authentication == SrtpAuthenticationAlgorithm::Null {
            Vec::new()
        } else {
            srtp_kdf(&self.master.key, &self.master.salt, KeyDerivationLabel::RtpAuthentication, index, kdr, SRTP_AUTH_KEY_LEN)?
        };

        self.keys = Some(SessionKeys {
            cipher_key,
            cipher_salt,
            authenticator: SrtpAuthenticator::new(self.suite.authentication, auth_key, self.suite.tag_length),
        });
        debug!("Derived SRTP session keys for SSRC {:08x} at index {}", self.ssrc, index);
        Ok(())
    }

    fn derive_for_ssrc(&self, ssrc: RtpSsrc, roc: u32, key_derivation_rate: u64) -> Box<dyn CryptoContext> {
        Box::new(Self {
            ssrc,
            suite: self.suite.clone(),
            master: self.master.clone(),
            key_derivation_rate,
            mki_length: self.mki_length,
            roc,
            s_l: None,
            replay: ReplayWindow::default(),
            keys: None,
        })
    }
}
