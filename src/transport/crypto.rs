//! Password-derived frame encryption
//!
//! Legacy transport mode: both ends share a secret which is stretched
//! into a symmetric key with Argon2id over a fixed salt, then used to
//! build independent encrypt/decrypt ChaCha20-Poly1305 instances. The
//! plaintext body is padded to the 16-byte block boundary with a run of
//! `0xFF` sentinel bytes that is stripped again after decryption, and
//! each frame carries its own random nonce.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────

/// Fixed key-derivation salt (both ends must agree; legacy scheme)
const KEY_SALT: &[u8; 16] = b"taskmesh.link.v1";

/// Salt for the non-secret key fingerprint shown in logs
const FINGERPRINT_SALT: &[u8; 16] = b"taskmesh.fngr.v1";

/// Argon2id memory cost in KiB (8 MB)
const ARGON2_MEMORY_KB: u32 = 8192;

/// Argon2id iteration count
const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
const ARGON2_PARALLELISM: u32 = 1;

/// Pad plaintext up to a multiple of this before sealing
const BLOCK_LEN: usize = 16;

/// Padding sentinel byte
const PAD_BYTE: u8 = 0xFF;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
const NONCE_LEN: usize = 12;

// ─────────────────────────────────────────────────────────────────
// Key Derivation
// ─────────────────────────────────────────────────────────────────

/// Derive a 256-bit key from the shared secret over a fixed salt
fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(
        ARGON2_MEMORY_KB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| Error::CryptoSetup {
        message: format!("invalid Argon2 params: {e}"),
    })?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| Error::CryptoSetup {
            message: format!("key derivation failed: {e}"),
        })?;

    Ok(key)
}

// ─────────────────────────────────────────────────────────────────
// Frame Cipher
// ─────────────────────────────────────────────────────────────────

/// Independent encrypt/decrypt cipher pair for one transport link
pub struct FrameCipher {
    seal_cipher: ChaCha20Poly1305,
    open_cipher: ChaCha20Poly1305,
    fingerprint: String,
}

impl FrameCipher {
    /// Build a cipher pair from a shared secret.
    ///
    /// Fails on bad key material or parameters; the caller aborts
    /// construction of that one transport link.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::CryptoSetup {
                message: "empty transport secret".to_string(),
            });
        }

        let key_bytes = derive_key(secret, KEY_SALT)?;
        let key = Key::from_slice(&key_bytes);

        let fpr_bytes = derive_key(secret, FINGERPRINT_SALT)?;
        let fingerprint = hex::encode(&fpr_bytes[..4]);

        Ok(Self {
            seal_cipher: ChaCha20Poly1305::new(key),
            open_cipher: ChaCha20Poly1305::new(key),
            fingerprint,
        })
    }

    /// Short non-secret identifier of the derived key, for logs
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt a frame body: pad, seal, prepend the nonce
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let padded = pad(plain);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .seal_cipher
            .encrypt(nonce, padded.as_slice())
            .map_err(|_| Error::FrameCorrupt("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a frame body: split the nonce, open, strip the padding
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::FrameCorrupt("frame shorter than nonce".to_string()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut plain = self
            .open_cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::FrameCorrupt("decryption failed".to_string()))?;

        // Trailing 0xFF bytes in the plaintext itself are indistinguishable
        // from padding; the JSON bodies carried here never end in 0xFF.
        strip_padding(&mut plain);
        Ok(plain)
    }
}

/// Append sentinel bytes up to the next block boundary
fn pad(plain: &[u8]) -> Vec<u8> {
    let mut padded = plain.to_vec();
    let rem = padded.len() % BLOCK_LEN;
    if rem != 0 {
        padded.resize(padded.len() + (BLOCK_LEN - rem), PAD_BYTE);
    }
    padded
}

/// Remove the trailing sentinel run
fn strip_padding(data: &mut Vec<u8>) {
    while data.last() == Some(&PAD_BYTE) {
        data.pop();
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
