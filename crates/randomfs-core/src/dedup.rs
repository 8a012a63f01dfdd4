//! Deterministic pre-encryption for block-level deduplication.
//!
//! `ciphertext = payload ^ keystream(password, position)`. The keystream is the
//! BLAKE3 XOF keyed with an HKDF-SHA256 key derived from the password and the
//! block position, so identical (content, password, position) tuples always
//! produce identical ciphertext.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::xor_into;
use crate::fingerprint::{keyed_hash, BlockHash};

const PASSWORD_SALT: &[u8] = b"randomfs-dedup-v1";

/// Password-derived key material for deterministic encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DedupKey {
    master: [u8; 32],
    file_id_key: [u8; 32],
}

impl std::fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DedupKey([REDACTED])")
    }
}

fn expand(prk_source: &[u8], salt: Option<&[u8]>, info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(salt, prk_source);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).expect("HKDF expand failed");
    okm
}

impl DedupKey {
    /// Derive key material from a password.
    pub fn from_password(password: &str) -> Self {
        Self {
            master: expand(password.as_bytes(), Some(PASSWORD_SALT), b"randomfs-block-master"),
            file_id_key: expand(password.as_bytes(), Some(PASSWORD_SALT), b"randomfs-file-id"),
        }
    }

    fn position_key(&self, position: u64) -> [u8; 32] {
        let mut info = Vec::with_capacity(18 + 8);
        info.extend_from_slice(b"randomfs-block-key");
        info.extend_from_slice(&position.to_le_bytes());
        expand(&self.master, None, &info)
    }

    /// XOR the keystream for `position` into `block`. Applying it twice restores the input.
    pub fn apply(&self, block: &mut [u8], position: u64) {
        let mut key = self.position_key(position);
        let mut keystream = vec![0u8; block.len()];
        blake3::Hasher::new_keyed(&key)
            .finalize_xof()
            .fill(&mut keystream);
        xor_into(block, &keystream);
        keystream.zeroize();
        key.zeroize();
    }

    /// File id bound to this password: identical content under another password
    /// gets a different id.
    pub fn file_id(&self, content: &[u8]) -> BlockHash {
        keyed_hash(&self.file_id_key, content)
    }
}
