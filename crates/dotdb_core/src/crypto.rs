//! Snapshot encryption at rest.
//!
//! When a key is configured, the snapshot file round-trips through
//! AES-256-GCM. Each write uses a fresh random 32-byte salt and 16-byte
//! IV; the cipher key is derived from the configured passphrase with
//! scrypt (N=2^14, r=8, p=1). On-disk layout is
//! `salt ‖ iv ‖ tag ‖ ciphertext`, hex-encoded as a single UTF-8
//! stream. The WAL is not encrypted.

use crate::error::{CoreError, CoreResult};
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM with the 16-byte IV used by the snapshot envelope.
type SnapshotAead = AesGcm<Aes256, U16>;

/// Size of the derived AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the per-file random salt in bytes.
pub const SALT_SIZE: usize = 32;
/// Size of the random IV in bytes.
pub const IV_SIZE: usize = 16;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A derived encryption key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Derives the AES key from the passphrase and a per-file salt.
    fn derive(passphrase: &str, salt: &[u8]) -> CoreResult<Self> {
        let params = scrypt::Params::new(14, 8, 1, KEY_SIZE)
            .map_err(|e| CoreError::corruption(format!("scrypt parameters rejected: {e}")))?;
        let mut bytes = [0u8; KEY_SIZE];
        scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut bytes)
            .map_err(|e| CoreError::corruption(format!("key derivation failed: {e}")))?;
        Ok(Self { bytes })
    }
}

/// Encrypts and decrypts snapshot bytes.
pub struct SnapshotCipher {
    passphrase: String,
}

impl SnapshotCipher {
    /// Creates a cipher from the configured passphrase.
    #[must_use]
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    /// Encrypts plaintext into the hex envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation or encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> CoreResult<String> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let key = DerivedKey::derive(&self.passphrase, &salt)?;
        let cipher = SnapshotAead::new(GenericArray::from_slice(&key.bytes));

        let mut sealed = cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext)
            .map_err(|_| CoreError::corruption("snapshot encryption failed"))?;

        // The AEAD appends the tag; the envelope stores it before the
        // ciphertext.
        let tag_at = sealed.len() - TAG_SIZE;
        let tag: Vec<u8> = sealed.split_off(tag_at);
        let ciphertext = sealed;

        let mut out = String::with_capacity(2 * (SALT_SIZE + IV_SIZE + TAG_SIZE + ciphertext.len()));
        out.push_str(&hex::encode(salt));
        out.push_str(&hex::encode(iv));
        out.push_str(&hex::encode(tag));
        out.push_str(&hex::encode(&ciphertext));
        Ok(out)
    }

    /// Decrypts the hex envelope back into plaintext bytes.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for malformed envelopes, a wrong key, or a
    /// failed authentication tag.
    pub fn open(&self, envelope: &str) -> CoreResult<Vec<u8>> {
        let bytes = hex::decode(envelope.trim())
            .map_err(|_| CoreError::corruption("encrypted snapshot is not valid hex"))?;
        if bytes.len() < SALT_SIZE + IV_SIZE + TAG_SIZE {
            return Err(CoreError::corruption("encrypted snapshot is truncated"));
        }

        let (salt, rest) = bytes.split_at(SALT_SIZE);
        let (iv, rest) = rest.split_at(IV_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let key = DerivedKey::derive(&self.passphrase, salt)?;
        let cipher = SnapshotAead::new(GenericArray::from_slice(&key.bytes));

        // Reassemble ciphertext ‖ tag for the AEAD.
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
            .map_err(|_| CoreError::corruption("snapshot decryption failed (wrong key or corrupt data)"))
    }
}

impl std::fmt::Debug for SnapshotCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCipher")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = SnapshotCipher::new("correct horse battery staple");
        let plaintext = b"{\"users\":{}}";

        let envelope = cipher.seal(plaintext).unwrap();
        assert!(envelope.bytes().all(|b| b.is_ascii_hexdigit()));

        let opened = cipher.open(&envelope).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn envelope_layout_lengths() {
        let cipher = SnapshotCipher::new("k");
        let envelope = cipher.seal(b"xyz").unwrap();
        // salt + iv + tag + 3 ciphertext bytes, two hex chars each
        assert_eq!(envelope.len(), 2 * (SALT_SIZE + IV_SIZE + TAG_SIZE + 3));
    }

    #[test]
    fn fresh_salt_and_iv_each_seal() {
        let cipher = SnapshotCipher::new("k");
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = SnapshotCipher::new("right").seal(b"secret").unwrap();
        let result = SnapshotCipher::new("wrong").open(&envelope);
        assert!(matches!(result, Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = SnapshotCipher::new("k");
        let mut envelope = cipher.seal(b"secret").unwrap();
        let last = envelope.pop().unwrap();
        envelope.push(if last == '0' { '1' } else { '0' });

        assert!(matches!(
            cipher.open(&envelope),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn malformed_envelope_fails() {
        let cipher = SnapshotCipher::new("k");
        assert!(cipher.open("not hex!").is_err());
        assert!(cipher.open("abcd").is_err());
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let cipher = SnapshotCipher::new("k");
        let envelope = cipher.seal(b"").unwrap();
        assert_eq!(cipher.open(&envelope).unwrap(), b"");
    }
}
