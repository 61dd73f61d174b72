//! Sealing of network content.
//!
//! - Derives a per-file 32-byte key via HKDF-SHA256 from the user's protection
//!   secret, with the file id as context.
//! - Encrypts with XChaCha20-Poly1305 under a random 24-byte nonce; the
//!   plaintext's version key is bound as associated data.
//! - Version key, BasedOnKey and TTL stay in the clear so the DHT can order
//!   and expire sealed snapshots.

use crate::content::{decode, encode, NetworkContent};
use crate::error::{Result, SyncError};
use crate::keys::ProtectionKeys;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use storage::{Key, TimeToLive};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;
const KDF_SALT: &[u8] = b"hivesync-content-key";

/// Symmetric key protecting the content of one file.
pub struct ContentCipher {
    key: Zeroizing<[u8; 32]>,
}

impl ContentCipher {
    pub fn derive(keys: &ProtectionKeys, file_id: &Key) -> Result<Self> {
        let secret = Zeroizing::new(keys.secret_bytes());
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &secret[..]);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(file_id.as_bytes(), &mut okm[..])
            .map_err(|_| SyncError::step("HKDF expand failed"))?;
        Ok(Self { key: okm })
    }

    fn aead(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(&(*self.key).into())
    }

    pub fn seal<T: NetworkContent>(&self, content: &T) -> Result<SealedContent> {
        let version_key = content.version_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut buf = encode(content)?;
        self.aead()
            .encrypt_in_place(&nonce, version_key.as_bytes(), &mut buf)
            .map_err(|_| SyncError::step("aead encrypt failed"))?;

        Ok(SealedContent {
            version_key,
            based_on: content.based_on_key(),
            ttl: content.time_to_live(),
            nonce: nonce_bytes,
            ciphertext: buf,
        })
    }

    pub fn open<T: DeserializeOwned>(&self, sealed: &SealedContent) -> Result<T> {
        let nonce = XNonce::from(sealed.nonce);
        let mut buf = sealed.ciphertext.clone();
        self.aead()
            .decrypt_in_place(&nonce, sealed.version_key.as_bytes(), &mut buf)
            .map_err(|_| {
                SyncError::step(format!(
                    "cannot open sealed content {}",
                    sealed.version_key.short()
                ))
            })?;
        decode(&buf)
    }
}

/// Encrypted envelope around another [`NetworkContent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedContent {
    version_key: Key,
    based_on: Option<Key>,
    ttl: TimeToLive,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl NetworkContent for SealedContent {
    fn based_on_key(&self) -> Option<Key> {
        self.based_on
    }

    fn time_to_live(&self) -> TimeToLive {
        self.ttl
    }

    /// Same key as the plaintext, so re-sealing identical content (with a
    /// fresh nonce) still lands on the same version.
    fn version_key(&self) -> Result<Key> {
        Ok(self.version_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetaFile;

    #[test]
    fn test_seal_open() -> Result<()> {
        let keys = ProtectionKeys::generate();
        let file_id = Key::hash("report.pdf");
        let cipher = ContentCipher::derive(&keys, &file_id)?;

        let meta = MetaFile::new_small(file_id);
        let sealed = cipher.seal(&meta)?;
        let resealed = cipher.seal(&meta)?;
        assert_eq!(sealed.version_key()?, meta.version_key()?);
        assert_eq!(resealed.version_key()?, sealed.version_key()?);
        assert_ne!(sealed.ciphertext, resealed.ciphertext);

        let opened: MetaFile = cipher.open(&sealed)?;
        assert_eq!(opened, meta);
        Ok(())
    }

    #[test]
    fn test_wrong_key_cannot_open() -> Result<()> {
        let file_id = Key::hash("report.pdf");
        let cipher = ContentCipher::derive(&ProtectionKeys::generate(), &file_id)?;
        let other = ContentCipher::derive(&ProtectionKeys::generate(), &file_id)?;

        let sealed = cipher.seal(&MetaFile::new_small(file_id))?;
        let opened: Result<MetaFile> = other.open(&sealed);
        assert!(matches!(opened, Err(SyncError::StepExecutionFailure(_))));
        Ok(())
    }
}
