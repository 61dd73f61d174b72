use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use std::fs;
use std::path::Path;
use storage::{ContentAddress, Protection, StorageKey, WriteAuth};

/// Ed25519 key pair guarding content in the DHT.
///
/// The file on disk stores the 32-byte secret key. Production deployments
/// should keep it in an OS keystore.
#[derive(Clone)]
pub struct ProtectionKeys {
    signing_key: SigningKey,
}

impl ProtectionKeys {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Generate a new key pair and persist it to `path`.
    pub fn generate_and_store(path: &Path) -> Result<Self> {
        let keys = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, keys.signing_key.to_bytes()).context("writing protection key file")?;
        tracing::info!("Generated new protection keys at {:?}", path);
        Ok(keys)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).context("reading protection key file")?;
        if data.len() != 32 {
            anyhow::bail!("Invalid key file length: expected 32 bytes, got {}", data.len());
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&data);
        tracing::info!("Loaded protection keys from {:?}", path);
        Ok(Self::from_secret(secret))
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// First 8 hex chars of the public key.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key_bytes()[..4])
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    pub fn verify_with_pubkey(
        pubkey: &[u8; 32],
        msg: &[u8],
        sig: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        let pk = VerifyingKey::from_bytes(pubkey)?;
        pk.verify(msg, sig)
    }

    /// Sign a payload stored under `key` with this key pair.
    pub fn protect(&self, key: &StorageKey, data: &[u8]) -> Protection {
        Protection::sign(&self.signing_key, key, data)
    }

    /// Prove possession of this key pair for a slot.
    pub fn authorize(&self, address: &ContentAddress) -> WriteAuth {
        WriteAuth::sign(&self.signing_key, address)
    }

    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl PartialEq for ProtectionKeys {
    fn eq(&self, other: &Self) -> bool {
        self.public_key_bytes() == other.public_key_bytes()
    }
}

impl Eq for ProtectionKeys {}

impl fmt::Debug for ProtectionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectionKeys({})", self.fingerprint())
    }
}
