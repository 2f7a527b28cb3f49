//! # Wallet Signing
//!
//! `Signer` abstracts the user's wallet: an address and the ability to sign typed-data
//! digests. `LocalWallet` is a key held in process (CLI tasks, devnet accounts).
//!
//! Signatures are encoded as `0x || sec1_compressed_pubkey(33) || r || s (64)` so a
//! verifier can check them without an external key registry; the address is the last
//! 20 bytes of the Keccak-256 hash of the uncompressed public key.

use async_trait::async_trait;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::types::{Address, GlucoseCheckError, GlucoseCheckResult};

const COMPRESSED_KEY_LEN: usize = 33;
const SIGNATURE_LEN: usize = 64;

/// The user's wallet as seen by the coordinator
#[async_trait]
pub trait Signer: Send + Sync {
    /// Resolved account address, if the wallet exposes one
    fn address(&self) -> Option<Address>;

    /// Sign a 32-byte typed-data digest. May wait for user approval.
    async fn sign_digest(&self, digest: [u8; 32]) -> GlucoseCheckResult<String>;
}

/// Derive an account address from a verifying key
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 SEC1 tag
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

/// In-process signing key
#[derive(Clone)]
pub struct LocalWallet {
    signing_key: SigningKey,
    address: Address,
}

impl LocalWallet {
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load from a hex-encoded 32-byte secret
    pub fn from_hex(secret: &str) -> GlucoseCheckResult<Self> {
        let digits = secret.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits)
            .map_err(|e| GlucoseCheckError::Signature(format!("invalid private key hex: {}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| GlucoseCheckError::Signature(format!("invalid private key: {}", e)))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Deterministic development account `index`, shared by every devnet participant
    pub fn devnet_account(index: u32) -> Self {
        let mut counter = 0u32;
        loop {
            let mut hasher = Keccak256::new();
            hasher.update(b"glucose-check devnet account");
            hasher.update(index.to_be_bytes());
            hasher.update(counter.to_be_bytes());
            let seed = hasher.finalize();
            // A digest outside the curve order is astronomically unlikely; step the counter if it happens.
            if let Ok(signing_key) = SigningKey::from_slice(&seed) {
                return Self::from_signing_key(signing_key);
            }
            counter += 1;
        }
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(signing_key.verifying_key());
        Self { signing_key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Hex-encoded secret, for exporting devnet accounts
    pub fn secret_hex(&self) -> String {
        format!("0x{}", hex::encode(self.signing_key.to_bytes()))
    }

    pub fn sign(&self, digest: &[u8; 32]) -> String {
        let signature: Signature = self.signing_key.sign(digest);
        let key = self.signing_key.verifying_key().to_encoded_point(true);
        let mut out = Vec::with_capacity(COMPRESSED_KEY_LEN + SIGNATURE_LEN);
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&signature.to_bytes());
        format!("0x{}", hex::encode(out))
    }
}

impl std::fmt::Debug for LocalWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWallet").field("address", &self.address).finish()
    }
}

#[async_trait]
impl Signer for LocalWallet {
    fn address(&self) -> Option<Address> {
        Some(self.address)
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> GlucoseCheckResult<String> {
        Ok(self.sign(&digest))
    }
}

/// Verify a wallet signature over `digest` and return the signing address
pub fn recover_signer(digest: &[u8; 32], signature: &str) -> GlucoseCheckResult<Address> {
    let digits = signature.trim().trim_start_matches("0x");
    let bytes = hex::decode(digits)
        .map_err(|e| GlucoseCheckError::Signature(format!("signature is not hex: {}", e)))?;
    if bytes.len() != COMPRESSED_KEY_LEN + SIGNATURE_LEN {
        return Err(GlucoseCheckError::Signature(format!(
            "signature has {} bytes, expected {}",
            bytes.len(),
            COMPRESSED_KEY_LEN + SIGNATURE_LEN
        )));
    }
    let (key_bytes, sig_bytes) = bytes.split_at(COMPRESSED_KEY_LEN);
    let key = VerifyingKey::from_sec1_bytes(key_bytes)
        .map_err(|e| GlucoseCheckError::Signature(format!("bad signer key: {}", e)))?;
    let sig = Signature::from_slice(sig_bytes)
        .map_err(|e| GlucoseCheckError::Signature(format!("malformed signature: {}", e)))?;
    key.verify(digest, &sig)
        .map_err(|_| GlucoseCheckError::Signature("signature does not match digest".to_string()))?;
    Ok(address_of(&key))
}
