//! Detached ed25519 signatures over manifest bytes
//!
//! A publisher signs the SHA-256 digest of the exact manifest bytes it
//! serves and ships the base64 signature next to the document. A manifest
//! verified by one of the trusted keys is promoted to the official tier.

use crate::error::{PluginError, PluginResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// HTTP header carrying the signature
pub const SIGNATURE_HEADER: &str = "x-itemdeck-signature";

/// SHA-256 of the raw manifest bytes
pub fn manifest_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Decode a base64 ed25519 public key
pub fn decode_public_key(encoded: &str) -> PluginResult<VerifyingKey> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| PluginError::Signature(format!("Invalid key encoding: {e}")))?;

    let key: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| PluginError::Signature("Public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key).map_err(|e| PluginError::Signature(format!("Invalid public key: {e}")))
}

/// Sign manifest bytes, returning the base64 signature
pub fn sign_manifest(key: &SigningKey, bytes: &[u8]) -> String {
    let signature = key.sign(&manifest_digest(bytes));
    BASE64_STANDARD.encode(signature.to_bytes())
}

/// Set of publisher keys whose signatures are trusted
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    pub fn from_base64<S: AsRef<str>>(encoded: &[S]) -> PluginResult<Self> {
        let keys = encoded
            .iter()
            .map(|key| decode_public_key(key.as_ref()))
            .collect::<PluginResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Verify a base64 signature over `bytes` against every trusted key
    pub fn verify(&self, bytes: &[u8], signature_b64: &str) -> PluginResult<()> {
        let raw = BASE64_STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| PluginError::Signature(format!("Invalid signature encoding: {e}")))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| PluginError::Signature(format!("Invalid signature: {e}")))?;

        let digest = manifest_digest(bytes);
        if self.keys.iter().any(|key| key.verify(&digest, &signature).is_ok()) {
            Ok(())
        } else {
            Err(PluginError::Signature(
                "Signature does not match any trusted publisher key".to_string(),
            ))
        }
    }
}
