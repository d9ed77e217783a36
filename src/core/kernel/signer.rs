use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::types::{RequestSpec, SignedRequest};
use base64::engine::general_purpose;
use base64::Engine;
use ed25519_dalek::{Signer as Ed25519SignerTrait, SigningKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::time::{SystemTime, UNIX_EPOCH};

/// Signer trait for request authentication
///
/// Each exchange reproduces its own canonical payload byte-for-byte. Signing is pure:
/// implementations never log the secret or the computed signature.
pub trait Signer: Send + Sync {
    /// Sign a request.
    ///
    /// # Arguments
    /// * `credentials` - Account credentials
    /// * `spec` - The request to sign
    /// * `timestamp` - Request timestamp in milliseconds
    ///
    /// # Returns
    /// The request with signature, auth headers and the exact query string and body to send
    fn sign(
        &self,
        credentials: &Credentials,
        spec: RequestSpec,
        timestamp: u64,
    ) -> Result<SignedRequest, ExchangeError>;
}

/// Wall clock in milliseconds.
pub fn current_timestamp_ms() -> Result<u64, ExchangeError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| ExchangeError::Other(format!("Failed to get timestamp: {}", e)))
}

/// Reject credentials that cannot produce a signature.
pub fn require_credentials(credentials: &Credentials) -> Result<(), ExchangeError> {
    if credentials.api_key().trim().is_empty() {
        return Err(ExchangeError::InvalidCredentials(
            "API key is empty".to_string(),
        ));
    }
    if credentials.api_secret().trim().is_empty() {
        return Err(ExchangeError::InvalidCredentials(
            "API secret is empty".to_string(),
        ));
    }
    Ok(())
}

pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::InvalidCredentials(format!("Invalid secret key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn hmac_sha512_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::InvalidCredentials(format!("Invalid secret key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn sha512_hex(payload: &str) -> String {
    hex::encode(Sha512::digest(payload.as_bytes()))
}

const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// Ed25519 private key accepted as a base64 raw seed, base64 PKCS#8 DER or PEM.
pub struct Ed25519Key {
    signing_key: SigningKey,
}

impl Ed25519Key {
    pub fn parse(secret: &str) -> Result<Self, ExchangeError> {
        let trimmed = secret.trim();
        let encoded: String = if trimmed.starts_with("-----BEGIN") {
            trimmed
                .lines()
                .filter(|line| !line.starts_with("-----"))
                .collect()
        } else {
            trimmed.to_string()
        };

        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ExchangeError::InvalidCredentials(format!("Invalid private key format: {}", e)))?;

        let seed: [u8; 32] = match bytes.len() {
            32 => bytes.as_slice().try_into(),
            48 if bytes[..16] == PKCS8_ED25519_PREFIX => bytes[16..].try_into(),
            _ => {
                return Err(ExchangeError::InvalidCredentials(
                    "Invalid private key length".to_string(),
                ))
            }
        }
        .map_err(|_| ExchangeError::InvalidCredentials("Invalid private key length".to_string()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Base64 signature over the payload.
    pub fn sign_base64(&self, payload: &str) -> String {
        let signature = Ed25519SignerTrait::sign(&self.signing_key, payload.as_bytes());
        general_purpose::STANDARD.encode(signature.to_bytes())
    }
}
