use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::{hmac_sha256_hex, require_credentials, Signer};
use crate::core::types::{RequestSpec, SignedRequest};

/// Bybit V5 HMAC-SHA256 signer.
///
/// The signed payload is `timestamp + api_key + recv_window` followed by the
/// query string for requests without a body, or the exact JSON body otherwise.
#[derive(Debug, Clone)]
pub struct BybitSigner {
    recv_window: u64,
}

impl Default for BybitSigner {
    fn default() -> Self {
        Self { recv_window: 5000 }
    }
}

impl BybitSigner {
    pub fn new(recv_window: u64) -> Self {
        Self { recv_window }
    }
}

impl Signer for BybitSigner {
    fn sign(
        &self,
        credentials: &Credentials,
        spec: RequestSpec,
        timestamp: u64,
    ) -> Result<SignedRequest, ExchangeError> {
        require_credentials(credentials)?;

        let query_string = spec.encoded_query();
        let body = spec.body.as_ref().map(serde_json::to_string).transpose()?;
        let payload = format!(
            "{}{}{}{}",
            timestamp,
            credentials.api_key(),
            self.recv_window,
            body.as_deref().unwrap_or(&query_string)
        );
        let signature = hmac_sha256_hex(credentials.api_secret(), &payload)?;

        let headers = vec![
            ("X-BAPI-API-KEY".to_string(), credentials.api_key().to_string()),
            ("X-BAPI-TIMESTAMP".to_string(), timestamp.to_string()),
            ("X-BAPI-RECV-WINDOW".to_string(), self.recv_window.to_string()),
            ("X-BAPI-SIGN".to_string(), signature.clone()),
            ("X-BAPI-SIGN-TYPE".to_string(), "2".to_string()),
        ];

        Ok(SignedRequest {
            spec,
            timestamp,
            signature: Some(signature),
            headers,
            query_string,
            body,
        })
    }
}

/// `op=auth` signature for private streams.
pub fn ws_auth_signature(credentials: &Credentials, expires: u64) -> Result<String, ExchangeError> {
    require_credentials(credentials)?;
    hmac_sha256_hex(credentials.api_secret(), &format!("GET/realtime{}", expires))
}
