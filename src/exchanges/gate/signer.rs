use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::{hmac_sha512_hex, require_credentials, sha512_hex, Signer};
use crate::core::types::{RequestSpec, SignedRequest};

/// Gate.io APIv4 signer.
///
/// Signs `METHOD\npath\nquery\nhex(sha512(body))\ntimestamp` with HMAC-SHA512.
/// The timestamp is in seconds and the path includes the `/api/v4` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateSigner;

impl Signer for GateSigner {
    fn sign(
        &self,
        credentials: &Credentials,
        spec: RequestSpec,
        timestamp: u64,
    ) -> Result<SignedRequest, ExchangeError> {
        require_credentials(credentials)?;

        let seconds = timestamp / 1000;
        let query_string = spec.encoded_query();
        let body = spec.body.as_ref().map(serde_json::to_string).transpose()?;
        let payload = format!(
            "{}\n{}\n{}\n{}\n{}",
            spec.method.as_str(),
            spec.path,
            query_string,
            sha512_hex(body.as_deref().unwrap_or_default()),
            seconds
        );
        let signature = hmac_sha512_hex(credentials.api_secret(), &payload)?;

        let headers = vec![
            ("KEY".to_string(), credentials.api_key().to_string()),
            ("Timestamp".to_string(), seconds.to_string()),
            ("SIGN".to_string(), signature.clone()),
        ];

        Ok(SignedRequest {
            spec,
            timestamp: seconds,
            signature: Some(signature),
            headers,
            query_string,
            body,
        })
    }
}

/// Per-message `auth.SIGN` for private channel requests.
pub fn ws_auth_signature(
    credentials: &Credentials,
    channel: &str,
    event: &str,
    time: u64,
) -> Result<String, ExchangeError> {
    require_credentials(credentials)?;
    hmac_sha512_hex(
        credentials.api_secret(),
        &format!("channel={}&event={}&time={}", channel, event, time),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials::new("gate-key".to_string(), "gate-secret".to_string())
    }

    #[test]
    fn test_get_signature_and_headers() {
        let spec = RequestSpec::get("/api/v4/spot/accounts")
            .query("currency", "BTC")
            .signed();
        let signed = GateSigner.sign(&credentials(), spec, 1_700_000_000_123).unwrap();

        assert_eq!(signed.header("Timestamp"), Some("1700000000"));
        assert_eq!(signed.header("KEY"), Some("gate-key"));
        assert_eq!(
            signed.header("SIGN"),
            Some("dd04251abeeb8bff3d2b1ebebba91c2f70cf7b2dd891023323fce74d341a3182fe167ce75ce39594fbaa932f23279989a0f61625b9c005ab0e69fbcaad1c806f")
        );
    }

    #[test]
    fn test_post_hashes_body() {
        let spec = RequestSpec::post("/api/v4/spot/orders")
            .body(json!({
                "currency_pair": "BTC_USDT",
                "side": "buy",
                "type": "limit",
                "amount": "0.001",
                "price": "30000",
                "time_in_force": "gtc",
                "text": "t-abc"
            }))
            .signed();
        let signed = GateSigner.sign(&credentials(), spec, 1_700_000_000_000).unwrap();

        assert!(signed.query_string.is_empty());
        assert_eq!(
            signed.signature.as_deref(),
            Some("93772ae2ac68198276140d959ba85f25897eb5a24287914980a59d0048601757278fd60690d11a11de1ac3bd1c271ac84b3413258e37049de3c3cbf249a4f34d")
        );
    }

    #[test]
    fn test_ws_auth_signature() {
        assert_eq!(
            ws_auth_signature(&credentials(), "spot.orders", "subscribe", 1_700_000_000).unwrap(),
            "5001d82803f4d1d0c5f37a94c3b32e28c36dd1b983798c45c6ac8b316235d7a61f7dbf8d2aceb8362150e70eb0a59861d7c6931e2008b2bed6528785f1c8c167"
        );
    }
}
