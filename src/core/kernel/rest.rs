use crate::core::config::{AccountConfig, ProxyConfig};
use crate::core::errors::{ErrorKind, ExchangeError, NormalizedError};
use crate::core::types::SignedRequest;
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, trace, warn};

/// Raw HTTP exchange: status and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Sends a signed request over the wire.
///
/// Implementations report only transport failures (DNS, refused connection, timeout) as
/// retryable `NETWORK` errors. Status codes and bodies are returned untouched.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, NormalizedError>;
}

/// Maps an exchange error envelope to a normalized error.
pub trait ErrorClassifier: Send + Sync {
    /// `Some` when the body carries an exchange error, whatever the HTTP status.
    fn classify(&self, status: u16, body: &Value) -> Option<NormalizedError>;
}

/// Classification from the HTTP status alone.
pub fn status_error(status: u16, raw_code: Option<String>, message: impl Into<String>) -> NormalizedError {
    let kind = match status {
        418 | 429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::Auth,
        400..=499 => ErrorKind::InvalidParam,
        500..=599 => ErrorKind::Network,
        _ => ErrorKind::Unknown,
    };
    NormalizedError::new(kind, raw_code, message)
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    pub timeout: Duration,
    /// User agent string to include in requests
    pub user_agent: String,
    pub proxy: Option<ProxyConfig>,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout: Duration::from_secs(10),
            user_agent: "exlink/0.1".to_string(),
            proxy: None,
        }
    }

    /// Base URL, timeout and proxy of an account, falling back to the exchange's default URL.
    pub fn for_account(config: &AccountConfig, default_base_url: &str) -> Self {
        let base_url = config
            .rest_url
            .clone()
            .unwrap_or_else(|| default_base_url.to_string());
        Self::new(base_url, config.exchange.to_string())
            .with_timeout(config.request_timeout())
            .with_proxy(config.proxy.clone())
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self { config }
    }

    /// Build the reqwest-backed transport
    pub fn build(self) -> Result<ReqwestTransport, ExchangeError> {
        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&self.config.user_agent);

        if let Some(proxy_cfg) = &self.config.proxy {
            let mut proxy = Proxy::all(&proxy_cfg.url).map_err(|e| {
                ExchangeError::ConfigurationError(format!("Invalid proxy URL: {}", e))
            })?;
            if let Some(username) = &proxy_cfg.username {
                proxy = proxy.basic_auth(username, proxy_cfg.password().unwrap_or_default());
            }
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            ExchangeError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(ReqwestTransport {
            client,
            config: self.config,
        })
    }
}

/// `HttpTransport` over reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: RestClientConfig,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.config.base_url)
            .field("exchange", &self.config.exchange_name)
            .field("timeout", &self.config.timeout)
            .field("proxied", &self.config.proxy.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    fn build_url(&self, request: &SignedRequest) -> String {
        if request.query_string.is_empty() {
            format!("{}{}", self.config.base_url, request.spec.path)
        } else {
            format!(
                "{}{}?{}",
                self.config.base_url, request.spec.path, request.query_string
            )
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(
        skip(self, request),
        fields(exchange = %self.config.exchange_name, method = %request.spec.method, endpoint = %request.spec.path)
    )]
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, NormalizedError> {
        let url = self.build_url(request);
        let mut builder = self.client.request(request.spec.method.clone(), &url);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            let reason = if e.is_timeout() { "timed out" } else { "failed" };
            warn!(error = %e, "request {}", reason);
            NormalizedError::network(format!("Request {}: {}", reason, e))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            NormalizedError::network(format!("Failed to read response body: {}", e))
        })?;
        trace!(status, "response body: {}", body);

        Ok(HttpResponse { status, body })
    }
}

/// Issues signed requests and normalizes every outcome. Never retries.
#[derive(Clone)]
pub struct RestTransport {
    http: Arc<dyn HttpTransport>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport").finish_non_exhaustive()
    }
}

impl RestTransport {
    pub fn new(http: Arc<dyn HttpTransport>, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self { http, classifier }
    }

    pub async fn execute(&self, request: &SignedRequest) -> Result<Value, NormalizedError> {
        let response = self.http.send(request).await?;
        self.normalize(response)
    }

    /// Turn a raw response into a payload or a normalized error.
    pub fn normalize(&self, response: HttpResponse) -> Result<Value, NormalizedError> {
        let parsed: Result<Value, _> = if response.body.trim().is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(&response.body)
        };

        match parsed {
            Ok(json) => {
                if let Some(err) = self.classifier.classify(response.status, &json) {
                    return Err(err);
                }
                if response.is_success() {
                    Ok(json)
                } else {
                    Err(status_error(response.status, None, response.body))
                }
            }
            Err(_) if response.is_success() => Err(NormalizedError::unknown(
                None,
                format!("Non-JSON response: {}", response.body),
            )),
            Err(_) => Err(status_error(response.status, None, response.body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CodeClassifier;

    impl ErrorClassifier for CodeClassifier {
        fn classify(&self, _status: u16, body: &Value) -> Option<NormalizedError> {
            let code = body.get("code")?.as_i64()?;
            Some(NormalizedError::new(
                ErrorKind::ExchangeRejected,
                Some(code.to_string()),
                "rejected",
            ))
        }
    }

    fn transport() -> RestTransport {
        struct Unused;
        #[async_trait]
        impl HttpTransport for Unused {
            async fn send(&self, _: &SignedRequest) -> Result<HttpResponse, NormalizedError> {
                Err(NormalizedError::network("unused"))
            }
        }
        RestTransport::new(Arc::new(Unused), Arc::new(CodeClassifier))
    }

    #[test]
    fn test_status_fallback() {
        let cases = [
            (429, ErrorKind::RateLimit, true),
            (418, ErrorKind::RateLimit, true),
            (401, ErrorKind::Auth, false),
            (403, ErrorKind::Auth, false),
            (404, ErrorKind::InvalidParam, false),
            (502, ErrorKind::Network, true),
        ];
        for (status, kind, retryable) in cases {
            let err = transport()
                .normalize(HttpResponse::new(status, "<html>oops</html>"))
                .unwrap_err();
            assert_eq!(err.kind, kind, "status {}", status);
            assert_eq!(err.retryable, retryable, "status {}", status);
        }
    }

    #[test]
    fn test_embedded_error_on_http_200() {
        let body = json!({"code": 7}).to_string();
        let err = transport().normalize(HttpResponse::new(200, body)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExchangeRejected);
        assert_eq!(err.raw_code.as_deref(), Some("7"));
    }

    #[test]
    fn test_non_json_success_is_unknown() {
        let err = transport()
            .normalize(HttpResponse::new(200, "maintenance"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.raw_message.contains("maintenance"));
    }

    #[test]
    fn test_success_passthrough() {
        let value = transport()
            .normalize(HttpResponse::new(200, r#"{"ok":true}"#))
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(
            transport().normalize(HttpResponse::new(200, "")).unwrap(),
            Value::Null
        );
    }
}
