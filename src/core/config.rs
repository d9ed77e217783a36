use crate::core::types::{ExchangeKind, MarketKind};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

/// How the API secret is interpreted when signing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Hmac,
    /// Binance Ed25519 API keys. The secret holds the private key (base64 seed, base64 PKCS#8 or PEM).
    Ed25519,
}

impl std::str::FromStr for KeyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hmac" => Ok(Self::Hmac),
            "ed25519" => Ok(Self::Ed25519),
            other => Err(ConfigError::InvalidConfiguration(format!(
                "unknown key type '{}'",
                other
            ))),
        }
    }
}

/// API credentials for one exchange account.
///
/// Immutable once loaded. Secrets are held in [`Secret`] and never appear in
/// `Debug` output or serialized form.
#[derive(Clone)]
pub struct Credentials {
    api_key: Secret<String>,
    api_secret: Secret<String>,
    passphrase: Option<Secret<String>>,
    pub testnet: bool,
    pub key_type: KeyType,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("has_passphrase", &self.passphrase.is_some())
            .field("testnet", &self.testnet)
            .field("key_type", &self.key_type)
            .finish()
    }
}

// Never expose secrets in serialization
impl Serialize for Credentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Credentials", 5)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("api_secret", "[REDACTED]")?;
        state.serialize_field(
            "passphrase",
            &self.passphrase.as_ref().map(|_| "[REDACTED]"),
        )?;
        state.serialize_field("testnet", &self.testnet)?;
        state.serialize_field("key_type", &self.key_type)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CredentialsHelper {
            #[serde(default)]
            api_key: String,
            #[serde(default)]
            api_secret: String,
            passphrase: Option<String>,
            #[serde(default)]
            testnet: bool,
            #[serde(default)]
            key_type: KeyType,
        }

        let helper = CredentialsHelper::deserialize(deserializer)?;
        Ok(Self {
            api_key: Secret::new(helper.api_key),
            api_secret: Secret::new(helper.api_secret),
            passphrase: helper.passphrase.map(Secret::new),
            testnet: helper.testnet,
            key_type: helper.key_type,
        })
    }
}

impl Credentials {
    #[must_use]
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            api_secret: Secret::new(api_secret),
            passphrase: None,
            testnet: false,
            key_type: KeyType::Hmac,
        }
    }

    /// Credentials for public market data only.
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Read credentials from `{PREFIX}_API_KEY`, `{PREFIX}_SECRET_KEY` and the optional
    /// `{PREFIX}_PASSPHRASE`, `{PREFIX}_TESTNET`, `{PREFIX}_KEY_TYPE`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let api_key_var = format!("{}_API_KEY", prefix);
        let secret_key_var = format!("{}_SECRET_KEY", prefix);

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let api_secret = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let testnet = env::var(format!("{}_TESTNET", prefix))
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        let key_type = match env::var(format!("{}_KEY_TYPE", prefix)) {
            Ok(value) => value.parse()?,
            Err(_) => KeyType::Hmac,
        };

        let mut credentials = Self::new(api_key, api_secret)
            .testnet(testnet)
            .key_type(key_type);
        if let Ok(passphrase) = env::var(format!("{}_PASSPHRASE", prefix)) {
            credentials = credentials.with_passphrase(passphrase);
        }
        Ok(credentials)
    }

    /// Load a `.env` file (if present) and then read credentials from the environment.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }
        Self::from_env(prefix)
    }

    #[must_use]
    pub fn with_passphrase(mut self, passphrase: String) -> Self {
        self.passphrase = Some(Secret::new(passphrase));
        self
    }

    #[must_use]
    pub const fn testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    #[must_use]
    pub const fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.api_secret.expose_secret().is_empty()
    }

    pub(crate) fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    pub(crate) fn api_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }
}

/// One token bucket: `capacity` tokens, refilled by `refill_amount` every `refill_interval_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub class: String,
    pub capacity: u32,
    pub refill_amount: u32,
    pub refill_interval_ms: u64,
}

impl BucketConfig {
    pub fn new(class: impl Into<String>, capacity: u32, refill_amount: u32, refill_interval: Duration) -> Self {
        Self {
            class: class.into(),
            capacity,
            refill_amount,
            refill_interval_ms: refill_interval.as_millis() as u64,
        }
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

/// Retry policy for idempotent REST reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// WebSocket session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat intervals tolerated before the session reports DEGRADED.
    pub degrade_after_missed: u32,
    /// Missed heartbeat intervals tolerated before the socket is dropped and rebuilt.
    pub disconnect_after_missed: u32,
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: bool,
    pub max_auth_failures: u32,
    /// `None` retries network failures forever.
    pub max_reconnect_attempts: Option<u32>,
    pub event_queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 20_000,
            degrade_after_missed: 1,
            disconnect_after_missed: 3,
            connect_timeout_ms: 10_000,
            auth_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: true,
            max_auth_failures: 5,
            max_reconnect_attempts: None,
            event_queue_capacity: 1024,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    #[serde(
        serialize_with = "redact_optional",
        deserialize_with = "deserialize_optional_secret",
        default
    )]
    pub password: Option<Secret<String>>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProxyConfig {
    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret().as_str())
    }
}

fn redact_optional<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(_) => serializer.serialize_some("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Secret::new))
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Everything needed to build one exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    pub exchange: ExchangeKind,
    #[serde(default)]
    pub market: MarketKind,
    pub credentials: Credentials,
    pub rest_url: Option<String>,
    pub ws_public_url: Option<String>,
    pub ws_private_url: Option<String>,
    pub proxy: Option<ProxyConfig>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Overrides the exchange's default bucket table when present.
    pub rate_limits: Option<Vec<BucketConfig>>,
    /// Longest a REST call may wait for rate-limit tokens. `None` waits indefinitely.
    #[serde(default)]
    pub rate_limit_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl AccountConfig {
    pub fn new(
        account_id: impl Into<String>,
        exchange: ExchangeKind,
        market: MarketKind,
        credentials: Credentials,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            exchange,
            market,
            credentials,
            rest_url: None,
            ws_public_url: None,
            ws_private_url: None,
            proxy: None,
            request_timeout_ms: default_request_timeout_ms(),
            rate_limits: None,
            rate_limit_timeout_ms: None,
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
        }
    }

    /// Build from environment variables prefixed with the exchange name, e.g. `BYBIT_API_KEY`.
    pub fn from_env(
        account_id: impl Into<String>,
        exchange: ExchangeKind,
        market: MarketKind,
    ) -> Result<Self, ConfigError> {
        let credentials = Credentials::from_env(exchange.as_str())?;
        Ok(Self::new(account_id, exchange, market, credentials))
    }

    #[must_use]
    pub fn rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn ws_public_url(mut self, url: impl Into<String>) -> Self {
        self.ws_public_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn ws_private_url(mut self, url: impl Into<String>) -> Self {
        self.ws_private_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn rate_limits(mut self, buckets: Vec<BucketConfig>) -> Self {
        self.rate_limits = Some(buckets);
        self
    }

    #[must_use]
    pub fn rate_limit_timeout(mut self, timeout: Duration) -> Self {
        self.rate_limit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Resolved, read-only connectivity configuration for the whole process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_never_serialize_secrets() {
        let creds = Credentials::new("my-key".into(), "my-secret".into())
            .with_passphrase("pass".into());
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("my-key"));
        assert!(!json.contains("my-secret"));
        assert!(!json.contains("pass\""));
        assert!(json.contains("[REDACTED]"));

        let debug = format!("{:?}", creds);
        assert!(!debug.contains("my-secret"));
    }

    #[test]
    fn test_account_config_deserializes_with_defaults() {
        let raw = r#"{
            "account_id": "main",
            "exchange": "bybit",
            "credentials": {"api_key": "k", "api_secret": "s", "testnet": true}
        }"#;
        let config: AccountConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.exchange, ExchangeKind::Bybit);
        assert_eq!(config.market, MarketKind::Spot);
        assert!(config.credentials.testnet);
        assert_eq!(config.credentials.api_secret(), "s");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.stream.max_reconnect_attempts, None);
    }

    #[test]
    fn test_key_type_parse() {
        assert_eq!("ED25519".parse::<KeyType>().unwrap(), KeyType::Ed25519);
        assert!("rsa".parse::<KeyType>().is_err());
    }
}
