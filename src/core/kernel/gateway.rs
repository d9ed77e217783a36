use crate::core::config::{AccountConfig, BucketConfig, Credentials, RetryPolicy};
use crate::core::errors::{ExchangeError, NormalizedError};
use crate::core::kernel::rate_limit::RateLimiter;
use crate::core::kernel::rest::{ErrorClassifier, HttpTransport, RestTransport};
use crate::core::kernel::signer::{current_timestamp_ms, Signer};
use crate::core::types::{RequestSpec, SignedRequest};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

/// Rate-limit class and weight of one endpoint.
///
/// Some endpoints also count against a second limit, e.g. an order that uses both
/// the order count and the request weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCost {
    pub class: &'static str,
    pub weight: u32,
    pub also: Option<(&'static str, u32)>,
}

impl EndpointCost {
    pub const fn new(class: &'static str, weight: u32) -> Self {
        Self {
            class,
            weight,
            also: None,
        }
    }

    /// Charge `weight` from `class` as well.
    pub const fn and(self, class: &'static str, weight: u32) -> Self {
        Self {
            also: Some((class, weight)),
            ..self
        }
    }

    pub fn charges(&self) -> Vec<(&'static str, u32)> {
        let mut charges = vec![(self.class, self.weight)];
        charges.extend(self.also);
        charges
    }
}

/// Static per-exchange lookup from endpoint to cost.
pub type CostTable = fn(&Method, &str) -> EndpointCost;

/// REST pipeline for one account: rate limiter, then signer, then transport.
pub struct RestGateway {
    name: String,
    credentials: Credentials,
    signer: Arc<dyn Signer>,
    transport: RestTransport,
    limiter: RateLimiter,
    costs: CostTable,
    retry: RetryPolicy,
    acquire_timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for RestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGateway")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RestGateway {
    pub fn new(
        name: impl Into<String>,
        credentials: Credentials,
        signer: Arc<dyn Signer>,
        transport: RestTransport,
        limiter: RateLimiter,
        costs: CostTable,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            credentials,
            signer,
            transport,
            limiter,
            costs,
            retry: RetryPolicy::default(),
            acquire_timeout: None,
            shutdown,
        }
    }

    /// Wire up an account: configured buckets (or the exchange defaults), retry policy
    /// and rate-limit timeout all come from `config`.
    pub fn from_account(
        config: &AccountConfig,
        signer: Arc<dyn Signer>,
        http: Arc<dyn HttpTransport>,
        classifier: Arc<dyn ErrorClassifier>,
        default_buckets: Vec<BucketConfig>,
        costs: CostTable,
    ) -> Self {
        let name = format!("{}/{}", config.exchange, config.account_id);
        let buckets = config.rate_limits.clone().unwrap_or(default_buckets);
        Self::new(
            name.clone(),
            config.credentials.clone(),
            signer,
            RestTransport::new(http, classifier),
            RateLimiter::new(name, &buckets),
            costs,
        )
        .with_retry(config.retry.clone())
        .with_acquire_timeout(config.rate_limit_timeout_ms.map(Duration::from_millis))
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Cancel in-flight calls and rate-limit waiters; later calls fail immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.limiter.shutdown();
    }

    /// Execute once. Used for anything that is not safe to repeat.
    #[instrument(skip(self, spec), fields(gateway = %self.name, method = %spec.method, endpoint = %spec.path))]
    pub async fn call(&self, spec: RequestSpec) -> Result<Value, NormalizedError> {
        self.cancellable(self.attempt(&spec)).await
    }

    /// Execute, retrying transient network failures with jittered exponential backoff.
    #[instrument(skip(self, spec), fields(gateway = %self.name, method = %spec.method, endpoint = %spec.path))]
    pub async fn call_idempotent(&self, spec: RequestSpec) -> Result<Value, NormalizedError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.retry.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .map(jitter)
            .take(self.retry.max_retries as usize);

        let retried = RetryIf::start(
            strategy,
            || self.attempt(&spec),
            |err: &NormalizedError| {
                let retry = err.is_retryable_network();
                if retry {
                    warn!(error = %err, "retrying idempotent call");
                }
                retry
            },
        );
        self.cancellable(retried).await
    }

    async fn cancellable<F>(&self, call: F) -> Result<Value, NormalizedError>
    where
        F: std::future::Future<Output = Result<Value, NormalizedError>>,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(ExchangeError::Shutdown.into());
        }
        tokio::select! {
            result = call => result,
            _ = shutdown_rx.changed() => {
                debug!("call cancelled by shutdown");
                Err(ExchangeError::Shutdown.into())
            }
        }
    }

    async fn attempt(&self, spec: &RequestSpec) -> Result<Value, NormalizedError> {
        let cost = (self.costs)(&spec.method, &spec.path);
        self.limiter
            .acquire_all(&cost.charges(), self.acquire_timeout)
            .await?;

        let request = self.prepare(spec.clone())?;
        self.transport.execute(&request).await
    }

    fn prepare(&self, spec: RequestSpec) -> Result<SignedRequest, ExchangeError> {
        if spec.requires_auth {
            let timestamp = current_timestamp_ms()?;
            self.signer.sign(&self.credentials, spec, timestamp)
        } else {
            Ok(SignedRequest::unsigned(spec)?)
        }
    }
}
