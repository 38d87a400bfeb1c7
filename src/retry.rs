use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use http::{HeaderMap, Method};
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::config::RequestConfig;
use crate::error::Error;
use crate::interceptor::{RequestInterceptor, ResponseInterceptor};
use crate::metrics::ClientMetrics;
use crate::response::RawResponse;
use crate::util::lock_unpoisoned;

/// Bounded exponential backoff with additive jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter: Duration,
    retryable_statuses: BTreeSet<u16>,
    allow_non_idempotent: bool,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(100),
            retryable_statuses: default_retryable_statuses(),
            allow_non_idempotent: false,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().max_attempts(1)
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        if self.max_delay < self.initial_delay {
            self.max_delay = self.initial_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.initial_delay);
        self
    }

    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = if backoff_factor.is_finite() {
            backoff_factor.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Upper bound of the random delay added to every backoff.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    /// Retry methods that are not idempotent even without an idempotency key.
    pub fn allow_non_idempotent(mut self, allow: bool) -> Self {
        self.allow_non_idempotent = allow;
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Whether a request that failed with `error` after `attempt` attempts should be re-issued.
    pub fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error {
            Error::Timeout { .. } => true,
            Error::Api(api) if api.is_parse_error() => false,
            Error::Api(api) => api
                .status()
                .is_some_and(|status| self.is_retryable_status(status)),
            _ => false,
        }
    }

    /// Backoff before retry `retry_index` (0 for the first retry), jitter included.
    pub fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let exponent = retry_index.min(i32::MAX as usize) as i32;
        let scaled_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        let delay = Duration::from_millis(scaled_ms.min(max_ms).max(0.0) as u64);
        delay + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn supports_retry(&self, method: &Method, headers: &HeaderMap) -> bool {
        self.allow_non_idempotent || request_supports_retry(method, headers)
    }

    /// Runs `attempt` until it succeeds, the policy gives up, or `cancel` fires
    /// during a backoff wait.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        metrics: &ClientMetrics,
        mut attempt: F,
    ) -> crate::Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempts = 0_usize;
        loop {
            attempts += 1;
            let error = match attempt(attempts).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            if !self.should_retry(&error, attempts) {
                return Err(error);
            }

            let delay = self.backoff_for_retry(attempts - 1);
            warn!(
                attempt = attempts,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            metrics.record_retry();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(error),
                _ = sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_statuses() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}

pub(crate) fn request_supports_retry(method: &Method, headers: &HeaderMap) -> bool {
    is_method_idempotent(method) || headers.get(IDEMPOTENCY_KEY_HEADER).is_some()
}

fn is_method_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Opts requests into retries under a shared, reconfigurable policy.
///
/// The policy is copied onto each request when it starts, so [`configure`]
/// only affects requests issued afterwards.
///
/// [`configure`]: RetryInterceptor::configure
#[derive(Debug, Default)]
pub struct RetryInterceptor {
    policy: Mutex<RetryPolicy>,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Mutex::new(policy),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        lock_unpoisoned(&self.policy).clone()
    }

    pub fn configure(&self, update: impl FnOnce(RetryPolicy) -> RetryPolicy) {
        let mut policy = lock_unpoisoned(&self.policy);
        *policy = update(policy.clone());
    }
}

impl RequestInterceptor for RetryInterceptor {
    fn on_request(&self, config: RequestConfig) -> crate::Result<RequestConfig> {
        if !config.retry_enabled() || config.get_retry_policy().is_some() {
            return Ok(config);
        }
        let mut policy = self.policy();
        if let Some(max_attempts) = config.get_max_attempts() {
            policy = policy.max_attempts(max_attempts);
        }
        Ok(config.retry_policy(policy))
    }
}

impl ResponseInterceptor for RetryInterceptor {
    fn on_response(&self, response: RawResponse) -> crate::Result<RawResponse> {
        Ok(response)
    }

    fn on_response_error(&self, error: Error) -> Error {
        match error {
            Error::Api(api) if api.retryable().is_none() => {
                let retryable = api
                    .status()
                    .is_some_and(|status| lock_unpoisoned(&self.policy).is_retryable_status(status));
                Error::Api(api.with_retryable(retryable))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ApiError;

    fn status_error(status: u16) -> Error {
        ApiError::new("failed").with_status(status).into()
    }

    fn timeout_error() -> Error {
        Error::Timeout {
            timeout_ms: 10,
            method: Method::GET,
            uri: "https://api.test/slow".to_owned(),
        }
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.configured_max_attempts(), 3);
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(status), "{status} should retry");
        }
        assert!(!policy.is_retryable_status(404));
    }

    #[test]
    fn should_retry_respects_attempt_bound_and_classification() {
        let policy = RetryPolicy::standard().max_attempts(3);
        assert!(policy.should_retry(&status_error(503), 1));
        assert!(policy.should_retry(&status_error(503), 2));
        assert!(!policy.should_retry(&status_error(503), 3));
        assert!(!policy.should_retry(&status_error(404), 1));
        assert!(policy.should_retry(&timeout_error(), 1));
        assert!(!policy.should_retry(
            &Error::Aborted {
                method: Method::GET,
                uri: "https://api.test".to_owned()
            },
            1
        ));
        assert!(!policy.should_retry(
            &ApiError::parse_failure(200, "bad json", String::new()).into(),
            1
        ));
    }

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350))
            .jitter(Duration::ZERO);
        assert_eq!(policy.backoff_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for_retry(30), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(100));
        for _ in 0..256 {
            let backoff = policy.backoff_for_retry(3);
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(200));
        }
    }

    #[test]
    fn post_requires_idempotency_key_unless_allowed() {
        let policy = RetryPolicy::standard();
        let mut headers = HeaderMap::new();
        assert!(!policy.supports_retry(&Method::POST, &headers));
        headers.insert(IDEMPOTENCY_KEY_HEADER, "key-1".parse().expect("valid header"));
        assert!(policy.supports_retry(&Method::POST, &headers));
        assert!(
            RetryPolicy::standard()
                .allow_non_idempotent(true)
                .supports_retry(&Method::POST, &HeaderMap::new())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_after_max_attempts() {
        let policy = RetryPolicy::standard()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(10))
            .jitter(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        let result: crate::Result<()> = policy
            .run(&CancellationToken::new(), &ClientMetrics::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(503)) }
            })
            .await;

        assert_eq!(result.expect_err("should give up").status(), Some(503));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_first_success() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_millis(10))
            .jitter(Duration::ZERO);
        let result = policy
            .run(&CancellationToken::new(), &ClientMetrics::default(), |attempt| async move {
                if attempt < 3 {
                    Err(status_error(502))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.expect("third attempt succeeds"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_secs(60))
            .jitter(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let result: crate::Result<()> = policy
            .run(&cancel, &ClientMetrics::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(503)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interceptor_snapshots_policy_with_call_override() {
        let interceptor = RetryInterceptor::new(RetryPolicy::standard());
        let config = interceptor
            .on_request(RequestConfig::new().retry(true).max_attempts(5))
            .expect("interceptor never fails");
        let attached = config.get_retry_policy().expect("policy attached");
        assert_eq!(attached.configured_max_attempts(), 5);

        interceptor.configure(|policy| policy.max_attempts(1));
        assert_eq!(attached.configured_max_attempts(), 5);
        assert_eq!(interceptor.policy().configured_max_attempts(), 1);
    }

    #[test]
    fn interceptor_leaves_requests_without_opt_in_alone() {
        let interceptor = RetryInterceptor::new(RetryPolicy::standard());
        let config = interceptor
            .on_request(RequestConfig::new())
            .expect("interceptor never fails");
        assert!(config.get_retry_policy().is_none());
    }

    #[test]
    fn interceptor_fills_retry_hint_on_status_errors() {
        let interceptor = RetryInterceptor::new(RetryPolicy::standard());
        let error = interceptor.on_response_error(status_error(503));
        assert_eq!(error.as_api().and_then(ApiError::retryable), Some(true));
        let error = interceptor.on_response_error(status_error(400));
        assert_eq!(error.as_api().and_then(ApiError::retryable), Some(false));
    }
}
