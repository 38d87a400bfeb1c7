use std::collections::BTreeMap;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::codec::{Payload, Query, to_query};
use crate::error::Error;
use crate::retry::RetryPolicy;
use crate::util::{merge_headers, parse_header_name, parse_header_value};

pub(crate) const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Per-call request options.
///
/// Unset fields fall back to the client defaults when the request is merged.
#[derive(Clone, Debug, Default)]
pub struct RequestConfig {
    method: Method,
    url: String,
    headers: HeaderMap,
    query: Option<Query>,
    body: Option<Payload>,
    timeout: Option<Duration>,
    retry: Option<bool>,
    max_attempts: Option<usize>,
    cancel: Option<CancellationToken>,
    retry_policy: Option<RetryPolicy>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces the query with any value that serializes to a key/value object.
    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.query = Some(to_query(params)?);
        Ok(self)
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query
            .get_or_insert_with(Query::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, payload: Payload) -> Self {
        self.body = Some(payload);
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.body(Payload::json(payload)?))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(MIN_TIMEOUT));
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attaches the retry policy this request runs under.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn get_method(&self) -> &Method {
        &self.method
    }

    pub fn get_url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn get_query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub fn get_body(&self) -> Option<&Payload> {
        self.body.as_ref()
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.unwrap_or(false)
    }

    pub fn get_max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    pub fn get_cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn get_retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub(crate) fn take_retry_policy(&mut self) -> Option<RetryPolicy> {
        self.retry_policy.take()
    }

    /// Fills unset fields from the client defaults; values set on the call win.
    ///
    /// `max_attempts` is left alone: only an explicit per-call value overrides
    /// the retry interceptor's policy.
    pub(crate) fn merge_defaults(mut self, defaults: &RequestDefaults) -> Self {
        self.headers = merge_headers(&defaults.headers, &self.headers);
        self.timeout = Some(self.timeout.unwrap_or(defaults.timeout));
        self.retry = Some(self.retry.unwrap_or(defaults.retry));
        self
    }
}

/// Defaults resolved once when the client is built.
#[derive(Clone, Debug)]
pub(crate) struct RequestDefaults {
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Duration,
    pub(crate) retry: bool,
}

pub const BASE_URL_ENV: &str = "REQPIPE_BASE_URL";
pub const TIMEOUT_MS_ENV: &str = "REQPIPE_TIMEOUT_MS";
pub const DEFAULT_HEADERS_ENV: &str = "REQPIPE_DEFAULT_HEADERS";
pub const RETRY_ENV: &str = "REQPIPE_RETRY";
pub const MAX_ATTEMPTS_ENV: &str = "REQPIPE_MAX_ATTEMPTS";

/// Client-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub base_url: String,

    /// Default request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    /// Opt every request into retries unless the call says otherwise
    #[serde(default)]
    pub retry: bool,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: default_timeout_ms(),
            default_headers: BTreeMap::new(),
            retry: false,
            max_attempts: default_max_attempts(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Reads the `REQPIPE_*` environment variables.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = lookup(BASE_URL_ENV) {
            config.base_url = base_url.trim().to_owned();
        }
        if let Some(raw) = lookup(TIMEOUT_MS_ENV) {
            let timeout_ms = raw.trim().parse::<u64>().map_err(|_| Error::InvalidConfig {
                message: format!("{TIMEOUT_MS_ENV} must be a positive integer, got {raw:?}"),
            })?;
            if timeout_ms == 0 {
                return Err(Error::InvalidConfig {
                    message: format!("{TIMEOUT_MS_ENV} must be a positive integer, got 0"),
                });
            }
            config.timeout_ms = timeout_ms;
        }
        if let Some(raw) = lookup(DEFAULT_HEADERS_ENV) {
            config.default_headers =
                serde_json::from_str(&raw).map_err(|source| Error::InvalidConfig {
                    message: format!("{DEFAULT_HEADERS_ENV} must be a JSON object of strings: {source}"),
                })?;
        }
        if let Some(raw) = lookup(RETRY_ENV) {
            config.retry = parse_flag(&raw).ok_or_else(|| Error::InvalidConfig {
                message: format!("{RETRY_ENV} must be true/false/1/0, got {raw:?}"),
            })?;
        }
        if let Some(raw) = lookup(MAX_ATTEMPTS_ENV) {
            config.max_attempts = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|attempts| *attempts > 0)
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("{MAX_ATTEMPTS_ENV} must be a positive integer, got {raw:?}"),
                })?;
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> usize {
    3
}
