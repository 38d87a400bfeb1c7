use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::cache::{ResponseCache, max_age};
use crate::codec::{Payload, encode_query, error_body_value, format_body, parse_body};
use crate::config::{ClientConfig, RequestConfig, RequestDefaults};
use crate::error::{ApiError, Error};
use crate::interceptor::{
    InterceptorChain, InterceptorHandle, RequestInterceptor, ResponseInterceptor,
    run_request_interceptors, run_response_error_hooks, run_response_interceptors,
};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::response::{ApiResponse, RawResponse};
use crate::transport::{HyperTransport, Transport, TransportError, TransportRequest, TransportResponse};
use crate::util::{
    append_query_string, parse_header_name, parse_header_value, parse_uri, redact_uri_for_logs,
    resolve_url,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CLIENT_NAME: &str = "reqpipe";

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    retry: bool,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<ResponseCache>>,
    client_name: String,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: false,
            transport: None,
            cache: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    /// Builder preloaded with a resolved [`ClientConfig`].
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        let mut builder = Self::new(config.base_url.clone())
            .request_timeout(config.timeout())
            .retry(config.retry);
        for (name, value) in &config.default_headers {
            builder = builder.try_default_header(name, value)?;
        }
        Ok(builder)
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        Ok(self.default_header(header_name, header_value))
    }

    /// Opts every request into retries unless the call says otherwise.
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Shares an existing cache instead of creating a private one.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        if !self.base_url.is_empty() {
            parse_uri(&self.base_url)?;
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };

        Ok(Client {
            base_url: self.base_url,
            defaults: RequestDefaults {
                headers: self.default_headers,
                timeout: self.request_timeout,
                retry: self.retry,
            },
            client_name: self.client_name,
            transport,
            cache: self.cache.unwrap_or_default(),
            request_interceptors: InterceptorChain::new(),
            response_interceptors: InterceptorChain::new(),
            metrics: ClientMetrics::default(),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqpipe client: {error}"))
    }
}

/// Request fields that stay fixed across retry attempts.
struct PreparedRequest {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Duration,
}

pub struct Client {
    base_url: String,
    defaults: RequestDefaults,
    client_name: String,
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    request_interceptors: InterceptorChain<dyn RequestInterceptor>,
    response_interceptors: InterceptorChain<dyn ResponseInterceptor>,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .field("request_interceptors", &self.request_interceptors.len())
            .field("response_interceptors", &self.response_interceptors.len())
            .finish()
    }
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        ClientBuilder::from_config(config)?.try_build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T>(&self, endpoint: &str, config: Option<RequestConfig>) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(config.unwrap_or_default().method(Method::GET).url(endpoint))
            .await
    }

    pub async fn post<T>(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
        config: Option<RequestConfig>,
    ) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(with_payload(config, Method::POST, endpoint, payload))
            .await
    }

    pub async fn put<T>(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
        config: Option<RequestConfig>,
    ) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(with_payload(config, Method::PUT, endpoint, payload))
            .await
    }

    pub async fn patch<T>(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
        config: Option<RequestConfig>,
    ) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(with_payload(config, Method::PATCH, endpoint, payload))
            .await
    }

    pub async fn delete<T>(&self, endpoint: &str, config: Option<RequestConfig>) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(config.unwrap_or_default().method(Method::DELETE).url(endpoint))
            .await
    }

    /// Runs the pipeline and decodes the body into `T`.
    pub async fn request<T>(&self, config: RequestConfig) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.execute(config).await?.decode::<T>()
    }

    /// Runs the pipeline and returns the parsed response.
    ///
    /// A cache hit returns the stored instance itself, so two hits on the same
    /// key yield pointer-equal values.
    pub async fn execute(&self, config: RequestConfig) -> crate::Result<Arc<RawResponse>> {
        let url = self.request_url(&config)?;
        let method = config.get_method().clone();
        let span = info_span!(
            "reqpipe.request",
            client = %self.client_name,
            method = %method,
            uri = %redact_uri_for_logs(&url)
        );
        let cache_key = ResponseCache::key(&method, &url);
        self.execute_resolved(config, method, cache_key)
            .instrument(span)
            .await
    }

    pub fn add_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) -> InterceptorHandle {
        self.request_interceptors.add(interceptor)
    }

    pub fn add_response_interceptor(&self, interceptor: Arc<dyn ResponseInterceptor>) -> InterceptorHandle {
        self.response_interceptors.add(interceptor)
    }

    pub fn remove_request_interceptor(&self, handle: InterceptorHandle) {
        self.request_interceptors.remove(handle);
    }

    pub fn remove_response_interceptor(&self, handle: InterceptorHandle) {
        self.response_interceptors.remove(handle);
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn request_url(&self, config: &RequestConfig) -> crate::Result<String> {
        let url = resolve_url(&self.base_url, config.get_url())?;
        Ok(match config.get_query() {
            Some(query) => append_query_string(&url, &encode_query(query)),
            None => url,
        })
    }

    async fn execute_resolved(
        &self,
        config: RequestConfig,
        method: Method,
        cache_key: String,
    ) -> crate::Result<Arc<RawResponse>> {
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let started = Instant::now();

        if method == Method::GET {
            if let Some(cached) = self.cache.get(&cache_key) {
                self.metrics.record_cache_hit();
                self.metrics
                    .record_request_succeeded(cached.status().as_u16(), started.elapsed());
                return Ok(cached);
            }
            self.metrics.record_cache_miss();
        }

        let result = self.run_pipeline(config, &cache_key).await;
        match &result {
            Ok(response) => {
                debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                self.metrics
                    .record_request_succeeded(response.status().as_u16(), started.elapsed());
            }
            Err(error) => {
                debug!(
                    code = error.code().as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "request failed"
                );
                self.metrics.record_request_failed(error, started.elapsed());
            }
        }
        result
    }

    async fn run_pipeline(&self, config: RequestConfig, cache_key: &str) -> crate::Result<Arc<RawResponse>> {
        let request_interceptors = self.request_interceptors.snapshot();
        let response_interceptors = self.response_interceptors.snapshot();

        let config = config.merge_defaults(&self.defaults);
        let mut config = run_request_interceptors(&request_interceptors, config)?;
        let request_token = match config.get_cancel_token() {
            Some(caller) => caller.child_token(),
            None => CancellationToken::new(),
        };
        let retry_policy = config.take_retry_policy();
        let request = self.prepare(&config)?;

        let outcome = match retry_policy.filter(|policy| policy.supports_retry(&request.method, &request.headers)) {
            Some(policy) => {
                policy
                    .run(&request_token, &self.metrics, |attempt| {
                        self.attempt(&request, &request_token, attempt)
                    })
                    .await
            }
            None => self.attempt(&request, &request_token, 1).await,
        };
        let response = outcome.map_err(|error| run_response_error_hooks(&response_interceptors, error))?;

        let response = Arc::new(run_response_interceptors(&response_interceptors, response)?);
        if request.method == Method::GET
            && let Some(ttl) = max_age(response.headers())
        {
            self.cache.set(cache_key, Arc::clone(&response), ttl);
            self.metrics.record_cache_store();
            debug!(ttl_secs = ttl.as_secs(), "stored response in cache");
        }
        Ok(response)
    }

    fn prepare(&self, config: &RequestConfig) -> crate::Result<PreparedRequest> {
        let url = self.request_url(config)?;
        let uri = parse_uri(&url)?;
        let mut headers = config.headers().clone();
        let body = format_body(config.get_body())?.map(|encoded| {
            if let Some(content_type) = encoded.content_type
                && !headers.contains_key(CONTENT_TYPE)
            {
                headers.insert(CONTENT_TYPE, content_type);
            }
            encoded.bytes
        });

        Ok(PreparedRequest {
            method: config.get_method().clone(),
            uri,
            redacted_uri: redact_uri_for_logs(&url),
            headers,
            body,
            timeout: config.get_timeout().unwrap_or(self.defaults.timeout),
        })
    }

    async fn attempt(
        &self,
        request: &PreparedRequest,
        cancel: &CancellationToken,
        attempt: usize,
    ) -> crate::Result<RawResponse> {
        let attempt_token = cancel.child_token();
        let transport_request = TransportRequest {
            method: request.method.clone(),
            uri: request.uri.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        debug!(attempt, timeout_ms = request.timeout.as_millis() as u64, "sending request");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt_token.cancel();
                return Err(Error::Aborted {
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                });
            }
            outcome = self.transport.send(transport_request, attempt_token.clone()) => outcome,
            _ = sleep(request.timeout) => {
                attempt_token.cancel();
                return Err(Error::Timeout {
                    timeout_ms: request.timeout.as_millis(),
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                });
            }
        };

        let TransportResponse {
            status,
            headers,
            body,
        } = outcome.map_err(|TransportError { kind, source }| Error::Transport {
            kind,
            method: request.method.clone(),
            uri: request.redacted_uri.clone(),
            source,
        })?;

        debug!(attempt, status = status.as_u16(), "received response");
        if !status.is_success() {
            return Err(ApiError::from_status(
                status.as_u16(),
                &request.method,
                &request.redacted_uri,
                error_body_value(&body),
            )
            .into());
        }
        let data = parse_body(status.as_u16(), &headers, body)?;
        Ok(RawResponse::new(status, headers, data))
    }
}

fn with_payload(
    config: Option<RequestConfig>,
    method: Method,
    endpoint: &str,
    payload: Option<Payload>,
) -> RequestConfig {
    let config = config.unwrap_or_default().method(method).url(endpoint);
    match payload {
        Some(payload) => config.body(payload),
        None => config,
    }
}
