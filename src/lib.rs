//! `reqpipe` is a typed HTTP client for single-origin JSON backends, built around
//! an interceptor pipeline with response caching, retry and per-request timeouts.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reqpipe::prelude::{ApiContext, ClientConfig, LoggingNavigator, MemoryTokenStore, RequestConfig};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Health {
//!     status: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://api.example.com")
//!         .with_timeout(Duration::from_secs(3))
//!         .with_default_header("x-client", "my-app");
//!     let context = ApiContext::new(
//!         &config,
//!         Arc::new(MemoryTokenStore::new()),
//!         Arc::new(LoggingNavigator::new()),
//!     )?;
//!     context.auth.set_auth_token("token-123");
//!
//!     let health = context
//!         .client
//!         .get::<Health>("/health", Some(RequestConfig::new().retry(true)))
//!         .await?;
//!     println!("status={}", health.data().status);
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline
//!
//! - GET responses carrying `cache-control: max-age=N` are cached for `N` seconds
//!   and served without touching interceptors or the network.
//! - Request interceptors run in registration order before the network call;
//!   response interceptors run in registration order after it.
//! - Retries only happen for requests that opt in, and only for idempotent
//!   methods or requests carrying an `idempotency-key` header.

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod auth;
mod cache;
mod client;
mod codec;
mod config;
mod context;
mod error;
mod interceptor;
mod metrics;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::auth::{
    AuthInterceptor, DEFAULT_LOGIN_LOCATION, FileTokenStore, LoggingNavigator, MemoryTokenStore,
    NEW_TOKEN_HEADER, Navigator, TokenStore,
};
pub use crate::cache::{CacheStats, Clock, ResponseCache, SystemClock};
pub use crate::client::{Client, ClientBuilder};
pub use crate::codec::{Body, EncodedBody, Payload, Query, encode_query, format_body, to_query};
pub use crate::config::{
    BASE_URL_ENV, ClientConfig, DEFAULT_HEADERS_ENV, MAX_ATTEMPTS_ENV, RETRY_ENV, RequestConfig,
    TIMEOUT_MS_ENV,
};
pub use crate::context::ApiContext;
pub use crate::error::{ApiError, Error, ErrorCode, PARSE_ERROR, TransportErrorKind};
pub use crate::interceptor::{
    InterceptorChain, InterceptorHandle, RequestInterceptor, ResponseInterceptor,
};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::response::{ApiResponse, RawResponse};
pub use crate::retry::{RetryInterceptor, RetryPolicy};
pub use crate::transport::{
    HyperTransport, Transport, TransportError, TransportFuture, TransportRequest,
    TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ApiContext, ApiError, ApiResponse, AuthInterceptor, Body, Client, ClientConfig,
        ClientMetricsSnapshot, Error, ErrorCode, FileTokenStore, LoggingNavigator,
        MemoryTokenStore, Payload, RawResponse, RequestConfig, RequestInterceptor,
        ResponseCache, ResponseInterceptor, Result, RetryInterceptor, RetryPolicy, Transport,
    };
}
