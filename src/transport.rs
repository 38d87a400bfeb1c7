use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

use crate::error::TransportErrorKind;
use crate::util::classify_transport_error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Fully resolved request handed to a [`Transport`].
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(TransportErrorKind::Other, "request canceled")
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Network seam of the client.
///
/// Implementations must stop work and resolve promptly once `cancel` fires;
/// the client cancels the token when a request times out or the caller aborts.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest, cancel: CancellationToken) -> TransportFuture<'_>;
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = HttpConnector;

/// [`Transport`] backed by the hyper connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<Connector, Full<Bytes>>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("https", &cfg!(feature = "tls-rustls-ring"))
            .finish()
    }
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_pool(DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_IDLE_PER_HOST)
    }

    pub fn with_pool(pool_idle_timeout: Duration, pool_max_idle_per_host: usize) -> crate::Result<Self> {
        let connector = build_connector()?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(connector);
        Ok(Self { client })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn build_connector() -> crate::Result<Connector> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| crate::Error::InvalidConfig {
            message: format!("failed to initialize rustls: {source}"),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);
    Ok(https)
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_connector() -> crate::Result<Connector> {
    Ok(HttpConnector::new())
}

impl Transport for HyperTransport {
    fn send(&self, request: TransportRequest, cancel: CancellationToken) -> TransportFuture<'_> {
        let mut http_request = Request::new(Full::new(request.body.unwrap_or_default()));
        *http_request.method_mut() = request.method;
        *http_request.uri_mut() = request.uri;
        *http_request.headers_mut() = request.headers;

        Box::pin(async move {
            let exchange = async move {
                let response = self
                    .client
                    .request(http_request)
                    .await
                    .map_err(|source| TransportError::new(classify_transport_error(&source), source))?;
                let (parts, body) = response.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|source: hyper::Error| TransportError::new(TransportErrorKind::Read, source))?
                    .to_bytes();
                Ok::<_, TransportError>(TransportResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body,
                })
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::canceled()),
                result = exchange => result,
            }
        })
    }
}
