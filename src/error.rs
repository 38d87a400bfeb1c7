use http::Method;
use serde_json::Value;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Code attached to [`ApiError`] when a successful response body cannot be parsed.
pub const PARSE_ERROR: &str = "PARSE_ERROR";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidConfig,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    Transport,
    Timeout,
    Aborted,
    HttpStatus,
    Parse,
    Api,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidConfig => "invalid_config",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::HttpStatus => "http_status",
            Self::Parse => "parse",
            Self::Api => "api",
        }
    }
}

/// Failure reported by the backend or raised by an interceptor.
///
/// Values are never mutated once built; the `with_*` methods consume the
/// error and return a new one so interceptors can translate errors.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ApiError {
    message: String,
    status: Option<u16>,
    code: Option<String>,
    retryable: Option<bool>,
    data: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retryable: None,
            data: None,
        }
    }

    /// Error for a non-2xx response. A JSON object body contributes its
    /// `message` and `code` string fields when present.
    pub(crate) fn from_status(status: u16, method: &Method, uri: &str, data: Option<Value>) -> Self {
        let body_message = data
            .as_ref()
            .and_then(|value| value.get("message"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let body_code = data
            .as_ref()
            .and_then(|value| value.get("code"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let message = match body_message {
            Some(detail) => format!("http status {status} for {method} {uri}: {detail}"),
            None => format!("http status {status} for {method} {uri}"),
        };
        Self {
            message,
            status: Some(status),
            code: body_code,
            retryable: None,
            data,
        }
    }

    pub(crate) fn parse_failure(status: u16, detail: impl std::fmt::Display, body: String) -> Self {
        Self {
            message: format!("failed to parse response body: {detail}"),
            status: Some(status),
            code: Some(PARSE_ERROR.to_owned()),
            retryable: Some(false),
            data: Some(Value::String(body)),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn retryable(&self) -> Option<bool> {
        self.retryable
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn is_parse_error(&self) -> bool {
        self.code.as_deref() == Some(PARSE_ERROR)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {message}")]
    SerializeQuery { message: String },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http request aborted by caller for {method} {uri}")]
    Aborted { method: Method, uri: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Aborted { .. } => ErrorCode::Aborted,
            Self::Api(api) if api.is_parse_error() => ErrorCode::Parse,
            Self::Api(api) if api.status().is_some() => ErrorCode::HttpStatus,
            Self::Api(_) => ErrorCode::Api,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(api) => api.status(),
            _ => None,
        }
    }

    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(api) => Some(api),
            _ => None,
        }
    }

    /// True for timeouts and caller cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Aborted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
