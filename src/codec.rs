//! Query, request body and response body encoding.

use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, Error};
use crate::util::truncate_body;

/// Key/value mapping serialized onto the request URL.
pub type Query = serde_json::Map<String, Value>;

/// Converts any serializable map-like value into a [`Query`].
///
/// Anything that does not serialize to a JSON object is rejected before a
/// request is built.
pub fn to_query<T>(params: &T) -> crate::Result<Query>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(params).map_err(|source| Error::SerializeQuery {
        message: source.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::SerializeQuery {
            message: format!("query must be a key/value object, got {}", json_kind(&other)),
        }),
    }
}

/// Serializes a query mapping into an `application/x-www-form-urlencoded` string.
///
/// `null` values are omitted, arrays repeat the key once per element and
/// nested objects are sent as their JSON text.
pub fn encode_query(query: &Query) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in query {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = scalar_text(item) {
                        serializer.append_pair(name, &text);
                    }
                }
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    serializer.append_pair(name, &text);
                }
            }
        }
    }
    serializer.finish()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Sent as JSON text; `Value::Null` produces no body.
    Json(Value),
    /// Sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Sent unmodified.
    Binary {
        content_type: Option<HeaderValue>,
        bytes: Bytes,
    },
    /// Pre-encoded multipart body, sent unmodified.
    Multipart { boundary: String, bytes: Bytes },
}

impl Payload {
    pub fn json<T>(payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_value(payload)
            .map(Self::Json)
            .map_err(|source| Error::SerializeJson { source })
    }

    pub fn form<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Form(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::Binary {
            content_type: None,
            bytes: bytes.into(),
        }
    }
}

/// Body ready for the transport, with the content type it implies.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedBody {
    pub content_type: Option<HeaderValue>,
    pub bytes: Bytes,
}

/// Turns an optional payload into transmittable bytes.
pub fn format_body(payload: Option<&Payload>) -> crate::Result<Option<EncodedBody>> {
    let Some(payload) = payload else {
        return Ok(None);
    };
    let encoded = match payload {
        Payload::Json(Value::Null) => return Ok(None),
        Payload::Json(value) => {
            let bytes = serde_json::to_vec(value).map_err(|source| Error::SerializeJson { source })?;
            EncodedBody {
                content_type: Some(HeaderValue::from_static("application/json")),
                bytes: Bytes::from(bytes),
            }
        }
        Payload::Form(pairs) => {
            let encoded =
                serde_urlencoded::to_string(pairs).map_err(|source| Error::SerializeForm { source })?;
            EncodedBody {
                content_type: Some(HeaderValue::from_static(
                    "application/x-www-form-urlencoded",
                )),
                bytes: Bytes::from(encoded),
            }
        }
        Payload::Binary {
            content_type,
            bytes,
        } => EncodedBody {
            content_type: content_type.clone(),
            bytes: bytes.clone(),
        },
        Payload::Multipart { boundary, bytes } => {
            let content_type = format!("multipart/form-data; boundary={boundary}");
            let content_type =
                HeaderValue::from_str(&content_type).map_err(|source| Error::InvalidHeaderValue {
                    name: CONTENT_TYPE.as_str().to_owned(),
                    source,
                })?;
            EncodedBody {
                content_type: Some(content_type),
                bytes: bytes.clone(),
            }
        }
    };
    Ok(Some(encoded))
}

/// Parsed response body.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Text(String),
    /// Raw multipart or urlencoded form body.
    Form(Bytes),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserializes the body. Text and form bodies deserialize as a JSON string,
    /// an empty body as `null`.
    pub fn decode<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Text(text) => T::deserialize(&Value::String(text.clone())),
            Self::Form(bytes) => {
                T::deserialize(&Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }
            Self::Empty => T::deserialize(&Value::Null),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContentKind {
    Json,
    Text,
    Form,
    Unknown,
}

fn content_kind(headers: &HeaderMap) -> ContentKind {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) else {
        return ContentKind::Unknown;
    };
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence == "application/json" || essence.ends_with("+json") {
        ContentKind::Json
    } else if essence.starts_with("text/") {
        ContentKind::Text
    } else if essence == "multipart/form-data" || essence == "application/x-www-form-urlencoded" {
        ContentKind::Form
    } else {
        ContentKind::Unknown
    }
}

/// Parses a successful response body according to its declared content type.
pub(crate) fn parse_body(status: u16, headers: &HeaderMap, bytes: Bytes) -> crate::Result<Body> {
    if bytes.is_empty() {
        return Ok(Body::Empty);
    }
    match content_kind(headers) {
        ContentKind::Json => serde_json::from_slice(&bytes)
            .map(Body::Json)
            .map_err(|source| ApiError::parse_failure(status, source, truncate_body(&bytes)).into()),
        ContentKind::Text => String::from_utf8(bytes.to_vec())
            .map(Body::Text)
            .map_err(|source| ApiError::parse_failure(status, source, truncate_body(&bytes)).into()),
        ContentKind::Form => Ok(Body::Form(bytes)),
        ContentKind::Unknown => Ok(Body::Text(String::from_utf8_lossy(&bytes).into_owned())),
    }
}

/// Best-effort body of an error response: JSON when it parses, text otherwise.
pub(crate) fn error_body_value(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(bytes)
        .ok()
        .or_else(|| Some(Value::String(truncate_body(bytes))))
}
