use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::codec::Body;
use crate::error::ApiError;

/// Successful response with a decoded body.
#[derive(Clone, Debug)]
pub struct ApiResponse<T> {
    data: T,
    status: StatusCode,
    headers: HeaderMap,
}

/// Response as it travels through the pipeline and the cache.
pub type RawResponse = ApiResponse<Body>;

impl<T> ApiResponse<T> {
    pub fn new(status: StatusCode, headers: HeaderMap, data: T) -> Self {
        Self {
            data,
            status,
            headers,
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, T) {
        (self.status, self.headers, self.data)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            data: f(self.data),
            status: self.status,
            headers: self.headers,
        }
    }

    /// Returns the response with one header replaced.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl ApiResponse<Body> {
    /// Decodes the parsed body into `T`, reporting failures as `PARSE_ERROR`.
    pub fn decode<T>(&self) -> crate::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let data = self.data.decode::<T>().map_err(|source| {
            let body = match &self.data {
                Body::Json(value) => value.to_string(),
                Body::Text(text) => text.clone(),
                Body::Form(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Body::Empty => String::new(),
            };
            ApiError::parse_failure(self.status.as_u16(), source, body)
        })?;
        Ok(ApiResponse {
            data,
            status: self.status,
            headers: self.headers.clone(),
        })
    }
}
