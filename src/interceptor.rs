use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::RequestConfig;
use crate::error::Error;
use crate::response::RawResponse;
use crate::util::lock_unpoisoned;

/// Transforms outgoing requests.
pub trait RequestInterceptor: Send + Sync {
    fn on_request(&self, config: RequestConfig) -> crate::Result<RequestConfig>;

    /// Called with the error this interceptor's `on_request` returned.
    fn on_request_error(&self, error: Error) -> Error {
        error
    }
}

/// Transforms responses and translates failures.
pub trait ResponseInterceptor: Send + Sync {
    fn on_response(&self, response: RawResponse) -> crate::Result<RawResponse>;

    /// Called with the error this interceptor's `on_response` returned, and
    /// with any request failure on its way back to the caller.
    fn on_response_error(&self, error: Error) -> Error {
        error
    }
}

/// 1-based position of a registered interceptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterceptorHandle(usize);

impl InterceptorHandle {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Insertion-ordered interceptor list.
///
/// Removal leaves an empty slot behind so handles stay stable and removing a
/// handle twice never touches another interceptor.
pub struct InterceptorChain<I: ?Sized> {
    entries: Mutex<Vec<Option<Arc<I>>>>,
}

impl<I: ?Sized> Default for InterceptorChain<I> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<I: ?Sized> std::fmt::Debug for InterceptorChain<I> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptorChain")
            .field("active", &self.len())
            .finish()
    }
}

impl<I: ?Sized> InterceptorChain<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interceptor: Arc<I>) -> InterceptorHandle {
        let mut entries = lock_unpoisoned(&self.entries);
        entries.push(Some(interceptor));
        InterceptorHandle(entries.len())
    }

    /// Removes the interceptor at `handle`; unknown or already removed handles are ignored.
    pub fn remove(&self, handle: InterceptorHandle) {
        let mut entries = lock_unpoisoned(&self.entries);
        let Some(index) = handle.0.checked_sub(1) else {
            return;
        };
        if let Some(slot) = entries.get_mut(index) {
            *slot = None;
        }
    }

    /// Live interceptors in registration order, copied once per request.
    pub fn snapshot(&self) -> Vec<Arc<I>> {
        lock_unpoisoned(&self.entries)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn run_request_interceptors(
    interceptors: &[Arc<dyn RequestInterceptor>],
    mut config: RequestConfig,
) -> crate::Result<RequestConfig> {
    for (position, interceptor) in interceptors.iter().enumerate() {
        config = match interceptor.on_request(config) {
            Ok(config) => config,
            Err(error) => {
                debug!(position, error = %error, "request interceptor failed");
                return Err(interceptor.on_request_error(error));
            }
        };
    }
    Ok(config)
}

pub(crate) fn run_response_interceptors(
    interceptors: &[Arc<dyn ResponseInterceptor>],
    mut response: RawResponse,
) -> crate::Result<RawResponse> {
    for (position, interceptor) in interceptors.iter().enumerate() {
        response = match interceptor.on_response(response) {
            Ok(response) => response,
            Err(error) => {
                debug!(position, error = %error, "response interceptor failed");
                return Err(interceptor.on_response_error(error));
            }
        };
    }
    Ok(response)
}

pub(crate) fn run_response_error_hooks(
    interceptors: &[Arc<dyn ResponseInterceptor>],
    error: Error,
) -> Error {
    interceptors
        .iter()
        .fold(error, |error, interceptor| interceptor.on_response_error(error))
}
