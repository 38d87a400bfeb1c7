use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RequestConfig;
use crate::error::Error;
use crate::interceptor::{RequestInterceptor, ResponseInterceptor};
use crate::response::RawResponse;
use crate::util::lock_unpoisoned;

/// Response header carrying a rotated access token.
pub const NEW_TOKEN_HEADER: &str = "x-new-token";

pub const DEFAULT_LOGIN_LOCATION: &str = "/login";

/// Durable home of the access token.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, token: &str);
    fn clear(&self);
}

/// Sends the user somewhere after their session ends.
pub trait Navigator: Send + Sync {
    fn redirect(&self, location: &str);
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        lock_unpoisoned(&self.token).clone()
    }

    fn save(&self, token: &str) {
        *lock_unpoisoned(&self.token) = Some(token.to_owned());
    }

    fn clear(&self) {
        *lock_unpoisoned(&self.token) = None;
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct StoredToken {
    token: String,
}

/// Token persisted as a small JSON document so it survives restarts.
///
/// I/O failures are logged and treated as "no token".
#[derive(Clone, Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "failed to read token file");
                return None;
            }
        };
        match serde_json::from_str::<StoredToken>(&raw) {
            Ok(stored) if !stored.token.is_empty() => Some(stored.token),
            Ok(_) => None,
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "ignoring malformed token file");
                None
            }
        }
    }

    fn save(&self, token: &str) {
        let stored = StoredToken {
            token: token.to_owned(),
        };
        let result = serde_json::to_vec(&stored)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(&self.path, bytes));
        if let Err(error) = result {
            warn!(path = %self.path.display(), error = %error, "failed to persist token");
        }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "failed to remove token file");
            }
        }
    }
}

/// Navigator for headless use: logs and remembers the last redirect.
#[derive(Debug, Default)]
pub struct LoggingNavigator {
    last: Mutex<Option<String>>,
}

impl LoggingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_location(&self) -> Option<String> {
        lock_unpoisoned(&self.last).clone()
    }
}

impl Navigator for LoggingNavigator {
    fn redirect(&self, location: &str) {
        info!(location, "redirecting after session reset");
        *lock_unpoisoned(&self.last) = Some(location.to_owned());
    }
}

/// Attaches the bearer token, follows token rotation and resets the session on 401.
pub struct AuthInterceptor {
    token: Mutex<Option<String>>,
    store: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    login_location: String,
}

impl std::fmt::Debug for AuthInterceptor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthInterceptor")
            .field("has_token", &lock_unpoisoned(&self.token).is_some())
            .field("login_location", &self.login_location)
            .finish()
    }
}

impl AuthInterceptor {
    pub fn new(store: Arc<dyn TokenStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            token: Mutex::new(None),
            store,
            navigator,
            login_location: DEFAULT_LOGIN_LOCATION.to_owned(),
        }
    }

    pub fn login_location(mut self, location: impl Into<String>) -> Self {
        self.login_location = location.into();
        self
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.store.save(&token);
        *lock_unpoisoned(&self.token) = Some(token);
    }

    pub fn clear_auth_token(&self) {
        *lock_unpoisoned(&self.token) = None;
        self.store.clear();
    }

    /// Current token, read through to the store when memory is empty.
    pub fn get_auth_token(&self) -> Option<String> {
        let mut token = lock_unpoisoned(&self.token);
        if token.is_none() {
            *token = self.store.load();
        }
        token.clone()
    }
}

impl RequestInterceptor for AuthInterceptor {
    fn on_request(&self, config: RequestConfig) -> crate::Result<RequestConfig> {
        let Some(token) = self.get_auth_token() else {
            return Ok(config);
        };
        let mut value = HeaderValue::try_from(format!("Bearer {token}")).map_err(|source| {
            Error::InvalidHeaderValue {
                name: AUTHORIZATION.as_str().to_owned(),
                source,
            }
        })?;
        value.set_sensitive(true);
        Ok(config.header(AUTHORIZATION, value))
    }
}

impl ResponseInterceptor for AuthInterceptor {
    fn on_response(&self, response: RawResponse) -> crate::Result<RawResponse> {
        let rotated = response
            .headers()
            .get(HeaderName::from_static(NEW_TOKEN_HEADER))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty());
        if let Some(token) = rotated {
            debug!("adopting rotated access token");
            self.set_auth_token(token);
        }
        Ok(response)
    }

    fn on_response_error(&self, error: Error) -> Error {
        if error.status() == Some(401) {
            warn!(location = %self.login_location, "unauthorized response, clearing session");
            self.clear_auth_token();
            self.navigator.redirect(&self.login_location);
        }
        error
    }
}
