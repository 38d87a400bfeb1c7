use std::sync::Arc;

use crate::auth::{AuthInterceptor, Navigator, TokenStore};
use crate::cache::ResponseCache;
use crate::client::{Client, ClientBuilder};
use crate::config::ClientConfig;
use crate::retry::{RetryInterceptor, RetryPolicy};
use crate::transport::Transport;

/// Client wired with the standard interceptors.
///
/// Request interceptors run auth then retry; response interceptors run auth
/// then retry as well, so a 401 resets the session before the retry hint is
/// filled in. Every context owns its own cache and token state.
#[derive(Clone, Debug)]
pub struct ApiContext {
    pub client: Arc<Client>,
    pub cache: Arc<ResponseCache>,
    pub auth: Arc<AuthInterceptor>,
    pub retry: Arc<RetryInterceptor>,
}

impl ApiContext {
    pub fn new(
        config: &ClientConfig,
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> crate::Result<Self> {
        Self::assemble(ClientBuilder::from_config(config)?, config, store, navigator)
    }

    /// Same as [`ApiContext::new`] with a caller supplied transport.
    pub fn with_transport(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> crate::Result<Self> {
        Self::assemble(
            ClientBuilder::from_config(config)?.transport(transport),
            config,
            store,
            navigator,
        )
    }

    fn assemble(
        builder: ClientBuilder,
        config: &ClientConfig,
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> crate::Result<Self> {
        let cache = Arc::new(ResponseCache::new());
        let client = builder.cache(Arc::clone(&cache)).try_build()?;

        let auth = Arc::new(AuthInterceptor::new(store, navigator));
        let retry = Arc::new(RetryInterceptor::new(
            RetryPolicy::standard().max_attempts(config.max_attempts),
        ));
        client.add_request_interceptor(auth.clone());
        client.add_request_interceptor(retry.clone());
        client.add_response_interceptor(auth.clone());
        client.add_response_interceptor(retry.clone());

        Ok(Self {
            client: Arc::new(client),
            cache,
            auth,
            retry,
        })
    }
}
