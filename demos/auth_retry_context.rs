use std::sync::Arc;
use std::time::Duration;

use reqpipe::prelude::{
    ApiContext, ClientConfig, Error, FileTokenStore, LoggingNavigator, RawResponse,
    RequestConfig, ResponseInterceptor,
};
use serde_json::Value;

struct StatusLogger;

impl ResponseInterceptor for StatusLogger {
    fn on_response(&self, response: RawResponse) -> reqpipe::Result<RawResponse> {
        println!("response: status={}", response.status());
        Ok(response)
    }

    fn on_response_error(&self, error: Error) -> Error {
        eprintln!(
            "error: code={} status={:?} err={error}",
            error.code().as_str(),
            error.status()
        );
        error
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new("https://httpbin.org")
        .with_timeout(Duration::from_secs(4))
        .with_default_header("x-client", "reqpipe-demo");
    let navigator = Arc::new(LoggingNavigator::new());
    let context = ApiContext::new(
        &config,
        Arc::new(FileTokenStore::new(
            std::env::temp_dir().join("reqpipe-demo-token.json"),
        )),
        navigator.clone(),
    )?;
    context.client.add_response_interceptor(Arc::new(StatusLogger));
    context.retry.configure(|policy| {
        policy
            .max_attempts(4)
            .initial_delay(Duration::from_millis(200))
            .max_delay(Duration::from_secs(1))
    });

    context.auth.set_auth_token("demo-token");
    let me = context.client.get::<Value>("/bearer", None).await?;
    println!("authenticated as token={}", me.data()["token"]);

    let flaky = context
        .client
        .get::<Value>("/status/503", Some(RequestConfig::new().retry(true)))
        .await;
    match flaky {
        Ok(response) => println!("unexpected success: status={}", response.status()),
        Err(error) => println!(
            "gave up after retries: code={} retries={}",
            error.code().as_str(),
            context.client.metrics_snapshot().retries
        ),
    }

    let denied = context.client.get::<Value>("/status/401", None).await;
    if let Err(error) = denied {
        println!(
            "session reset: status={:?} token={:?} redirected_to={:?}",
            error.status(),
            context.auth.get_auth_token(),
            navigator.last_location()
        );
    }
    Ok(())
}
