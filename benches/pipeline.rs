use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use reqpipe::prelude::{
    ApiContext, Client, ClientConfig, LoggingNavigator, MemoryTokenStore, RequestConfig,
    RequestInterceptor, Transport,
};
use reqpipe::{TransportFuture, TransportRequest, TransportResponse};
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

struct StaticTransport {
    headers: HeaderMap,
    body: &'static str,
}

impl StaticTransport {
    fn new(cache_control: Option<&'static str>) -> Arc<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(cache_control) = cache_control {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
        }
        Arc::new(Self {
            headers,
            body: r#"{"status":"ok","items":[1,2,3]}"#,
        })
    }
}

impl Transport for StaticTransport {
    fn send(&self, _request: TransportRequest, _cancel: CancellationToken) -> TransportFuture<'_> {
        let response = TransportResponse::new(StatusCode::OK, self.headers.clone(), self.body);
        Box::pin(async move { Ok(response) })
    }
}

struct Noop;

impl RequestInterceptor for Noop {
    fn on_request(&self, config: RequestConfig) -> reqpipe::Result<RequestConfig> {
        Ok(config)
    }
}

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn bench_cache_hit(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = Arc::new(
        Client::builder("https://api.bench")
            .transport(StaticTransport::new(Some("max-age=3600")))
            .try_build()
            .expect("client should build"),
    );
    runtime
        .block_on(client.execute(RequestConfig::new().url("/health")))
        .expect("warm cache");

    c.bench_function("cache_hit", |b| {
        let client = Arc::clone(&client);
        b.to_async(&runtime).iter(|| {
            let client = Arc::clone(&client);
            async move {
                let response = client
                    .execute(RequestConfig::new().url("/health"))
                    .await
                    .expect("cache hit should succeed");
                black_box(response.status());
            }
        });
    });
}

fn bench_interceptor_chain(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let mut group = c.benchmark_group("interceptor_chain");

    for interceptors in [0_usize, 4, 16] {
        let client = Arc::new(
            Client::builder("https://api.bench")
                .transport(StaticTransport::new(None))
                .try_build()
                .expect("client should build"),
        );
        for _ in 0..interceptors {
            client.add_request_interceptor(Arc::new(Noop));
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(interceptors),
            &interceptors,
            |b, _| {
                let client = Arc::clone(&client);
                b.to_async(&runtime).iter(|| {
                    let client = Arc::clone(&client);
                    async move {
                        let response = client
                            .get::<Value>("/items", None)
                            .await
                            .expect("request should succeed");
                        black_box(response.status());
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_context_request(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let context = ApiContext::with_transport(
        &ClientConfig::new("https://api.bench"),
        StaticTransport::new(None),
        Arc::new(MemoryTokenStore::new()),
        Arc::new(LoggingNavigator::new()),
    )
    .expect("context should build");
    context.auth.set_auth_token("bench-token");
    let client = Arc::clone(&context.client);

    c.bench_function("context_authorized_get", |b| {
        let client = Arc::clone(&client);
        b.to_async(&runtime).iter(|| {
            let client = Arc::clone(&client);
            async move {
                let response = client
                    .get::<Value>("/me", Some(RequestConfig::new().retry(true)))
                    .await
                    .expect("request should succeed");
                black_box(response.status());
            }
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(4));
    targets = bench_cache_hit, bench_interceptor_chain, bench_context_request
);
criterion_main!(benches);
