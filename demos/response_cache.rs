use std::sync::Arc;
use std::time::Duration;

use reqpipe::prelude::{Client, RequestConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder("https://httpbin.org")
        .client_name("reqpipe-demo-cache")
        .request_timeout(Duration::from_secs(4))
        .try_build()?;

    // httpbin answers /cache/{n} with `cache-control: public, max-age=n`.
    let first = client.execute(RequestConfig::new().url("/cache/30")).await?;
    let second = client.execute(RequestConfig::new().url("/cache/30")).await?;
    println!(
        "status={} shared_instance={}",
        second.status(),
        Arc::ptr_eq(&first, &second)
    );

    let other_query = client
        .execute(RequestConfig::new().url("/cache/30").query_pair("page", "2"))
        .await?;
    println!(
        "different query hits the network: shared_instance={}",
        Arc::ptr_eq(&first, &other_query)
    );

    let stats = client.cache().stats();
    println!(
        "cache entries={} hits={} misses={} stores={}",
        client.cache().len(),
        stats.hits,
        stats.misses,
        stats.stores
    );
    Ok(())
}
