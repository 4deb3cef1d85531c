//! Simple example of using reqwest-proxy-rotator.

use reqwest_proxy_rotator::{ProxyClient, ProxyPool, ProxyPoolConfig, RequestOptions, RetryTrigger};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        // proxybroker-style JSON list; plain `host:port` lists work too
        .sources(vec!["http://proxybroker.grachev.space/"])
        .throttle_interval(Duration::from_secs(1))
        .max_attempts(20)
        .stats_dir(std::env::temp_dir())
        .build();

    let pool = ProxyPool::new(config).await?;
    let client = ProxyClient::new(pool.clone());

    println!("Sending request...");
    let response = client
        .get(
            "https://httpbin.org/ip",
            // a blocked proxy often shows up as 403
            RequestOptions::new().retry_on(RetryTrigger::on_status([403])),
        )
        .await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);
    println!("Pool: {:?}", pool.get_stats());

    Ok(())
}
