use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Catalog fetches and AI calls both block on
/// upstream latency, so both timeouts are env-tunable.
pub fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(env_secs("OUTBOUND_TIMEOUT_SECS", 20)))
        .connect_timeout(Duration::from_secs(env_secs("OUTBOUND_CONNECT_TIMEOUT_SECS", 5)))
        .user_agent(concat!("argus-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
