use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// Global HTTP client with connection pooling and keep-alive.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(50)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(concat!("chatgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client")
});

/// Get the global HTTP client.
pub fn client() -> &'static Client {
    &HTTP_CLIENT
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability check: any response below 500 counts as up.
pub async fn probe(url: &str) -> bool {
    match client().get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => {
            let up = resp.status().as_u16() < 500;
            if !up {
                tracing::debug!("Probe {} returned {}", url, resp.status());
            }
            up
        }
        Err(e) => {
            tracing::debug!("Probe {} failed: {}", url, e);
            false
        }
    }
}
