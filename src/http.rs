use crate::config::ClientConfig;
use reqwest::Client;

/// Shared HTTP client. Per-call deadlines are enforced by the request layer, so
/// only the connect timeout is set here.
pub fn build_client(config: &ClientConfig) -> Client {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}
