use crate::config::StorageConfig;
use reqwest::Client;

pub fn build_client(config: &StorageConfig) -> Client {
    Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(config.http_connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}
