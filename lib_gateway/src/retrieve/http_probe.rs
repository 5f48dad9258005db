//! # HTTP Liveness Probe
//!
//! A probe is a single GET of `{target}{probe_path}`. Only `200 OK` counts as
//! healthy; any other status, a connection error or a timeout is a failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::configs::HealthConfig;
use crate::core::health::Prober;

/// `Prober` backed by a shared `reqwest::Client`.
pub struct HttpProber {
    client: reqwest::Client,
    probe_path: String,
}

impl HttpProber {
    /// Builds a prober whose requests time out after `timeout`.
    pub fn new(timeout: Duration, probe_path: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            probe_path: probe_path.to_string(),
        })
    }

    /// Builds a prober from the health section of the configuration.
    pub fn from_config(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.timeout(), &config.probe_path)
    }

    fn probe_url(&self, url: &str) -> String {
        let base = url.trim_end_matches('/');
        if self.probe_path.starts_with('/') {
            format!("{}{}", base, self.probe_path)
        } else {
            format!("{}/{}", base, self.probe_path)
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> bool {
        let probe_url = self.probe_url(url);
        match self.client.get(&probe_url).send().await {
            Ok(response) => {
                let status = response.status();
                if status != StatusCode::OK {
                    log::debug!("Probe {} answered {}", probe_url, status);
                }
                status == StatusCode::OK
            }
            Err(e) => {
                log::debug!("Probe {} failed: {}", probe_url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use tokio::net::TcpListener;

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/healthz", get(|| async { "ok" }))
            .route("/busy", get(|| async { AxumStatus::SERVICE_UNAVAILABLE }))
            .route("/created", get(|| async { AxumStatus::CREATED }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn prober(path: &str) -> HttpProber {
        HttpProber::new(Duration::from_millis(300), path).unwrap()
    }

    #[tokio::test]
    async fn test_200_is_healthy() {
        let base = spawn_server().await;

        assert!(prober("/").probe(&base).await);
        assert!(prober("healthz").probe(&format!("{}/", base)).await);
    }

    #[tokio::test]
    async fn test_other_statuses_fail() {
        let base = spawn_server().await;

        assert!(!prober("/busy").probe(&base).await);
        assert!(!prober("/created").probe(&base).await);
        assert!(!prober("/missing").probe(&base).await);
    }

    #[tokio::test]
    async fn test_timeout_and_refused_fail() {
        let base = spawn_server().await;
        assert!(!prober("/slow").probe(&base).await);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        assert!(!prober("/").probe(&closed).await);
    }
}
