//! Peer/hangout directory discovery from a list of bootstrap URLs.

use std::{collections::HashMap, sync::Mutex};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::punchgate::{config::BootstrapConfig, ids::PeerId, net};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap: no more candidate URLs")]
    Exhausted,
    #[error("bootstrap: invalid directory response from {url}: missing {missing:?}")]
    InvalidDirectoryResponse { url: String, missing: &'static str },
    #[error("bootstrap: fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangoutAddr {
    pub address: String,
    pub port: u16,
}

impl HangoutAddr {
    pub fn dial_addr(&self) -> String {
        net::join_host_port(&self.address, self.port)
    }
}

/// Snapshot of the known rendezvous servers and peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub hangouts: HashMap<String, HangoutAddr>,
    pub peers: HashMap<PeerId, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    hangouts: Option<HashMap<String, HangoutAddr>>,
    peers: Option<HashMap<PeerId, serde_json::Value>>,
}

pub struct BootstrapLoader {
    urls: Vec<String>,
    // `None` until the first load; reshuffled on force.
    queue: Mutex<Option<Vec<String>>>,
    http: reqwest::Client,
}

impl BootstrapLoader {
    pub fn new(cfg: &BootstrapConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            urls: cfg.urls.clone(),
            queue: Mutex::new(None),
            http,
        })
    }

    /// Fetches a directory, trying candidate URLs until one answers with a valid body.
    ///
    /// Individual URL failures are logged and skipped; only running out of
    /// candidates is an error.
    pub async fn load(&self, force: bool) -> Result<Directory, BootstrapError> {
        let mut reshuffle = force;
        loop {
            let url = self.next_url(reshuffle)?;
            reshuffle = false;

            match self.fetch(&url).await {
                Ok(dir) => {
                    tracing::info!(
                        url = %url,
                        hangouts = dir.hangouts.len(),
                        peers = dir.peers.len(),
                        "bootstrap: directory loaded"
                    );
                    return Ok(dir);
                }
                Err(err) => {
                    metrics::counter!("punchgate_bootstrap_failures_total").increment(1);
                    tracing::warn!(url = %url, err = %err, "bootstrap: candidate failed; trying next");
                }
            }
        }
    }

    pub fn remaining(&self) -> usize {
        let q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.as_ref().map_or(self.urls.len(), |v| v.len())
    }

    fn next_url(&self, reshuffle: bool) -> Result<String, BootstrapError> {
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if q.is_none() || reshuffle {
            let mut urls = self.urls.clone();
            urls.shuffle(&mut rand::rng());
            *q = Some(urls);
        }
        q.as_mut()
            .and_then(|v| v.pop())
            .ok_or(BootstrapError::Exhausted)
    }

    async fn fetch(&self, url: &str) -> Result<Directory, BootstrapError> {
        let fetch_err = |source| BootstrapError::Fetch {
            url: url.to_string(),
            source,
        };
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_err)?;
        let body: DirectoryResponse = resp.json().await.map_err(fetch_err)?;

        let invalid = |missing| BootstrapError::InvalidDirectoryResponse {
            url: url.to_string(),
            missing,
        };
        Ok(Directory {
            hangouts: body.hangouts.ok_or_else(|| invalid("hangouts"))?,
            peers: body.peers.ok_or_else(|| invalid("peers"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{Json, Router, routing::get};
    use serde_json::json;

    use super::*;

    async fn serve_fixtures() -> String {
        let app = Router::new()
            .route(
                "/good",
                get(|| async {
                    Json(json!({
                        "hangouts": {"h1": {"address": "127.0.0.1", "port": 7001}},
                        "peers": {"alice": {"region": "eu"}, "bob": {}}
                    }))
                }),
            )
            .route(
                "/no-peers",
                get(|| async { Json(json!({"hangouts": {}})) }),
            )
            .route("/garbage", get(|| async { "not json" }));

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(ln, app).await;
        });
        format!("http://{addr}")
    }

    fn loader(urls: Vec<String>) -> BootstrapLoader {
        BootstrapLoader::new(&BootstrapConfig {
            urls,
            request_timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn skips_bad_candidates_then_exhausts() {
        let base = serve_fixtures().await;
        let l = loader(vec![
            format!("{base}/no-peers"),
            format!("{base}/garbage"),
            format!("{base}/good"),
            "http://127.0.0.1:1/unreachable".into(),
        ]);

        let dir = l.load(false).await.expect("one candidate is valid");
        assert_eq!(dir.hangouts["h1"].dial_addr(), "127.0.0.1:7001");
        assert!(dir.peers.contains_key("alice"));
        assert_eq!(dir.peers.len(), 2);

        // Every remaining candidate is broken.
        let err = l.load(false).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Exhausted));
        assert_eq!(l.remaining(), 0);

        // Forcing reshuffles the full list.
        let again = l.load(true).await.expect("reloaded");
        assert_eq!(again, dir);
    }

    #[tokio::test]
    async fn empty_list_is_exhausted() {
        let l = loader(vec![]);
        assert!(matches!(l.load(false).await, Err(BootstrapError::Exhausted)));
    }

    #[tokio::test]
    async fn missing_key_is_invalid_response() {
        let base = serve_fixtures().await;
        let l = loader(vec![]);
        let err = l.fetch(&format!("{base}/no-peers")).await.unwrap_err();
        match err {
            BootstrapError::InvalidDirectoryResponse { missing, .. } => assert_eq!(missing, "peers"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
