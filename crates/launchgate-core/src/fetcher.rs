//! One-shot remote-config fetch with permanent lockout on failure.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::attribution::{AttributionStore, RemoteConfig};
use crate::clock::{from_epoch_seconds, Clock};
use crate::error::{GateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    Fetching,
    Succeeded,
    FailedLocked,
}

/// Why a fetch ended in lockout.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("a previous fetch failed; no further requests are made")]
    LockedOut,

    #[error("no attribution payload has been persisted")]
    MissingAttribution,

    #[error("persisted attribution payload is not a JSON object: {0}")]
    MalformedAttribution(String),

    #[error("failed to serialize attribution payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    #[error("malformed config response: {0}")]
    MalformedResponse(String),

    #[error("config rejected: {0}")]
    Rejected(String),

    #[error("defaults store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Succeeded(RemoteConfig),
    Locked { reason: String },
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    expires: Option<f64>,
}

pub struct ConfigFetcher {
    client: Client,
    endpoint: Url,
    attribution: AttributionStore,
    clock: Arc<dyn Clock>,
    state: watch::Sender<FetchState>,
}

impl ConfigFetcher {
    pub fn new(
        endpoint: Url,
        attribution: AttributionStore,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(GateError::Http)?;
        Ok(Self {
            client,
            endpoint,
            attribution,
            clock,
            state: watch::Sender::new(FetchState::Idle),
        })
    }

    pub fn state(&self) -> FetchState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.state.subscribe()
    }

    /// Wait until no request is in flight.
    pub async fn settled(&self) -> FetchState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| *state != FetchState::Fetching).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    fn set_state(&self, state: FetchState) {
        self.state.send_replace(state);
    }

    /// Run the fetch. Never fails: every error path persists the lockout and
    /// comes back as [`FetchOutcome::Locked`].
    pub async fn fetch(&self) -> FetchOutcome {
        self.set_state(FetchState::Fetching);
        match self.try_fetch().await {
            Ok(config) => {
                self.set_state(FetchState::Succeeded);
                info!(url = %config.url, expires_at = %config.expires_at, "remote config fetched");
                FetchOutcome::Succeeded(config)
            }
            Err(e) => {
                if !matches!(e, FetchError::LockedOut) {
                    if let Err(store_err) = self.attribution.lock_out() {
                        warn!(error = %store_err, "failed to persist config lockout");
                    }
                }
                self.set_state(FetchState::FailedLocked);
                warn!(reason = %e, "config fetch locked out");
                FetchOutcome::Locked {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_fetch(&self) -> std::result::Result<RemoteConfig, FetchError> {
        if self.attribution.no_retry().map_err(store_err)? {
            return Err(FetchError::LockedOut);
        }
        let payload = match self.attribution.payload() {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(FetchError::MissingAttribution),
            Err(GateError::Json(e)) => return Err(FetchError::MalformedAttribution(e.to_string())),
            Err(e) => return Err(store_err(e)),
        };
        if payload.is_empty() {
            warn!("attribution payload has no fields; sending an empty object");
        }
        let body = payload.to_request_body()?;

        info!(endpoint = %self.endpoint, fields = payload.len(), "requesting remote config");
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        let parsed: ConfigResponse = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
        let config = self.validate(parsed)?;

        self.attribution
            .save_remote_config(&config)
            .map_err(store_err)?;
        Ok(config)
    }

    fn validate(&self, resp: ConfigResponse) -> std::result::Result<RemoteConfig, FetchError> {
        if !resp.ok {
            return Err(FetchError::Rejected("ok is false".into()));
        }
        let url = resp
            .url
            .ok_or_else(|| FetchError::Rejected("missing url".into()))?;
        Url::parse(&url).map_err(|e| FetchError::Rejected(format!("url '{url}': {e}")))?;
        let expires = resp
            .expires
            .ok_or_else(|| FetchError::Rejected("missing expires".into()))?;
        let expires_at = from_epoch_seconds(expires)
            .ok_or_else(|| FetchError::Rejected(format!("expires {expires} out of range")))?;
        Ok(RemoteConfig {
            url,
            expires_at,
            fetched_at: self.clock.now(),
        })
    }
}

fn store_err(e: GateError) -> FetchError {
    FetchError::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{keys, DefaultsStore};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        attribution: AttributionStore,
        store: DefaultsStore,
        clock: ManualClock,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = DefaultsStore::open(&dir.path().join("defaults.redb")).unwrap();
        Fixture {
            attribution: AttributionStore::new(store.clone()),
            store,
            clock: ManualClock::new(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()),
            _dir: dir,
        }
    }

    fn fetcher(f: &Fixture, endpoint: &str) -> ConfigFetcher {
        ConfigFetcher::new(
            Url::parse(endpoint).unwrap(),
            f.attribution.clone(),
            Arc::new(f.clock.clone()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn with_payload(f: &Fixture, raw: &[u8]) {
        f.store.set_raw(keys::CONVERSION_DATA, raw).unwrap();
    }

    #[tokio::test]
    async fn success_persists_config_and_clears_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::Json(json!({"aff_id": "123", "campaign": null})))
            .with_status(200)
            .with_body(r#"{"ok":true,"url":"https://example.com/x","expires":1700003600}"#)
            .create_async()
            .await;

        let f = fixture();
        with_payload(&f, br#"{"aff_id":"123","campaign":null}"#);
        let fetcher = fetcher(&f, &format!("{}/config", server.url()));

        let outcome = fetcher.fetch().await;
        mock.assert_async().await;

        let FetchOutcome::Succeeded(config) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(config.url, "https://example.com/x");
        assert_eq!(config.expires_at.timestamp(), 1_700_003_600);
        assert_eq!(config.fetched_at, f.clock.now());
        assert_eq!(fetcher.state(), FetchState::Succeeded);
        assert_eq!(f.attribution.remote_config().unwrap(), Some(config));
        assert!(!f.attribution.no_retry().unwrap());
    }

    #[tokio::test]
    async fn subscribers_see_the_fetch_settle() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/config")
            .with_status(200)
            .with_body(r#"{"ok":true,"url":"https://example.com/x","expires":1700003600}"#)
            .create_async()
            .await;

        let f = fixture();
        with_payload(&f, br#"{"aff_id":"123"}"#);
        let fetcher = Arc::new(fetcher(&f, &format!("{}/config", server.url())));
        assert_eq!(fetcher.settled().await, FetchState::Idle);

        let mut rx = fetcher.subscribe();
        let task = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch().await }
        });
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|state| *state == FetchState::Succeeded),
        )
        .await
        .expect("fetch did not settle")
        .unwrap();
        assert_eq!(fetcher.settled().await, FetchState::Succeeded);
        assert!(matches!(task.await.unwrap(), FetchOutcome::Succeeded(_)));
    }

    #[tokio::test]
    async fn server_error_locks_out() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .with_status(500)
            .create_async()
            .await;

        let f = fixture();
        with_payload(&f, br#"{"aff_id":"123"}"#);
        let fetcher = fetcher(&f, &format!("{}/config", server.url()));

        assert!(matches!(fetcher.fetch().await, FetchOutcome::Locked { .. }));
        mock.assert_async().await;
        assert_eq!(fetcher.state(), FetchState::FailedLocked);
        assert!(f.attribution.no_retry().unwrap());
    }

    #[tokio::test]
    async fn locked_out_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .expect(0)
            .create_async()
            .await;

        let f = fixture();
        with_payload(&f, br#"{"aff_id":"123"}"#);
        f.attribution.lock_out().unwrap();

        let outcome = fetcher(&f, &format!("{}/config", server.url())).fetch().await;
        assert!(matches!(outcome, FetchOutcome::Locked { .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_payload_locks_without_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .expect(0)
            .create_async()
            .await;

        let f = fixture();
        let outcome = fetcher(&f, &format!("{}/config", server.url())).fetch().await;

        assert!(matches!(outcome, FetchOutcome::Locked { .. }));
        assert!(f.attribution.no_retry().unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_payload_locks_without_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .expect(0)
            .create_async()
            .await;

        let f = fixture();
        with_payload(&f, b"[\"not\",\"an\",\"object\"]");
        let outcome = fetcher(&f, &format!("{}/config", server.url())).fetch().await;

        assert!(matches!(outcome, FetchOutcome::Locked { .. }));
        assert!(f.attribution.no_retry().unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_and_malformed_bodies_lock_out() {
        for body in [
            r#"{"ok":false,"url":"https://example.com","expires":1700003600}"#,
            r#"{"ok":true,"expires":1700003600}"#,
            r#"{"ok":true,"url":"https://example.com"}"#,
            r#"{"ok":true,"url":"not a url","expires":1700003600}"#,
            r#"{"ok":"yes"}"#,
            "<html>",
        ] {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/config")
                .with_status(200)
                .with_body(body)
                .create_async()
                .await;

            let f = fixture();
            with_payload(&f, br#"{"aff_id":"123"}"#);
            let outcome = fetcher(&f, &format!("{}/config", server.url())).fetch().await;

            assert!(
                matches!(outcome, FetchOutcome::Locked { .. }),
                "body {body} should lock out"
            );
            assert!(f.attribution.no_retry().unwrap());
            assert_eq!(f.attribution.remote_config().unwrap(), None);
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_locks_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let f = fixture();
        with_payload(&f, br#"{"aff_id":"123"}"#);
        let outcome = fetcher(&f, &format!("http://127.0.0.1:{port}/config"))
            .fetch()
            .await;

        assert!(matches!(outcome, FetchOutcome::Locked { .. }));
        assert!(f.attribution.no_retry().unwrap());
    }
}
