//! The remote surface: an embedded browser pointed at the fetched URL.
//!
//! [`BrowserSurface`] is the platform contract. [`RemoteSurfaceController`]
//! restores cookies, starts the load, marks the surface visible on the first
//! 200, and captures cookies after each completed load. [`HeadlessSurface`]
//! is a reqwest-backed implementation for hosts without a real browser.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{COOKIE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cookies::{CookieJar, SessionCookieBridge, StoredCookie};
use crate::error::{GateError, Result};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// A navigation response arrived.
    Response { status: u16, url: Url },
    /// The page finished loading.
    Completed,
    Failed(String),
}

#[async_trait]
pub trait BrowserSurface: Send + Sync {
    /// Load `url`, reporting progress on `events`. Returns when the load
    /// has finished or failed.
    async fn start_load(&self, url: Url, events: mpsc::Sender<SurfaceEvent>);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SurfaceReport {
    pub visible: bool,
    pub statuses: Vec<u16>,
    pub restored_cookies: usize,
    pub captured_cookies: usize,
    pub failure: Option<String>,
}

// ---------------------------------------------------------------------------
// RemoteSurfaceController
// ---------------------------------------------------------------------------

pub struct RemoteSurfaceController {
    url: Url,
    bridge: SessionCookieBridge,
    report: SurfaceReport,
}

impl RemoteSurfaceController {
    pub fn new(url: &str, bridge: SessionCookieBridge) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| GateError::InvalidEndpoint(url.to_string()))?;
        Ok(Self {
            url,
            bridge,
            report: SurfaceReport::default(),
        })
    }

    pub fn handle(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::Response { status, url } => {
                self.report.statuses.push(status);
                match status {
                    200 => {
                        if !self.report.visible {
                            info!(%url, "remote surface visible");
                        }
                        self.report.visible = true;
                    }
                    300..=399 => debug!(status, %url, "remote surface redirect"),
                    s if s >= 400 => warn!(status, %url, "remote surface error response"),
                    _ => debug!(status, %url, "remote surface response"),
                }
            }
            SurfaceEvent::Completed => {
                self.report.captured_cookies = self.bridge.capture();
            }
            SurfaceEvent::Failed(reason) => {
                warn!(%reason, url = %self.url, "remote surface load failed");
                self.report.failure = Some(reason);
            }
        }
    }

    /// Restore cookies, then drive one load to completion.
    pub async fn run(mut self, surface: &dyn BrowserSurface) -> SurfaceReport {
        self.report.restored_cookies = self.bridge.restore();
        let (tx, mut rx) = mpsc::channel(16);
        let load = surface.start_load(self.url.clone(), tx);
        let consume = async {
            while let Some(event) = rx.recv().await {
                self.handle(event);
            }
        };
        tokio::join!(load, consume);
        self.report
    }
}

// ---------------------------------------------------------------------------
// HeadlessSurface
// ---------------------------------------------------------------------------

/// Follows redirects by hand so every hop shows up as a response event and
/// every hop's cookies land in the jar.
pub struct HeadlessSurface {
    client: Client,
    jar: Arc<dyn CookieJar>,
}

impl HeadlessSurface {
    pub fn new(jar: Arc<dyn CookieJar>) -> Result<Self> {
        let client = Client::builder().redirect(Policy::none()).build()?;
        Ok(Self { client, jar })
    }

    async fn load(
        &self,
        mut url: Url,
        events: &mpsc::Sender<SurfaceEvent>,
    ) -> std::result::Result<(), String> {
        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.client.get(url.clone());
            if let Some(header) = self.jar.header_for(&url) {
                req = req.header(COOKIE, header);
            }
            let resp = req.send().await.map_err(|e| e.to_string())?;
            for cookie in resp.cookies() {
                self.jar.set_cookie(StoredCookie::from_response(&cookie, &url));
            }

            let status = resp.status();
            let _ = events
                .send(SurfaceEvent::Response {
                    status: status.as_u16(),
                    url: url.clone(),
                })
                .await;

            if follows_location(status) {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| format!("HTTP {} without Location", status.as_u16()))?;
                url = url
                    .join(location)
                    .map_err(|e| format!("bad redirect '{location}': {e}"))?;
                continue;
            }

            resp.bytes().await.map_err(|e| e.to_string())?;
            return Ok(());
        }
        Err(format!("more than {MAX_REDIRECTS} redirects"))
    }
}

/// Statuses that carry a `Location` to follow. 304 and 300 do not.
fn follows_location(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

#[async_trait]
impl BrowserSurface for HeadlessSurface {
    async fn start_load(&self, url: Url, events: mpsc::Sender<SurfaceEvent>) {
        let event = match self.load(url, &events).await {
            Ok(()) => SurfaceEvent::Completed,
            Err(reason) => SurfaceEvent::Failed(reason),
        };
        let _ = events.send(event).await;
    }
}
