//! Session cookie persistence across launches.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{keys, DefaultsStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

fn default_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Build from a `Set-Cookie` received for `url`. Missing domain and path
    /// default to the request host and `/`.
    pub fn from_response(cookie: &reqwest::cookie::Cookie<'_>, url: &Url) -> Self {
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain: cookie
                .domain()
                .map(|d| d.trim_start_matches('.').to_string())
                .or_else(|| url.host_str().map(str::to_string))
                .unwrap_or_default(),
            path: cookie.path().map(str::to_string).unwrap_or_else(default_path),
            secure: cookie.secure(),
            http_only: cookie.http_only(),
            expires: cookie.expires().map(DateTime::<Utc>::from),
        }
    }

    /// Whether this cookie would be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let domain_ok = host == self.domain || host.ends_with(&format!(".{}", self.domain));
        let path_ok = url.path().starts_with(&self.path);
        let scheme_ok = !self.secure || url.scheme() == "https";
        domain_ok && path_ok && scheme_ok
    }

    fn same_identity(&self, other: &StoredCookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

// ---------------------------------------------------------------------------
// CookieJar
// ---------------------------------------------------------------------------

/// The cookie store shared with the embedded surface.
pub trait CookieJar: Send + Sync {
    fn cookies(&self) -> Vec<StoredCookie>;

    /// Insert, replacing any cookie with the same name, domain and path.
    fn set_cookie(&self, cookie: StoredCookie);

    /// `Cookie` request header value for `url`, if any cookie applies.
    fn header_for(&self, url: &Url) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies()
            .iter()
            .filter(|c| c.matches(url))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCookieJar {
    cookies: Arc<Mutex<Vec<StoredCookie>>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookies(&self) -> Vec<StoredCookie> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_cookie(&self, cookie: StoredCookie) {
        let mut cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        cookies.retain(|c| !c.same_identity(&cookie));
        cookies.push(cookie);
    }
}

// ---------------------------------------------------------------------------
// SessionCookieBridge
// ---------------------------------------------------------------------------

/// Moves cookies between the jar and the defaults store. Failures are logged
/// and count as zero cookies moved.
#[derive(Clone)]
pub struct SessionCookieBridge {
    store: DefaultsStore,
    jar: Arc<dyn CookieJar>,
}

impl SessionCookieBridge {
    pub fn new(store: DefaultsStore, jar: Arc<dyn CookieJar>) -> Self {
        Self { store, jar }
    }

    /// Install persisted cookies into the jar. Returns how many were installed.
    pub fn restore(&self) -> usize {
        let cookies = match self.store.get::<Vec<StoredCookie>>(keys::SESSION_COOKIES) {
            Ok(Some(cookies)) => cookies,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "failed to read persisted cookies");
                return 0;
            }
        };
        let count = cookies.len();
        for cookie in cookies {
            self.jar.set_cookie(cookie);
        }
        debug!(count, "restored session cookies");
        count
    }

    /// Persist the jar's current contents. Returns how many were persisted.
    pub fn capture(&self) -> usize {
        let cookies = self.jar.cookies();
        match self.store.set(keys::SESSION_COOKIES, &cookies) {
            Ok(()) => {
                debug!(count = cookies.len(), "captured session cookies");
                cookies.len()
            }
            Err(e) => {
                warn!(error = %e, "failed to persist cookies");
                0
            }
        }
    }
}
