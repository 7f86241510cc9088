//! Network reachability as a watchable state.
//!
//! [`ConnectivityMonitor`] holds the latest known state and fans changes out
//! over a `tokio::sync::watch` channel. It starts out unknown (`None`); the
//! orchestrator treats unknown as connected. [`ReachabilityProbe`] is the
//! default producer: it dials a TCP endpoint on an interval and reports the
//! result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Connected => write!(f, "connected"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectivityMonitor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Option<ConnectivityState>>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record a path update. Subscribers are woken only when the state
    /// actually changes.
    pub fn report(&self, state: ConnectivityState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == Some(state) {
                false
            } else {
                *current = Some(state);
                true
            }
        });
        if changed {
            info!(%state, "connectivity changed");
        }
    }

    pub fn state(&self) -> Option<ConnectivityState> {
        *self.tx.borrow()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == Some(ConnectivityState::Disconnected)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ConnectivityState>> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// ReachabilityProbe
// ---------------------------------------------------------------------------

/// Periodic TCP connect check against a single host.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    host: String,
    port: u16,
    interval: Duration,
    connect_timeout: Duration,
}

impl ReachabilityProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(1500),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// One connect attempt. Any failure, including a timeout, is disconnected.
    pub async fn check(&self) -> ConnectivityState {
        let addr = (self.host.as_str(), self.port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => ConnectivityState::Connected,
            Ok(Err(e)) => {
                debug!(host = %self.host, port = self.port, error = %e, "probe connect failed");
                ConnectivityState::Disconnected
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "probe connect timed out");
                ConnectivityState::Disconnected
            }
        }
    }

    /// Probe forever, reporting each result to `monitor`. Abort the returned
    /// handle to stop.
    pub fn spawn(self, monitor: ConnectivityMonitor) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.report(self.check().await);
            }
        })
    }
}
