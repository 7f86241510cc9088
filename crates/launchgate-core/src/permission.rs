//! Notification-permission policy.
//!
//! The OS side is abstracted behind [`NotificationCenter`]; the policy and the
//! denial cooldown live in [`PermissionNegotiator`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{GateError, Result};
use crate::store::{keys, DefaultsStore};

// ---------------------------------------------------------------------------
// NotificationAuthState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAuthState {
    NotDetermined,
    Denied,
    Authorized,
    Provisional,
    Ephemeral,
}

impl fmt::Display for NotificationAuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationAuthState::NotDetermined => "not_determined",
            NotificationAuthState::Denied => "denied",
            NotificationAuthState::Authorized => "authorized",
            NotificationAuthState::Provisional => "provisional",
            NotificationAuthState::Ephemeral => "ephemeral",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NotificationAuthState {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_determined" | "not-determined" => Ok(NotificationAuthState::NotDetermined),
            "denied" => Ok(NotificationAuthState::Denied),
            "authorized" => Ok(NotificationAuthState::Authorized),
            "provisional" => Ok(NotificationAuthState::Provisional),
            "ephemeral" => Ok(NotificationAuthState::Ephemeral),
            other => Err(GateError::InvalidAuthState(other.to_string())),
        }
    }
}

/// How the user left the permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Granted,
    Declined,
    Dismissed,
}

impl fmt::Display for PermissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionOutcome::Granted => write!(f, "granted"),
            PermissionOutcome::Declined => write!(f, "declined"),
            PermissionOutcome::Dismissed => write!(f, "dismissed"),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationCenter
// ---------------------------------------------------------------------------

/// The platform notification facility.
#[async_trait]
pub trait NotificationCenter: Send + Sync {
    async fn authorization_state(&self) -> NotificationAuthState;

    /// Show the OS permission dialog. Returns whether the user granted.
    async fn request_authorization(&self) -> bool;

    fn register_for_remote_notifications(&self);
}

/// A notification center with a fixed state and a pre-decided dialog answer.
pub struct ScriptedNotificationCenter {
    state: Mutex<NotificationAuthState>,
    grant: bool,
    dialogs: AtomicUsize,
    registered: AtomicBool,
}

impl ScriptedNotificationCenter {
    pub fn new(state: NotificationAuthState, grant: bool) -> Self {
        Self {
            state: Mutex::new(state),
            grant,
            dialogs: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
        }
    }

    /// Number of OS dialogs shown.
    pub fn dialogs_shown(&self) -> usize {
        self.dialogs.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationCenter for ScriptedNotificationCenter {
    async fn authorization_state(&self) -> NotificationAuthState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request_authorization(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // The OS never shows the dialog again once the user has denied.
        if *state == NotificationAuthState::Denied {
            return false;
        }
        self.dialogs.fetch_add(1, Ordering::SeqCst);
        *state = if self.grant {
            NotificationAuthState::Authorized
        } else {
            NotificationAuthState::Denied
        };
        self.grant
    }

    fn register_for_remote_notifications(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// PermissionNegotiator
// ---------------------------------------------------------------------------

/// True when the user never declined, or declined at least `cooldown` ago.
pub fn prompt_allowed(
    last_denied: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool {
    match last_denied {
        Some(denied_at) => now - denied_at >= cooldown,
        None => true,
    }
}

pub struct PermissionNegotiator {
    center: Arc<dyn NotificationCenter>,
    store: DefaultsStore,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    requested: AtomicBool,
}

impl PermissionNegotiator {
    pub fn new(
        center: Arc<dyn NotificationCenter>,
        store: DefaultsStore,
        clock: Arc<dyn Clock>,
        cooldown: Duration,
    ) -> Self {
        Self {
            center,
            store,
            clock,
            cooldown,
            requested: AtomicBool::new(false),
        }
    }

    pub async fn query_authorization(&self) -> NotificationAuthState {
        self.center.authorization_state().await
    }

    /// When the user last declined, if ever. An unreadable value counts as
    /// never.
    pub fn last_denied(&self) -> Option<DateTime<Utc>> {
        match self.store.get::<DateTime<Utc>>(keys::LAST_DENIED) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "unreadable last-denied timestamp");
                None
            }
        }
    }

    pub fn can_prompt_again(&self) -> bool {
        prompt_allowed(self.last_denied(), self.clock.now(), self.cooldown)
    }

    pub fn needs_prompt(&self, state: NotificationAuthState) -> bool {
        match state {
            NotificationAuthState::NotDetermined => true,
            NotificationAuthState::Denied => self.can_prompt_again(),
            NotificationAuthState::Authorized
            | NotificationAuthState::Provisional
            | NotificationAuthState::Ephemeral => false,
        }
    }

    /// Show the OS dialog. Allowed once per negotiator.
    pub async fn request_authorization(&self) -> Result<bool> {
        if self.requested.swap(true, Ordering::SeqCst) {
            return Err(GateError::PermissionAlreadyRequested);
        }
        let granted = self.center.request_authorization().await;
        if granted {
            info!("notification permission granted");
            self.center.register_for_remote_notifications();
        } else {
            info!("notification permission declined");
            if let Err(e) = self.record_denial() {
                warn!(error = %e, "failed to persist notification denial");
            }
        }
        Ok(granted)
    }

    /// The user skipped the rationale screen without reaching the OS dialog.
    pub fn record_skip(&self) -> Result<()> {
        info!("notification prompt skipped");
        self.record_denial()
    }

    /// Resolve the prompt screen. "Allow" shows the OS dialog unless the user
    /// already denied it, in which case the rationale screen can only lead to
    /// settings and counts as a decline. Every path yields an outcome.
    pub async fn answer_prompt(&self, allow: bool) -> PermissionOutcome {
        if !allow {
            if let Err(e) = self.record_skip() {
                warn!(error = %e, "failed to persist notification skip");
            }
            return PermissionOutcome::Dismissed;
        }
        if self.query_authorization().await == NotificationAuthState::Denied {
            info!("notification permission denied at the OS level; dialog not shown");
            if let Err(e) = self.record_denial() {
                warn!(error = %e, "failed to persist notification denial");
            }
            return PermissionOutcome::Declined;
        }
        match self.request_authorization().await {
            Ok(true) => PermissionOutcome::Granted,
            Ok(false) => PermissionOutcome::Declined,
            Err(e) => {
                warn!(error = %e, "notification dialog unavailable");
                PermissionOutcome::Declined
            }
        }
    }

    fn record_denial(&self) -> Result<()> {
        self.store.set(keys::LAST_DENIED, &self.clock.now())
    }
}
