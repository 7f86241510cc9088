//! The cold-start decision state machine.
//!
//! Pure and synchronous: it consumes [`Event`]s and returns the [`Effect`]s
//! the driver must carry out. All I/O (store reads, the permission query, the
//! network fetch, timers) happens in the actor; results come back as events.
//!
//! While connectivity is lost the machine keeps recording progress, but any
//! effect that would move the user forward is parked and replayed on
//! reconnect, and a native-app decision is held back so the no-connectivity
//! screen stays up. A usable cached remote config overrides the interruption.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::attribution::RemoteConfig;
use crate::config::StaleConfigPolicy;
use crate::connectivity::ConnectivityState;
use crate::fetcher::FetchOutcome;
use crate::permission::{NotificationAuthState, PermissionOutcome};

// ---------------------------------------------------------------------------
// Presentation
// ---------------------------------------------------------------------------

/// Which permission screen copy to show. Never affects the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    Organic,
    Attributed,
}

/// What the user currently sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Presentation {
    Loading,
    PermissionPrompt { variant: PromptVariant },
    NoConnectivity,
    NativeApp,
    RemoteSurface { url: String },
}

impl Presentation {
    /// Native app and remote surface are sticky once rendered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Presentation::NativeApp | Presentation::RemoteSurface { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    WaitingForAttribution,
    EvaluatingPermission,
    PermissionGate,
    ConfigGate,
    Decided,
}

// ---------------------------------------------------------------------------
// Config gate
// ---------------------------------------------------------------------------

/// Persisted state read when the permission gate resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSnapshot {
    pub no_retry: bool,
    pub payload_present: bool,
    pub cached: Option<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Native { reason: &'static str },
    Remote { url: String },
    /// Run the fetcher. It also handles the missing-payload lockout.
    Fetch,
}

pub fn decide_config_gate(
    snapshot: &GateSnapshot,
    policy: StaleConfigPolicy,
    now: DateTime<Utc>,
) -> GateDecision {
    if snapshot.no_retry {
        return GateDecision::Native {
            reason: "config fetch locked out",
        };
    }
    if !snapshot.payload_present {
        return GateDecision::Fetch;
    }
    match &snapshot.cached {
        Some(cached) if cached.is_usable(now) => GateDecision::Remote {
            url: cached.url.clone(),
        },
        Some(_) => match policy {
            StaleConfigPolicy::RequireReset => GateDecision::Native {
                reason: "cached config expired",
            },
            StaleConfigPolicy::Refetch => GateDecision::Fetch,
        },
        None => GateDecision::Fetch,
    }
}

// ---------------------------------------------------------------------------
// Events / effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The orchestrator came up. `usable_cache` is the cached remote URL if
    /// one was valid at launch.
    Started { usable_cache: Option<String> },
    AttributionReady,
    AttributionWaitElapsed,
    Connectivity(ConnectivityState),
    Authorization {
        state: NotificationAuthState,
        prompt: Option<PromptVariant>,
    },
    PermissionResolved(PermissionOutcome),
    ConfigGateEvaluated(GateDecision),
    FetchFinished(FetchOutcome),
    FallbackElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ArmAttributionTimer,
    QueryAuthorization,
    EvaluateConfigGate,
    StartFetch,
    ArmFallback,
}

// ---------------------------------------------------------------------------
// BootstrapMachine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BootstrapMachine {
    phase: Phase,
    offline: bool,
    prompt: Option<PromptVariant>,
    usable_cache: Option<String>,
    fetch_started: bool,
    parked: Vec<Effect>,
    pending: Option<Presentation>,
    terminal: Option<Presentation>,
}

impl Default for BootstrapMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Init,
            offline: false,
            prompt: None,
            usable_cache: None,
            fetch_started: false,
            parked: Vec::new(),
            pending: None,
            terminal: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn presentation(&self) -> Presentation {
        if let Some(terminal) = &self.terminal {
            return terminal.clone();
        }
        if self.offline {
            return Presentation::NoConnectivity;
        }
        match (self.phase, self.prompt) {
            (Phase::PermissionGate, Some(variant)) => Presentation::PermissionPrompt { variant },
            _ => Presentation::Loading,
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.terminal.is_some() {
            debug!(?event, "ignored after terminal presentation");
            return out;
        }
        match event {
            Event::Started { usable_cache } => {
                if self.phase != Phase::Init {
                    return out;
                }
                self.usable_cache = usable_cache;
                self.phase = Phase::WaitingForAttribution;
                out.push(Effect::ArmAttributionTimer);
            }
            Event::AttributionReady | Event::AttributionWaitElapsed => {
                if self.phase != Phase::WaitingForAttribution {
                    debug!(?event, phase = ?self.phase, "duplicate attribution signal");
                    return out;
                }
                self.phase = Phase::EvaluatingPermission;
                self.emit(Effect::QueryAuthorization, &mut out);
            }
            Event::Connectivity(ConnectivityState::Disconnected) => {
                if self.offline {
                    return out;
                }
                self.offline = true;
                if let Some(url) = self.usable_cache.clone() {
                    self.decide(Presentation::RemoteSurface { url });
                }
            }
            Event::Connectivity(ConnectivityState::Connected) => {
                if !self.offline {
                    return out;
                }
                self.offline = false;
                if let Some(pending) = self.pending.take() {
                    self.decide(pending);
                    return out;
                }
                out.append(&mut self.parked);
            }
            Event::Authorization { state, prompt } => {
                if self.phase != Phase::EvaluatingPermission {
                    return out;
                }
                debug!(%state, prompt = prompt.is_some(), "authorization evaluated");
                match prompt {
                    Some(variant) => {
                        self.prompt = Some(variant);
                        self.phase = Phase::PermissionGate;
                    }
                    None => {
                        self.phase = Phase::ConfigGate;
                        self.emit(Effect::EvaluateConfigGate, &mut out);
                    }
                }
            }
            Event::PermissionResolved(outcome) => {
                if self.phase != Phase::PermissionGate {
                    debug!(%outcome, phase = ?self.phase, "permission result outside the gate");
                    return out;
                }
                self.prompt = None;
                self.phase = Phase::ConfigGate;
                self.emit(Effect::EvaluateConfigGate, &mut out);
            }
            Event::ConfigGateEvaluated(decision) => {
                if self.phase != Phase::ConfigGate {
                    return out;
                }
                match decision {
                    GateDecision::Native { reason } => {
                        debug!(reason, "config gate chose native app");
                        self.decide(Presentation::NativeApp);
                    }
                    GateDecision::Remote { url } => {
                        self.decide(Presentation::RemoteSurface { url });
                    }
                    GateDecision::Fetch => {
                        if !self.fetch_started {
                            self.fetch_started = true;
                            self.emit(Effect::StartFetch, &mut out);
                            self.emit(Effect::ArmFallback, &mut out);
                        }
                    }
                }
            }
            Event::FetchFinished(outcome) => {
                if self.phase != Phase::ConfigGate {
                    return out;
                }
                match outcome {
                    FetchOutcome::Succeeded(config) => {
                        self.usable_cache = Some(config.url.clone());
                        self.decide(Presentation::RemoteSurface { url: config.url });
                    }
                    FetchOutcome::Locked { .. } => self.decide(Presentation::NativeApp),
                }
            }
            Event::FallbackElapsed => {
                if self.phase != Phase::ConfigGate || self.pending.is_some() {
                    return out;
                }
                debug!("fallback window elapsed without a fetch outcome");
                self.decide(Presentation::NativeApp);
            }
        }
        out
    }

    /// Queue `effect`, or park it until reconnect when offline.
    fn emit(&mut self, effect: Effect, out: &mut Vec<Effect>) {
        if self.offline {
            self.parked.push(effect);
        } else {
            out.push(effect);
        }
    }

    /// Render a terminal presentation. A native decision made while offline
    /// is held until reconnect, and a remote decision arriving meanwhile
    /// replaces it.
    fn decide(&mut self, presentation: Presentation) {
        if self.offline && presentation == Presentation::NativeApp {
            if self.pending.is_none() {
                self.pending = Some(presentation);
            }
            return;
        }
        self.pending = None;
        self.parked.clear();
        self.phase = Phase::Decided;
        self.terminal = Some(presentation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn cached(expires_in: i64) -> RemoteConfig {
        RemoteConfig {
            url: "https://example.com/x".into(),
            expires_at: now() + Duration::seconds(expires_in),
            fetched_at: now() - Duration::hours(1),
        }
    }

    fn remote() -> Presentation {
        Presentation::RemoteSurface {
            url: "https://example.com/x".into(),
        }
    }

    fn success() -> FetchOutcome {
        FetchOutcome::Succeeded(cached(3600))
    }

    fn locked() -> FetchOutcome {
        FetchOutcome::Locked {
            reason: "HTTP 500".into(),
        }
    }

    /// Drive a fresh machine up to the config gate with no prompt.
    fn at_config_gate() -> BootstrapMachine {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        m.handle(Event::AttributionReady);
        let effects = m.handle(Event::Authorization {
            state: NotificationAuthState::Authorized,
            prompt: None,
        });
        assert_eq!(effects, vec![Effect::EvaluateConfigGate]);
        m
    }

    // ---- config gate ------------------------------------------------------

    #[test]
    fn gate_locked_out_goes_native_even_with_cache() {
        let snap = GateSnapshot {
            no_retry: true,
            payload_present: true,
            cached: Some(cached(3600)),
        };
        assert!(matches!(
            decide_config_gate(&snap, StaleConfigPolicy::RequireReset, now()),
            GateDecision::Native { .. }
        ));
    }

    #[test]
    fn gate_missing_payload_goes_to_fetcher() {
        let snap = GateSnapshot {
            no_retry: false,
            payload_present: false,
            cached: Some(cached(3600)),
        };
        assert_eq!(
            decide_config_gate(&snap, StaleConfigPolicy::RequireReset, now()),
            GateDecision::Fetch
        );
    }

    #[test]
    fn gate_usable_cache_skips_fetch() {
        let snap = GateSnapshot {
            no_retry: false,
            payload_present: true,
            cached: Some(cached(1)),
        };
        assert_eq!(
            decide_config_gate(&snap, StaleConfigPolicy::RequireReset, now()),
            GateDecision::Remote {
                url: "https://example.com/x".into()
            }
        );
    }

    #[test]
    fn gate_stale_cache_follows_policy() {
        let snap = GateSnapshot {
            no_retry: false,
            payload_present: true,
            cached: Some(cached(0)),
        };
        assert!(matches!(
            decide_config_gate(&snap, StaleConfigPolicy::RequireReset, now()),
            GateDecision::Native { .. }
        ));
        assert_eq!(
            decide_config_gate(&snap, StaleConfigPolicy::Refetch, now()),
            GateDecision::Fetch
        );
    }

    #[test]
    fn gate_first_launch_fetches() {
        let snap = GateSnapshot {
            no_retry: false,
            payload_present: true,
            cached: None,
        };
        assert_eq!(
            decide_config_gate(&snap, StaleConfigPolicy::RequireReset, now()),
            GateDecision::Fetch
        );
    }

    // ---- happy paths ------------------------------------------------------

    #[test]
    fn start_arms_attribution_timer() {
        let mut m = BootstrapMachine::new();
        assert_eq!(m.presentation(), Presentation::Loading);
        assert_eq!(
            m.handle(Event::Started { usable_cache: None }),
            vec![Effect::ArmAttributionTimer]
        );
        assert_eq!(m.phase(), Phase::WaitingForAttribution);
    }

    #[test]
    fn fetch_success_shows_remote_surface() {
        let mut m = at_config_gate();
        let effects = m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        assert_eq!(effects, vec![Effect::StartFetch, Effect::ArmFallback]);
        assert_eq!(m.presentation(), Presentation::Loading);

        m.handle(Event::FetchFinished(success()));
        assert_eq!(m.presentation(), remote());
        assert_eq!(m.phase(), Phase::Decided);
    }

    #[test]
    fn fetch_lockout_shows_native() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        m.handle(Event::FetchFinished(locked()));
        assert_eq!(m.presentation(), Presentation::NativeApp);
    }

    #[test]
    fn fallback_before_outcome_shows_native_and_sticks() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        m.handle(Event::FallbackElapsed);
        assert_eq!(m.presentation(), Presentation::NativeApp);

        assert!(m.handle(Event::FetchFinished(success())).is_empty());
        assert_eq!(m.presentation(), Presentation::NativeApp);
    }

    #[test]
    fn native_gate_decision_is_terminal() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Native {
            reason: "config fetch locked out",
        }));
        assert!(m.is_terminal());
        assert_eq!(m.presentation(), Presentation::NativeApp);
    }

    // ---- attribution ------------------------------------------------------

    #[test]
    fn duplicate_attribution_signals_are_ignored() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        assert_eq!(
            m.handle(Event::AttributionReady),
            vec![Effect::QueryAuthorization]
        );
        assert!(m.handle(Event::AttributionReady).is_empty());
        assert!(m.handle(Event::AttributionWaitElapsed).is_empty());
    }

    #[test]
    fn attribution_wait_elapsing_acts_as_ready() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        assert_eq!(
            m.handle(Event::AttributionWaitElapsed),
            vec![Effect::QueryAuthorization]
        );
        assert!(m.handle(Event::AttributionReady).is_empty());
    }

    #[test]
    fn second_fetch_decision_does_not_refetch() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        assert!(m
            .handle(Event::ConfigGateEvaluated(GateDecision::Fetch))
            .is_empty());
    }

    // ---- permission gate --------------------------------------------------

    #[test]
    fn prompt_suspends_until_user_responds() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        m.handle(Event::AttributionReady);
        let effects = m.handle(Event::Authorization {
            state: NotificationAuthState::NotDetermined,
            prompt: Some(PromptVariant::Organic),
        });
        assert!(effects.is_empty());
        assert_eq!(
            m.presentation(),
            Presentation::PermissionPrompt {
                variant: PromptVariant::Organic
            }
        );

        for outcome in [PermissionOutcome::Dismissed, PermissionOutcome::Granted] {
            let effects = m.handle(Event::PermissionResolved(outcome));
            if outcome == PermissionOutcome::Dismissed {
                assert_eq!(effects, vec![Effect::EvaluateConfigGate]);
            } else {
                assert!(effects.is_empty(), "second resolution must be ignored");
            }
        }
        assert_eq!(m.phase(), Phase::ConfigGate);
        assert_eq!(m.presentation(), Presentation::Loading);
    }

    #[test]
    fn permission_result_before_gate_is_ignored() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        assert!(m
            .handle(Event::PermissionResolved(PermissionOutcome::Granted))
            .is_empty());
        assert_eq!(m.phase(), Phase::WaitingForAttribution);
    }

    // ---- connectivity -----------------------------------------------------

    #[test]
    fn offline_at_attribution_parks_until_reconnect() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        assert_eq!(m.presentation(), Presentation::NoConnectivity);

        assert!(m.handle(Event::AttributionReady).is_empty());
        assert_eq!(m.presentation(), Presentation::NoConnectivity);

        assert_eq!(
            m.handle(Event::Connectivity(ConnectivityState::Connected)),
            vec![Effect::QueryAuthorization]
        );
        assert_eq!(m.presentation(), Presentation::Loading);
    }

    #[test]
    fn offline_with_usable_cache_shows_remote() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started {
            usable_cache: Some("https://example.com/x".into()),
        });
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        assert_eq!(m.presentation(), remote());
        assert!(m.is_terminal());
    }

    #[test]
    fn prompt_reappears_after_reconnect() {
        let mut m = BootstrapMachine::new();
        m.handle(Event::Started { usable_cache: None });
        m.handle(Event::AttributionReady);
        m.handle(Event::Authorization {
            state: NotificationAuthState::Denied,
            prompt: Some(PromptVariant::Attributed),
        });
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        assert_eq!(m.presentation(), Presentation::NoConnectivity);

        m.handle(Event::Connectivity(ConnectivityState::Connected));
        assert_eq!(
            m.presentation(),
            Presentation::PermissionPrompt {
                variant: PromptVariant::Attributed
            }
        );
    }

    #[test]
    fn fetch_is_deferred_while_offline() {
        let mut m = at_config_gate();
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        assert!(m
            .handle(Event::ConfigGateEvaluated(GateDecision::Fetch))
            .is_empty());
        assert_eq!(
            m.handle(Event::Connectivity(ConnectivityState::Connected)),
            vec![Effect::StartFetch, Effect::ArmFallback]
        );
    }

    #[test]
    fn native_outcome_while_offline_waits_for_reconnect() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        m.handle(Event::FallbackElapsed);
        assert_eq!(m.presentation(), Presentation::NoConnectivity);
        assert!(!m.is_terminal());

        assert!(m
            .handle(Event::Connectivity(ConnectivityState::Connected))
            .is_empty());
        assert_eq!(m.presentation(), Presentation::NativeApp);
    }

    #[test]
    fn fetch_success_while_offline_shows_remote() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        m.handle(Event::FallbackElapsed);
        m.handle(Event::FetchFinished(success()));
        assert_eq!(m.presentation(), remote());
    }

    #[test]
    fn terminal_ignores_connectivity_loss() {
        let mut m = at_config_gate();
        m.handle(Event::ConfigGateEvaluated(GateDecision::Fetch));
        m.handle(Event::FetchFinished(locked()));
        m.handle(Event::Connectivity(ConnectivityState::Disconnected));
        assert_eq!(m.presentation(), Presentation::NativeApp);
        assert!(!m.is_offline());
    }

    #[test]
    fn presentation_serializes_with_kind_tag() {
        let json = serde_json::to_value(remote()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "remote_surface", "url": "https://example.com/x"})
        );
    }
}
