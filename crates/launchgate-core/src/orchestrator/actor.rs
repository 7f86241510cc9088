use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::machine::{
    decide_config_gate, BootstrapMachine, Effect, Event, GateDecision, GateSnapshot, Presentation,
    PromptVariant,
};
use crate::attribution::AttributionStore;
use crate::clock::Clock;
use crate::config::{Config, StaleConfigPolicy};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{GateError, Result};
use crate::fetcher::ConfigFetcher;
use crate::permission::{PermissionNegotiator, PermissionOutcome};

/// Everything the orchestrator talks to. Constructed by the host.
#[derive(Clone)]
pub struct Services {
    pub connectivity: ConnectivityMonitor,
    pub permissions: Arc<PermissionNegotiator>,
    pub attribution: AttributionStore,
    pub fetcher: Arc<ConfigFetcher>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub fallback_timeout: Duration,
    pub attribution_wait: Duration,
    pub stale_config: StaleConfigPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            fallback_timeout: config.fallback_timeout(),
            attribution_wait: config.attribution_wait(),
            stale_config: config.stale_config,
        }
    }
}

// ---------------------------------------------------------------------------
// BootstrapOrchestrator
// ---------------------------------------------------------------------------

/// Single task that owns the [`BootstrapMachine`] and performs its effects.
pub struct BootstrapOrchestrator {
    services: Services,
    settings: OrchestratorSettings,
    machine: BootstrapMachine,
    events: mpsc::UnboundedSender<Event>,
    presentation: watch::Sender<Presentation>,
}

impl BootstrapOrchestrator {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(services: Services, settings: OrchestratorSettings) -> OrchestratorHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (presentation_tx, presentation_rx) = watch::channel(Presentation::Loading);
        let launch_id = Uuid::new_v4();

        let handle = OrchestratorHandle {
            events: events_tx.clone(),
            presentation: presentation_rx,
            permissions: services.permissions.clone(),
            launch_id,
        };
        let actor = Self {
            services,
            settings,
            machine: BootstrapMachine::new(),
            events: events_tx,
            presentation: presentation_tx,
        };
        tokio::spawn(
            actor
                .run(events_rx)
                .instrument(info_span!("launch", id = %launch_id)),
        );
        handle
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut connectivity = self.services.connectivity.subscribe();
        let initial = *connectivity.borrow_and_update();

        let usable_cache = self.usable_cache();
        self.apply(Event::Started { usable_cache });
        if let Some(state) = initial {
            self.apply(Event::Connectivity(state));
        }

        let mut connectivity_open = true;
        while !self.machine.is_terminal() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                changed = connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        let state = *connectivity.borrow_and_update();
                        if let Some(state) = state {
                            self.apply(Event::Connectivity(state));
                        }
                    }
                    Err(_) => connectivity_open = false,
                },
            }
        }
        info!(presentation = ?self.machine.presentation(), "launch decided");
    }

    /// Feed one event through the machine, running effects until quiescent.
    fn apply(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(effect) {
                    queue.push_back(follow_up);
                }
            }
        }
        self.publish();
    }

    /// Run an effect. Synchronous effects return their result event directly;
    /// async ones report back through the event channel.
    fn execute(&self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::ArmAttributionTimer => {
                self.schedule(self.settings.attribution_wait, Event::AttributionWaitElapsed);
                None
            }
            Effect::ArmFallback => {
                self.schedule(self.settings.fallback_timeout, Event::FallbackElapsed);
                None
            }
            Effect::QueryAuthorization => {
                let permissions = self.services.permissions.clone();
                let attribution = self.services.attribution.clone();
                let events = self.events.clone();
                tokio::spawn(
                    async move {
                        let state = permissions.query_authorization().await;
                        let prompt = permissions.needs_prompt(state).then(|| {
                            if attribution.is_organic() {
                                PromptVariant::Organic
                            } else {
                                PromptVariant::Attributed
                            }
                        });
                        let _ = events.send(Event::Authorization { state, prompt });
                    }
                    .in_current_span(),
                );
                None
            }
            Effect::EvaluateConfigGate => Some(Event::ConfigGateEvaluated(self.evaluate_gate())),
            Effect::StartFetch => {
                let fetcher = self.services.fetcher.clone();
                let events = self.events.clone();
                // Not tied to the actor: a late result still persists.
                tokio::spawn(
                    async move {
                        let outcome = fetcher.fetch().await;
                        let _ = events.send(Event::FetchFinished(outcome));
                    }
                    .in_current_span(),
                );
                None
            }
        }
    }

    fn schedule(&self, after: Duration, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
    }

    fn evaluate_gate(&self) -> GateDecision {
        match self.gate_snapshot() {
            Ok(snapshot) => {
                decide_config_gate(&snapshot, self.settings.stale_config, self.services.clock.now())
            }
            Err(e) => {
                warn!(error = %e, "cannot read gating state");
                GateDecision::Native {
                    reason: "gating state unreadable",
                }
            }
        }
    }

    fn gate_snapshot(&self) -> Result<GateSnapshot> {
        let attribution = &self.services.attribution;
        Ok(GateSnapshot {
            no_retry: attribution.no_retry()?,
            payload_present: attribution.has_payload()?,
            cached: attribution.remote_config()?,
        })
    }

    fn usable_cache(&self) -> Option<String> {
        match self.services.attribution.remote_config() {
            Ok(Some(config)) if config.is_usable(self.services.clock.now()) => Some(config.url),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "cannot read cached remote config");
                None
            }
        }
    }

    fn publish(&self) {
        let next = self.machine.presentation();
        self.presentation.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = ?current, to = ?next, phase = ?self.machine.phase(), "presentation changed");
            *current = next.clone();
            true
        });
    }
}

// ---------------------------------------------------------------------------
// OrchestratorHandle
// ---------------------------------------------------------------------------

/// Host-side entry points: inbound signals and the presentation feed.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<Event>,
    presentation: watch::Receiver<Presentation>,
    permissions: Arc<PermissionNegotiator>,
    launch_id: Uuid,
}

impl OrchestratorHandle {
    pub fn launch_id(&self) -> Uuid {
        self.launch_id
    }

    /// The attribution SDK finished writing its payload. Repeats are no-ops;
    /// once the launch is decided this returns `OrchestratorStopped`.
    pub fn attribution_ready(&self) -> Result<()> {
        self.send(Event::AttributionReady)
    }

    /// Resolve the permission prompt with whatever the user did.
    pub fn permission_result(&self, outcome: PermissionOutcome) -> Result<()> {
        self.send(Event::PermissionResolved(outcome))
    }

    /// Handle the prompt's buttons: "allow" shows the OS dialog, anything
    /// else records a skip. Resolves the gate whatever the platform does.
    pub async fn answer_prompt(&self, allow: bool) -> Result<PermissionOutcome> {
        let outcome = self.permissions.answer_prompt(allow).await;
        self.permission_result(outcome)?;
        Ok(outcome)
    }

    pub fn presentation(&self) -> Presentation {
        self.presentation.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Presentation> {
        self.presentation.clone()
    }

    /// Wait for NativeApp or RemoteSurface.
    pub async fn wait_terminal(&self) -> Result<Presentation> {
        let mut rx = self.presentation.clone();
        let presentation = rx
            .wait_for(Presentation::is_terminal)
            .await
            .map_err(|_| GateError::OrchestratorStopped)?;
        Ok(presentation.clone())
    }

    fn send(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| GateError::OrchestratorStopped)
    }
}
