use crate::cmd::open_store;
use crate::output::{describe, print_json};
use anyhow::Context;
use clap::{Args, ValueEnum};
use launchgate_core::{
    attribution::AttributionStore,
    clock::{Clock, SystemClock},
    config::Config,
    connectivity::{ConnectivityMonitor, ConnectivityState, ReachabilityProbe},
    cookies::{MemoryCookieJar, SessionCookieBridge},
    fetcher::{ConfigFetcher, FetchState},
    orchestrator::{BootstrapOrchestrator, OrchestratorSettings, Presentation, Services},
    permission::{
        NotificationAuthState, PermissionNegotiator, PermissionOutcome, ScriptedNotificationCenter,
    },
    store::DefaultsStore,
    surface::{HeadlessSurface, RemoteSurfaceController, SurfaceReport},
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Respond {
    Grant,
    Decline,
    Dismiss,
}

#[derive(Args)]
pub struct LaunchArgs {
    /// Notification authorization state the platform reports
    #[arg(long, default_value = "not_determined")]
    auth: NotificationAuthState,

    /// How the user answers the permission prompt, if one is shown
    #[arg(long, value_enum, default_value_t = Respond::Dismiss)]
    respond: Respond,

    /// Start with connectivity lost and no reachability probe
    #[arg(long)]
    offline: bool,

    /// Skip loading the remote surface after a remote decision
    #[arg(long)]
    no_surface: bool,

    /// Seconds to wait for a terminal decision before giving up
    #[arg(long, default_value = "30")]
    wait: u64,
}

#[derive(Serialize)]
struct LaunchReport {
    launch_id: String,
    presentations: Vec<Presentation>,
    outcome: Presentation,
    decided: bool,
    prompt: Option<PermissionOutcome>,
    surface: Option<SurfaceReport>,
}

pub fn run(root: &Path, args: LaunchArgs, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    for w in config.validate() {
        warn!(level = ?w.level, "{}", w.message);
    }
    let store = open_store(root)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(simulate(&config, store, &args))?;

    if json {
        return print_json(&report);
    }

    println!("launch {}", report.launch_id);
    for p in &report.presentations {
        println!("  -> {}", describe(p));
    }
    if let Some(outcome) = report.prompt {
        println!("prompt: {outcome}");
    }
    if !report.decided {
        println!("undecided: {}", describe(&report.outcome));
    }
    if let Some(surface) = &report.surface {
        let status = surface
            .statuses
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        println!(
            "surface: {} [{}], cookies restored {}, captured {}",
            if surface.visible { "visible" } else { "not visible" },
            status,
            surface.restored_cookies,
            surface.captured_cookies
        );
        if let Some(failure) = &surface.failure {
            println!("surface failure: {failure}");
        }
    }
    Ok(())
}

async fn simulate(
    config: &Config,
    store: DefaultsStore,
    args: &LaunchArgs,
) -> anyhow::Result<LaunchReport> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let attribution = AttributionStore::new(store.clone());

    let connectivity = ConnectivityMonitor::new();
    let probe = if args.offline {
        connectivity.report(ConnectivityState::Disconnected);
        None
    } else {
        let (host, port) = config.probe_target()?;
        Some(
            ReachabilityProbe::new(host, port)
                .with_interval(config.probe_interval())
                .with_connect_timeout(config.probe_connect_timeout())
                .spawn(connectivity.clone()),
        )
    };

    let center = Arc::new(ScriptedNotificationCenter::new(
        args.auth,
        args.respond == Respond::Grant,
    ));
    let permissions = Arc::new(PermissionNegotiator::new(
        center,
        store.clone(),
        clock.clone(),
        config.permission_cooldown(),
    ));
    let fetcher = Arc::new(ConfigFetcher::new(
        config.endpoint_url()?,
        attribution.clone(),
        clock.clone(),
        config.request_timeout(),
    )?);

    let handle = BootstrapOrchestrator::spawn(
        Services {
            connectivity,
            permissions,
            attribution,
            fetcher: fetcher.clone(),
            clock,
        },
        OrchestratorSettings::from(config),
    );
    // The attribution SDK has already persisted whatever it is going to. A
    // usable cache can decide the launch before this signal lands.
    if let Err(e) = handle.attribution_ready() {
        debug!(error = %e, "attribution signal not delivered");
    }

    let mut presentations: Vec<Presentation> = Vec::new();
    let mut prompt = None;
    let mut rx = handle.subscribe();
    let watch_launch = async {
        loop {
            let current = rx.borrow_and_update().clone();
            if presentations.last() != Some(&current) {
                presentations.push(current.clone());
            }
            match &current {
                p if p.is_terminal() => return Ok::<_, anyhow::Error>(current.clone()),
                Presentation::NoConnectivity if args.offline => return Ok(current.clone()),
                Presentation::PermissionPrompt { .. } if prompt.is_none() => {
                    let outcome = handle.answer_prompt(args.respond != Respond::Dismiss).await?;
                    info!(%outcome, "permission prompt answered");
                    prompt = Some(outcome);
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Ok(handle.presentation());
            }
        }
    };
    let outcome = match tokio::time::timeout(Duration::from_secs(args.wait), watch_launch).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(wait_secs = args.wait, "no terminal decision in time");
            handle.presentation()
        }
    };

    // A fetch that lost the race against the fallback still persists its result.
    if fetcher.state() == FetchState::Fetching {
        info!("waiting for in-flight config fetch");
        if tokio::time::timeout(config.request_timeout(), fetcher.settled())
            .await
            .is_err()
        {
            warn!("config fetch still in flight at exit");
        }
    }

    let surface = match &outcome {
        Presentation::RemoteSurface { url } if !args.no_surface => {
            let jar = Arc::new(MemoryCookieJar::new());
            let bridge = SessionCookieBridge::new(store.clone(), jar.clone());
            let browser = HeadlessSurface::new(jar)?;
            Some(RemoteSurfaceController::new(url, bridge)?.run(&browser).await)
        }
        _ => None,
    };

    if let Some(probe) = probe {
        probe.abort();
    }

    Ok(LaunchReport {
        launch_id: handle.launch_id().to_string(),
        decided: outcome.is_terminal(),
        presentations,
        outcome,
        prompt,
        surface,
    })
}
