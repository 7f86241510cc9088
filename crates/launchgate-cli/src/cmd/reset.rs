use crate::cmd::open_store;
use crate::output::print_json;
use anyhow::Context;
use launchgate_core::attribution::AttributionStore;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let attribution = AttributionStore::new(open_store(root)?);
    let had_config = attribution.remote_config().unwrap_or(None).is_some();
    let was_locked = attribution.no_retry().unwrap_or(false);

    attribution
        .reset_config()
        .context("failed to reset remote config")?;

    if json {
        print_json(&serde_json::json!({
            "cleared_config": had_config,
            "cleared_lockout": was_locked,
        }))?;
    } else {
        println!("Remote config reset. The next launch fetches again.");
    }
    Ok(())
}
