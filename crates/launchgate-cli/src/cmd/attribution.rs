use crate::cmd::open_store;
use crate::output::print_json;
use anyhow::{bail, Context};
use clap::Subcommand;
use launchgate_core::attribution::AttributionStore;
use serde_json::Value;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum AttributionSubcommand {
    /// Persist a conversion payload
    Set {
        /// JSON object, e.g. '{"aff_id":"123","campaign":null}'
        payload: String,
        /// Mark the install as organic
        #[arg(long)]
        organic: bool,
    },

    /// Remove the persisted payload and organic flag
    Clear,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: AttributionSubcommand, json: bool) -> anyhow::Result<()> {
    let attribution = AttributionStore::new(open_store(root)?);
    match subcmd {
        AttributionSubcommand::Set { payload, organic } => {
            set(&attribution, &payload, organic, json)
        }
        AttributionSubcommand::Clear => clear(&attribution, json),
    }
}

fn set(attribution: &AttributionStore, raw: &str, organic: bool, json: bool) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(raw).context("payload is not valid JSON")?;
    let Value::Object(fields) = value else {
        bail!("payload must be a JSON object");
    };
    attribution
        .save_payload(&fields, organic)
        .context("failed to persist attribution payload")?;

    if json {
        print_json(&serde_json::json!({
            "fields": fields.len(),
            "organic": organic,
        }))?;
    } else {
        println!(
            "Attribution payload saved ({} fields, {}).",
            fields.len(),
            if organic { "organic" } else { "attributed" }
        );
    }
    Ok(())
}

fn clear(attribution: &AttributionStore, json: bool) -> anyhow::Result<()> {
    attribution
        .clear_payload()
        .context("failed to clear attribution payload")?;
    if json {
        print_json(&serde_json::json!({ "cleared": true }))?;
    } else {
        println!("Attribution payload cleared.");
    }
    Ok(())
}
