use crate::cmd::open_store;
use crate::output::{print_fields, print_json};
use anyhow::Context;
use chrono::{DateTime, Utc};
use launchgate_core::{
    attribution::AttributionStore,
    config::Config,
    cookies::StoredCookie,
    permission::prompt_allowed,
    store::keys,
};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct RemoteConfigOutput {
    url: String,
    expires_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
    usable: bool,
}

#[derive(Serialize)]
struct StateOutput {
    endpoint: String,
    attribution_present: bool,
    attribution_fields: usize,
    organic: bool,
    remote_config: Option<RemoteConfigOutput>,
    no_retry: bool,
    last_denied_at: Option<DateTime<Utc>>,
    can_prompt_again: bool,
    cookies: usize,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = open_store(root)?;
    let attribution = AttributionStore::new(store.clone());
    let now = Utc::now();

    // A malformed payload is reported as present with zero usable fields.
    let payload_fields = match attribution.payload() {
        Ok(payload) => payload.map(|p| p.len()),
        Err(_) => Some(0),
    };
    let remote_config = attribution
        .remote_config()
        .context("failed to read cached remote config")?
        .map(|c| RemoteConfigOutput {
            usable: c.is_usable(now),
            url: c.url,
            expires_at: c.expires_at,
            fetched_at: c.fetched_at,
        });
    let last_denied_at: Option<DateTime<Utc>> = store.get(keys::LAST_DENIED).unwrap_or(None);
    let cookies = store
        .get::<Vec<StoredCookie>>(keys::SESSION_COOKIES)
        .unwrap_or(None)
        .map_or(0, |c| c.len());

    let out = StateOutput {
        endpoint: config.endpoint.clone(),
        attribution_present: payload_fields.is_some(),
        attribution_fields: payload_fields.unwrap_or(0),
        organic: attribution.is_organic(),
        remote_config,
        no_retry: attribution.no_retry().context("failed to read lockout flag")?,
        last_denied_at,
        can_prompt_again: prompt_allowed(last_denied_at, now, config.permission_cooldown()),
        cookies,
    };

    if json {
        return print_json(&out);
    }

    let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
    let attribution_line = if out.attribution_present {
        format!("present ({} fields)", out.attribution_fields)
    } else {
        "absent".to_string()
    };
    let remote_line = match &out.remote_config {
        Some(c) => format!(
            "{} (expires {}, {})",
            c.url,
            c.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if c.usable { "usable" } else { "expired" }
        ),
        None => "none".to_string(),
    };
    let denied_line = out
        .last_denied_at
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());

    print_fields(&[
        ("endpoint", out.endpoint.clone()),
        ("attribution", attribution_line),
        ("organic", yes_no(out.organic)),
        ("remote config", remote_line),
        ("fetch locked out", yes_no(out.no_retry)),
        ("last denied", denied_line),
        ("can prompt again", yes_no(out.can_prompt_again)),
        ("session cookies", out.cookies.to_string()),
    ]);
    Ok(())
}
