use launchgate_core::orchestrator::{Presentation, PromptVariant};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Two-column `key  value` listing with aligned values.
pub fn print_fields(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("{:width$}  {}", key, value, width = width);
    }
}

pub fn describe(presentation: &Presentation) -> String {
    match presentation {
        Presentation::Loading => "loading".to_string(),
        Presentation::PermissionPrompt { variant } => match variant {
            PromptVariant::Organic => "permission prompt (organic)".to_string(),
            PromptVariant::Attributed => "permission prompt (attributed)".to_string(),
        },
        Presentation::NoConnectivity => "no connectivity".to_string(),
        Presentation::NativeApp => "native app".to_string(),
        Presentation::RemoteSurface { url } => format!("remote surface: {url}"),
    }
}
