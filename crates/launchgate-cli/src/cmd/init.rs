use anyhow::Context;
use launchgate_core::{config::Config, io, paths, store::DefaultsStore};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing launchgate in: {}", root.display());

    let gate_dir = paths::gate_dir(root);
    io::ensure_dir(&gate_dir)
        .with_context(|| format!("failed to create {}", gate_dir.display()))?;

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let defaults = paths::defaults_path(root);
    let existed = defaults.exists();
    DefaultsStore::open(&defaults)
        .with_context(|| format!("failed to open {}", defaults.display()))?;
    if existed {
        println!("  exists:  {}", paths::DEFAULTS_FILE);
    } else {
        println!("  created: {}", paths::DEFAULTS_FILE);
    }

    Ok(())
}
