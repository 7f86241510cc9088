use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const GATE_DIR: &str = ".launchgate";
pub const CONFIG_FILE: &str = ".launchgate/config.yaml";
pub const DEFAULTS_FILE: &str = ".launchgate/defaults.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn gate_dir(root: &Path) -> PathBuf {
    root.join(GATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn defaults_path(root: &Path) -> PathBuf {
    root.join(DEFAULTS_FILE)
}
