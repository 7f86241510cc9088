pub mod attribution;
pub mod config;
pub mod init;
pub mod launch;
pub mod reset;
pub mod state;

use anyhow::Context;
use launchgate_core::{paths, store::DefaultsStore};
use std::path::Path;

/// Open the defaults store, failing if the root was never initialized.
pub(crate) fn open_store(root: &Path) -> anyhow::Result<DefaultsStore> {
    if !paths::gate_dir(root).is_dir() {
        return Err(launchgate_core::GateError::NotInitialized.into());
    }
    let path = paths::defaults_path(root);
    DefaultsStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}
