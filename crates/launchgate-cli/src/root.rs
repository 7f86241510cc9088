use launchgate_core::paths::GATE_DIR;
use std::path::{Path, PathBuf};

/// Resolve the app root directory.
///
/// Priority:
/// 1. `--root` flag / `LAUNCHGATE_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.launchgate/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_gate_root(&cwd).unwrap_or(cwd)
}

fn find_gate_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(GATE_DIR).is_dir())
        .map(Path::to_path_buf)
}
