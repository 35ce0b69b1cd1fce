//! Locating the ntc-cli executable.
//!
//! Lookup order:
//! 1. An explicit path (from `--tool` or `NTC_TOOL`)
//! 2. The SDK layout, `bin/<platform>/ntc-cli` under the SDK root
//! 3. Next to the harness executable
//! 4. System PATH

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(windows)]
pub const TOOL_BINARY: &str = "ntc-cli.exe";
#[cfg(not(windows))]
pub const TOOL_BINARY: &str = "ntc-cli";

#[cfg(windows)]
const PLATFORM_DIR: &str = "windows-x64";
#[cfg(not(windows))]
const PLATFORM_DIR: &str = "linux-x64";

/// Path of the tool inside an SDK checkout
pub fn sdk_tool_path(sdk_root: &Path) -> PathBuf {
    sdk_root.join("bin").join(PLATFORM_DIR).join(TOOL_BINARY)
}

/// Resolve the tool, checking the usual locations when no explicit path is given
pub fn find_tool(explicit: Option<&Path>, sdk_root: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("The specified tool file '{}' does not exist.", path.display());
    }

    let candidates = [
        sdk_root.map(sdk_tool_path),
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join(TOOL_BINARY))),
        which::which(TOOL_BINARY).ok(),
    ];

    for candidate in candidates.into_iter().flatten() {
        debug!("Checking for ntc-cli at {}", candidate.display());
        if candidate.is_file() {
            info!("Found ntc-cli at: {}", candidate.display());
            return Ok(candidate);
        }
    }

    bail!("ntc-cli not found. Pass --tool, set NTC_TOOL, or put {} on PATH.", TOOL_BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        let err = find_tool(Some(&missing), None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_sdk_layout_is_found() {
        let temp = TempDir::new().unwrap();
        let tool = sdk_tool_path(temp.path());
        std::fs::create_dir_all(tool.parent().unwrap()).unwrap();
        std::fs::write(&tool, b"").unwrap();

        let found = find_tool(None, Some(temp.path())).unwrap();
        assert_eq!(found, tool);
    }
}
