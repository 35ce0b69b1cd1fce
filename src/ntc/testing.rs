//! Fake ntc-cli scripts for tests

use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script named `ntc-cli` into `dir`
pub(crate) fn write_fake_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ntc-cli");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
