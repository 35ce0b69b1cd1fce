//! Pre-built `.ntc` files used by the regression suite.
//!
//! One 4 bpp compression of the reference material per network version.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::dispatch::{process_concurrent_tasks, BatchOutcome};
use crate::ntc::{Arguments, RunResult};
use crate::paths::REFERENCE_MATERIAL;

pub const NETWORK_VERSIONS: [&str; 4] = ["small", "medium", "large", "xlarge"];

const FIXTURE_BPP: f32 = 4.0;

/// `<dest>/<Material>_4bpp_<version>.ntc`
pub fn fixture_path(dest: &Path, material: &str, network_version: &str) -> PathBuf {
    dest.join(format!("{}_4bpp_{}.ntc", material, network_version))
}

/// One compression task per network version
pub fn fixture_tasks(tool: &Path, source: &Path, dest: &Path) -> Vec<Arguments> {
    let material = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| REFERENCE_MATERIAL.to_string());

    NETWORK_VERSIONS
        .iter()
        .map(|&version| Arguments {
            load_images: Some(source.to_path_buf()),
            compress: true,
            bits_per_pixel: Some(FIXTURE_BPP),
            network_version: Some(version.to_string()),
            save_compressed: Some(fixture_path(dest, &material, version)),
            ..Arguments::new(tool)
        })
        .collect()
}

/// Build every fixture, printing `<path>: OK` as each one lands
pub async fn make_test_files(
    tool: &Path,
    source: &Path,
    dest: &Path,
    devices: &[u32],
) -> Result<BatchOutcome> {
    std::fs::create_dir_all(dest)?;
    let tasks = fixture_tasks(tool, source, dest);

    let mut ready = |task: &Arguments, _: &RunResult, _: usize, _: usize| -> Result<()> {
        if let Some(path) = &task.save_compressed {
            println!("{}: OK", path.display());
        }
        Ok(())
    };

    Ok(process_concurrent_tasks(tasks, devices, &mut ready).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fixture_tasks() {
        let tasks = fixture_tasks(
            Path::new("ntc-cli"),
            Path::new("/sdk/assets/materials/PavingStones070"),
            Path::new("/sdk/assets/testfiles"),
        );

        assert_eq!(tasks.len(), 4);
        assert_eq!(
            tasks[1].save_compressed,
            Some(PathBuf::from("/sdk/assets/testfiles/PavingStones070_4bpp_medium.ntc"))
        );
        assert_eq!(tasks[3].network_version.as_deref(), Some("xlarge"));
        assert!(tasks.iter().all(|t| t.compress && !t.decompress));
        assert!(tasks.iter().all(|t| t.bits_per_pixel == Some(4.0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_make_test_files() {
        use crate::ntc::testing::write_fake_tool;

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("PavingStones070");
        std::fs::create_dir_all(&source).unwrap();
        let dest = temp.path().join("testfiles");
        let tool = write_fake_tool(
            temp.path(),
            r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "--saveCompressed" ]; then echo ntc > "$2"; fi
  shift
done
"#,
        );

        let outcome = make_test_files(&tool, &source, &dest, &[0, 1]).await.unwrap();
        assert_eq!(outcome.completed, 4);
        for version in NETWORK_VERSIONS {
            assert!(fixture_path(&dest, "PavingStones070", version).is_file());
        }
    }
}
