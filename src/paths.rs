//! SDK directory layout
//!
//! The suite, the fixture generator and the study default to locations
//! inside an SDK checkout:
//! - `assets/materials/<Material>`: source images
//! - `assets/testfiles`: pre-built `.ntc` fixtures
//! - `assets/testscratch`: scratch output, wiped per case
//! - `data/TestingDataset`: study dataset

use std::path::{Path, PathBuf};

/// Material every regression case uses
pub const REFERENCE_MATERIAL: &str = "PavingStones070";

#[derive(Debug, Clone)]
pub struct SdkLayout {
    root: PathBuf,
}

impl SdkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn materials_dir(&self) -> PathBuf {
        self.root.join("assets").join("materials")
    }

    pub fn material(&self, name: &str) -> PathBuf {
        self.materials_dir().join(name)
    }

    pub fn test_files_dir(&self) -> PathBuf {
        self.root.join("assets").join("testfiles")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("assets").join("testscratch")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("data").join("TestingDataset")
    }
}

/// `path` relative to `base` with forward slashes, or `path` as given when it
/// is not under `base`.
///
/// `data/Bricks\Red` -> `Bricks/Red` for base `data`
pub fn relative_name(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let sdk = SdkLayout::new("/opt/ntc");
        assert_eq!(
            sdk.material(REFERENCE_MATERIAL),
            PathBuf::from("/opt/ntc/assets/materials/PavingStones070")
        );
        assert_eq!(sdk.test_files_dir(), PathBuf::from("/opt/ntc/assets/testfiles"));
        assert_eq!(sdk.dataset_dir(), PathBuf::from("/opt/ntc/data/TestingDataset"));
    }

    #[test]
    fn test_relative_name() {
        let base = Path::new("/data/set");
        assert_eq!(relative_name(base, Path::new("/data/set/Bricks/Red")), "Bricks/Red");
        assert_eq!(relative_name(base, Path::new("/elsewhere/Stones")), "/elsewhere/Stones");
    }
}
