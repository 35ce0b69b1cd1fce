//! Task configuration for a single ntc-cli invocation
//!
//! `Arguments` mirrors the tool's command line. Field names serialize to the
//! tool's own flag names (camelCase), so a task stored as JSON reads the same
//! as the command line it produces.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::error::NtcError;

/// Graphics API used for decompression. Unset means the CUDA compute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum GraphicsApi {
    #[serde(rename = "vk")]
    #[value(name = "vk")]
    Vulkan,
    #[serde(rename = "dx12")]
    #[value(name = "dx12")]
    Dx12,
}

impl GraphicsApi {
    pub fn flag(&self) -> &'static str {
        match self {
            GraphicsApi::Vulkan => "--vk",
            GraphicsApi::Dx12 => "--dx12",
        }
    }

    /// API name as reported back by the tool
    pub fn reported_name(&self) -> &'static str {
        match self {
            GraphicsApi::Vulkan => "Vulkan",
            GraphicsApi::Dx12 => "D3D12",
        }
    }
}

/// Custom latent shape, bypasses the BPP-driven shape selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentShape {
    /// Ratio of source image size to the high-resolution feature grid size
    pub grid_size_scale: u32,
    /// Number of latent features
    pub num_features: u32,
}

/// Arguments for one ntc-cli run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Arguments {
    /// Path to the ntc-cli executable
    pub tool: PathBuf,

    /// Extra arguments passed verbatim, split on whitespace
    pub custom_arguments: Option<String>,

    // Execution target
    pub graphics_api: Option<GraphicsApi>,
    pub adapter: Option<u32>,
    pub cuda_device: Option<u32>,
    pub no_coop_vec: bool,
    pub no_coop_vec_int8: bool,
    #[serde(rename = "noCoopVecFP8")]
    pub no_coop_vec_fp8: bool,
    #[serde(rename = "noDP4a")]
    pub no_dp4a: bool,
    pub no_float16: bool,
    pub debug: bool,

    // Operations
    pub compress: bool,
    pub decompress: bool,
    pub describe: bool,
    pub generate_mips: bool,
    pub load_mips: bool,
    pub save_mips: bool,
    #[serde(rename = "optimizeBC")]
    pub optimize_bc: bool,
    pub match_bc_psnr: bool,
    pub discard_masked_out_pixels: bool,
    pub list_adapters: bool,
    pub list_cuda_devices: bool,
    pub benchmark: Option<u32>,

    // Inputs, at most one
    pub load_images: Option<PathBuf>,
    pub load_compressed: Option<PathBuf>,
    pub load_manifest: Option<PathBuf>,

    // Outputs
    pub save_compressed: Option<PathBuf>,
    pub save_images: Option<PathBuf>,
    pub image_format: Option<String>,
    pub bc_format: Option<String>,
    pub bc_quality: Option<u32>,
    pub bc_psnr_threshold: Option<f32>,
    pub bc_psnr_offset: Option<f32>,
    pub min_bc_psnr: Option<f32>,
    pub max_bc_psnr: Option<f32>,
    pub dimensions: Option<String>,

    // Training
    pub bits_per_pixel: Option<f32>,
    pub max_bits_per_pixel: Option<f32>,
    pub target_psnr: Option<f32>,
    pub training_steps: Option<u32>,
    pub steps_per_iteration: Option<u32>,
    pub stable_training: bool,
    pub random_seed: Option<u32>,
    pub latent_shape: Option<LatentShape>,
    pub grid_learning_rate: Option<f32>,
    pub network_learning_rate: Option<f32>,
    pub k_pixels_per_batch: Option<u32>,
    pub network_version: Option<String>,
    pub experimental_knob: Option<f32>,
}

impl AsRef<Arguments> for Arguments {
    fn as_ref(&self) -> &Arguments {
        self
    }
}

/// Accumulates `--flag [value]` pairs in the tool's syntax
struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    fn switch(&mut self, name: &str, on: bool) {
        if on {
            self.args.push(format!("--{}", name));
        }
    }

    fn value<V: Display>(&mut self, name: &str, value: Option<V>) {
        if let Some(value) = value {
            self.args.push(format!("--{}", name));
            self.args.push(value.to_string());
        }
    }

    fn path(&mut self, name: &str, value: Option<&Path>) {
        self.value(name, value.map(|p| p.to_string_lossy()));
    }

    /// Empty strings count as unset
    fn text(&mut self, name: &str, value: Option<&str>) {
        self.value(name, value.filter(|v| !v.is_empty()));
    }
}

impl Arguments {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            ..Default::default()
        }
    }

    /// The input source that is set, if any
    pub fn input_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.load_images.is_some() {
            sources.push("loadImages");
        }
        if self.load_compressed.is_some() {
            sources.push("loadCompressed");
        }
        if self.load_manifest.is_some() {
            sources.push("loadManifest");
        }
        sources
    }

    /// Names of training parameters that are set
    pub fn training_parameters(&self) -> Vec<&'static str> {
        let checks: [(&'static str, bool); 12] = [
            ("bitsPerPixel", self.bits_per_pixel.is_some()),
            ("maxBitsPerPixel", self.max_bits_per_pixel.is_some()),
            ("targetPsnr", self.target_psnr.is_some()),
            ("trainingSteps", self.training_steps.is_some()),
            ("stepsPerIteration", self.steps_per_iteration.is_some()),
            ("stableTraining", self.stable_training),
            ("randomSeed", self.random_seed.is_some()),
            ("latentShape", self.latent_shape.is_some()),
            ("gridLearningRate", self.grid_learning_rate.is_some()),
            ("networkLearningRate", self.network_learning_rate.is_some()),
            ("kPixelsPerBatch", self.k_pixels_per_batch.is_some()),
            ("matchBcPsnr", self.match_bc_psnr),
        ];
        checks
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| name)
            .collect()
    }

    /// Check the cross-field invariants and that the tool exists.
    ///
    /// Runs before any process is spawned.
    pub fn validate(&self) -> Result<(), NtcError> {
        let sources = self.input_sources();
        if sources.len() > 1 {
            return Err(NtcError::config(format!(
                "only one input source may be set, got {}",
                sources.join(" and ")
            )));
        }

        if !self.compress {
            let training = self.training_parameters();
            if !training.is_empty() {
                return Err(NtcError::config(format!(
                    "training parameters require compress: {}",
                    training.join(", ")
                )));
            }
        }

        if self.stable_training && self.random_seed.is_none() {
            return Err(NtcError::config(
                "stableTraining requires a randomSeed for reproducible output",
            ));
        }

        if self.tool.as_os_str().is_empty() {
            return Err(NtcError::config("tool path is not set"));
        }
        if !self.tool.is_file() {
            return Err(NtcError::config(format!(
                "tool not found: {}",
                self.tool.display()
            )));
        }

        Ok(())
    }

    /// Full command line, tool path first, bound to the given CUDA device.
    ///
    /// A `device` overrides `cuda_device` without modifying `self`.
    pub fn command_line(&self, device: Option<u32>) -> Vec<String> {
        let mut cmd = CommandLine {
            args: vec![self.tool.to_string_lossy().into_owned()],
        };

        if let Some(custom) = &self.custom_arguments {
            cmd.args.extend(custom.split_whitespace().map(str::to_string));
        }

        if let Some(api) = self.graphics_api {
            cmd.args.push(api.flag().to_string());
        }
        cmd.switch("no-coopVec", self.no_coop_vec);
        cmd.switch("no-coopVecInt8", self.no_coop_vec_int8);
        cmd.switch("no-coopVecFP8", self.no_coop_vec_fp8);
        cmd.switch("no-dp4a", self.no_dp4a);
        cmd.switch("no-float16", self.no_float16);
        cmd.value("adapter", self.adapter);
        cmd.value("cudaDevice", device.or(self.cuda_device));
        cmd.switch("debug", self.debug);

        cmd.switch("compress", self.compress);
        cmd.switch("decompress", self.decompress);
        cmd.switch("describe", self.describe);
        cmd.switch("generateMips", self.generate_mips);
        cmd.switch("loadMips", self.load_mips);
        cmd.switch("saveMips", self.save_mips);
        cmd.switch("optimizeBC", self.optimize_bc);
        cmd.switch("matchBcPsnr", self.match_bc_psnr);
        cmd.switch("discardMaskedOutPixels", self.discard_masked_out_pixels);
        cmd.switch("listAdapters", self.list_adapters);
        cmd.switch("listCudaDevices", self.list_cuda_devices);
        cmd.value("benchmark", self.benchmark);

        cmd.path("loadImages", self.load_images.as_deref());
        cmd.path("loadCompressed", self.load_compressed.as_deref());
        cmd.path("loadManifest", self.load_manifest.as_deref());

        cmd.path("saveCompressed", self.save_compressed.as_deref());
        cmd.path("saveImages", self.save_images.as_deref());
        cmd.text("imageFormat", self.image_format.as_deref());
        cmd.text("bcFormat", self.bc_format.as_deref());
        cmd.value("bcQuality", self.bc_quality);
        cmd.value("bcPsnrThreshold", self.bc_psnr_threshold);
        cmd.value("bcPsnrOffset", self.bc_psnr_offset);
        cmd.value("minBcPsnr", self.min_bc_psnr);
        cmd.value("maxBcPsnr", self.max_bc_psnr);
        cmd.text("dimensions", self.dimensions.as_deref());

        cmd.value("bitsPerPixel", self.bits_per_pixel);
        cmd.value("maxBitsPerPixel", self.max_bits_per_pixel);
        cmd.value("targetPsnr", self.target_psnr);
        cmd.value("trainingSteps", self.training_steps);
        cmd.value("stepsPerIteration", self.steps_per_iteration);
        cmd.switch("stableTraining", self.stable_training);
        cmd.value("randomSeed", self.random_seed);
        if let Some(shape) = self.latent_shape {
            cmd.value("gridSizeScale", Some(shape.grid_size_scale));
            cmd.value("numFeatures", Some(shape.num_features));
        }
        cmd.value("gridLearningRate", self.grid_learning_rate);
        cmd.value("networkLearningRate", self.network_learning_rate);
        cmd.value("kPixelsPerBatch", self.k_pixels_per_batch);
        cmd.text("networkVersion", self.network_version.as_deref());
        cmd.value("experimentalKnob", self.experimental_knob);

        cmd.args
    }

    /// Return a copy with the given JSON object merged over this task.
    ///
    /// Keys use the tool's flag names, e.g. `{"bitsPerPixel": 2.0}`.
    pub fn with_overrides(
        &self,
        overrides: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arguments, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut value {
            for (key, v) in overrides {
                fields.insert(key.clone(), v.clone());
            }
        }
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn has_pair(cmd: &[String], flag: &str, value: &str) -> bool {
        cmd.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_command_line_switches_and_values() {
        let args = Arguments {
            load_images: Some(PathBuf::from("/data/Stones")),
            compress: true,
            decompress: true,
            bits_per_pixel: Some(4.0),
            training_steps: Some(10000),
            latent_shape: Some(LatentShape {
                grid_size_scale: 2,
                num_features: 8,
            }),
            graphics_api: Some(GraphicsApi::Vulkan),
            no_coop_vec: true,
            ..Arguments::new("/opt/ntc/ntc-cli")
        };

        let cmd = args.command_line(None);
        assert_eq!(cmd[0], "/opt/ntc/ntc-cli");
        assert!(cmd.contains(&"--vk".to_string()));
        assert!(cmd.contains(&"--no-coopVec".to_string()));
        assert!(cmd.contains(&"--compress".to_string()));
        assert!(cmd.contains(&"--decompress".to_string()));
        assert!(!cmd.contains(&"--describe".to_string()));
        assert!(has_pair(&cmd, "--loadImages", "/data/Stones"));
        assert!(has_pair(&cmd, "--bitsPerPixel", "4"));
        assert!(has_pair(&cmd, "--trainingSteps", "10000"));
        assert!(has_pair(&cmd, "--gridSizeScale", "2"));
        assert!(has_pair(&cmd, "--numFeatures", "8"));
        assert!(!cmd.iter().any(|a| a == "--cudaDevice"));
    }

    #[test]
    fn test_device_binding_does_not_modify_task() {
        let args = Arguments {
            cuda_device: Some(3),
            describe: true,
            ..Arguments::new("ntc-cli")
        };
        let cmd = args.command_line(Some(1));
        assert!(has_pair(&cmd, "--cudaDevice", "1"));
        assert_eq!(cmd.iter().filter(|a| *a == "--cudaDevice").count(), 1);
        assert_eq!(args.cuda_device, Some(3));

        let cmd = args.command_line(None);
        assert!(has_pair(&cmd, "--cudaDevice", "3"));
    }

    #[test]
    fn test_seed_and_stable_training_pass_through() {
        let args = Arguments {
            compress: true,
            stable_training: true,
            random_seed: Some(1234),
            training_steps: Some(10000),
            ..Arguments::new("ntc-cli")
        };
        let cmd = args.command_line(Some(0));
        assert!(cmd.contains(&"--stableTraining".to_string()));
        assert!(has_pair(&cmd, "--randomSeed", "1234"));
        assert_eq!(args.command_line(Some(0)), args.command_line(Some(0)));
    }

    #[test]
    fn test_empty_strings_are_skipped() {
        let args = Arguments {
            image_format: Some(String::new()),
            bc_format: Some("none".into()),
            custom_arguments: Some("  --foo  bar ".into()),
            ..Arguments::new("ntc-cli")
        };
        let cmd = args.command_line(None);
        assert!(!cmd.iter().any(|a| a == "--imageFormat"));
        assert!(has_pair(&cmd, "--bcFormat", "none"));
        assert!(has_pair(&cmd, "--foo", "bar"));
    }

    #[test]
    fn test_validate_rejects_two_inputs() {
        let tool = NamedTempFile::new().unwrap();
        let args = Arguments {
            load_images: Some("a".into()),
            load_compressed: Some("b.ntc".into()),
            decompress: true,
            ..Arguments::new(tool.path())
        };
        let err = args.validate().unwrap_err();
        assert!(matches!(err, NtcError::Configuration(_)));
        assert!(err.to_string().contains("loadImages and loadCompressed"));
    }

    #[test]
    fn test_validate_training_requires_compress() {
        let tool = NamedTempFile::new().unwrap();
        let args = Arguments {
            load_compressed: Some("b.ntc".into()),
            decompress: true,
            bits_per_pixel: Some(2.0),
            ..Arguments::new(tool.path())
        };
        let err = args.validate().unwrap_err();
        assert!(err.to_string().contains("bitsPerPixel"));
    }

    #[test]
    fn test_validate_stable_training_requires_seed() {
        let tool = NamedTempFile::new().unwrap();
        let args = Arguments {
            compress: true,
            stable_training: true,
            ..Arguments::new(tool.path())
        };
        assert!(args.validate().unwrap_err().to_string().contains("randomSeed"));

        let args = Arguments {
            random_seed: Some(7),
            ..args
        };
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_tool() {
        let args = Arguments {
            describe: true,
            ..Arguments::new("/definitely/not/here/ntc-cli")
        };
        assert!(args.validate().unwrap_err().to_string().contains("tool not found"));
    }

    #[test]
    fn test_json_uses_flag_names() {
        let json = r#"{
            "tool": "ntc-cli",
            "loadImages": "/data/Stones",
            "compress": true,
            "bitsPerPixel": 1.5,
            "graphicsApi": "dx12",
            "noDP4a": true,
            "latentShape": {"gridSizeScale": 4, "numFeatures": 12}
        }"#;
        let args: Arguments = serde_json::from_str(json).unwrap();
        assert_eq!(args.load_images, Some(PathBuf::from("/data/Stones")));
        assert_eq!(args.bits_per_pixel, Some(1.5));
        assert_eq!(args.graphics_api, Some(GraphicsApi::Dx12));
        assert!(args.no_dp4a);
        assert_eq!(args.latent_shape.unwrap().num_features, 12);
        assert!(!args.decompress);
    }

    #[test]
    fn test_with_overrides() {
        let base = Arguments {
            compress: true,
            bits_per_pixel: Some(1.0),
            ..Arguments::new("ntc-cli")
        };
        let overrides: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"bitsPerPixel": 8.0, "networkVersion": "large"}"#).unwrap();
        let merged = base.with_overrides(&overrides).unwrap();
        assert_eq!(merged.bits_per_pixel, Some(8.0));
        assert_eq!(merged.network_version.as_deref(), Some("large"));
        assert!(merged.compress);
        assert_eq!(base.bits_per_pixel, Some(1.0));
    }
}
