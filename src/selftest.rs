//! End-to-end regression suite against a real ntc-cli and SDK assets.
//!
//! Cases run in order and share a [`SuiteContext`]. `Describe` goes first:
//! the capabilities it reports decide which decompression cases are skipped.

use anyhow::{bail, ensure, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::gpu::GpuCapabilities;
use crate::hash::compute_file_hash;
use crate::imagediff::{compare_material, compute_psnr};
use crate::ntc::{run_on_device, Arguments, GraphicsApi, RunResult};
use crate::paths::{SdkLayout, REFERENCE_MATERIAL};

const HDR_MATERIAL: &str = "HdrChapel";

/// Per-image PSNR after a 4 bpp compression, in `MATERIAL_IMAGES` order
const COMPRESSION_EXPECTED_PSNR: [f64; 5] = [32.0, 28.0, 38.0, 27.0, 35.0];
/// Per-image PSNR of the 5 bpp fixture
const DECOMPRESSION_EXPECTED_PSNR: [f64; 5] = [34.3, 30.4, 40.0, 29.5, 35.8];

/// State shared by the cases of one suite run
#[derive(Debug)]
pub struct SuiteContext {
    pub tool: PathBuf,
    pub sdk: SdkLayout,
    pub device: Option<u32>,
    /// Filled in by the describe case
    pub capabilities: Option<GpuCapabilities>,
}

impl SuiteContext {
    pub fn new(tool: impl Into<PathBuf>, sdk: SdkLayout) -> Self {
        Self {
            tool: tool.into(),
            sdk,
            device: None,
            capabilities: None,
        }
    }

    /// Empty the scratch directory
    fn prepare_scratch(&self) -> Result<PathBuf> {
        let scratch = self.sdk.scratch_dir();
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)
                .with_context(|| format!("Failed to clear {}", scratch.display()))?;
        }
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("Failed to create {}", scratch.display()))?;
        Ok(scratch)
    }

    fn fixture(&self) -> PathBuf {
        self.sdk
            .test_files_dir()
            .join(format!("{}_5bpp.ntc", REFERENCE_MATERIAL))
    }

    async fn run(&self, args: &Arguments) -> Result<RunResult> {
        Ok(run_on_device(args, self.device).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressionApi {
    Cuda,
    Graphics(GraphicsApi),
}

impl DecompressionApi {
    fn label(&self) -> &'static str {
        match self {
            DecompressionApi::Cuda => "cuda",
            DecompressionApi::Graphics(GraphicsApi::Vulkan) => "vk",
            DecompressionApi::Graphics(GraphicsApi::Dx12) => "dx12",
        }
    }

    /// What the tool reports as the API in use
    fn expected_name(&self) -> &'static str {
        match self {
            DecompressionApi::Cuda => "",
            DecompressionApi::Graphics(api) => api.reported_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureLevel {
    DP4a,
    CoopVec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Describe,
    Compression,
    Determinism,
    HdrCompression,
    Decompression {
        api: DecompressionApi,
        level: FeatureLevel,
    },
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Case::Describe => write!(f, "Describe"),
            Case::Compression => write!(f, "Compression"),
            Case::Determinism => write!(f, "Determinism"),
            Case::HdrCompression => write!(f, "HDR Compression"),
            Case::Decompression { api, level } => {
                write!(f, "Decompression ({}, {:?})", api.label(), level)
            }
        }
    }
}

/// How a case ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Passed,
    Skipped(String),
    Failed(String),
}

/// The full suite in run order
pub fn default_cases() -> Vec<Case> {
    let mut cases = vec![
        Case::Describe,
        Case::Compression,
        Case::Determinism,
        Case::HdrCompression,
        Case::Decompression {
            api: DecompressionApi::Cuda,
            level: FeatureLevel::DP4a,
        },
    ];
    for api in [GraphicsApi::Vulkan, GraphicsApi::Dx12] {
        for level in [FeatureLevel::DP4a, FeatureLevel::CoopVec] {
            cases.push(Case::Decompression {
                api: DecompressionApi::Graphics(api),
                level,
            });
        }
    }
    cases
}

fn ensure_between(value: f64, low: f64, high: f64, what: &str) -> Result<()> {
    ensure!(
        (low..=high).contains(&value),
        "{} {} is not between {} and {}",
        what,
        value,
        low,
        high
    );
    Ok(())
}

fn ensure_exists(path: &Path) -> Result<()> {
    ensure!(path.exists(), "'{}' does not exist", path.display());
    Ok(())
}

fn overall_psnr(result: &RunResult) -> Result<f64> {
    result
        .overall_psnr
        .context("ntc-cli did not report an overall PSNR")
}

/// Compare decoded images with the originals, each within `tolerance` dB
fn check_material(
    source: &Path,
    decoded: &Path,
    expected: &[f64; 5],
    tolerance: f64,
    ignore_extra_channels: bool,
) -> Result<()> {
    let measured = compare_material(source, decoded, ignore_extra_channels)?;
    for ((name, psnr), expected) in measured.into_iter().zip(expected) {
        debug!("{}: {:.2} dB (expected {:.1})", name, psnr, expected);
        ensure_between(psnr, expected - tolerance, expected + tolerance, name)?;
    }
    Ok(())
}

impl Case {
    pub async fn run(&self, ctx: &mut SuiteContext) -> Result<Outcome> {
        match *self {
            Case::Describe => describe(ctx).await,
            Case::Compression => compression(ctx).await,
            Case::Determinism => determinism(ctx).await,
            Case::HdrCompression => hdr_compression(ctx).await,
            Case::Decompression { api, level } => decompression(ctx, api, level).await,
        }
    }
}

async fn describe(ctx: &mut SuiteContext) -> Result<Outcome> {
    let args = Arguments {
        load_compressed: Some(ctx.fixture()),
        describe: true,
        graphics_api: Some(GraphicsApi::Vulkan),
        ..Arguments::new(&ctx.tool)
    };
    let result = ctx.run(&args).await?;

    ensure!(
        result.dimensions == Some((2048, 2048)),
        "unexpected dimensions {:?}",
        result.dimensions
    );
    ensure!(result.channels == Some(10), "unexpected channel count {:?}", result.channels);
    ensure!(result.mip_levels == Some(1), "unexpected mip count {:?}", result.mip_levels);

    let capabilities = GpuCapabilities::from_result(&result);
    info!(
        "GPU: {} ({}), features: {}",
        capabilities.gpu_name,
        capabilities.graphics_api,
        capabilities.feature_names().join(", ")
    );
    ctx.capabilities = Some(capabilities);
    Ok(Outcome::Passed)
}

/// 4 bpp, 10 000 steps, sampled every 1 000
fn reference_compression(ctx: &SuiteContext, save_to: PathBuf) -> Arguments {
    Arguments {
        load_images: Some(ctx.sdk.material(REFERENCE_MATERIAL)),
        compress: true,
        decompress: true,
        bits_per_pixel: Some(4.0),
        steps_per_iteration: Some(1000),
        training_steps: Some(10000),
        save_compressed: Some(save_to),
        ..Arguments::new(&ctx.tool)
    }
}

fn decompress_to_tga(ctx: &SuiteContext, ntc_file: PathBuf, output: PathBuf) -> Arguments {
    Arguments {
        load_compressed: Some(ntc_file),
        decompress: true,
        save_images: Some(output),
        image_format: Some("tga".into()),
        bc_format: Some("none".into()),
        ..Arguments::new(&ctx.tool)
    }
}

async fn compression(ctx: &mut SuiteContext) -> Result<Outcome> {
    let scratch = ctx.prepare_scratch()?;
    let ntc_file = scratch.join(format!("{}.ntc", REFERENCE_MATERIAL));

    let args = reference_compression(ctx, ntc_file.clone());
    let result = ctx.run(&args).await?;

    ensure_exists(&ntc_file)?;
    ensure!(
        result.bits_per_pixel == Some(4.0),
        "bits per pixel {:?} differs from the requested 4.0",
        result.bits_per_pixel
    );
    ensure_between(overall_psnr(&result)?, 27.0, 30.0, "PSNR")?;
    ensure!(
        result.compression_runs.len() == 1,
        "expected one compression run, got {}",
        result.compression_runs.len()
    );
    ensure!(
        result.learning_curve().len() == 10,
        "expected 10 learning curve samples, got {}",
        result.learning_curve().len()
    );

    let decoded = scratch.join("output");
    ctx.run(&decompress_to_tga(ctx, ntc_file, decoded.clone()))
        .await?;

    check_material(
        &ctx.sdk.material(REFERENCE_MATERIAL),
        &decoded,
        &COMPRESSION_EXPECTED_PSNR,
        2.0,
        false,
    )?;
    Ok(Outcome::Passed)
}

async fn determinism(ctx: &mut SuiteContext) -> Result<Outcome> {
    let scratch = ctx.prepare_scratch()?;
    let first = scratch.join(format!("{}_1.ntc", REFERENCE_MATERIAL));
    let second = scratch.join(format!("{}_2.ntc", REFERENCE_MATERIAL));

    let stable = |path: &Path| Arguments {
        stable_training: true,
        random_seed: Some(1234),
        ..reference_compression(ctx, path.to_path_buf())
    };

    let result1 = ctx.run(&stable(&first)).await?;
    let result2 = ctx.run(&stable(&second)).await?;

    let psnr1 = overall_psnr(&result1)?;
    ensure_between(psnr1, 27.0, 30.0, "PSNR")?;
    ensure_between(overall_psnr(&result2)?, psnr1 - 0.05, psnr1 + 0.05, "second run PSNR")?;

    ensure_exists(&first)?;
    ensure_exists(&second)?;
    let (hash1, hash2) = (compute_file_hash(&first)?, compute_file_hash(&second)?);
    ensure!(hash1 == hash2, "artifacts differ: {} vs {}", hash1, hash2);
    Ok(Outcome::Passed)
}

async fn hdr_compression(ctx: &mut SuiteContext) -> Result<Outcome> {
    let source = ctx.sdk.material(HDR_MATERIAL);
    if !source.join("Color.exr").is_file() {
        return Ok(Outcome::Skipped(format!("{} is not available", HDR_MATERIAL)));
    }

    let scratch = ctx.prepare_scratch()?;
    let ntc_file = scratch.join(format!("{}.ntc", HDR_MATERIAL));
    let args = Arguments {
        load_images: Some(source.clone()),
        compress: true,
        decompress: true,
        bits_per_pixel: Some(5.0),
        steps_per_iteration: Some(1000),
        training_steps: Some(10000),
        save_compressed: Some(ntc_file.clone()),
        random_seed: Some(1337),
        ..Arguments::new(&ctx.tool)
    };
    let result = ctx.run(&args).await?;

    ensure_exists(&ntc_file)?;
    ensure!(
        result.bits_per_pixel == Some(5.0),
        "bits per pixel {:?} differs from the requested 5.0",
        result.bits_per_pixel
    );
    ensure_between(overall_psnr(&result)?, 38.0, 40.0, "PSNR")?;
    ensure!(
        result.compression_runs.len() == 1,
        "expected one compression run, got {}",
        result.compression_runs.len()
    );
    ensure!(
        result.learning_curve().len() == 10,
        "expected 10 learning curve samples, got {}",
        result.learning_curve().len()
    );

    let decoded = scratch.join("output");
    let args = Arguments {
        image_format: Some("exr".into()),
        ..decompress_to_tga(ctx, ntc_file, decoded.clone())
    };
    ctx.run(&args).await?;

    // Measured on linear data; the tool measures in its HLG storage space
    let psnr = compute_psnr(&source.join("Color.exr"), &decoded.join("Color.exr"), false)?;
    ensure_between(psnr, 38.0, 42.0, "Color PSNR")?;
    Ok(Outcome::Passed)
}

async fn decompression(
    ctx: &mut SuiteContext,
    api: DecompressionApi,
    level: FeatureLevel,
) -> Result<Outcome> {
    if api == DecompressionApi::Graphics(GraphicsApi::Dx12) && !cfg!(windows) {
        return Ok(Outcome::Skipped("DX12 is only available on Windows".into()));
    }
    let coop_vec = ctx
        .capabilities
        .as_ref()
        .is_some_and(GpuCapabilities::supports_coop_vec);
    if level == FeatureLevel::CoopVec && !coop_vec {
        return Ok(Outcome::Skipped("CoopVec is not supported".into()));
    }

    let scratch = ctx.prepare_scratch()?;
    let decoded = scratch.join("output");
    let mut args = decompress_to_tga(ctx, ctx.fixture(), decoded.clone());
    if let DecompressionApi::Graphics(graphics) = api {
        args.graphics_api = Some(graphics);
        args.no_coop_vec = level != FeatureLevel::CoopVec;
    }

    let result = ctx.run(&args).await?;
    if result.graphics_api != api.expected_name() {
        bail!(
            "expected graphics API '{}', tool used '{}'",
            api.expected_name(),
            result.graphics_api
        );
    }

    check_material(
        &ctx.sdk.material(REFERENCE_MATERIAL),
        &decoded,
        &DECOMPRESSION_EXPECTED_PSNR,
        1.5,
        api != DecompressionApi::Cuda,
    )?;
    Ok(Outcome::Passed)
}

/// Tallies of a suite run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteReport {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Run `cases` in order, printing one line per case
pub async fn run_suite(ctx: &mut SuiteContext, cases: &[Case]) -> SuiteReport {
    let mut report = SuiteReport::default();

    for case in cases {
        let outcome = match case.run(ctx).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(format!("{:#}", e)),
        };

        match &outcome {
            Outcome::Passed => {
                report.passed += 1;
                println!("{} ... ok", case);
            }
            Outcome::Skipped(reason) => {
                report.skipped += 1;
                println!("{} ... skipped '{}'", case, reason);
            }
            Outcome::Failed(reason) => {
                report.failed += 1;
                println!("{} ... FAIL\n    {}", case, reason);
            }
        }
    }

    println!(
        "\n{} passed, {} failed, {} skipped",
        report.passed, report.failed, report.skipped
    );
    report
}
