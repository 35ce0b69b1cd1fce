//! ntc-cli output interpretation
//!
//! The tool reports its results as human-readable lines on stdout. Lines are
//! matched against a fixed table of forms; anything unrecognized is ignored.
//! A line that starts like a known report but does not have its full shape is
//! treated as a contract violation rather than skipped.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use super::arguments::{Arguments, LatentShape};
use crate::error::NtcError;

/// GPU capability reported by the tool when it initializes a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuFeature {
    DP4a,
    FP16,
    CoopVec,
    CoopVecInt8,
    CoopVecFP8,
}

impl GpuFeature {
    fn from_report_name(name: &str) -> Option<Self> {
        match name {
            "DP4a" => Some(GpuFeature::DP4a),
            "FP16" => Some(GpuFeature::FP16),
            "CoopVec" => Some(GpuFeature::CoopVec),
            "CoopVec-Int8" => Some(GpuFeature::CoopVecInt8),
            "CoopVec-FP8" => Some(GpuFeature::CoopVecFP8),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GpuFeature::DP4a => "DP4a",
            GpuFeature::FP16 => "FP16",
            GpuFeature::CoopVec => "CoopVec",
            GpuFeature::CoopVecInt8 => "CoopVecInt8",
            GpuFeature::CoopVecFP8 => "CoopVecFP8",
        }
    }
}

/// One intermediate measurement taken during training
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningSample {
    pub steps: u32,
    pub ms_per_step: f64,
    pub psnr: f64,
}

/// One compression experiment. The tool runs several when searching for a
/// target PSNR; a plain `--bitsPerPixel` compression produces exactly one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionRun {
    pub bits_per_pixel: Option<f64>,
    pub learning_curve: Vec<LearningSample>,
}

/// Everything the harness recovers from one ntc-cli run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Wall-clock time of the whole invocation
    pub elapsed: Duration,

    pub gpu_name: String,
    /// Empty when only the CUDA path was used
    pub graphics_api: String,
    pub gpu_features: Vec<GpuFeature>,
    pub compute_capability: Option<(u32, u32)>,

    pub dimensions: Option<(u32, u32)>,
    pub channels: Option<u32>,
    pub mip_levels: Option<u32>,
    pub latent_shape: Option<LatentShape>,
    pub network_version: String,

    pub bits_per_pixel: Option<f64>,
    pub overall_psnr: Option<f64>,
    pub overall_psnr_fp8: Option<f64>,
    pub per_mip_psnr: Vec<f64>,
    pub compression_runs: Vec<CompressionRun>,

    pub combined_bc_psnr: Option<f64>,
    pub combined_bc_bits_per_pixel: Option<f64>,
    pub decompression_time_ms: Option<f64>,

    pub saved_file_size: Option<u64>,
    pub saved_file_bpp: Option<f64>,
}

impl RunResult {
    pub fn width(&self) -> Option<u32> {
        self.dimensions.map(|(w, _)| w)
    }

    pub fn height(&self) -> Option<u32> {
        self.dimensions.map(|(_, h)| h)
    }

    pub fn has_feature(&self, feature: GpuFeature) -> bool {
        self.gpu_features.contains(&feature)
    }

    /// Learning curve of the first compression experiment
    pub fn learning_curve(&self) -> &[LearningSample] {
        self.compression_runs
            .first()
            .map(|run| run.learning_curve.as_slice())
            .unwrap_or(&[])
    }
}

const PSNR: &str = r"(?:[0-9.]+|inf)";

/// Report forms recognized in the tool output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    BaseRate,
    SelectedRate,
    BcQuality,
    CudaDecompressionTime,
    GraphicsDecompressionTime,
    Dimensions,
    Experiment,
    FileSize,
    LatentShape,
    Mip,
    NetworkVersion,
    OverallPsnr,
    TrainingStep,
    System,
}

struct LinePattern {
    kind: LineKind,
    prefix: &'static str,
    /// When set, a line with this prefix must match the full form
    strict: bool,
    regex: Regex,
}

fn patterns() -> &'static [LinePattern] {
    static PATTERNS: OnceLock<Vec<LinePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let p = |kind, prefix, strict, pattern: String| LinePattern {
            kind,
            prefix,
            strict,
            regex: Regex::new(&pattern).expect("static output pattern"),
        };
        vec![
            p(LineKind::BaseRate, "Base compression rate:", true,
                r"^Base compression rate: --bitsPerPixel (?P<bpp>[0-9.]+)".into()),
            p(LineKind::SelectedRate, "Selected compression rate:", true,
                format!(r"^Selected compression rate: (?P<bpp>[0-9.]+) bpp, (?P<psnr>{PSNR}) dB PSNR")),
            p(LineKind::BcQuality, "Combined BCn PSNR:", true,
                format!(r"^Combined BCn PSNR: (?P<psnr>{PSNR}) dB, bit rate: (?P<bpp>[0-9.]+) bpp")),
            p(LineKind::CudaDecompressionTime, "CUDA decompression time:", true,
                r"^CUDA decompression time: (?P<ms>[0-9.]+) ms".into()),
            p(LineKind::GraphicsDecompressionTime, "Median decompression time", false,
                r"^Median decompression time over \d+ iterations: (?P<ms>[0-9.]+) ms".into()),
            p(LineKind::Dimensions, "Dimensions:", true,
                r"^Dimensions: (?P<width>\d+)x(?P<height>\d+), (?P<channels>\d+) channels, (?P<mips>\d+) mip level\(s\)".into()),
            p(LineKind::Experiment, "Experiment ", false,
                r"^Experiment (?P<index>\d+): (?P<bpp>[0-9.]+) bpp".into()),
            p(LineKind::FileSize, "File size:", true,
                r"^File size: (?P<bytes>\d+) bytes, (?P<bpp>[0-9.]+) bits per pixel".into()),
            p(LineKind::LatentShape, "Latent shape:", true,
                r"^Latent shape: --gridSizeScale (?P<gss>\d+) --(?:numFeatures|highResFeatures) (?P<features>\d+)".into()),
            p(LineKind::Mip, "MIP", false,
                format!(r"^MIP\s+(?P<mip>\d+)\s+PSNR: (?P<psnr>{PSNR}) dB")),
            p(LineKind::NetworkVersion, "Network version:", true,
                r"^Network version: (?P<version>[A-Z0-9_]+)".into()),
            p(LineKind::OverallPsnr, "Overall PSNR (", true,
                format!(r"^Overall PSNR \((?P<kind>\w+) weights\): (?P<psnr>{PSNR}) dB")),
            p(LineKind::TrainingStep, "Training:", true,
                format!(r"^Training: (?P<steps>\d+) steps, (?P<ms>[0-9.]+) ms/step, intermediate PSNR: (?P<psnr>{PSNR}) dB")),
            p(LineKind::System, "Using ", false,
                r"^Using (?P<gpu>.+) with (?P<api>\S+) API\.(?P<rest>.*)$".into()),
        ]
    })
}

fn feature_flag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<name>[A-Za-z0-9-]+) \[(?P<flag>[YN])\]").expect("static pattern"))
}

fn compute_capability_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Compute capability (?P<major>\d+)\.(?P<minor>\d+)").expect("static pattern"))
}

fn field<T: std::str::FromStr>(caps: &Captures<'_>, name: &str, line: &str) -> Result<T, NtcError> {
    let text = caps
        .name(name)
        .map(|m| m.as_str())
        .ok_or_else(|| NtcError::parse(line, format!("missing field '{}'", name)))?;
    text.parse::<T>()
        .map_err(|_| NtcError::parse(line, format!("invalid value '{}' for '{}'", text, name)))
}

/// `inf` is what the tool prints for lossless channels
fn psnr_field(caps: &Captures<'_>, name: &str, line: &str) -> Result<f64, NtcError> {
    match caps.name(name).map(|m| m.as_str()) {
        Some("inf") => Ok(f64::INFINITY),
        _ => field(caps, name, line),
    }
}

/// Interpret the stdout of a successful run.
///
/// `args` supplies the requested bitrate (inherited when the tool does not
/// report one) and whether a describe report is required.
pub fn parse_output(stdout: &str, args: &Arguments) -> Result<RunResult, NtcError> {
    let mut result = RunResult {
        bits_per_pixel: args.bits_per_pixel.map(f64::from),
        ..Default::default()
    };
    let mut run = CompressionRun::default();

    // Training progress is overwritten in place with '\r'
    for line in stdout.split(['\n', '\r']) {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        let Some(pattern) = patterns().iter().find(|p| line.starts_with(p.prefix)) else {
            continue;
        };
        let Some(caps) = pattern.regex.captures(line) else {
            if pattern.strict {
                return Err(NtcError::parse(line, format!("malformed {:?} report", pattern.kind)));
            }
            continue;
        };

        match pattern.kind {
            LineKind::BaseRate => {
                result.bits_per_pixel = Some(field(&caps, "bpp", line)?);
            }
            LineKind::SelectedRate => {
                result.bits_per_pixel = Some(field(&caps, "bpp", line)?);
                result.overall_psnr = Some(psnr_field(&caps, "psnr", line)?);
            }
            LineKind::BcQuality => {
                result.combined_bc_psnr = Some(psnr_field(&caps, "psnr", line)?);
                result.combined_bc_bits_per_pixel = Some(field(&caps, "bpp", line)?);
            }
            LineKind::CudaDecompressionTime | LineKind::GraphicsDecompressionTime => {
                result.decompression_time_ms = Some(field(&caps, "ms", line)?);
            }
            LineKind::Dimensions => {
                result.dimensions = Some((field(&caps, "width", line)?, field(&caps, "height", line)?));
                result.channels = Some(field(&caps, "channels", line)?);
                result.mip_levels = Some(field(&caps, "mips", line)?);
            }
            LineKind::Experiment => {
                let finished = std::mem::take(&mut run);
                if !finished.learning_curve.is_empty() {
                    result.compression_runs.push(finished);
                }
                run.bits_per_pixel = Some(field(&caps, "bpp", line)?);
            }
            LineKind::FileSize => {
                result.saved_file_size = Some(field(&caps, "bytes", line)?);
                result.saved_file_bpp = Some(field(&caps, "bpp", line)?);
            }
            LineKind::LatentShape => {
                result.latent_shape = Some(LatentShape {
                    grid_size_scale: field(&caps, "gss", line)?,
                    num_features: field(&caps, "features", line)?,
                });
            }
            LineKind::Mip => {
                result.per_mip_psnr.push(psnr_field(&caps, "psnr", line)?);
            }
            LineKind::NetworkVersion => {
                result.network_version = caps["version"].to_string();
            }
            LineKind::OverallPsnr => {
                let psnr = psnr_field(&caps, "psnr", line)?;
                if &caps["kind"] == "FP8" {
                    result.overall_psnr_fp8 = Some(psnr);
                } else {
                    result.overall_psnr = Some(psnr);
                }
            }
            LineKind::TrainingStep => {
                run.learning_curve.push(LearningSample {
                    steps: field(&caps, "steps", line)?,
                    ms_per_step: field(&caps, "ms", line)?,
                    psnr: psnr_field(&caps, "psnr", line)?,
                });
            }
            LineKind::System => parse_system_line(&caps, &mut result),
        }
    }

    if !run.learning_curve.is_empty() {
        result.compression_runs.push(run);
    }

    if args.describe && result.dimensions.is_none() {
        return Err(NtcError::parse("", "describe output has no 'Dimensions:' report"));
    }

    Ok(result)
}

/// `Using <gpu> with <api> API. <details>`; the CUDA line only names the GPU
fn parse_system_line(caps: &Captures<'_>, result: &mut RunResult) {
    result.gpu_name = caps["gpu"].to_string();
    let rest = &caps["rest"];

    if &caps["api"] == "CUDA" {
        if let Some(cc) = compute_capability_regex().captures(rest) {
            let major = cc["major"].parse().unwrap_or(0);
            let minor = cc["minor"].parse().unwrap_or(0);
            result.compute_capability = Some((major, minor));
        }
        return;
    }

    result.graphics_api = caps["api"].to_string();
    result.gpu_features = feature_flag_regex()
        .captures_iter(rest)
        .filter(|f| &f["flag"] == "Y")
        .filter_map(|f| GpuFeature::from_report_name(&f["name"]))
        .collect();
}
