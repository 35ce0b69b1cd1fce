//! Compression study: sweep a dataset of materials over a set of experiments
//! and tabulate quality, bitrate and time as CSV.

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dispatch::{
    batch_progress_bar, process_concurrent_tasks, BatchClock, BatchOutcome, CompletionHandler,
};
use crate::error::NtcError;
use crate::ntc::{Arguments, RunResult};
use crate::paths::relative_name;

/// Columns in the per-MIP report
pub const TARGET_MIP_COUNT: usize = 13;

/// Named set of argument overrides applied to every material
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub overrides: Map<String, Value>,
}

impl Experiment {
    fn bitrate(name: &str, bpp: f64) -> Self {
        let mut overrides = Map::new();
        overrides.insert("bitsPerPixel".into(), Value::from(bpp));
        Self {
            name: name.to_string(),
            overrides,
        }
    }

    /// 0.5 to 16 bits per pixel
    pub fn default_set() -> Vec<Experiment> {
        [
            ("0.5", 0.5),
            ("1.0", 1.0),
            ("2.0", 2.0),
            ("4.0", 4.0),
            ("8.0", 8.0),
            ("16.0", 16.0),
        ]
        .into_iter()
        .map(|(name, bpp)| Self::bitrate(name, bpp))
        .collect()
    }

    /// Load `[{"name": "...", <argument overrides>}, ...]`
    pub fn load(path: &Path) -> Result<Vec<Experiment>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read experiments: {}", path.display()))?;
        let entries: Vec<Map<String, Value>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse experiments: {}", path.display()))?;

        entries
            .into_iter()
            .enumerate()
            .map(|(i, mut overrides)| {
                let name = match overrides.remove("name") {
                    Some(Value::String(name)) => name,
                    _ => bail!("Experiment {} in {} has no \"name\"", i, path.display()),
                };
                Ok(Experiment { name, overrides })
            })
            .collect()
    }
}

/// Which materials of the dataset take part
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Take every Nth material
    pub stride: Option<usize>,
    /// Skip the first N materials
    pub skip: Option<usize>,
    /// Stop after N materials
    pub limit: Option<usize>,
    /// Material names relative to the dataset root
    pub filter: Option<Vec<String>>,
}

/// `a,b,c` or `@file` with one name per line
pub fn parse_filter(value: &str) -> Result<Vec<String>> {
    if let Some(path) = value.strip_prefix('@') {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read filter file: {}", path))?;
        return Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect());
    }
    Ok(value.split(',').map(|s| s.trim().to_string()).collect())
}

/// A directory with files and no subdirectories
fn is_material_dir(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let mut has_files = false;
    for entry in entries.filter_map(|e| e.ok()) {
        match entry.file_type() {
            Ok(t) if t.is_dir() => return false,
            Ok(_) => has_files = true,
            Err(_) => {}
        }
    }
    has_files
}

/// Materials under `dataset` as `(path, name)`, in sorted walk order
pub fn find_materials(dataset: &Path, selection: &Selection) -> Result<Vec<(PathBuf, String)>> {
    if !dataset.is_dir() {
        bail!("The specified dataset path '{}' does not exist.", dataset.display());
    }

    let mut materials = Vec::new();
    let mut ordinal = 0usize;

    for entry in WalkDir::new(dataset)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        if !is_material_dir(entry.path()) {
            continue;
        }

        ordinal += 1;
        if let Some(stride) = selection.stride.filter(|&s| s > 0) {
            if ordinal % stride != 0 {
                continue;
            }
        }
        if selection.skip.is_some_and(|skip| ordinal <= skip) {
            continue;
        }

        let name = relative_name(dataset, entry.path());
        if let Some(filter) = &selection.filter {
            if !filter.contains(&name) {
                continue;
            }
        }

        debug!("Material {}: {}", ordinal, name);
        materials.push((entry.path().to_path_buf(), name));

        if selection.limit.is_some_and(|limit| materials.len() >= limit) {
            break;
        }
    }

    Ok(materials)
}

/// What the value columns of a row hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Columns {
    /// PSNR of each of the first [`TARGET_MIP_COUNT`] mips
    Mips,
    /// One column per learning-curve sample, then the final PSNR
    Curve {
        training_steps: u32,
        steps_per_iteration: u32,
    },
    /// Overall PSNR only
    Psnr,
}

impl Columns {
    fn curve_steps(training_steps: u32, steps_per_iteration: u32) -> Vec<u32> {
        if steps_per_iteration == 0 {
            return Vec::new();
        }
        (1..=training_steps / steps_per_iteration)
            .map(|i| i * steps_per_iteration)
            .collect()
    }

    pub fn header(&self) -> String {
        let mut cells: Vec<String> = vec!["Name".into(), "Experiment".into()];
        match *self {
            Columns::Mips => cells.extend((0..TARGET_MIP_COUNT).map(|mip| format!("MIP {}", mip))),
            Columns::Curve {
                training_steps,
                steps_per_iteration,
            } => {
                cells.extend(
                    Self::curve_steps(training_steps, steps_per_iteration)
                        .into_iter()
                        .map(|step| step.to_string()),
                );
                cells.push("Final".into());
            }
            Columns::Psnr => cells.push("PSNR".into()),
        }
        cells.push("BPP".into());
        cells.push("Time(s)".into());
        cells.join(",")
    }

    pub fn row(&self, material: &str, experiment: &str, result: &RunResult) -> String {
        let mut cells: Vec<String> = vec![material.to_string(), experiment.to_string()];
        match *self {
            Columns::Mips => cells.extend(
                (0..TARGET_MIP_COUNT).map(|mip| optional(result.per_mip_psnr.get(mip).copied())),
            ),
            Columns::Curve {
                training_steps,
                steps_per_iteration,
            } => {
                let curve = result.learning_curve();
                for step in Self::curve_steps(training_steps, steps_per_iteration) {
                    let psnr = curve.iter().find(|s| s.steps == step).map(|s| s.psnr);
                    cells.push(optional(psnr));
                }
                cells.push(optional(result.overall_psnr));
            }
            Columns::Psnr => cells.push(optional(result.overall_psnr)),
        }
        cells.push(optional(result.bits_per_pixel));
        cells.push(format!("{:.2}", result.elapsed.as_secs_f64()));
        cells.join(",")
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One (material, experiment) pair
#[derive(Debug, Clone)]
pub struct StudyTask {
    pub index: usize,
    pub material: String,
    pub experiment: String,
    pub args: Arguments,
}

impl AsRef<Arguments> for StudyTask {
    fn as_ref(&self) -> &Arguments {
        &self.args
    }
}

#[derive(Debug, Clone)]
pub struct StudyOptions {
    pub tool: PathBuf,
    pub dataset: PathBuf,
    pub selection: Selection,
    pub experiments: Vec<Experiment>,
    pub mips: bool,
    pub curve: bool,
    pub training_steps: u32,
    pub steps_per_iteration: u32,
    pub devices: Vec<u32>,
    /// CSV destination; stdout when unset
    pub output: Option<PathBuf>,
}

impl StudyOptions {
    pub fn columns(&self) -> Columns {
        if self.mips {
            Columns::Mips
        } else if self.curve {
            Columns::Curve {
                training_steps: self.training_steps,
                steps_per_iteration: self.steps_per_iteration,
            }
        } else {
            Columns::Psnr
        }
    }
}

/// Every material crossed with every experiment, materials outermost
pub fn build_tasks(options: &StudyOptions, materials: &[(PathBuf, String)]) -> Result<Vec<StudyTask>> {
    let mut tasks = Vec::with_capacity(materials.len() * options.experiments.len());

    for (path, name) in materials {
        for experiment in &options.experiments {
            let base = Arguments {
                load_images: Some(path.clone()),
                generate_mips: options.mips,
                compress: true,
                decompress: true,
                training_steps: Some(options.training_steps),
                steps_per_iteration: Some(options.steps_per_iteration),
                ..Arguments::new(&options.tool)
            };
            let args = base.with_overrides(&experiment.overrides).with_context(|| {
                format!("Invalid overrides in experiment '{}'", experiment.name)
            })?;

            tasks.push(StudyTask {
                index: tasks.len(),
                material: name.clone(),
                experiment: experiment.name.clone(),
                args,
            });
        }
    }

    Ok(tasks)
}

/// Collects rows as results arrive
struct StudyReport {
    columns: Columns,
    rows: Vec<(usize, String)>,
    clock: BatchClock,
    progress: Option<ProgressBar>,
}

impl CompletionHandler<StudyTask> for StudyReport {
    fn on_complete(
        &mut self,
        task: &StudyTask,
        result: &RunResult,
        total: usize,
        completed: usize,
    ) -> Result<()> {
        self.rows.push((
            task.index,
            self.columns.row(&task.material, &task.experiment, result),
        ));

        if let Some(pb) = &self.progress {
            pb.set_position(completed as u64);
            pb.set_message(self.clock.status(total, completed));
        }
        Ok(())
    }

    fn on_failure(&mut self, task: &StudyTask, error: &NtcError) {
        let message = format!("{} ({}): {}", task.material, task.experiment, error);
        match &self.progress {
            Some(pb) => pb.println(message),
            None => eprintln!("{}", message),
        }
    }
}

impl StudyReport {
    /// Header plus rows in submission order
    fn render(mut self) -> String {
        self.rows.sort_by_key(|(index, _)| *index);
        let mut csv = self.columns.header();
        csv.push('\n');
        for (_, row) in &self.rows {
            csv.push_str(row);
            csv.push('\n');
        }
        csv
    }
}

/// Run the sweep and write the CSV.
///
/// Rows of completed tasks are written even when the batch is aborted.
pub async fn run_study(options: &StudyOptions) -> Result<BatchOutcome> {
    if !options.tool.is_file() {
        bail!("The specified tool file '{}' does not exist.", options.tool.display());
    }

    let materials = find_materials(&options.dataset, &options.selection)?;
    let tasks = build_tasks(options, &materials)?;
    info!(
        "Study: {} materials x {} experiments on {} device(s)",
        materials.len(),
        options.experiments.len(),
        options.devices.len()
    );

    let progress = options.output.as_ref().map(|_| {
        let pb = batch_progress_bar(tasks.len());
        pb.set_message("Starting tests...");
        pb
    });

    let mut report = StudyReport {
        columns: options.columns(),
        rows: Vec::new(),
        clock: BatchClock::start(),
        progress,
    };

    let outcome = process_concurrent_tasks(tasks, &options.devices, &mut report).await?;

    if let Some(pb) = report.progress.take() {
        pb.finish_and_clear();
    }

    let csv = report.render();
    match &options.output {
        Some(path) => std::fs::write(path, csv)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", csv),
    }

    Ok(outcome)
}
