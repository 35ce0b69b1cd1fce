//! ntc-harness command line

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use ntc_harness::dispatch::{process_concurrent_tasks, BatchOutcome, CompletionHandler};
use ntc_harness::gpu::list_adapters;
use ntc_harness::imagediff::compute_psnr;
use ntc_harness::ntc::{find_tool, run_on_device, Arguments, GraphicsApi, RunResult};
use ntc_harness::paths::{SdkLayout, REFERENCE_MATERIAL};
use ntc_harness::selftest::{default_cases, run_suite, SuiteContext};
use ntc_harness::study::{parse_filter, run_study, Experiment, Selection, StudyOptions};
use ntc_harness::{fixtures, NtcError};

/// Exit status when a batch was interrupted
const EXIT_ABORTED: i32 = 2;

#[derive(Parser)]
#[command(name = "ntc-harness")]
#[command(version)]
#[command(about = "Batch driver and test harness for the ntc-cli texture compression tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Path to the ntc-cli executable
    #[arg(long, global = true, env = "NTC_TOOL")]
    tool: Option<PathBuf>,

    /// Root of the SDK checkout (tool, assets and dataset locations)
    #[arg(long, global = true, env = "NTC_SDK_ROOT", default_value = ".")]
    sdk_root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task from a JSON file and print the result as JSON
    Run {
        /// Task file, keys use ntc-cli flag names
        task: PathBuf,

        /// CUDA device to bind the task to
        #[arg(long)]
        device: Option<u32>,
    },

    /// Run a JSON array of tasks across several devices
    Batch {
        /// File with an array of tasks
        tasks: PathBuf,

        /// CUDA devices to use, one task per device at a time
        #[arg(long, num_args = 1.., default_values_t = [0u32])]
        devices: Vec<u32>,
    },

    /// Describe a compressed texture set
    Describe {
        /// Path to the .ntc file
        file: PathBuf,

        /// Graphics API to initialize, CUDA when omitted
        #[arg(long, value_enum)]
        graphics_api: Option<GraphicsApi>,
    },

    /// Compress every material of a dataset over a set of experiments, output CSV
    Study {
        /// Directory with test materials, defaults to <sdk-root>/data/TestingDataset
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Maximum number of materials to test
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the first N materials
        #[arg(long)]
        skip: Option<usize>,

        /// Test every Nth material in the dataset
        #[arg(long)]
        stride: Option<usize>,

        /// Materials to test: comma separated, or @file with one per line
        #[arg(long)]
        filter: Option<String>,

        /// JSON file with experiments, defaults to bitrates 0.5 to 16
        #[arg(long)]
        experiments: Option<PathBuf>,

        /// Generate mipmaps and report per-MIP PSNR values
        #[arg(long)]
        mips: bool,

        /// Record the PSNR curve during compression
        #[arg(long)]
        curve: bool,

        /// Total number of training steps
        #[arg(long, default_value = "100000")]
        training_steps: u32,

        /// Number of training steps between each PSNR measurement
        #[arg(long, default_value = "1000")]
        steps_per_iteration: u32,

        /// CUDA devices to use
        #[arg(long, num_args = 1.., default_values_t = [0u32])]
        devices: Vec<u32>,

        /// Path to the output CSV file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the per-network-version 4 bpp .ntc fixtures
    MakeTestFiles {
        /// Source material, defaults to <sdk-root>/assets/materials/PavingStones070
        #[arg(long)]
        source: Option<PathBuf>,

        /// Output directory, defaults to <sdk-root>/assets/testfiles
        #[arg(long)]
        dest: Option<PathBuf>,

        /// CUDA devices to use
        #[arg(long, num_args = 1.., default_values_t = [0u32])]
        devices: Vec<u32>,
    },

    /// Run the end-to-end regression suite
    Selftest {
        /// CUDA device to run on
        #[arg(long)]
        device: Option<u32>,
    },

    /// PSNR between two images
    Compare {
        /// Reference image
        reference: PathBuf,

        /// Image to compare against the reference
        decoded: PathBuf,

        /// Drop channels the reference does not have
        #[arg(long)]
        ignore_extra_channels: bool,
    },

    /// List graphics adapters usable with --adapter
    Adapters {
        #[arg(long, value_enum, default_value = "vk")]
        graphics_api: GraphicsApi,
    },
}

/// Keeps the non-blocking log writer alive until exit
type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_logging(cli: &Cli) -> Result<LogGuard> {
    // Only initialize logging if asked for
    if !cli.verbose && cli.log_file.is_none() && std::env::var("RUST_LOG").is_err() {
        return Ok(None);
    }

    let directive = if cli.verbose { "ntc_harness=debug" } else { "ntc_harness=warn" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_task(path: &Path, tool: &Path) -> Result<Arguments> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task: {}", path.display()))?;
    let mut task: Arguments = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse task: {}", path.display()))?;
    if task.tool.as_os_str().is_empty() {
        task.tool = tool.to_path_buf();
    }
    Ok(task)
}

fn load_tasks(path: &Path, tool: &Path) -> Result<Vec<Arguments>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tasks: {}", path.display()))?;
    let mut tasks: Vec<Arguments> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse tasks: {}", path.display()))?;
    for task in &mut tasks {
        if task.tool.as_os_str().is_empty() {
            task.tool = tool.to_path_buf();
        }
    }
    Ok(tasks)
}

/// Prints one JSON line per finished task
struct JsonLines;

impl CompletionHandler<Arguments> for JsonLines {
    fn on_complete(
        &mut self,
        _task: &Arguments,
        result: &RunResult,
        total: usize,
        completed: usize,
    ) -> Result<()> {
        let line = serde_json::json!({
            "completed": completed,
            "total": total,
            "result": result,
        });
        println!("{}", line);
        Ok(())
    }

    fn on_failure(&mut self, task: &Arguments, error: &NtcError) {
        let input = task
            .load_images
            .as_ref()
            .or(task.load_compressed.as_ref())
            .or(task.load_manifest.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        eprintln!("FAILED {}: {}", input, error);
    }
}

fn finish_batch(outcome: &BatchOutcome) {
    eprintln!(
        "{} completed, {} failed, {} not run",
        outcome.completed,
        outcome.failed,
        outcome.skipped()
    );
    if outcome.aborted {
        eprintln!("Processing did not complete.");
        std::process::exit(EXIT_ABORTED);
    }
    if outcome.failed > 0 {
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let sdk = SdkLayout::new(&cli.sdk_root);
    let tool = || find_tool(cli.tool.as_deref(), Some(sdk.root()));

    match &cli.command {
        Commands::Run { task, device } => {
            let task = load_task(task, &tool()?)?;
            let result = run_on_device(&task, *device).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Batch { tasks, devices } => {
            let tasks = load_tasks(tasks, &tool()?)?;
            let outcome = process_concurrent_tasks(tasks, devices, &mut JsonLines).await?;
            finish_batch(&outcome);
        }

        Commands::Describe { file, graphics_api } => {
            if !file.is_file() {
                bail!("File not found: {}", file.display());
            }
            let args = Arguments {
                load_compressed: Some(file.clone()),
                describe: true,
                graphics_api: *graphics_api,
                ..Arguments::new(tool()?)
            };
            let result = run_on_device(&args, None).await?;

            println!("File: {}", file.display());
            if let (Some((w, h)), Some(c), Some(m)) = (result.dimensions, result.channels, result.mip_levels) {
                println!("Dimensions: {}x{}, {} channels, {} mip level(s)", w, h, c, m);
            }
            if let Some(bpp) = result.bits_per_pixel {
                println!("Bits per pixel: {}", bpp);
            }
            if let Some(shape) = result.latent_shape {
                println!(
                    "Latent shape: grid size scale {}, {} features",
                    shape.grid_size_scale, shape.num_features
                );
            }
            if !result.network_version.is_empty() {
                println!("Network version: {}", result.network_version);
            }
        }

        Commands::Study {
            dataset,
            limit,
            skip,
            stride,
            filter,
            experiments,
            mips,
            curve,
            training_steps,
            steps_per_iteration,
            devices,
            output,
        } => {
            let options = StudyOptions {
                tool: tool()?,
                dataset: dataset.clone().unwrap_or_else(|| sdk.dataset_dir()),
                selection: Selection {
                    stride: *stride,
                    skip: *skip,
                    limit: *limit,
                    filter: filter.as_deref().map(parse_filter).transpose()?,
                },
                experiments: match experiments {
                    Some(path) => Experiment::load(path)?,
                    None => Experiment::default_set(),
                },
                mips: *mips,
                curve: *curve,
                training_steps: *training_steps,
                steps_per_iteration: *steps_per_iteration,
                devices: devices.clone(),
                output: output.clone(),
            };

            let outcome = run_study(&options).await?;
            if outcome.aborted {
                if options.output.is_some() {
                    println!("Test aborted.");
                }
                std::process::exit(EXIT_ABORTED);
            }
        }

        Commands::MakeTestFiles {
            source,
            dest,
            devices,
        } => {
            let source = source
                .clone()
                .unwrap_or_else(|| sdk.material(REFERENCE_MATERIAL));
            let dest = dest.clone().unwrap_or_else(|| sdk.test_files_dir());
            let outcome = fixtures::make_test_files(&tool()?, &source, &dest, devices).await?;
            if outcome.aborted {
                std::process::exit(EXIT_ABORTED);
            }
            if outcome.failed > 0 {
                bail!("{} of {} test files failed", outcome.failed, outcome.total);
            }
        }

        Commands::Selftest { device } => {
            let mut ctx = SuiteContext::new(tool()?, sdk.clone());
            ctx.device = *device;
            let report = run_suite(&mut ctx, &default_cases()).await;
            if !report.success() {
                std::process::exit(1);
            }
        }

        Commands::Compare {
            reference,
            decoded,
            ignore_extra_channels,
        } => {
            let psnr = compute_psnr(reference, decoded, *ignore_extra_channels)?;
            println!("PSNR: {:.2} dB", psnr);
        }

        Commands::Adapters { graphics_api } => {
            let adapters = list_adapters(*graphics_api);
            if adapters.is_empty() {
                println!("No {} adapters found", graphics_api.reported_name());
            }
            for adapter in adapters {
                println!(
                    "{}: {} ({}, {})",
                    adapter.index, adapter.name, adapter.backend, adapter.device_type
                );
            }
        }
    }

    Ok(())
}
