//! Driving the ntc-cli command line tool
//!
//! - `arguments`: task configuration and command line assembly
//! - `run`: one subprocess per task, with output capture
//! - `output`: interpretation of the tool's report lines
//! - `tool`: locating the executable

pub mod arguments;
pub mod output;
pub mod run;
pub mod tool;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use arguments::{Arguments, GraphicsApi, LatentShape};
pub use output::{parse_output, CompressionRun, GpuFeature, LearningSample, RunResult};
pub use run::{run, run_on_device, Invoke, NtcCli};
pub use tool::find_tool;
