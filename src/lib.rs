//! ntc-harness - batch driver for the ntc-cli texture compression tool
//!
//! Builds task configurations, runs them on a pool of GPUs with at most one
//! task per device, and turns the tool's reports into structured results.

pub mod dispatch;
pub mod error;
pub mod fixtures;
pub mod gpu;
pub mod hash;
pub mod imagediff;
pub mod ntc;
pub mod paths;
pub mod selftest;
pub mod study;

pub use dispatch::{process_concurrent_tasks, BatchOutcome, CompletionHandler, Dispatcher};
pub use error::{ErrorKind, NtcError};
pub use ntc::{run, run_on_device, Arguments, RunResult};
