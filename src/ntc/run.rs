//! Launching ntc-cli and collecting its result.

use std::future::Future;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

use super::arguments::Arguments;
use super::output::{parse_output, RunResult};
use crate::error::NtcError;

/// Run the tool with the task's own device setting
pub async fn run(args: &Arguments) -> Result<RunResult, NtcError> {
    run_on_device(args, None).await
}

/// Run the tool bound to `device` (passed as `--cudaDevice`).
///
/// Validation happens first, so a misconfigured task never spawns a process.
/// Exactly one child is started per call and the call returns once it exits.
/// On Unix the child gets its own process group.
pub async fn run_on_device(args: &Arguments, device: Option<u32>) -> Result<RunResult, NtcError> {
    args.validate()?;

    let command = args.command_line(device);
    debug!("Running: {}", command.join(" "));

    let mut cmd = Command::new(&args.tool);
    cmd.args(&command[1..]).stdin(Stdio::null());
    // Own process group, so a terminal Ctrl-C reaches only the harness and
    // running jobs are left to finish.
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let output = cmd
        .output()
        .await
        .map_err(|source| NtcError::Spawn {
            program: args.tool.clone(),
            source,
        })?;
    let elapsed = started.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        debug!("[ntc-cli] {}", line);
    }

    if !output.status.success() {
        warn!(
            "ntc-cli exited with {:?} after {:.2}s",
            output.status.code(),
            elapsed.as_secs_f64()
        );
        return Err(NtcError::Execution {
            command,
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    let mut result = parse_output(&stdout, args)?;
    result.elapsed = elapsed;
    Ok(result)
}

/// Something that can execute a task on a device.
///
/// The dispatcher is generic over this so batches can be driven without the
/// real tool.
pub trait Invoke: Sync {
    fn invoke(
        &self,
        args: &Arguments,
        device: u32,
    ) -> impl Future<Output = Result<RunResult, NtcError>> + Send;
}

/// Invokes the real ntc-cli
#[derive(Debug, Clone, Copy, Default)]
pub struct NtcCli;

impl Invoke for NtcCli {
    fn invoke(
        &self,
        args: &Arguments,
        device: u32,
    ) -> impl Future<Output = Result<RunResult, NtcError>> + Send {
        run_on_device(args, Some(device))
    }
}
