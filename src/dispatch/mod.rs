//! Device-bound concurrent task dispatcher.
//!
//! Runs a batch of ntc-cli tasks with at most one task per device in flight.
//! Each device gets a worker that takes the lowest-index pending task from a
//! shared FIFO queue whenever its previous task settles. Finished tasks are
//! sent over a channel to a single aggregator, which calls the
//! [`CompletionHandler`] one result at a time.
//!
//! Cancellation is cooperative and only checked when a worker is about to
//! admit a task: tasks already running are left to finish.

pub mod progress;

use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::NtcError;
use crate::ntc::{Arguments, Invoke, NtcCli, RunResult};

pub use progress::{batch_progress_bar, estimate_remaining, format_duration, BatchClock};

/// Receives the outcome of every task in a batch.
///
/// Calls are serialized; no two handler calls ever overlap.
pub trait CompletionHandler<T> {
    /// Called once per successful task with the batch size and the running
    /// completion count (1, 2, 3, ... in completion order).
    ///
    /// Returning an error cancels the rest of the batch.
    fn on_complete(
        &mut self,
        task: &T,
        result: &RunResult,
        total: usize,
        completed: usize,
    ) -> anyhow::Result<()>;

    /// Called once per failed task. The batch keeps going.
    fn on_failure(&mut self, _task: &T, error: &NtcError) {
        warn!("Task failed: {}", error);
    }
}

impl<T, F> CompletionHandler<T> for F
where
    F: FnMut(&T, &RunResult, usize, usize) -> anyhow::Result<()>,
{
    fn on_complete(
        &mut self,
        task: &T,
        result: &RunResult,
        total: usize,
        completed: usize,
    ) -> anyhow::Result<()> {
        self(task, result, total, completed)
    }
}

/// Final tallies of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Cancellation was requested before the batch drained
    pub aborted: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchOutcome {
    /// Tasks that were never admitted
    pub fn skipped(&self) -> usize {
        self.total.saturating_sub(self.completed + self.failed)
    }
}

/// A task that has left its device
struct Settled<T> {
    index: usize,
    device: u32,
    task: T,
    result: Result<RunResult, NtcError>,
}

/// A fixed pool of device slots.
///
/// The cancellation token is shared by every batch run on this dispatcher;
/// once cancelled, later batches admit nothing.
pub struct Dispatcher<R = NtcCli> {
    devices: Vec<u32>,
    runner: R,
    cancel: CancellationToken,
}

impl Dispatcher<NtcCli> {
    /// Dispatcher that launches the real tool
    pub fn new(devices: &[u32]) -> Result<Self, NtcError> {
        Self::with_runner(devices, NtcCli)
    }
}

impl<R: Invoke> Dispatcher<R> {
    /// Duplicate device ids are dropped so no device is bound twice.
    pub fn with_runner(devices: &[u32], runner: R) -> Result<Self, NtcError> {
        let mut unique: Vec<u32> = Vec::with_capacity(devices.len());
        for &device in devices {
            if unique.contains(&device) {
                warn!(device, "Device listed more than once, ignoring duplicate");
            } else {
                unique.push(device);
            }
        }
        if unique.is_empty() {
            return Err(NtcError::config("at least one device is required"));
        }

        Ok(Self {
            devices: unique,
            runner,
            cancel: CancellationToken::new(),
        })
    }

    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    /// Token that stops admission of further tasks when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every task, at most one per device at a time.
    ///
    /// Returns once all admitted tasks have settled.
    pub async fn run<T, H>(&self, tasks: Vec<T>, handler: &mut H) -> BatchOutcome
    where
        T: AsRef<Arguments>,
        H: CompletionHandler<T> + ?Sized,
    {
        let total = tasks.len();
        info!(tasks = total, devices = self.devices.len(), "Starting batch");

        let queue = Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, mut rx) = mpsc::unbounded_channel::<Settled<T>>();

        let workers = futures::future::join_all(
            self.devices
                .iter()
                .map(|&device| self.worker(device, &queue, tx.clone())),
        );
        // Workers hold the only senders, so the aggregator ends when they do
        drop(tx);

        let aggregate = async {
            let mut outcome = BatchOutcome {
                total,
                ..Default::default()
            };
            while let Some(settled) = rx.recv().await {
                match settled.result {
                    Ok(result) => {
                        outcome.completed += 1;
                        debug!(
                            index = settled.index,
                            device = settled.device,
                            completed = outcome.completed,
                            "Task completed"
                        );
                        if let Err(e) =
                            handler.on_complete(&settled.task, &result, total, outcome.completed)
                        {
                            error!(index = settled.index, "Completion handler failed: {:#}", e);
                            self.cancel.cancel();
                        }
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        debug!(
                            index = settled.index,
                            device = settled.device,
                            kind = ?e.kind(),
                            "Task failed"
                        );
                        handler.on_failure(&settled.task, &e);
                    }
                }
            }
            outcome
        };

        let (_, mut outcome) = tokio::join!(workers, aggregate);
        outcome.aborted = self.cancel.is_cancelled();

        if outcome.aborted {
            warn!(
                completed = outcome.completed,
                failed = outcome.failed,
                skipped = outcome.skipped(),
                "Batch aborted"
            );
        } else {
            info!(
                completed = outcome.completed,
                failed = outcome.failed,
                "Batch finished"
            );
        }
        outcome
    }

    async fn worker<T: AsRef<Arguments>>(
        &self,
        device: u32,
        queue: &Mutex<VecDeque<(usize, T)>>,
        tx: mpsc::UnboundedSender<Settled<T>>,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(device, "Cancelled, not admitting further tasks");
                break;
            }
            let Some((index, task)) = queue.lock().await.pop_front() else {
                break;
            };

            debug!(index, device, "Task admitted");
            let result = self.runner.invoke(task.as_ref(), device).await;

            let settled = Settled {
                index,
                device,
                task,
                result,
            };
            if tx.send(settled).is_err() {
                break;
            }
        }
    }
}

/// Run `tasks` on the real tool across `devices`.
///
/// Ctrl-C stops admission for the duration of the batch; running tasks are
/// allowed to finish and the outcome reports `aborted`.
///
/// Once installed, tokio's SIGINT handler stays registered for the life of
/// the process. After the first batch returns, Ctrl-C no longer terminates
/// the process by default, so callers that keep working afterwards must
/// check for it themselves. The binary exits as soon as its command is done.
pub async fn process_concurrent_tasks<T, H>(
    tasks: Vec<T>,
    devices: &[u32],
    handler: &mut H,
) -> Result<BatchOutcome, NtcError>
where
    T: AsRef<Arguments>,
    H: CompletionHandler<T> + ?Sized,
{
    let dispatcher = Dispatcher::new(devices)?;

    let token = dispatcher.cancellation_token();
    let listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("SIGINT received, stopping.");
            token.cancel();
        }
    });

    let outcome = dispatcher.run(tasks, handler).await;
    listener.abort();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps instead of launching a process and records device usage.
    ///
    /// The task id travels in `random_seed`, the sleep in `training_steps`
    /// (milliseconds), and `debug` makes the task fail.
    #[derive(Default)]
    struct FakeRunner {
        running: AtomicUsize,
        max_running: AtomicUsize,
        busy: std::sync::Mutex<HashSet<u32>>,
        device_clash: AtomicBool,
        started: std::sync::Mutex<Vec<u32>>,
    }

    impl FakeRunner {
        fn started(&self) -> Vec<u32> {
            self.started.lock().unwrap().clone()
        }
    }

    impl Invoke for FakeRunner {
        fn invoke(
            &self,
            args: &Arguments,
            device: u32,
        ) -> impl std::future::Future<Output = Result<RunResult, NtcError>> + Send {
            async move {
                let id = args.random_seed.unwrap_or_default();
                self.started.lock().unwrap().push(id);
                if !self.busy.lock().unwrap().insert(device) {
                    self.device_clash.store(true, Ordering::SeqCst);
                }
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_running.fetch_max(now, Ordering::SeqCst);

                let millis = args.training_steps.unwrap_or(20) as u64;
                tokio::time::sleep(Duration::from_millis(millis)).await;

                self.running.fetch_sub(1, Ordering::SeqCst);
                self.busy.lock().unwrap().remove(&device);

                if args.debug {
                    return Err(NtcError::Execution {
                        command: vec!["ntc-cli".into()],
                        code: Some(1),
                        stdout: String::new(),
                        stderr: format!("task {} failed", id),
                    });
                }
                Ok(RunResult {
                    overall_psnr: Some(30.0 + id as f64),
                    ..Default::default()
                })
            }
        }
    }

    fn task(id: u32, millis: u32) -> Arguments {
        Arguments {
            compress: true,
            random_seed: Some(id),
            training_steps: Some(millis),
            ..Arguments::new("ntc-cli")
        }
    }

    #[derive(Default)]
    struct Recorder {
        completions: Vec<(u32, usize, usize)>,
        failures: Vec<u32>,
    }

    impl CompletionHandler<Arguments> for Recorder {
        fn on_complete(
            &mut self,
            task: &Arguments,
            _result: &RunResult,
            total: usize,
            completed: usize,
        ) -> anyhow::Result<()> {
            self.completions
                .push((task.random_seed.unwrap_or_default(), total, completed));
            Ok(())
        }

        fn on_failure(&mut self, task: &Arguments, _error: &NtcError) {
            self.failures.push(task.random_seed.unwrap_or_default());
        }
    }

    #[test]
    fn test_devices_are_required_and_deduplicated() {
        assert!(matches!(
            Dispatcher::with_runner(&[], FakeRunner::default()),
            Err(NtcError::Configuration(_))
        ));

        let dispatcher = Dispatcher::with_runner(&[2, 0, 2, 1, 0], FakeRunner::default()).unwrap();
        assert_eq!(dispatcher.devices(), &[2, 0, 1]);
    }

    #[tokio::test]
    async fn test_fewer_tasks_than_devices_run_fully_concurrently() {
        let dispatcher = Dispatcher::with_runner(&[0, 1, 2, 3], FakeRunner::default()).unwrap();
        let tasks: Vec<_> = (0..3).map(|i| task(i, 100)).collect();

        let mut recorder = Recorder::default();
        let outcome = dispatcher.run(tasks, &mut recorder).await;

        assert_eq!(dispatcher.runner.max_running.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.completed, 3);
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn test_twenty_tasks_on_four_devices() {
        let dispatcher = Dispatcher::with_runner(&[0, 1, 2, 3], FakeRunner::default()).unwrap();
        let tasks: Vec<_> = (0..20).map(|i| task(i, 10 + (i % 3) * 15)).collect();

        let mut recorder = Recorder::default();
        let outcome = dispatcher.run(tasks, &mut recorder).await;

        assert_eq!(
            outcome,
            BatchOutcome {
                aborted: false,
                total: 20,
                completed: 20,
                failed: 0
            }
        );
        assert_eq!(dispatcher.runner.max_running.load(Ordering::SeqCst), 4);
        assert!(!dispatcher.runner.device_clash.load(Ordering::SeqCst));

        let counts: Vec<usize> = recorder.completions.iter().map(|c| c.2).collect();
        assert_eq!(counts, (1..=20).collect::<Vec<_>>());
        assert!(recorder.completions.iter().all(|c| c.1 == 20));

        let mut ids: Vec<u32> = recorder.completions.iter().map(|c| c.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let dispatcher = Dispatcher::with_runner(&[5], FakeRunner::default()).unwrap();
        let tasks: Vec<_> = (0..6).map(|i| task(i, 5)).collect();

        let mut recorder = Recorder::default();
        dispatcher.run(tasks, &mut recorder).await;

        assert_eq!(dispatcher.runner.started(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(dispatcher.runner.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_batch_continues() {
        let dispatcher = Dispatcher::with_runner(&[0, 1], FakeRunner::default()).unwrap();
        let tasks: Vec<_> = (0..10)
            .map(|i| Arguments {
                debug: i == 3 || i == 7,
                ..task(i, 10)
            })
            .collect();

        let mut recorder = Recorder::default();
        let outcome = dispatcher.run(tasks, &mut recorder).await;

        assert_eq!(outcome.completed, 8);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.skipped(), 0);
        assert!(!outcome.aborted);

        recorder.failures.sort_unstable();
        assert_eq!(recorder.failures, vec![3, 7]);
        assert_eq!(recorder.completions.len(), 8);
        assert_eq!(recorder.completions.last().map(|c| c.2), Some(8));
    }

    #[tokio::test]
    async fn test_cancellation_stops_admission() {
        let dispatcher = Dispatcher::with_runner(&[0, 1], FakeRunner::default()).unwrap();
        let token = dispatcher.cancellation_token();
        // Task 0 finishes long before task 1, so the signal lands while
        // task 1 is still running
        let tasks: Vec<_> = (0..10).map(|i| task(i, if i == 0 { 10 } else { 150 })).collect();

        let mut handler = |_: &Arguments, _: &RunResult, _: usize, _: usize| -> anyhow::Result<()> {
            token.cancel();
            Ok(())
        };
        let outcome = dispatcher.run(tasks, &mut handler).await;

        assert!(outcome.aborted);
        // Tasks 0 and 1, plus at most one admitted before the handler ran
        let started = dispatcher.runner.started().len();
        assert!(started <= 3, "started {} tasks", started);
        assert_eq!(outcome.completed, started);
        assert!(outcome.skipped() >= 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_admits_nothing() {
        let dispatcher = Dispatcher::with_runner(&[0, 1], FakeRunner::default()).unwrap();
        dispatcher.cancellation_token().cancel();

        let mut recorder = Recorder::default();
        let outcome = dispatcher.run(vec![task(0, 5), task(1, 5)], &mut recorder).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.skipped(), 2);
        assert!(dispatcher.runner.started().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_cancels_batch() {
        let dispatcher = Dispatcher::with_runner(&[0], FakeRunner::default()).unwrap();
        let tasks: Vec<_> = (0..5).map(|i| task(i, 5)).collect();

        let mut calls = 0;
        let mut handler = |_: &Arguments, _: &RunResult, _: usize, _: usize| -> anyhow::Result<()> {
            calls += 1;
            anyhow::bail!("disk full")
        };
        let outcome = dispatcher.run(tasks, &mut handler).await;

        assert!(outcome.aborted);
        assert!(outcome.completed < 5);
        assert_eq!(calls, outcome.completed);
    }

    /// Tasks can carry their own identity alongside the arguments
    struct Labeled {
        name: &'static str,
        args: Arguments,
    }

    impl AsRef<Arguments> for Labeled {
        fn as_ref(&self) -> &Arguments {
            &self.args
        }
    }

    #[tokio::test]
    async fn test_custom_task_type() {
        let dispatcher = Dispatcher::with_runner(&[0, 1], FakeRunner::default()).unwrap();
        let tasks = vec![
            Labeled { name: "Bricks", args: task(0, 5) },
            Labeled { name: "Stones", args: task(1, 5) },
        ];

        let mut names = Vec::new();
        let mut handler = |t: &Labeled, r: &RunResult, _: usize, _: usize| -> anyhow::Result<()> {
            names.push((t.name, r.overall_psnr));
            Ok(())
        };
        dispatcher.run(tasks, &mut handler).await;

        names.sort_by_key(|n| n.0);
        assert_eq!(names, vec![("Bricks", Some(30.0)), ("Stones", Some(31.0))]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_invocations_with_misconfigured_task() {
        use crate::ntc::testing::write_fake_tool;
        use tempfile::TempDir;

        let temp = TempDir::new().unwrap();
        let tool = write_fake_tool(
            temp.path(),
            "echo \"Dimensions: 256x256, 4 channels, 9 mip level(s)\"\n",
        );

        let describe = Arguments {
            load_compressed: Some(temp.path().join("a.ntc")),
            describe: true,
            ..Arguments::new(&tool)
        };
        let mismatched = Arguments {
            load_images: Some(temp.path().join("images")),
            ..describe.clone()
        };

        let dispatcher = Dispatcher::new(&[0, 1]).unwrap();
        let mut recorder = Recorder::default();
        let outcome = dispatcher
            .run(vec![describe.clone(), mismatched, describe], &mut recorder)
            .await;

        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.aborted);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_tool_runs_outside_harness_process_group() {
        use crate::ntc::testing::write_fake_tool;
        use tempfile::TempDir;

        let temp = TempDir::new().unwrap();
        let groups = temp.path().join("groups");
        let tool = write_fake_tool(
            temp.path(),
            &format!(
                r#"
read -r _ _ _ _ own _ < /proc/$$/stat
read -r _ _ _ _ parent _ < /proc/$PPID/stat
echo "$own $parent" >> "{}"
sleep 0.2
echo "Dimensions: 256x256, 4 channels, 9 mip level(s)"
"#,
                groups.display()
            ),
        );

        let describe = Arguments {
            load_compressed: Some(temp.path().join("a.ntc")),
            describe: true,
            ..Arguments::new(&tool)
        };

        let dispatcher = Dispatcher::new(&[0, 1]).unwrap();
        let mut recorder = Recorder::default();
        let outcome = dispatcher
            .run(vec![describe.clone(), describe], &mut recorder)
            .await;
        assert_eq!(outcome.completed, 2);

        let content = std::fs::read_to_string(&groups).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let (own, parent) = line.split_once(' ').unwrap();
            assert_ne!(own, parent, "tool shares the harness process group");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_consecutive_batches_with_signal_listener() {
        use crate::ntc::testing::write_fake_tool;
        use tempfile::TempDir;

        let temp = TempDir::new().unwrap();
        let tool = write_fake_tool(
            temp.path(),
            "echo \"Dimensions: 256x256, 4 channels, 9 mip level(s)\"\n",
        );
        let describe = Arguments {
            load_compressed: Some(temp.path().join("a.ntc")),
            describe: true,
            ..Arguments::new(&tool)
        };

        for _ in 0..2 {
            let mut recorder = Recorder::default();
            let outcome =
                process_concurrent_tasks(vec![describe.clone(); 3], &[0, 1], &mut recorder)
                    .await
                    .unwrap();
            assert_eq!(outcome.completed, 3);
            assert!(!outcome.aborted);
        }
    }
}
