//! Background execution of one encoder + packager run.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineHandles;
use crate::stop::StopStrategy;

/// Pids of the running pipeline processes.
#[derive(Debug, Clone, Copy)]
pub struct ProcessIds {
    pub encoder: Option<u32>,
    pub packager: Option<u32>,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// True when the run ended because it was cancelled via [`TranscodeRunner::cancel`].
    pub stopped: bool,
    pub encoder_exit: Option<i32>,
    pub packager_exit: Option<i32>,
    /// Most recent stderr lines from both processes, for error context.
    pub stderr_tail: Vec<String>,
}

impl RunOutcome {
    /// A run that ran to completion with both processes exiting cleanly.
    pub fn clean(&self) -> bool {
        self.stopped || (self.encoder_exit == Some(0) && self.packager_exit == Some(0))
    }
}

pub type StartedCallback = Box<dyn FnOnce(ProcessIds) + Send>;
pub type CompletedCallback = Box<dyn FnOnce(RunOutcome) + Send>;

/// Runs the pipeline processes on a background task.
///
/// The task blocks on process exit; cancellation applies the stop ladder.
/// `on_started` fires once the task is live, `on_completed` fires exactly
/// once with the outcome.
pub struct TranscodeRunner {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TranscodeRunner {
    /// Spawn the background unit for already-started pipeline processes.
    pub fn spawn(
        handles: PipelineHandles,
        stop: StopStrategy,
        on_started: StartedCallback,
        on_completed: CompletedCallback,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let PipelineHandles {
                mut encoder,
                mut packager,
                encoder_pid,
                packager_pid,
                stderr_tail,
            } = handles;

            on_started(ProcessIds {
                encoder: encoder_pid,
                packager: packager_pid,
            });

            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Run cancelled, stopping pipeline");
                    let (enc, pack) = stop.stop_pipeline(&mut encoder, &mut packager).await;
                    RunOutcome {
                        stopped: true,
                        encoder_exit: enc.exit_code,
                        packager_exit: pack.exit_code,
                        stderr_tail: Vec::new(),
                    }
                }
                status = encoder.wait() => {
                    let encoder_exit = match status {
                        Ok(status) => {
                            if !status.success() {
                                warn!(%status, "Encoder exited abnormally");
                            }
                            status.code()
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to wait for encoder");
                            Some(-1)
                        }
                    };

                    // Give the packager time to consume the pipe EOFs and
                    // finalize the manifest, then escalate if it lingers.
                    let packager_exit = match process_utils::wait_with_timeout(
                        &mut packager,
                        stop.drain_timeout(),
                    )
                    .await
                    {
                        Ok(Some(status)) => status.code(),
                        Ok(None) => {
                            warn!("Packager did not drain in time");
                            stop.stop_process("packager", &mut packager).await.exit_code
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to wait for packager");
                            Some(-1)
                        }
                    };

                    RunOutcome {
                        stopped: false,
                        encoder_exit,
                        packager_exit,
                        stderr_tail: Vec::new(),
                    }
                }
            };

            let outcome = RunOutcome {
                stderr_tail: stderr_tail.lock().iter().cloned().collect(),
                ..outcome
            };

            info!(
                stopped = outcome.stopped,
                encoder_exit = ?outcome.encoder_exit,
                packager_exit = ?outcome.packager_exit,
                "Run finished"
            );
            on_completed(outcome);
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request cancellation; the stop ladder runs on the background task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Join the background unit, bounded by `timeout`.
    /// Returns false when the task did not finish in time.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Runner join timed out");
                false
            }
        }
    }
}
