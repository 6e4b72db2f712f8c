//! Graceful-to-forceful process shutdown escalation.

use std::time::Duration;

use process_utils::{ShutdownSignal, send_signal, wait_with_timeout};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::{debug, error, warn};

/// Escalating stop sequence: SIGINT, then SIGTERM, then SIGKILL, each with a
/// bounded wait, strictly in that order.
///
/// The encoder is stopped before the packager so the packager can drain the
/// pipes before its own shutdown. Single-signal shutdown has been observed to
/// be insufficient for encoder processes mid-write, hence the ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopStrategy {
    /// Wait after SIGINT in seconds.
    pub interrupt_timeout_secs: f64,
    /// Wait after SIGTERM in seconds.
    pub terminate_timeout_secs: f64,
    /// Wait after SIGKILL in seconds.
    pub kill_timeout_secs: f64,
    /// How long the packager gets to drain the pipes and exit on its own
    /// after the encoder finished, before the ladder is applied to it too.
    pub drain_timeout_secs: f64,
}

impl Default for StopStrategy {
    fn default() -> Self {
        Self {
            interrupt_timeout_secs: 5.0,
            terminate_timeout_secs: 3.0,
            kill_timeout_secs: 2.0,
            drain_timeout_secs: 10.0,
        }
    }
}

/// What one escalation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Signals delivered, in order.
    pub signals_sent: Vec<&'static str>,
    /// Last observed exit code; `None` when the process died from a signal
    /// or never exited within the budgets.
    pub exit_code: Option<i32>,
}

impl StopStrategy {
    /// Drain budget as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout_secs)
    }

    fn ladder(&self) -> [(ShutdownSignal, Duration); 3] {
        [
            (
                ShutdownSignal::Interrupt,
                Duration::from_secs_f64(self.interrupt_timeout_secs),
            ),
            (
                ShutdownSignal::Terminate,
                Duration::from_secs_f64(self.terminate_timeout_secs),
            ),
            (
                ShutdownSignal::Kill,
                Duration::from_secs_f64(self.kill_timeout_secs),
            ),
        ]
    }

    /// Stop one process, escalating through the full ladder as needed.
    pub async fn stop_process(&self, name: &'static str, child: &mut Child) -> StopReport {
        let mut report = StopReport {
            signals_sent: Vec::new(),
            exit_code: None,
        };

        // Already exited (e.g. crashed before the stop request).
        if let Ok(Some(status)) = child.try_wait() {
            report.exit_code = status.code();
            return report;
        }

        for (signal, timeout) in self.ladder() {
            debug!(process = name, signal = %signal, "Stopping process");
            if let Err(e) = send_signal(child, signal) {
                warn!(process = name, signal = %signal, error = %e, "Signal delivery failed");
            }
            report.signals_sent.push(signal.as_str());

            match wait_with_timeout(child, timeout).await {
                Ok(Some(status)) => {
                    debug!(process = name, signal = %signal, ?status, "Process exited");
                    report.exit_code = status.code();
                    return report;
                }
                Ok(None) => {
                    warn!(
                        process = name,
                        signal = %signal,
                        timeout_secs = timeout.as_secs_f64(),
                        "Process survived signal"
                    );
                }
                Err(e) => {
                    warn!(process = name, error = %e, "Wait failed");
                }
            }
        }

        // Even SIGKILL did not reap it within the budget. Report, don't retry.
        error!(
            process = name,
            "Process did not exit after full escalation; using last known exit code"
        );
        report
    }

    /// Stop the encoder, then the packager.
    pub async fn stop_pipeline(
        &self,
        encoder: &mut Child,
        packager: &mut Child,
    ) -> (StopReport, StopReport) {
        let encoder_report = self.stop_process("encoder", encoder).await;
        let packager_report = self.stop_process("packager", packager).await;
        (encoder_report, packager_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_strategy() -> StopStrategy {
        StopStrategy {
            interrupt_timeout_secs: 0.2,
            terminate_timeout_secs: 0.2,
            kill_timeout_secs: 1.0,
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_polite_process_stops_on_interrupt() {
        let mut child = process_utils::tokio_command("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let report = fast_strategy().stop_process("test", &mut child).await;
        assert_eq!(report.signals_sent, vec!["SIGINT"]);
        // Killed by signal: no exit code.
        assert_eq!(report.exit_code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escalates_strictly_to_kill() {
        // A shell that ignores INT and TERM only dies to KILL.
        let mut child = process_utils::tokio_command("sh")
            .arg("-c")
            .arg("trap '' INT TERM; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();

        let report = fast_strategy().stop_process("test", &mut child).await;
        assert_eq!(report.signals_sent, vec!["SIGINT", "SIGTERM", "SIGKILL"]);
        assert_eq!(report.exit_code, None);
        // Process is really gone.
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_already_exited_process() {
        let mut child = process_utils::tokio_command("true").spawn().unwrap();
        // Let it finish first.
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let report = fast_strategy().stop_process("test", &mut child).await;
        assert!(report.signals_sent.is_empty());
        assert_eq!(report.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_pipeline_order() {
        let mut encoder = process_utils::tokio_command("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let mut packager = process_utils::tokio_command("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let (enc, pack) = fast_strategy()
            .stop_pipeline(&mut encoder, &mut packager)
            .await;
        assert_eq!(enc.signals_sent, vec!["SIGINT"]);
        assert_eq!(pack.signals_sent, vec!["SIGINT"]);
    }
}
