//! Job reporter: a small actor that owns the cache's job statistics.
//!
//! Background tasks send `Begin`/`End`; anyone can ask for a `Report`.
//! [`ReporterState::apply`] is the whole state machine and is driven
//! synchronously in tests.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Drain,
    Materialize,
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub enum ReporterCommand {
    Begin { job: JobKind },
    End { job: JobKind, outcome: Outcome, bytes: u64 },
    Report { reply: oneshot::Sender<JobReport> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub active: u64,
    pub ok: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub jobs: BTreeMap<JobKind, JobStats>,
}

impl JobReport {
    pub fn get(&self, job: JobKind) -> JobStats {
        self.jobs.get(&job).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct ReporterState {
    report: JobReport,
}

impl ReporterState {
    pub fn apply(&mut self, cmd: ReporterCommand) {
        match cmd {
            ReporterCommand::Begin { job } => {
                self.report.jobs.entry(job).or_default().active += 1;
            }
            ReporterCommand::End {
                job,
                outcome,
                bytes,
            } => {
                let stats = self.report.jobs.entry(job).or_default();
                // An End without a Begin is a caller bug, not a reason to underflow.
                stats.active = stats.active.saturating_sub(1);
                match outcome {
                    Outcome::Ok => stats.ok += 1,
                    Outcome::Failed => stats.failed += 1,
                    Outcome::Cancelled => stats.cancelled += 1,
                }
                stats.bytes += bytes;
            }
            ReporterCommand::Report { reply } => {
                let _ = reply.send(self.report.clone());
            }
        }
    }

    pub fn snapshot(&self) -> &JobReport {
        &self.report
    }
}

/// Cloneable handle to the running actor.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<ReporterCommand>,
}

impl Reporter {
    /// Spawn the actor on the current runtime. It stops when every handle is dropped.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut state = ReporterState::default();
            while let Some(cmd) = rx.recv().await {
                state.apply(cmd);
            }
            debug!("job reporter stopped");
        });
        Self { tx }
    }

    pub fn begin(&self, job: JobKind) {
        let _ = self.tx.send(ReporterCommand::Begin { job });
    }

    pub fn end(&self, job: JobKind, outcome: Outcome, bytes: u64) {
        let _ = self.tx.send(ReporterCommand::End {
            job,
            outcome,
            bytes,
        });
    }

    pub async fn report(&self) -> JobReport {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ReporterCommand::Report { reply }).is_err() {
            return JobReport::default();
        }
        rx.await.unwrap_or_default()
    }
}
