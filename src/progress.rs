//! Phase/progress event stream and the reporter task that renders it.
//!
//! Events are pushed through an unbounded channel so emission never blocks
//! the orchestrator; the reporter catches up opportunistically. Reporter
//! state is derived entirely from the stream, nothing is persisted.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Phases of the backup and restore state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Precheck,
    HooksPre,
    CaptureState,
    Archive,
    HooksPost,
    SelectArchive,
    Extract,
    HooksPreRestore,
    ApplyState,
    HooksPostRestore,
    Done,
    Failed,
    /// Standalone repository maintenance (info, delete, clear-all), outside
    /// any backup or restore job.
    Repository,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Precheck => "precheck",
            Phase::HooksPre => "hooks-pre",
            Phase::CaptureState => "capture-state",
            Phase::Archive => "archive",
            Phase::HooksPost => "hooks-post",
            Phase::SelectArchive => "select-archive",
            Phase::Extract => "extract",
            Phase::HooksPreRestore => "hooks-pre-restore",
            Phase::ApplyState => "apply-state",
            Phase::HooksPostRestore => "hooks-post-restore",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Repository => "repository",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Started,
    /// n-of-m style progress for phases with countable units.
    Progress { done: u64, total: u64 },
    /// A raw output line from the underlying engine.
    Output(String),
    Completed,
    Failed(String),
}

/// Never mutated after emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub status: PhaseStatus,
}

pub type EventSender = mpsc::UnboundedSender<PhaseEvent>;

/// Single-threaded renderer for the event stream. Spawned once per job.
pub struct ProgressReporter {
    rx: mpsc::UnboundedReceiver<PhaseEvent>,
}

impl ProgressReporter {
    pub fn channel() -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Drain the stream until all senders are dropped. Rendering happens on
    /// this task only, so output lines never interleave.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_percent: Option<u8> = None;
            while let Some(event) = self.rx.recv().await {
                render(&event, &mut last_percent);
            }
        })
    }
}

fn render(event: &PhaseEvent, last_percent: &mut Option<u8>) {
    match &event.status {
        PhaseStatus::Started => {
            *last_percent = None;
            info!(phase = %event.phase, "phase started");
        }
        PhaseStatus::Progress { done, total } => {
            info!(phase = %event.phase, "{done}/{total}");
        }
        PhaseStatus::Output(line) => {
            if let Some(pct) = extract_percent(line) {
                // Engines repeat the same percentage many times per second;
                // only render changes.
                if *last_percent != Some(pct) {
                    *last_percent = Some(pct);
                    info!(phase = %event.phase, "{pct}%");
                }
            } else if !line.trim().is_empty() {
                info!(phase = %event.phase, "{}", line.trim_end());
            }
        }
        PhaseStatus::Completed => {
            info!(phase = %event.phase, "phase completed");
        }
        PhaseStatus::Failed(msg) => {
            warn!(phase = %event.phase, "phase failed: {msg}");
        }
    }
}

/// Pull a `NN%` figure out of an engine output line, if present.
fn extract_percent(line: &str) -> Option<u8> {
    let idx = line.find('%')?;
    let digits: String = line[..idx]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    let value: u32 = digits.parse().ok()?;
    if value <= 100 {
        Some(value as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_percent_from_engine_lines() {
        assert_eq!(extract_percent("12.5 GB O 11.2 GB C 45% /var/lib"), Some(45));
        assert_eq!(extract_percent("100% done"), Some(100));
        assert_eq!(extract_percent("no figure here"), None);
        assert_eq!(extract_percent("%"), None);
        assert_eq!(extract_percent("999% bogus"), None);
    }

    #[tokio::test]
    async fn reporter_drains_stream_and_exits_when_senders_drop() {
        let (tx, reporter) = ProgressReporter::channel();
        let handle = reporter.spawn();

        tx.send(PhaseEvent {
            phase: Phase::Archive,
            status: PhaseStatus::Started,
        })
        .unwrap();
        tx.send(PhaseEvent {
            phase: Phase::Archive,
            status: PhaseStatus::Output("43% of it".to_string()),
        })
        .unwrap();
        tx.send(PhaseEvent {
            phase: Phase::Archive,
            status: PhaseStatus::Completed,
        })
        .unwrap();
        drop(tx);

        // The task must terminate on its own once the channel closes.
        handle.await.unwrap();
    }
}
