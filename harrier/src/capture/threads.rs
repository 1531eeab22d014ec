//! Thread spawning for receive workers.
//!
//! Each worker runs on its own named OS thread and reports back to the
//! main thread over a channel: a summary when it stops cleanly, an error
//! description when it fails.

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use tracing::{error, info};

use super::worker::{CaptureWorker, WorkerSummary};

/// Events sent from worker threads to the main thread.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum WorkerEvent {
    /// Worker exited cleanly after shutdown.
    Stopped(WorkerSummary),
    /// Worker died on a non-recoverable error.
    Failed { name: String, error: String },
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped(s) => write!(f, "stopped({}, {} pkts)", s.name, s.pkts),
            Self::Failed { name, error } => write!(f, "failed({name}, {error})"),
        }
    }
}

/// Spawn a receive worker on a dedicated thread.
///
/// The worker polls its rings until the shutdown flag is raised, then
/// emits its exit summary both to the log and over `event_tx`.
pub fn spawn_capture_worker(
    mut worker: CaptureWorker,
    event_tx: Sender<WorkerEvent>,
) -> io::Result<JoinHandle<()>> {
    let name = worker.name().to_string();
    thread::Builder::new().name(name.clone()).spawn(move || {
        match worker.run() {
            Ok(summary) => {
                info!(
                    event.name = "capture.worker.summary",
                    worker = %summary.name,
                    pkts = summary.pkts,
                    drops = summary.drops,
                    bytes = summary.bytes,
                    "kernel: packets, drops, bytes"
                );
                let _ = event_tx.send(WorkerEvent::Stopped(summary));
            }
            Err(e) => {
                error!(
                    event.name = "capture.worker.failed",
                    worker = %name,
                    error = %e,
                    "receive worker failed"
                );
                let _ = event_tx.send(WorkerEvent::Failed {
                    name,
                    error: e.to_string(),
                });
            }
        }
    })
}
