//! Run control.
//!
//! Pause, resume and abort requests for the run in flight. The sequencer calls
//! [`RunControl::checkpoint`] before every device command; that is the only place a
//! request takes effect, so a command is never interrupted halfway. A paused run parks at
//! the checkpoint until it is resumed or aborted.
//!
//! Requests belong to one run. Starting a new run clears whatever was left over.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;

/// The pending request for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRequest {
    Proceed,
    Pause,
    Abort,
}

/// Returned by a checkpoint when the run must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

/// Shared request flag between the engine and the sequencer.
#[derive(Debug)]
pub struct RunControl {
    request: watch::Sender<RunRequest>,
    parked: AtomicBool,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// No request pending, nothing parked.
    pub fn new() -> Self {
        let (request, _) = watch::channel(RunRequest::Proceed);
        Self {
            request,
            parked: AtomicBool::new(false),
        }
    }

    /// The request the next checkpoint will see.
    pub fn request(&self) -> RunRequest {
        *self.request.borrow()
    }

    /// True while a run is parked at a checkpoint.
    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    /// Ask the run to stop at its next checkpoint. Returns false if it was already stopping.
    pub fn pause(&self) -> bool {
        self.request.send_if_modified(|request| {
            let changed = *request == RunRequest::Proceed;
            if changed {
                *request = RunRequest::Pause;
            }
            changed
        })
    }

    /// Release a paused run. Returns false if nothing was paused.
    pub fn resume(&self) -> bool {
        self.request.send_if_modified(|request| {
            let changed = *request == RunRequest::Pause;
            if changed {
                *request = RunRequest::Proceed;
            }
            changed
        })
    }

    /// Stop the run at its next checkpoint, paused or not.
    pub fn abort(&self) {
        self.request.send_replace(RunRequest::Abort);
    }

    pub(crate) fn reset(&self) {
        self.request.send_replace(RunRequest::Proceed);
        self.parked.store(false, Ordering::Release);
    }

    /// Wait out a pause and consume an abort.
    pub(crate) async fn checkpoint(&self) -> Result<(), Aborted> {
        let mut requests = self.request.subscribe();
        let mut request = *requests.borrow_and_update();

        if request == RunRequest::Pause {
            self.parked.store(true, Ordering::Release);
            tracing::info!("Run paused");
            request = match requests.wait_for(|r| *r != RunRequest::Pause).await {
                Ok(current) => *current,
                Err(_) => RunRequest::Abort,
            };
            self.parked.store(false, Ordering::Release);
        }

        match request {
            RunRequest::Abort => {
                self.request.send_replace(RunRequest::Proceed);
                tracing::warn!("Run aborted");
                Err(Aborted)
            }
            RunRequest::Proceed | RunRequest::Pause => Ok(()),
        }
    }
}
