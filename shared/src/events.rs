use thiserror::Error;

use crate::types::ItemId;

/// Events a running task publishes to its caller, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Percent complete, 0-100. Not guaranteed to be monotonic.
    Progress(u8),
    Log(String),
    /// One input item has been fully processed.
    ItemDone(ItemId),
    /// Always the last event of a run.
    Finished(Finished),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub cancelled: bool,
    pub error: Option<TaskError>,
}

impl Finished {
    pub fn completed() -> Self {
        Self {
            cancelled: false,
            error: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            error: None,
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            cancelled: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.error.is_none()
    }
}

/// Abnormal termination of the inference routine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("inference panicked: {0}")]
    Panicked(String),
}

/// Returned by a routine that stopped early because cancellation was
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Hooks the inference routine reports through while it runs.
///
/// Calls happen on the routine's own thread. Implementations forward them
/// elsewhere; they must not block for long.
pub trait JobListener: Send {
    fn on_progress(&mut self, percent: u8);

    fn on_item_done(&mut self, item: &ItemId);

    fn on_log(&mut self, _message: &str) {}

    /// Routines should poll this between units of work and return
    /// [`Cancelled`] once it turns true.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Listener that discards everything.
pub struct NoOpListener;

impl JobListener for NoOpListener {
    #[inline(always)]
    fn on_progress(&mut self, _percent: u8) {}

    #[inline(always)]
    fn on_item_done(&mut self, _item: &ItemId) {}
}
