use anyhow::Result;
use shared::{JobListener, JobSpec};

/// The unit of work a [`TaskController`](crate::TaskController) runs on its
/// worker thread.
///
/// Implementations report through `listener` and should return
/// [`shared::Cancelled`] when they stop because `listener.is_cancelled()`
/// turned true. Any other error is reported to the caller as a task failure.
pub trait InferenceRoutine: Send + Sync + 'static {
    fn run(&self, job: &JobSpec, listener: &mut dyn JobListener) -> Result<()>;
}

/// Routine backed by a closure, see [`from_fn`].
pub struct FnRoutine<F>(F);

/// Wrap a closure as an [`InferenceRoutine`].
pub fn from_fn<F>(f: F) -> FnRoutine<F>
where
    F: Fn(&JobSpec, &mut dyn JobListener) -> Result<()> + Send + Sync + 'static,
{
    FnRoutine(f)
}

impl<F> InferenceRoutine for FnRoutine<F>
where
    F: Fn(&JobSpec, &mut dyn JobListener) -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, job: &JobSpec, listener: &mut dyn JobListener) -> Result<()> {
        (self.0)(job, listener)
    }
}
