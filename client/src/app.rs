use anyhow::{bail, Result};
use log::{debug, info, warn};
use shared::{Finished, ItemRegistry, JobOptions, JobSpec, TaskEvent};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use stemsplit_worker::{InferenceRoutine, TaskController, TaskHandle};

use crate::progress::ProgressView;

/// Caller-side state: the item list, the controller and whatever the last
/// run reported. Owns the only mutable path to the registry; task events
/// reach it through [`App::process_messages`].
pub struct App {
    pub registry: ItemRegistry,
    controller: TaskController,
    rx: mpsc::Receiver<TaskEvent>,
    handle: Option<TaskHandle>,
    progress: ProgressView,
    log_lines: Vec<String>,
    outcome: Option<Finished>,
}

impl App {
    pub fn new(routine: impl InferenceRoutine, grace_period: Duration, progress: ProgressView) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            registry: ItemRegistry::new(),
            controller: TaskController::with_grace_period(routine, tx, grace_period),
            rx,
            handle: None,
            progress,
            log_lines: Vec::new(),
            outcome: None,
        }
    }

    /// Add an input file by its canonical path. Missing files and
    /// duplicates are skipped with a warning.
    pub fn add_input(&mut self, path: &Path) -> bool {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping {:?}: {}", path, e);
                return false;
            }
        };
        if !self.registry.add(canonical) {
            warn!("Skipping duplicate input {:?}", path);
            return false;
        }
        true
    }

    /// Snapshot the enabled items and hand them to the controller.
    pub fn start(&mut self, options: JobOptions) -> Result<()> {
        options.validate()?;
        let spec = JobSpec::from_registry(&self.registry, options);
        if spec.is_empty() {
            bail!("No enabled input files to process");
        }
        info!("Separating {} file(s) into {:?}", spec.items().len(), spec.options().output_dir);
        let handle = self.controller.start(spec)?;
        self.outcome = None;
        self.log_lines.clear();
        self.handle = Some(handle);
        Ok(())
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn outcome(&self) -> Option<&Finished> {
        self.outcome.as_ref()
    }

    pub fn percent(&self) -> u8 {
        self.progress.percent()
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }

    pub fn process_messages(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                TaskEvent::Progress(percent) => {
                    self.progress.set_percent(percent);
                }
                TaskEvent::Log(line) => {
                    debug!("task: {}", line);
                    self.progress.log(&line);
                    self.log_lines.push(line);
                }
                TaskEvent::ItemDone(item) => {
                    info!("Finished {}", item);
                    self.registry.mark_completed(&item);
                    self.progress.item_done(&item);
                }
                TaskEvent::Finished(finished) => {
                    self.progress.finish(&finished);
                    self.handle = None;
                    self.outcome = Some(finished);
                }
            }
        }
    }

    /// Process exit status for the last run: 0 success, 1 failure, 130
    /// cancelled.
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            Some(finished) if finished.is_success() => 0,
            Some(finished) if finished.cancelled && finished.error.is_none() => 130,
            _ => 1,
        }
    }

    /// One line per input with its completion state.
    pub fn summary(&self) -> Vec<String> {
        self.registry
            .iter()
            .map(|item| {
                let mark = if item.completed {
                    "done"
                } else if item.enabled {
                    "not finished"
                } else {
                    "skipped"
                };
                format!("{:>12}  {}", mark, item.id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::TaskError;
    use std::time::Instant;
    use stemsplit_worker::from_fn;

    fn pump_until_finished(app: &mut App) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while app.outcome().is_none() {
            assert!(Instant::now() < deadline, "task did not finish");
            app.process_messages();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn app_with(routine: impl InferenceRoutine) -> App {
        App::new(routine, Duration::from_millis(200), ProgressView::hidden())
    }

    #[test]
    fn completed_items_are_marked_and_disabled() {
        let mut app = app_with(from_fn(|job, listener| {
            listener.on_log("loading model");
            listener.on_progress(50);
            listener.on_item_done(&job.items()[0]);
            listener.on_progress(100);
            Ok(())
        }));
        app.registry.add_all(["a.wav", "b.wav"]);
        app.registry.set_enabled("b.wav", false);

        app.start(JobOptions::default()).unwrap();
        assert!(app.is_running());
        pump_until_finished(&mut app);

        assert!(!app.is_running());
        assert_eq!(app.exit_code(), 0);
        assert_eq!(app.log_lines(), ["loading model"]);
        assert_eq!(app.percent(), 100);

        let a = app.registry.get("a.wav").unwrap();
        assert!(a.completed && !a.enabled);
        assert_eq!(app.summary()[0], format!("{:>12}  a.wav", "done"));
        assert_eq!(app.summary()[1], format!("{:>12}  b.wav", "skipped"));
    }

    #[test]
    fn refuses_to_start_without_enabled_items() {
        let mut app = app_with(from_fn(|_, _| Ok(())));
        app.registry.add("a.wav");
        app.registry.mark_completed("a.wav");
        assert!(app.start(JobOptions::default()).is_err());
        assert!(!app.is_running());
    }

    #[test]
    fn refuses_invalid_options() {
        let mut app = app_with(from_fn(|_, _| Ok(())));
        app.registry.add("a.wav");
        let options = JobOptions {
            overlap_large: 1.5,
            ..JobOptions::default()
        };
        assert!(app.start(options).is_err());
    }

    #[test]
    fn failure_maps_to_exit_code_one() {
        let mut app = app_with(from_fn(|_, _| Err(anyhow::anyhow!("no model"))));
        app.registry.add("a.wav");
        app.start(JobOptions::default()).unwrap();
        pump_until_finished(&mut app);

        assert_eq!(
            app.outcome().and_then(|f| f.error.clone()),
            Some(TaskError::Failed("no model".into()))
        );
        assert_eq!(app.exit_code(), 1);
    }

    #[test]
    fn cancel_maps_to_exit_code_130() {
        let mut app = app_with(from_fn(|_, listener| {
            while !listener.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(shared::Cancelled.into())
        }));
        app.registry.add("a.wav");
        app.start(JobOptions::default()).unwrap();
        app.cancel();
        app.cancel();
        pump_until_finished(&mut app);

        assert_eq!(app.exit_code(), 130);
        assert_eq!(app.registry.enabled_identities().len(), 1);
    }
}
