//! Background task coordination: runs one separation job at a time off the
//! caller's thread and streams its progress back as [`shared::TaskEvent`]s.

pub mod command;
pub mod controller;
pub mod routine;

pub use command::CommandRoutine;
pub use controller::{StartError, TaskController, TaskHandle, TaskState, DEFAULT_GRACE_PERIOD};
pub use routine::{from_fn, FnRoutine, InferenceRoutine};
