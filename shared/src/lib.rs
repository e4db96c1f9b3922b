pub mod config;
pub mod events;
pub mod registry;
pub mod types;

pub use config::*;
pub use events::*;
pub use registry::*;
pub use types::*;
