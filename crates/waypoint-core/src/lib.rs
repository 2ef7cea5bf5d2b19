pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, WaypointError};
pub use event::{ProgressBus, ProgressCallback, ProgressEvent, ProgressKind};
pub use state::{StateUpdate, WorkflowState};
pub use types::*;
