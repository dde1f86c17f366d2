//! Background identification: one long-running task per identifiable root
//! location, bounded by shared permits, publishing results to a queue the
//! resource service drains.

pub mod settings;
pub mod task_manager;

pub use settings::{IdentifySettings, PermitSettings, PersistSettings, RefreshGrowth, RefreshSettings};
pub use task_manager::{IdentificationOutcome, IdentificationTaskManager};
