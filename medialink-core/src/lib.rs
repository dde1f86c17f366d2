//! Background identification and resource-graph engine.
//!
//! Discovered locations flow one direction through three stages: the
//! [`resources::ResourceService`] turns streamable events into resources and
//! drives per-root identification tasks, the
//! [`linked_resources::LinkedResourcesService`] joins resources with the
//! works they resolve to, and the [`linked_works::LinkedWorksService`] folds
//! them into one aggregate per logical work. Each stage consumes only the
//! previous stage's event [`source::Source`].

pub mod clock;
pub mod error;
pub mod identify;
pub mod linked_resources;
pub mod linked_works;
pub mod provider;
pub mod resources;
pub mod source;

pub use clock::{Clock, SystemClock};
pub use error::{LinkError, Result};
pub use identify::{IdentificationOutcome, IdentificationTaskManager, IdentifySettings};
pub use linked_resources::LinkedResourcesService;
pub use linked_works::LinkedWorksService;
pub use provider::{
    IdentificationProvider, IdentificationStore, MinimalIdentificationProvider, ProviderError,
    StoreError, StreamableEvent,
};
pub use resources::ResourceService;
pub use source::{Source, Subscription};

/// Lock a state mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
