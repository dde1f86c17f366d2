//! Core data model definitions shared across Medialink crates.

pub mod discovery;
pub mod events;
pub mod identify;
pub mod location;
pub mod media_kind;
pub mod resource;

// Intentionally curated re-exports for downstream consumers.
pub use discovery::{Discovery, DiscoveryAttributes, Streamable};
pub use events::{IdentificationEvent, LinkedResourceEvent, ResourceEvent};
pub use identify::{
    DataSource, Identification, Match, MatchKind, ReleaseDescriptor, Work, WorkAttributes, WorkId,
};
pub use location::{ContentId, Location};
pub use media_kind::MediaKind;
pub use resource::{LinkedResource, LinkedWork, MatchedResource, Resource};
