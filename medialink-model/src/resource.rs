use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::{DiscoveryAttributes, Streamable};
use crate::identify::{Match, ReleaseDescriptor, Work};
use crate::location::{ContentId, Location};

/// The engine's current view of a location: its streamable data, raw
/// discovery attributes, and the best match plus releases identification has
/// produced so far.
///
/// A `Resource` is a snapshot. It is replaced wholesale on every update and
/// never mutated in place, so consumers can hold on to one safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub streamable: Streamable,
    pub attributes: DiscoveryAttributes,
    pub discovered_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(rename = "match")]
    pub match_: Match,
    pub releases: Vec<ReleaseDescriptor>,
}

impl Resource {
    pub fn location(&self) -> &Location {
        &self.streamable.location
    }

    pub fn content_id(&self) -> &ContentId {
        &self.streamable.content_id
    }

    pub fn is_component(&self) -> bool {
        self.streamable.is_component()
    }
}

/// A resource joined with the logical works it resolves to.
///
/// If identification produced releases, there is one work per release;
/// otherwise exactly one synthetic work built from the raw attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedResource {
    pub resource: Resource,
    #[serde(rename = "match")]
    pub match_: Match,
    pub works: Vec<Work>,
}

impl LinkedResource {
    pub fn location(&self) -> &Location {
        self.resource.location()
    }

    pub fn content_id(&self) -> &ContentId {
        self.resource.content_id()
    }
}

/// One physical resource's contribution to a `LinkedWork`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedResource {
    #[serde(rename = "match")]
    pub match_: Match,
    pub resource: Resource,
}

impl MatchedResource {
    pub fn location(&self) -> &Location {
        self.resource.location()
    }
}

/// A logical work folded together with every physical resource that
/// currently identifies to it, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedWork {
    pub work: Work,
    pub matched_resources: Vec<MatchedResource>,
}

impl LinkedWork {
    pub fn id(&self) -> &crate::identify::WorkId {
        &self.work.id
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.matched_resources.iter().map(|m| m.location())
    }
}
