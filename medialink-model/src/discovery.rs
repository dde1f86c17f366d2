use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::location::{ContentId, Location};
use crate::media_kind::MediaKind;

/// Raw attributes captured when a location is discovered, before any
/// identification has run. These feed the synthetic fallback works so that
/// every location stays displayable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAttributes {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A discovered filesystem item, as supplied by the scanning layer.
/// Immutable; a changed item arrives as a fresh `Discovery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub location: Location,
    pub kind: MediaKind,
    pub attributes: DiscoveryAttributes,
    pub discovered_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Discovery {
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn is_component(&self) -> bool {
        self.kind.is_component()
    }
}

/// A playable/streamable location with its content fingerprint and optional
/// parent link. Components (seasons, episodes) must carry a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Streamable {
    pub location: Location,
    pub content_id: ContentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Location>,
    pub kind: MediaKind,
}

impl Streamable {
    pub fn is_component(&self) -> bool {
        self.kind.is_component()
    }
}
