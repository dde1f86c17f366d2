use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::location::Location;
use crate::media_kind::MediaKind;

/// How a match between a location and a logical work was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchKind {
    /// No identification has been made; the resource only carries its raw
    /// discovery attributes.
    None,
    /// Matched by a name/title search against a provider.
    Name,
    /// Matched by an exact provider identifier.
    Identifier,
    /// Derived from a parent's identification (components only).
    Derived,
    /// Pinned by a user.
    Manual,
}

/// Confidence-annotated match result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub kind: MatchKind,
    pub accuracy: f32,
    pub created_at: DateTime<Utc>,
}

impl Match {
    /// The placeholder match carried by resources that have not been
    /// identified (or were determined unidentifiable).
    pub fn none(created_at: DateTime<Utc>) -> Self {
        Match {
            kind: MatchKind::None,
            accuracy: 0.0,
            created_at,
        }
    }
}

/// Namespace qualifying a `WorkId` by the data source that minted it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSource(String);

impl DataSource {
    /// Reserved internal namespace for synthetic works that no external data
    /// source has identified.
    pub const NONE: &'static str = "none";

    pub fn new(name: impl Into<String>) -> Self {
        DataSource(name.into())
    }

    pub fn none() -> Self {
        DataSource(Self::NONE.to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == Self::NONE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DataSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data-source-qualified key for a logical media entity. Multiple physical
/// resources (e.g. two files of the same episode) can resolve to one id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId {
    pub source: DataSource,
    pub value: String,
}

impl WorkId {
    pub fn new(source: DataSource, value: impl Into<String>) -> Self {
        WorkId {
            source,
            value: value.into(),
        }
    }

    /// Internal id for a work nothing has identified yet, keyed by the raw
    /// location it was discovered at.
    pub fn synthetic(location: &Location) -> Self {
        WorkId {
            source: DataSource::none(),
            value: location.as_str().to_string(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.source.is_none()
    }
}

impl Display for WorkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.value)
    }
}

/// Display attributes of a logical work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkAttributes {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A "release": one logical work descriptor produced by identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub id: WorkId,
    pub kind: MediaKind,
    pub attributes: WorkAttributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<WorkId>,
}

/// Result of matching a location against external metadata: the match
/// itself plus zero or more release descriptors.
///
/// Note that `Option<Identification>` is used throughout the engine with
/// `None` meaning "actively determined unidentifiable", which is distinct
/// from a location that has not been identified yet (map key absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    #[serde(rename = "match")]
    pub match_: Match,
    pub releases: Vec<ReleaseDescriptor>,
}

/// A logical media entity (movie, episode, series, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub kind: MediaKind,
    pub attributes: WorkAttributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<WorkId>,
}

impl Work {
    pub fn from_release(release: &ReleaseDescriptor) -> Self {
        Work {
            id: release.id.clone(),
            kind: release.kind,
            attributes: release.attributes.clone(),
            parent: release.parent.clone(),
        }
    }
}
