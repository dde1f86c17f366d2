use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Simple enum for media kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// A standalone movie file.
    Movie,
    /// A series folder grouping seasons/episodes.
    Series,
    /// A season folder inside a series.
    Season,
    /// An episode file inside a series or season.
    Episode,
}

impl MediaKind {
    /// Components are dependents of a root location: their identification is
    /// always derived from the root's, never queried independently.
    pub fn is_component(&self) -> bool {
        matches!(self, MediaKind::Season | MediaKind::Episode)
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "Movie"),
            MediaKind::Series => write!(f, "Series"),
            MediaKind::Season => write!(f, "Season"),
            MediaKind::Episode => write!(f, "Episode"),
        }
    }
}
