use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use medialink_model::{Discovery, Identification, Location, Match, MatchKind, Streamable};

/// Errors surfaced by identification providers. Provider failures never
/// escape a background task; they put the task on the error refresh
/// schedule.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider api error: {0}")]
    Api(String),

    #[error("no result for query: {0}")]
    NotFound(String),

    #[error("rate limited{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to parse provider response: {0}")]
    Parse(String),
}

/// Errors surfaced by the identification store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// External metadata source. `identify` performs I/O and may fail;
/// `identify_child` is a pure derivation from an already-known parent
/// identification and must not perform I/O.
#[async_trait]
pub trait IdentificationProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Query the provider for `discovery`. `Ok(None)` is a legitimate
    /// terminal answer meaning the item was actively determined
    /// unidentifiable.
    async fn identify(
        &self,
        discovery: &Discovery,
    ) -> Result<Option<Identification>, ProviderError>;

    /// Derive a component's identification from its root's. Pure; never
    /// queries the provider.
    fn identify_child(&self, child: &Discovery, parent: &Identification) -> Identification;
}

/// Persistence for the last known identification per location.
#[async_trait]
pub trait IdentificationStore: Send + Sync + fmt::Debug {
    async fn find(&self, location: &Location) -> Result<Option<Identification>, StoreError>;

    async fn store(
        &self,
        location: &Location,
        identification: &Identification,
    ) -> Result<(), StoreError>;
}

/// Provider-independent fallback that always succeeds.
///
/// Produces a `MatchKind::None` match with no releases, so every known
/// location carries a displayable resource even before (or without)
/// identification.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalIdentificationProvider;

impl MinimalIdentificationProvider {
    pub const NAME: &'static str = "minimal";

    /// Infallible derivation used for locations with no explicit
    /// identification.
    pub fn minimal(&self, _discovery: &Discovery, at: DateTime<Utc>) -> Identification {
        Identification {
            match_: Match {
                kind: MatchKind::None,
                accuracy: 0.0,
                created_at: at,
            },
            releases: Vec::new(),
        }
    }
}

#[async_trait]
impl IdentificationProvider for MinimalIdentificationProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn identify(
        &self,
        discovery: &Discovery,
    ) -> Result<Option<Identification>, ProviderError> {
        Ok(Some(self.minimal(discovery, Utc::now())))
    }

    fn identify_child(&self, child: &Discovery, parent: &Identification) -> Identification {
        self.minimal(child, parent.match_.created_at)
    }
}

/// Discovery-level input event consumed by the resource service. `Updated`
/// optionally carries the provider responsible for identifying the item; a
/// missing provider means the location stays on its minimal resource.
#[derive(Debug, Clone)]
pub enum StreamableEvent {
    Updated {
        streamable: Streamable,
        discovery: Discovery,
        provider: Option<Arc<dyn IdentificationProvider>>,
    },
    Removed {
        location: Location,
    },
}

impl StreamableEvent {
    pub fn location(&self) -> &Location {
        match self {
            StreamableEvent::Updated { streamable, .. } => &streamable.location,
            StreamableEvent::Removed { location } => location,
        }
    }
}
