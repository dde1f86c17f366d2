use serde::{Deserialize, Serialize};

use crate::identify::Identification;
use crate::location::Location;
use crate::resource::{LinkedResource, Resource};

/// Event stream published by the resource service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceEvent {
    Updated(Resource),
    Removed(Location),
}

impl ResourceEvent {
    pub fn location(&self) -> &Location {
        match self {
            ResourceEvent::Updated(resource) => resource.location(),
            ResourceEvent::Removed(location) => location,
        }
    }
}

/// Event stream published by the linked-resources service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkedResourceEvent {
    Updated(LinkedResource),
    Removed(Location),
}

impl LinkedResourceEvent {
    pub fn location(&self) -> &Location {
        match self {
            LinkedResourceEvent::Updated(linked) => linked.location(),
            LinkedResourceEvent::Removed(location) => location,
        }
    }
}

/// Fine-grained asynchronous re-identification signal, ordered separately
/// from the main resource stream. `identification: None` marks a location
/// actively determined unidentifiable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationEvent {
    pub location: Location,
    pub identification: Option<Identification>,
}
