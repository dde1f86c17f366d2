use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use medialink_model::{
    ContentId, Identification, IdentificationEvent, LinkedResource, LinkedResourceEvent, Location,
    Match, Resource, ResourceEvent, Work, WorkAttributes, WorkId,
};

use crate::clock::Clock;
use crate::lock;
use crate::source::{Source, Subscription};

const UNTITLED: &str = "(Untitled)";

/// Joins resources with the logical works they resolve to.
///
/// Consumes the resource stream plus a separately-ordered identification
/// stream. Identification events for a location are never processed before
/// that location's resource-creation event: the resource subscription is
/// joined before the identification stream is attached.
pub struct LinkedResourcesService {
    state: Mutex<LinkedState>,
    clock: Arc<dyn Clock>,
    events: Source<LinkedResourceEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Default)]
struct LinkedState {
    linked: HashMap<Location, Entry>,
    by_content: HashMap<ContentId, BTreeSet<Location>>,
    parent_of: HashMap<Location, Location>,
    children_of: HashMap<Location, BTreeSet<Location>>,
}

struct Entry {
    linked: LinkedResource,
    /// Match and works were set by an identification event; they survive
    /// resource updates until the next identification event.
    pinned: bool,
}

impl LinkedState {
    fn teardown(&mut self, location: &Location) {
        if let Some(entry) = self.linked.get(location) {
            let content_id = entry.linked.content_id().clone();
            if let Some(members) = self.by_content.get_mut(&content_id) {
                members.remove(location);
                if members.is_empty() {
                    self.by_content.remove(&content_id);
                }
            }
        }
        if let Some(parent) = self.parent_of.remove(location) {
            if let Some(children) = self.children_of.get_mut(&parent) {
                children.remove(location);
                if children.is_empty() {
                    self.children_of.remove(&parent);
                }
            }
        }
    }

    fn index(&mut self, linked: &LinkedResource) {
        let location = linked.location().clone();
        self.by_content
            .entry(linked.content_id().clone())
            .or_default()
            .insert(location.clone());
        if let Some(parent) = linked.resource.streamable.parent.clone() {
            self.children_of
                .entry(parent.clone())
                .or_default()
                .insert(location.clone());
            self.parent_of.insert(location, parent);
        }
    }
}

/// One work per release when identification produced any; otherwise exactly
/// one synthetic work from the raw attributes.
fn derive_works(resource: &Resource) -> Vec<Work> {
    if !resource.releases.is_empty() {
        return resource.releases.iter().map(Work::from_release).collect();
    }
    vec![synthetic_work(resource)]
}

fn synthetic_work(resource: &Resource) -> Work {
    let attributes = &resource.attributes;
    let title = if attributes.title.trim().is_empty() {
        UNTITLED.to_string()
    } else {
        attributes.title.clone()
    };
    Work {
        id: WorkId::synthetic(resource.location()),
        kind: resource.streamable.kind,
        attributes: WorkAttributes {
            title,
            subtitle: attributes.subtitle.clone(),
            description: attributes.description.clone(),
            tags: attributes.tags.clone(),
        },
        parent: None,
    }
}

impl LinkedResourcesService {
    /// Subscribe to both streams. The resource subscription is joined
    /// before identification events start flowing.
    pub async fn start(
        resources: &Source<ResourceEvent>,
        identifications: &Source<IdentificationEvent>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let service = Arc::new(LinkedResourcesService {
            state: Mutex::new(LinkedState::default()),
            clock,
            events: Source::new("linked-resources", 256),
            subscriptions: Mutex::new(Vec::new()),
        });

        let resource_service = Arc::clone(&service);
        let mut resource_sub = resources.subscribe("linked-resources", move |event| {
            let service = Arc::clone(&resource_service);
            async move { service.handle_resource(event) }
        });
        resource_sub.join().await;

        let identification_service = Arc::clone(&service);
        let identification_sub =
            identifications.subscribe("linked-resources", move |event| {
                let service = Arc::clone(&identification_service);
                async move { service.handle_identification(event) }
            });

        lock(&service.subscriptions).extend([resource_sub, identification_sub]);
        service
    }

    pub fn events(&self) -> &Source<LinkedResourceEvent> {
        &self.events
    }

    pub fn find(&self, location: &Location) -> Option<LinkedResource> {
        lock(&self.state)
            .linked
            .get(location)
            .map(|entry| entry.linked.clone())
    }

    pub fn find_by_content(&self, content_id: &ContentId) -> Vec<LinkedResource> {
        let state = lock(&self.state);
        state
            .by_content
            .get(content_id)
            .into_iter()
            .flatten()
            .filter_map(|location| state.linked.get(location))
            .map(|entry| entry.linked.clone())
            .collect()
    }

    /// Structural children of a location, in order.
    pub fn children(&self, location: &Location) -> Vec<Location> {
        lock(&self.state)
            .children_of
            .get(location)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = lock(&self.subscriptions).drain(..).collect();
        for subscription in subscriptions {
            subscription.shutdown().await;
        }
    }

    // Both handlers publish while still holding the state lock. The two
    // subscriptions run on separate tasks; publishing under the lock keeps
    // the emitted stream in the same order as the state mutations, so an
    // update racing a removal can never land after the removal event.
    fn handle_resource(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Updated(resource) => {
                let location = resource.location().clone();
                let mut state = lock(&self.state);
                state.teardown(&location);

                let linked = match state.linked.get(&location) {
                    // An identification event set match and works; new
                    // resource data wins everywhere else.
                    Some(entry) if entry.pinned => LinkedResource {
                        match_: entry.linked.match_.clone(),
                        works: entry.linked.works.clone(),
                        resource,
                    },
                    _ => LinkedResource {
                        match_: resource.match_.clone(),
                        works: derive_works(&resource),
                        resource,
                    },
                };
                let pinned = state
                    .linked
                    .get(&location)
                    .map(|entry| entry.pinned)
                    .unwrap_or(false);
                state.index(&linked);
                state.linked.insert(
                    location,
                    Entry {
                        linked: linked.clone(),
                        pinned,
                    },
                );
                self.events.publish(LinkedResourceEvent::Updated(linked));
            }
            ResourceEvent::Removed(location) => {
                let mut state = lock(&self.state);
                state.teardown(&location);
                if state.linked.remove(&location).is_some() {
                    self.events.publish(LinkedResourceEvent::Removed(location));
                }
            }
        }
    }

    fn handle_identification(&self, event: IdentificationEvent) {
        let IdentificationEvent {
            location,
            identification,
        } = event;
        let mut state = lock(&self.state);
        let Some(entry) = state.linked.get_mut(&location) else {
            tracing::debug!(
                target: "link::linked_resources",
                %location,
                "dropping identification event for unknown location"
            );
            return;
        };
        match identification {
            Some(Identification { match_, releases }) => {
                entry.linked.match_ = match_;
                entry.linked.resource.releases = releases;
            }
            None => {
                entry.linked.match_ = Match::none(self.clock.now());
                entry.linked.resource.releases = Vec::new();
            }
        }
        entry.linked.works = derive_works(&entry.linked.resource);
        entry.pinned = true;
        self.events
            .publish(LinkedResourceEvent::Updated(entry.linked.clone()));
    }
}

impl std::fmt::Debug for LinkedResourcesService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedResourcesService").finish_non_exhaustive()
    }
}
