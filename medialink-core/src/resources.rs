use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use medialink_model::{
    ContentId, Discovery, Identification, Location, Resource, ResourceEvent, Streamable,
};

use crate::clock::Clock;
use crate::identify::{IdentificationOutcome, IdentificationTaskManager, IdentifySettings};
use crate::lock;
use crate::provider::{
    IdentificationProvider, IdentificationStore, MinimalIdentificationProvider, StreamableEvent,
};
use crate::source::{Source, Subscription};

/// The coordinator of the resource graph.
///
/// Consumes streamable events, maintains root/dependent relationships and
/// content-id indices, drives the identification task manager, drains its
/// result queue on a dedicated task, and publishes a resource for every
/// known location.
pub struct ResourceService {
    state: Mutex<ResourceState>,
    manager: Arc<IdentificationTaskManager>,
    minimal: MinimalIdentificationProvider,
    clock: Arc<dyn Clock>,
    events: Source<ResourceEvent>,
    runtime: Mutex<Option<ServiceRuntime>>,
}

struct ServiceRuntime {
    input: Subscription,
    consumer_token: CancellationToken,
    consumer: JoinHandle<()>,
}

/// All mutable indices, guarded by one service-wide lock. Every mutation
/// path tears down the old index entries for a location before applying the
/// new ones, so update-in-place and removal stay symmetric.
#[derive(Default)]
struct ResourceState {
    streamables: HashMap<Location, Streamable>,
    discoveries: HashMap<Location, Discovery>,
    /// Last provider attached to each location, consulted when a root
    /// result arrives without one and a dependent needs derivation.
    providers: HashMap<Location, Arc<dyn IdentificationProvider>>,
    /// Present key = identification has been determined; `None` value =
    /// actively determined unidentifiable.
    identifications: HashMap<Location, Option<Identification>>,
    resources: HashMap<Location, Resource>,
    by_content: HashMap<ContentId, BTreeSet<Location>>,
    dependents_of: HashMap<Location, BTreeSet<Location>>,
    root_of: HashMap<Location, Location>,
}

impl ResourceState {
    /// Remove `location`'s memberships from the content-id and
    /// root/dependent indices. Keys whose sets become empty are removed
    /// entirely.
    fn teardown(&mut self, location: &Location) {
        if let Some(streamable) = self.streamables.get(location) {
            let content_id = streamable.content_id.clone();
            if let Some(members) = self.by_content.get_mut(&content_id) {
                members.remove(location);
                if members.is_empty() {
                    self.by_content.remove(&content_id);
                }
            }
        }
        if let Some(root) = self.root_of.remove(location) {
            if let Some(dependents) = self.dependents_of.get_mut(&root) {
                dependents.remove(location);
                if dependents.is_empty() {
                    self.dependents_of.remove(&root);
                }
            }
        }
    }

    /// Resolve a location to its non-component root.
    fn root(&self, location: &Location) -> Location {
        self.root_of.get(location).cloned().unwrap_or_else(|| location.clone())
    }

    /// Build the effective resource for a known location. Falls back to the
    /// minimal provider when no explicit identification exists, so every
    /// known location stays displayable.
    fn derive_resource(
        &self,
        location: &Location,
        minimal: &MinimalIdentificationProvider,
        clock: &dyn Clock,
    ) -> Option<Resource> {
        let streamable = self.streamables.get(location)?;
        let discovery = self.discoveries.get(location)?;
        let identification = match self.identifications.get(location) {
            Some(Some(identification)) => identification.clone(),
            _ => minimal.minimal(discovery, clock.now()),
        };
        Some(Resource {
            streamable: streamable.clone(),
            attributes: discovery.attributes.clone(),
            discovered_at: discovery.discovered_at,
            modified_at: discovery.modified_at,
            match_: identification.match_,
            releases: identification.releases,
        })
    }
}

/// Deferred task-manager calls collected under the lock and executed after
/// it is released, so no await happens while the state mutex is held.
/// Resource events, by contrast, are published while the lock is still
/// held: `Source::publish` never blocks, and publishing under the lock
/// keeps the event stream in the same order as the state mutations it
/// reports.
enum FollowUp {
    StartTask {
        provider: Arc<dyn IdentificationProvider>,
        discovery: Discovery,
    },
    StopTask(Location),
}

impl ResourceService {
    /// Wire up the service: subscribe to the streamable stream and start
    /// the queue consumer.
    pub fn start(
        input: &Source<StreamableEvent>,
        store: Arc<dyn IdentificationStore>,
        clock: Arc<dyn Clock>,
        settings: IdentifySettings,
    ) -> Arc<Self> {
        let (manager, queue) =
            IdentificationTaskManager::new(Arc::clone(&clock), store, settings.clone());
        let service = Arc::new(ResourceService {
            state: Mutex::new(ResourceState::default()),
            manager,
            minimal: MinimalIdentificationProvider,
            clock,
            events: Source::new("resources", settings.queue_capacity.max(1)),
            runtime: Mutex::new(None),
        });

        let consumer_token = CancellationToken::new();
        let consumer = tokio::spawn(Self::consume_queue(
            Arc::clone(&service),
            queue,
            consumer_token.clone(),
        ));

        let handler_service = Arc::clone(&service);
        let input = input.subscribe("resources", move |event| {
            let service = Arc::clone(&handler_service);
            async move { service.handle_streamable(event).await }
        });

        *lock(&service.runtime) = Some(ServiceRuntime {
            input,
            consumer_token,
            consumer,
        });
        service
    }

    /// The resource event stream this service emits.
    pub fn events(&self) -> &Source<ResourceEvent> {
        &self.events
    }

    pub fn find(&self, location: &Location) -> Option<Resource> {
        lock(&self.state).resources.get(location).cloned()
    }

    /// Resolve a location to its root and return the root's resource.
    pub fn find_root(&self, location: &Location) -> Option<Resource> {
        let state = lock(&self.state);
        let root = state.root(location);
        state.resources.get(&root).cloned()
    }

    /// First known resource carrying the given content id, in location
    /// order.
    pub fn find_first(&self, content_id: &ContentId) -> Option<Resource> {
        let state = lock(&self.state);
        let location = state.by_content.get(content_id)?.first()?;
        state.resources.get(location).cloned()
    }

    /// Snapshot of every known location, in order. Diagnostics surface.
    pub fn locations(&self) -> Vec<Location> {
        let state = lock(&self.state);
        let mut locations: Vec<Location> = state.resources.keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Request re-identification. Dependents resolve to their root, which
    /// is what actually runs an identification task.
    pub async fn reidentify(&self, location: &Location) {
        let root = lock(&self.state).root(location);
        self.manager.reidentify(&root).await;
    }

    /// Stop the queue consumer, the input subscription, and every
    /// identification task.
    pub async fn shutdown(&self) {
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            runtime.input.shutdown().await;
            runtime.consumer_token.cancel();
            let _ = runtime.consumer.await;
        }
        self.manager.stop_all().await;
    }

    async fn handle_streamable(&self, event: StreamableEvent) {
        let follow_ups = match event {
            StreamableEvent::Updated {
                streamable,
                discovery,
                provider,
            } => self.apply_update(streamable, discovery, provider),
            StreamableEvent::Removed { location } => self.apply_removal(location),
        };
        self.run_follow_ups(follow_ups).await;
    }

    /// Apply an update under the lock and collect deferred side effects.
    fn apply_update(
        &self,
        streamable: Streamable,
        discovery: Discovery,
        provider: Option<Arc<dyn IdentificationProvider>>,
    ) -> Vec<FollowUp> {
        let location = streamable.location.clone();
        let mut follow_ups = Vec::new();
        let mut state = lock(&self.state);

        state.teardown(&location);

        if streamable.is_component() {
            // A component's parent must be resolvable right now; anything
            // else is a data error upstream.
            let parent = streamable.parent.clone().unwrap_or_else(|| {
                panic!("component {location} arrived without a parent location")
            });
            let root = if state
                .streamables
                .get(&parent)
                .map(Streamable::is_component)
                .unwrap_or_else(|| panic!("component {location} has unknown parent {parent}"))
            {
                state.root_of.get(&parent).cloned().unwrap_or_else(|| {
                    panic!("component {location} has parent {parent} with no resolvable root")
                })
            } else {
                parent
            };
            state
                .dependents_of
                .entry(root.clone())
                .or_default()
                .insert(location.clone());
            state.root_of.insert(location.clone(), root);
        }

        state
            .by_content
            .entry(streamable.content_id.clone())
            .or_default()
            .insert(location.clone());
        state.streamables.insert(location.clone(), streamable.clone());
        state.discoveries.insert(location.clone(), discovery.clone());

        let mut start_task = None;
        if let Some(provider) = provider {
            state.providers.insert(location.clone(), Arc::clone(&provider));
            if streamable.is_component() {
                // Derive immediately when the root is already identified.
                let root = state.root(&location);
                if let Some(Some(root_identification)) =
                    state.identifications.get(&root).cloned()
                {
                    let derived = provider.identify_child(&discovery, &root_identification);
                    state
                        .identifications
                        .insert(location.clone(), Some(derived));
                }
            } else {
                start_task = Some(FollowUp::StartTask {
                    provider,
                    discovery,
                });
            }
        }

        if let Some(resource) = state.derive_resource(&location, &self.minimal, &*self.clock) {
            state.resources.insert(location.clone(), resource.clone());
            self.events.publish(ResourceEvent::Updated(resource));
        }
        // The creation event is published under the lock, before the task
        // starts, so an early identification result can never outrun it
        // downstream.
        follow_ups.extend(start_task);
        follow_ups
    }

    fn apply_removal(&self, location: Location) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        let mut state = lock(&self.state);

        state.teardown(&location);
        state.identifications.remove(&location);
        state.providers.remove(&location);
        state.discoveries.remove(&location);

        let was_root = state
            .streamables
            .remove(&location)
            .map(|s| !s.is_component())
            .unwrap_or(false);
        if was_root {
            follow_ups.push(FollowUp::StopTask(location.clone()));
        }

        if state.resources.remove(&location).is_some() {
            self.events.publish(ResourceEvent::Removed(location));
        }
        follow_ups
    }

    async fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::StartTask {
                    provider,
                    discovery,
                } => {
                    let location = discovery.location.clone();
                    if let Err(err) = self.manager.create(provider, discovery).await {
                        tracing::error!(
                            target: "link::resources",
                            %location,
                            error = %err,
                            "failed to register identification task"
                        );
                    }
                }
                FollowUp::StopTask(location) => self.manager.stop(&location).await,
            }
        }
    }

    async fn consume_queue(
        service: Arc<Self>,
        mut queue: mpsc::Receiver<IdentificationOutcome>,
        token: CancellationToken,
    ) {
        loop {
            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = queue.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            service.apply_outcome(outcome);
        }
    }

    /// Apply one identification result to the root and every registered
    /// dependent. Results for locations no longer tracked are dropped
    /// silently. The stale check and the publishes happen under the same
    /// lock hold, so a result racing a removal can never land after the
    /// removal event and resurrect the location downstream.
    fn apply_outcome(&self, outcome: IdentificationOutcome) {
        let mut state = lock(&self.state);
        if !state.streamables.contains_key(&outcome.location) {
            tracing::debug!(
                target: "link::resources",
                location = %outcome.location,
                "dropping identification result for unknown location"
            );
            return;
        }

        state
            .identifications
            .insert(outcome.location.clone(), outcome.identification.clone());
        if let Some(resource) =
            state.derive_resource(&outcome.location, &self.minimal, &*self.clock)
        {
            state
                .resources
                .insert(outcome.location.clone(), resource.clone());
            self.events.publish(ResourceEvent::Updated(resource));
        }

        // Dependents are always re-derived from the root, in deterministic
        // location order. A dependent registered with its own provider uses
        // that one when the result carries none.
        let dependents: Vec<Location> = state
            .dependents_of
            .get(&outcome.location)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for dependent in dependents {
            let derived = match &outcome.identification {
                Some(root_identification) => {
                    state.discoveries.get(&dependent).map(|discovery| {
                        match outcome
                            .provider
                            .as_ref()
                            .or_else(|| state.providers.get(&dependent))
                        {
                            Some(provider) => {
                                provider.identify_child(discovery, root_identification)
                            }
                            None => self.minimal.minimal(discovery, self.clock.now()),
                        }
                    })
                }
                None => None,
            };
            state.identifications.insert(dependent.clone(), derived);
            if let Some(resource) =
                state.derive_resource(&dependent, &self.minimal, &*self.clock)
            {
                state.resources.insert(dependent.clone(), resource.clone());
                self.events.publish(ResourceEvent::Updated(resource));
            }
        }
    }
}

impl std::fmt::Debug for ResourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceService").finish_non_exhaustive()
    }
}
