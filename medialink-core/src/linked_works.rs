use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use medialink_model::{
    ContentId, LinkedResource, LinkedResourceEvent, LinkedWork, Location, MatchedResource,
    MediaKind, WorkId,
};

use crate::lock;
use crate::source::{Source, Subscription};

/// Folds linked resources that identify to the same logical work into one
/// `LinkedWork` per `WorkId`. Terminal stage of the pipeline; exposes a
/// query surface instead of an event stream.
pub struct LinkedWorksService {
    state: Mutex<WorksState>,
    subscription: Mutex<Option<Subscription>>,
}

#[derive(Default)]
struct WorksState {
    /// The canonical aggregate.
    works: HashMap<WorkId, LinkedWork>,
    /// What a given resource currently resolves to.
    by_location: HashMap<Location, BTreeSet<WorkId>>,
    /// Structural children, independent of identification.
    children_of: HashMap<Location, BTreeSet<Location>>,
    /// Reverse of `children_of`, for removal.
    parent_of: HashMap<Location, Location>,
    by_content: HashMap<ContentId, BTreeSet<Location>>,
    /// Last contribution per location, for symmetric teardown.
    contributions: HashMap<Location, LinkedResource>,
}

impl WorksState {
    /// Remove every contribution `location` previously made: its work
    /// memberships, its content-id membership, and its structural links.
    /// A `LinkedWork` losing its last resource is dropped entirely.
    fn teardown(&mut self, location: &Location) {
        if let Some(work_ids) = self.by_location.remove(location) {
            for work_id in work_ids {
                if let Some(linked_work) = self.works.get_mut(&work_id) {
                    linked_work
                        .matched_resources
                        .retain(|matched| matched.location() != location);
                    if linked_work.matched_resources.is_empty() {
                        self.works.remove(&work_id);
                    }
                }
            }
        }
        if let Some(previous) = self.contributions.remove(location) {
            let content_id = previous.content_id().clone();
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

    fn apply(&mut self, linked: LinkedResource) {
        let location = linked.location().clone();
        self.teardown(&location);

        self.by_content
            .entry(linked.content_id().clone())
            .or_default()
            .insert(location.clone());
        if let Some(parent) = linked.resource.streamable.parent.clone() {
            self.children_of
                .entry(parent.clone())
                .or_default()
                .insert(location.clone());
            self.parent_of.insert(location.clone(), parent);
        }

        for work in &linked.works {
            let matched = MatchedResource {
                match_: linked.match_.clone(),
                resource: linked.resource.clone(),
            };
            match self.works.get_mut(&work.id) {
                Some(linked_work) => {
                    // Merge on id equality: refresh the work metadata,
                    // concatenate the resource lists.
                    linked_work.work = work.clone();
                    linked_work.matched_resources.push(matched);
                }
                None => {
                    self.works.insert(
                        work.id.clone(),
                        LinkedWork {
                            work: work.clone(),
                            matched_resources: vec![matched],
                        },
                    );
                }
            }
            self.by_location
                .entry(location.clone())
                .or_default()
                .insert(work.id.clone());
        }

        self.contributions.insert(location, linked);
    }

    fn works_at(&self, location: &Location) -> Vec<LinkedWork> {
        self.by_location
            .get(location)
            .into_iter()
            .flatten()
            .filter_map(|work_id| self.works.get(work_id))
            .cloned()
            .collect()
    }
}

/// Newest-first sort key: latest discovery time, then latest modification
/// time, across a work's resources.
fn recency(linked_work: &LinkedWork) -> (DateTime<Utc>, DateTime<Utc>) {
    let discovered = linked_work
        .matched_resources
        .iter()
        .map(|matched| matched.resource.discovered_at)
        .max()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let modified = linked_work
        .matched_resources
        .iter()
        .map(|matched| matched.resource.modified_at)
        .max()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    (discovered, modified)
}

impl LinkedWorksService {
    pub fn start(linked_resources: &Source<LinkedResourceEvent>) -> Arc<Self> {
        let service = Arc::new(LinkedWorksService {
            state: Mutex::new(WorksState::default()),
            subscription: Mutex::new(None),
        });

        let handler_service = Arc::clone(&service);
        let subscription = linked_resources.subscribe("linked-works", move |event| {
            let service = Arc::clone(&handler_service);
            async move { service.handle(event) }
        });
        *lock(&service.subscription) = Some(subscription);
        service
    }

    /// Look up the aggregate for a work id. Synthetic ids fall back to
    /// whatever their raw location currently resolves to, so a caller
    /// holding a pre-identification id still finds the identified work.
    pub fn find(&self, work_id: &WorkId) -> Option<LinkedWork> {
        let state = lock(&self.state);
        if let Some(linked_work) = state.works.get(work_id) {
            return Some(linked_work.clone());
        }
        if work_id.is_synthetic() {
            let location = Location::parse(&work_id.value).ok()?;
            let current = state.by_location.get(&location)?.first()?;
            return state.works.get(current).cloned();
        }
        None
    }

    /// Works the structural children of `work_id`'s resources currently
    /// resolve to.
    pub fn find_children(&self, work_id: &WorkId) -> Vec<LinkedWork> {
        let state = lock(&self.state);
        let Some(linked_work) = state.works.get(work_id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut children = Vec::new();
        for matched in &linked_work.matched_resources {
            let Some(child_locations) = state.children_of.get(matched.location()) else {
                continue;
            };
            for child in child_locations {
                for child_work in state.works_at(child) {
                    if seen.insert(child_work.work.id.clone()) {
                        children.push(child_work);
                    }
                }
            }
        }
        children
    }

    /// The `n` most recently discovered works.
    pub fn find_newest(&self, n: usize) -> Vec<LinkedWork> {
        let state = lock(&self.state);
        let mut all: Vec<LinkedWork> = state.works.values().cloned().collect();
        all.sort_by(|a, b| recency(b).cmp(&recency(a)));
        all.truncate(n);
        all
    }

    /// Root works (no parent work) carrying the given tag.
    pub fn find_roots_by_tag(&self, tag: &str) -> Vec<LinkedWork> {
        let state = lock(&self.state);
        let mut found: Vec<LinkedWork> = state
            .works
            .values()
            .filter(|lw| lw.work.parent.is_none())
            .filter(|lw| lw.work.attributes.tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.work.id.cmp(&b.work.id));
        found
    }

    pub fn find_by_kind_and_tag(&self, kind: MediaKind, tag: &str) -> Vec<LinkedWork> {
        let state = lock(&self.state);
        let mut found: Vec<LinkedWork> = state
            .works
            .values()
            .filter(|lw| lw.work.kind == kind)
            .filter(|lw| lw.work.attributes.tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.work.id.cmp(&b.work.id));
        found
    }

    pub fn find_by_location(&self, location: &Location) -> Vec<LinkedWork> {
        lock(&self.state).works_at(location)
    }

    pub fn find_by_content(&self, content_id: &ContentId) -> Vec<LinkedWork> {
        let state = lock(&self.state);
        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for location in state.by_content.get(content_id).into_iter().flatten() {
            for linked_work in state.works_at(location) {
                if seen.insert(linked_work.work.id.clone()) {
                    found.push(linked_work);
                }
            }
        }
        found
    }

    pub async fn shutdown(&self) {
        let subscription = lock(&self.subscription).take();
        if let Some(subscription) = subscription {
            subscription.shutdown().await;
        }
    }

    fn handle(&self, event: LinkedResourceEvent) {
        let mut state = lock(&self.state);
        match event {
            LinkedResourceEvent::Updated(linked) => state.apply(linked),
            LinkedResourceEvent::Removed(location) => state.teardown(&location),
        }
    }
}

impl std::fmt::Debug for LinkedWorksService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedWorksService").finish_non_exhaustive()
    }
}
