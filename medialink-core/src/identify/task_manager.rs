use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use medialink_model::{Discovery, Identification, Location};

use crate::clock::Clock;
use crate::error::{LinkError, Result};
use crate::identify::settings::IdentifySettings;
use crate::provider::{IdentificationProvider, IdentificationStore, StoreError};

/// One result from a background identification task. `identification: None`
/// together with `provider: None` means the provider actively determined
/// the item unidentifiable.
#[derive(Debug, Clone)]
pub struct IdentificationOutcome {
    pub location: Location,
    pub identification: Option<Identification>,
    pub provider: Option<Arc<dyn IdentificationProvider>>,
}

struct TaskHandle {
    provider: Arc<dyn IdentificationProvider>,
    discovery: Discovery,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Owns one background identification task per root location.
///
/// Tasks are unbounded in count but bounded in active work through three
/// shared semaphores: provider queries, a low-priority gate for refresh
/// queries, and store operations. Results go out over a bounded queue;
/// the resource service drains it.
pub struct IdentificationTaskManager {
    clock: Arc<dyn Clock>,
    store: Arc<dyn IdentificationStore>,
    settings: IdentifySettings,
    outcomes: mpsc::Sender<IdentificationOutcome>,
    identification_permits: Arc<Semaphore>,
    low_priority_permits: Arc<Semaphore>,
    database_permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<Location, TaskHandle>>,
}

impl std::fmt::Debug for IdentificationTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentificationTaskManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl IdentificationTaskManager {
    /// Build a manager and the receiving end of its result queue.
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn IdentificationStore>,
        settings: IdentifySettings,
    ) -> (Arc<Self>, mpsc::Receiver<IdentificationOutcome>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let manager = IdentificationTaskManager {
            clock,
            store,
            identification_permits: Arc::new(Semaphore::new(settings.permits.identification)),
            low_priority_permits: Arc::new(Semaphore::new(settings.permits.low_priority)),
            database_permits: Arc::new(Semaphore::new(settings.permits.database)),
            settings,
            outcomes: tx,
            tasks: Mutex::new(HashMap::new()),
        };
        (Arc::new(manager), rx)
    }

    /// Start (or restart, if the provider or discovery changed) the
    /// background task for a root location. Component discoveries are
    /// rejected; their identification is derived from their root.
    pub async fn create(
        &self,
        provider: Arc<dyn IdentificationProvider>,
        discovery: Discovery,
    ) -> Result<()> {
        if discovery.is_component() {
            return Err(LinkError::InvalidDiscovery(format!(
                "component location {} cannot be identified independently",
                discovery.location
            )));
        }

        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&discovery.location) {
            if existing.provider.name() == provider.name() && existing.discovery == discovery {
                return Ok(());
            }
            tracing::debug!(
                target: "identify::manager",
                location = %discovery.location,
                provider = provider.name(),
                "restarting identification task with changed input"
            );
            if let Some(old) = tasks.remove(&discovery.location) {
                old.shutdown().await;
            }
        }

        let handle = self.spawn_task(Arc::clone(&provider), discovery.clone(), false);
        tasks.insert(discovery.location.clone(), handle);
        Ok(())
    }

    /// Cancel and remove the task for a location. Idempotent. Once the
    /// returned future resolves, no further queue publishes occur for that
    /// location.
    pub async fn stop(&self, location: &Location) {
        let removed = self.tasks.lock().await.remove(location);
        if let Some(task) = removed {
            task.shutdown().await;
            tracing::debug!(target: "identify::manager", %location, "identification task stopped");
        }
    }

    /// Stop the current task for a location and restart it in immediate
    /// mode, skipping the store fast path. No-op for unknown locations.
    pub async fn reidentify(&self, location: &Location) {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.remove(location) else {
            return;
        };
        let provider = Arc::clone(&task.provider);
        let discovery = task.discovery.clone();
        task.shutdown().await;

        let handle = self.spawn_task(provider, discovery.clone(), true);
        tasks.insert(discovery.location.clone(), handle);
    }

    /// Stop every task. Used on service shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<TaskHandle> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in drained {
            task.shutdown().await;
        }
    }

    pub async fn is_running(&self, location: &Location) -> bool {
        self.tasks.lock().await.contains_key(location)
    }

    fn spawn_task(
        &self,
        provider: Arc<dyn IdentificationProvider>,
        discovery: Discovery,
        immediate: bool,
    ) -> TaskHandle {
        let token = CancellationToken::new();
        let task = IdentificationTask {
            provider: Arc::clone(&provider),
            discovery: discovery.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            settings: self.settings.clone(),
            outcomes: self.outcomes.clone(),
            identification_permits: Arc::clone(&self.identification_permits),
            low_priority_permits: Arc::clone(&self.low_priority_permits),
            database_permits: Arc::clone(&self.database_permits),
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run(immediate));
        TaskHandle {
            provider,
            discovery,
            token,
            handle,
        }
    }
}

/// State carried by one per-root identification loop.
struct IdentificationTask {
    provider: Arc<dyn IdentificationProvider>,
    discovery: Discovery,
    store: Arc<dyn IdentificationStore>,
    clock: Arc<dyn Clock>,
    settings: IdentifySettings,
    outcomes: mpsc::Sender<IdentificationOutcome>,
    identification_permits: Arc<Semaphore>,
    low_priority_permits: Arc<Semaphore>,
    database_permits: Arc<Semaphore>,
    token: CancellationToken,
}

/// Last published pair, for change detection.
type Published = (Option<Identification>, Option<String>);

impl IdentificationTask {
    async fn run(mut self, immediate: bool) {
        let location = self.discovery.location.clone();
        tracing::debug!(
            target: "identify::task",
            %location,
            provider = self.provider.name(),
            immediate,
            "identification task started"
        );

        let mut last_published: Option<Published> = None;
        let mut has_identified = false;
        let mut interval = self.settings.refresh.standard();

        if !immediate && self.store_fast_path(&location, &mut last_published).await {
            has_identified = true;
        }
        if self.token.is_cancelled() {
            return;
        }

        loop {
            // Refresh queries from already-identified tasks take the extra
            // low-priority gate first so first-time identifications are
            // never starved behind periodic refreshes.
            let _low = if has_identified {
                match self.acquire(&self.low_priority_permits).await {
                    Some(permit) => Some(permit),
                    None => return,
                }
            } else {
                None
            };
            let permit = match self.acquire(&self.identification_permits).await {
                Some(permit) => permit,
                None => return,
            };

            let result = tokio::select! {
                _ = self.token.cancelled() => return,
                result = self.provider.identify(&self.discovery) => result,
            };
            drop(permit);
            drop(_low);

            match result {
                Ok(Some(identification)) => {
                    has_identified = true;
                    self.publish(
                        &location,
                        Some(identification.clone()),
                        Some(Arc::clone(&self.provider)),
                        &mut last_published,
                    )
                    .await;
                    if self.token.is_cancelled() {
                        return;
                    }
                    self.persist(&location, &identification).await;
                    interval = self.settings.refresh.growth.next_interval(interval);
                    if self.idle(interval).await {
                        return;
                    }
                }
                Ok(None) => {
                    tracing::warn!(
                        target: "identify::task",
                        %location,
                        provider = self.provider.name(),
                        "provider determined item unidentifiable"
                    );
                    has_identified = true;
                    self.publish(&location, None, None, &mut last_published).await;
                    if self.idle(self.settings.refresh.standard()).await {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        target: "identify::task",
                        %location,
                        provider = self.provider.name(),
                        error = %err,
                        "provider query failed, backing off"
                    );
                    if self.idle(self.settings.refresh.error()).await {
                        return;
                    }
                }
            }

            if self.token.is_cancelled() {
                return;
            }
        }
    }

    /// Read the last persisted identification and, on a hit, publish it and
    /// sleep out the remainder of its refresh window. Returns whether an
    /// identification was found.
    async fn store_fast_path(
        &mut self,
        location: &Location,
        last_published: &mut Option<Published>,
    ) -> bool {
        let Some(permit) = self.acquire(&self.database_permits).await else {
            return false;
        };
        let found = tokio::select! {
            _ = self.token.cancelled() => return false,
            found = self.store.find(location) => found,
        };
        drop(permit);

        match found {
            Ok(Some(identification)) => {
                let wake = identification.match_.created_at + self.settings.refresh.standard();
                self.publish(
                    location,
                    Some(identification),
                    Some(Arc::clone(&self.provider)),
                    last_published,
                )
                .await;
                self.idle_until(wake).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(
                    target: "identify::task",
                    %location,
                    error = %err,
                    "store lookup failed, querying provider directly"
                );
                false
            }
        }
    }

    /// Send an outcome unless it equals the previously published
    /// `(identification, provider)` pair.
    async fn publish(
        &self,
        location: &Location,
        identification: Option<Identification>,
        provider: Option<Arc<dyn IdentificationProvider>>,
        last_published: &mut Option<Published>,
    ) {
        let pair: Published = (
            identification.clone(),
            provider.as_ref().map(|p| p.name().to_string()),
        );
        if last_published.as_ref() == Some(&pair) {
            tracing::trace!(
                target: "identify::task",
                %location,
                "suppressing unchanged identification"
            );
            return;
        }
        *last_published = Some(pair);

        let outcome = IdentificationOutcome {
            location: location.clone(),
            identification,
            provider,
        };
        tokio::select! {
            _ = self.token.cancelled() => {}
            sent = self.outcomes.send(outcome) => {
                if sent.is_err() {
                    tracing::debug!(
                        target: "identify::task",
                        %location,
                        "result queue closed, dropping outcome"
                    );
                }
            }
        }
    }

    /// Persist the identification, retrying transient failures with a fixed
    /// backoff, then one unconditional final attempt. A persistent outage is
    /// fatal to this iteration only. The database permit is taken per
    /// attempt and released before each backoff, so a task sitting out a
    /// retry never blocks other tasks' store access.
    async fn persist(&self, location: &Location, identification: &Identification) {
        let retries = self.settings.persist.retries;
        let backoff = Duration::seconds(self.settings.persist.backoff_secs as i64);
        for attempt in 1..=retries {
            match self.try_store(location, identification).await {
                None => return,
                Some(Ok(())) => return,
                Some(Err(err)) => {
                    tracing::warn!(
                        target: "identify::persist",
                        %location,
                        attempt,
                        error = %err,
                        "store write failed, retrying"
                    );
                    if self.idle(backoff).await {
                        return;
                    }
                }
            }
        }

        // Final attempt; its outcome stands.
        match self.try_store(location, identification).await {
            None | Some(Ok(())) => {}
            Some(Err(err)) => {
                tracing::error!(
                    target: "identify::persist",
                    %location,
                    error = %err,
                    "store write failed after all retries"
                );
            }
        }
    }

    /// One write attempt under a freshly acquired database permit. `None`
    /// means the task was cancelled before or during the write.
    async fn try_store(
        &self,
        location: &Location,
        identification: &Identification,
    ) -> Option<std::result::Result<(), StoreError>> {
        let _permit = self.acquire(&self.database_permits).await?;
        tokio::select! {
            _ = self.token.cancelled() => None,
            result = self.store.store(location, identification) => Some(result),
        }
    }

    async fn acquire(&self, semaphore: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
        }
    }

    /// Cancellable sleep. Returns true if cancelled.
    async fn idle(&self, duration: Duration) -> bool {
        let duration = duration.to_std().unwrap_or_default();
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn idle_until(&self, wake: DateTime<Utc>) -> bool {
        let remaining = wake - self.clock.now();
        if remaining <= Duration::zero() {
            return self.token.is_cancelled();
        }
        self.idle(remaining).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use chrono::Utc;
    use medialink_model::{
        DataSource, DiscoveryAttributes, Match, MatchKind, MediaKind, ReleaseDescriptor,
        WorkAttributes, WorkId,
    };
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn discovery(url: &str, kind: MediaKind) -> Discovery {
        Discovery {
            location: Location::parse(url).unwrap(),
            kind,
            attributes: DiscoveryAttributes {
                title: "A".into(),
                ..Default::default()
            },
            discovered_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    fn identification(value: &str) -> Identification {
        Identification {
            match_: Match {
                kind: MatchKind::Name,
                accuracy: 0.9,
                created_at: Utc::now(),
            },
            releases: vec![ReleaseDescriptor {
                id: WorkId::new(DataSource::new("fake"), value),
                kind: MediaKind::Movie,
                attributes: WorkAttributes::default(),
                parent: None,
            }],
        }
    }

    /// Provider that replays a scripted sequence of answers, then repeats
    /// the last one.
    #[derive(Debug)]
    struct ScriptedProvider {
        answers: StdMutex<Vec<Option<Identification>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<Option<Identification>>) -> Arc<Self> {
            Arc::new(ScriptedProvider {
                answers: StdMutex::new(answers),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IdentificationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn identify(
            &self,
            _discovery: &Discovery,
        ) -> std::result::Result<Option<Identification>, crate::provider::ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                Ok(answers.remove(0))
            } else {
                Ok(answers.first().cloned().flatten())
            }
        }

        fn identify_child(&self, _child: &Discovery, parent: &Identification) -> Identification {
            parent.clone()
        }
    }

    #[derive(Debug, Default)]
    struct RecordingStore {
        entries: StdMutex<HashMap<Location, Identification>>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl IdentificationStore for RecordingStore {
        async fn find(
            &self,
            location: &Location,
        ) -> std::result::Result<Option<Identification>, StoreError> {
            Ok(self.entries.lock().unwrap().get(location).cloned())
        }

        async fn store(
            &self,
            location: &Location,
            identification: &Identification,
        ) -> std::result::Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.entries
                .lock()
                .unwrap()
                .insert(location.clone(), identification.clone());
            Ok(())
        }
    }

    /// Store whose writes fail for locations mentioning `broken`, keeping
    /// that persist loop in backoff while other locations write normally.
    #[derive(Debug, Default)]
    struct BrokenWriteStore {
        writes: AtomicUsize,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl IdentificationStore for BrokenWriteStore {
        async fn find(
            &self,
            _location: &Location,
        ) -> std::result::Result<Option<Identification>, StoreError> {
            Ok(None)
        }

        async fn store(
            &self,
            location: &Location,
            _identification: &Identification,
        ) -> std::result::Result<(), StoreError> {
            if location.as_str().contains("broken") {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Write("disk full".into()))
            } else {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn manager(
        store: Arc<RecordingStore>,
    ) -> (
        Arc<IdentificationTaskManager>,
        mpsc::Receiver<IdentificationOutcome>,
    ) {
        IdentificationTaskManager::new(
            Arc::new(SystemClock),
            store,
            IdentifySettings::default(),
        )
    }

    async fn next_outcome(
        rx: &mut mpsc::Receiver<IdentificationOutcome>,
    ) -> IdentificationOutcome {
        tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .expect("outcome within timeout")
            .expect("queue open")
    }

    #[tokio::test(start_paused = true)]
    async fn identifies_and_persists_a_root() {
        let store = Arc::new(RecordingStore::default());
        let (manager, mut rx) = manager(Arc::clone(&store));
        let provider = ScriptedProvider::new(vec![Some(identification("42"))]);
        let disco = discovery("file:///movies/A.mkv", MediaKind::Movie);

        manager
            .create(provider, disco.clone())
            .await
            .unwrap();

        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.location, disco.location);
        assert!(outcome.identification.is_some());
        assert_eq!(outcome.provider.as_ref().map(|p| p.name()), Some("scripted"));

        // Give the persist path a chance to run.
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        manager.stop(&disco.location).await;
    }

    #[tokio::test]
    async fn rejects_component_discoveries() {
        let store = Arc::new(RecordingStore::default());
        let (manager, _rx) = manager(store);
        let provider = ScriptedProvider::new(vec![None]);
        let disco = discovery("file:///shows/S/e1.mkv", MediaKind::Episode);

        let err = manager.create(provider, disco).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidDiscovery(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_no_match_is_published_once() {
        let store = Arc::new(RecordingStore::default());
        let (manager, mut rx) = manager(store);
        let provider = ScriptedProvider::new(vec![None, None]);
        let disco = discovery("file:///movies/B.mkv", MediaKind::Movie);

        manager.create(provider, disco.clone()).await.unwrap();

        let first = next_outcome(&mut rx).await;
        assert!(first.identification.is_none());
        assert!(first.provider.is_none());

        // The task refreshes on the standard schedule; paused time lets it
        // run several cycles. No second publish may arrive for the
        // unchanged (None, None) pair.
        let second = tokio::time::timeout(StdDuration::from_secs(60 * 60 * 24 * 30), rx.recv());
        tokio::select! {
            outcome = second => panic!("unexpected duplicate publish: {outcome:?}"),
            _ = tokio::time::sleep(StdDuration::from_secs(60 * 60 * 24 * 29)) => {}
        }

        manager.stop(&disco.location).await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_hit_skips_provider_until_refresh() {
        let store = Arc::new(RecordingStore::default());
        let disco = discovery("file:///movies/C.mkv", MediaKind::Movie);
        store
            .entries
            .lock()
            .unwrap()
            .insert(disco.location.clone(), identification("7"));

        let (manager, mut rx) = manager(Arc::clone(&store));
        let provider = ScriptedProvider::new(vec![Some(identification("7"))]);
        manager
            .create(Arc::clone(&provider) as Arc<dyn IdentificationProvider>, disco.clone())
            .await
            .unwrap();

        let outcome = next_outcome(&mut rx).await;
        assert!(outcome.identification.is_some());
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        manager.stop(&disco.location).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_silences_the_queue() {
        let store = Arc::new(RecordingStore::default());
        let (manager, mut rx) = manager(store);
        let provider = ScriptedProvider::new(vec![Some(identification("1"))]);
        let disco = discovery("file:///movies/D.mkv", MediaKind::Movie);

        manager.create(provider, disco.clone()).await.unwrap();
        let _ = next_outcome(&mut rx).await;

        manager.stop(&disco.location).await;
        manager.stop(&disco.location).await;
        assert!(!manager.is_running(&disco.location).await);

        // Nothing may arrive after stop resolves.
        tokio::select! {
            outcome = rx.recv() => {
                if let Some(outcome) = outcome {
                    panic!("publish after stop: {outcome:?}");
                }
            }
            _ = tokio::time::sleep(StdDuration::from_secs(60 * 60 * 24 * 30)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reidentify_restarts_in_immediate_mode() {
        let store = Arc::new(RecordingStore::default());
        let disco = discovery("file:///movies/E.mkv", MediaKind::Movie);
        // A store hit would normally put the task to sleep for two weeks.
        store
            .entries
            .lock()
            .unwrap()
            .insert(disco.location.clone(), identification("old"));

        let (manager, mut rx) = manager(Arc::clone(&store));
        let provider = ScriptedProvider::new(vec![Some(identification("new"))]);
        manager
            .create(
                Arc::clone(&provider) as Arc<dyn IdentificationProvider>,
                disco.clone(),
            )
            .await
            .unwrap();
        let first = next_outcome(&mut rx).await;
        assert_eq!(
            first.identification.unwrap().releases[0].id.value,
            "old"
        );

        manager.reidentify(&disco.location).await;
        let second = next_outcome(&mut rx).await;
        assert_eq!(
            second.identification.unwrap().releases[0].id.value,
            "new"
        );
        assert!(provider.calls.load(Ordering::SeqCst) >= 1);

        manager.stop(&disco.location).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_time_identifications_bypass_the_low_priority_gate() {
        let store = Arc::new(RecordingStore::default());
        // No low-priority permits at all: refresh queries block forever,
        // first-time identifications must still get through.
        let settings = IdentifySettings {
            permits: crate::identify::PermitSettings {
                low_priority: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let (manager, mut rx) =
            IdentificationTaskManager::new(Arc::new(SystemClock), store, settings);

        let first = discovery("file:///movies/first.mkv", MediaKind::Movie);
        manager
            .create(
                ScriptedProvider::new(vec![Some(identification("1"))]),
                first.clone(),
            )
            .await
            .unwrap();
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.location, first.location);

        // Let the first task reach its refresh cycle, where it now waits
        // on the (empty) low-priority gate.
        tokio::time::sleep(StdDuration::from_secs(15 * 24 * 60 * 60)).await;

        let second = discovery("file:///movies/second.mkv", MediaKind::Movie);
        manager
            .create(
                ScriptedProvider::new(vec![Some(identification("2"))]),
                second.clone(),
            )
            .await
            .unwrap();
        let outcome = next_outcome(&mut rx).await;
        assert_eq!(outcome.location, second.location);

        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_backing_off_persist_does_not_hold_the_database_permit() {
        // One database permit total: a task that kept it through its
        // retry backoff would stall every other task's store access.
        let settings = IdentifySettings {
            permits: crate::identify::PermitSettings {
                database: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(BrokenWriteStore::default());
        let (manager, mut rx) =
            IdentificationTaskManager::new(
                Arc::new(SystemClock),
                Arc::clone(&store) as Arc<dyn IdentificationStore>,
                settings,
            );

        let broken = discovery("file:///movies/broken.mkv", MediaKind::Movie);
        manager
            .create(
                ScriptedProvider::new(vec![Some(identification("b"))]),
                broken.clone(),
            )
            .await
            .unwrap();
        let first = next_outcome(&mut rx).await;
        assert_eq!(first.location, broken.location);
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert!(store.failures.load(Ordering::SeqCst) >= 1);

        // With the broken task now sitting out its first backoff, another
        // task's full store round trip must still go through.
        let healthy = discovery("file:///movies/healthy.mkv", MediaKind::Movie);
        manager
            .create(
                ScriptedProvider::new(vec![Some(identification("h"))]),
                healthy.clone(),
            )
            .await
            .unwrap();
        let second = next_outcome(&mut rx).await;
        assert_eq!(second.location, healthy.location);

        // Well inside the 60s backoff window.
        tokio::time::timeout(StdDuration::from_secs(30), async {
            while store.writes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("write lands during the other task's backoff");

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn create_with_unchanged_input_keeps_the_running_task() {
        let store = Arc::new(RecordingStore::default());
        let (manager, mut rx) = manager(store);
        let provider = ScriptedProvider::new(vec![Some(identification("x"))]);
        let disco = discovery("file:///movies/F.mkv", MediaKind::Movie);

        manager
            .create(
                Arc::clone(&provider) as Arc<dyn IdentificationProvider>,
                disco.clone(),
            )
            .await
            .unwrap();
        let _ = next_outcome(&mut rx).await;
        let calls = provider.calls.load(Ordering::SeqCst);

        manager
            .create(
                Arc::clone(&provider) as Arc<dyn IdentificationProvider>,
                disco.clone(),
            )
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls);

        manager.stop(&disco.location).await;
    }
}
