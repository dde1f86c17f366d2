use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ordered in-process event stream with replay.
///
/// Publishing appends to a retained history and fans the item out over a
/// broadcast channel; subscribing replays the history first and then applies
/// live items in publish order, so late subscribers observe exactly the same
/// ordered stream as early ones. This is the wiring seam between the
/// resource, linked-resource, and linked-work stages.
pub struct Source<T> {
    name: Arc<str>,
    shared: Arc<Mutex<Shared<T>>>,
}

struct Shared<T> {
    history: Vec<T>,
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source {
            name: Arc::clone(&self.name),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("name", &self.name).finish()
    }
}

impl<T: Clone + Send + 'static> Source<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Source {
            name: name.into().into(),
            shared: Arc::new(Mutex::new(Shared {
                history: Vec::new(),
                tx,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` to the stream. History append and broadcast send happen
    /// under one lock so a concurrent subscriber sees the item exactly once,
    /// either in its replay or live. Never blocks on slow subscribers.
    pub fn publish(&self, item: T) {
        let mut shared = self.lock();
        shared.history.push(item.clone());
        let _ = shared.tx.send(item);
    }

    /// Ordered copy of everything published so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().history.clone()
    }

    /// Spawn a consumer that replays the retained history through `handler`
    /// and then follows the live stream. `Subscription::join` resolves once
    /// the replay has been worked off.
    ///
    /// Delivery is driven by the history index; the broadcast channel only
    /// wakes the consumer. A subscriber that falls behind the channel
    /// capacity therefore re-reads the span it missed from the history
    /// instead of skipping it.
    pub fn subscribe<H, Fut>(&self, subscriber: impl Into<String>, mut handler: H) -> Subscription
    where
        H: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (backlog_len, mut rx) = {
            let shared = self.lock();
            (shared.history.len(), shared.tx.subscribe())
        };

        let subscriber = subscriber.into();
        let source_name = Arc::clone(&self.name);
        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = watch::channel(false);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_subscriber = subscriber.clone();

        let handle = tokio::spawn(async move {
            let mut next = 0usize;
            let mut caught_up = false;
            loop {
                // Deliver everything recorded beyond `next`, in batches so
                // the history lock is not held across handler awaits.
                loop {
                    let pending: Vec<T> = {
                        let shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        shared.history.get(next..).map(<[T]>::to_vec).unwrap_or_default()
                    };
                    if pending.is_empty() {
                        break;
                    }
                    for item in pending {
                        if task_token.is_cancelled() {
                            return;
                        }
                        handler(item).await;
                        next += 1;
                    }
                }
                if !caught_up && next >= backlog_len {
                    caught_up = true;
                    let _ = ready_tx.send(true);
                }

                tokio::select! {
                    _ = task_token.cancelled() => break,
                    wakeup = rx.recv() => match wakeup {
                        // The item itself is re-read from the history by
                        // index, so a lagged receiver loses nothing.
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target: "link::source",
                                source = %source_name,
                                subscriber = %task_subscriber,
                                skipped,
                                "subscriber lagged, catching up from history"
                            );
                        }
                    }
                }
            }
        });

        Subscription {
            id: Uuid::now_v7(),
            subscriber,
            ready: ready_rx,
            token,
            handle,
        }
    }
}

/// Handle to a running subscriber task.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    subscriber: String,
    ready: watch::Receiver<bool>,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Wait until the subscriber has caught up with the history that existed
    /// at subscribe time. Used to sequence one subscription behind another.
    pub async fn join(&mut self) {
        let _ = self.ready.wait_for(|caught_up| *caught_up).await;
    }

    /// Cooperatively stop the subscriber task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the subscriber task to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn recording_handler(
        seen: Arc<StdMutex<Vec<u32>>>,
    ) -> impl FnMut(u32) -> std::future::Ready<()> + Send + 'static {
        move |item| {
            seen.lock().unwrap().push(item);
            std::future::ready(())
        }
    }

    async fn wait_for_len(seen: &Arc<StdMutex<Vec<u32>>>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if seen.lock().unwrap().len() >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber caught up");
    }

    #[tokio::test]
    async fn replays_history_before_live_items() {
        let source: Source<u32> = Source::new("numbers", 16);
        source.publish(1);
        source.publish(2);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut sub = source.subscribe("test", recording_handler(Arc::clone(&seen)));
        sub.join().await;

        source.publish(3);
        wait_for_len(&seen, 3).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn join_resolves_after_replay() {
        let source: Source<u32> = Source::new("numbers", 16);
        for n in 0..10 {
            source.publish(n);
        }

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut sub = source.subscribe("test", recording_handler(Arc::clone(&seen)));
        sub.join().await;

        assert_eq!(seen.lock().unwrap().len(), 10);
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let source: Source<u32> = Source::new("numbers", 16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut sub = source.subscribe("test", recording_handler(Arc::clone(&seen)));
        sub.join().await;

        sub.shutdown().await;
        source.publish(7);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_catches_up_without_losing_items() {
        let source: Source<u32> = Source::new("numbers", 4);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let mut sub = source.subscribe("slow", {
            let seen = Arc::clone(&seen);
            let gate = Arc::clone(&gate);
            move |item: u32| {
                let seen = Arc::clone(&seen);
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    seen.lock().unwrap().push(item);
                }
            }
        });
        sub.join().await;

        // Far more items than the channel holds while the handler is stuck
        // on the first one.
        for n in 0..50 {
            source.publish(n);
        }
        gate.add_permits(50);

        wait_for_len(&seen, 50).await;
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<u32>>());
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_preserves_publish_order() {
        let source: Source<u32> = Source::new("numbers", 16);
        for n in [5, 3, 9] {
            source.publish(n);
        }
        assert_eq!(source.snapshot(), vec![5, 3, 9]);
    }
}
