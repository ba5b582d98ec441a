use crate::errors::{SyncError, SyncResult};
use crate::models::{ChangeEvent, ChangeEventType, EntityKind, SyncConfig};
use crate::remote::RemoteStore;
use crate::store::EntityStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Maintains one change-feed worker per synced entity kind for a single user.
/// Workers apply remote events to the store, resubscribe with exponential
/// backoff after transport drops, and run a full collection resync on every
/// (re)subscription, since events missed during a gap are otherwise lost.
#[derive(Clone)]
pub struct ChangeFeedSubscriber {
    remote: Arc<dyn RemoteStore>,
    store: Arc<EntityStore>,
    user_id: String,
    config: SyncConfig,
    workers: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    // Set before workers are aborted: an abort lands at the next await, so a
    // worker mid-poll could otherwise still drain events it already received.
    suspended: Arc<AtomicBool>,
}

impl ChangeFeedSubscriber {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<EntityStore>,
        user_id: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            store,
            user_id: user_id.into(),
            config,
            workers: Arc::new(StdMutex::new(Vec::new())),
            suspended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn one feed worker per synced entity kind. No-op if workers are
    /// already running.
    pub fn start(&self) {
        let mut workers = self.lock_workers();
        self.suspended.store(false, Ordering::SeqCst);
        if !workers.is_empty() {
            return;
        }
        for kind in EntityKind::SYNCED {
            let subscriber = self.clone();
            workers.push(tokio::spawn(async move {
                subscriber.feed_loop(kind).await;
            }));
        }
    }

    /// Stop all workers immediately. No event is applied to the store after
    /// this returns: the suspended flag is raised before the aborts, and
    /// every store-touching path re-checks it, so a worker finishing its
    /// current poll on another thread discards anything it still drains.
    pub fn suspend(&self) {
        let mut workers = self.lock_workers();
        self.suspended.store(true, Ordering::SeqCst);
        for worker in workers.drain(..) {
            worker.abort();
        }
    }

    /// Restart the feed workers; each one resyncs its collection before
    /// consuming events, which doubles as the forced resync after an offline
    /// gap.
    pub fn resume(&self) {
        self.suspend();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        !self.lock_workers().is_empty()
    }

    async fn feed_loop(&self, kind: EntityKind) {
        let mut backoff = self.config.resubscribe_initial_backoff;
        loop {
            match self.remote.subscribe(kind, &self.user_id).await {
                Ok(mut subscription) => match self.resync_collection(kind).await {
                    Ok(()) => {
                        backoff = self.config.resubscribe_initial_backoff;
                        while let Some(event) = subscription.events.recv().await {
                            self.apply(kind, event);
                        }
                        tracing::warn!(
                            kind = kind.as_str(),
                            "change feed dropped; resubscribing"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(kind = kind.as_str(), %err, "resync failed");
                        subscription.unsubscribe();
                    }
                },
                Err(err) => {
                    tracing::warn!(kind = kind.as_str(), %err, "subscription attempt failed");
                }
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.resubscribe_max_backoff);
        }
    }

    /// Apply one feed event to the store. The remote is required to filter by
    /// user server-side; the user scope is still re-checked here and
    /// mismatches discarded.
    fn apply(&self, kind: EntityKind, event: ChangeEvent) {
        if self.suspended.load(Ordering::SeqCst) {
            return;
        }
        if event.entity_kind != kind {
            tracing::warn!(
                expected = kind.as_str(),
                got = event.entity_kind.as_str(),
                "discarding event for wrong entity kind"
            );
            return;
        }
        match event.event_type {
            ChangeEventType::Insert | ChangeEventType::Update => {
                let owner = event.payload.get("userId").and_then(|v| v.as_str());
                if owner != Some(self.user_id.as_str()) {
                    tracing::warn!(
                        kind = kind.as_str(),
                        entity_id = %event.entity_id,
                        "discarding event scoped to another user"
                    );
                    return;
                }
                // Duplicate or out-of-order insert/update events are safe to
                // re-apply thanks to the store's merge semantics. A delete
                // overtaken by a late insert can resurrect the entity; the
                // feed carries no sequence numbers, so that race is accepted.
                self.store.upsert(kind, &event.entity_id, event.payload);
            }
            ChangeEventType::Delete => {
                self.store.remove(kind, &event.entity_id);
            }
        }
    }

    /// Fetch the full remote collection and reconcile the cache against it:
    /// everything present remotely is upserted, everything locally present
    /// but absent remotely is evicted (a delete may have been missed).
    pub async fn resync_collection(&self, kind: EntityKind) -> SyncResult<()> {
        let records = self
            .remote
            .fetch_all(kind, &self.user_id)
            .await
            .map_err(|err| SyncError::Subscription(err.to_string()))?;
        if self.suspended.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
        for record in records {
            let Some(id) = record.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
                tracing::warn!(kind = kind.as_str(), "skipping remote record without id");
                continue;
            };
            self.store.upsert(kind, &id, record);
            seen.insert(id);
        }
        self.store.retain(kind, &seen);
        tracing::debug!(kind = kind.as_str(), count = seen.len(), "collection resynced");
        Ok(())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
