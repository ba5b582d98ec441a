use crate::errors::{SyncError, SyncResult};
use crate::models::{
    EntityKind, JsonMap, MutationOperation, MutationStatus, PendingMutation, LOCAL_ID_PREFIX,
};
use crate::remote::RemoteStore;
use crate::store::EntityStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// Outcome handle for one optimistic mutation. The store is already mutated
/// by the time a receipt exists; `completion` resolves with the server-side
/// entity id once the remote write lands, or with the error that triggered a
/// rollback. Dropping the receipt is fine — the write still runs to
/// completion.
#[derive(Debug)]
pub struct MutationReceipt {
    pub mutation_id: String,
    pub entity_id: String,
    pub completion: oneshot::Receiver<SyncResult<String>>,
}

/// Local-first create/update/delete. Mutations hit the EntityStore
/// immediately (creates under a `local-` temp id), then the remote write runs
/// in a spawned task, serialized per entity id so a second mutation on the
/// same entity queues behind the first. Remote failure rolls the optimistic
/// mutation back; remote success re-keys creates to the server id and lets
/// the change-feed echo reconcile the rest.
#[derive(Clone)]
pub struct MutationCoordinator {
    remote: Arc<dyn RemoteStore>,
    store: Arc<EntityStore>,
    user_id: String,
    pending: Arc<StdMutex<HashMap<String, PendingMutation>>>,
    write_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    // Filled on create success so mutations queued behind a create can
    // resolve the temp id to the server-assigned one.
    id_aliases: Arc<StdMutex<HashMap<String, String>>>,
    // Temp ids whose create was rolled back. Mutations queued behind the
    // create fail fast instead of restoring a snapshot of the dead draft.
    dead_ids: Arc<StdMutex<HashSet<String>>>,
}

impl MutationCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<EntityStore>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            store,
            user_id: user_id.into(),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            write_locks: Arc::new(StdMutex::new(HashMap::new())),
            id_aliases: Arc::new(StdMutex::new(HashMap::new())),
            dead_ids: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Create an entity. Validation failures return before any store or
    /// network effect. Otherwise the draft is visible in the store under a
    /// temp id by the time this returns.
    pub fn create_entity(&self, kind: EntityKind, draft: JsonMap) -> SyncResult<MutationReceipt> {
        validate_payload(kind, &draft, true)?;

        let temp_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());
        let now = Utc::now();

        let mut optimistic = draft.clone();
        optimistic.insert("id".to_string(), temp_id.clone().into());
        optimistic.insert("userId".to_string(), self.user_id.clone().into());
        optimistic.insert("createdAt".to_string(), now.to_rfc3339().into());
        optimistic.insert("updatedAt".to_string(), now.to_rfc3339().into());
        self.store.upsert(kind, &temp_id, optimistic);

        let mut remote_draft = draft;
        remote_draft.insert("userId".to_string(), self.user_id.clone().into());

        let (receipt, done) = self.track(kind, &temp_id, MutationOperation::Create);
        let coordinator = self.clone();
        let mutation_id = receipt.mutation_id.clone();
        let entity_id = temp_id;
        tokio::spawn(async move {
            let lock = coordinator.write_lock(&entity_id);
            let guard = lock.clone().lock_owned().await;
            let outcome = match coordinator.remote.create(kind, remote_draft).await {
                Ok(entity) => match entity.get("id").and_then(|v| v.as_str()).map(str::to_string) {
                    Some(server_id) => {
                        coordinator.store.rekey(kind, &entity_id, &server_id);
                        coordinator.store.upsert(kind, &server_id, entity);
                        coordinator.alias(&entity_id, &server_id);
                        coordinator.finish(&mutation_id, MutationStatus::Confirmed);
                        Ok(server_id)
                    }
                    None => {
                        coordinator.store.remove(kind, &entity_id);
                        coordinator.mark_dead(&entity_id);
                        coordinator.finish(&mutation_id, MutationStatus::Failed);
                        Err(SyncError::RemoteWrite(
                            "create response missing entity id".to_string(),
                        ))
                    }
                },
                Err(err) => {
                    tracing::warn!(kind = kind.as_str(), %err, "create failed; rolling back draft");
                    coordinator.store.remove(kind, &entity_id);
                    coordinator.mark_dead(&entity_id);
                    coordinator.finish(&mutation_id, MutationStatus::Failed);
                    Err(SyncError::RemoteWrite(err.to_string()))
                }
            };
            drop(guard);
            coordinator.release_write_lock(&entity_id, lock);
            let _ = done.send(outcome);
        });
        Ok(receipt)
    }

    /// Patch an entity. The patch lands in the store immediately; on remote
    /// failure the pre-mutation snapshot is restored.
    pub fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        patch: JsonMap,
    ) -> SyncResult<MutationReceipt> {
        validate_payload(kind, &patch, false)?;
        let snapshot = self
            .store
            .get(kind, id)
            .ok_or_else(|| SyncError::NotFound(format!("no {} with id {id}", kind.as_str())))?;

        let mut optimistic = patch.clone();
        optimistic.insert("updatedAt".to_string(), Utc::now().to_rfc3339().into());
        self.store.upsert(kind, id, optimistic);

        let (receipt, done) = self.track(kind, id, MutationOperation::Update);
        let coordinator = self.clone();
        let mutation_id = receipt.mutation_id.clone();
        let submitted_id = id.to_string();
        tokio::spawn(async move {
            let lock = coordinator.write_lock(&submitted_id);
            let guard = lock.clone().lock_owned().await;
            // A create queued ahead of us may have swapped the temp id for a
            // server id while we waited, or rolled the draft back entirely.
            let remote_id = coordinator.resolve(&submitted_id);
            let outcome = if coordinator.is_dead(&remote_id) {
                coordinator.finish(&mutation_id, MutationStatus::Failed);
                Err(SyncError::RemoteWrite(format!(
                    "entity {remote_id} was rolled back before this update ran"
                )))
            } else {
                match coordinator.remote.update(kind, &remote_id, patch).await {
                    Ok(entity) => {
                        coordinator.store.upsert(kind, &remote_id, entity);
                        coordinator.finish(&mutation_id, MutationStatus::Confirmed);
                        Ok(remote_id.clone())
                    }
                    Err(err) => {
                        tracing::warn!(kind = kind.as_str(), entity_id = %remote_id, %err, "update failed; restoring snapshot");
                        let mut snapshot = snapshot;
                        snapshot.insert("id".to_string(), remote_id.clone().into());
                        coordinator.store.restore(kind, &remote_id, snapshot);
                        coordinator.finish(&mutation_id, MutationStatus::Failed);
                        Err(SyncError::RemoteWrite(err.to_string()))
                    }
                }
            };
            drop(guard);
            coordinator.release_write_lock(&submitted_id, lock);
            let _ = done.send(outcome);
        });
        Ok(receipt)
    }

    /// Delete an entity. Applied optimistically; the entity is re-inserted if
    /// the remote delete fails.
    pub fn delete_entity(&self, kind: EntityKind, id: &str) -> SyncResult<MutationReceipt> {
        let snapshot = self
            .store
            .get(kind, id)
            .ok_or_else(|| SyncError::NotFound(format!("no {} with id {id}", kind.as_str())))?;
        self.store.remove(kind, id);

        let (receipt, done) = self.track(kind, id, MutationOperation::Delete);
        let coordinator = self.clone();
        let mutation_id = receipt.mutation_id.clone();
        let submitted_id = id.to_string();
        tokio::spawn(async move {
            let lock = coordinator.write_lock(&submitted_id);
            let guard = lock.clone().lock_owned().await;
            let remote_id = coordinator.resolve(&submitted_id);
            let outcome = if coordinator.is_dead(&remote_id) {
                // The draft never reached the server and is already gone from
                // the store; there is nothing left to delete or restore.
                coordinator.finish(&mutation_id, MutationStatus::Failed);
                Err(SyncError::RemoteWrite(format!(
                    "entity {remote_id} was rolled back before this delete ran"
                )))
            } else {
                match coordinator.remote.delete(kind, &remote_id).await {
                    Ok(()) => {
                        coordinator.finish(&mutation_id, MutationStatus::Confirmed);
                        Ok(remote_id.clone())
                    }
                    Err(err) => {
                        tracing::warn!(kind = kind.as_str(), entity_id = %remote_id, %err, "delete failed; re-inserting entity");
                        let mut snapshot = snapshot;
                        snapshot.insert("id".to_string(), remote_id.clone().into());
                        coordinator.store.restore(kind, &remote_id, snapshot);
                        coordinator.finish(&mutation_id, MutationStatus::Failed);
                        Err(SyncError::RemoteWrite(err.to_string()))
                    }
                }
            };
            drop(guard);
            coordinator.release_write_lock(&submitted_id, lock);
            let _ = done.send(outcome);
        });
        Ok(receipt)
    }

    /// Snapshot of mutations still awaiting a remote outcome.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.lock_pending().values().cloned().collect()
    }

    fn track(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: MutationOperation,
    ) -> (MutationReceipt, oneshot::Sender<SyncResult<String>>) {
        let mutation_id = Uuid::new_v4().to_string();
        let mutation = PendingMutation {
            mutation_id: mutation_id.clone(),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            operation,
            submitted_at: Utc::now(),
            status: MutationStatus::InFlight,
        };
        self.lock_pending().insert(mutation_id.clone(), mutation);

        let (done, completion) = oneshot::channel();
        (
            MutationReceipt {
                mutation_id,
                entity_id: entity_id.to_string(),
                completion,
            },
            done,
        )
    }

    fn finish(&self, mutation_id: &str, status: MutationStatus) {
        let removed = self.lock_pending().remove(mutation_id);
        if let Some(mutation) = removed {
            tracing::debug!(
                mutation_id,
                entity_id = %mutation.entity_id,
                status = ?status,
                "pending mutation resolved"
            );
        }
    }

    fn alias(&self, temp_id: &str, server_id: &str) {
        let mut aliases = lock_or_recover(&self.id_aliases);
        aliases.insert(temp_id.to_string(), server_id.to_string());
    }

    fn resolve(&self, id: &str) -> String {
        let aliases = lock_or_recover(&self.id_aliases);
        aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    fn mark_dead(&self, temp_id: &str) {
        let mut dead = lock_or_recover(&self.dead_ids);
        dead.insert(temp_id.to_string());
    }

    fn is_dead(&self, id: &str) -> bool {
        let dead = lock_or_recover(&self.dead_ids);
        dead.contains(id)
    }

    fn write_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_or_recover(&self.write_locks);
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_write_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = lock_or_recover(&self.write_locks);
        drop(lock);
        // Only the map still holds the lock once no writer is queued on it.
        if let Some(existing) = locks.get(id) {
            if Arc::strong_count(existing) == 1 {
                locks.remove(id);
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingMutation>> {
        lock_or_recover(&self.pending)
    }
}

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn validate_payload(kind: EntityKind, payload: &JsonMap, is_create: bool) -> SyncResult<()> {
    let require_non_empty = |field: &str| -> SyncResult<()> {
        match payload.get(field) {
            Some(value) => match value.as_str() {
                Some(text) if !text.trim().is_empty() => Ok(()),
                _ => Err(SyncError::Validation(format!(
                    "{} requires a non-empty {field}",
                    kind.as_str()
                ))),
            },
            None if is_create => Err(SyncError::Validation(format!(
                "{} requires a non-empty {field}",
                kind.as_str()
            ))),
            None => Ok(()),
        }
    };

    match kind {
        EntityKind::Task | EntityKind::RecurringTemplate => require_non_empty("title"),
        EntityKind::Category => require_non_empty("name"),
    }
}
