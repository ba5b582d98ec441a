use crate::models::{Category, EntityKind, JsonMap, Task, LOCAL_ID_PREFIX};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// In-memory mirror of the remote collections. The single writer of record:
/// every cache mutation in the engine funnels through this type. Purely
/// synchronous; the interior mutex serializes all access.
///
/// Each collection keeps a by-id map plus an insertion-order index so the UI
/// renders a stable ordering that does not reshuffle on update.
#[derive(Debug, Default)]
pub struct EntityStore {
    inner: Mutex<HashMap<EntityKind, Collection>>,
}

#[derive(Debug, Default)]
struct Collection {
    order: Vec<String>,
    entries: HashMap<String, JsonMap>,
}

impl Collection {
    fn upsert(&mut self, id: &str, payload: JsonMap) {
        match self.entries.get_mut(id) {
            Some(existing) => {
                // Shallow merge: incoming fields win, absent fields survive.
                for (key, value) in payload {
                    existing.insert(key, value);
                }
            }
            None => {
                self.order.push(id.to_string());
                self.entries.insert(id.to_string(), payload);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `payload` over the record at `(kind, id)`, appending a new entry
    /// at the end of the ordered view when the id is unknown. Re-applying the
    /// same payload is a no-op beyond the first application.
    pub fn upsert(&self, kind: EntityKind, id: &str, payload: JsonMap) {
        let mut inner = self.lock();
        inner.entry(kind).or_default().upsert(id, payload);
    }

    /// Remove the record at `(kind, id)`. Unknown ids are a no-op.
    pub fn remove(&self, kind: EntityKind, id: &str) {
        let mut inner = self.lock();
        if let Some(collection) = inner.get_mut(&kind) {
            collection.remove(id);
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<JsonMap> {
        let inner = self.lock();
        inner.get(&kind).and_then(|c| c.entries.get(id).cloned())
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        let inner = self.lock();
        inner
            .get(&kind)
            .map(|c| c.entries.contains_key(id))
            .unwrap_or(false)
    }

    /// Records in first-arrival order.
    pub fn list(&self, kind: EntityKind) -> Vec<JsonMap> {
        let inner = self.lock();
        let Some(collection) = inner.get(&kind) else {
            return Vec::new();
        };
        collection
            .order
            .iter()
            .filter_map(|id| collection.entries.get(id).cloned())
            .collect()
    }

    pub fn ids(&self, kind: EntityKind) -> Vec<String> {
        let inner = self.lock();
        inner.get(&kind).map(|c| c.order.clone()).unwrap_or_default()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        let inner = self.lock();
        inner.get(&kind).map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    /// Swap the identity of a record from a locally-synthesized id to the
    /// server-assigned one, keeping its position in the ordered view.
    ///
    /// If the change-feed echo raced the write response and already inserted
    /// an entry under `new_id`, that entry's fields are merged over the local
    /// record and the duplicate is dropped, so exactly one entry remains.
    pub fn rekey(&self, kind: EntityKind, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        let mut inner = self.lock();
        let Some(collection) = inner.get_mut(&kind) else {
            return;
        };
        let Some(mut record) = collection.entries.remove(old_id) else {
            return;
        };
        if let Some(echoed) = collection.entries.remove(new_id) {
            for (key, value) in echoed {
                record.insert(key, value);
            }
            collection.order.retain(|entry| entry != new_id);
        }
        if let Some(slot) = collection.order.iter_mut().find(|entry| *entry == old_id) {
            *slot = new_id.to_string();
        }
        collection.entries.insert(new_id.to_string(), record);
    }

    /// Rollback helper: put a pre-mutation snapshot back. Replaces the record
    /// in place if still present, otherwise re-appends it.
    pub fn restore(&self, kind: EntityKind, id: &str, snapshot: JsonMap) {
        let mut inner = self.lock();
        let collection = inner.entry(kind).or_default();
        if !collection.entries.contains_key(id) {
            collection.order.push(id.to_string());
        }
        collection.entries.insert(id.to_string(), snapshot);
    }

    /// Resync reconciliation: evict every record whose id is not in `keep`.
    /// Optimistic entries still waiting for a server id (the `local-` prefix)
    /// are spared, since the remote snapshot cannot know about them yet.
    pub fn retain(&self, kind: EntityKind, keep: &HashSet<String>) {
        let mut inner = self.lock();
        let Some(collection) = inner.get_mut(&kind) else {
            return;
        };
        collection
            .entries
            .retain(|id, _| keep.contains(id) || id.starts_with(LOCAL_ID_PREFIX));
        let entries = &collection.entries;
        collection.order.retain(|id| entries.contains_key(id));
    }

    /// Session teardown: drop every collection.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.clear();
    }

    /// Typed task view. Records that fail to decode are skipped with a
    /// warning rather than poisoning the whole listing.
    pub fn tasks(&self) -> Vec<Task> {
        self.list_decoded(EntityKind::Task)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.list_decoded(EntityKind::Category)
    }

    fn list_decoded<T: serde::de::DeserializeOwned>(&self, kind: EntityKind) -> Vec<T> {
        self.list(kind)
            .into_iter()
            .filter_map(|record| {
                match serde_json::from_value(serde_json::Value::Object(record)) {
                    Ok(decoded) => Some(decoded),
                    Err(err) => {
                        tracing::warn!(kind = kind.as_str(), %err, "skipping undecodable record");
                        None
                    }
                }
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EntityKind, Collection>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> JsonMap {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn upsert_preserves_first_arrival_order() {
        let store = EntityStore::new();
        store.upsert(EntityKind::Task, "a", map(json!({"id": "a", "title": "one"})));
        store.upsert(EntityKind::Task, "b", map(json!({"id": "b", "title": "two"})));
        store.upsert(EntityKind::Task, "a", map(json!({"id": "a", "title": "one again"})));

        assert_eq!(store.ids(EntityKind::Task), vec!["a", "b"]);
        let first = store.get(EntityKind::Task, "a").expect("record a");
        assert_eq!(first["title"], "one again");
    }

    #[test]
    fn upsert_merge_preserves_absent_fields() {
        let store = EntityStore::new();
        store.upsert(
            EntityKind::Task,
            "a",
            map(json!({"id": "a", "title": "one", "description": "keep me"})),
        );
        store.upsert(EntityKind::Task, "a", map(json!({"title": "renamed"})));

        let record = store.get(EntityKind::Task, "a").expect("record a");
        assert_eq!(record["title"], "renamed");
        assert_eq!(record["description"], "keep me");
    }

    #[test]
    fn duplicate_insert_is_a_noop_beyond_the_first() {
        let store = EntityStore::new();
        let payload = map(json!({"id": "a", "title": "one"}));
        store.upsert(EntityKind::Task, "a", payload.clone());
        store.upsert(EntityKind::Task, "a", payload.clone());

        assert_eq!(store.len(EntityKind::Task), 1);
        assert_eq!(store.ids(EntityKind::Task), vec!["a"]);
        assert_eq!(store.get(EntityKind::Task, "a"), Some(payload));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = EntityStore::new();
        store.upsert(EntityKind::Task, "a", map(json!({"id": "a"})));
        store.remove(EntityKind::Task, "a");
        store.remove(EntityKind::Task, "a");
        store.remove(EntityKind::Category, "never-there");

        assert!(store.is_empty(EntityKind::Task));
    }

    #[test]
    fn final_state_has_one_entry_per_surviving_id() {
        let store = EntityStore::new();
        store.upsert(EntityKind::Task, "a", map(json!({"id": "a"})));
        store.upsert(EntityKind::Task, "b", map(json!({"id": "b"})));
        store.upsert(EntityKind::Task, "c", map(json!({"id": "c"})));
        store.remove(EntityKind::Task, "b");
        store.upsert(EntityKind::Task, "c", map(json!({"id": "c", "title": "x"})));

        assert_eq!(store.ids(EntityKind::Task), vec!["a", "c"]);
    }

    #[test]
    fn rekey_keeps_position_and_merges_echo_duplicate() {
        let store = EntityStore::new();
        store.upsert(EntityKind::Task, "local-1", map(json!({"id": "local-1", "title": "draft"})));
        store.upsert(EntityKind::Task, "other", map(json!({"id": "other"})));
        // Echo landed before the write response.
        store.upsert(
            EntityKind::Task,
            "srv-9",
            map(json!({"id": "srv-9", "title": "draft", "userId": "u1"})),
        );

        store.rekey(EntityKind::Task, "local-1", "srv-9");

        assert_eq!(store.ids(EntityKind::Task), vec!["srv-9", "other"]);
        let record = store.get(EntityKind::Task, "srv-9").expect("rekeyed record");
        assert_eq!(record["userId"], "u1");
        assert_eq!(record["id"], "srv-9");
    }

    #[test]
    fn retain_evicts_absent_ids_but_spares_local_drafts() {
        let store = EntityStore::new();
        store.upsert(EntityKind::Task, "a", map(json!({"id": "a"})));
        store.upsert(EntityKind::Task, "stale", map(json!({"id": "stale"})));
        store.upsert(EntityKind::Task, "local-7", map(json!({"id": "local-7"})));

        let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
        store.retain(EntityKind::Task, &keep);

        assert_eq!(store.ids(EntityKind::Task), vec!["a", "local-7"]);
    }

    #[test]
    fn typed_view_skips_undecodable_records() {
        let store = EntityStore::new();
        store.upsert(
            EntityKind::Task,
            "good",
            map(json!({
                "id": "good",
                "userId": "u1",
                "title": "ok",
                "description": null,
                "priorityClass": "urgent",
                "status": "pending",
                "categoryId": null,
                "recurringTemplateId": null,
                "createdAt": "2026-08-01T00:00:00Z",
                "updatedAt": "2026-08-01T00:00:00Z"
            })),
        );
        store.upsert(EntityKind::Task, "bad", map(json!({"id": "bad"})));

        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "good");
    }
}
