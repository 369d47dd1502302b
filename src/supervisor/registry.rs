//! In-memory world registry and per-id operation locks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::AbortHandle;

use super::state::Status;
use crate::backend::{BackendKind, Handle};
use crate::broadcast::LogHub;
use crate::error::{Error, Result};
use crate::metrics;
use crate::world::WorldSpec;

/// Everything the supervisor knows about one world.
///
/// A record always carries a backend handle; an absent world has no record.
pub(crate) struct InstanceRecord {
    pub spec: WorldSpec,
    pub kind: BackendKind,
    pub handle: Handle,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub hub: Arc<LogHub>,
    /// Incremented on every start; monitors only act on their own run.
    pub run: u64,
    pub monitor: Option<AbortHandle>,
    status_tx: watch::Sender<Status>,
}

impl InstanceRecord {
    pub fn new(
        spec: WorldSpec,
        kind: BackendKind,
        handle: Handle,
        status: Status,
        log_buffer_lines: usize,
    ) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self {
            spec,
            kind,
            handle,
            status,
            created_at: Utc::now(),
            started_at: None,
            exit_code: None,
            hub: Arc::new(LogHub::new(log_buffer_lines)),
            run: 0,
            monitor: None,
            status_tx,
        }
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.spec.id.clone(),
            kind: self.kind,
            status: self.status,
            spec: self.spec.clone(),
            resource: self.handle.resource().to_string(),
            created_at: self.created_at,
            started_at: self.started_at,
            exit_code: self.exit_code,
            subscribers: self.hub.subscriber_count(),
        }
    }
}

/// Point-in-time copy of a record, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub kind: BackendKind,
    pub status: Status,
    pub spec: WorldSpec,
    /// Backend resource name (container name or process slot).
    pub resource: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub subscribers: usize,
}

/// Concurrency-safe id -> record map.
///
/// Writers are serialized per id by [`LockMap`]; the inner lock is only held
/// for the duration of a single read or update, never across I/O.
#[derive(Default)]
pub(crate) struct Registry {
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Fails if the id is already taken.
    pub fn insert(&self, record: InstanceRecord) -> Result<InstanceSnapshot> {
        let mut records = self.records.write();
        let id = record.spec.id.clone();
        if records.contains_key(&id) {
            return Err(Error::already_exists(id));
        }
        metrics::record_transition(record.status.as_str());
        let snapshot = record.snapshot();
        records.insert(id, record);
        Ok(snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<InstanceSnapshot> {
        self.records.read().get(id).map(InstanceRecord::snapshot)
    }

    /// Owned snapshot of every record, ordered by id.
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let mut all: Vec<_> = self
            .records
            .read()
            .values()
            .map(InstanceRecord::snapshot)
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Log hubs of every record.
    pub fn hubs(&self) -> Vec<Arc<LogHub>> {
        self.records
            .read()
            .values()
            .map(|r| Arc::clone(&r.hub))
            .collect()
    }

    /// Read fields of a record.
    pub fn with<T>(&self, id: &str, f: impl FnOnce(&InstanceRecord) -> T) -> Option<T> {
        self.records.read().get(id).map(f)
    }

    /// Update fields of a record other than its status.
    pub fn update<T>(&self, id: &str, f: impl FnOnce(&mut InstanceRecord) -> T) -> Option<T> {
        self.records.write().get_mut(id).map(f)
    }

    pub fn status(&self, id: &str) -> Option<Status> {
        self.with(id, |r| r.status)
    }

    pub fn watch(&self, id: &str) -> Option<watch::Receiver<Status>> {
        self.with(id, |r| r.status_tx.subscribe())
    }

    /// Move a world to `next` if the state machine allows it.
    ///
    /// With `run` set, the change only applies while that run is current.
    /// Returns whether the status changed.
    pub fn transition(&self, id: &str, next: Status, run: Option<u64>) -> bool {
        self.apply(id, next, run, None)
    }

    /// Move a world to `stopped` or `error`, recording the exit code.
    pub fn finish(&self, id: &str, next: Status, run: Option<u64>, exit_code: Option<i32>) -> bool {
        debug_assert!(next.is_terminal());
        self.apply(id, next, run, exit_code)
    }

    fn apply(&self, id: &str, next: Status, run: Option<u64>, exit_code: Option<i32>) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if run.is_some_and(|run| run != record.run) {
            return false;
        }

        let current = record.status;
        if !current.can_transition_to(next) {
            tracing::debug!(
                world = %id,
                from = %current,
                to = %next,
                "Ignoring illegal status transition"
            );
            return false;
        }

        record.status = next;
        if next == Status::Starting {
            record.run += 1;
            record.started_at = Some(Utc::now());
            record.exit_code = None;
        }
        if exit_code.is_some() {
            record.exit_code = exit_code;
        }
        record.status_tx.send_replace(next);
        metrics::record_transition(next.as_str());
        tracing::info!(world = %id, from = %current, to = %next, "World status changed");
        true
    }

    /// Remove a record, notifying status watchers that the world is gone.
    pub fn remove(&self, id: &str) -> Option<InstanceRecord> {
        let record = self.records.write().remove(id)?;
        record.status_tx.send_replace(Status::Absent);
        metrics::record_transition(Status::Absent.as_str());
        Some(record)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// Per-id exclusive locks for mutating operations.
///
/// Entries are created on demand and dropped once no holder or waiter is
/// left, so the map only holds ids with operations in flight.
#[derive(Clone, Default)]
pub(crate) struct LockMap {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &str) -> OperationGuard {
        let lock = Arc::clone(
            self.locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        OperationGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of ids with an operation in flight or waiting.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Held for the duration of one mutating operation.
pub(crate) struct OperationGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::MemorySize;
    use std::time::Duration;

    fn record(id: &str, status: Status) -> InstanceRecord {
        InstanceRecord::new(
            WorldSpec::new(id, MemorySize::from_gib(4), 2, 25565),
            BackendKind::Container,
            Handle::new(id, format!("hycore-world-{id}")),
            status,
            100,
        )
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = Registry::new();
        registry.insert(record("alpha", Status::Created)).unwrap();
        let err = registry
            .insert(record("alpha", Status::Created))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_is_sorted_snapshot() {
        let registry = Registry::new();
        registry.insert(record("beta", Status::Created)).unwrap();
        registry.insert(record("alpha", Status::Created)).unwrap();

        let list = registry.list();
        assert_eq!(list[0].id, "alpha");
        assert_eq!(list[1].id, "beta");

        registry.remove("alpha");
        assert_eq!(list.len(), 2);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_transition_validates_and_tracks_run() {
        let registry = Registry::new();
        registry.insert(record("alpha", Status::Created)).unwrap();

        assert!(!registry.transition("alpha", Status::Running, None));
        assert!(registry.transition("alpha", Status::Starting, None));
        let run = registry.with("alpha", |r| r.run).unwrap();
        assert_eq!(run, 1);
        assert!(registry.snapshot("alpha").unwrap().started_at.is_some());

        assert!(!registry.transition("alpha", Status::Running, Some(run + 1)));
        assert!(registry.transition("alpha", Status::Running, Some(run)));
        assert_eq!(registry.status("alpha"), Some(Status::Running));
        assert!(!registry.transition("ghost", Status::Running, None));

        assert!(registry.transition("alpha", Status::Stopping, None));
        assert!(registry.finish("alpha", Status::Stopped, None, Some(143)));
        assert_eq!(registry.snapshot("alpha").unwrap().exit_code, Some(143));
    }

    #[tokio::test]
    async fn test_watch_sees_transitions_and_removal() {
        let registry = Registry::new();
        registry.insert(record("alpha", Status::Created)).unwrap();
        let mut rx = registry.watch("alpha").unwrap();

        registry.transition("alpha", Status::Starting, None);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Status::Starting);

        registry.remove("alpha");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Status::Absent);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_id() {
        let locks = LockMap::new();
        let guard = locks.acquire("alpha").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("alpha").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_lock_allows_other_ids() {
        let locks = LockMap::new();
        let _alpha = locks.acquire("alpha").await;
        let beta = tokio::time::timeout(Duration::from_secs(1), locks.acquire("beta")).await;
        assert!(beta.is_ok());
        assert_eq!(locks.active(), 2);
    }
}
