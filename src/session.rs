use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::MutationCoordinator;
use crate::db::LocalState;
use crate::models::SyncConfig;
use crate::remote::RemoteStore;
use crate::scheduler::RecurringTaskScheduler;
use crate::store::EntityStore;
use crate::subscriber::ChangeFeedSubscriber;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Everything the engine runs for one authenticated user: the store, the
/// change-feed workers, the mutation coordinator, the connectivity monitor
/// and the recurring scheduler, wired to a shared remote capability. Torn
/// down as a unit on sign-out or user switch.
pub struct SyncSession {
    user_id: String,
    store: Arc<EntityStore>,
    coordinator: MutationCoordinator,
    subscriber: ChangeFeedSubscriber,
    monitor: ConnectivityMonitor,
    scheduler_handle: JoinHandle<()>,
}

impl SyncSession {
    pub fn start(
        remote: Arc<dyn RemoteStore>,
        local: Arc<LocalState>,
        user_id: impl Into<String>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let user_id = user_id.into();
        let store = Arc::new(EntityStore::new());
        let subscriber = ChangeFeedSubscriber::new(
            remote.clone(),
            store.clone(),
            user_id.clone(),
            config.clone(),
        );
        let coordinator = MutationCoordinator::new(remote.clone(), store.clone(), user_id.clone());
        let monitor = ConnectivityMonitor::start(subscriber.clone(), connectivity);
        let scheduler =
            RecurringTaskScheduler::new(remote, local, user_id.clone(), config);
        let scheduler_handle = scheduler.start();
        tracing::info!(user_id = %user_id, "sync session started");

        Self {
            user_id,
            store,
            coordinator,
            subscriber,
            monitor,
            scheduler_handle,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Stop every background task and clear the cache. In-flight remote
    /// writes already issued by the coordinator run to completion; their
    /// results land in a cleared store and are harmless.
    pub fn shutdown(self) {
        tracing::info!(user_id = %self.user_id, "sync session shutting down");
        self.monitor.shutdown();
        self.subscriber.suspend();
        self.scheduler_handle.abort();
        self.store.clear();
    }
}

/// Shared view onto the active session's store. Consumers hold this across
/// auth transitions; it points at the current user's cache, or at nothing
/// while signed out.
#[derive(Clone, Default)]
pub struct SessionStoreHandle {
    inner: Arc<StdMutex<Option<Arc<EntityStore>>>>,
}

impl SessionStoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<EntityStore>> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, store: Option<Arc<EntityStore>>) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = store;
    }
}

/// Consumes auth transitions and keeps exactly one [`SyncSession`] alive for
/// the current user. Any transition, including to signed-out, tears the
/// previous session down entirely before a new one is built; cached state
/// never crosses users.
pub struct SessionSupervisor {
    remote: Arc<dyn RemoteStore>,
    local: Arc<LocalState>,
    config: SyncConfig,
    connectivity: watch::Receiver<bool>,
    store_handle: SessionStoreHandle,
}

impl SessionSupervisor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<LocalState>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            local,
            config,
            connectivity,
            store_handle: SessionStoreHandle::new(),
        }
    }

    pub fn store_handle(&self) -> SessionStoreHandle {
        self.store_handle.clone()
    }

    pub async fn run(self, mut auth: mpsc::Receiver<Option<String>>) {
        let mut active: Option<SyncSession> = None;
        while let Some(user) = auth.recv().await {
            if active.as_ref().map(SyncSession::user_id) == user.as_deref() {
                continue;
            }
            if let Some(session) = active.take() {
                self.store_handle.set(None);
                session.shutdown();
            }
            if let Some(user_id) = user {
                let session = SyncSession::start(
                    self.remote.clone(),
                    self.local.clone(),
                    user_id,
                    self.config.clone(),
                    self.connectivity.clone(),
                );
                self.store_handle.set(Some(session.store().clone()));
                active = Some(session);
            }
        }
        if let Some(session) = active.take() {
            self.store_handle.set(None);
            session.shutdown();
        }
    }
}
