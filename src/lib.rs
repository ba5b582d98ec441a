pub mod connectivity;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod models;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod subscriber;

pub use connectivity::ConnectivityMonitor;
pub use coordinator::{MutationCoordinator, MutationReceipt};
pub use db::LocalState;
pub use errors::{SyncError, SyncResult};
pub use models::{
    Category, ChangeEvent, ChangeEventType, EntityKind, JsonMap, MutationOperation,
    MutationStatus, PendingMutation, PriorityClass, RecurrencePattern, RecurringTemplate,
    SyncConfig, Task, TaskStatus, LOCAL_ID_PREFIX,
};
pub use remote::{BoxFuture, RemoteStore, RemoteSubscription};
pub use scheduler::{due_for_materialization, RecurringTaskScheduler};
pub use session::{SessionStoreHandle, SessionSupervisor, SyncSession};
pub use store::EntityStore;
pub use subscriber::ChangeFeedSubscriber;

/// Install a global tracing subscriber honoring `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
