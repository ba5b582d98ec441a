use crate::errors::SyncResult;
use crate::models::{ChangeEvent, EntityKind, JsonMap};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The remote persistence/query capability the engine consumes. Implemented
/// over whatever transport the host application uses; the engine only needs
/// CRUD plus a per-user change feed. Dyn-safe via boxed futures.
pub trait RemoteStore: Send + Sync {
    fn create(&self, kind: EntityKind, draft: JsonMap) -> BoxFuture<'_, SyncResult<JsonMap>>;

    fn update<'a>(
        &'a self,
        kind: EntityKind,
        id: &'a str,
        patch: JsonMap,
    ) -> BoxFuture<'a, SyncResult<JsonMap>>;

    fn delete<'a>(&'a self, kind: EntityKind, id: &'a str) -> BoxFuture<'a, SyncResult<()>>;

    fn fetch_all<'a>(
        &'a self,
        kind: EntityKind,
        user_id: &'a str,
    ) -> BoxFuture<'a, SyncResult<Vec<JsonMap>>>;

    /// Open a server-filtered change feed for `(kind, user_id)`. The remote
    /// side stops producing when the subscription's stop signal fires or the
    /// receiver is dropped.
    fn subscribe<'a>(
        &'a self,
        kind: EntityKind,
        user_id: &'a str,
    ) -> BoxFuture<'a, SyncResult<RemoteSubscription>>;
}

/// Handle to one live change-feed subscription. Events arrive on `events`;
/// dropping the handle (or calling [`RemoteSubscription::unsubscribe`])
/// signals the producer to stop.
#[derive(Debug)]
pub struct RemoteSubscription {
    pub events: mpsc::Receiver<ChangeEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl RemoteSubscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, stop: oneshot::Sender<()>) -> Self {
        Self {
            events,
            stop: Some(stop),
        }
    }

    pub fn unsubscribe(mut self) {
        self.signal_stop();
    }

    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
