use crate::subscriber::ChangeFeedSubscriber;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Bridges the runtime's network-reachability signal to the change feed.
/// The signal source may repeat states; only genuine transitions trigger
/// side effects. offline→online forces a resubscribe, and each feed worker's
/// subscription path runs a full collection resync, so deletes missed while
/// offline are reconciled. online→offline suspends the feed entirely; no
/// reconnection attempts are made until connectivity returns.
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
    pub fn start(subscriber: ChangeFeedSubscriber, mut signal: watch::Receiver<bool>) -> Self {
        let initial = *signal.borrow_and_update();
        let online = Arc::new(AtomicBool::new(initial));
        if initial {
            subscriber.start();
        } else {
            tracing::info!("starting offline; change feed suspended");
        }

        let state = online.clone();
        let handle = tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let is_online = *signal.borrow_and_update();
                if state.swap(is_online, Ordering::SeqCst) == is_online {
                    continue;
                }
                if is_online {
                    tracing::info!("connectivity restored; resubscribing with full resync");
                    subscriber.resume();
                } else {
                    tracing::info!("connectivity lost; suspending change feed");
                    subscriber.suspend();
                }
            }
        });

        Self { online, handle }
    }

    /// Non-blocking indicator for the UI.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{SyncError, SyncResult};
    use crate::models::{EntityKind, JsonMap, SyncConfig};
    use crate::remote::{BoxFuture, RemoteStore, RemoteSubscription};
    use crate::store::EntityStore;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, oneshot};

    struct CountingRemote {
        subscribes: AtomicUsize,
    }

    impl RemoteStore for CountingRemote {
        fn create(&self, _kind: EntityKind, _draft: JsonMap) -> BoxFuture<'_, SyncResult<JsonMap>> {
            Box::pin(async { Err(SyncError::RemoteWrite("unsupported".to_string())) })
        }

        fn update<'a>(
            &'a self,
            _kind: EntityKind,
            _id: &'a str,
            _patch: JsonMap,
        ) -> BoxFuture<'a, SyncResult<JsonMap>> {
            Box::pin(async { Err(SyncError::RemoteWrite("unsupported".to_string())) })
        }

        fn delete<'a>(&'a self, _kind: EntityKind, _id: &'a str) -> BoxFuture<'a, SyncResult<()>> {
            Box::pin(async { Err(SyncError::RemoteWrite("unsupported".to_string())) })
        }

        fn fetch_all<'a>(
            &'a self,
            _kind: EntityKind,
            _user_id: &'a str,
        ) -> BoxFuture<'a, SyncResult<Vec<JsonMap>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn subscribe<'a>(
            &'a self,
            _kind: EntityKind,
            _user_id: &'a str,
        ) -> BoxFuture<'a, SyncResult<RemoteSubscription>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                let (_tx, rx) = mpsc::channel(1);
                let (stop, _stop_rx) = oneshot::channel();
                Ok(RemoteSubscription::new(rx, stop))
            })
        }
    }

    #[tokio::test]
    async fn duplicate_signals_do_not_retrigger_side_effects() {
        let remote = Arc::new(CountingRemote {
            subscribes: AtomicUsize::new(0),
        });
        let store = Arc::new(EntityStore::new());
        let subscriber = ChangeFeedSubscriber::new(
            remote.clone(),
            store,
            "u1",
            SyncConfig::default(),
        );
        let (tx, rx) = watch::channel(false);
        let monitor = ConnectivityMonitor::start(subscriber.clone(), rx);
        assert!(!monitor.is_online());
        assert!(!subscriber.is_running());

        tx.send(true).expect("signal online");
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(monitor.is_online());
        assert!(subscriber.is_running());

        // A repeated `true` must not tear down and resubscribe.
        let before = remote.subscribes.load(Ordering::SeqCst);
        tx.send(true).expect("repeat signal");
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert_eq!(remote.subscribes.load(Ordering::SeqCst), before);

        tx.send(false).expect("signal offline");
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!monitor.is_online());
        assert!(!subscriber.is_running());

        monitor.shutdown();
        subscriber.suspend();
    }
}
