//! Watch delivery loop
//!
//! A backend establishes its native watch, wraps it in a [`WatchSource`] and
//! hands it to [`spawn_delivery`]. The spawned task is the only owner of the
//! source: it drops it, releasing the native watch, on every exit path.
//!
//! Exit paths:
//! - context cancelled or receiver dropped: the channel closes with no error
//! - native stream ended: one `Err(StoreError::WatchFail)` then close

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::Context;
use crate::error::StoreError;
use crate::model::{WATCH_CHANNEL_CAPACITY, WatchEvent, WatchReceiver};

/// Backend-native change feed translated into canonical events
#[async_trait]
pub trait WatchSource: Send + 'static {
    /// Next batch of events in backend order, `None` once the native stream
    /// has terminated.
    async fn next_batch(&mut self) -> Option<Vec<WatchEvent>>;
}

/// Spawn the delivery task for `source` and return the caller's receiver.
pub fn spawn_delivery<S: WatchSource>(ctx: &Context, source: S, target: String) -> WatchReceiver {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let mut source = source;
        let mut cancelled = ctx.cancelled();
        debug!("Watch on '{}' streaming", target);

        loop {
            let batch = tokio::select! {
                _ = &mut cancelled => {
                    debug!("Watch on '{}' cancelled by caller", target);
                    return;
                }
                _ = tx.closed() => {
                    debug!("Watch on '{}' receiver dropped", target);
                    return;
                }
                batch = source.next_batch() => batch,
            };

            let Some(events) = batch else {
                debug!("Watch on '{}' terminated by backend", target);
                tokio::select! {
                    _ = &mut cancelled => {}
                    _ = tx.send(Err(StoreError::WatchFail)) => {}
                }
                return;
            };

            for event in events {
                tokio::select! {
                    _ = &mut cancelled => return,
                    sent = tx.send(Ok(event)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KVPair;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Scripted {
        batches: mpsc::UnboundedReceiver<Vec<WatchEvent>>,
        released: Arc<AtomicBool>,
    }

    impl Drop for Scripted {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WatchSource for Scripted {
        async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
            self.batches.recv().await
        }
    }

    fn scripted() -> (
        mpsc::UnboundedSender<Vec<WatchEvent>>,
        Scripted,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        (
            tx,
            Scripted {
                batches: rx,
                released: released.clone(),
            },
            released,
        )
    }

    fn put(key: &str, index: u64) -> WatchEvent {
        WatchEvent::put(KVPair::new(key, "v", index), None)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (feed, source, _) = scripted();
        let ctx = Context::background();
        let mut rx = spawn_delivery(&ctx, source, "/a".to_string());

        feed.send(vec![put("/a", 1), put("/a", 2)]).unwrap();
        feed.send(vec![put("/a", 3)]).unwrap();

        for expected in 1..=3 {
            let ev = rx.recv().await.unwrap().unwrap();
            assert_eq!(ev.node.unwrap().index, expected);
        }
    }

    #[tokio::test]
    async fn test_backend_close_sends_one_error() {
        let (feed, source, released) = scripted();
        let ctx = Context::background();
        let mut rx = spawn_delivery(&ctx, source, "/a".to_string());

        feed.send(vec![put("/a", 1)]).unwrap();
        drop(feed);

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(matches!(rx.recv().await, Some(Err(StoreError::WatchFail))));
        assert!(rx.recv().await.is_none());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_closes_silently_and_releases() {
        let (_feed, source, released) = scripted();
        let ctx = Context::background();
        let mut rx = spawn_delivery(&ctx, source, "/a".to_string());

        ctx.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("watch should close after cancel");
        assert!(next.is_none());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_receiver_drop_releases_source() {
        let (_feed, source, released) = scripted();
        let ctx = Context::background();
        let rx = spawn_delivery(&ctx, source, "/a".to_string());
        drop(rx);

        for _ in 0..50 {
            if released.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("source was not released after receiver drop");
    }
}
