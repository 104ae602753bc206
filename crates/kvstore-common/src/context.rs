//! Cancellation context
//!
//! Every call that may block on a backend round-trip takes a `&Context`.
//! A context is cancelled explicitly, when its deadline passes, or when any
//! ancestor is cancelled. Clones share the same cancellation state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, pending};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cancel: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

impl Context {
    /// A context that is never cancelled unless `cancel` is called.
    pub fn background() -> Self {
        Self::build(None, None)
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(None, Some(Instant::now() + timeout))
    }

    /// A child that is cancelled with this context, and can be cancelled
    /// on its own without affecting the parent.
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), self.deadline())
    }

    /// A child with an additional deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline() {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        Self::build(Some(self.clone()), Some(deadline))
    }

    fn build(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                cancel,
                deadline,
                parent,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context is done, `None` while it is still live.
    pub fn err(&self) -> Option<StoreError> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if *ctx.inner.cancel.borrow() {
                return Some(StoreError::Cancelled);
            }
            current = ctx.inner.parent.as_ref();
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StoreError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is done, with the reason.
    pub fn cancelled(&self) -> BoxFuture<'static, StoreError> {
        let ctx = self.clone();
        Box::pin(async move {
            let mut rx = ctx.inner.cancel.subscribe();
            let parent = ctx.inner.parent.clone();
            let deadline = ctx.inner.deadline;

            let own = async {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
                StoreError::Cancelled
            };
            let upstream = async {
                match parent {
                    Some(parent) => parent.cancelled().await,
                    None => pending().await,
                }
            };
            let timer = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(deadline).await;
                        StoreError::DeadlineExceeded
                    }
                    None => pending().await,
                }
            };

            tokio::select! {
                err = own => err,
                err = upstream => err,
                err = timer => err,
            }
        })
    }

    /// Run `fut` until it completes or the context is done.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            res = fut => res,
            err = self.cancelled() => Err(err),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &*self.inner.cancel.borrow())
            .field("deadline", &self.inner.deadline)
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let ctx = Context::background();
        let waiter = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waiter.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .expect("context should be cancelled");
        assert!(matches!(err, StoreError::Cancelled));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(res, Err(StoreError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(matches!(child.err(), Some(StoreError::Cancelled)));

        let err = tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_deadline_never_outlives_parent() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        let res = ctx.run(async { Ok(42) }).await;
        assert_eq!(res.unwrap(), 42);

        ctx.cancel();
        let res = ctx.run(async { Ok(42) }).await;
        assert!(matches!(res, Err(StoreError::Cancelled)));
    }
}
