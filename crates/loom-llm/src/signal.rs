//! Cooperative cancellation shared between the session, transports, and workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalInner {
    aborted: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<SignalInner>>>,
}

impl SignalInner {
    fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.abort();
            }
        }
    }
}

/// Clonable cancellation token.
///
/// Every suspending call in the core takes one of these and checks it at its
/// suspension points. Aborting a signal also aborts every signal derived from it
/// through [`AbortSignal::child`].
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Derive a signal that aborts with this one but can also be aborted alone.
    pub fn child(&self) -> AbortSignal {
        let child = AbortSignal::new();
        if self.is_aborted() {
            child.abort();
            return child;
        }
        match self.inner.children.lock() {
            Ok(mut guard) => {
                guard.retain(|weak| weak.strong_count() > 0);
                guard.push(Arc::downgrade(&child.inner));
            }
            Err(poisoned) => poisoned.into_inner().push(Arc::downgrade(&child.inner)),
        }
        // The parent may have flipped between the check and the registration.
        if self.is_aborted() {
            child.abort();
        }
        child
    }

    /// Resolves once the signal has been aborted.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
            if self.is_aborted() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_future_resolves_after_abort() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.aborted().await });
        tokio::task::yield_now().await;
        signal.abort();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .expect("task should not panic");
        assert!(signal.is_aborted());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_future_resolves_immediately_when_already_aborted() {
        let signal = AbortSignal::new();
        signal.abort();
        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("already aborted signal should resolve");
    }

    #[test]
    fn parent_abort_propagates_to_children_but_not_back() {
        let parent = AbortSignal::new();
        let first = parent.child();
        let second = parent.child();

        first.abort();
        assert!(first.is_aborted());
        assert!(!parent.is_aborted());
        assert!(!second.is_aborted());

        parent.abort();
        assert!(second.is_aborted());
        assert!(parent.child().is_aborted());
    }
}
