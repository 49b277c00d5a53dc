//! Cancellation and in-flight tracking shared by the handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

/// Cooperative cancellation signal. Cancelling a token cancels every child derived from it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled together with `self`, but cancellable on its own.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        {
            let mut children = self.inner.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let children: Vec<_> = self.inner.children.lock().drain(..).collect();
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelToken { inner: child }.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct GroupInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Counts in-flight tasks; `wait` resolves when the count drops to zero.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<GroupInner>,
}

/// Decrements its wait group when dropped.
#[derive(Debug)]
pub struct WaitGuard {
    inner: Arc<GroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> WaitGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        WaitGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}
