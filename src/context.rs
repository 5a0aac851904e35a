//! Cooperative cancellation for long-lived loops.
//!
//! A [`Context`] is a cheap, cloneable token. Cancelling it cancels every
//! child derived from it. Loops observe cancellation either by polling
//! [`Context::is_done`] or by selecting on [`Context::done`], a channel
//! that disconnects when the context is cancelled.

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Inner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `done`.
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.trigger.lock().take());

        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// Cancellation scope shared by a loop and whoever owns it.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A root context that is only cancelled explicitly.
    pub fn background() -> Self {
        let (trigger, done) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                done,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A context cancelled together with `self`, or on its own.
    pub fn child(&self) -> Self {
        let child = Self::background();
        let mut children = self.inner.children.lock();
        if self.is_done() {
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        drop(children);
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Never yields a value; becomes ready (disconnected) once cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` if the context was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_done() {
            return false;
        }
        let done = self.done();
        select! {
            recv(done) -> _ => false,
            recv(after(duration)) -> _ => !self.is_done(),
        }
    }

    /// Cancels this context when the guard is dropped.
    pub fn cancel_on_drop(&self) -> CancelGuard {
        CancelGuard {
            ctx: Some(self.clone()),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .finish()
    }
}

/// See [`Context::cancel_on_drop`].
pub struct CancelGuard {
    ctx: Option<Context>,
}

impl CancelGuard {
    /// Drop the guard without cancelling.
    pub fn disarm(mut self) {
        self.ctx = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_done());
        root.cancel();
        assert!(child.is_done());
        assert!(grandchild.is_done());
        assert!(grandchild.done().recv().is_err());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let root = Context::background();
        let child = root.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!root.is_done());
    }

    #[test]
    fn test_child_of_cancelled_is_cancelled() {
        let root = Context::background();
        root.cancel();
        assert!(root.child().is_done());
    }

    #[test]
    fn test_sleep_interrupted() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(!ctx.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_guard() {
        let ctx = Context::background();
        {
            let _guard = ctx.cancel_on_drop();
        }
        assert!(ctx.is_done());

        let kept = Context::background();
        kept.cancel_on_drop().disarm();
        assert!(!kept.is_done());
    }
}
