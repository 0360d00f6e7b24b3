//! Typed event subscriptions.
//!
//! Handlers stay registered exactly as long as their [`Subscription`] lives,
//! so tearing a session down releases every handler it installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
}

pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Delivers `event` to every handler in subscription order. Handlers run
    /// outside the registry lock and may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[must_use = "dropping a subscription unsubscribes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}
