//! Observer-list primitive used for client-visible notifications.
//!
//! Components that publish state (schedulers, the usage meter, the pipeline
//! itself) hold a [`Listeners`] set; `subscribe()` hands back a
//! [`Subscription`] capability that removes the listener when cancelled or
//! dropped. Emission is synchronous fan-out; listeners must be cheap and
//! must not block.

use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Box<dyn Fn(&E) + Send + 'static>;

struct ListenerTable<E> {
    next_id: u64,
    entries: Vec<(u64, Callback<E>)>,
}

impl<E> ListenerTable<E> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

/// A set of interested listeners for events of type `E`.
pub struct Listeners<E> {
    inner: Arc<Mutex<ListenerTable<E>>>,
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerTable::new())),
        }
    }

    /// Register a callback. The returned [`Subscription`] removes it on
    /// cancel or drop.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + 'static) -> Subscription
    where
        E: 'static,
    {
        let mut table = lock_table(&self.inner);
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push((id, Box::new(callback)));
        drop(table);

        let weak = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = Weak::upgrade(&weak) {
                    let mut table = lock_table(&inner);
                    table.entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Deliver an event to every registered listener, in subscription order.
    pub fn emit(&self, event: &E) {
        let table = lock_table(&self.inner);
        for (_, callback) in &table.entries {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        lock_table(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A panicking listener poisons the mutex; recover the table rather than
// propagate the poison to every later publisher.
fn lock_table<E>(inner: &Arc<Mutex<ListenerTable<E>>>) -> std::sync::MutexGuard<'_, ListenerTable<E>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Capability to remove a listener registered with [`Listeners::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the listener now instead of waiting for drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let listeners: Listeners<u32> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let _s1 = listeners.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let _s2 = listeners.subscribe(move |v| {
            c2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 6);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_drop_removes_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let sub = listeners.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        drop(sub);
        listeners.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_cancel_removes_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let sub = listeners.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        listeners.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_listeners_dropped_is_safe() {
        let listeners: Listeners<()> = Listeners::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        // The weak upgrade fails; cancel must not panic.
        sub.cancel();
    }
}
