// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Callback registrations with disposable handles.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// A set of callbacks interested in values of type `T`.
///
/// Callbacks are only ever invoked from [`Observers::notify`], which the
/// client calls from the task polling it.
pub struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Observers {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is disposed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let Ok(mut registry) = self.registry.lock() else {
            return Subscription { unsubscribe: None };
        };
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.insert(id, Arc::new(callback));
        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                let Ok(mut registry) = registry.lock() else {
                    return;
                };
                registry.callbacks.remove(&id);
            })),
        }
    }

    /// Deliver `value` to every registered callback, in registration order.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<u64> = match self.registry.lock() {
            Ok(registry) => registry.callbacks.keys().copied().collect(),
            Err(_) => return,
        };
        for id in snapshot {
            // An earlier callback may have disposed this one.
            let callback = match self.registry.lock() {
                Ok(registry) => registry.callbacks.get(&id).cloned(),
                Err(_) => return,
            };
            if let Some(callback) = callback {
                callback(value);
            }
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.callbacks.len())
            .unwrap_or(0)
    }

    /// No live registrations?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

/// Handle to a callback registration.
///
/// Once disposed (or dropped), the callback is guaranteed not to be invoked
/// again.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Unregister the callback.
    pub fn dispose(mut self) {
        self.unsubscribe_now();
    }

    /// Keep the callback registered for as long as its source lives.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }

    fn unsubscribe_now(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_until_disposed() {
        let observers = Observers::<u32>::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let sum2 = sum.clone();
        let subscription = observers.subscribe(move |v| {
            sum2.fetch_add(*v as usize, Ordering::SeqCst);
        });
        observers.notify(&2);
        observers.notify(&3);
        subscription.dispose();
        observers.notify(&100);
        assert_eq!(sum.load(Ordering::SeqCst), 5);
        assert!(observers.is_empty());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let observers = Observers::<()>::new();
        {
            let _subscription = observers.subscribe(|_| ());
            assert_eq!(observers.len(), 1);
        }
        assert_eq!(observers.len(), 0);
    }

    #[test]
    fn detached_subscription_stays() {
        let observers = Observers::<()>::new();
        observers.subscribe(|_| ()).detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn disposal_during_delivery_is_honoured() {
        let observers = Observers::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let victim2 = victim.clone();
        let _killer = observers.subscribe(move |_| {
            if let Some(s) = victim2.lock().unwrap().take() {
                s.dispose();
            }
        });
        let hits2 = hits.clone();
        *victim.lock().unwrap() = Some(observers.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        observers.notify(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscription_outliving_source_is_harmless() {
        let observers = Observers::<()>::new();
        let subscription = observers.subscribe(|_| ());
        drop(observers);
        subscription.dispose();
    }
}
