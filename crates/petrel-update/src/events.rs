use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A typed event that can be routed by a kind discriminant.
pub trait Event: Clone + Send + 'static {
    type Kind: Copy + Eq + Hash + Send;

    fn kind(&self) -> Self::Kind;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publisher that caches events emitted before any subscriber exists.
///
/// An event emitted with no subscriber for its kind is cached; the first
/// subscriber for that kind receives every cached event once, then the cache
/// for that kind is drained. Events emitted while subscribers exist are
/// delivered synchronously and never cached. Callers that need durable
/// broadcast must re-emit.
pub struct CachedPublisher<E: Event> {
    inner: Mutex<Inner<E>>,
}

struct Inner<E: Event> {
    listeners: HashMap<E::Kind, Vec<Callback<E>>>,
    cached: HashMap<E::Kind, Vec<E>>,
}

impl<E: Event> CachedPublisher<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                listeners: HashMap::new(),
                cached: HashMap::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, kind: E::Kind, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let callback: Callback<E> = Arc::new(callback);
        let replay = {
            let mut inner = self.lock();
            inner
                .listeners
                .entry(kind)
                .or_default()
                .push(callback.clone());
            inner.cached.remove(&kind)
        };
        // Replay outside the lock so a callback may emit or subscribe again.
        if let Some(events) = replay {
            for event in &events {
                callback(event);
            }
        }
    }

    pub fn emit(&self, event: E) {
        let kind = event.kind();
        let callbacks = {
            let mut inner = self.lock();
            match inner.listeners.get(&kind) {
                Some(subscribers) if !subscribers.is_empty() => subscribers.clone(),
                _ => {
                    inner.cached.entry(kind).or_default().push(event);
                    return;
                }
            }
        };
        for callback in &callbacks {
            callback(&event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Event> Default for CachedPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}
