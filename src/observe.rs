// Observable values with last-value replay.
//
// A producer owns an `Observable<T>` and calls `set`. Consumers call `subscribe`
// and immediately receive the current value, then every later update. Dropping
// the receiver detaches; the producer never waits on consumers.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

struct Inner<T> {
    value: T,
    subscribers: Vec<Sender<T>>,
}

pub struct Observable<T: Clone + Send + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone + Send + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { value: initial, subscribers: Vec::new() })),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        match self.inner.lock() {
            Ok(guard) => guard.value.clone(),
            Err(poisoned) => poisoned.into_inner().value.clone(),
        }
    }

    /// Replace the value and notify live subscribers.
    pub fn set(&self, value: T) {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.value = value.clone();
        guard.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Attach a consumer. The current value is delivered first.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tx.send(guard.value.clone()).is_ok() {
            guard.subscribers.push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.subscribers.len(),
            Err(poisoned) => poisoned.into_inner().subscribers.len(),
        }
    }
}
