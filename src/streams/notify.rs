use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

use crate::platform::SharedPtr;

/// A lightweight set of wakers, deduplicated by `will_wake`.
#[derive(Clone, Default)]
pub(crate) struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub fn new() -> Self {
        Self(SharedPtr::new(Mutex::new(Vec::new())))
    }

    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake all registered wakers and clear the set.
    pub fn wake_all(&self) {
        let mut wakers = self.0.lock();
        for waker in wakers.drain(..) {
            waker.wake();
        }
    }
}

/// An `f64` published through an atomic, for the queue-size mirrors handles
/// read without going through the stream task.
pub(crate) struct SizeMirror(AtomicU64);

impl SizeMirror {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}
