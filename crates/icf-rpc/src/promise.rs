//! Single-assignment result slot
//!
//! A [`Promise`] is an [`Observer`] that keeps the last value it saw and
//! resolves when the stream terminates. Callers either await it or block on
//! it with a timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{RpcError, RpcResult};
use crate::observer::Observer;

struct Slot<V> {
    last: Option<V>,
    outcome: Option<RpcResult<V>>,
}

struct Shared<V> {
    slot: Mutex<Slot<V>>,
    ready: Condvar,
    notify: Notify,
}

/// Future-like handle on the final value of a request.
///
/// Cloning yields another handle on the same slot.
pub struct Promise<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V: Clone + Send> Promise<V> {
    /// Create an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    last: None,
                    outcome: None,
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Check if the promise has been resolved.
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().outcome.is_some()
    }

    /// Get the outcome without waiting.
    pub fn try_get(&self) -> Option<RpcResult<V>> {
        self.shared.slot.lock().outcome.clone()
    }

    /// Resolve the promise. Returns false if it was already resolved.
    pub fn resolve(&self, outcome: RpcResult<V>) -> bool {
        {
            let mut slot = self.shared.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome);
        }
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        true
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> RpcResult<V> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait for the outcome, giving up with [`RpcError::TimedOut`].
    ///
    /// Timing out leaves the promise unresolved and does not notify the peer.
    pub async fn wait_timeout(&self, timeout: Duration) -> RpcResult<V> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::timed_out(timeout)),
        }
    }

    /// Block the current thread until the outcome is available.
    ///
    /// Must not be called from inside an async task.
    pub fn get_blocking(&self, timeout: Duration) -> RpcResult<V> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.clone() {
                return outcome;
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return match slot.outcome.clone() {
                    Some(outcome) => outcome,
                    None => Err(RpcError::timed_out(timeout)),
                };
            }
        }
    }
}

impl<V: Clone + Send> Default for Promise<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> Observer<V> for Promise<V> {
    fn on_next(&self, value: V) {
        let mut slot = self.shared.slot.lock();
        if slot.outcome.is_none() {
            slot.last = Some(value);
        }
    }

    fn on_error(&self, error: RpcError) {
        self.resolve(Err(error));
    }

    fn on_completed(&self) {
        let last = self.shared.slot.lock().last.take();
        let outcome = last.ok_or_else(|| RpcError::protocol("stream completed without a value"));
        self.resolve(outcome);
    }
}

impl<V> std::fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self.shared.slot.lock().outcome.is_some();
        f.debug_struct("Promise").field("done", &done).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_once() {
        let promise: Promise<String> = Promise::new();
        assert!(promise.resolve(Ok("first".to_string())));
        assert!(!promise.resolve(Ok("second".to_string())));
        assert_eq!(promise.try_get(), Some(Ok("first".to_string())));
    }

    #[test]
    fn test_observer_completion_yields_last_value() {
        let promise: Promise<u32> = Promise::new();
        promise.on_next(1);
        promise.on_next(2);
        promise.on_completed();
        assert_eq!(promise.try_get(), Some(Ok(2)));
    }

    #[test]
    fn test_completion_without_value_is_protocol_error() {
        let promise: Promise<u32> = Promise::new();
        promise.on_completed();
        assert!(matches!(
            promise.try_get(),
            Some(Err(RpcError::Protocol { .. }))
        ));
    }

    #[test]
    fn test_blocking_wait_times_out() {
        let promise: Promise<u32> = Promise::new();
        let err = promise.get_blocking(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!promise.is_done());
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let promise: Promise<u32> = Promise::new();
        let resolver = promise.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resolver.resolve(Ok(7));
        });
        assert_eq!(promise.get_blocking(Duration::from_secs(5)), Ok(7));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_wait() {
        let promise: Promise<u32> = Promise::new();
        let resolver = promise.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            resolver.on_error(RpcError::Cancelled);
        });
        let err = promise.wait_timeout(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_async_wait_timeout_is_distinct() {
        let promise: Promise<u32> = Promise::new();
        let err = promise
            .wait_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
    }
}
