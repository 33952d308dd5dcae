//! Push-style event sink
//!
//! [`Observer`] is the single callback abstraction for streamed results
//! (search objects, sync deltas, batch results, response parts). Blocking
//! and async waiting are layered on top of it by [`Promise`](crate::promise::Promise).

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::RpcError;

/// Receiver of a stream of values.
///
/// `on_next` may be called any number of times, followed by exactly one of
/// `on_error` or `on_completed`. No callback follows the terminal one.
pub trait Observer<T, E = RpcError>: Send + Sync {
    /// Deliver the next value.
    fn on_next(&self, value: T);

    /// Terminate the stream with an error.
    fn on_error(&self, error: E);

    /// Terminate the stream successfully.
    fn on_completed(&self);
}

impl<T, E, O> Observer<T, E> for Arc<O>
where
    O: Observer<T, E> + ?Sized,
{
    fn on_next(&self, value: T) {
        (**self).on_next(value);
    }

    fn on_error(&self, error: E) {
        (**self).on_error(error);
    }

    fn on_completed(&self) {
        (**self).on_completed();
    }
}

/// Cancellable handle on an ongoing stream.
pub trait Subscription: Send + Sync {
    /// Stop receiving further values.
    fn unsubscribe(&self);

    /// Check if the stream is finished or was cancelled.
    fn is_unsubscribed(&self) -> bool;
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<T, E> Observer<T, E> for NoopObserver {
    fn on_next(&self, _value: T) {}
    fn on_error(&self, _error: E) {}
    fn on_completed(&self) {}
}

/// Terminal state recorded by a [`CollectingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination<E> {
    Completed,
    Failed(E),
}

struct Collected<T, E> {
    items: Vec<T>,
    termination: Option<Termination<E>>,
    late_events: usize,
}

/// Observer that records every event, for callers that want the whole stream.
pub struct CollectingObserver<T, E = RpcError> {
    state: Mutex<Collected<T, E>>,
    done: Notify,
}

impl<T, E> CollectingObserver<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Collected {
                items: Vec::new(),
                termination: None,
                late_events: 0,
            }),
            done: Notify::new(),
        }
    }

    /// Values received so far.
    pub fn items(&self) -> Vec<T> {
        self.state.lock().items.clone()
    }

    /// Number of values received so far.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if no value was received.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Terminal event, if one arrived.
    pub fn termination(&self) -> Option<Termination<E>> {
        self.state.lock().termination.clone()
    }

    /// Check if the stream completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self.termination(), Some(Termination::Completed))
    }

    /// Error the stream failed with, if any.
    pub fn error(&self) -> Option<E> {
        match self.termination() {
            Some(Termination::Failed(e)) => Some(e),
            _ => None,
        }
    }

    /// Events received after the terminal event (always zero for a
    /// well-behaved producer).
    pub fn late_events(&self) -> usize {
        self.state.lock().late_events
    }

    /// Wait until the terminal event arrives.
    pub async fn wait_terminal(&self) -> Termination<E> {
        loop {
            let notified = self.done.notified();
            if let Some(t) = self.termination() {
                return t;
            }
            notified.await;
        }
    }

    fn terminate(&self, termination: Termination<E>) {
        {
            let mut state = self.state.lock();
            if state.termination.is_some() {
                state.late_events += 1;
                return;
            }
            state.termination = Some(termination);
        }
        self.done.notify_waiters();
    }
}

impl<T, E> Default for CollectingObserver<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Observer<T, E> for CollectingObserver<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if state.termination.is_some() {
            state.late_events += 1;
        } else {
            state.items.push(value);
        }
    }

    fn on_error(&self, error: E) {
        self.terminate(Termination::Failed(error));
    }

    fn on_completed(&self) {
        self.terminate(Termination::Completed);
    }
}
