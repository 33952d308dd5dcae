//! Batch engine
//!
//! One state machine runs batches for all connector tiers:
//!
//! - **None**: the engine runs every task through the facade's single
//!   operations and reports one result per task.
//! - **Synchronous**: the connector reports every result before
//!   `execute_batch` returns; the subscription is already finished.
//! - **Token**: the connector keeps running in the background; results are
//!   buffered until the caller collects them with `query_batch`.
//! - **Callback**: the connector keeps running in the background and its
//!   results are pushed to the caller's observer as they arrive.
//!
//! Every result id is delivered at most once, and the result carrying
//! `complete = true` is delivered together with `on_completed`.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use icf_connector::{
    BatchListener, BatchOptions, BatchOutcome, BatchResult, BatchSink, BatchSupport, BatchTask,
    BatchToken, ConnectorError, ConnectorResult,
};
use icf_rpc::{Observer, Subscription};

use crate::config::BatchConfig;
use crate::facade::SharedObserver;
use crate::pool::PooledConnector;

// ============================================================================
// Subscriptions
// ============================================================================

/// Handle on a batch started by `execute_batch` or resumed by `query_batch`.
pub trait BatchSubscription: Subscription + fmt::Debug {
    /// Token to resume the batch with, for asynchronous tiers.
    fn token(&self) -> Option<BatchToken>;

    /// Tier the batch runs in.
    fn support(&self) -> BatchSupport;
}

/// Subscription on a batch running in this process.
pub struct LocalBatchSubscription {
    support: BatchSupport,
    token: Option<BatchToken>,
    record: Option<Arc<BatchRecord>>,
}

impl LocalBatchSubscription {
    fn finished(support: BatchSupport) -> Self {
        Self {
            support,
            token: None,
            record: None,
        }
    }

    fn tracking(support: BatchSupport, token: BatchToken, record: Arc<BatchRecord>) -> Self {
        Self {
            support,
            token: Some(token),
            record: Some(record),
        }
    }
}

impl Subscription for LocalBatchSubscription {
    fn unsubscribe(&self) {
        if let Some(record) = &self.record {
            record.cancel();
        }
    }

    fn is_unsubscribed(&self) -> bool {
        self.record.as_ref().map_or(true, |record| record.is_settled())
    }
}

impl BatchSubscription for LocalBatchSubscription {
    fn token(&self) -> Option<BatchToken> {
        self.token
    }

    fn support(&self) -> BatchSupport {
        self.support
    }
}

impl fmt::Debug for LocalBatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBatchSubscription")
            .field("support", &self.support)
            .field("token", &self.token)
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

// ============================================================================
// Batch record
// ============================================================================

#[derive(Debug, Clone)]
enum Finish {
    Completed,
    Failed(ConnectorError),
}

fn deliver(observer: &SharedObserver<BatchResult>, finish: &Finish) {
    match finish {
        Finish::Completed => observer.on_completed(),
        Finish::Failed(e) => observer.on_error(e.clone()),
    }
}

struct RecordState {
    observer: Option<SharedObserver<BatchResult>>,
    buffer: VecDeque<BatchResult>,
    seen: HashSet<String>,
    finish: Option<Finish>,
    terminal_delivered: bool,
    last_activity: Instant,
}

/// State of one natively executed batch. Receives the connector's results
/// through a [`BatchSink`].
///
/// Observer callbacks run outside the state lock so an observer may cancel
/// or inspect its batch from inside a callback. The reentrant `delivery`
/// lock keeps events in order across threads.
pub(crate) struct BatchRecord {
    support: BatchSupport,
    token: OnceLock<BatchToken>,
    state: Mutex<RecordState>,
    delivery: ReentrantMutex<()>,
    cancel: CancellationToken,
    lease: Mutex<Option<PooledConnector>>,
}

impl BatchRecord {
    fn new(
        support: BatchSupport,
        observer: Option<SharedObserver<BatchResult>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            support,
            token: OnceLock::new(),
            state: Mutex::new(RecordState {
                observer,
                buffer: VecDeque::new(),
                seen: HashSet::new(),
                finish: None,
                terminal_delivered: false,
                last_activity: Instant::now(),
            }),
            delivery: ReentrantMutex::new(()),
            cancel,
            lease: Mutex::new(None),
        }
    }

    fn token_label(&self) -> String {
        self.token
            .get()
            .map_or_else(|| "pending".to_string(), ToString::to_string)
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finish.is_some()
    }

    /// Finished and the terminal event reached a caller.
    fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.finish.is_some() && state.terminal_delivered
    }

    fn is_expired(&self, finished_retention: Duration, running_retention: Duration) -> bool {
        let state = self.state.lock();
        let retention = if state.finish.is_some() {
            finished_retention
        } else {
            running_retention
        };
        state.last_activity.elapsed() >= retention
    }

    /// Record the terminal state and push it to the attached observer.
    fn finish(&self, finish: Finish) -> bool {
        let _delivery = self.delivery.lock();
        let observer = {
            let mut state = self.state.lock();
            match Self::finish_locked(&mut state, finish.clone()) {
                Some(observer) => observer,
                None => return false,
            }
        };
        if let Some(observer) = observer {
            deliver(&observer, &finish);
        }
        self.release_lease();
        true
    }

    /// Mark the batch finished. Returns `None` if it already was, otherwise
    /// the observer that must receive the terminal event.
    fn finish_locked(
        state: &mut RecordState,
        finish: Finish,
    ) -> Option<Option<SharedObserver<BatchResult>>> {
        if state.finish.is_some() {
            return None;
        }
        state.last_activity = Instant::now();
        state.finish = Some(finish);
        let observer = state.observer.take();
        if observer.is_some() {
            state.terminal_delivered = true;
        }
        Some(observer)
    }

    fn cancel(&self) {
        self.cancel.cancel();
        if self.finish(Finish::Failed(ConnectorError::Cancelled)) {
            info!(token = %self.token_label(), "Batch cancelled");
        }
    }

    fn release_lease(&self) {
        let lease = self.lease.lock().take();
        drop(lease);
    }

    /// Hand results to a querying observer.
    ///
    /// Token batches drain their buffer into it; callback batches attach it
    /// for the results still to come. A finished batch also delivers its
    /// terminal event. Returns whether the batch is finished.
    fn query(&self, observer: SharedObserver<BatchResult>) -> bool {
        let _delivery = self.delivery.lock();
        let (buffered, finish) = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            let buffered: Vec<BatchResult> = state.buffer.drain(..).collect();
            let finish = state.finish.clone();
            if finish.is_some() {
                state.terminal_delivered = true;
            } else if self.support == BatchSupport::Callback {
                state.observer = Some(observer.clone());
            }
            (buffered, finish)
        };

        for result in buffered {
            observer.on_next(result);
        }
        match finish {
            Some(finish) => {
                deliver(&observer, &finish);
                true
            }
            None => false,
        }
    }
}

impl BatchListener for BatchRecord {
    fn on_result(&self, result: BatchResult) -> bool {
        let complete = result.complete;
        let _delivery = self.delivery.lock();
        let (pushed, terminal) = {
            let mut state = self.state.lock();
            if state.finish.is_some() {
                debug!(token = %self.token_label(), result_id = %result.result_id, "Late batch result dropped");
                return false;
            }
            if !state.seen.insert(result.result_id.clone()) {
                debug!(token = %self.token_label(), result_id = %result.result_id, "Duplicate batch result dropped");
                return !self.cancel.is_cancelled();
            }
            state.last_activity = Instant::now();

            let observer = state.observer.clone();
            let pushed = match observer {
                Some(observer) => Some((observer, result)),
                None => {
                    state.buffer.push_back(result);
                    None
                }
            };
            let terminal = if complete {
                Self::finish_locked(&mut state, Finish::Completed).flatten()
            } else {
                None
            };
            (pushed, terminal)
        };

        if let Some((observer, result)) = pushed {
            observer.on_next(result);
        }
        if let Some(observer) = terminal {
            observer.on_completed();
        }

        if complete {
            self.release_lease();
            debug!(token = %self.token_label(), "Batch complete");
        }
        !complete && !self.cancel.is_cancelled()
    }

    fn on_failure(&self, error: ConnectorError) {
        warn!(token = %self.token_label(), error = %error, "Batch failed");
        self.finish(Finish::Failed(error));
    }

    fn on_abandoned(&self) {
        if self.finish(Finish::Failed(ConnectorError::operation_failed(
            "batch abandoned before completion",
        ))) {
            warn!(token = %self.token_label(), "Batch abandoned by connector");
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs one batch task as a single operation.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: BatchTask) -> ConnectorResult<BatchOutcome>;
}

/// Registry and driver of batches.
pub struct BatchEngine {
    config: BatchConfig,
    records: DashMap<BatchToken, Arc<BatchRecord>>,
}

impl BatchEngine {
    /// Create an engine with no batches.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Run a batch task by task.
    ///
    /// Result ids are task indexes. A failing task yields an error result;
    /// with `fail_on_error` the batch then stops with `on_error`. The
    /// cancellation token is checked between tasks, so the task in flight
    /// still reports its result.
    pub async fn run_sequential(
        &self,
        runner: &dyn TaskRunner,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>> {
        let total = tasks.len();
        for (index, task) in tasks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(completed = index, total, "Batch cancelled between tasks");
                observer.on_error(ConnectorError::Cancelled);
                return Ok(None);
            }

            let operation = task.operation();
            match runner.run_task(task).await {
                Ok(outcome) => {
                    let mut result = BatchResult::success(index.to_string(), outcome);
                    result.complete = index + 1 == total;
                    observer.on_next(result);
                }
                Err(e) if options.fail_on_error => {
                    warn!(task = index, operation = %operation, error = %e, "Batch stopped on failed task");
                    observer.on_next(BatchResult::failure(index.to_string(), &e));
                    observer.on_error(e);
                    return Ok(None);
                }
                Err(e) => {
                    debug!(task = index, operation = %operation, error = %e, "Batch task failed");
                    let mut result = BatchResult::failure(index.to_string(), &e);
                    result.complete = index + 1 == total;
                    observer.on_next(result);
                }
            }
        }
        observer.on_completed();
        Ok(None)
    }

    /// Run a batch through the connector's native support.
    ///
    /// `lease` is held until the batch finishes, so the instance stays
    /// checked out while background work runs.
    pub async fn run_native(
        &self,
        lease: PooledConnector,
        support: BatchSupport,
        tasks: Vec<BatchTask>,
        observer: SharedObserver<BatchResult>,
        options: &BatchOptions,
        cancel: CancellationToken,
    ) -> ConnectorResult<Option<Box<dyn BatchSubscription>>> {
        if tasks.is_empty() {
            observer.on_completed();
            return Ok(None);
        }

        let attached = (support != BatchSupport::Token).then(|| observer.clone());
        let record = Arc::new(BatchRecord::new(support, attached, cancel.clone()));
        let sink = BatchSink::new(record.clone(), cancel.clone());
        let connector = lease.connector();
        *record.lease.lock() = Some(lease);

        let started = connector.execute_batch(tasks, sink.clone(), options).await;
        match started {
            Err(e) => {
                warn!(support = %support, error = %e, "Batch failed to start");
                record.finish(Finish::Failed(e.clone()));
                if support == BatchSupport::Token {
                    observer.on_error(e.clone());
                }
                Err(e)
            }
            Ok(Some(token)) if support.is_asynchronous() => {
                let _ = record.token.set(token);
                self.records.insert(token, record.clone());
                drop(sink);
                info!(token = %token, support = %support, "Batch started");
                Ok(Some(Box::new(LocalBatchSubscription::tracking(
                    support, token, record,
                ))))
            }
            Ok(token) => {
                if token.is_some() {
                    warn!(support = %support, "Token returned by synchronous batch ignored");
                }
                let finish = if cancel.is_cancelled() {
                    Finish::Failed(ConnectorError::Cancelled)
                } else {
                    Finish::Completed
                };
                record.finish(finish);
                if support == BatchSupport::Token {
                    record.query(observer);
                }
                drop(sink);
                Ok(Some(Box::new(LocalBatchSubscription::finished(support))))
            }
        }
    }

    /// Collect results of an asynchronous batch.
    ///
    /// A finished batch delivers its terminal event and is forgotten.
    pub fn query(
        &self,
        token: BatchToken,
        observer: SharedObserver<BatchResult>,
    ) -> ConnectorResult<Box<dyn BatchSubscription>> {
        let record = self
            .records
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or(ConnectorError::BatchTokenNotFound { token })?;

        if record.query(observer) {
            self.records.remove(&token);
            debug!(token = %token, "Batch collected");
        }
        Ok(Box::new(LocalBatchSubscription::tracking(
            record.support,
            token,
            record,
        )))
    }

    /// Cancel an asynchronous batch. Returns false for unknown tokens.
    pub fn cancel(&self, token: BatchToken) -> bool {
        match self.records.get(&token).map(|entry| entry.value().clone()) {
            Some(record) => {
                record.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget batches nobody collected within the retention periods.
    ///
    /// Running batches past their retention are cancelled. Returns the
    /// number of batches removed.
    pub fn expire(&self) -> usize {
        let finished_retention = self.config.retention_finished();
        let running_retention = self.config.retention_running();
        let tokens: Vec<BatchToken> = self.records.iter().map(|entry| *entry.key()).collect();

        let mut expired = 0;
        for token in tokens {
            let removed = self.records.remove_if(&token, |_, record| {
                record.is_expired(finished_retention, running_retention)
            });
            if let Some((_, record)) = removed {
                if !record.is_finished() {
                    record.cancel();
                }
                debug!(token = %token, "Batch expired");
                expired += 1;
            }
        }
        expired
    }

    /// Number of tracked asynchronous batches.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cancel every running batch and forget all of them.
    pub fn shutdown(&self) {
        let records: Vec<Arc<BatchRecord>> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.records.clear();
        for record in records {
            record.cancel();
        }
    }
}

impl fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEngine")
            .field("batches", &self.records.len())
            .finish()
    }
}
