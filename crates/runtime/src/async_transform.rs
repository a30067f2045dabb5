//! Async row transforms.
//!
//! An [`AsyncTransformer`] calls an async function once per inserted row,
//! on the tokio runtime it was created in. Each call may be bounded by a
//! timeout and retried. Results come back at a later logical time as two
//! tables: rows that succeeded and rows that failed, the latter extended
//! with the error message.
//!
//! Retracting a row whose result was already emitted retracts that result
//! without calling the function again. Retracting a row still in flight
//! discards its result.
//!
//! With an instance grouping, results are held back so that every instance
//! sees its results in non-decreasing input time:
//!
//! - [`Consistency::Partial`] waits for all rows of one `(instance, input
//!   time)` before releasing them
//! - [`Consistency::Full`] waits for all rows of one input time, across
//!   instances

use crate::config::AsyncConfig;
use crate::error::{Result, RuntimeError};
use eddy_core::{Key, Row, Timestamp, Value};
use eddy_incremental::{Change, ColumnId};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// How failed calls are retried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fail on the first error
    #[default]
    None,
    /// Wait `delay` between attempts
    Fixed {
        #[serde(with = "crate::config::millis")]
        delay: Duration,
        max_retries: u32,
    },
    /// Multiply the wait by `multiplier` after every attempt, up to `max_delay`
    ExponentialBackoff {
        #[serde(with = "crate::config::millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "crate::config::millis")]
        max_delay: Duration,
        max_retries: u32,
    },
}

impl RetryStrategy {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self::Fixed { delay, max_retries }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max_delay: Duration, max_retries: u32) -> Self {
        Self::ExponentialBackoff {
            initial,
            multiplier,
            max_delay,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::ExponentialBackoff { max_retries, .. } => {
                *max_retries
            }
        }
    }

    /// Wait before retry number `retry`, counted from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay, .. } => *delay,
            Self::ExponentialBackoff {
                initial,
                multiplier,
                max_delay,
                ..
            } => {
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    *max_delay
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Self::ExponentialBackoff {
            initial,
            multiplier,
            max_delay,
            ..
        } = self
        {
            if !(multiplier.is_finite() && *multiplier >= 1.0) {
                return Err(RuntimeError::config(format!(
                    "backoff multiplier must be at least 1, got {multiplier}"
                )));
            }
            if initial > max_delay {
                return Err(RuntimeError::config(
                    "backoff initial delay exceeds max_delay",
                ));
            }
        }
        Ok(())
    }
}

/// Ordering guarantee for released results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Results are released as soon as they complete
    #[default]
    None,
    /// Per `(instance, input time)` barrier
    Partial,
    /// Per input time barrier over all instances
    Full,
}

/// Settings of one transformer.
#[derive(Debug, Clone)]
pub struct AsyncOptions {
    pub timeout: Option<Duration>,
    pub retry: RetryStrategy,
    /// Maximum number of calls in flight
    pub capacity: usize,
    pub consistency: Consistency,
    /// Columns identifying an instance
    pub instance: Vec<ColumnId>,
}

impl Default for AsyncOptions {
    fn default() -> Self {
        Self::from_config(&AsyncConfig::default())
    }
}

impl AsyncOptions {
    pub fn from_config(config: &AsyncConfig) -> Self {
        Self {
            timeout: config.timeout,
            retry: config.retry.clone(),
            capacity: config.capacity,
            consistency: Consistency::None,
            instance: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the consistency mode and the columns grouping rows into
    /// instances. `Full` ignores the columns.
    pub fn with_consistency(mut self, consistency: Consistency, instance: &[ColumnId]) -> Self {
        self.consistency = consistency;
        self.instance = instance.to_vec();
        self
    }
}

/// Changes released together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformOutput {
    pub time: Timestamp,
    pub successful: Vec<Change>,
    /// Input rows extended with the error message
    pub failed: Vec<Change>,
}

impl TransformOutput {
    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }
}

type CallFuture = Pin<Box<dyn Future<Output = std::result::Result<Row, String>> + Send>>;
type CallFn = Arc<dyn Fn(Row) -> CallFuture + Send + Sync>;

struct Completion {
    key: Key,
    generation: u64,
    instance: Key,
    input_time: Timestamp,
    input: Row,
    outcome: std::result::Result<Row, String>,
}

#[derive(Default)]
struct Barrier {
    pending: usize,
    done: Vec<Completion>,
}

enum Emitted {
    Success(Row),
    Failure(Row),
}

/// Runs an async function per row with retries, timeouts and ordering.
pub struct AsyncTransformer {
    call: CallFn,
    options: AsyncOptions,
    handle: Handle,
    permits: Arc<Semaphore>,
    sender: UnboundedSender<Completion>,
    receiver: UnboundedReceiver<Completion>,
    generations: HashMap<Key, u64>,
    next_generation: u64,
    in_flight: usize,
    barriers: HashMap<Key, BTreeMap<Timestamp, Barrier>>,
    ready: Vec<Completion>,
    retractions: Vec<(Key, Emitted)>,
    emitted: HashMap<Key, Emitted>,
    last_input: Option<Timestamp>,
    clock: Timestamp,
}

impl AsyncTransformer {
    /// Creates a transformer bound to the current tokio runtime.
    pub fn new<F, Fut, E>(f: F, options: AsyncOptions) -> Result<Self>
    where
        F: Fn(Row) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Row, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let handle = Handle::try_current()
            .map_err(|_| RuntimeError::config("async transformer needs a tokio runtime"))?;
        options.retry.validate()?;
        if options.capacity == 0 {
            return Err(RuntimeError::config("async capacity must be greater than 0"));
        }
        let call: CallFn = Arc::new(move |row: Row| -> CallFuture {
            let fut = f(row);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            call,
            permits: Arc::new(Semaphore::new(options.capacity)),
            options,
            handle,
            sender,
            receiver,
            generations: HashMap::new(),
            next_generation: 0,
            in_flight: 0,
            barriers: HashMap::new(),
            ready: Vec::new(),
            retractions: Vec::new(),
            emitted: HashMap::new(),
            last_input: None,
            clock: Timestamp::default(),
        })
    }

    /// Number of calls not yet completed.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Promises that later outputs are strictly after `time`.
    pub fn advance_to(&mut self, time: Timestamp) {
        self.clock = self.clock.max(time);
    }

    /// Registers a successful result emitted before a restart, so that it can
    /// still be retracted.
    pub fn restore_result(&mut self, key: Key, row: Row) {
        self.emitted.insert(key, Emitted::Success(row));
    }

    /// Registers a failure emitted before a restart.
    pub fn restore_failure(&mut self, key: Key, row: Row) {
        self.emitted.insert(key, Emitted::Failure(row));
    }

    /// Starts calls for the insertions of a batch and stages retractions.
    pub fn submit(&mut self, changes: &[Change]) {
        let mut changes: Vec<&Change> = changes.iter().collect();
        changes.sort_by_key(|c| c.diff > 0);
        for change in changes {
            self.last_input = Some(self.last_input.map_or(change.time, |t| t.max(change.time)));
            self.retract(change.key);
            if change.diff > 0 {
                self.spawn(change);
            }
        }
    }

    fn retract(&mut self, key: Key) {
        self.next_generation += 1;
        self.generations.insert(key, self.next_generation);
        if let Some(previous) = self.emitted.remove(&key) {
            self.retractions.push((key, previous));
        }
    }

    fn spawn(&mut self, change: &Change) {
        let generation = self.next_generation;
        let instance = match self.options.consistency {
            Consistency::Partial => Key::for_values(&change.row.extract(&self.options.instance)),
            Consistency::None | Consistency::Full => Key::ABSENT,
        };
        if self.options.consistency != Consistency::None {
            self.barriers
                .entry(instance)
                .or_default()
                .entry(change.time)
                .or_default()
                .pending += 1;
        }
        self.in_flight += 1;

        let call = self.call.clone();
        let permits = self.permits.clone();
        let sender = self.sender.clone();
        let timeout = self.options.timeout;
        let retry = self.options.retry.clone();
        let (key, input, input_time) = (change.key, change.row.clone(), change.time);
        self.handle.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => call_with_retry(&call, key, &input, timeout, &retry).await,
                Err(_) => Err("async transformer shut down".to_string()),
            };
            // The receiver only goes away with the transformer itself
            let _ = sender.send(Completion {
                key,
                generation,
                instance,
                input_time,
                input,
                outcome,
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.options.consistency == Consistency::None {
            self.ready.push(completion);
            return;
        }
        let instance = completion.instance;
        let Some(times) = self.barriers.get_mut(&instance) else {
            self.ready.push(completion);
            return;
        };
        if let Some(barrier) = times.get_mut(&completion.input_time) {
            barrier.pending = barrier.pending.saturating_sub(1);
            barrier.done.push(completion);
        }
        while let Some(entry) = times.first_entry() {
            if entry.get().pending > 0 {
                break;
            }
            self.ready.extend(entry.remove().done);
        }
        if times.is_empty() {
            self.barriers.remove(&instance);
        }
    }

    fn drain(&mut self) {
        while let Ok(completion) = self.receiver.try_recv() {
            self.complete(completion);
        }
    }

    /// Turns staged retractions and released results into one output.
    fn take_output(&mut self) -> Option<TransformOutput> {
        if self.ready.is_empty() && self.retractions.is_empty() {
            return None;
        }
        let next = self.clock.next();
        self.clock = self.last_input.map_or(next, |t| next.max(t.next()));
        let time = self.clock;

        let mut output = TransformOutput {
            time,
            ..Default::default()
        };
        for (key, previous) in self.retractions.drain(..) {
            match previous {
                Emitted::Success(row) => output.successful.push(Change::delete(key, row, time)),
                Emitted::Failure(row) => output.failed.push(Change::delete(key, row, time)),
            }
        }
        for completion in std::mem::take(&mut self.ready) {
            if self.generations.get(&completion.key) != Some(&completion.generation) {
                debug!(key = %completion.key, "discarding result of retracted row");
                continue;
            }
            let key = completion.key;
            match completion.outcome {
                Ok(row) => {
                    output.successful.push(Change::insert(key, row.clone(), time));
                    self.emitted.insert(key, Emitted::Success(row));
                }
                Err(message) => {
                    let row = completion.input.with_appended([Value::from(message.as_str())]);
                    output.failed.push(Change::insert(key, row.clone(), time));
                    self.emitted.insert(key, Emitted::Failure(row));
                }
            }
        }
        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }

    /// Returns whatever can be released now without waiting.
    pub fn try_next(&mut self) -> Option<TransformOutput> {
        self.drain();
        self.take_output()
    }

    /// Waits until something can be released. Returns `None` once every
    /// call has completed and nothing is left to release.
    pub async fn next_output(&mut self) -> Option<TransformOutput> {
        loop {
            self.drain();
            if let Some(output) = self.take_output() {
                return Some(output);
            }
            if self.in_flight == 0 {
                return None;
            }
            let completion = self.receiver.recv().await?;
            self.complete(completion);
        }
    }

    /// Waits for every call in flight and releases all results at once.
    pub async fn flush(&mut self) -> Result<Option<TransformOutput>> {
        while self.in_flight > 0 {
            let completion = self.receiver.recv().await.ok_or(RuntimeError::ChannelClosed)?;
            self.complete(completion);
        }
        Ok(self.take_output())
    }
}

async fn call_with_retry(
    call: &CallFn,
    key: Key,
    input: &Row,
    timeout: Option<Duration>,
    retry: &RetryStrategy,
) -> std::result::Result<Row, String> {
    let mut retries = 0;
    loop {
        let attempt = call(input.clone());
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
            },
            None => attempt.await,
        };
        match result {
            Ok(row) => return Ok(row),
            Err(message) if retries < retry.max_retries() => {
                retries += 1;
                let delay = retry.delay(retries);
                warn!(key = %key, retry = retries, delay_ms = delay.as_millis() as u64, error = %message, "async call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(message) => {
                warn!(key = %key, attempts = retries + 1, error = %message, "async call failed");
                return Err(message);
            }
        }
    }
}
