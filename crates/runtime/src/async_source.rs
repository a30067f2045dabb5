//! Sources fed through an async transformer.
//!
//! An [`AsyncSource`] reads an upstream source, hands its changes to an
//! [`AsyncTransformer`] and emits the successful results as a table of its
//! own. Every result carries the time it was released at, which is always
//! later than the input it came from. Rows whose call failed are emitted by
//! the [`FailedSource`] from [`AsyncSource::failures`], with the same times
//! and the same frontiers.
//!
//! While no call is in flight, the source follows the upstream frontier, so
//! an idle transformer does not hold back the runtime.
//!
//! Offsets are upstream offsets. Whenever every upstream change read so far
//! has its results queued, the source notes the upstream offset together
//! with the time of the last release; the offset reported is the latest
//! note at or below the closed time. Reading an input row again after a
//! restart retracts the result it had before, so replaying from that offset
//! never duplicates results.

use crate::async_transform::{AsyncTransformer, TransformOutput};
use crate::connector::{Source, SourceEvent};
use crate::error::{Result, RuntimeError};
use eddy_core::schema::{Schema, SchemaBuilder};
use eddy_core::{DataType, Key, Row, Timestamp};
use eddy_incremental::KeyedTable;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Default)]
struct FailedQueue {
    attached: bool,
    events: VecDeque<SourceEvent>,
    /// Failures emitted before a restart, waiting for the transformer
    restored: Vec<(Key, Row)>,
}

type SharedQueue = Arc<Mutex<FailedQueue>>;

fn lock(shared: &SharedQueue) -> MutexGuard<'_, FailedQueue> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source emitting the results of an async transform over another source.
pub struct AsyncSource<S> {
    name: String,
    schema: Schema,
    upstream: S,
    transformer: AsyncTransformer,
    queue: VecDeque<SourceEvent>,
    failed: SharedQueue,
    upstream_frontier: Option<Timestamp>,
    upstream_done: bool,
    /// Highest time promised downstream
    advanced: Option<Timestamp>,
    finished: bool,
    marks: VecDeque<(Timestamp, u64)>,
    committed: u64,
}

impl<S: Source> AsyncSource<S> {
    /// Wraps `upstream`. `schema` describes the rows the transformer returns
    /// and names the source.
    pub fn new(upstream: S, transformer: AsyncTransformer, schema: Schema) -> Self {
        Self {
            name: schema.name().to_string(),
            schema,
            upstream,
            transformer,
            queue: VecDeque::new(),
            failed: SharedQueue::default(),
            upstream_frontier: None,
            upstream_done: false,
            advanced: None,
            finished: false,
            marks: VecDeque::new(),
            committed: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the source of failed rows: the upstream columns followed by
    /// an `error` column holding the message. Failures are dropped when this
    /// is never called.
    pub fn failures(&self) -> Result<FailedSource> {
        let schema = self
            .upstream
            .schema()
            .columns()
            .iter()
            .fold(
                SchemaBuilder::new(format!("{}_failed", self.name)),
                |builder, column| builder.add(column.clone()),
            )
            .column("error", DataType::String)
            .build()?;
        let mut shared = lock(&self.failed);
        if shared.attached {
            return Err(RuntimeError::DuplicateSource(schema.name().to_string()));
        }
        shared.attached = true;
        Ok(FailedSource {
            name: schema.name().to_string(),
            schema,
            shared: self.failed.clone(),
            finished: false,
        })
    }

    fn adopt_restored(&mut self) {
        let restored = std::mem::take(&mut lock(&self.failed).restored);
        for (key, row) in restored {
            self.transformer.restore_failure(key, row);
        }
    }

    fn release(&mut self, output: TransformOutput) {
        debug!(
            source = %self.name,
            time = %output.time,
            successful = output.successful.len(),
            failed = output.failed.len(),
            "async results released"
        );
        if !output.successful.is_empty() {
            self.queue.push_back(SourceEvent::Changes(output.successful));
        }
        if !output.failed.is_empty() {
            let mut shared = lock(&self.failed);
            if shared.attached {
                shared.events.push_back(SourceEvent::Changes(output.failed));
            }
        }
        self.advance(output.time);
    }

    fn advance(&mut self, time: Timestamp) {
        self.queue.push_back(SourceEvent::AdvanceTime(time));
        {
            let mut shared = lock(&self.failed);
            if shared.attached {
                shared.events.push_back(SourceEvent::AdvanceTime(time));
            }
        }
        self.advanced = Some(time);
        if self.transformer.in_flight() == 0 {
            self.marks.push_back((time, self.upstream.offset()));
        }
    }

    fn finish(&mut self) {
        debug!(source = %self.name, "async source finished");
        self.finished = true;
        self.queue.push_back(SourceEvent::Finished);
        let mut shared = lock(&self.failed);
        if shared.attached {
            shared.events.push_back(SourceEvent::Finished);
        }
    }
}

impl<S: Source> Source for AsyncSource<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll(&mut self) -> Result<SourceEvent> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }
        if self.finished {
            return Ok(SourceEvent::Finished);
        }
        self.adopt_restored();
        if !self.upstream_done {
            match self.upstream.poll()? {
                SourceEvent::Changes(changes) => self.transformer.submit(&changes),
                SourceEvent::AdvanceTime(time) => {
                    self.upstream_frontier =
                        Some(self.upstream_frontier.map_or(time, |f| f.max(time)));
                }
                SourceEvent::Finished => self.upstream_done = true,
            }
        }

        if let Some(output) = self.transformer.try_next() {
            self.release(output);
        } else if self.transformer.in_flight() == 0 {
            if self.upstream_done {
                self.finish();
            } else if let Some(frontier) = self
                .upstream_frontier
                .filter(|f| self.advanced.map_or(true, |a| *f > a))
            {
                self.transformer.advance_to(frontier);
                self.advance(frontier);
            }
        }
        Ok(self
            .queue
            .pop_front()
            .unwrap_or(SourceEvent::Changes(Vec::new())))
    }

    fn offset(&self) -> u64 {
        self.committed
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.upstream.seek(offset)?;
        self.committed = offset;
        self.marks.clear();
        self.queue.clear();
        Ok(())
    }

    fn closed(&mut self, time: Timestamp) {
        while let Some(&(mark, offset)) = self.marks.front() {
            if mark > time {
                break;
            }
            self.committed = offset;
            self.marks.pop_front();
        }
    }

    fn restored(&mut self, last_closed: Timestamp, rows: &KeyedTable) -> Result<()> {
        self.transformer.advance_to(last_closed);
        self.advanced = Some(last_closed);
        for (key, row) in rows.iter() {
            self.transformer.restore_result(*key, row.clone());
        }
        debug!(source = %self.name, results = rows.len(), "async results restored");
        Ok(())
    }
}

/// Source emitting the rows an [`AsyncSource`] failed on.
///
/// Its progress is tracked by the async source, so its own offset is
/// always 0.
pub struct FailedSource {
    name: String,
    schema: Schema,
    shared: SharedQueue,
    finished: bool,
}

impl Source for FailedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll(&mut self) -> Result<SourceEvent> {
        let event = lock(&self.shared).events.pop_front();
        Ok(match event {
            Some(SourceEvent::Finished) => {
                self.finished = true;
                SourceEvent::Finished
            }
            Some(event) => event,
            None if self.finished => SourceEvent::Finished,
            None => SourceEvent::Changes(Vec::new()),
        })
    }

    fn offset(&self) -> u64 {
        0
    }

    fn seek(&mut self, _offset: u64) -> Result<()> {
        lock(&self.shared).events.clear();
        Ok(())
    }

    fn restored(&mut self, _last_closed: Timestamp, rows: &KeyedTable) -> Result<()> {
        lock(&self.shared)
            .restored
            .extend(rows.iter().map(|(key, row)| (*key, row.clone())));
        Ok(())
    }
}
