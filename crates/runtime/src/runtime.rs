//! The engine driver.
//!
//! A [`Runtime`] connects sources and sinks to a dataflow. Each round it
//! polls every source once, buffers the changes in per-input event logs,
//! closes every time all sources have moved past, and runs one executor
//! batch per closed time. Outputs are delivered to sinks and subscribers
//! with retractions ahead of insertions.
//!
//! With persistence enabled every closed batch is logged before it runs and
//! the progress metadata is rewritten every `snapshot_interval` batches. A
//! runtime started on an existing checkpoint replays the logged batches,
//! suppresses outputs that were already delivered and resumes the sources.

use crate::async_transform::AsyncOptions;
use crate::change_set::ChangeSet;
use crate::config::Config;
use crate::connector::{Sink, Source, SourceEvent};
use crate::error::{Result, RuntimeError};
use crate::persist::{CheckpointMetadata, CheckpointStore, PersistedBatch};
use crate::subscription::{SubscriptionId, SubscriptionManager};
use eddy_core::{Error, Timestamp};
use eddy_incremental::{
    BatchOutput, Change, ChangeBatch, Dataflow, ErrorLog, EventLog, Executor, KeyedTable, Update,
};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Counters describing what the runtime did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Batches executed, replayed ones included
    pub batches: u64,
    /// Batches re-executed from the checkpoint log
    pub replayed: u64,
    /// Ingress changes rejected as late or inconsistent
    pub rejected: u64,
    /// Changes a resumed source sent again for already persisted times
    pub skipped: u64,
}

/// What one round did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Times closed and executed in this round
    pub closed: Vec<Timestamp>,
    /// Every source is exhausted and every change processed
    pub finished: bool,
}

struct SourceSlot {
    input: String,
    source: Box<dyn Source>,
    /// Highest time the source promised not to go back to
    frontier: Option<Timestamp>,
    finished: bool,
    /// Offset up to which every change is part of a closed batch
    committed: u64,
}

/// Drives a dataflow from sources to sinks.
pub struct Runtime {
    config: Config,
    executor: Executor,
    logs: BTreeMap<String, EventLog>,
    sources: Vec<SourceSlot>,
    sinks: BTreeMap<String, Vec<Box<dyn Sink>>>,
    subscriptions: BTreeMap<String, SubscriptionManager>,
    store: Option<CheckpointStore>,
    last_closed: Option<Timestamp>,
    last_delivered: Option<Timestamp>,
    /// Outputs at or below this time were delivered before a restart
    suppress_until: Option<Timestamp>,
    /// Changes at or below this time are already in the checkpoint log
    persisted_until: Option<Timestamp>,
    since_checkpoint: usize,
    started: bool,
    ended: bool,
    stats: RuntimeStats,
}

impl Runtime {
    /// Builds a runtime for `dataflow`.
    pub fn new(dataflow: Dataflow, config: Config) -> Result<Self> {
        config.validate()?;
        let executor = Executor::new(dataflow).with_workers(config.workers);
        let logs = executor
            .input_names()
            .map(|name| (name.to_string(), EventLog::new(name)))
            .collect();
        let subscriptions = executor
            .output_names()
            .map(|name| (name.to_string(), SubscriptionManager::new()))
            .collect();
        let store = match &config.persistence {
            Some(persistence) => Some(CheckpointStore::open(&persistence.path)?),
            None => None,
        };
        Ok(Self {
            config,
            executor,
            logs,
            sources: Vec::new(),
            sinks: BTreeMap::new(),
            subscriptions,
            store,
            last_closed: None,
            last_delivered: None,
            suppress_until: None,
            persisted_until: None,
            since_checkpoint: 0,
            started: false,
            ended: false,
            stats: RuntimeStats::default(),
        })
    }

    /// Connects a source to an input. The input's arity must match the
    /// source schema.
    pub fn add_source<S>(&mut self, input: &str, source: S) -> Result<()>
    where
        S: Source + 'static,
    {
        let arity = self
            .executor
            .input_arity(input)
            .ok_or_else(|| RuntimeError::UnknownTable {
                kind: "input",
                name: input.to_string(),
            })?;
        if source.schema().arity() != arity {
            return Err(Error::invalid_operation(format!(
                "source {} has {} columns, input {input} has {arity}",
                source.name(),
                source.schema().arity()
            ))
            .into());
        }
        if let Some(slot) = self
            .sources
            .iter()
            .find(|s| s.input == input || s.source.name() == source.name())
        {
            return Err(RuntimeError::DuplicateSource(slot.source.name().to_string()));
        }
        debug!(source = source.name(), input, "source registered");
        self.sources.push(SourceSlot {
            input: input.to_string(),
            source: Box::new(source),
            frontier: None,
            finished: false,
            committed: 0,
        });
        Ok(())
    }

    /// Connects a sink to an output.
    pub fn add_sink<S>(&mut self, output: &str, sink: S) -> Result<()>
    where
        S: Sink + 'static,
    {
        self.check_output(output)?;
        self.sinks
            .entry(output.to_string())
            .or_default()
            .push(Box::new(sink));
        Ok(())
    }

    /// Calls `on_change` for every batch in which `output` changed.
    pub fn subscribe<F>(&mut self, output: &str, on_change: F) -> Result<SubscriptionId>
    where
        F: FnMut(&ChangeSet) + Send + 'static,
    {
        Ok(self.subscriptions_of(output)?.subscribe(on_change))
    }

    /// Like [`subscribe`](Self::subscribe), plus a callback at the end of
    /// the stream.
    pub fn subscribe_with_end<F, E>(
        &mut self,
        output: &str,
        on_change: F,
        on_end: E,
    ) -> Result<SubscriptionId>
    where
        F: FnMut(&ChangeSet) + Send + 'static,
        E: FnMut() + Send + 'static,
    {
        Ok(self
            .subscriptions_of(output)?
            .subscribe_with_end(on_change, on_end))
    }

    pub fn unsubscribe(&mut self, output: &str, id: SubscriptionId) -> bool {
        self.subscriptions
            .get_mut(output)
            .is_some_and(|subs| subs.unsubscribe(id))
    }

    fn subscriptions_of(&mut self, output: &str) -> Result<&mut SubscriptionManager> {
        self.subscriptions
            .get_mut(output)
            .ok_or_else(|| RuntimeError::UnknownTable {
                kind: "output",
                name: output.to_string(),
            })
    }

    fn check_output(&self, output: &str) -> Result<()> {
        if self.subscriptions.contains_key(output) {
            Ok(())
        } else {
            Err(RuntimeError::UnknownTable {
                kind: "output",
                name: output.to_string(),
            })
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    #[inline]
    pub fn last_closed(&self) -> Option<Timestamp> {
        self.last_closed
    }

    /// Current contents of an output.
    pub fn output_snapshot(&self, output: &str) -> Option<&KeyedTable> {
        self.executor.output_snapshot(output)
    }

    /// Settings for async transformers, from the configured defaults.
    pub fn async_options(&self) -> AsyncOptions {
        AsyncOptions::from_config(&self.config.async_defaults)
    }

    /// Row-level errors recorded so far.
    pub fn error_log(&self) -> &ErrorLog {
        self.executor.error_log()
    }

    /// Runs rounds until every source is exhausted, then writes a final
    /// checkpoint and signals the end of the stream.
    pub fn run(&mut self) -> Result<RuntimeStats> {
        loop {
            let report = self.step()?;
            if report.finished {
                break;
            }
            if report.closed.is_empty() {
                std::thread::yield_now();
            }
        }
        info!(
            batches = self.stats.batches,
            rejected = self.stats.rejected,
            "all sources finished"
        );
        Ok(self.stats.clone())
    }

    /// Runs one round: polls each source once and executes every time that
    /// can be closed.
    pub fn step(&mut self) -> Result<StepReport> {
        if !self.started {
            self.recover()?;
            self.started = true;
        }
        if self.ended {
            return Ok(StepReport {
                closed: Vec::new(),
                finished: true,
            });
        }

        self.poll_sources()?;
        let closed = match self.close_time() {
            Some(time) => self.close_and_run(time)?,
            None => Vec::new(),
        };

        let finished = self.sources.iter().all(|s| s.finished)
            && self.logs.values().all(|log| log.pending_len() == 0);
        if finished {
            self.finish()?;
        }
        Ok(StepReport { closed, finished })
    }

    fn poll_sources(&mut self) -> Result<()> {
        for i in 0..self.sources.len() {
            if self.sources[i].finished {
                continue;
            }
            let event = self.sources[i].source.poll()?;
            match event {
                SourceEvent::Changes(changes) => {
                    for change in changes {
                        self.ingest(i, change)?;
                    }
                }
                SourceEvent::AdvanceTime(time) => {
                    let slot = &mut self.sources[i];
                    slot.frontier = Some(slot.frontier.map_or(time, |f| f.max(time)));
                }
                SourceEvent::Finished => {
                    let slot = &mut self.sources[i];
                    debug!(source = slot.source.name(), "source finished");
                    slot.finished = true;
                }
            }
        }
        Ok(())
    }

    fn ingest(&mut self, slot: usize, change: Change) -> Result<()> {
        if self.persisted_until.is_some_and(|t| change.time <= t) {
            self.stats.skipped += 1;
            return Ok(());
        }
        let input = &self.sources[slot].input;
        let Some(log) = self.logs.get_mut(input) else {
            return Err(RuntimeError::UnknownTable {
                kind: "input",
                name: input.clone(),
            });
        };
        match log.push(change) {
            Ok(()) => Ok(()),
            Err(err) if self.config.strict_ingress => Err(err.into()),
            Err(err) => {
                warn!(input = %input, error = %err, "dropping late change");
                self.stats.rejected += 1;
                Ok(())
            }
        }
    }

    /// Highest time every live source has moved past; with no live source
    /// left, the highest buffered time.
    fn close_time(&self) -> Option<Timestamp> {
        let mut live = self.sources.iter().filter(|s| !s.finished).peekable();
        let time = if live.peek().is_some() {
            live.map(|s| s.frontier).min().flatten()?
        } else {
            self.logs.values().filter_map(EventLog::max_pending_time).max()?
        };
        match self.last_closed {
            Some(last) if time <= last => None,
            _ => Some(time),
        }
    }

    fn close_and_run(&mut self, time: Timestamp) -> Result<Vec<Timestamp>> {
        let mut batches: BTreeMap<Timestamp, BTreeMap<String, Vec<Update>>> = BTreeMap::new();
        for (name, log) in self.logs.iter_mut() {
            let closed = log.close_until(time);
            if !closed.rejected.is_empty() {
                if self.config.strict_ingress {
                    let (_, first) = &closed.rejected[0];
                    return Err(RuntimeError::IngressRejected {
                        input: name.clone(),
                        count: closed.rejected.len(),
                        reason: first.to_string(),
                    });
                }
                self.stats.rejected += closed.rejected.len() as u64;
            }
            for batch in closed.batches {
                batches
                    .entry(batch.time)
                    .or_default()
                    .insert(name.clone(), batch.updates);
            }
        }
        self.last_closed = Some(time);
        for slot in &mut self.sources {
            slot.source.closed(time);
            if self.logs.get(&slot.input).is_some_and(|log| log.pending_len() == 0) {
                slot.committed = slot.source.offset();
            }
        }

        let mut closed = Vec::with_capacity(batches.len());
        for (t, inputs) in batches {
            let batch = PersistedBatch { time: t, inputs };
            if let Some(store) = self.store.as_mut() {
                store.append_batch(&batch)?;
            }
            self.execute(batch)?;
            closed.push(t);
            self.since_checkpoint += 1;
        }
        let interval = self
            .config
            .persistence
            .as_ref()
            .map_or(usize::MAX, |p| p.snapshot_interval);
        if self.since_checkpoint >= interval {
            self.checkpoint()?;
        }
        Ok(closed)
    }

    fn execute(&mut self, batch: PersistedBatch) -> Result<()> {
        let time = batch.time;
        let inputs: HashMap<String, Vec<Update>> = batch.inputs.into_iter().collect();
        let output = self.executor.run_batch(time, inputs)?;
        self.stats.batches += 1;
        if self.suppress_until.is_some_and(|t| time <= t) {
            debug!(time = %time, "suppressing output delivered before restart");
            return Ok(());
        }
        self.deliver(output)?;
        self.last_delivered = Some(time);
        Ok(())
    }

    fn deliver(&mut self, output: BatchOutput) -> Result<()> {
        let time = output.time;
        for (name, mut updates) in output.tables {
            if updates.is_empty() {
                continue;
            }
            updates.sort_by_key(|u| u.is_insert());
            if let Some(sinks) = self.sinks.get_mut(&name) {
                let changes: Vec<_> = updates.iter().map(|u| u.clone().at(time)).collect();
                for sink in sinks.iter_mut() {
                    sink.on_batch(time, &changes)?;
                }
            }
            if let Some(subs) = self.subscriptions.get_mut(&name) {
                subs.notify_all(&ChangeSet::from_updates(time, &updates));
            }
        }
        Ok(())
    }

    /// Writes the progress metadata now.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let metadata = CheckpointMetadata {
            last_closed: self.last_closed,
            last_delivered: self.last_delivered.max(self.suppress_until),
            offsets: self
                .sources
                .iter()
                .map(|s| (s.source.name().to_string(), s.committed))
                .collect(),
            batches: self.stats.batches,
        };
        store.write_metadata(&metadata)?;
        self.since_checkpoint = 0;
        info!(batches = metadata.batches, last_closed = ?metadata.last_closed, "checkpoint written");
        Ok(())
    }

    /// Replays the checkpoint log and resumes the sources.
    fn recover(&mut self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let metadata = store.load_metadata()?.unwrap_or_default();
        let batches = store.load_batches()?;
        if batches.is_empty() {
            return Ok(());
        }
        info!(
            dir = %store.dir().display(),
            batches = batches.len(),
            last_delivered = ?metadata.last_delivered,
            "recovering from checkpoint"
        );
        self.suppress_until = metadata.last_delivered;
        for batch in batches {
            for (name, updates) in &batch.inputs {
                if let Some(log) = self.logs.get_mut(name) {
                    log.restore(&ChangeBatch::new(batch.time, updates.clone()));
                }
            }
            self.last_closed = Some(self.last_closed.map_or(batch.time, |t| t.max(batch.time)));
            self.execute(batch)?;
            self.stats.replayed += 1;
        }
        self.persisted_until = self.last_closed;
        for slot in &mut self.sources {
            let offset = metadata.offsets.get(slot.source.name()).copied().unwrap_or(0);
            slot.source.seek(offset)?;
            slot.committed = offset;
            if let (Some(last_closed), Some(log)) = (self.last_closed, self.logs.get(&slot.input)) {
                slot.source.restored(last_closed, log.snapshot())?;
            }
            debug!(source = slot.source.name(), offset, "source resumed");
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.checkpoint()?;
        for sinks in self.sinks.values_mut() {
            for sink in sinks.iter_mut() {
                sink.on_end()?;
            }
        }
        for subs in self.subscriptions.values_mut() {
            subs.finish_all();
        }
        self.ended = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::connector::{CollectingSink, StaticSource};
    use eddy_core::schema::{Schema, SchemaBuilder};
    use eddy_core::{row, DataType, Key, Row};
    use eddy_incremental::operators::Reducer;
    use std::sync::{Arc, Mutex};

    fn schema() -> Schema {
        SchemaBuilder::new("orders")
            .column("id", DataType::Int)
            .column("customer", DataType::String)
            .column("amount", DataType::Int)
            .primary_key(&["id"])
            .unwrap()
            .build()
            .unwrap()
    }

    fn totals() -> Dataflow {
        let mut df = Dataflow::new();
        let orders = df.input_schema(&schema()).unwrap();
        let totals = df
            .groupby_reduce(orders, &[1], vec![Reducer::IntSum.on(&[2])])
            .unwrap();
        df.output("totals", totals).unwrap();
        df
    }

    fn customer(name: &str) -> Key {
        Key::for_values(&[name.into()])
    }

    #[test]
    fn test_run_delivers_batches_in_time_order() {
        let source = StaticSource::from_rows(
            schema(),
            vec![
                (row![1i64, "alice", 10i64], Timestamp(1)),
                (row![2i64, "bob", 5i64], Timestamp(1)),
                (row![3i64, "alice", 7i64], Timestamp(2)),
            ],
        )
        .unwrap();
        let sink = CollectingSink::new();
        let mut runtime = Runtime::new(totals(), Config::default()).unwrap();
        runtime.add_source("orders", source).unwrap();
        runtime.add_sink("totals", sink.clone()).unwrap();
        let stats = runtime.run().unwrap();
        assert_eq!(stats.batches, 2);

        let collected = sink.collected();
        assert!(collected.finished);
        let times: Vec<Timestamp> = collected.batches.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![Timestamp(1), Timestamp(2)]);
        // Retraction of the old total comes first
        let second = &collected.batches[1].1;
        assert_eq!(
            second[0],
            Change::delete(customer("alice"), row!["alice", 10i64], Timestamp(2))
        );
        assert_eq!(
            second[1],
            Change::insert(customer("alice"), row!["alice", 17i64], Timestamp(2))
        );
        assert_eq!(collected.snapshot().len(), 2);
    }

    #[test]
    fn test_subscriptions_receive_change_sets_and_end() {
        let source = StaticSource::new(schema())
            .insert(row![1i64, "alice", 10i64], Timestamp(1))
            .unwrap()
            .delete(row![1i64, "alice", 10i64], Timestamp(3))
            .unwrap();
        let mut runtime = Runtime::new(totals(), Config::default()).unwrap();
        runtime.add_source("orders", source).unwrap();

        let seen: Arc<Mutex<Vec<(Timestamp, usize, usize)>>> = Arc::default();
        let ended = Arc::new(Mutex::new(false));
        let (s, e) = (seen.clone(), ended.clone());
        runtime
            .subscribe_with_end(
                "totals",
                move |cs| s.lock().unwrap().push((cs.time, cs.added.len(), cs.removed.len())),
                move || *e.lock().unwrap() = true,
            )
            .unwrap();
        runtime.run().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Timestamp(1), 1, 0), (Timestamp(3), 0, 1)]
        );
        assert!(*ended.lock().unwrap());
        assert!(runtime.output_snapshot("totals").unwrap().is_empty());
    }

    #[test]
    fn test_registration_errors() {
        let mut runtime = Runtime::new(totals(), Config::default()).unwrap();
        assert!(matches!(
            runtime.add_sink("missing", CollectingSink::new()),
            Err(RuntimeError::UnknownTable { .. })
        ));
        assert!(runtime.subscribe("missing", |_| {}).is_err());
        assert!(runtime
            .add_source("missing", StaticSource::new(schema()))
            .is_err());

        let narrow = SchemaBuilder::new("orders")
            .column("id", DataType::Int)
            .build()
            .unwrap();
        assert!(runtime.add_source("orders", StaticSource::new(narrow)).is_err());

        runtime.add_source("orders", StaticSource::new(schema())).unwrap();
        assert!(matches!(
            runtime.add_source("orders", StaticSource::new(schema()).named("other")),
            Err(RuntimeError::DuplicateSource(_))
        ));
    }

    #[test]
    fn test_step_waits_for_every_source() {
        let second = SchemaBuilder::new("refunds")
            .column("id", DataType::Int)
            .column("customer", DataType::String)
            .column("amount", DataType::Int)
            .build()
            .unwrap();
        let mut df = Dataflow::new();
        let orders = df.input_schema(&schema()).unwrap();
        let refunds = df.input_schema(&second).unwrap();
        let all = df.concat(&[orders, refunds]).unwrap();
        df.output("all", all).unwrap();

        let orders = StaticSource::from_rows(
            schema(),
            vec![
                (row![1i64, "a", 1i64], Timestamp(1)),
                (row![2i64, "a", 1i64], Timestamp(5)),
            ],
        )
        .unwrap();
        let refunds =
            StaticSource::from_rows(second, vec![(row![9i64, "a", -1i64], Timestamp(3))]).unwrap();
        let mut runtime = Runtime::new(df, Config::default()).unwrap();
        runtime.add_source("orders", orders).unwrap();
        runtime.add_source("refunds", refunds).unwrap();

        // Both sources emit their first run; neither has advanced yet
        assert!(runtime.step().unwrap().closed.is_empty());
        // Orders advance to 1, refunds to 3: time 1 closes
        assert_eq!(runtime.step().unwrap().closed, vec![Timestamp(1)]);
        let stats = runtime.run().unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(runtime.output_snapshot("all").unwrap().len(), 3);
    }

    #[test]
    fn test_strict_ingress_rejects_duplicate_key() {
        let source = StaticSource::new(schema())
            .insert(row![1i64, "alice", 10i64], Timestamp(1))
            .unwrap()
            .insert(row![1i64, "alice", 11i64], Timestamp(2))
            .unwrap();
        let config = Config {
            strict_ingress: true,
            ..Config::default()
        };
        let mut runtime = Runtime::new(totals(), config).unwrap();
        runtime.add_source("orders", source).unwrap();
        assert!(matches!(
            runtime.run(),
            Err(RuntimeError::IngressRejected { .. })
        ));

        let source = StaticSource::new(schema())
            .insert(row![1i64, "alice", 10i64], Timestamp(1))
            .unwrap()
            .insert(row![1i64, "alice", 11i64], Timestamp(2))
            .unwrap();
        let mut runtime = Runtime::new(totals(), Config::default()).unwrap();
        runtime.add_source("orders", source).unwrap();
        let stats = runtime.run().unwrap();
        assert_eq!(stats.rejected, 1);
        let totals = runtime.output_snapshot("totals").unwrap();
        assert_eq!(totals.get(&customer("alice")), Some(&row!["alice", 10i64]));
    }

    #[test]
    fn test_checkpoint_metadata_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            persistence: Some(PersistenceConfig::new(dir.path()).with_snapshot_interval(1)),
            ..Config::default()
        };
        let rows: Vec<(Row, Timestamp)> = (0i64..4)
            .map(|i| (row![i, "c", i], Timestamp(i as u64 + 1)))
            .collect();
        let mut runtime = Runtime::new(totals(), config).unwrap();
        runtime
            .add_source("orders", StaticSource::from_rows(schema(), rows).unwrap())
            .unwrap();
        runtime.run().unwrap();

        let store = CheckpointStore::open(dir.path()).unwrap();
        let metadata = store.load_metadata().unwrap().unwrap();
        assert_eq!(metadata.last_closed, Some(Timestamp(4)));
        assert_eq!(metadata.last_delivered, Some(Timestamp(4)));
        assert_eq!(metadata.offsets.get("orders"), Some(&4));
        assert_eq!(store.load_batches().unwrap().len(), 4);
    }
}
