//! Source and sink interfaces.
//!
//! A [`Source`] feeds one input table. Each poll returns changes, a promise
//! that no change at or below some time will follow, or the end of the
//! stream. Offsets let the runtime resume a source after a restart; a source
//! must be able to replay everything after an offset it reported.
//!
//! A [`Sink`] receives the changes of one output table, batch by batch, with
//! retractions ahead of insertions.

use crate::error::{Result, RuntimeError};
use eddy_core::schema::Schema;
use eddy_core::{Error, KeyGenerator, Row, Timestamp};
use eddy_incremental::{Change, KeyedTable};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What a source produced on one poll.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    /// New changes; may be empty when nothing is available yet
    Changes(Vec<Change>),
    /// No further change at or below this time will be produced
    AdvanceTime(Timestamp),
    /// The source is exhausted
    Finished,
}

/// A producer of changes for one input table.
pub trait Source: Send {
    /// Name used for offsets in checkpoints.
    fn name(&self) -> &str;

    fn schema(&self) -> &Schema;

    fn poll(&mut self) -> Result<SourceEvent>;

    /// Position after the last change returned by `poll`.
    fn offset(&self) -> u64;

    /// Restarts reading at `offset`.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Called after every change at or below `time` went into a closed
    /// batch. `offset` is read right after this call.
    fn closed(&mut self, _time: Timestamp) {}

    /// Called once after a restart, before the first poll, with the last
    /// time already processed and the rows the fed input held at that time.
    fn restored(&mut self, _last_closed: Timestamp, _rows: &KeyedTable) -> Result<()> {
        Ok(())
    }
}

/// A consumer of changes for one output table.
pub trait Sink: Send {
    fn on_batch(&mut self, time: Timestamp, changes: &[Change]) -> Result<()>;

    /// Called once after the last batch.
    fn on_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory source replaying a fixed list of changes.
///
/// Changes are emitted one time at a time in the order they were added.
/// After a run of changes at time `t`, the source advances to `t` unless
/// a later change still goes back to `t` or earlier.
pub struct StaticSource {
    name: String,
    schema: Schema,
    keys: KeyGenerator,
    changes: Vec<Change>,
    cursor: usize,
    advance: Option<Timestamp>,
}

impl StaticSource {
    pub fn new(schema: Schema) -> Self {
        let name = schema.name().to_string();
        Self {
            keys: KeyGenerator::new(&name),
            name,
            schema,
            changes: Vec::new(),
            cursor: 0,
            advance: None,
        }
    }

    /// Builds a source inserting every row at its time.
    pub fn from_rows<I>(schema: Schema, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Row, Timestamp)>,
    {
        rows.into_iter()
            .try_fold(Self::new(schema), |source, (row, time)| source.insert(row, time))
    }

    /// Renames the source; the default name is the schema name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends an insertion. The row is validated against the schema.
    pub fn insert(mut self, row: Row, time: Timestamp) -> Result<Self> {
        let row = self.schema.validate_row(&row)?;
        let key = self.schema.key_for(&row, &self.keys);
        self.changes.push(Change::insert(key, row, time));
        Ok(self)
    }

    /// Appends a retraction. Only schemas with a primary key can address
    /// an earlier row.
    pub fn delete(mut self, row: Row, time: Timestamp) -> Result<Self> {
        if self.schema.primary_key_columns().is_empty() {
            return Err(Error::invalid_operation(format!(
                "{}: deletions need a primary key",
                self.name
            ))
            .into());
        }
        let row = self.schema.validate_row(&row)?;
        let key = self.schema.key_for(&row, &self.keys);
        self.changes.push(Change::delete(key, row, time));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll(&mut self) -> Result<SourceEvent> {
        if let Some(time) = self.advance.take() {
            return Ok(SourceEvent::AdvanceTime(time));
        }
        let Some(first) = self.changes.get(self.cursor) else {
            return Ok(SourceEvent::Finished);
        };
        let time = first.time;
        let end = self.changes[self.cursor..]
            .iter()
            .position(|c| c.time != time)
            .map_or(self.changes.len(), |n| self.cursor + n);
        let run = self.changes[self.cursor..end].to_vec();
        self.cursor = end;
        if self.changes[end..].iter().all(|c| c.time > time) {
            self.advance = Some(time);
        }
        Ok(SourceEvent::Changes(run))
    }

    fn offset(&self) -> u64 {
        self.cursor as u64
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if offset > self.changes.len() {
            return Err(RuntimeError::connector(
                &self.name,
                format!("offset {offset} beyond {} changes", self.changes.len()),
            ));
        }
        self.cursor = offset;
        self.advance = None;
        Ok(())
    }
}

/// Everything a [`CollectingSink`] received.
#[derive(Debug, Default)]
pub struct Collected {
    pub batches: Vec<(Timestamp, Vec<Change>)>,
    pub finished: bool,
}

impl Collected {
    /// Returns all changes in delivery order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.batches.iter().flat_map(|(_, changes)| changes.iter())
    }

    /// Replays the changes into the table they describe.
    pub fn snapshot(&self) -> BTreeMap<eddy_core::Key, Row> {
        let mut table = BTreeMap::new();
        for change in self.changes() {
            if change.diff > 0 {
                table.insert(change.key, change.row.clone());
            } else if table.get(&change.key) == Some(&change.row) {
                table.remove(&change.key);
            }
        }
        table
    }
}

/// Sink recording every batch, readable through a shared handle.
#[derive(Clone, Default)]
pub struct CollectingSink {
    collected: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for CollectingSink {
    fn on_batch(&mut self, time: Timestamp, changes: &[Change]) -> Result<()> {
        self.collected().batches.push((time, changes.to_vec()));
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        self.collected().finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::schema::SchemaBuilder;
    use eddy_core::{row, DataType};

    fn schema() -> Schema {
        SchemaBuilder::new("prices")
            .column("symbol", DataType::String)
            .column("price", DataType::Int)
            .primary_key(&["symbol"])
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_static_source_emits_runs_and_advances() {
        let mut source = StaticSource::new(schema())
            .insert(row!["a", 1i64], Timestamp(1))
            .unwrap()
            .insert(row!["b", 2i64], Timestamp(1))
            .unwrap()
            .insert(row!["c", 3i64], Timestamp(2))
            .unwrap();

        match source.poll().unwrap() {
            SourceEvent::Changes(changes) => assert_eq!(changes.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.poll().unwrap(), SourceEvent::AdvanceTime(Timestamp(1)));
        assert!(matches!(source.poll().unwrap(), SourceEvent::Changes(c) if c.len() == 1));
        assert_eq!(source.poll().unwrap(), SourceEvent::AdvanceTime(Timestamp(2)));
        assert_eq!(source.poll().unwrap(), SourceEvent::Finished);
        assert_eq!(source.offset(), 3);
    }

    #[test]
    fn test_static_source_holds_time_for_out_of_order_rows() {
        let mut source = StaticSource::new(schema())
            .insert(row!["a", 1i64], Timestamp(5))
            .unwrap()
            .insert(row!["b", 2i64], Timestamp(3))
            .unwrap();
        assert!(matches!(source.poll().unwrap(), SourceEvent::Changes(_)));
        // Time 3 is still to come, so time 5 cannot be promised yet
        assert!(matches!(source.poll().unwrap(), SourceEvent::Changes(_)));
        assert_eq!(source.poll().unwrap(), SourceEvent::AdvanceTime(Timestamp(3)));
        assert_eq!(source.poll().unwrap(), SourceEvent::Finished);
    }

    #[test]
    fn test_static_source_seek() {
        let mut source = StaticSource::new(schema())
            .insert(row!["a", 1i64], Timestamp(1))
            .unwrap()
            .insert(row!["a", 1i64], Timestamp(2))
            .unwrap();
        source.seek(1).unwrap();
        match source.poll().unwrap() {
            SourceEvent::Changes(changes) => assert_eq!(changes[0].time, Timestamp(2)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(source.seek(5).is_err());
    }

    #[test]
    fn test_delete_uses_primary_key() {
        let source = StaticSource::new(schema())
            .insert(row!["a", 1i64], Timestamp(1))
            .unwrap()
            .delete(row!["a", 1i64], Timestamp(2))
            .unwrap();
        assert_eq!(source.changes[0].key, source.changes[1].key);
        assert_eq!(source.changes[1].diff, -1);

        let keyless = SchemaBuilder::new("log")
            .column("line", DataType::String)
            .build()
            .unwrap();
        assert!(StaticSource::new(keyless)
            .delete(row!["x"], Timestamp(1))
            .is_err());
    }

    #[test]
    fn test_collecting_sink_snapshot() {
        let mut sink = CollectingSink::new();
        let handle = sink.clone();
        let key = eddy_core::Key::for_values(&["a".into()]);
        sink.on_batch(Timestamp(1), &[Change::insert(key, row!["a", 1i64], Timestamp(1))])
            .unwrap();
        sink.on_batch(
            Timestamp(2),
            &[
                Change::delete(key, row!["a", 1i64], Timestamp(2)),
                Change::insert(key, row!["a", 4i64], Timestamp(2)),
            ],
        )
        .unwrap();
        sink.on_end().unwrap();

        let collected = handle.collected();
        assert!(collected.finished);
        assert_eq!(collected.batches.len(), 2);
        assert_eq!(collected.snapshot().get(&key), Some(&row!["a", 4i64]));
    }
}
