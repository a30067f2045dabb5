//! Checkpoint storage.
//!
//! A checkpoint directory holds two files:
//!
//! - `batches.jsonl`: every closed input batch, one JSON object per line,
//!   appended before the batch is executed
//! - `metadata.json`: last closed time, last delivered output time and the
//!   source offsets from which reading resumes, rewritten every few batches
//!
//! Recovery replays `batches.jsonl` into a fresh executor, which rebuilds
//! all operator state, then resumes the sources from the recorded offsets.

use crate::error::Result;
use eddy_core::Timestamp;
use eddy_incremental::Update;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const METADATA_FILE: &str = "metadata.json";
const BATCHES_FILE: &str = "batches.jsonl";

/// Progress recorded at a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub last_closed: Option<Timestamp>,
    /// Outputs up to this time were handed to sinks and subscribers
    pub last_delivered: Option<Timestamp>,
    /// Offsets per source name; everything before them is persisted
    pub offsets: BTreeMap<String, u64>,
    /// Number of batches persisted so far
    pub batches: u64,
}

/// One closed time across all inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub time: Timestamp,
    pub inputs: BTreeMap<String, Vec<Update>>,
}

/// File-backed checkpoint store.
pub struct CheckpointStore {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl CheckpointStore {
    /// Opens (creating if needed) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, writer: None })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the metadata, if a checkpoint was ever written.
    pub fn load_metadata(&self) -> Result<Option<CheckpointMetadata>> {
        let path = self.dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Replaces the metadata.
    ///
    /// The file is written beside the old one and renamed over it, so a
    /// crash leaves either the old or the new metadata.
    pub fn write_metadata(&mut self, metadata: &CheckpointMetadata) -> Result<()> {
        self.flush()?;
        let tmp = self.dir.join(format!("{METADATA_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, metadata)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(METADATA_FILE))?;
        debug!(
            dir = %self.dir.display(),
            batches = metadata.batches,
            last_delivered = ?metadata.last_delivered,
            "checkpoint metadata written"
        );
        Ok(())
    }

    /// Appends a closed batch to the log.
    pub fn append_batch(&mut self, batch: &PersistedBatch) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(BATCHES_FILE))?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, batch)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Reads every persisted batch in the order it was written.
    ///
    /// A torn last line, left by a crash during an append, is skipped.
    pub fn load_batches(&self) -> Result<Vec<PersistedBatch>> {
        let path = self.dir.join(BATCHES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let lines: Vec<String> = BufReader::new(File::open(path)?)
            .lines()
            .collect::<std::io::Result<_>>()?;
        let mut batches = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(batch) => batches.push(batch),
                Err(err) if i == last => {
                    warn!(dir = %self.dir.display(), error = %err, "skipping torn batch record");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(batches)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::{row, Key};

    fn batch(time: u64, value: i64) -> PersistedBatch {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "events".to_string(),
            vec![Update::insert_row(Key::for_values(&[value.into()]), row![value, "x"])],
        );
        PersistedBatch {
            time: Timestamp(time),
            inputs,
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("state")).unwrap();
        assert!(store.load_metadata().unwrap().is_none());
        assert!(store.load_batches().unwrap().is_empty());
    }

    #[test]
    fn test_batches_and_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path()).unwrap();
        store.append_batch(&batch(1, 10)).unwrap();
        store.append_batch(&batch(2, 20)).unwrap();
        let mut metadata = CheckpointMetadata {
            last_closed: Some(Timestamp(2)),
            last_delivered: Some(Timestamp(2)),
            batches: 2,
            ..Default::default()
        };
        metadata.offsets.insert("events".into(), 2);
        store.write_metadata(&metadata).unwrap();
        drop(store);

        let store = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.load_metadata().unwrap(), Some(metadata));
        assert_eq!(store.load_batches().unwrap(), vec![batch(1, 10), batch(2, 20)]);
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path()).unwrap();
        store.append_batch(&batch(1, 10)).unwrap();
        drop(store);

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(BATCHES_FILE))
            .unwrap();
        file.write_all(b"{\"time\":2,\"inp").unwrap();

        let store = CheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.load_batches().unwrap(), vec![batch(1, 10)]);
    }
}
