//! Restart tests: a runtime resumed on a checkpoint directory must rebuild
//! operator state from the batch log, skip outputs it already delivered and
//! continue reading its sources.

use eddy_core::schema::{Schema, SchemaBuilder};
use eddy_core::{row, DataType, Key, Timestamp};
use eddy_incremental::operators::Reducer;
use eddy_incremental::Dataflow;
use eddy_runtime::{CollectingSink, Config, PersistenceConfig, Runtime, StaticSource};
use std::path::Path;

fn schema() -> Schema {
    SchemaBuilder::new("payments")
        .column("id", DataType::Int)
        .column("account", DataType::String)
        .column("amount", DataType::Int)
        .primary_key(&["id"])
        .unwrap()
        .build()
        .unwrap()
}

fn balances() -> Dataflow {
    let mut df = Dataflow::new();
    let payments = df.input_schema(&schema()).unwrap();
    let balances = df
        .groupby_reduce(payments, &[1], vec![Reducer::IntSum.on(&[2])])
        .unwrap();
    df.output("balances", balances).unwrap();
    df
}

fn source() -> StaticSource {
    StaticSource::from_rows(
        schema(),
        vec![
            (row![1i64, "acme", 100i64], Timestamp(1)),
            (row![2i64, "acme", -30i64], Timestamp(2)),
            (row![3i64, "acme", 5i64], Timestamp(3)),
        ],
    )
    .unwrap()
}

fn runtime(dir: &Path, interval: usize, sink: &CollectingSink) -> Runtime {
    let config = Config {
        persistence: Some(PersistenceConfig::new(dir).with_snapshot_interval(interval)),
        ..Config::default()
    };
    let mut runtime = Runtime::new(balances(), config).unwrap();
    runtime.add_source("payments", source()).unwrap();
    runtime.add_sink("balances", sink.clone()).unwrap();
    runtime
}

/// Runs rounds until `time` has been executed.
fn run_until(runtime: &mut Runtime, time: Timestamp) {
    while runtime.last_closed().map_or(true, |t| t < time) {
        runtime.step().unwrap();
    }
}

fn acme() -> Key {
    Key::for_values(&["acme".into()])
}

#[test]
fn restart_after_checkpoint_skips_delivered_output() {
    let dir = tempfile::tempdir().unwrap();

    let first = CollectingSink::new();
    let mut crashed = runtime(dir.path(), 1, &first);
    run_until(&mut crashed, Timestamp(2));
    drop(crashed);
    assert_eq!(first.collected().batches.len(), 2);

    let second = CollectingSink::new();
    let mut resumed = runtime(dir.path(), 1, &second);
    let stats = resumed.run().unwrap();
    assert_eq!(stats.replayed, 2);
    assert_eq!(stats.skipped, 0);

    // Only the batch after the checkpoint is delivered, and it retracts the
    // balance computed before the restart
    let collected = second.collected();
    assert_eq!(collected.batches.len(), 1);
    let (time, changes) = &collected.batches[0];
    assert_eq!(*time, Timestamp(3));
    assert_eq!(changes[0].row, row!["acme", 70i64]);
    assert_eq!(changes[0].diff, -1);
    assert_eq!(changes[1].row, row!["acme", 75i64]);

    let balances = resumed.output_snapshot("balances").unwrap();
    assert_eq!(balances.get(&acme()), Some(&row!["acme", 75i64]));
}

#[test]
fn restart_without_metadata_delivers_again() {
    let dir = tempfile::tempdir().unwrap();

    let first = CollectingSink::new();
    let mut crashed = runtime(dir.path(), 100, &first);
    run_until(&mut crashed, Timestamp(2));
    drop(crashed);

    let second = CollectingSink::new();
    let mut resumed = runtime(dir.path(), 100, &second);
    let stats = resumed.run().unwrap();

    // The source starts over; changes already in the batch log are skipped
    assert_eq!(stats.replayed, 2);
    assert_eq!(stats.skipped, 2);
    let times: Vec<Timestamp> = second.collected().batches.iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![Timestamp(1), Timestamp(2), Timestamp(3)]);
    assert_eq!(
        second.collected().snapshot().get(&acme()),
        Some(&row!["acme", 75i64])
    );
}

#[test]
fn finished_run_restarts_idle() {
    let dir = tempfile::tempdir().unwrap();

    let first = CollectingSink::new();
    runtime(dir.path(), 2, &first).run().unwrap();
    assert!(first.collected().finished);

    let second = CollectingSink::new();
    let mut resumed = runtime(dir.path(), 2, &second);
    let stats = resumed.run().unwrap();
    assert_eq!(stats.replayed, 3);
    assert!(second.collected().batches.is_empty());
    assert!(second.collected().finished);
    assert_eq!(
        resumed.output_snapshot("balances").unwrap().get(&acme()),
        Some(&row!["acme", 75i64])
    );
}
