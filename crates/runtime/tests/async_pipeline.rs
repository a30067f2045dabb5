//! Dataflows fed by async transforms: results and failures arrive as input
//! tables at times later than the rows they came from, and survive restarts.

use eddy_core::schema::{Schema, SchemaBuilder};
use eddy_core::{row, DataType, Key, Row, Timestamp, Value};
use eddy_incremental::Dataflow;
use eddy_runtime::{
    AsyncSource, AsyncTransformer, CollectingSink, Config, PersistenceConfig, Runtime, Source,
    StaticSource,
};
use std::path::Path;
use std::time::Duration;

fn requests() -> Schema {
    SchemaBuilder::new("requests")
        .column("id", DataType::Int)
        .column("value", DataType::Int)
        .primary_key(&["id"])
        .unwrap()
        .build()
        .unwrap()
}

fn scores() -> Schema {
    SchemaBuilder::new("scores")
        .column("id", DataType::Int)
        .column("doubled", DataType::Int)
        .build()
        .unwrap()
}

fn scores_failed() -> Schema {
    SchemaBuilder::new("scores_failed")
        .column("id", DataType::Int)
        .column("value", DataType::Int)
        .column("error", DataType::String)
        .build()
        .unwrap()
}

fn key(id: i64) -> Key {
    Key::for_values(&[id.into()])
}

/// Doubles column 1; fails on negative values and stalls on 7.
async fn score(row: Row) -> Result<Row, String> {
    let id = row.get(0).and_then(Value::as_int).unwrap_or_default();
    match row.get(1).and_then(Value::as_int) {
        Some(7) => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(row![id, 14i64])
        }
        Some(v) if v >= 0 => Ok(row![id, v * 2]),
        Some(v) => Err(format!("negative input {v}")),
        None => Err("not an integer".to_string()),
    }
}

fn dataflow() -> Dataflow {
    let mut df = Dataflow::new();
    let scores = df.input_schema(&scores()).unwrap();
    let failed = df.input_schema(&scores_failed()).unwrap();
    df.output("scores", scores).unwrap();
    df.output("failures", failed).unwrap();
    df
}

fn tokio_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .unwrap()
}

fn pipeline(config: Config, upstream: StaticSource) -> (Runtime, CollectingSink, CollectingSink) {
    let mut runtime = Runtime::new(dataflow(), config).unwrap();
    let transformer = AsyncTransformer::new(score, runtime.async_options()).unwrap();
    let source = AsyncSource::new(upstream, transformer, scores());
    let failed = source.failures().unwrap();
    assert_eq!(failed.name(), "scores_failed");
    runtime.add_source("scores", source).unwrap();
    runtime.add_source("scores_failed", failed).unwrap();

    let (results, failures) = (CollectingSink::new(), CollectingSink::new());
    runtime.add_sink("scores", results.clone()).unwrap();
    runtime.add_sink("failures", failures.clone()).unwrap();
    (runtime, results, failures)
}

fn persistent(dir: &Path) -> Config {
    Config {
        persistence: Some(PersistenceConfig::new(dir)),
        ..Config::default()
    }
}

#[test]
fn results_and_failures_feed_inputs() {
    let rt = tokio_runtime();
    let _guard = rt.enter();

    let mut config = Config::default();
    config.async_defaults.timeout = Some(Duration::from_millis(100));
    let upstream = StaticSource::new(requests())
        .insert(row![1i64, 5i64], Timestamp(1))
        .unwrap()
        .insert(row![2i64, -1i64], Timestamp(1))
        .unwrap()
        .insert(row![3i64, 10i64], Timestamp(2))
        .unwrap()
        .insert(row![4i64, 7i64], Timestamp(2))
        .unwrap()
        .delete(row![1i64, 5i64], Timestamp(3))
        .unwrap();
    let (mut runtime, results, failures) = pipeline(config, upstream);
    runtime.run().unwrap();

    let results = results.collected();
    assert!(results.finished);
    assert_eq!(
        results.snapshot().into_iter().collect::<Vec<_>>(),
        vec![(key(3), row![3i64, 20i64])]
    );
    assert!(results.changes().all(|c| c.time > Timestamp(1)));

    let failures = failures.collected();
    let failed = failures.snapshot();
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[&key(2)], row![2i64, -1i64, "negative input -1"]);
    assert_eq!(failed[&key(4)], row![4i64, 7i64, "timed out after 100ms"]);
    assert!(failures.changes().all(|c| c.time > Timestamp(1)));
    assert!(runtime.error_log().is_empty());
}

#[test]
fn restart_retracts_results_emitted_before() {
    let rt = tokio_runtime();
    let _guard = rt.enter();
    let dir = tempfile::tempdir().unwrap();

    let first = StaticSource::from_rows(
        requests(),
        vec![(row![1i64, 5i64], Timestamp(1)), (row![2i64, -1i64], Timestamp(1))],
    )
    .unwrap();
    let (mut runtime, _, _) = pipeline(persistent(dir.path()), first);
    runtime.run().unwrap();
    assert_eq!(runtime.output_snapshot("scores").unwrap().len(), 1);
    assert_eq!(runtime.output_snapshot("failures").unwrap().len(), 1);
    drop(runtime);

    // The same input, extended with retractions of both rows
    let second = StaticSource::from_rows(
        requests(),
        vec![(row![1i64, 5i64], Timestamp(1)), (row![2i64, -1i64], Timestamp(1))],
    )
    .unwrap()
    .delete(row![1i64, 5i64], Timestamp(3))
    .unwrap()
    .delete(row![2i64, -1i64], Timestamp(3))
    .unwrap();
    let (mut runtime, results, failures) = pipeline(persistent(dir.path()), second);
    let stats = runtime.run().unwrap();
    assert!(stats.replayed > 0);

    assert!(runtime.output_snapshot("scores").unwrap().is_empty());
    assert!(runtime.output_snapshot("failures").unwrap().is_empty());
    let results = results.collected();
    let retracted: Vec<_> = results.changes().filter(|c| c.diff < 0).collect();
    assert_eq!(retracted.len(), 1);
    assert_eq!(retracted[0].row, row![1i64, 10i64]);
    assert!(results.changes().all(|c| c.diff < 0));
    assert_eq!(failures.collected().changes().filter(|c| c.diff < 0).count(), 1);
}
