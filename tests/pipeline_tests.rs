use citefold::config::LoaderConfig;
use citefold::ingestion::{OutcomeCount, Phase, Pipeline};
use citefold::store::{DocumentStore, SharedStore, SledStore};
use citefold::testing::{dataset_document, dataset_intent, envelope_line, write_dump_file, FaultyStore};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn create_temp_store() -> Arc<SledStore> {
    Arc::new(SledStore::temporary().unwrap())
}

fn small_config(dir: &Path) -> LoaderConfig {
    LoaderConfig::new(dir)
        .with_parallel_files(4)
        .with_parallel_datasets(8)
        .with_batch_size(5)
        .with_workers(2)
}

fn stored_updated(document: &Value) -> &str {
    document
        .pointer("/attributes/updated")
        .and_then(Value::as_str)
        .unwrap()
}

/// Write `files` dump files of `per_file` single-record lines each
fn write_numbered_files(dir: &Path, files: usize, per_file: usize, updated: &str) {
    for f in 0..files {
        let lines: Vec<String> = (0..per_file)
            .map(|r| dataset_document(&format!("10.{}/{}", f, r), updated).to_string())
            .collect();
        write_dump_file(dir, &format!("part-{:03}.ndjson", f), &lines).unwrap();
    }
}

#[tokio::test]
async fn test_newer_line_wins_within_one_file() {
    let dir = tempfile::tempdir().unwrap();
    write_dump_file(
        dir.path(),
        "dump.ndjson",
        &[
            r#"{"data":[{"id":"10.1/a","attributes":{"updated":"2020-01-01"}}]}"#.to_string(),
            r#"{"data":[{"id":"10.1/a","attributes":{"updated":"2021-01-01"}}]}"#.to_string(),
        ],
    )
    .unwrap();

    let store = create_temp_store();
    let pipeline = Pipeline::new(small_config(dir.path()), store.clone()).unwrap();
    let summary = pipeline.run().await.unwrap();

    let stored = store.get_document("10.1/a").await.unwrap().unwrap();
    assert_eq!(stored_updated(&stored), "2021-01-01");
    assert_eq!(summary.totals.read, 2);
    assert_eq!(summary.totals.upserted, 1);
    assert!(summary.totals.modified <= 1);
    assert_eq!(summary.documents_after, Some(1));
}

#[tokio::test]
async fn test_second_pass_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_numbered_files(dir.path(), 3, 20, "2022-03-04T05:06:07Z");
    let store = create_temp_store();

    let first = Pipeline::new(small_config(dir.path()), store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first.totals, OutcomeCount::new(60, 0, 60));
    let before = store.get_document("10.2/7").await.unwrap();

    let second = Pipeline::new(small_config(dir.path()), store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(second.totals, OutcomeCount::new(0, 0, 60));
    assert_eq!(second.documents_before, Some(60));
    assert_eq!(second.documents_after, Some(60));
    assert_eq!(store.get_document("10.2/7").await.unwrap(), before);
}

#[tokio::test]
async fn test_recency_precedence_regardless_of_file_order() {
    for (first, second) in [("2019-06-01", "2023-06-01"), ("2023-06-01", "2019-06-01")] {
        let dir = tempfile::tempdir().unwrap();
        write_dump_file(
            dir.path(),
            "a.ndjson",
            &[envelope_line(&[dataset_document("10.9/x", first)])],
        )
        .unwrap();
        write_dump_file(
            dir.path(),
            "b.ndjson",
            &[envelope_line(&[dataset_document("10.9/x", second)])],
        )
        .unwrap();

        let store = create_temp_store();
        let summary = Pipeline::new(small_config(dir.path()), store.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        let stored = store.get_document("10.9/x").await.unwrap().unwrap();
        assert_eq!(stored_updated(&stored), "2023-06-01");
        assert_eq!(summary.totals.read, 2);
    }
}

#[tokio::test]
async fn test_failed_writes_are_still_counted_as_read() {
    let dir = tempfile::tempdir().unwrap();
    write_numbered_files(dir.path(), 2, 13, "2020-01-01");

    let store = Arc::new(FaultyStore::temporary().unwrap());
    store.set_transport_failure(true);
    let shared: SharedStore = store.clone();
    let summary = Pipeline::new(small_config(dir.path()), shared)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.records_dispatched, 26);
    assert_eq!(summary.totals, OutcomeCount::new(0, 0, 26));
    assert_eq!(store.batch_sizes().iter().sum::<usize>(), 26);
    assert_eq!(store.count_documents().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limits() {
    let dir = tempfile::tempdir().unwrap();
    write_numbered_files(dir.path(), 10, 30, "2020-01-01");

    let store = Arc::new(FaultyStore::temporary().unwrap().with_delay(Duration::from_millis(2)));
    let config = LoaderConfig::new(dir.path())
        .with_parallel_files(2)
        .with_parallel_datasets(3)
        .with_batch_size(4)
        .with_queue_capacity(2)
        .with_workers(2);
    let pipeline = Pipeline::new(config, store.clone()).unwrap();
    let summary = pipeline.run().await.unwrap();

    assert!(pipeline.file_pool().high_water() <= 2);
    assert!(pipeline.dispatch_pool().high_water() <= 3);
    assert!(store.max_concurrent_writes() <= 2);
    assert!(store.batch_sizes().iter().all(|&size| size <= 4));
    assert_eq!(summary.totals, OutcomeCount::new(300, 0, 300));
    assert_eq!(store.count_documents().await.unwrap(), 300);
}

#[tokio::test]
async fn test_done_means_everything_was_written() {
    let dir = tempfile::tempdir().unwrap();
    write_numbered_files(dir.path(), 4, 37, "2020-01-01");

    let store = Arc::new(FaultyStore::temporary().unwrap().with_delay(Duration::from_millis(5)));
    let config = LoaderConfig::new(dir.path()).with_batch_size(16).with_workers(3);
    let pipeline = Pipeline::new(config, store.clone()).unwrap();
    let mut phases = pipeline.subscribe_phase();

    let observer = tokio::spawn(async move {
        let mut seen = vec![*phases.borrow_and_update()];
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            seen.push(phase);
            if phase == Phase::Done {
                break;
            }
        }
        seen
    });

    let summary = pipeline.run().await.unwrap();
    assert_eq!(pipeline.phase(), Phase::Done);
    assert_eq!(summary.totals.read, summary.records_dispatched);
    assert_eq!(summary.totals.read, 148);
    assert_eq!(store.batch_sizes().iter().sum::<usize>(), 148);
    assert_eq!(summary.workers.len(), 3);
    assert_eq!(
        summary.workers.iter().map(|w| w.intents_read).sum::<u64>(),
        148
    );
    assert_eq!(store.count_documents().await.unwrap(), 148);

    // Transitions may coalesce, but never go backwards.
    let seen = observer.await.unwrap();
    assert_eq!(seen.last(), Some(&Phase::Done));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", seen);
}

#[tokio::test]
async fn test_collision_in_a_batch_of_three() {
    let dir = tempfile::tempdir().unwrap();
    write_dump_file(
        dir.path(),
        "dump.ndjson",
        &[envelope_line(&[
            dataset_document("10.3/a", "2020-01-01"),
            dataset_document("10.3/b", "2020-01-01"),
            dataset_document("10.3/c", "2020-01-01"),
        ])],
    )
    .unwrap();

    let store = create_temp_store();
    store
        .bulk_upsert(vec![dataset_intent("10.3/b", "2024-01-01")])
        .await
        .unwrap();

    let config = LoaderConfig::new(dir.path()).with_batch_size(3).with_workers(1);
    let summary = Pipeline::new(config, store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.totals, OutcomeCount::new(2, 0, 3));
    // The stale record is a recency conflict, not a write error
    assert_eq!(summary.workers[0].duplicate_conflicts, 1);
    assert_eq!(summary.workers[0].failed_items, 0);
    let kept = store.get_document("10.3/b").await.unwrap().unwrap();
    assert_eq!(stored_updated(&kept), "2024-01-01");
    assert_eq!(store.count_documents().await.unwrap(), 3);
}

#[tokio::test]
async fn test_bad_lines_and_records_do_not_stop_the_file() {
    let dir = tempfile::tempdir().unwrap();
    write_dump_file(
        dir.path(),
        "mixed.ndjson",
        &[
            "not json at all".to_string(),
            r#"{"data":[{"id":"10.4/a","attributes":{"updated":"2020-01-01"}},{"id":42}]}"#
                .to_string(),
            r#"{"data":[{"id":"10.4/b"}]}"#.to_string(),
            dataset_document("10.4/c", "2020-01-01").to_string(),
        ],
    )
    .unwrap();

    let store = create_temp_store();
    let summary = Pipeline::new(small_config(dir.path()), store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.lines_read, 4);
    assert_eq!(summary.decode_errors, 1);
    assert_eq!(summary.records_rejected, 2);
    assert_eq!(summary.records_dispatched, 2);
    assert_eq!(summary.files_read, 1);
    assert_eq!(summary.totals, OutcomeCount::new(2, 0, 2));
}

#[tokio::test]
async fn test_missing_data_dir_fails_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(
        LoaderConfig::new(dir.path().join("absent")),
        create_temp_store(),
    )
    .unwrap();
    assert!(pipeline.run().await.is_err());
    assert_eq!(pipeline.phase(), Phase::Idle);
}
