use std::io::Write;
use std::sync::Arc;

use clobetl_core::{new_id, Status};
use clobetl_storage::{AlbumErrorSink, MemoryStore, PayloadLoader};
use clobetl_sync::{
    load_core_step, load_stage_step, read_payload_file, run_job, Collaborators, SyncConfig,
};

fn config(chunk_size: usize) -> SyncConfig {
    SyncConfig {
        chunk_size,
        ..SyncConfig::default()
    }
}

fn memory() -> (Arc<MemoryStore>, Collaborators) {
    let store = Arc::new(MemoryStore::new());
    let stores = Collaborators::from_store(store.clone());
    (store, stores)
}

#[tokio::test]
async fn new_album_is_inserted_then_updated_by_a_later_batch() {
    let (store, stores) = memory();

    let first = run_job(
        &stores,
        r#"{"gtin-14":"12345678901234","albumName":"A","artist":"B","songs":[{"songName":"s1"}]}"#,
        &config(10),
    )
    .await
    .expect("first job");
    assert_eq!(first.stage.albums_saved, 1);
    assert_eq!(first.stage.songs_saved, 1);
    assert_eq!(first.core.totals.inserted, 1);
    assert_eq!(first.core.totals.updated, 0);

    let core = store.core_albums().await;
    assert_eq!(core.len(), 1);
    let album_id = core[0].album_id;
    assert_eq!(core[0].album_name.as_deref(), Some("A"));
    assert_eq!(core[0].artist_name.as_deref(), Some("B"));

    let second = run_job(
        &stores,
        r#"{"gtin-14":"12345678901234","albumName":"A2","artist":"B"}"#,
        &config(10),
    )
    .await
    .expect("second job");
    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(second.core.totals.inserted, 0);
    assert_eq!(second.core.totals.updated, 1);

    let core = store.core_albums().await;
    assert_eq!(core.len(), 1);
    assert_eq!(core[0].album_id, album_id);
    assert_eq!(core[0].album_name.as_deref(), Some("A2"));

    let statuses: Vec<_> = store
        .staged_albums()
        .await
        .expect("staged")
        .iter()
        .map(|a| a.status())
        .collect();
    assert_eq!(statuses, vec![Status::Complete, Status::Complete]);
}

#[tokio::test]
async fn mixed_payload_routes_every_record_once() {
    let (store, stores) = memory();
    let payload = r#"[
        {"gtin-14":"00000000000001","albumName":"One","artist":"X","songs":[{"songName":"a"},{"songName":"b"}]},
        {"gtin-14":"00000000000001","albumName":"One (Deluxe)","artist":"X"},
        {"gtin-14":"short","albumName":"Bad","artist":"Y"},
        {"albumName":"No Key"}
    ]
    {"gtin-14":"00000000000002","albumName":"Two","artist":"Z","label":"ignored"}"#;

    let summary = run_job(&stores, payload, &config(2)).await.expect("job");

    assert_eq!(summary.stage.albums_read, 5);
    assert_eq!(summary.stage.albums_saved, 5);
    assert_eq!(summary.stage.songs_saved, 2);
    assert_eq!(summary.core.processed, 5);
    assert_eq!(summary.core.chunks, 3);
    assert_eq!(summary.core.totals.inserted, 2);
    assert_eq!(summary.core.totals.updated, 1);
    assert_eq!(summary.core.totals.errors, 2);
    assert_eq!(summary.core.totals.statuses, 5);
    assert_eq!(summary.payload_sha256.len(), 64);

    let mut names: Vec<_> = store
        .core_albums()
        .await
        .into_iter()
        .filter_map(|a| a.album_name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["One (Deluxe)", "Two"]);

    let staged = store.staged_albums().await.expect("staged");
    let statuses: Vec<_> = staged.iter().map(|a| a.status()).collect();
    assert_eq!(
        statuses,
        vec![
            Status::Complete,
            Status::Complete,
            Status::Error,
            Status::Error,
            Status::Complete,
        ]
    );

    let errors = store.album_errors().await;
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].album_id, staged[2].album_id());
    assert_eq!(errors[0].error_text, "{GTIN-14 must be 14 characters long.}");
    assert_eq!(
        errors[1].error_text,
        "{GTIN-14 name is required.,Artist name is required.}"
    );
    let found = store
        .find_error(errors[1].error_id)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(found.batch_id, summary.batch_id);
    assert!(found.created_at.is_some());
}

#[tokio::test]
async fn duplicate_key_split_across_chunks_updates_the_first_insert() {
    let (store, stores) = memory();
    let payload = r#"[
        {"gtin-14":"00000000000003","albumName":"First","artist":"X"},
        {"gtin-14":"00000000000003","albumName":"Second","artist":"X"}
    ]"#;

    let summary = run_job(&stores, payload, &config(1)).await.expect("job");
    assert_eq!(summary.core.chunks, 2);
    assert_eq!(summary.core.totals.inserted, 1);
    assert_eq!(summary.core.totals.updated, 1);

    let core = store.core_albums().await;
    assert_eq!(core.len(), 1);
    assert_eq!(core[0].album_name.as_deref(), Some("Second"));
}

#[tokio::test]
async fn rerunning_the_core_step_is_a_no_op() {
    let (store, stores) = memory();
    let batch_id = new_id();
    stores
        .loader
        .load_payload(batch_id, r#"{"gtin-14":"00000000000004","albumName":"A","artist":"B"}"#)
        .await
        .expect("load");

    load_stage_step(&stores, batch_id, &config(10)).await.expect("stage");
    let first = load_core_step(&stores, batch_id, &config(10)).await.expect("core");
    let second = load_core_step(&stores, batch_id, &config(10)).await.expect("core again");

    assert_eq!(first.processed, 1);
    assert_eq!(second.processed, 0);
    assert_eq!(second.chunks, 0);
    assert_eq!(store.core_albums().await.len(), 1);
}

#[tokio::test]
async fn unknown_persisted_status_aborts_the_core_step() {
    let (store, stores) = memory();
    let batch_id = new_id();
    store
        .load_payload(batch_id, r#"{"gtin-14":"00000000000005","albumName":"A","artist":"B"}"#)
        .await
        .expect("load");
    load_stage_step(&stores, batch_id, &config(10)).await.expect("stage");

    let staged = store.staged_albums().await.expect("staged");
    store.force_status_code(staged[0].album_id(), "LOST").await;

    let err = load_core_step(&stores, batch_id, &config(10)).await.unwrap_err();
    assert!(format!("{err:#}").contains("'LOST' is not a valid status."));
    assert!(store.core_albums().await.is_empty());
}

#[tokio::test]
async fn malformed_payload_fails_the_stage_step() {
    let (store, stores) = memory();
    let batch_id = new_id();
    store
        .load_payload(batch_id, r#"{"gtin-14":"00000000000006","albumName":"A"} {"gtin-14":"#)
        .await
        .expect("load");

    let err = load_stage_step(&stores, batch_id, &config(10)).await.unwrap_err();
    assert!(format!("{err:#}").contains("loading staged albums"));
}

#[tokio::test]
async fn payload_file_is_read_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        "{}",
        serde_json::json!({"gtin-14": "00000000000007", "albumName": "Disk", "artist": "D"})
    )
    .expect("write");

    let payload = read_payload_file(file.path()).await.expect("read");
    let (store, stores) = memory();
    let summary = run_job(&stores, &payload, &config(10)).await.expect("job");

    assert_eq!(summary.core.totals.inserted, 1);
    assert_eq!(store.core_albums().await[0].album_name.as_deref(), Some("Disk"));
}

#[tokio::test]
async fn missing_payload_file_is_reported_with_its_path() {
    let err = read_payload_file("/definitely/not/here.json").await.unwrap_err();
    assert!(format!("{err:#}").contains("/definitely/not/here.json"));
}
