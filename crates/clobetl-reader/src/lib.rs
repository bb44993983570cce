//! Streaming CLOB/JSON record reader and staging initializer.

use std::marker::PhantomData;
use std::sync::Arc;

use clobetl_core::{new_id, AlbumPayload, StagedAlbum, Status};
use clobetl_storage::{BindValue, Clob, ClobCursor, ClobSource, StoreError};
use serde::de::{DeserializeOwned, Error as _};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clobetl-reader";

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Unable to extract data from CLOB: {0}")]
    Store(#[from] StoreError),
    #[error("Unable to decode JSON in CLOB row {row}: {source}")]
    Decode {
        row: u64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPhase {
    NotStarted,
    RowActive,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nesting {
    TopLevel,
    /// Inside a top-level array; `first` until an element has been read.
    InArray { first: bool },
}

/// Decodes the values of one CLOB one item at a time. Top-level arrays are
/// walked element by element, so each element is yielded before the rest of
/// the array is parsed.
struct RowDecoder<T> {
    clob: Clob,
    offset: usize,
    nesting: Nesting,
    row: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RowDecoder<T> {
    fn new(clob: Clob, row: u64) -> Self {
        Self {
            clob,
            offset: 0,
            nesting: Nesting::TopLevel,
            row,
            _marker: PhantomData,
        }
    }

    fn next_item(&mut self) -> Result<Option<T>, serde_json::Error> {
        loop {
            self.skip_whitespace();
            let next = self.rest().bytes().next();
            match (self.nesting, next) {
                (Nesting::TopLevel, None) => return Ok(None),
                (Nesting::TopLevel, Some(b'[')) => {
                    self.offset += 1;
                    self.nesting = Nesting::InArray { first: true };
                }
                (Nesting::TopLevel, Some(_)) => return self.decode_one().map(Some),
                (Nesting::InArray { .. }, None) => {
                    return Err(serde_json::Error::custom("EOF while parsing a list"))
                }
                (Nesting::InArray { .. }, Some(b']')) => {
                    self.offset += 1;
                    self.nesting = Nesting::TopLevel;
                }
                (Nesting::InArray { first: true }, Some(_)) => {
                    self.nesting = Nesting::InArray { first: false };
                    return self.decode_one().map(Some);
                }
                (Nesting::InArray { first: false }, Some(b',')) => {
                    self.offset += 1;
                    return self.decode_one().map(Some);
                }
                (Nesting::InArray { first: false }, Some(_)) => {
                    return Err(serde_json::Error::custom("expected `,` or `]` in list"))
                }
            }
        }
    }

    fn rest(&self) -> &str {
        &self.clob.as_str()[self.offset..]
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.clob.as_str()[self.offset..];
        self.offset += rest.len() - rest.trim_start_matches([' ', '\t', '\n', '\r']).len();
    }

    fn decode_one(&mut self) -> Result<T, serde_json::Error> {
        let rest = &self.clob.as_str()[self.offset..];
        let mut values = serde_json::Deserializer::from_str(rest).into_iter::<T>();
        match values.next() {
            Some(Ok(item)) => {
                self.offset += values.byte_offset();
                Ok(item)
            }
            Some(Err(err)) => Err(err),
            None => Err(serde_json::Error::custom("EOF while parsing a value")),
        }
    }
}

/// Forward-only reader over a cursor of CLOB rows holding JSON.
///
/// `open` runs the query and positions on the first row; `read` yields one
/// decoded item at a time and returns `Ok(None)` before `open` and after the
/// cursor is exhausted. Each row's CLOB is dropped before the cursor advances.
/// `close` releases everything and never fails.
pub struct ClobRecordReader<T> {
    source: Arc<dyn ClobSource>,
    sql: String,
    binds: Vec<BindValue>,
    phase: ReaderPhase,
    cursor: Option<Box<dyn ClobCursor>>,
    decoder: Option<RowDecoder<T>>,
    rows_fetched: u64,
    items_read: u64,
}

impl<T: DeserializeOwned + Send> ClobRecordReader<T> {
    pub fn new(source: Arc<dyn ClobSource>, sql: impl Into<String>) -> Self {
        Self {
            source,
            sql: sql.into(),
            binds: Vec::new(),
            phase: ReaderPhase::NotStarted,
            cursor: None,
            decoder: None,
            rows_fetched: 0,
            items_read: 0,
        }
    }

    pub fn with_binds(mut self, binds: Vec<BindValue>) -> Self {
        self.binds = binds;
        self
    }

    pub fn phase(&self) -> ReaderPhase {
        self.phase
    }

    /// Cursor rows fetched since the last `open`.
    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    /// Items handed out since the last `open`.
    pub fn items_read(&self) -> u64 {
        self.items_read
    }

    pub async fn open(&mut self) -> Result<(), ReaderError> {
        if self.cursor.is_some() {
            self.release().await;
        }
        self.rows_fetched = 0;
        self.items_read = 0;

        let cursor = self.source.open_cursor(&self.sql, &self.binds).await?;
        self.cursor = Some(cursor);
        self.phase = ReaderPhase::RowActive;
        self.advance().await
    }

    pub async fn read(&mut self) -> Result<Option<T>, ReaderError> {
        loop {
            if self.phase != ReaderPhase::RowActive {
                return Ok(None);
            }

            if let Some(decoder) = self.decoder.as_mut() {
                match decoder.next_item() {
                    Ok(Some(item)) => {
                        self.items_read += 1;
                        return Ok(Some(item));
                    }
                    Ok(None) => {}
                    Err(source) => {
                        return Err(ReaderError::Decode {
                            row: decoder.row,
                            source,
                        })
                    }
                }
            }

            self.advance().await?;
        }
    }

    pub async fn close(&mut self) {
        info!("{} rows read.", format_count(self.items_read));
        self.release().await;
        self.phase = ReaderPhase::NotStarted;
    }

    async fn advance(&mut self) -> Result<(), ReaderError> {
        debug!("Reading next record.");
        self.decoder = None;

        let Some(cursor) = self.cursor.as_mut() else {
            self.phase = ReaderPhase::Exhausted;
            return Ok(());
        };

        match cursor.next_clob().await? {
            Some(clob) => {
                self.rows_fetched += 1;
                debug!(row = self.rows_fetched, bytes = clob.len(), "Next record available.");
                self.decoder = Some(RowDecoder::new(clob, self.rows_fetched));
            }
            None => {
                debug!("At end of results.");
                self.phase = ReaderPhase::Exhausted;
            }
        }
        Ok(())
    }

    async fn release(&mut self) {
        self.decoder = None;
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(err) = cursor.close().await {
                warn!(error = %err, "failed to close clob cursor");
            }
        }
    }
}

/// Formats a count with thousands separators, e.g. `12,345`.
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Counts processed items and logs the running total at fixed milestones.
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    label: &'static str,
    log_every: u64,
    count: u64,
}

impl ProgressLogger {
    pub fn new(label: &'static str, log_every: u64) -> Self {
        Self {
            label,
            log_every: log_every.max(1),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn increment(&mut self) {
        self.increment_by(1);
    }

    pub fn increment_by(&mut self, n: u64) {
        let before = self.count;
        self.count += n;
        if self.count / self.log_every > before / self.log_every {
            self.log();
        }
    }

    pub fn log(&self) {
        info!(step = self.label, "{} rows processed.", format_count(self.count));
    }
}

/// Gives freshly read albums their staging identity.
#[derive(Debug, Clone)]
pub struct RecordInitializer {
    batch_id: Uuid,
    progress: ProgressLogger,
}

impl RecordInitializer {
    pub fn new(batch_id: Uuid, log_every: u64) -> Self {
        Self {
            batch_id,
            progress: ProgressLogger::new("load-stage", log_every),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn processed(&self) -> u64 {
        self.progress.count()
    }

    pub fn begin(&mut self) {
        self.progress.reset();
    }

    pub fn end(&self) {
        self.progress.log();
    }

    pub fn initialize(&mut self, payload: AlbumPayload) -> StagedAlbum {
        self.progress.increment();

        let album_id = new_id();
        payload
            .songs
            .into_iter()
            .fold(
                StagedAlbum::builder(album_id, self.batch_id)
                    .status(Status::Pending)
                    .gtin_14(payload.gtin_14)
                    .album_name(payload.album_name)
                    .artist(payload.artist),
                |builder, song| builder.song(new_id(), song.song_name),
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use clobetl_core::SongPayload;
    use clobetl_storage::{MemoryClobCursor, MemoryStore, PayloadLoader, BATCH_PAYLOAD_SQL};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct JsonTestItem {
        id: u32,
        values: Vec<u32>,
    }

    async fn store_with(rows: &[&str]) -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let batch = new_id();
        for row in rows {
            store.load_payload(batch, row).await.expect("load");
        }
        (store, batch)
    }

    fn reader_for(store: Arc<MemoryStore>, batch: Uuid) -> ClobRecordReader<JsonTestItem> {
        ClobRecordReader::new(store, BATCH_PAYLOAD_SQL).with_binds(vec![BindValue::Uuid(batch)])
    }

    #[tokio::test]
    async fn reads_every_array_element_in_document_order() {
        let (store, batch) = store_with(&[
            r#"{"id":0,"values":[]}"#,
            r#"[{"id":1,"values":[1]},{"id":2,"values":[1,2]}]"#,
            r#"[{"id":3,"values":[1,2,3]}]"#,
        ])
        .await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");

        let mut seen = Vec::new();
        while let Some(item) = reader.read().await.expect("read") {
            assert_eq!(item.values.len() as u32, item.id);
            seen.push(item.id);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(reader.items_read(), 4);
        assert_eq!(reader.rows_fetched(), 3);
        reader.close().await;
    }

    #[tokio::test]
    async fn bind_parameters_limit_rows_to_one_batch() {
        let (store, batch) = store_with(&[r#"[{"id":7,"values":[]}]"#]).await;
        store
            .load_payload(new_id(), r#"[{"id":99,"values":[]}]"#)
            .await
            .expect("other batch");

        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");
        let first = reader.read().await.expect("read").expect("item");
        assert_eq!(first.id, 7);
        assert!(reader.read().await.expect("end").is_none());
        reader.close().await;
    }

    #[tokio::test]
    async fn read_before_open_returns_no_data() {
        let (store, batch) = store_with(&[r#"{"id":0,"values":[]}"#]).await;
        let mut reader = reader_for(store, batch);
        assert_eq!(reader.phase(), ReaderPhase::NotStarted);
        assert!(reader.read().await.expect("no error").is_none());
    }

    #[tokio::test]
    async fn reads_after_exhaustion_keep_returning_no_data() {
        let (store, batch) = store_with(&[]).await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");
        assert_eq!(reader.phase(), ReaderPhase::Exhausted);
        for _ in 0..3 {
            assert!(reader.read().await.expect("no error").is_none());
        }
        reader.close().await;
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let (store, batch) = store_with(&[r#"{"id":0,"values":[]}"#, r#"[{"id":1,"values":"#]).await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");
        assert_eq!(reader.read().await.expect("first row").map(|i| i.id), Some(0));

        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, ReaderError::Decode { row: 2, .. }));
        reader.close().await;
    }

    #[tokio::test]
    async fn array_elements_before_a_broken_one_are_still_yielded() {
        let (store, batch) =
            store_with(&[r#"[{"id":1,"values":[0]},{"id":2,"values":[0,0]},{"id":"#]).await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");

        assert_eq!(reader.read().await.expect("first").map(|i| i.id), Some(1));
        assert_eq!(reader.read().await.expect("second").map(|i| i.id), Some(2));
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, ReaderError::Decode { row: 1, .. }));
        assert_eq!(reader.items_read(), 2);
        reader.close().await;
    }

    #[tokio::test]
    async fn array_elements_must_be_comma_separated() {
        let (store, batch) =
            store_with(&[r#" [ {"id":1,"values":[]} {"id":2,"values":[]} ] "#]).await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");

        assert_eq!(reader.read().await.expect("first").map(|i| i.id), Some(1));
        assert!(matches!(
            reader.read().await.unwrap_err(),
            ReaderError::Decode { row: 1, .. }
        ));
        reader.close().await;
    }

    #[tokio::test]
    async fn empty_arrays_and_mixed_values_in_one_row() {
        let (store, batch) = store_with(&[
            "[]",
            "\n[ ]\n{\"id\":0,\"values\":[]}\n[{\"id\":1,\"values\":[5]}]\n",
        ])
        .await;
        let mut reader = reader_for(store, batch);
        reader.open().await.expect("open");

        let mut seen = Vec::new();
        while let Some(item) = reader.read().await.expect("read") {
            seen.push(item.id);
        }
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(reader.rows_fetched(), 2);
        reader.close().await;
    }

    #[tokio::test]
    async fn reader_can_be_reopened_for_a_new_step() {
        let (store, batch) = store_with(&[r#"[{"id":1,"values":[1]}]"#]).await;
        let mut reader = reader_for(store, batch);
        for _ in 0..2 {
            reader.open().await.expect("open");
            assert!(reader.read().await.expect("read").is_some());
            assert!(reader.read().await.expect("read").is_none());
            reader.close().await;
            assert!(reader.read().await.expect("closed").is_none());
        }
    }

    struct FailingSource {
        fail_on_row: bool,
        closed: Arc<AtomicBool>,
    }

    struct FailingCursor {
        inner: MemoryClobCursor,
        fail_on_row: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ClobCursor for FailingCursor {
        async fn next_clob(&mut self) -> Result<Option<Clob>, StoreError> {
            if self.fail_on_row {
                return Err(StoreError::CursorTask("connection reset".into()));
            }
            self.inner.next_clob().await
        }

        async fn close(&mut self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Err(StoreError::CursorTask("close failed".into()))
        }
    }

    #[async_trait::async_trait]
    impl ClobSource for FailingSource {
        async fn open_cursor(
            &self,
            _sql: &str,
            _binds: &[BindValue],
        ) -> Result<Box<dyn ClobCursor>, StoreError> {
            Ok(Box::new(FailingCursor {
                inner: MemoryClobCursor::new(vec![r#"{"id":1,"values":[0]}"#.to_string()]),
                fail_on_row: self.fail_on_row,
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn cursor_failures_surface_as_store_errors() {
        let closed = Arc::new(AtomicBool::new(false));
        let source = Arc::new(FailingSource {
            fail_on_row: true,
            closed: closed.clone(),
        });
        let mut reader: ClobRecordReader<JsonTestItem> = ClobRecordReader::new(source, "SELECT 1");
        let err = reader.open().await.unwrap_err();
        assert!(matches!(err, ReaderError::Store(_)));

        reader.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_failures_are_logged_not_returned() {
        let closed = Arc::new(AtomicBool::new(false));
        let source = Arc::new(FailingSource {
            fail_on_row: false,
            closed: closed.clone(),
        });
        let mut reader: ClobRecordReader<JsonTestItem> = ClobRecordReader::new(source, "SELECT 1");
        reader.open().await.expect("open");
        assert!(reader.read().await.expect("read").is_some());
        reader.close().await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(reader.phase(), ReaderPhase::NotStarted);
    }

    #[test]
    fn counts_are_formatted_with_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_logger_counts_across_milestones() {
        let mut progress = ProgressLogger::new("test", 2);
        progress.increment();
        progress.increment_by(3);
        assert_eq!(progress.count(), 4);
        progress.reset();
        assert_eq!(progress.count(), 0);
    }

    #[test]
    fn initializer_assigns_fresh_ids_and_pending_status() {
        let batch = new_id();
        let mut init = RecordInitializer::new(batch, 500);
        init.begin();
        let payload = AlbumPayload {
            gtin_14: Some("12345678901234".into()),
            album_name: Some("A".into()),
            artist: Some("B".into()),
            songs: vec![
                SongPayload { song_name: Some("one".into()) },
                SongPayload { song_name: Some("two".into()) },
            ],
        };

        let first = init.initialize(payload.clone());
        let second = init.initialize(payload);
        assert_eq!(init.processed(), 2);

        assert_ne!(first.album_id(), second.album_id());
        assert_eq!(first.batch_id(), batch);
        assert_eq!(first.status(), Status::Pending);
        assert_eq!(first.gtin_14(), Some("12345678901234"));
        assert_eq!(first.songs().len(), 2);
        assert!(first.songs().iter().all(|s| s.album_id == first.album_id()));
        assert_ne!(first.songs()[0].song_id, first.songs()[1].song_id);
        assert_eq!(first.songs()[1].song_name.as_deref(), Some("two"));
    }
}
