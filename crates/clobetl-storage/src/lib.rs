//! Staging + canonical store contracts and their Postgres / in-memory backends.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clobetl_core::{AlbumError, CoreAlbum, StagedAlbum, StagedSong, Status, StatusCodeError};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clobetl-storage";

/// Selects every payload row of one batch, in load order.
pub const BATCH_PAYLOAD_SQL: &str = "SELECT payload FROM stage.batch WHERE batch_id = $1 ORDER BY row_no";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Status(#[from] StatusCodeError),
    #[error("expected at most one core album for GTIN-14 {gtin_14}, found {found}")]
    IncorrectResultSize { gtin_14: String, found: usize },
    #[error("duplicate GTIN-14 {0} in core.ct_album")]
    UniqueViolation(String),
    #[error("cursor task failed: {0}")]
    CursorTask(String),
    #[error("expected {expected} staged status updates, store applied {applied}")]
    StatusNotRecorded { expected: u64, applied: u64 },
}

/// One character-object value read from a cursor row. Dropping it frees the text.
pub struct Clob {
    text: String,
}

impl Clob {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Debug for Clob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clob").field("len", &self.text.len()).finish()
    }
}

/// Bind parameter for a cursor query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Text(String),
    Uuid(Uuid),
    Int(i64),
}

/// Forward-only cursor over rows holding a single CLOB column.
#[async_trait]
pub trait ClobCursor: Send {
    /// `Ok(None)` once the cursor is exhausted.
    async fn next_clob(&mut self) -> Result<Option<Clob>, StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ClobSource: Send + Sync {
    async fn open_cursor(
        &self,
        sql: &str,
        binds: &[BindValue],
    ) -> Result<Box<dyn ClobCursor>, StoreError>;
}

/// Canonical-store lookup by natural key. A miss is `Ok(None)`.
#[async_trait]
pub trait NaturalKeyLookup: Send + Sync {
    async fn find_by_gtin_14(&self, gtin_14: &str) -> Result<Option<CoreAlbum>, StoreError>;
}

#[async_trait]
pub trait StagedAlbumSource: Send + Sync {
    /// Up to `limit` pending albums of the batch, oldest first.
    async fn fetch_pending(&self, batch_id: Uuid, limit: usize)
        -> Result<Vec<StagedAlbum>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageWriteCount {
    pub albums: u64,
    pub songs: u64,
}

#[async_trait]
pub trait StageSink: Send + Sync {
    /// Inserts the albums and every song they carry.
    async fn insert_staged(&self, albums: &[StagedAlbum]) -> Result<StageWriteCount, StoreError>;
}

#[async_trait]
pub trait CoreAlbumSink: Send + Sync {
    async fn insert_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError>;
    async fn update_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait StageStatusSink: Send + Sync {
    async fn update_status(&self, albums: &[StagedAlbum]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AlbumErrorSink: Send + Sync {
    async fn insert_errors(&self, errors: &[AlbumError]) -> Result<u64, StoreError>;
    async fn find_error(&self, error_id: Uuid) -> Result<Option<AlbumError>, StoreError>;
}

/// Every write one chunk produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkWrite {
    pub inserts: Vec<CoreAlbum>,
    pub updates: Vec<CoreAlbum>,
    pub errors: Vec<AlbumError>,
    pub statuses: Vec<StagedAlbum>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkWriteCount {
    pub inserted: u64,
    pub updated: u64,
    pub errors: u64,
    pub statuses: u64,
}

/// Applies a chunk's writes all together or not at all. Inserts land before
/// updates, and every status in the chunk must match a staged row.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    async fn write_chunk(&self, chunk: &ChunkWrite) -> Result<ChunkWriteCount, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub batch_id: Uuid,
    pub content_hash: String,
    pub byte_size: usize,
}

#[async_trait]
pub trait PayloadLoader: Send + Sync {
    async fn load_payload(&self, batch_id: Uuid, payload: &str) -> Result<StoredPayload, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn stored_payload(batch_id: Uuid, payload: &str) -> StoredPayload {
    let stored = StoredPayload {
        batch_id,
        content_hash: sha256_hex(payload.as_bytes()),
        byte_size: payload.len(),
    };
    info!(
        %batch_id,
        content_hash = %stored.content_hash,
        bytes = stored.byte_size,
        "Loading staging with batch '{batch_id}'."
    );
    stored
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &BindValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        BindValue::Text(v) => query.bind(v.clone()),
        BindValue::Uuid(v) => query.bind(*v),
        BindValue::Int(v) => query.bind(*v),
    }
}

/// Rows are streamed by a background task through a one-slot channel, so at
/// most one undelivered CLOB is buffered at a time.
pub struct PgClobCursor {
    rows: mpsc::Receiver<Result<String, sqlx::Error>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ClobCursor for PgClobCursor {
    async fn next_clob(&mut self) -> Result<Option<Clob>, StoreError> {
        match self.rows.recv().await {
            Some(Ok(text)) => Ok(Some(Clob::new(text))),
            Some(Err(err)) => Err(err.into()),
            None => {
                if let Some(task) = self.task.take() {
                    task.await
                        .map_err(|err| StoreError::CursorTask(err.to_string()))?;
                }
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.rows.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for PgClobCursor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ClobSource for PgStore {
    async fn open_cursor(
        &self,
        sql: &str,
        binds: &[BindValue],
    ) -> Result<Box<dyn ClobCursor>, StoreError> {
        let (tx, rx) = mpsc::channel(1);
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let binds = binds.to_vec();

        let task = tokio::spawn(async move {
            let mut query = sqlx::query(&sql);
            for value in &binds {
                query = bind_value(query, value);
            }
            let mut rows = query.fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row.and_then(|r| r.try_get::<String, _>(0));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Box::new(PgClobCursor {
            rows: rx,
            task: Some(task),
        }))
    }
}

fn core_album_from_row(row: &PgRow) -> Result<CoreAlbum, sqlx::Error> {
    Ok(CoreAlbum {
        album_id: row.try_get("album_id")?,
        gtin_14: row.try_get("gtin_14")?,
        album_name: row.try_get("album_name")?,
        artist_name: row.try_get("artist_name")?,
        source_album_id: row.try_get("source_album_id")?,
    })
}

fn album_error_from_row(row: &PgRow) -> Result<AlbumError, sqlx::Error> {
    Ok(AlbumError {
        error_id: row.try_get("error_id")?,
        album_id: row.try_get("album_id")?,
        batch_id: row.try_get("batch_id")?,
        error_text: row.try_get("error_text")?,
        created_at: row.try_get::<Option<DateTime<Utc>>, _>("create_time")?,
    })
}

fn staged_album_from_row(row: &PgRow) -> Result<StagedAlbum, StoreError> {
    let status_cd: String = row.try_get("status_cd")?;
    Ok(
        StagedAlbum::builder(row.try_get("album_id")?, row.try_get("batch_id")?)
            .status(Status::from_code(&status_cd)?)
            .gtin_14(row.try_get("gtin_14")?)
            .album_name(row.try_get("album_name")?)
            .artist(row.try_get("artist_name")?)
            .build(),
    )
}

#[async_trait]
impl NaturalKeyLookup for PgStore {
    async fn find_by_gtin_14(&self, gtin_14: &str) -> Result<Option<CoreAlbum>, StoreError> {
        let rows = sqlx::query(
            "SELECT album_id, gtin_14, album_name, artist_name, source_album_id \
             FROM core.ct_album WHERE gtin_14 = $1 LIMIT 2",
        )
        .bind(gtin_14)
        .fetch_all(&self.pool)
        .await?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(core_album_from_row(row)?)),
            _ => Err(StoreError::IncorrectResultSize {
                gtin_14: gtin_14.to_string(),
                found: rows.len(),
            }),
        }
    }
}

#[async_trait]
impl StagedAlbumSource for PgStore {
    async fn fetch_pending(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StagedAlbum>, StoreError> {
        let rows = sqlx::query(
            "SELECT album_id, gtin_14, album_name, artist_name, status_cd, batch_id \
             FROM stage.album WHERE batch_id = $1 AND status_cd = $2 \
             ORDER BY row_no LIMIT $3",
        )
        .bind(batch_id)
        .bind(Status::Pending.code())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(staged_album_from_row).collect()
    }
}

#[async_trait]
impl StageSink for PgStore {
    async fn insert_staged(&self, albums: &[StagedAlbum]) -> Result<StageWriteCount, StoreError> {
        let now = Utc::now();
        let mut count = StageWriteCount::default();
        let mut tx = self.pool.begin().await?;

        for album in albums {
            count.albums += sqlx::query(
                "INSERT INTO stage.album \
                 (album_id, gtin_14, album_name, artist_name, batch_id, create_time, status_cd, last_update_time) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(album.album_id())
            .bind(album.gtin_14())
            .bind(album.album_name())
            .bind(album.artist())
            .bind(album.batch_id())
            .bind(now)
            .bind(album.status().code())
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for song in albums.iter().flat_map(StagedAlbum::songs) {
            count.songs += sqlx::query(
                "INSERT INTO stage.song (song_id, album_id, create_time, song_name) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(song.song_id)
            .bind(song.album_id)
            .bind(now)
            .bind(song.song_name.as_deref())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(count)
    }
}

fn unique_violation(err: sqlx::Error, album: &CoreAlbum) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation(album.gtin_14.clone().unwrap_or_default());
        }
    }
    StoreError::Database(err)
}

async fn insert_core_rows(
    conn: &mut PgConnection,
    albums: &[CoreAlbum],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut inserted = 0;
    for album in albums {
        inserted += sqlx::query(
            "INSERT INTO core.ct_album \
             (album_id, gtin_14, album_name, artist_name, create_time, last_update_time, source_album_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(album.album_id)
        .bind(album.gtin_14.as_deref())
        .bind(album.album_name.as_deref())
        .bind(album.artist_name.as_deref())
        .bind(now)
        .bind(now)
        .bind(album.source_album_id)
        .execute(&mut *conn)
        .await
        .map_err(|err| unique_violation(err, album))?
        .rows_affected();
    }
    Ok(inserted)
}

async fn update_core_rows(
    conn: &mut PgConnection,
    albums: &[CoreAlbum],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut updated = 0;
    for album in albums {
        updated += sqlx::query(
            "UPDATE core.ct_album SET gtin_14 = $1, album_name = $2, artist_name = $3, \
             last_update_time = $4, source_album_id = $5 WHERE album_id = $6",
        )
        .bind(album.gtin_14.as_deref())
        .bind(album.album_name.as_deref())
        .bind(album.artist_name.as_deref())
        .bind(now)
        .bind(album.source_album_id)
        .bind(album.album_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(updated)
}

async fn update_status_rows(
    conn: &mut PgConnection,
    albums: &[StagedAlbum],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut updated = 0;
    for album in albums {
        updated += sqlx::query(
            "UPDATE stage.album SET status_cd = $1, last_update_time = $2 WHERE album_id = $3",
        )
        .bind(album.status().code())
        .bind(now)
        .bind(album.album_id())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(updated)
}

async fn insert_error_rows(
    conn: &mut PgConnection,
    errors: &[AlbumError],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut inserted = 0;
    for error in errors {
        inserted += sqlx::query(
            "INSERT INTO stage.album_error (error_id, album_id, batch_id, create_time, error_text) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(error.error_id)
        .bind(error.album_id)
        .bind(error.batch_id)
        .bind(now)
        .bind(&error.error_text)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(inserted)
}

#[async_trait]
impl CoreAlbumSink for PgStore {
    async fn insert_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_core_rows(&mut tx, albums, Utc::now()).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = update_core_rows(&mut tx, albums, Utc::now()).await?;
        tx.commit().await?;
        Ok(updated)
    }
}

#[async_trait]
impl StageStatusSink for PgStore {
    async fn update_status(&self, albums: &[StagedAlbum]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = update_status_rows(&mut tx, albums, Utc::now()).await?;
        tx.commit().await?;
        Ok(updated)
    }
}

#[async_trait]
impl AlbumErrorSink for PgStore {
    async fn insert_errors(&self, errors: &[AlbumError]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_error_rows(&mut tx, errors, Utc::now()).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_error(&self, error_id: Uuid) -> Result<Option<AlbumError>, StoreError> {
        let row = sqlx::query(
            "SELECT error_id, album_id, batch_id, create_time, error_text \
             FROM stage.album_error WHERE error_id = $1",
        )
        .bind(error_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(album_error_from_row).transpose()?)
    }
}

#[async_trait]
impl ChunkWriter for PgStore {
    async fn write_chunk(&self, chunk: &ChunkWrite) -> Result<ChunkWriteCount, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let count = ChunkWriteCount {
            inserted: insert_core_rows(&mut tx, &chunk.inserts, now).await?,
            updated: update_core_rows(&mut tx, &chunk.updates, now).await?,
            errors: insert_error_rows(&mut tx, &chunk.errors, now).await?,
            statuses: update_status_rows(&mut tx, &chunk.statuses, now).await?,
        };

        let expected = chunk.statuses.len() as u64;
        if count.statuses != expected {
            // Dropping the transaction rolls the chunk back.
            return Err(StoreError::StatusNotRecorded {
                expected,
                applied: count.statuses,
            });
        }
        tx.commit().await?;
        Ok(count)
    }
}

#[async_trait]
impl PayloadLoader for PgStore {
    async fn load_payload(&self, batch_id: Uuid, payload: &str) -> Result<StoredPayload, StoreError> {
        let stored = stored_payload(batch_id, payload);
        sqlx::query("INSERT INTO stage.batch (batch_id, create_time, payload) VALUES ($1, $2, $3)")
            .bind(batch_id)
            .bind(Utc::now())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StagedAlbumRow {
    album: StagedAlbum,
    status_cd: String,
    #[allow(dead_code)]
    last_update_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    payloads: Vec<(Uuid, String)>,
    albums: Vec<StagedAlbumRow>,
    songs: Vec<StagedSong>,
    core: Vec<CoreAlbum>,
    errors: Vec<AlbumError>,
}

impl MemoryState {
    fn check_unique(&self, albums: &[CoreAlbum]) -> Result<(), StoreError> {
        for (i, album) in albums.iter().enumerate() {
            let Some(gtin_14) = album.gtin_14.as_deref() else {
                continue;
            };
            let taken = self
                .core
                .iter()
                .chain(&albums[..i])
                .any(|other| other.gtin_14.as_deref() == Some(gtin_14));
            if taken {
                return Err(StoreError::UniqueViolation(gtin_14.to_string()));
            }
        }
        Ok(())
    }

    fn insert_core(&mut self, albums: &[CoreAlbum]) -> Result<u64, StoreError> {
        self.check_unique(albums)?;
        self.core.extend_from_slice(albums);
        Ok(albums.len() as u64)
    }

    fn update_core(&mut self, albums: &[CoreAlbum]) -> u64 {
        let mut updated = 0;
        for album in albums {
            if let Some(existing) = self.core.iter_mut().find(|a| a.album_id == album.album_id) {
                *existing = album.clone();
                updated += 1;
            }
        }
        updated
    }

    fn staged_matches(&self, albums: &[StagedAlbum]) -> u64 {
        albums
            .iter()
            .filter(|album| self.albums.iter().any(|r| r.album.album_id() == album.album_id()))
            .count() as u64
    }

    fn update_status(&mut self, albums: &[StagedAlbum], now: DateTime<Utc>) -> u64 {
        let mut updated = 0;
        for album in albums {
            if let Some(row) = self
                .albums
                .iter_mut()
                .find(|r| r.album.album_id() == album.album_id())
            {
                row.status_cd = album.status().code().to_string();
                row.last_update_time = now;
                updated += 1;
            }
        }
        updated
    }

    fn insert_errors(&mut self, errors: &[AlbumError], now: DateTime<Utc>) -> u64 {
        self.errors.extend(errors.iter().cloned().map(|mut e| {
            e.created_at = Some(now);
            e
        }));
        errors.len() as u64
    }
}

/// In-memory store mirroring the Postgres schema, including the unique GTIN-14
/// constraint on core albums.
///
/// As a [`ClobSource`] it ignores the SQL text: the first `Uuid` bind selects
/// one batch's payloads, and with no `Uuid` bind every payload is returned.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the canonical store directly.
    pub async fn seed_core(&self, album: CoreAlbum) {
        self.state.lock().await.core.push(album);
    }

    pub async fn core_albums(&self) -> Vec<CoreAlbum> {
        self.state.lock().await.core.clone()
    }

    /// Staged albums with their persisted status decoded.
    pub async fn staged_albums(&self) -> Result<Vec<StagedAlbum>, StoreError> {
        let state = self.state.lock().await;
        state
            .albums
            .iter()
            .map(|row| {
                Ok(row
                    .album
                    .to_builder()
                    .status(Status::from_code(&row.status_cd)?)
                    .build())
            })
            .collect()
    }

    pub async fn staged_songs(&self) -> Vec<StagedSong> {
        self.state.lock().await.songs.clone()
    }

    pub async fn album_errors(&self) -> Vec<AlbumError> {
        self.state.lock().await.errors.clone()
    }

    /// Overwrites a persisted status code without validation, to simulate a
    /// corrupted staging row.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn force_status_code(&self, album_id: Uuid, status_cd: &str) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.albums.iter_mut().find(|r| r.album.album_id() == album_id) {
            row.status_cd = status_cd.to_string();
        }
    }
}

/// Cursor over CLOB texts already materialized in memory.
#[derive(Debug)]
pub struct MemoryClobCursor {
    rows: std::vec::IntoIter<String>,
    closed: bool,
}

impl MemoryClobCursor {
    pub fn new(rows: Vec<String>) -> Self {
        Self {
            rows: rows.into_iter(),
            closed: false,
        }
    }
}

#[async_trait]
impl ClobCursor for MemoryClobCursor {
    async fn next_clob(&mut self) -> Result<Option<Clob>, StoreError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next().map(Clob::new))
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl ClobSource for MemoryStore {
    async fn open_cursor(
        &self,
        sql: &str,
        binds: &[BindValue],
    ) -> Result<Box<dyn ClobCursor>, StoreError> {
        let batch = binds.iter().find_map(|b| match b {
            BindValue::Uuid(id) => Some(*id),
            _ => None,
        });
        debug!(sql, ?batch, "opening in-memory clob cursor");
        let state = self.state.lock().await;
        let rows = state
            .payloads
            .iter()
            .filter(|(batch_id, _)| batch.map_or(true, |b| b == *batch_id))
            .map(|(_, payload)| payload.clone())
            .collect();
        Ok(Box::new(MemoryClobCursor::new(rows)))
    }
}

#[async_trait]
impl NaturalKeyLookup for MemoryStore {
    async fn find_by_gtin_14(&self, gtin_14: &str) -> Result<Option<CoreAlbum>, StoreError> {
        let state = self.state.lock().await;
        let matches: Vec<_> = state
            .core
            .iter()
            .filter(|a| a.gtin_14.as_deref() == Some(gtin_14))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [album] => Ok(Some((*album).clone())),
            _ => Err(StoreError::IncorrectResultSize {
                gtin_14: gtin_14.to_string(),
                found: matches.len(),
            }),
        }
    }
}

#[async_trait]
impl StagedAlbumSource for MemoryStore {
    async fn fetch_pending(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StagedAlbum>, StoreError> {
        let state = self.state.lock().await;
        let mut pending = Vec::new();
        for row in state.albums.iter().filter(|r| r.album.batch_id() == batch_id) {
            if pending.len() >= limit {
                break;
            }
            let status = Status::from_code(&row.status_cd)?;
            if status == Status::Pending {
                pending.push(row.album.to_builder().status(status).build());
            }
        }
        Ok(pending)
    }
}

#[async_trait]
impl StageSink for MemoryStore {
    async fn insert_staged(&self, albums: &[StagedAlbum]) -> Result<StageWriteCount, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut count = StageWriteCount::default();
        for album in albums {
            state.albums.push(StagedAlbumRow {
                album: album.clone(),
                status_cd: album.status().code().to_string(),
                last_update_time: now,
            });
            state.songs.extend(album.songs().iter().cloned());
            count.albums += 1;
            count.songs += album.songs().len() as u64;
        }
        Ok(count)
    }
}

#[async_trait]
impl CoreAlbumSink for MemoryStore {
    async fn insert_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError> {
        self.state.lock().await.insert_core(albums)
    }

    async fn update_core(&self, albums: &[CoreAlbum]) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.update_core(albums))
    }
}

#[async_trait]
impl StageStatusSink for MemoryStore {
    async fn update_status(&self, albums: &[StagedAlbum]) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.update_status(albums, Utc::now()))
    }
}

#[async_trait]
impl AlbumErrorSink for MemoryStore {
    async fn insert_errors(&self, errors: &[AlbumError]) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.insert_errors(errors, Utc::now()))
    }

    async fn find_error(&self, error_id: Uuid) -> Result<Option<AlbumError>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.errors.iter().find(|e| e.error_id == error_id).cloned())
    }
}

#[async_trait]
impl ChunkWriter for MemoryStore {
    async fn write_chunk(&self, chunk: &ChunkWrite) -> Result<ChunkWriteCount, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        state.check_unique(&chunk.inserts)?;
        let expected = chunk.statuses.len() as u64;
        let applied = state.staged_matches(&chunk.statuses);
        if applied != expected {
            return Err(StoreError::StatusNotRecorded { expected, applied });
        }

        Ok(ChunkWriteCount {
            inserted: state.insert_core(&chunk.inserts)?,
            updated: state.update_core(&chunk.updates),
            errors: state.insert_errors(&chunk.errors, now),
            statuses: state.update_status(&chunk.statuses, now),
        })
    }
}

#[async_trait]
impl PayloadLoader for MemoryStore {
    async fn load_payload(&self, batch_id: Uuid, payload: &str) -> Result<StoredPayload, StoreError> {
        let stored = stored_payload(batch_id, payload);
        self.state
            .lock()
            .await
            .payloads
            .push((batch_id, payload.to_string()));
        Ok(stored)
    }
}
