//! Core domain model for the staged album pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clobetl-core";

/// Returns a new globally unique id.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Processing status of a staged record, persisted as a fixed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid status.")]
pub struct StatusCodeError(pub String);

impl Status {
    pub const ALL: [Status; 3] = [Status::Pending, Status::Complete, Status::Error];

    pub fn code(self) -> &'static str {
        match self {
            Status::Pending => "PEND",
            Status::Complete => "COMP",
            Status::Error => "ERROR",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, StatusCodeError> {
        Self::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or_else(|| StatusCodeError(code.to_string()))
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Status {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("album {album_id} cannot move from {from} to {to}")]
pub struct StatusTransitionError {
    pub album_id: Uuid,
    pub from: Status,
    pub to: Status,
}

/// External JSON shape of one album inside a batch payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumPayload {
    #[serde(rename = "gtin-14")]
    pub gtin_14: Option<String>,
    pub album_name: Option<String>,
    pub artist: Option<String>,
    #[serde(default)]
    pub songs: Vec<SongPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongPayload {
    pub song_name: Option<String>,
}

/// Song row in the staging store; always owned by one staged album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedSong {
    pub song_id: Uuid,
    pub album_id: Uuid,
    pub song_name: Option<String>,
}

/// Album row in the staging store.
///
/// The status only ever moves once, from `Pending` to a terminal status, via
/// [`StagedAlbum::transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedAlbum {
    album_id: Uuid,
    batch_id: Uuid,
    status: Status,
    gtin_14: Option<String>,
    album_name: Option<String>,
    artist: Option<String>,
    songs: Vec<StagedSong>,
}

impl StagedAlbum {
    pub fn builder(album_id: Uuid, batch_id: Uuid) -> StagedAlbumBuilder {
        StagedAlbumBuilder {
            album: StagedAlbum {
                album_id,
                batch_id,
                status: Status::Pending,
                gtin_14: None,
                album_name: None,
                artist: None,
                songs: Vec::new(),
            },
        }
    }

    pub fn album_id(&self) -> Uuid {
        self.album_id
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn gtin_14(&self) -> Option<&str> {
        self.gtin_14.as_deref()
    }

    pub fn album_name(&self) -> Option<&str> {
        self.album_name.as_deref()
    }

    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }

    pub fn songs(&self) -> &[StagedSong] {
        &self.songs
    }

    /// Builder seeded with this album, used when rehydrating persisted rows.
    pub fn to_builder(&self) -> StagedAlbumBuilder {
        StagedAlbumBuilder {
            album: self.clone(),
        }
    }

    pub fn transition(self, to: Status) -> Result<Self, StatusTransitionError> {
        if self.status != Status::Pending || to == Status::Pending {
            return Err(StatusTransitionError {
                album_id: self.album_id,
                from: self.status,
                to,
            });
        }
        Ok(Self { status: to, ..self })
    }
}

impl fmt::Display for StagedAlbum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}, {}, '{}'}}",
            self.album_id,
            self.gtin_14.as_deref().unwrap_or("null"),
            self.album_name.as_deref().unwrap_or("null")
        )
    }
}

#[derive(Debug, Clone)]
pub struct StagedAlbumBuilder {
    album: StagedAlbum,
}

impl StagedAlbumBuilder {
    pub fn status(mut self, status: Status) -> Self {
        self.album.status = status;
        self
    }

    pub fn gtin_14(mut self, gtin_14: Option<String>) -> Self {
        self.album.gtin_14 = gtin_14;
        self
    }

    pub fn album_name(mut self, album_name: Option<String>) -> Self {
        self.album.album_name = album_name;
        self
    }

    pub fn artist(mut self, artist: Option<String>) -> Self {
        self.album.artist = artist;
        self
    }

    /// Adds a song; its album back-reference is forced to this album.
    pub fn song(mut self, song_id: Uuid, song_name: Option<String>) -> Self {
        self.album.songs.push(StagedSong {
            song_id,
            album_id: self.album.album_id,
            song_name,
        });
        self
    }

    pub fn build(self) -> StagedAlbum {
        self.album
    }
}

/// Deduplicated album in the canonical store, unique by GTIN-14.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAlbum {
    pub album_id: Uuid,
    pub gtin_14: Option<String>,
    pub album_name: Option<String>,
    pub artist_name: Option<String>,
    pub source_album_id: Option<Uuid>,
}

impl CoreAlbum {
    pub fn builder(album_id: Uuid) -> CoreAlbumBuilder {
        CoreAlbumBuilder {
            album: CoreAlbum {
                album_id,
                gtin_14: None,
                album_name: None,
                artist_name: None,
                source_album_id: None,
            },
        }
    }

    /// Copies the staged album's data fields over this album, keeping its id.
    pub fn overlay(self, staged: &StagedAlbum) -> Self {
        Self {
            album_id: self.album_id,
            gtin_14: staged.gtin_14.clone(),
            album_name: staged.album_name.clone(),
            artist_name: staged.artist.clone(),
            source_album_id: Some(staged.album_id),
        }
    }
}

impl fmt::Display for CoreAlbum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{},{},'{}'}}",
            self.album_id,
            self.gtin_14.as_deref().unwrap_or("null"),
            self.album_name.as_deref().unwrap_or("null")
        )
    }
}

#[derive(Debug, Clone)]
pub struct CoreAlbumBuilder {
    album: CoreAlbum,
}

impl CoreAlbumBuilder {
    pub fn gtin_14(mut self, gtin_14: impl Into<String>) -> Self {
        self.album.gtin_14 = Some(gtin_14.into());
        self
    }

    pub fn album_name(mut self, album_name: impl Into<String>) -> Self {
        self.album.album_name = Some(album_name.into());
        self
    }

    pub fn artist_name(mut self, artist_name: impl Into<String>) -> Self {
        self.album.artist_name = Some(artist_name.into());
        self
    }

    pub fn source_album_id(mut self, source_album_id: Uuid) -> Self {
        self.album.source_album_id = Some(source_album_id);
        self
    }

    pub fn build(self) -> CoreAlbum {
        self.album
    }
}

/// Summary of every violation found for one staged album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumError {
    pub error_id: Uuid,
    pub album_id: Uuid,
    pub batch_id: Uuid,
    pub error_text: String,
    /// Set by the store when the row is read back.
    pub created_at: Option<DateTime<Utc>>,
}

impl AlbumError {
    pub fn for_album(staged: &StagedAlbum, error_text: impl Into<String>) -> Self {
        Self {
            error_id: new_id(),
            album_id: staged.album_id,
            batch_id: staged.batch_id,
            error_text: error_text.into(),
            created_at: None,
        }
    }
}

impl fmt::Display for AlbumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, '{}'}}", self.error_id, self.error_text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutcomeAccessError {
    #[error("This outcome does not hold a valid core album.")]
    NotUpsert,
    #[error("This outcome does not hold an error.")]
    NotRejected,
}

/// Result of reconciling one staged album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Upsert {
        staged: StagedAlbum,
        album: CoreAlbum,
        is_insert: bool,
    },
    Rejected {
        staged: StagedAlbum,
        error: AlbumError,
    },
}

impl Outcome {
    pub fn staged(&self) -> &StagedAlbum {
        match self {
            Outcome::Upsert { staged, .. } | Outcome::Rejected { staged, .. } => staged,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Rejected { .. })
    }

    /// False for rejected outcomes.
    pub fn is_insert(&self) -> bool {
        matches!(self, Outcome::Upsert { is_insert: true, .. })
    }

    pub fn core_album(&self) -> Result<&CoreAlbum, OutcomeAccessError> {
        match self {
            Outcome::Upsert { album, .. } => Ok(album),
            Outcome::Rejected { .. } => Err(OutcomeAccessError::NotUpsert),
        }
    }

    pub fn album_error(&self) -> Result<&AlbumError, OutcomeAccessError> {
        match self {
            Outcome::Rejected { error, .. } => Ok(error),
            Outcome::Upsert { .. } => Err(OutcomeAccessError::NotRejected),
        }
    }
}

/// Joins items with commas inside braces, e.g. `{a,b}`.
pub fn list_text<T: fmt::Display>(items: &[T]) -> String {
    format!("{{{}}}", join_items(items))
}

/// Like [`list_text`] but at most `max_len` characters including the braces.
/// Truncated content ends with `...`.
pub fn bounded_list_text<T: fmt::Display>(items: &[T], max_len: usize) -> String {
    let inner_max = max_len.saturating_sub(2);
    format!("{{{}}}", abbreviate(&join_items(items), inner_max))
}

fn join_items<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn abbreviate(text: &str, max_width: usize) -> String {
    const MARKER: &str = "...";
    if text.chars().count() <= max_width {
        return text.to_string();
    }
    let keep = max_width.saturating_sub(MARKER.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(MARKER);
    out
}
