//! Represents a registered file and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single registered file moving through the register → upload → publish
/// lifecycle.
///
/// The record holds the metadata declared at registration plus the two
/// phase markers: `file_on_server` is set exactly when an upload has
/// completed, and `date_published` is set exactly when the file was opened.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Time-ordered unique identifier (UUIDv7), so ids sort by creation.
    pub id: Uuid,

    /// Original file name declared at registration.
    pub file_name: String,

    /// Expected MD5 of the payload, 32 uppercase hex characters.
    pub hash: String,

    /// Declared size ceiling in whole megabytes.
    pub weight: i64,

    /// When the record was created.
    pub date_modified: DateTime<Utc>,

    /// Whether the file is retrievable. Flipped by publish, never back.
    pub is_open: bool,

    /// When the file was published, if it has been.
    pub date_published: Option<DateTime<Utc>>,

    /// Storage reference of the persisted payload, set by a successful upload.
    pub file_on_server: Option<String>,
}
