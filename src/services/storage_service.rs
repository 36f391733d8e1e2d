//! src/services/storage_service.rs
//!
//! StorageService — the registration / upload / publish / retrieval pipeline
//! backed by SQLite for file metadata and local disk for payloads. Payloads
//! live beneath `base_path/{shard}/{shard}/{id}`, and a record becomes
//! retrievable only after an explicit publish flips `is_open`.

use crate::models::file::FileRecord;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Upload rules injected at construction time. Workflows never read
/// ambient/global configuration.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    /// Prefix the file id is appended to when building access URLs.
    pub base_url: String,
    /// Case-sensitive allow-set of file extensions (without the dot).
    pub allowed_extensions: Vec<String>,
    /// Largest weight ceiling (in megabytes) a client may register.
    pub max_weight_mb: i64,
}

/// Input for registering an expected file before its bytes exist.
#[derive(Clone, Debug)]
pub struct RegisterParams {
    pub file_name: String,
    pub hash: String,
    pub weight: i64,
}

/// What registration hands back to the caller.
#[derive(Debug)]
pub struct RegisteredFile {
    pub id: Uuid,
    pub url: String,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file extension is not allowed, expected one of {0:?}")]
    InvalidExtension(Vec<String>),
    #[error("declared weight {declared} MB exceeds the maximum of {max} MB")]
    ExceedsSizeLimit { declared: i64, max: i64 },
    #[error("file `{0}` not found")]
    NotFound(Uuid),
    #[error("uploaded payload is empty")]
    EmptyPayload,
    #[error("delivered file name `{delivered}` does not match registered name `{expected}`")]
    NameMismatch { expected: String, delivered: String },
    #[error("uploaded content hash does not match the registered hash")]
    HashMismatch,
    #[error("uploaded payload of {delivered} MB exceeds the declared ceiling of {ceiling} MB")]
    SizeExceeded { delivered: i64, ceiling: i64 },
    #[error("file `{0}` not found or closed")]
    NotFoundOrClosed(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("failed to write payload to storage: {0}")]
    WriteError(#[source] io::Error),
    #[error("failed to read payload from storage: {0}")]
    ReadError(#[source] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const BYTES_PER_MEGABYTE: usize = 1024 * 1024;

/// StorageService provides the document lifecycle operations:
/// - Register a file (declares name, content hash, and weight ceiling)
/// - Upload its payload (verified against the registered metadata)
/// - Publish it (flips visibility and records the publish time)
/// - Get it (name + bytes, open records only)
///
/// All validation runs before any mutating side effect, so a failed step
/// never leaves a partial record or a discoverable partial blob behind.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Registration and upload limits.
    pub policy: UploadPolicy,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool,
    /// using `base_path` as the payload root and `policy` as the limits.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, policy: UploadPolicy) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            policy,
        }
    }

    /// Register an expected file. Validates the declared weight ceiling and
    /// the file extension, then persists a closed record with a fresh
    /// time-ordered id. No payload is written here.
    pub async fn register_file(&self, params: RegisterParams) -> StorageResult<RegisteredFile> {
        self.ensure_weight_registrable(params.weight)?;
        self.ensure_extension_allowed(&params.file_name)?;

        let record = FileRecord {
            id: Uuid::now_v7(),
            file_name: params.file_name,
            hash: params.hash.to_uppercase(),
            weight: params.weight,
            date_modified: Utc::now(),
            is_open: false,
            date_published: None,
            file_on_server: None,
        };
        let record = self.upsert_record(record).await?;

        debug!("registered file {} ({})", record.id, record.file_name);
        Ok(RegisteredFile {
            url: self.access_url(record.id),
            id: record.id,
            date_modified: record.date_modified,
        })
    }

    /// Upload the payload for a registered file.
    ///
    /// Checks run in strict order — empty payload, name match, hash match,
    /// size against the registered weight ceiling — and the blob write only
    /// happens once they all pass. Re-uploading a valid payload overwrites
    /// the previous blob (last writer wins).
    ///
    /// Returns the access URL for the file.
    pub async fn upload_file(
        &self,
        id: Uuid,
        delivered_name: &str,
        payload: &[u8],
    ) -> StorageResult<String> {
        let mut record = self.fetch_record(id).await?;

        ensure_non_empty(payload)?;
        ensure_name_match(&record.file_name, delivered_name)?;
        ensure_hash_match(payload, &record.hash)?;
        ensure_size_within_weight(payload, record.weight)?;

        let reference = self.write_payload(record.id, payload).await?;
        record.file_on_server = Some(reference);
        let record = self.upsert_record(record).await?;

        debug!(
            "stored payload for {} at {:?}",
            record.id, record.file_on_server
        );
        Ok(self.access_url(record.id))
    }

    /// Mark a file open and record its publish time.
    ///
    /// Publishing does not require that an upload has happened; a record can
    /// be opened with no payload on the server, in which case retrieval
    /// surfaces a storage read error.
    pub async fn publish_file(
        &self,
        id: Uuid,
        date_published: DateTime<Utc>,
    ) -> StorageResult<FileRecord> {
        let mut record = self.fetch_record(id).await?;
        record.date_published = Some(date_published);
        record.is_open = true;
        let record = self.upsert_record(record).await?;

        debug!("published file {} at {}", record.id, date_published);
        Ok(record)
    }

    /// Fetch the file name and payload bytes of an open file.
    ///
    /// Unknown ids and unpublished records both fail `NotFoundOrClosed`; the
    /// caller cannot tell the two apart.
    pub async fn get_file(&self, id: Uuid) -> StorageResult<(String, Vec<u8>)> {
        let record = self.fetch_open_record(id).await?;
        let reference = record.file_on_server.ok_or_else(|| {
            StorageError::ReadError(io::Error::new(
                ErrorKind::NotFound,
                "no payload stored on server",
            ))
        })?;

        let bytes = fs::read(&reference).await.map_err(StorageError::ReadError)?;
        Ok((record.file_name, bytes))
    }

    /// Build the externally visible access URL for a file id.
    fn access_url(&self, id: Uuid) -> String {
        format!("{}{}", self.policy.base_url, id)
    }

    /// Reject extensions outside the configured allow-set.
    ///
    /// The extension is the suffix after the last `.`; membership is
    /// case-sensitive. A name with no dot has an empty extension and is
    /// rejected unless the allow-set contains the empty string.
    fn ensure_extension_allowed(&self, file_name: &str) -> StorageResult<()> {
        let extension = file_extension(file_name);
        if self
            .policy
            .allowed_extensions
            .iter()
            .any(|allowed| allowed == extension)
        {
            Ok(())
        } else {
            Err(StorageError::InvalidExtension(
                self.policy.allowed_extensions.clone(),
            ))
        }
    }

    /// Reject declared weight ceilings above the configured maximum. This
    /// bounds what a client may register, not the actual upload size.
    fn ensure_weight_registrable(&self, weight: i64) -> StorageResult<()> {
        if weight > self.policy.max_weight_mb {
            return Err(StorageError::ExceedsSizeLimit {
                declared: weight,
                max: self.policy.max_weight_mb,
            });
        }
        Ok(())
    }

    /// Construct the payload path for a file id:
    /// `base_path/{shard}/{shard}/{id}`, sharded by the first hex characters
    /// of the id to keep per-directory file counts down.
    fn payload_path(&self, id: Uuid) -> PathBuf {
        let hex = id.simple().to_string();
        let mut path = self.base_path.clone();
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(&hex);
        path
    }

    /// Write payload bytes to disk and return the storage reference.
    ///
    /// Writes to a temporary file first and renames into place, so a failed
    /// write never leaves a partial payload at the final path.
    async fn write_payload(&self, id: Uuid, payload: &[u8]) -> StorageResult<String> {
        let file_path = self.payload_path(id);
        let parent = file_path.parent().map(PathBuf::from).ok_or_else(|| {
            StorageError::WriteError(io::Error::new(
                ErrorKind::Other,
                "payload path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(StorageError::WriteError)?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::now_v7()));
        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(())
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::WriteError(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                let replaced = async {
                    fs::remove_file(&file_path).await?;
                    fs::rename(&tmp_path, &file_path).await
                }
                .await;
                if let Err(err) = replaced {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::WriteError(err));
                }
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::WriteError(err));
            }
        }

        Ok(file_path.to_string_lossy().into_owned())
    }

    /// Fetch a file record by id. Returns NotFound if missing.
    async fn fetch_record(&self, id: Uuid) -> StorageResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, file_name, hash, weight, date_modified, is_open,
                    date_published, file_on_server
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::NotFound(id),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a file record by id, filtered to open records. Missing and
    /// closed records are indistinguishable on purpose.
    async fn fetch_open_record(&self, id: Uuid) -> StorageResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, file_name, hash, weight, date_modified, is_open,
                    date_published, file_on_server
             FROM files WHERE id = ? AND is_open = 1",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::NotFoundOrClosed(id),
            other => StorageError::Sqlx(other),
        })
    }

    /// Insert or overwrite a file record keyed by id.
    async fn upsert_record(&self, record: FileRecord) -> StorageResult<FileRecord> {
        let stored = sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO files (
                id, file_name, hash, weight, date_modified, is_open,
                date_published, file_on_server
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_name = excluded.file_name,
                hash = excluded.hash,
                weight = excluded.weight,
                date_modified = excluded.date_modified,
                is_open = excluded.is_open,
                date_published = excluded.date_published,
                file_on_server = excluded.file_on_server
            RETURNING id, file_name, hash, weight, date_modified, is_open,
                      date_published, file_on_server
            "#,
        )
        .bind(record.id)
        .bind(&record.file_name)
        .bind(&record.hash)
        .bind(record.weight)
        .bind(record.date_modified)
        .bind(record.is_open)
        .bind(record.date_published)
        .bind(&record.file_on_server)
        .fetch_one(&*self.db)
        .await?;
        Ok(stored)
    }
}

/// Extract the extension of a file name: the suffix after the last `.`,
/// or the empty string if there is none.
fn file_extension(file_name: &str) -> &str {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("")
}

/// Reject zero-length payloads.
fn ensure_non_empty(payload: &[u8]) -> StorageResult<()> {
    if payload.is_empty() {
        return Err(StorageError::EmptyPayload);
    }
    Ok(())
}

/// Require the delivered name to equal the registered one exactly.
/// Ordinal comparison, no normalization.
fn ensure_name_match(expected: &str, delivered: &str) -> StorageResult<()> {
    if delivered != expected {
        return Err(StorageError::NameMismatch {
            expected: expected.to_string(),
            delivered: delivered.to_string(),
        });
    }
    Ok(())
}

/// Compare the MD5 of the payload, as uppercase hex, against the hash
/// declared at registration.
fn ensure_hash_match(payload: &[u8], expected_hash: &str) -> StorageResult<()> {
    let delivered_hash = format!("{:x}", md5::compute(payload)).to_uppercase();
    if delivered_hash != expected_hash {
        return Err(StorageError::HashMismatch);
    }
    Ok(())
}

/// Check the payload size against the registered weight ceiling.
///
/// The size is converted to whole megabytes with floor division, so a
/// payload just under 2 MB counts as 1 MB. Kept exactly as specified.
fn ensure_size_within_weight(payload: &[u8], weight_mb: i64) -> StorageResult<()> {
    let delivered_mb = whole_megabytes(payload.len());
    if delivered_mb > weight_mb {
        return Err(StorageError::SizeExceeded {
            delivered: delivered_mb,
            ceiling: weight_mb,
        });
    }
    Ok(())
}

/// Byte length in whole megabytes, rounded down.
fn whole_megabytes(len: usize) -> i64 {
    (len / BYTES_PER_MEGABYTE) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

    async fn service_fixture() -> (StorageService, TempDir) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        for stmt in MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.expect("migration");
        }

        let dir = TempDir::new().expect("tempdir");
        let policy = UploadPolicy {
            base_url: "http://localhost:3000/storage/get/".into(),
            allowed_extensions: vec!["pdf".into(), "docx".into(), "txt".into()],
            max_weight_mb: 5,
        };
        let service = StorageService::new(Arc::new(pool), dir.path(), policy);
        (service, dir)
    }

    fn params(file_name: &str, payload: &[u8], weight: i64) -> RegisterParams {
        RegisterParams {
            file_name: file_name.to_string(),
            hash: format!("{:x}", md5::compute(payload)).to_uppercase(),
            weight,
        }
    }

    async fn record_count(service: &StorageService) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&*service.db)
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn registration_rejects_disallowed_extension() {
        let (service, _dir) = service_fixture().await;
        let err = service
            .register_file(params("tool.exe", b"payload", 1))
            .await
            .expect_err("exe is not allowed");
        assert!(matches!(err, StorageError::InvalidExtension(_)));
        assert_eq!(record_count(&service).await, 0);
    }

    #[tokio::test]
    async fn registration_rejects_weight_above_maximum() {
        let (service, _dir) = service_fixture().await;
        let err = service
            .register_file(params("report.pdf", b"payload", 6))
            .await
            .expect_err("over the 5 MB maximum");
        assert!(matches!(
            err,
            StorageError::ExceedsSizeLimit { declared: 6, max: 5 }
        ));
        assert_eq!(record_count(&service).await, 0);
    }

    #[tokio::test]
    async fn registration_creates_closed_record_without_payload() {
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(params("report.pdf", b"payload", 2))
            .await
            .expect("register");
        assert!(registered.url.ends_with(&registered.id.to_string()));

        let record = service.fetch_record(registered.id).await.expect("lookup");
        assert!(!record.is_open);
        assert!(record.date_published.is_none());
        assert!(record.file_on_server.is_none());
    }

    #[tokio::test]
    async fn registration_uppercases_declared_hash() {
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(RegisterParams {
                file_name: "report.pdf".into(),
                hash: "ab12cd".into(),
                weight: 1,
            })
            .await
            .expect("register");
        let record = service.fetch_record(registered.id).await.expect("lookup");
        assert_eq!(record.hash, "AB12CD");
    }

    #[tokio::test]
    async fn ids_sort_in_creation_order() {
        let (service, _dir) = service_fixture().await;
        let first = service
            .register_file(params("a.txt", b"a", 1))
            .await
            .expect("first");
        let second = service
            .register_file(params("b.txt", b"b", 1))
            .await
            .expect("second");
        assert!(first.id < second.id);
    }

    #[tokio::test]
    async fn full_lifecycle_round_trip() {
        let (service, _dir) = service_fixture().await;
        let payload = vec![7u8; 2 * 1024 * 1024];
        let registered = service
            .register_file(params("report.pdf", &payload, 5))
            .await
            .expect("register");

        let url = service
            .upload_file(registered.id, "report.pdf", &payload)
            .await
            .expect("upload");
        assert!(url.ends_with(&registered.id.to_string()));

        let published_at = Utc::now();
        let record = service
            .publish_file(registered.id, published_at)
            .await
            .expect("publish");
        assert!(record.is_open);
        assert_eq!(record.date_published, Some(published_at));

        let (file_name, bytes) = service.get_file(registered.id).await.expect("get");
        assert_eq!(file_name, "report.pdf");
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn upload_rejects_unknown_id() {
        let (service, _dir) = service_fixture().await;
        let err = service
            .upload_file(Uuid::now_v7(), "report.pdf", b"payload")
            .await
            .expect_err("never registered");
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn upload_rejects_empty_payload() {
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(params("report.pdf", b"payload", 1))
            .await
            .expect("register");
        let err = service
            .upload_file(registered.id, "report.pdf", b"")
            .await
            .expect_err("empty payload");
        assert!(matches!(err, StorageError::EmptyPayload));
    }

    #[tokio::test]
    async fn upload_checks_name_before_hash() {
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(params("report.pdf", b"payload", 1))
            .await
            .expect("register");
        // Both the name and the content are wrong; the name check fires first.
        let err = service
            .upload_file(registered.id, "other.pdf", b"different content")
            .await
            .expect_err("wrong name");
        assert!(matches!(err, StorageError::NameMismatch { .. }));
    }

    #[tokio::test]
    async fn upload_rejects_hash_mismatch_and_keeps_record_clean() {
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(params("report.pdf", b"expected content", 1))
            .await
            .expect("register");
        let err = service
            .upload_file(registered.id, "report.pdf", b"different content")
            .await
            .expect_err("wrong hash");
        assert!(matches!(err, StorageError::HashMismatch));

        let record = service.fetch_record(registered.id).await.expect("lookup");
        assert!(record.file_on_server.is_none());
    }

    #[tokio::test]
    async fn upload_rejects_payload_over_weight_ceiling() {
        let (service, _dir) = service_fixture().await;
        let payload = vec![7u8; 2 * 1024 * 1024];
        let registered = service
            .register_file(params("report.pdf", &payload, 1))
            .await
            .expect("register");
        let err = service
            .upload_file(registered.id, "report.pdf", &payload)
            .await
            .expect_err("2 MB payload against a 1 MB ceiling");
        assert!(matches!(
            err,
            StorageError::SizeExceeded {
                delivered: 2,
                ceiling: 1
            }
        ));
    }

    #[tokio::test]
    async fn upload_overwrite_is_allowed() {
        let (service, _dir) = service_fixture().await;
        let payload = b"same payload";
        let registered = service
            .register_file(params("report.pdf", payload, 1))
            .await
            .expect("register");
        service
            .upload_file(registered.id, "report.pdf", payload)
            .await
            .expect("first upload");
        service
            .upload_file(registered.id, "report.pdf", payload)
            .await
            .expect("re-upload of the same payload");
    }

    #[tokio::test]
    async fn retrieval_rejects_unpublished_and_unknown_alike() {
        let (service, _dir) = service_fixture().await;
        let payload = b"payload";
        let registered = service
            .register_file(params("report.pdf", payload, 1))
            .await
            .expect("register");
        service
            .upload_file(registered.id, "report.pdf", payload)
            .await
            .expect("upload");

        let unpublished = service
            .get_file(registered.id)
            .await
            .expect_err("not published yet");
        assert!(matches!(unpublished, StorageError::NotFoundOrClosed(_)));

        let unknown = service
            .get_file(Uuid::now_v7())
            .await
            .expect_err("never registered");
        assert!(matches!(unknown, StorageError::NotFoundOrClosed(_)));
    }

    #[tokio::test]
    async fn publish_without_upload_passes_and_retrieval_fails_on_read() {
        // Publishing is deliberately not gated on a completed upload; the
        // gap surfaces as a storage read error at retrieval time.
        let (service, _dir) = service_fixture().await;
        let registered = service
            .register_file(params("report.pdf", b"payload", 1))
            .await
            .expect("register");
        let record = service
            .publish_file(registered.id, Utc::now())
            .await
            .expect("publish with no payload stored");
        assert!(record.is_open);
        assert!(record.file_on_server.is_none());

        let err = service
            .get_file(registered.id)
            .await
            .expect_err("nothing on disk to read");
        assert!(matches!(err, StorageError::ReadError(_)));
    }

    #[tokio::test]
    async fn publish_rejects_unknown_id() {
        let (service, _dir) = service_fixture().await;
        let err = service
            .publish_file(Uuid::now_v7(), Utc::now())
            .await
            .expect_err("never registered");
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn whole_megabytes_rounds_down() {
        assert_eq!(whole_megabytes(0), 0);
        assert_eq!(whole_megabytes(1024 * 1024 - 1), 0);
        assert_eq!(whole_megabytes(1024 * 1024), 1);
        // 1.99 MB still counts as 1 MB.
        assert_eq!(whole_megabytes(2 * 1024 * 1024 - 10), 1);
        assert_eq!(whole_megabytes(2 * 1024 * 1024), 2);
    }

    #[test]
    fn file_extension_is_suffix_after_last_dot() {
        assert_eq!(file_extension("report.pdf"), "pdf");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension("noextension"), "");
        assert_eq!(file_extension("trailing."), "");
    }
}
