//! Durable encoding store: one blob file per embedding plus a SQLite index.
//!
//! Blobs hold the raw little-endian `f32` values. The index row
//! `(name, file)` is written last, so a crash between the two leaves an
//! unreferenced blob and never an index row pointing at nothing.

use crate::types::{Embedding, EmbeddingRef, PersonRecord};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const BLOB_EXTENSION: &str = "emb";
const MAX_ID_ATTEMPTS: u32 = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS person_encoding (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    file TEXT NOT NULL UNIQUE
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("index: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding blob not found: {0}")]
    NotFound(EmbeddingRef),
    #[error("embedding blob {reference} is corrupt: {reason}")]
    Corrupt {
        reference: EmbeddingRef,
        reason: String,
    },
    #[error("refusing to store an empty embedding")]
    EmptyEmbedding,
    #[error("no free blob name after {} attempts", MAX_ID_ATTEMPTS)]
    IdExhausted,
}

/// Blob directory plus ordered `(name, blob)` index.
///
/// Appends are serialised by the index mutex; reads of blobs never take it.
pub struct EncodingStore {
    encodings_dir: PathBuf,
    index: Mutex<Connection>,
}

impl EncodingStore {
    /// Open (or create) a store. Creating an existing directory is not an error.
    pub fn open(encodings_dir: &Path, index_path: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(encodings_dir)?;
        if let Some(parent) = index_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(index_path)?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(
            encodings_dir = %encodings_dir.display(),
            index = %index_path.display(),
            "encoding store opened"
        );

        Ok(Self {
            encodings_dir: encodings_dir.to_path_buf(),
            index: Mutex::new(conn),
        })
    }

    pub fn encodings_dir(&self) -> &Path {
        &self.encodings_dir
    }

    /// Persist `embedding` under `name` and return its blob reference.
    pub fn append(&self, name: &str, embedding: &Embedding) -> Result<EmbeddingRef, StoreError> {
        if embedding.values.is_empty() {
            return Err(StoreError::EmptyEmbedding);
        }
        let bytes = encode_blob(embedding);

        let conn = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = Utc::now().format("%Y-%m-%dT%H_%M_%S%.6f").to_string();
        let (reference, path) = self.create_blob(&stamp, &bytes)?;

        if let Err(e) = conn.execute(
            "INSERT INTO person_encoding (name, file) VALUES (?1, ?2)",
            params![name, reference.as_str()],
        ) {
            if let Err(rm) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %rm, "failed to remove orphaned blob");
            }
            return Err(e.into());
        }

        tracing::info!(name, reference = %reference, dim = embedding.dim(), "stored encoding");
        Ok(reference)
    }

    /// Every record, in insertion order.
    pub fn list_all(&self) -> Result<Vec<PersonRecord>, StoreError> {
        let conn = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT name, file FROM person_encoding ORDER BY id")?;
        let records = stmt
            .query_map([], |row| {
                Ok(PersonRecord {
                    name: row.get(0)?,
                    embedding_ref: EmbeddingRef::new(row.get::<_, String>(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Load one stored embedding.
    pub fn read(&self, reference: &EmbeddingRef) -> Result<Embedding, StoreError> {
        let path = self.blob_path(reference)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(reference.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        decode_blob(reference, &bytes)
    }

    /// Number of indexed records.
    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM person_encoding", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Create a new blob named after `stamp`, adding a `-N` suffix until the
    /// name is unused. `create_new` makes the existence check and the
    /// creation one step, so concurrent writers never share a file.
    fn create_blob(&self, stamp: &str, bytes: &[u8]) -> Result<(EmbeddingRef, PathBuf), StoreError> {
        for attempt in 0..MAX_ID_ATTEMPTS {
            let file_name = match attempt {
                0 => format!("{stamp}.{BLOB_EXTENSION}"),
                n => format!("{stamp}-{n}.{BLOB_EXTENSION}"),
            };
            let path = self.encodings_dir.join(&file_name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
                drop(file);
                if let Err(rm) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %rm, "failed to remove partial blob");
                }
                return Err(e.into());
            }
            return Ok((EmbeddingRef::new(file_name), path));
        }
        Err(StoreError::IdExhausted)
    }

    /// Resolve a reference to a path, rejecting anything but a bare file name.
    fn blob_path(&self, reference: &EmbeddingRef) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(reference.as_str()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.encodings_dir.join(reference.as_str())),
            _ => Err(StoreError::Corrupt {
                reference: reference.clone(),
                reason: "reference is not a plain file name".into(),
            }),
        }
    }
}

fn encode_blob(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_blob(reference: &EmbeddingRef, bytes: &[u8]) -> Result<Embedding, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt {
            reference: reference.clone(),
            reason: format!("length {} is not a positive multiple of 4", bytes.len()),
        });
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> EncodingStore {
        EncodingStore::open(&tmp.path().join("encodings"), &tmp.path().join("index.sqlite3"))
            .unwrap()
    }

    fn blob_count(store: &EncodingStore) -> usize {
        fs::read_dir(store.encodings_dir()).unwrap().count()
    }

    #[test]
    fn test_open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("encodings");
        fs::create_dir_all(&dir).unwrap();

        let store = open_store(&tmp);
        assert!(store.is_empty().unwrap());
        drop(store);
        assert!(open_store(&tmp).is_empty().unwrap());
    }

    #[test]
    fn test_read_returns_exact_values() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let embedding = Embedding::new(vec![
            0.1,
            -0.0,
            f32::MIN_POSITIVE / 2.0,
            f32::MAX,
            -123.456,
            1.0 / 3.0,
        ]);

        let reference = store.append("alice", &embedding).unwrap();
        let read = store.read(&reference).unwrap();

        let bits = |e: &Embedding| e.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&read), bits(&embedding));
    }

    #[test]
    fn test_list_all_preserves_insertion_order_and_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let names = ["carol", "alice", "bob", "alice"];
        let refs: Vec<EmbeddingRef> = names
            .iter()
            .enumerate()
            .map(|(i, n)| store.append(n, &Embedding::new(vec![i as f32])).unwrap())
            .collect();

        let records = store.list_all().unwrap();
        assert_eq!(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), names);
        assert_eq!(
            records.iter().map(|r| r.embedding_ref.clone()).collect::<Vec<_>>(),
            refs
        );
        assert_eq!(store.len().unwrap(), 4);
    }

    #[test]
    fn test_records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let reference = {
            let store = open_store(&tmp);
            store.append("dave", &Embedding::new(vec![1.5, 2.5])).unwrap()
        };

        let store = open_store(&tmp);
        let records = store.list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].embedding_ref, reference);
        assert_eq!(store.read(&reference).unwrap().values, vec![1.5, 2.5]);
    }

    #[test]
    fn test_blob_name_collision_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let stamp = "2026-01-01T00_00_00.000000";

        let (first, _) = store.create_blob(stamp, &[0; 4]).unwrap();
        let (second, _) = store.create_blob(stamp, &[0; 4]).unwrap();
        let (third, _) = store.create_blob(stamp, &[0; 4]).unwrap();

        assert_eq!(first.as_str(), "2026-01-01T00_00_00.000000.emb");
        assert_eq!(second.as_str(), "2026-01-01T00_00_00.000000-1.emb");
        assert_eq!(third.as_str(), "2026-01-01T00_00_00.000000-2.emb");
    }

    #[test]
    fn test_concurrent_appends_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(open_store(&tmp));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..5)
                        .map(|i| {
                            let e = Embedding::new(vec![t as f32, i as f32]);
                            (store.append(&format!("p{t}"), &e).unwrap(), e)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let written: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(store.len().unwrap(), 40);
        assert_eq!(blob_count(&store), 40);
        for (reference, embedding) in &written {
            assert_eq!(&store.read(reference).unwrap(), embedding);
        }
    }

    #[test]
    fn test_read_missing_blob_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let reference = store.append("erin", &Embedding::new(vec![1.0])).unwrap();
        fs::remove_file(store.encodings_dir().join(reference.as_str())).unwrap();

        assert!(matches!(store.read(&reference), Err(StoreError::NotFound(r)) if r == reference));
    }

    #[test]
    fn test_read_truncated_blob_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let reference = store.append("frank", &Embedding::new(vec![1.0, 2.0])).unwrap();
        fs::write(store.encodings_dir().join(reference.as_str()), [1u8, 2, 3]).unwrap();

        assert!(matches!(store.read(&reference), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_reference_outside_store_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let reference = EmbeddingRef::new("../index.sqlite3");

        assert!(matches!(store.read(&reference), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_empty_embedding_rejected_without_writes() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert!(matches!(
            store.append("ghost", &Embedding::new(vec![])),
            Err(StoreError::EmptyEmbedding)
        ));
        assert_eq!(blob_count(&store), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_failed_index_write_removes_blob() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let other = Connection::open(tmp.path().join("index.sqlite3")).unwrap();
        other.execute_batch("DROP TABLE person_encoding;").unwrap();

        let err = store.append("henry", &Embedding::new(vec![1.0])).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert_eq!(blob_count(&store), 0);
    }
}
