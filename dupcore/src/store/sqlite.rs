//! The record-store connection layer.
//!
//! Grounded on `src/bktree/sqlite/sql.rs`: `rusqlite::Connection` with
//! `PRAGMA locking_mode=EXCLUSIVE; synchronous=NORMAL; journal_mode=WAL;`,
//! `prepare_cached` statements, and explicit `begin`/`commit` transaction helpers. That
//! table shape (two `(key, value BLOB)` tables) doesn't fit this domain, so the
//! schema itself follows the data model's `media(...)` table instead, but the connection
//! lifecycle and pragma set are carried over unchanged.
//!
//! Per the concurrency requirement ("protects its connection pool with a recursive mutex; each
//! (database-id, thread-id) gets a distinct connection... established lazily on first
//! use from a thread and reused"): this uses a `Mutex<HashMap<ThreadId, Connection>>`
//! rather than a literal recursive mutex (`std::sync::Mutex` isn't reentrant), since no
//! caller here re-enters `with_connection` while already holding it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::ThreadId;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::record::{MediaId, MediaRecord, MediaType};

fn media_type_to_i64(t: MediaType) -> i64 {
    match t {
        MediaType::Image => 0,
        MediaType::Video => 1,
        MediaType::Audio => 2,
    }
}

fn media_type_from_i64(v: i64) -> Result<MediaType> {
    match v {
        0 => Ok(MediaType::Image),
        1 => Ok(MediaType::Video),
        2 => Ok(MediaType::Audio),
        other => Err(Error::Corrupt(format!("unknown media type tag {other}"))),
    }
}

pub struct RecordStore {
    path: PathBuf,
    connections: Mutex<HashMap<ThreadId, Connection>>,
}

impl RecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let store = RecordStore {
            path,
            connections: Mutex::new(HashMap::new()),
        };
        store.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS media (
                    id INTEGER PRIMARY KEY,
                    type INTEGER NOT NULL,
                    path TEXT NOT NULL UNIQUE,
                    width INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    md5 TEXT NOT NULL,
                    dct_hash INTEGER NOT NULL
                ) STRICT;",
            )?;
            Ok(())
        })
    }

    fn new_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA locking_mode=EXCLUSIVE;
             PRAGMA synchronous=NORMAL;
             PRAGMA journal_mode=WAL;",
        )?;
        Ok(conn)
    }

    /// Run `f` against this thread's connection, opening one lazily on first use and
    /// reusing it thereafter.
    fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let thread_id = std::thread::current().id();
        let mut guard = self.connections.lock().unwrap();
        if !guard.contains_key(&thread_id) {
            let conn = self.new_connection()?;
            guard.insert(thread_id, conn);
        }
        let conn = guard.get(&thread_id).expect("just inserted");
        f(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new record. Returns `Error::Conflict` and does not insert if `path` is
    /// already present ("Conflict... add reports and skips").
    pub fn add(&self, record: &MediaRecord) -> Result<()> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO media (id, type, path, width, height, md5, dct_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let result = stmt.execute(rusqlite::params![
                record.id,
                media_type_to_i64(record.media_type),
                record.relative_path,
                record.width,
                record.height,
                record.md5,
                record.dct_hash.0 as i64,
            ]);
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(Error::Conflict(PathBuf::from(&record.relative_path)))
                }
                Err(e) => Err(Error::from(e)),
            }
        })
    }

    /// Remove a record (and, by the caller's contract, its VideoIndexFile sidecar).
    pub fn remove(&self, id: MediaId) -> Result<()> {
        self.with_connection(|conn| {
            let changed = conn.execute("DELETE FROM media WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(Error::NotFound(format!("media id {id}")));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: MediaId) -> Result<Option<MediaRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, type, path, width, height, md5, dct_hash FROM media WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn find_by_path(&self, path: &str) -> Result<Option<MediaRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, type, path, width, height, md5, dct_hash FROM media WHERE path = ?1",
            )?;
            let mut rows = stmt.query([path])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
    }

    /// The next free id: one past the current maximum (ids are "monotonic within a
    /// database"), or `1` for an empty table since id `0` is the tombstone
    /// sentinel.
    pub fn next_id(&self) -> Result<MediaId> {
        self.with_connection(|conn| {
            let max: Option<MediaId> = conn.query_row("SELECT MAX(id) FROM media", [], |row| row.get(0))?;
            Ok(max.unwrap_or(0) + 1)
        })
    }

    /// All records whose type is in `types`, ordered by id ascending ("Load":
    /// video ids are read ordered by id).
    pub fn all_of_types(&self, types: &[MediaType]) -> Result<Vec<MediaRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, type, path, width, height, md5, dct_hash FROM media ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let record = row_to_record(row)?;
                if types.contains(&record.media_type) {
                    out.push(record);
                }
            }
            Ok(out)
        })
    }

    pub fn set_md5(&self, id: MediaId, md5: &str) -> Result<()> {
        self.with_connection(|conn| {
            let changed = conn.execute("UPDATE media SET md5 = ?1 WHERE id = ?2", rusqlite::params![md5, id])?;
            if changed == 0 {
                return Err(Error::NotFound(format!("media id {id}")));
            }
            Ok(())
        })
    }

    /// Move a record to a new relative path. "Moves a file on disk, then
    /// updates the `path` column transactionally; failure leaves the filesystem in a
    /// recoverable state." The filesystem move itself is the caller's responsibility
    /// (this store only owns the database row); `move_file` does both in sequence and
    /// reports the failing path on error, matching the error model's "Moves/renames return a boolean
    /// and log the failing path" (modeled here as a `Result` instead of a bool, per the
    /// ambient error-handling convention: calling code logs and continues).
    pub fn move_path(
        &self,
        id: MediaId,
        old_absolute: &Path,
        new_absolute: &Path,
        new_relative: &str,
    ) -> Result<()> {
        std::fs::rename(old_absolute, new_absolute).map_err(|e| Error::io(old_absolute, e))?;
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE media SET path = ?1 WHERE id = ?2",
                rusqlite::params![new_relative, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("media id {id}")));
            }
            Ok(())
        })
    }

    /// Archive-aware rename: rewrites every contained member's path when `old_archive`
    /// itself moves ("Archive members... move the whole archive and rewrite
    /// every contained child's path").
    pub fn rename_archive(&self, old_archive_rel: &str, new_archive_rel: &str) -> Result<usize> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            let prefix = format!("{old_archive_rel}:");
            let mut stmt =
                tx.prepare("SELECT id, path FROM media WHERE path LIKE ?1")?;
            let like_pattern = format!("{}:%", old_archive_rel.replace('%', "\\%"));
            let mut rows = stmt.query([like_pattern])?;
            let mut updates = Vec::new();
            while let Some(row) = rows.next()? {
                let id: MediaId = row.get(0)?;
                let path: String = row.get(1)?;
                if let Some(member) = path.strip_prefix(&prefix) {
                    updates.push((id, format!("{new_archive_rel}:{member}")));
                }
            }
            drop(rows);
            drop(stmt);
            let count = updates.len();
            for (id, new_path) in updates {
                tx.execute("UPDATE media SET path = ?1 WHERE id = ?2", rusqlite::params![new_path, id])?;
            }
            tx.commit()?;
            Ok(count)
        })
    }

    /// Reclaim unused space and sweep orphan VideoIndexFiles whose id is absent from the
    /// table ("Vacuum").
    pub fn vacuum(&self, video_dir: &Path) -> Result<usize> {
        let live_ids: std::collections::HashSet<MediaId> = self
            .all_of_types(&[MediaType::Image, MediaType::Video, MediaType::Audio])?
            .into_iter()
            .map(|r| r.id)
            .collect();

        self.with_connection(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })?;

        let mut swept = 0;
        if video_dir.is_dir() {
            for entry in std::fs::read_dir(video_dir).map_err(|e| Error::io(video_dir, e))? {
                let entry = entry.map_err(|e| Error::io(video_dir, e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("vdx") {
                    continue;
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<MediaId>().ok())
                else {
                    continue;
                };
                if !live_ids.contains(&id) {
                    std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

fn row_to_record(row: &rusqlite::Row) -> Result<MediaRecord> {
    let dct_hash_raw: i64 = row.get(6)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        media_type: media_type_from_i64(row.get(1)?)?,
        relative_path: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        md5: row.get(5)?,
        // Reinterpret the two's-complement bit pattern without sign-extension (the
        // "Hash wire format").
        dct_hash: crate::hamming::Hamming(dct_hash_raw as u64),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hamming::Hamming;

    fn sample(id: MediaId, path: &str) -> MediaRecord {
        MediaRecord {
            id,
            media_type: MediaType::Image,
            relative_path: path.to_string(),
            width: 100,
            height: 100,
            md5: "a".repeat(32),
            dct_hash: Hamming(0xDEAD_BEEF),
        }
    }

    #[test]
    fn add_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        let record = sample(1, "a.jpg");
        store.add(&record).unwrap();

        let fetched = store.get(1).unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn duplicate_path_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        store.add(&sample(1, "a.jpg")).unwrap();
        let err = store.add(&sample(2, "a.jpg")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn remove_then_get_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        store.add(&sample(1, "a.jpg")).unwrap();
        store.remove(1).unwrap();
        assert_eq!(store.get(1).unwrap(), None);
    }

    #[test]
    fn hash_roundtrips_through_negative_bit_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        let mut record = sample(1, "a.jpg");
        record.dct_hash = Hamming(0xFFFF_FFFF_FFFF_FFFF);
        store.add(&record).unwrap();
        let fetched = store.get(1).unwrap().unwrap();
        assert_eq!(fetched.dct_hash, record.dct_hash);
    }

    #[test]
    fn next_id_starts_at_one_and_tracks_max() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        assert_eq!(store.next_id().unwrap(), 1);
        store.add(&sample(1, "a.jpg")).unwrap();
        store.add(&sample(5, "b.jpg")).unwrap();
        assert_eq!(store.next_id().unwrap(), 6);
    }

    #[test]
    fn find_by_path_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        store.add(&sample(1, "a.jpg")).unwrap();
        assert_eq!(store.find_by_path("a.jpg").unwrap().unwrap().id, 1);
        assert!(store.find_by_path("missing.jpg").unwrap().is_none());
    }

    #[test]
    fn rename_archive_rewrites_every_member() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        store.add(&sample(1, "comics/old.cbz:p1.jpg")).unwrap();
        store.add(&sample(2, "comics/old.cbz:p2.jpg")).unwrap();
        store.add(&sample(3, "unrelated.jpg")).unwrap();

        let count = store.rename_archive("comics/old.cbz", "comics/new.cbz").unwrap();
        assert_eq!(count, 2);

        assert_eq!(store.get(1).unwrap().unwrap().relative_path, "comics/new.cbz:p1.jpg");
        assert_eq!(store.get(3).unwrap().unwrap().relative_path, "unrelated.jpg");
    }
}
