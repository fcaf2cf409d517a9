//! C9: negative-match store.
//!
//! New type for this crate (no existing module owns a blacklist like this); grounded on
//! `examples/original_source/database.h`'s unordered-pair handling for the symmetry
//! requirement, and on the general rwlock-over-shared-state idiom used elsewhere (the concurrency model:
//! "C9's negative-match map uses the shared rwlock"). File format is `neg.dat`:
//! UTF-8 text, one pair per line, two comma-separated 32-hex-char MD5s, LF
//! terminator; duplicates are allowed but ignored on load.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::record::NegativePair;

/// Append-only on disk; loaded lazily into a bidirectional in-memory map.
pub struct NegativeMatchStore {
    path: PathBuf,
    pairs: RwLock<HashSet<NegativePair>>,
    loaded: RwLock<bool>,
}

impl NegativeMatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        NegativeMatchStore {
            path: path.into(),
            pairs: RwLock::new(HashSet::new()),
            loaded: RwLock::new(false),
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        if *self.loaded.read().unwrap() {
            return Ok(());
        }
        let mut loaded = self.loaded.write().unwrap();
        if *loaded {
            return Ok(());
        }
        let mut pairs = self.pairs.write().unwrap();
        if self.path.exists() {
            let text = fs::read_to_string(&self.path).map_err(|e| Error::io(&self.path, e))?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((a, b)) = line.split_once(',') else {
                    log::warn!("skipping malformed negative-match line: {line:?}");
                    continue;
                };
                pairs.insert(NegativePair::new(a.trim(), b.trim()));
            }
        }
        *loaded = true;
        Ok(())
    }

    pub fn contains(&self, md5_a: &str, md5_b: &str) -> Result<bool> {
        self.ensure_loaded()?;
        let pair = NegativePair::new(md5_a, md5_b);
        Ok(self.pairs.read().unwrap().contains(&pair))
    }

    /// Append a new pair to disk and the in-memory set (the scenario where
    /// `add_negative_match(A, B)`).
    pub fn add(&self, md5_a: &str, md5_b: &str) -> Result<()> {
        self.ensure_loaded()?;
        let pair = NegativePair::new(md5_a, md5_b);

        {
            let mut pairs = self.pairs.write().unwrap();
            if !pairs.insert(pair) {
                return Ok(()); // already blacklisted, nothing to append
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        writeln!(file, "{md5_a},{md5_b}").map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.pairs.read().unwrap().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symmetric_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = NegativeMatchStore::new(dir.path().join("neg.dat"));
        store.add(&"a".repeat(32), &"b".repeat(32)).unwrap();

        assert!(store.contains(&"a".repeat(32), &"b".repeat(32)).unwrap());
        assert!(store.contains(&"b".repeat(32), &"a".repeat(32)).unwrap());
        assert!(!store.contains(&"a".repeat(32), &"c".repeat(32)).unwrap());
    }

    #[test]
    fn duplicates_in_file_are_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neg.dat");
        fs::write(&path, format!("{0},{1}\n{0},{1}\n{1},{0}\n", "a".repeat(32), "b".repeat(32))).unwrap();

        let store = NegativeMatchStore::new(path);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neg.dat");
        {
            let store = NegativeMatchStore::new(&path);
            store.add(&"a".repeat(32), &"b".repeat(32)).unwrap();
        }
        let store = NegativeMatchStore::new(&path);
        assert!(store.contains(&"a".repeat(32), &"b".repeat(32)).unwrap());
    }
}
