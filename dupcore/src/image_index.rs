//! Image-hash index: dense parallel arrays of `(media_id, dct_hash)` plus a vantage-point
//! tree over them. `media_id == 0` is reserved as the tombstone for a removed slot, since
//! ids are allocated starting at 1. `add`/`remove`/`save`/`load` take the write lock;
//! `find`/`slice` take the read lock.

use std::sync::RwLock;

use crate::hamming::Hamming;
use crate::record::MediaId;
use crate::vptree::{Stats, VpTree};

const TOMBSTONE: MediaId = 0;

struct Inner {
    media_ids: Vec<MediaId>,
    hashes: Vec<Hamming>,
    tree: VpTree<u32>,
}

impl Inner {
    fn rebuild_tree(&mut self) {
        let items: Vec<(Hamming, u32)> = self
            .media_ids
            .iter()
            .zip(&self.hashes)
            .enumerate()
            .filter_map(|(idx, (&id, &hash))| {
                if id == TOMBSTONE {
                    None
                } else {
                    Some((hash, idx as u32))
                }
            })
            .collect();
        self.tree = VpTree::build(items);
    }
}

pub struct ImageIndex {
    inner: RwLock<Inner>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageIndex {
    pub fn new() -> Self {
        ImageIndex {
            inner: RwLock::new(Inner {
                media_ids: Vec::new(),
                hashes: Vec::new(),
                tree: VpTree::build(vec![]),
            }),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = (MediaId, Hamming)>) -> Self {
        let index = Self::new();
        index.add(records);
        index
    }

    /// Append to the dense arrays, then rebuild the tree.
    pub fn add(&self, records: impl IntoIterator<Item = (MediaId, Hamming)>) {
        let mut inner = self.inner.write().unwrap();
        for (id, hash) in records {
            debug_assert_ne!(id, TOMBSTONE, "media ids start at 1");
            inner.media_ids.push(id);
            inner.hashes.push(hash);
        }
        inner.rebuild_tree();
    }

    /// Tombstone matching entries (`media_id = 0, hash = 0`) and rebuild the tree: the
    /// tree query ignores tombstones because they're filtered out of `rebuild_tree`'s item
    /// list before the tree is even built.
    pub fn remove(&self, ids: &[MediaId]) {
        let mut inner = self.inner.write().unwrap();
        for slot in 0..inner.media_ids.len() {
            if ids.contains(&inner.media_ids[slot]) {
                inner.media_ids[slot] = TOMBSTONE;
                inner.hashes[slot] = Hamming(0);
            }
        }
        inner.rebuild_tree();
    }

    /// Query the tree with `needle_hash` and `threshold`; return `(media_id, distance)`
    /// pairs sorted ascending by distance.
    pub fn find(&self, needle_hash: Hamming, threshold: u32) -> Vec<(MediaId, u32)> {
        let inner = self.inner.read().unwrap();
        inner
            .tree
            .find_within(needle_hash, threshold)
            .into_iter()
            .map(|(slot, dist)| (inner.media_ids[slot as usize], dist))
            .collect()
    }

    /// A new index containing only entries whose id is in `id_set`, with its own tree;
    /// caller owns and deletes it.
    pub fn slice(&self, id_set: &std::collections::HashSet<MediaId>) -> ImageIndex {
        let inner = self.inner.read().unwrap();
        let filtered = inner
            .media_ids
            .iter()
            .zip(&inner.hashes)
            .filter(|(id, _)| id_set.contains(id))
            .map(|(&id, &hash)| (id, hash));
        ImageIndex::from_records(filtered)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.media_ids.iter().filter(|&&id| id != TOMBSTONE).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        self.inner.read().unwrap().tree.stats()
    }

    /// Serialize the dense `(media_id, hash)` arrays to `path`, normally somewhere under a
    /// disposable cache directory: on a cache miss or corrupt snapshot the caller just
    /// rebuilds from the record store, so this uses `bincode` over a plain DTO rather than
    /// a format meant to be a durable source of truth.
    pub fn save_snapshot(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let inner = self.inner.read().unwrap();
        let snapshot = Snapshot {
            media_ids: inner.media_ids.clone(),
            hashes: inner.hashes.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::Error::io(parent, e))?;
        }
        let file = std::fs::File::create(path).map_err(|e| crate::error::Error::io(path, e))?;
        bincode::serialize_into(file, &snapshot)?;
        Ok(())
    }

    /// Load a snapshot written by `save_snapshot`, rebuilding the tree from its arrays.
    /// Returns `Ok(None)` if there's no snapshot at `path` yet (first run); a malformed
    /// snapshot is `Error::Corrupt` and the caller falls back to rebuilding from the record
    /// store.
    pub fn load_snapshot(path: &std::path::Path) -> crate::error::Result<Option<ImageIndex>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(path).map_err(|e| crate::error::Error::io(path, e))?;
        let snapshot: Snapshot = bincode::deserialize_from(file)
            .map_err(|e| crate::error::Error::Corrupt(format!("image index snapshot at {path:?}: {e}")))?;
        Ok(Some(ImageIndex::from_records(
            snapshot.media_ids.into_iter().zip(snapshot.hashes),
        )))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    media_ids: Vec<MediaId>,
    hashes: Vec<Hamming>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find_returns_ascending_by_distance_within_threshold() {
        let index = ImageIndex::from_records([
            (1, Hamming(0x0000_0000_0000_0000)),
            (2, Hamming(0xFFFF_FFFF_FFFF_FFFF)),
            (3, Hamming(0x0000_0000_0000_000F)),
            (4, Hamming(0xF0F0_F0F0_F0F0_F0F0)),
        ]);

        assert_eq!(index.find(Hamming(0), 5), vec![(1, 0)]);
        assert_eq!(index.find(Hamming(0), 17), vec![(1, 0), (3, 4)]);
    }

    #[test]
    fn add_then_remove_hides_ids() {
        let index = ImageIndex::new();
        index.add([(1, Hamming(0)), (2, Hamming(1)), (3, Hamming(2))]);
        index.remove(&[2]);

        let found = index.find(Hamming(0), 10);
        assert!(!found.iter().any(|&(id, _)| id == 2));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn slice_never_yields_ids_outside_set() {
        let index = ImageIndex::from_records((1..=50u32).map(|id| (id, Hamming(id as u64))));
        let keep: std::collections::HashSet<u32> = (1..=10u32).collect();
        let sliced = index.slice(&keep);

        for q in 0..64u64 {
            for (id, _) in sliced.find(Hamming(q), 64) {
                assert!(keep.contains(&id));
            }
        }
    }

    #[test]
    fn snapshot_save_then_load_preserves_find() {
        let index = ImageIndex::from_records((1..=200u32).map(|id| (id, Hamming(id as u64 * 0x1000))));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("image.snapshot");
        index.save_snapshot(&path).unwrap();

        let loaded = ImageIndex::load_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), index.len());
        for q in [Hamming(0), Hamming(0x5000), Hamming(u64::MAX)] {
            assert_eq!(index.find(q, 20), loaded.find(q, 20));
        }
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("missing.snapshot");
        assert!(ImageIndex::load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn empty_index_behavior() {
        let index = ImageIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.find(Hamming(0), 64), vec![]);
        assert_eq!(index.slice(&Default::default()).len(), 0);
    }
}
