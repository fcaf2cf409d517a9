//! On-disk layout under an index directory. New for this crate; no existing
//! module owns path layout this way (`repo.rs` manages numbered debug-dump
//! directories, a different concern), so this is written in the surrounding general
//! path-handling style (`PathBuf` joins, no string concatenation) rather than adapted
//! from a specific file.

use std::path::{Path, PathBuf};

use crate::record::MediaId;

/// The directory for one named index under an index root:
/// ```text
/// <index-root>/<idx-name>/
///   media0.db
///   media<N>.db
///   video/<id>.vdx
///   cache/
///   neg.dat
/// ```
#[derive(Debug, Clone)]
pub struct IndexLayout {
    root: PathBuf,
}

impl IndexLayout {
    pub fn new(index_root: impl Into<PathBuf>, idx_name: &str) -> Self {
        IndexLayout {
            root: index_root.into().join(idx_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `media0.db`: the record store (C7).
    pub fn record_store_db(&self) -> PathBuf {
        self.root.join("media0.db")
    }

    /// `media<N>.db`: per-algorithm auxiliary table, `n` being the algorithm index.
    pub fn algo_db(&self, n: u32) -> PathBuf {
        self.root.join(format!("media{n}.db"))
    }

    pub fn video_dir(&self) -> PathBuf {
        self.root.join("video")
    }

    pub fn video_index_file(&self, id: MediaId) -> PathBuf {
        self.video_dir().join(format!("{id}.vdx"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn negative_match_file(&self) -> PathBuf {
        self.root.join("neg.dat")
    }

    /// Environment-aware resolution of the index root: `CBIRD_INDEX_DIR` if set,
    /// otherwise the process's current working directory.
    pub fn resolve_index_root(explicit: Option<PathBuf>) -> std::io::Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p);
        }
        if let Ok(dir) = std::env::var("CBIRD_INDEX_DIR") {
            return Ok(PathBuf::from(dir));
        }
        std::env::current_dir()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = IndexLayout::new("/data/index", "main");
        assert_eq!(layout.root(), Path::new("/data/index/main"));
        assert_eq!(
            layout.record_store_db(),
            Path::new("/data/index/main/media0.db")
        );
        assert_eq!(layout.algo_db(1), Path::new("/data/index/main/media1.db"));
        assert_eq!(
            layout.video_index_file(42),
            Path::new("/data/index/main/video/42.vdx")
        );
        assert_eq!(
            layout.negative_match_file(),
            Path::new("/data/index/main/neg.dat")
        );
    }
}
