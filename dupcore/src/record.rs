//! Data model.
//!
//! `MediaRecord`/`MediaType` are grounded on `examples/original_source/database.h`'s
//! `Media::Type` enum (image/video/audio), kept per SPEC_FULL's "supplemented features"
//! so `SearchParams::query_types` can filter by type even though the core never builds an
//! audio index. The rest (`VideoIndexFile`, `MatchRange`, `SearchParams`,
//! `NegativePair`) are new types added for this crate's data model; none of the library's own
//! types model this domain, so they are written fresh in the surrounding general style
//! (plain structs, derived `Debug`/`Clone`/`PartialEq`, newtypes for validated fields).

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::hamming::Hamming;

pub type MediaId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Image,
    Video,
    Audio,
}

/// Identity of one indexed item.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    pub id: MediaId,
    pub media_type: MediaType,
    pub relative_path: String,
    pub width: u32,
    pub height: u32,
    /// 32 hex chars, exact-content hash.
    pub md5: String,
    pub dct_hash: Hamming,
}

impl MediaRecord {
    /// Archive members are encoded as `<archive-relpath>:<member-path>`; the
    /// colon separator is the archive marker. Ordinary paths never contain it because
    /// paths are stored relative to the index root with forward slashes only.
    pub fn is_archive_member(&self) -> bool {
        archive_split(&self.relative_path).is_some()
    }

    pub fn archive_path(&self) -> Option<&str> {
        archive_split(&self.relative_path).map(|(archive, _)| archive)
    }

    pub fn member_path(&self) -> Option<&str> {
        archive_split(&self.relative_path).map(|(_, member)| member)
    }

    /// Directory containing this record: the parent directory of the archive itself for
    /// an archive member, otherwise the parent directory of the path (the
    /// `filter_parent`: "same directory... or same archive").
    pub fn containing_dir(&self) -> &str {
        let path = self.archive_path().unwrap_or(&self.relative_path);
        match path.rfind('/') {
            Some(idx) => &path[..idx],
            None => "",
        }
    }
}

fn archive_split(path: &str) -> Option<(&str, &str)> {
    path.find(':').map(|idx| (&path[..idx], &path[idx + 1..]))
}

/// Ordered sequence of `(frame_number, hash)` pairs for one video, stored as the `.vdx`
/// sidecar file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoIndexFile {
    pub frames: Vec<(u32, Hamming)>,
}

impl VideoIndexFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_for(index_root: &Path, id: MediaId) -> PathBuf {
        index_root.join("video").join(format!("{id}.vdx"))
    }

    /// Binary `.vdx` wire format: `u32 count`, then `count` records of `{u32
    /// frame_number, u64 hash}`, little-endian. No magic number.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&(self.frames.len() as u32).to_le_bytes())?;
        for &(frame_number, hash) in &self.frames {
            w.write_all(&frame_number.to_le_bytes())?;
            w.write_all(&hash.0.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf) as usize;

        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let mut frame_buf = [0u8; 4];
            r.read_exact(&mut frame_buf)?;
            let mut hash_buf = [0u8; 8];
            r.read_exact(&mut hash_buf)?;
            frames.push((u32::from_le_bytes(frame_buf), Hamming(u64::from_le_bytes(hash_buf))));
        }
        Ok(VideoIndexFile { frames })
    }

    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::Error::io(parent, e))?;
        }
        let mut file = std::fs::File::create(path).map_err(|e| crate::error::Error::io(path, e))?;
        self.write_to(&mut file).map_err(|e| crate::error::Error::io(path, e))
    }

    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let mut file = std::fs::File::open(path).map_err(|e| crate::error::Error::io(path, e))?;
        Self::read_from(&mut file).map_err(|e| crate::error::Error::io(path, e))
    }
}

/// Frame-alignment description of a video match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchRange {
    pub src_in: u32,
    pub dst_in: u32,
    pub length: u32,
}

/// Which index algorithm a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    DctImage,
    DctVideo,
    Color,
    Features,
}

/// An unordered pair `{md5_a, md5_b}` meaning "never report these two as matches" (the
/// glossary's "Negative pair"). Canonically ordered so `{a,b}` and `{b,a}` compare and
/// hash equal, mirroring `database.h`'s unordered-pair handling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NegativePair {
    a: String,
    b: String,
}

impl NegativePair {
    pub fn new(md5_a: impl Into<String>, md5_b: impl Into<String>) -> Self {
        Self::canonical(md5_a.into(), md5_b.into())
    }

    fn canonical(a: String, b: String) -> Self {
        if a <= b {
            NegativePair { a, b }
        } else {
            NegativePair { a: b, b: a }
        }
    }

    pub fn contains(&self, md5: &str) -> bool {
        self.a == md5 || self.b == md5
    }

    pub fn other<'a>(&'a self, md5: &str) -> Option<&'a str> {
        if self.a == md5 {
            Some(&self.b)
        } else if self.b == md5 {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Enumerated query configuration.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub algo: Algo,
    pub dct_threshold: u32,
    pub min_frames_matched: u32,
    pub min_frames_near_percent: u32,
    pub skip_frames: u32,
    pub max_matches: Option<usize>,
    pub filter_self: bool,
    pub filter_groups: bool,
    pub filter_parent: bool,
    pub filter_in_path: Option<InPathFilter>,
    pub merge_groups: bool,
    pub expand_groups: bool,
    pub template_match: bool,
    pub negative_match: bool,
    pub verbose: bool,
    pub target: Option<MediaId>,
    pub query_types: Vec<MediaType>,
    pub in_set: Option<Vec<MediaId>>,
    pub min_matches: usize,
}

#[derive(Debug, Clone)]
pub struct InPathFilter {
    pub prefix: String,
    pub negate: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            algo: Algo::DctImage,
            dct_threshold: 7,
            min_frames_matched: 1,
            min_frames_near_percent: 50,
            skip_frames: 0,
            max_matches: None,
            filter_self: true,
            filter_groups: false,
            filter_parent: false,
            filter_in_path: None,
            merge_groups: false,
            expand_groups: false,
            template_match: false,
            negative_match: true,
            verbose: false,
            target: None,
            query_types: vec![MediaType::Image],
            in_set: None,
            min_matches: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_pair_is_symmetric() {
        let ab = NegativePair::new("aaaa", "bbbb");
        let ba = NegativePair::new("bbbb", "aaaa");
        assert_eq!(ab, ba);
    }

    #[test]
    fn archive_member_path_parsing() {
        let rec = MediaRecord {
            id: 1,
            media_type: MediaType::Image,
            relative_path: "comics/foo.cbz:page001.jpg".to_string(),
            width: 100,
            height: 100,
            md5: "0".repeat(32),
            dct_hash: Hamming(0),
        };
        assert!(rec.is_archive_member());
        assert_eq!(rec.archive_path(), Some("comics/foo.cbz"));
        assert_eq!(rec.member_path(), Some("page001.jpg"));
        assert_eq!(rec.containing_dir(), "comics");
    }

    #[test]
    fn plain_path_is_not_archive_member() {
        let rec = MediaRecord {
            id: 1,
            media_type: MediaType::Image,
            relative_path: "photos/beach.jpg".to_string(),
            width: 100,
            height: 100,
            md5: "0".repeat(32),
            dct_hash: Hamming(0),
        };
        assert!(!rec.is_archive_member());
        assert_eq!(rec.containing_dir(), "photos");
    }

    #[test]
    fn vdx_write_then_read_roundtrip() {
        let file = VideoIndexFile {
            frames: vec![(0, Hamming(0)), (1, Hamming(0xDEAD_BEEF)), (99, Hamming(u64::MAX))],
        };
        let mut buf = Vec::new();
        file.write_to(&mut buf).unwrap();
        let loaded = VideoIndexFile::read_from(&mut &buf[..]).unwrap();
        assert_eq!(file, loaded);
    }

    #[test]
    fn vdx_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video").join("7.vdx");
        let file = VideoIndexFile {
            frames: vec![(0, Hamming(0x1234)), (5, Hamming(0xABCD))],
        };
        file.save(&path).unwrap();
        let loaded = VideoIndexFile::load(&path).unwrap();
        assert_eq!(file, loaded);
    }

    #[test]
    fn vdx_empty_file_roundtrip() {
        let file = VideoIndexFile::new();
        let mut buf = Vec::new();
        file.write_to(&mut buf).unwrap();
        let loaded = VideoIndexFile::read_from(&mut &buf[..]).unwrap();
        assert_eq!(file, loaded);
    }
}
