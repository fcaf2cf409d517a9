//! Archive-member path parsing/rewriting (SPEC_FULL "Supplemented features"), grounded on
//! the sibling `cbzdup` crate (`cbz_reader.rs`) for how zip member paths are
//! read — `CbzReader::next` walks `ZipArchive` entries and reads `file.name()` as the
//! member path. This module only owns the path encoding/decoding side of that (
//! `<archive-relpath>:<member-path>`, colon as the marker); opening and decoding archive
//! members themselves is scanner territory and out of scope.

use std::path::Path;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Split `<archive-relpath>:<member-path>` into its two halves. `None` for a path with no
/// colon (an ordinary, non-archived file).
pub fn split(path: &str) -> Option<(&str, &str)> {
    path.find(':').map(|idx| (&path[..idx], &path[idx + 1..]))
}

pub fn join(archive_relpath: &str, member_path: &str) -> String {
    format!("{archive_relpath}:{member_path}")
}

/// List the member paths of a zip archive on disk, in archive order — used to validate
/// that a rename target still contains the members already recorded for it.
pub fn list_members(archive_path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(archive_path).map_err(|e| Error::io(archive_path, e))?;
    let mut archive = ZipArchive::new(std::io::BufReader::new(file))?;
    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_file() {
            out.push(entry.name().to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_and_join_roundtrip() {
        let joined = join("comics/foo.cbz", "page001.jpg");
        assert_eq!(joined, "comics/foo.cbz:page001.jpg");
        assert_eq!(split(&joined), Some(("comics/foo.cbz", "page001.jpg")));
    }

    #[test]
    fn no_colon_is_not_an_archive_member() {
        assert_eq!(split("photos/beach.jpg"), None);
    }
}
