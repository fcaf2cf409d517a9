//! Crate-wide error kind.
//!
//! A `thiserror` enum with `#[from]` conversions from each subsystem's own error type
//! (sqlite, bincode, image, video, zip), threaded through the record store, the indices
//! and the video decoder alike, so callers deal with a single `Error`/`Result`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: path already indexed: {0}")]
    Conflict(PathBuf),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("cancelled")]
    Cancelled,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("(de)serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("video decode error: {0}")]
    Video(#[from] crate::video_decoder::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
