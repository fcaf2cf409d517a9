//! C7: persistent record store.
//!
//! Submodules:
//! - `sqlite` — the `media0.db`/`media<N>.db` connection handling, grounded on the
//!   `src/bktree/sqlite/sql.rs`.
//! - `negative` — C9, the negative-match blacklist.
//! - `archive` — archive-member (`<archive>:<member>`) path rewriting for move/rename.

pub mod archive;
pub mod negative;
pub mod sqlite;

pub use negative::NegativeMatchStore;
pub use sqlite::RecordStore;
