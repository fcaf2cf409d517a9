//! `cbird`: command line front end for the duplicate-media core.
//!
//! Grounded on the `videodup.rs` bin: a clap `Cli` parsed from either
//! `argv` or, when invoked bare, a project-local args file (`.imgduprc` there,
//! `.cbirdrc` here); `init_eyre`/`init_logger` for error reporting and logging; a
//! `termination::Cookie` checked cooperatively between items in the scan loop.
//! Unlike `videodup.rs` this binary has several subcommands instead of one
//! implicit pipeline, so the `Cli`/`Command` shape instead follows the general
//! sibling `cbz-extractor.rs`/`hasher.rs` bins, which are themselves small
//! single-purpose clap programs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, Context};

use dupcore::hamming::Hamming;
use dupcore::image_index::ImageIndex;
use dupcore::orchestrator::{MatchGroup, Orchestrator};
use dupcore::record::{Algo, InPathFilter, MediaId, MediaRecord, MediaType, SearchParams, VideoIndexFile};
use dupcore::repo_layout::IndexLayout;
use dupcore::store::{NegativeMatchStore, RecordStore};
use dupcore::video_decoder::VideoDecoder;
use dupcore::video_index::VideoIndex;

mod init;
mod termination;

const ARGS_FILE: &str = ".cbirdrc";

/// Errors local to this binary (as opposed to `dupcore::Error`, which the core
/// library raises), grounded on the existing bins (`hasher_img.rs`,
/// `hasher_video.rs`) each defining a small `thiserror` enum for their own
/// CLI-level failures rather than reusing the library's error type.
#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("no indexed item matches '{0}'")]
    NotFound(String),
}

#[derive(Parser, Debug)]
#[command(name = "cbird")]
/// Finds duplicate and near-duplicate images and videos by perceptual hash.
///
/// Search runs on `rayon`, so the `RAYON_NUM_THREADS` environment variable might
/// be of interest.
struct Cli {
    /// Root directory holding named indexes. Defaults to `CBIRD_INDEX_DIR`, then
    /// the current directory.
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    /// Name of the index to use under the index root.
    #[arg(long, global = true, default_value = "main")]
    index_name: String,

    /// Additionally write logs to this file.
    #[arg(long, global = true)]
    logfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recursively scan directories for new images and videos and add them.
    Add {
        /// Directories to scan.
        #[arg(required = true, num_args = 1..)]
        dirs: Vec<PathBuf>,

        /// Only add up to this many new files in this run.
        #[arg(long, default_value_t = usize::MAX)]
        limit: usize,
    },
    /// Drop one item from the index, by its indexed path or its numeric id.
    Remove { target: String },
    /// Find duplicate groups among every indexed item of the queried type(s).
    Similar {
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Find matches for one specific indexed item, given its indexed path.
    SimilarTo {
        path: String,
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Reclaim space in the record store and sweep orphaned video sidecars.
    Vacuum,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum AlgoArg {
    DctImage,
    DctVideo,
    Color,
    Features,
}

impl From<AlgoArg> for Algo {
    fn from(value: AlgoArg) -> Self {
        match value {
            AlgoArg::DctImage => Algo::DctImage,
            AlgoArg::DctVideo => Algo::DctVideo,
            AlgoArg::Color => Algo::Color,
            AlgoArg::Features => Algo::Features,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum MediaTypeArg {
    Image,
    Video,
    Audio,
}

impl From<MediaTypeArg> for MediaType {
    fn from(value: MediaTypeArg) -> Self {
        match value {
            MediaTypeArg::Image => MediaType::Image,
            MediaTypeArg::Video => MediaType::Video,
            MediaTypeArg::Audio => MediaType::Audio,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct SearchArgs {
    /// Which algorithm to search with.
    #[arg(long, value_enum, default_value_t = AlgoArg::DctImage)]
    algo: AlgoArg,

    /// Maximum Hamming distance for two hashes to be considered a match.
    #[arg(long, default_value_t = 7)]
    threshold: u32,

    /// (dct-video) minimum number of frames that must line up for a match.
    #[arg(long, default_value_t = 1)]
    min_frames_matched: u32,

    /// (dct-video) minimum percentage of matched frames in ascending order.
    #[arg(long, default_value_t = 50)]
    min_frames_near_percent: u32,

    /// (dct-video) ignore this many frames at the start and end of each video.
    #[arg(long, default_value_t = 0)]
    skip_frames: u32,

    /// Cap the number of candidates kept per group.
    #[arg(long)]
    max_matches: Option<usize>,

    /// Keep a group's own needle in its candidate list instead of dropping it.
    #[arg(long)]
    no_filter_self: bool,

    /// Drop candidates that already appeared in an earlier, bigger group.
    #[arg(long)]
    filter_groups: bool,

    /// Drop candidates sharing a parent directory (or archive) with the needle.
    #[arg(long)]
    filter_parent: bool,

    /// Only keep candidates under this path prefix.
    #[arg(long)]
    in_path: Option<String>,

    /// Invert `--in-path`: only keep candidates NOT under the prefix.
    #[arg(long, requires = "in_path")]
    in_path_negate: bool,

    /// Merge groups that share a candidate into one.
    #[arg(long)]
    merge_groups: bool,

    /// Expand each group of N candidates into its pairwise combinations.
    #[arg(long)]
    expand_groups: bool,

    /// Re-check candidates geometrically with feature-point template matching.
    #[arg(long)]
    template_match: bool,

    /// Keep candidates recorded as a negative (non-)match instead of dropping them.
    #[arg(long)]
    no_negative_match: bool,

    /// Log per-candidate filtering decisions.
    #[arg(long)]
    verbose: bool,

    /// Restrict the search to matches against one specific media id.
    #[arg(long)]
    target: Option<MediaId>,

    /// Which media types to use as needles (repeatable). Defaults to images.
    #[arg(long, value_enum)]
    query_type: Vec<MediaTypeArg>,

    /// Only keep groups with at least this many candidates.
    #[arg(long, default_value_t = 0)]
    min_matches: usize,
}

impl SearchArgs {
    fn to_params(&self) -> SearchParams {
        SearchParams {
            algo: self.algo.into(),
            dct_threshold: self.threshold,
            min_frames_matched: self.min_frames_matched,
            min_frames_near_percent: self.min_frames_near_percent,
            skip_frames: self.skip_frames,
            max_matches: self.max_matches,
            filter_self: !self.no_filter_self,
            filter_groups: self.filter_groups,
            filter_parent: self.filter_parent,
            filter_in_path: self.in_path.clone().map(|prefix| InPathFilter {
                prefix,
                negate: self.in_path_negate,
            }),
            merge_groups: self.merge_groups,
            expand_groups: self.expand_groups,
            template_match: self.template_match,
            negative_match: !self.no_negative_match,
            verbose: self.verbose,
            target: self.target,
            query_types: if self.query_type.is_empty() {
                vec![MediaType::Image]
            } else {
                self.query_type.iter().map(|&t| t.into()).collect()
            },
            in_set: None,
            min_matches: self.min_matches,
        }
    }
}

fn cli_arguments() -> eyre::Result<Cli> {
    let mut args: Vec<OsString> = std::env::args_os().collect();

    if args.len() == 1 {
        if let Some(flags) = read_optional_file(ARGS_FILE)
            .wrap_err_with(|| format!("Could not read config file at: {ARGS_FILE}"))?
        {
            args.extend(flags.split_whitespace().map(OsString::from));
        }
    }

    Ok(Cli::parse_from(args))
}

/// Try to read the file, return `None` if it doesn't exist (mirrors `fsutils::read_optional_file`).
fn read_optional_file(path: impl AsRef<Path>) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
        Ok(s) => Ok(Some(s)),
    }
}

fn main() -> eyre::Result<()> {
    init::init_eyre()?;
    let cli = cli_arguments()?;
    // `--verbose` lives on `SearchArgs` (spec §3's `SearchParams.verbose`) rather than on
    // `Cli` itself, since only `similar`/`similar-to` take it; other subcommands never
    // raise the log level above the default.
    let verbose = matches!(
        &cli.command,
        Command::Similar { search } | Command::SimilarTo { search, .. } if search.verbose
    );
    init::init_logger(cli.logfile.as_deref(), verbose)?;

    let index_root = IndexLayout::resolve_index_root(cli.index_dir.clone())
        .wrap_err("failed to resolve the index root")?;
    let layout = IndexLayout::new(index_root, &cli.index_name);

    match cli.command {
        Command::Add { dirs, limit } => scan::run(&layout, dirs, limit),
        Command::Remove { target } => commands::remove(&layout, &target),
        Command::Similar { search } => commands::similar(&layout, &search),
        Command::SimilarTo { path, search } => commands::similar_to(&layout, &path, &search),
        Command::Vacuum => commands::vacuum(&layout),
    }
}

/// Opens the on-disk pieces of one index and assembles an `Orchestrator` over
/// them, building C1/C4's in-memory trees from C7's table on every run and
/// persisting C3's dense arrays between runs via `ImageIndex::save_snapshot` under
/// `cache/`.
mod open {
    use super::*;

    pub struct Opened {
        pub orchestrator: Orchestrator,
    }

    pub fn open(layout: &IndexLayout) -> eyre::Result<Opened> {
        let store = RecordStore::open(layout.record_store_db())
            .wrap_err("failed to open the record store")?;
        let negative_matches = NegativeMatchStore::new(layout.negative_match_file());

        let image_index = load_or_rebuild_image_index(layout, &store)?;

        let video_index = VideoIndex::new();
        let videos = store
            .all_of_types(&[MediaType::Video])
            .wrap_err("failed to list indexed videos")?;
        video_index.add(videos.into_iter().map(|r| r.id));

        let media_root = std::env::current_dir().wrap_err("failed to get the current directory")?;
        let orchestrator = Orchestrator::new(
            store,
            negative_matches,
            Arc::new(image_index),
            Arc::new(video_index),
            layout.video_dir(),
            media_root,
        );

        Ok(Opened { orchestrator })
    }

    fn load_or_rebuild_image_index(layout: &IndexLayout, store: &RecordStore) -> eyre::Result<ImageIndex> {
        let snapshot_path = layout.cache_dir().join("image_index.snapshot");
        let loaded = match ImageIndex::load_snapshot(&snapshot_path) {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!("image index snapshot at {snapshot_path:?} is corrupt, rebuilding: {err}");
                None
            }
        };

        if let Some(index) = loaded {
            return Ok(index);
        }

        let images = store
            .all_of_types(&[MediaType::Image])
            .wrap_err("failed to list indexed images")?;
        Ok(ImageIndex::from_records(images.into_iter().map(|r| (r.id, r.dct_hash))))
    }

    /// Called after any mutation so the next run's snapshot load stays current.
    pub fn save_image_snapshot(layout: &IndexLayout, index: &ImageIndex) -> eyre::Result<()> {
        let path = layout.cache_dir().join("image_index.snapshot");
        index
            .save_snapshot(&path)
            .wrap_err("failed to save the image index snapshot")
    }
}

/// The `add` subcommand: walk directories, hash and index new files.
mod scan {
    use super::*;

    pub fn run(layout: &IndexLayout, dirs: Vec<PathBuf>, limit: usize) -> eyre::Result<()> {
        let term = termination::Cookie::new().wrap_err("failed to install the termination handler")?;
        let opened = open::open(layout)?;
        let orchestrator = &opened.orchestrator;

        log::info!(
            "Scanning {} director{}",
            dirs.len(),
            if dirs.len() == 1 { "y" } else { "ies" }
        );
        let files = walk_files(&dirs).wrap_err("failed to list files to scan")?;
        log::info!("Found {} candidate file(s)", files.len());

        let cwd = std::env::current_dir().wrap_err("failed to get the current directory")?;

        let mut added = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for path in files {
            if added >= limit {
                log::info!("Reached the limit of {limit} new file(s)");
                break;
            }
            if term.is_terminating() {
                log::warn!("Termination signal received, stopping the scan");
                break;
            }

            let Some(media_type) = classify(&path) else {
                skipped += 1;
                continue;
            };

            log::debug!("Processing: {}", path.display());
            match add_one(orchestrator, layout, &cwd, &path, media_type) {
                Ok(true) => added += 1,
                Ok(false) => skipped += 1,
                Err(err) => {
                    log::error!("Failed to add '{}': {err:?}", path.display());
                    failed += 1;
                }
            }
        }

        open::save_image_snapshot(layout, &orchestrator.image_index)?;

        log::info!("Added {added}, skipped {skipped}, failed {failed}");
        if failed > 0 {
            eyre::bail!("{failed} file(s) failed to be added, see the log above");
        }
        Ok(())
    }

    /// `Ok(true)` if newly added, `Ok(false)` if it was already indexed (a
    /// `Conflict`, which is reported and skipped rather than failing the scan,
    /// per the store's "Conflict... add reports and skips" behavior).
    fn add_one(
        orchestrator: &Orchestrator,
        layout: &IndexLayout,
        cwd: &Path,
        path: &Path,
        media_type: MediaType,
    ) -> eyre::Result<bool> {
        let relative_path = relativize(path, cwd);
        let md5 = file_md5(path).wrap_err("failed to checksum the file")?;

        let (width, height, dct_hash, frames) = match media_type {
            MediaType::Image => {
                let img = image::open(path).wrap_err("failed to decode the image")?;
                let hash = dupcore::dct::dct_hash(&img);
                (img.width(), img.height(), hash, None)
            }
            MediaType::Video => {
                let mut decoder = VideoDecoder::open(path).wrap_err("failed to open the video")?;
                let (width, height) = (decoder.width(), decoder.height());
                let mut frames = Vec::new();
                decoder
                    .for_each_frame(|frame| frames.push((frame.frame_number, frame.hash)))
                    .wrap_err("failed to decode the video")?;
                let representative = frames.first().map(|&(_, h)| h).unwrap_or(Hamming::ZERO);
                (width, height, representative, Some(frames))
            }
            MediaType::Audio => unreachable!("classify() never returns MediaType::Audio"),
        };

        let id = orchestrator
            .store
            .next_id()
            .wrap_err("failed to allocate a media id")?;
        let record = MediaRecord {
            id,
            media_type,
            relative_path,
            width,
            height,
            md5,
            dct_hash,
        };

        match orchestrator.store.add(&record) {
            Ok(()) => {}
            Err(dupcore::Error::Conflict(existing)) => {
                log::warn!("Already indexed: {}", existing.display());
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        match media_type {
            MediaType::Image => orchestrator.image_index.add([(id, dct_hash)]),
            MediaType::Video => {
                orchestrator.video_index.add([id]);
                let file = VideoIndexFile {
                    frames: frames.unwrap_or_default(),
                };
                file.save(&layout.video_index_file(id))
                    .wrap_err("failed to save the video index sidecar")?;
            }
            MediaType::Audio => {}
        }

        Ok(true)
    }

    fn classify(path: &Path) -> Option<MediaType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff" => Some(MediaType::Image),
            "mp4" | "mkv" | "avi" | "webm" | "mov" | "m4v" | "flv" => Some(MediaType::Video),
            _ => None,
        }
    }

    fn file_md5(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    /// Paths are stored relative to the current directory at the time of `add`
    /// (mirroring the `SimplePathBuf` convention), normalized to
    /// forward slashes; a path outside the current directory's tree is stored
    /// as its absolute form instead.
    fn relativize(path: &Path, cwd: &Path) -> String {
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let relative = absolute.strip_prefix(cwd).unwrap_or(&absolute);
        relative.to_string_lossy().replace('\\', "/")
    }

    /// Recursively collects every regular file under `dirs` (the existing
    /// `fsutils::all_files` only reads one level; scanning a whole media tree
    /// needs the recursive version noted as a TODO there).
    fn walk_files(dirs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack: Vec<PathBuf> = dirs.to_vec();
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

/// `remove`/`similar`/`similar-to`/`vacuum`.
mod commands {
    use super::*;

    pub fn remove(layout: &IndexLayout, target: &str) -> eyre::Result<()> {
        let opened = open::open(layout)?;
        let orchestrator = &opened.orchestrator;

        let record = resolve_target(&orchestrator.store, target)?
            .ok_or_else(|| CliError::NotFound(target.to_string()))?;

        orchestrator
            .store
            .remove(record.id)
            .wrap_err("failed to remove the record")?;

        match record.media_type {
            MediaType::Image => orchestrator.image_index.remove(&[record.id]),
            MediaType::Video => {
                orchestrator.video_index.remove(&[record.id]);
                let sidecar = layout.video_index_file(record.id);
                if sidecar.exists() {
                    std::fs::remove_file(&sidecar)
                        .wrap_err_with(|| format!("failed to remove sidecar {sidecar:?}"))?;
                }
            }
            MediaType::Audio => {}
        }

        open::save_image_snapshot(layout, &orchestrator.image_index)?;
        log::info!("Removed '{}'", record.relative_path);
        Ok(())
    }

    fn resolve_target(store: &RecordStore, target: &str) -> eyre::Result<Option<MediaRecord>> {
        if let Ok(id) = target.parse::<MediaId>() {
            if let Some(record) = store.get(id)? {
                return Ok(Some(record));
            }
        }
        Ok(store.find_by_path(target)?)
    }

    pub fn similar(layout: &IndexLayout, search: &SearchArgs) -> eyre::Result<()> {
        let opened = open::open(layout)?;
        let params = search.to_params();
        let groups = opened.orchestrator.similar(&params).wrap_err("search failed")?;
        print_groups(&groups);
        Ok(())
    }

    pub fn similar_to(layout: &IndexLayout, path: &str, search: &SearchArgs) -> eyre::Result<()> {
        let opened = open::open(layout)?;
        let needle = opened
            .orchestrator
            .store
            .find_by_path(path)
            .wrap_err("failed to look up the needle")?
            .ok_or_else(|| CliError::NotFound(path.to_string()))?;

        let params = search.to_params();
        let group = opened
            .orchestrator
            .similar_to(&needle, &params)
            .wrap_err("search failed")?;
        print_groups(std::slice::from_ref(&group));
        Ok(())
    }

    pub fn vacuum(layout: &IndexLayout) -> eyre::Result<()> {
        let opened = open::open(layout)?;
        let removed = opened
            .orchestrator
            .store
            .vacuum(&layout.video_dir())
            .wrap_err("vacuum failed")?;
        log::info!("Vacuum removed {removed} orphaned sidecar file(s)");
        Ok(())
    }

    fn print_groups(groups: &[MatchGroup]) {
        if groups.iter().all(|g| g.candidates.is_empty()) {
            println!("No duplicate groups found.");
            return;
        }
        for group in groups {
            if group.candidates.is_empty() {
                continue;
            }
            println!("{}", group.needle.relative_path);
            for candidate in &group.candidates {
                match candidate.range {
                    Some(range) => println!(
                        "  {} (distance {}, frames {}..{} len {})",
                        candidate.record.relative_path,
                        candidate.distance,
                        range.src_in,
                        range.dst_in,
                        range.length
                    ),
                    None => println!("  {} (distance {})", candidate.record.relative_path, candidate.distance),
                }
                if let Some(roi) = candidate.roi {
                    println!("    roi: {:?}", roi.0);
                }
            }
        }
    }
}
