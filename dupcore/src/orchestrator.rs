//! Query orchestration: runs a needle set against the image/video indices and applies
//! per-group and cross-group result filtering.
//!
//! The needle set is searched via `rayon`'s `par_iter()`, each worker writing its own
//! slot of a pre-sized results vector, rather than a hand-rolled atomic counter.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::hamming::Hamming;
use crate::image_index::ImageIndex;
use crate::record::{Algo, MatchRange, MediaId, MediaRecord, MediaType, SearchParams, VideoIndexFile};
use crate::store::{NegativeMatchStore, RecordStore};
use crate::template_match::{self, TemplateMatcher};
use crate::video_index::VideoIndex;

/// One candidate match within a group, paired with the needle that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub record: MediaRecord,
    pub distance: u32,
    /// Frame-alignment info, present only for `Algo::DctVideo` matches; `None` for
    /// image/color/feature matches, which have no frame axis.
    pub range: Option<MatchRange>,
    /// Set when `params.template_match` ran and this candidate passed geometric
    /// validation.
    pub roi: Option<template_match::Roi>,
    pub transform: Option<template_match::AffineTransform>,
}

/// A needle plus its matched candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchGroup {
    pub needle: MediaRecord,
    pub candidates: Vec<Match>,
}

pub struct Orchestrator {
    pub store: RecordStore,
    pub negative_matches: NegativeMatchStore,
    pub image_index: Arc<ImageIndex>,
    pub video_index: Arc<VideoIndex>,
    pub pool: crate::threadpool::SharedPool,
    /// `<index-root>/<idx-name>/video/`, used to load each video's `.vdx` sidecar on
    /// demand when building or querying the video frame index.
    video_dir: PathBuf,
    /// Base directory `MediaRecord::relative_path` is relative to, used to open image
    /// files on demand for `params.template_match`. Normally the current
    /// directory at the time of the query, matching the convention `relative_path` was
    /// stored under (see DESIGN.md's "relative_path anchor" decision).
    media_root: PathBuf,
    template_matcher: TemplateMatcher,
}

impl Orchestrator {
    pub fn new(
        store: RecordStore,
        negative_matches: NegativeMatchStore,
        image_index: Arc<ImageIndex>,
        video_index: Arc<VideoIndex>,
        video_dir: PathBuf,
        media_root: PathBuf,
    ) -> Self {
        Orchestrator {
            store,
            negative_matches,
            image_index,
            video_index,
            pool: crate::threadpool::SharedPool::default_sized(),
            video_dir,
            media_root,
            template_matcher: TemplateMatcher::new(),
        }
    }

    /// Read one video's `.vdx` sidecar from disk; logged and skipped (not fatal) if
    /// missing or corrupt rather than failing the whole query.
    fn load_video_file(&self, media_id: MediaId) -> Option<VideoIndexFile> {
        let path = self.video_dir.join(format!("{media_id}.vdx"));
        match VideoIndexFile::load(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                log::warn!("failed to load video index file for media_id={media_id}: {err}");
                None
            }
        }
    }

    /// Dispatches a `DctVideo` needle to the right search: `find_frame` for an image
    /// needle, `find_video` for a video needle, each optionally restricted to
    /// `params.target` via the per-target cache.
    fn find_video_matches(
        &self,
        index: &VideoIndex,
        needle: &MediaRecord,
        params: &SearchParams,
    ) -> Vec<crate::video_index::VideoMatch> {
        if needle.media_type == MediaType::Video {
            let Some(needle_file) = self.load_video_file(needle.id) else {
                return Vec::new();
            };
            match params.target {
                Some(target) => index.find_video_for_target(
                    target,
                    &needle_file,
                    params.dct_threshold,
                    params.skip_frames,
                    params.min_frames_matched,
                    params.min_frames_near_percent,
                    |id| self.load_video_file(id),
                ),
                None => index.find_video(
                    &needle_file,
                    params.dct_threshold,
                    params.skip_frames,
                    params.min_frames_matched,
                    params.min_frames_near_percent,
                    |id| self.load_video_file(id),
                ),
            }
        } else {
            match params.target {
                Some(target) => index.find_frame_for_target(
                    target,
                    needle.dct_hash,
                    params.dct_threshold,
                    params.skip_frames,
                    0,
                    |id| self.load_video_file(id),
                ),
                None => index.find_frame(
                    needle.dct_hash,
                    params.dct_threshold,
                    params.skip_frames,
                    0,
                    |id| self.load_video_file(id),
                ),
            }
        }
    }

    /// Resolve the needle set from `params`, search it, and filter the resulting groups.
    pub fn similar(&self, params: &SearchParams) -> crate::error::Result<Vec<MatchGroup>> {
        let needles = self.resolve_needles(params)?;

        let by_id: HashMap<MediaId, MediaRecord> = self
            .store
            .all_of_types(&[MediaType::Image, MediaType::Video, MediaType::Audio])?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut groups: Vec<MatchGroup> = self.search_needles(&needles, &by_id, params)?;

        if params.template_match {
            for group in &mut groups {
                self.apply_template_match(group);
            }
        }

        for group in &mut groups {
            self.apply_group_filters(group, params)?;
        }
        groups.retain(|g| !g.candidates.is_empty() || !params.filter_self);

        let mut groups = self.apply_cross_group_filters(groups, params);
        groups.sort_by(|a, b| a.needle.relative_path.cmp(&b.needle.relative_path));
        Ok(groups)
    }

    /// Same as `similar` but for one explicit needle, skipping needle resolution.
    pub fn similar_to(
        &self,
        needle: &MediaRecord,
        params: &SearchParams,
    ) -> crate::error::Result<MatchGroup> {
        let by_id: HashMap<MediaId, MediaRecord> = self
            .store
            .all_of_types(&[MediaType::Image, MediaType::Video, MediaType::Audio])?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut groups = self.search_needles(std::slice::from_ref(needle), &by_id, params)?;
        let mut group = groups.pop().expect("search_needles returns one group per needle");
        if params.template_match {
            self.apply_template_match(&mut group);
        }
        self.apply_group_filters(&mut group, params)?;
        Ok(group)
    }

    /// Load a `MediaRecord`'s backing file as a decoded grayscale image, for feeding to
    /// the template matcher. `None` for non-image records or files that can't be opened
    /// (missing, moved, unsupported format) — corrupt/missing items are skipped
    /// with a log warning rather than failing the query.
    fn load_gray_image(&self, record: &MediaRecord) -> Option<image::GrayImage> {
        if record.media_type != MediaType::Image {
            return None;
        }
        let path = self.media_root.join(&record.relative_path);
        match image::open(&path) {
            Ok(img) => Some(img.to_luma8()),
            Err(err) => {
                log::warn!("template match: failed to open {path:?}: {err}");
                None
            }
        }
    }

    /// Runs C6 over one group ("optionally run the template matcher per
    /// group"). Only meaningful for image candidates with readable backing files;
    /// candidates whose image can't be loaded are left untouched rather than dropped, so
    /// a missing file doesn't silently erase an otherwise-valid fuzzy match.
    fn apply_template_match(&self, group: &mut MatchGroup) {
        let Some(needle_image) = self.load_gray_image(&group.needle) else {
            return;
        };
        let needle_entry = template_match::GroupEntry {
            record: group.needle.clone(),
            image: Some(needle_image),
            template_match: None,
        };

        let (checkable, unchecked): (Vec<Match>, Vec<Match>) = group
            .candidates
            .drain(..)
            .partition(|m| m.record.media_type == MediaType::Image);

        let mut tm_group = template_match::MatchGroup {
            entries: checkable
                .iter()
                .map(|m| template_match::GroupEntry {
                    record: m.record.clone(),
                    image: self.load_gray_image(&m.record),
                    template_match: None,
                })
                .collect(),
        };
        self.template_matcher.match_group(&needle_entry, &mut tm_group);

        let passed: HashMap<MediaId, template_match::TemplateMatchResult> = tm_group
            .entries
            .into_iter()
            .filter_map(|e| e.template_match.map(|tm| (e.record.id, tm)))
            .collect();

        group.candidates = checkable
            .into_iter()
            .filter_map(|mut m| {
                let tm = passed.get(&m.record.id)?;
                m.roi = Some(tm.roi);
                m.transform = Some(tm.transform);
                Some(m)
            })
            .chain(unchecked)
            .collect();
    }

    fn resolve_needles(&self, params: &SearchParams) -> crate::error::Result<Vec<MediaRecord>> {
        if let Some(ids) = &params.in_set {
            let ids: HashSet<MediaId> = ids.iter().copied().collect();
            return Ok(self
                .store
                .all_of_types(&params.query_types)?
                .into_iter()
                .filter(|r| ids.contains(&r.id))
                .collect());
        }
        self.store.all_of_types(&params.query_types)
    }

    /// Parallel map over the needle set: each worker queries the right index, rehydrates
    /// matches via `by_id`, and writes into a pre-sized results vector.
    fn search_needles(
        &self,
        needles: &[MediaRecord],
        by_id: &HashMap<MediaId, MediaRecord>,
        params: &SearchParams,
    ) -> crate::error::Result<Vec<MatchGroup>> {
        use rayon::prelude::*;

        let maybe_sliced_image = self.maybe_slice_image_index(params);
        let maybe_sliced_video = self.maybe_slice_video_index(params);

        let groups: Vec<MatchGroup> = self.pool.install(|| {
            needles
                .par_iter()
                .map(|needle| {
                    let candidates = match params.algo {
                        Algo::DctImage | Algo::Color | Algo::Features => {
                            let index = maybe_sliced_image.as_deref().unwrap_or(&self.image_index);
                            index
                                .find(needle.dct_hash, params.dct_threshold)
                                .into_iter()
                                .filter(|&(id, _)| !(params.filter_self && id == needle.id))
                                .filter_map(|(id, dist)| {
                                    by_id.get(&id).cloned().map(|record| Match {
                                        record,
                                        distance: dist,
                                        range: None,
                                        roi: None,
                                        transform: None,
                                    })
                                })
                                .collect::<Vec<_>>()
                        }
                        // image -> video or video -> video, dispatched on the needle's own media type.
                        Algo::DctVideo => {
                            let index = maybe_sliced_video.as_deref().unwrap_or(&self.video_index);
                            let video_matches = self.find_video_matches(index, needle, params);
                            video_matches
                                .into_iter()
                                .filter(|m| !(params.filter_self && m.media_id == needle.id))
                                .filter_map(|m| {
                                    by_id.get(&m.media_id).cloned().map(|record| Match {
                                        record,
                                        distance: m.score,
                                        range: Some(m.range),
                                        roi: None,
                                        transform: None,
                                    })
                                })
                                .collect::<Vec<_>>()
                        }
                    };

                    let mut candidates = candidates;
                    if let Some(max) = params.max_matches {
                        candidates.sort_by_key(|m| m.distance);
                        candidates.truncate(max);
                    }

                    MatchGroup {
                        needle: needle.clone(),
                        candidates,
                    }
                })
                .collect()
        });

        Ok(groups)
    }

    fn maybe_slice_image_index(&self, params: &SearchParams) -> Option<Box<ImageIndex>> {
        let ids = params.in_set.as_ref()?;
        if !matches!(params.algo, Algo::DctImage | Algo::Color | Algo::Features) {
            return None;
        }
        let set: HashSet<MediaId> = ids.iter().copied().collect();
        Some(Box::new(self.image_index.slice(&set)))
    }

    fn maybe_slice_video_index(&self, _params: &SearchParams) -> Option<Box<VideoIndex>> {
        // Per-target caching for video search is owned by VideoIndex itself; the
        // orchestrator doesn't need its own slice here.
        None
    }

    /// Per-group filters: negative-match exclusion, path filtering, same-directory
    /// filtering, and a minimum-candidate-count cutoff.
    fn apply_group_filters(&self, group: &mut MatchGroup, params: &SearchParams) -> crate::error::Result<()> {
        if params.negative_match {
            let needle_md5 = group.needle.md5.clone();
            let mut keep = Vec::with_capacity(group.candidates.len());
            for c in group.candidates.drain(..) {
                if self.negative_matches.contains(&needle_md5, &c.record.md5)? {
                    continue;
                }
                keep.push(c);
            }
            group.candidates = keep;
        }

        if let Some(filter) = &params.filter_in_path {
            group.candidates.retain(|c| {
                let starts = c.record.relative_path.starts_with(&filter.prefix);
                starts != filter.negate
            });
        }

        if params.filter_parent {
            let needle_dir = group.needle.containing_dir().to_string();
            let all_same_dir = !group.candidates.is_empty()
                && group
                    .candidates
                    .iter()
                    .all(|c| c.record.containing_dir() == needle_dir);
            if all_same_dir {
                group.candidates.clear();
            }
        }

        if group.candidates.len() <= params.min_matches {
            group.candidates.clear();
        }

        Ok(())
    }

    /// Cross-group filters: dropping empty groups, deduplicating identical member sets,
    /// merging overlapping groups, and expanding groups to pairwise rows.
    fn apply_cross_group_filters(&self, mut groups: Vec<MatchGroup>, params: &SearchParams) -> Vec<MatchGroup> {
        groups.retain(|g| !g.candidates.is_empty());

        if params.filter_groups {
            let mut seen: HashSet<Vec<String>> = HashSet::new();
            groups.retain(|g| {
                let mut members: BTreeSet<String> =
                    g.candidates.iter().map(|c| c.record.relative_path.clone()).collect();
                members.insert(g.needle.relative_path.clone());
                seen.insert(members.into_iter().collect())
            });
        }

        if params.merge_groups {
            groups = merge_overlapping_groups(groups);
        }

        if params.expand_groups {
            groups = expand_to_pairs(groups);
        }

        groups
    }
}

/// Transitively merge groups that share any member path.
fn merge_overlapping_groups(groups: Vec<MatchGroup>) -> Vec<MatchGroup> {
    let mut merged: Vec<MatchGroup> = Vec::new();

    'outer: for group in groups {
        let group_paths: HashSet<String> = group
            .candidates
            .iter()
            .map(|c| c.record.relative_path.clone())
            .chain(std::iter::once(group.needle.relative_path.clone()))
            .collect();

        for existing in merged.iter_mut() {
            let existing_paths: HashSet<String> = existing
                .candidates
                .iter()
                .map(|c| c.record.relative_path.clone())
                .chain(std::iter::once(existing.needle.relative_path.clone()))
                .collect();
            if !group_paths.is_disjoint(&existing_paths) {
                for c in &group.candidates {
                    if c.record.relative_path != existing.needle.relative_path
                        && !existing.candidates.iter().any(|e| e.record.id == c.record.id)
                    {
                        existing.candidates.push(c.clone());
                    }
                }
                continue 'outer;
            }
        }
        merged.push(group);
    }
    merged
}

/// Flatten every group to pairwise `(needle, candidate)` rows, one singleton group per
/// pair.
fn expand_to_pairs(groups: Vec<MatchGroup>) -> Vec<MatchGroup> {
    groups
        .into_iter()
        .flat_map(|g| {
            let needle = g.needle.clone();
            g.candidates.into_iter().map(move |c| MatchGroup {
                needle: needle.clone(),
                candidates: vec![c],
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hamming::Hamming;
    use crate::record::InPathFilter;
    use crate::store::sqlite::RecordStore;

    fn record(id: MediaId, path: &str, hash: u64) -> MediaRecord {
        MediaRecord {
            id,
            media_type: MediaType::Image,
            relative_path: path.to_string(),
            width: 10,
            height: 10,
            md5: format!("{id:0>32}"),
            dct_hash: Hamming(hash),
        }
    }

    fn setup(records: &[MediaRecord]) -> Orchestrator {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("media0.db")).unwrap();
        for r in records {
            store.add(r).unwrap();
        }
        let negative = NegativeMatchStore::new(dir.path().join("neg.dat"));
        let image_index = Arc::new(ImageIndex::from_records(records.iter().map(|r| (r.id, r.dct_hash))));
        let video_index = Arc::new(VideoIndex::new());
        let video_dir = dir.path().join("video");
        let media_root = dir.path().to_path_buf();

        // keep tempdir alive for the duration of the store by leaking it in tests
        std::mem::forget(dir);

        Orchestrator::new(store, negative, image_index, video_index, video_dir, media_root)
    }

    #[test]
    fn rescaled_variants_group_together() {
        let mut records = Vec::new();
        let mut id = 1u32;
        for orig in 0..40u32 {
            let base_hash = (orig as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            for _variant in 0..5u32 {
                records.push(record(id, &format!("img/{orig}/{id}.jpg"), base_hash));
                id += 1;
            }
        }

        let orch = setup(&records);
        let mut params = SearchParams {
            dct_threshold: 7,
            filter_groups: true,
            filter_self: false,
            negative_match: false,
            ..Default::default()
        };
        params.query_types = vec![MediaType::Image];

        let groups = orch.similar(&params).unwrap();
        assert_eq!(groups.len(), 40);
        for g in &groups {
            assert_eq!(g.candidates.len(), 5);
        }
    }

    #[test]
    fn negative_match_removes_candidate() {
        let records = vec![record(1, "a.jpg", 0x00), record(2, "b.jpg", 0x00)];
        let orch = setup(&records);
        orch.negative_matches.add(&records[0].md5, &records[1].md5).unwrap();

        let params = SearchParams {
            dct_threshold: 5,
            filter_self: true,
            negative_match: true,
            query_types: vec![MediaType::Image],
            ..Default::default()
        };

        let group = orch.similar_to(&records[0], &params).unwrap();
        assert!(group.candidates.is_empty());
    }

    #[test]
    fn in_path_filter_negated() {
        let records = vec![
            record(1, "keep/a.jpg", 0x00),
            record(2, "keep/b.jpg", 0x00),
            record(3, "drop/c.jpg", 0x00),
        ];
        let orch = setup(&records);

        let params = SearchParams {
            dct_threshold: 5,
            filter_self: true,
            negative_match: false,
            query_types: vec![MediaType::Image],
            filter_in_path: Some(InPathFilter {
                prefix: "drop/".to_string(),
                negate: true,
            }),
            ..Default::default()
        };

        let group = orch.similar_to(&records[0], &params).unwrap();
        assert!(group.candidates.iter().all(|c| !c.record.relative_path.starts_with("drop/")));
    }

    fn video_record(id: MediaId, path: &str) -> MediaRecord {
        MediaRecord {
            id,
            media_type: MediaType::Video,
            relative_path: path.to_string(),
            width: 640,
            height: 480,
            md5: format!("{id:0>32}"),
            dct_hash: Hamming(0),
        }
    }

    #[test]
    fn template_match_with_unreadable_files_keeps_candidates_unchanged() {
        // Neither file exists on disk in this test, so `apply_template_match` can't
        // decode the needle image and bails out without touching the group (
        // missing/corrupt items are skipped, not treated as a validation failure).
        let records = vec![record(1, "a.jpg", 0x00), record(2, "b.jpg", 0x00)];
        let orch = setup(&records);

        let params = SearchParams {
            dct_threshold: 5,
            filter_self: true,
            negative_match: false,
            template_match: true,
            query_types: vec![MediaType::Image],
            ..Default::default()
        };

        let group = orch.similar_to(&records[0], &params).unwrap();
        assert_eq!(group.candidates.len(), 1);
        assert!(group.candidates[0].roi.is_none());
        assert!(group.candidates[0].transform.is_none());
    }

    #[test]
    fn dct_video_algo_finds_frame_from_image_needle() {
        let image = record(1, "still.jpg", 0xAAAA_AAAA_AAAA_AAAA);
        let video = video_record(2, "clip.mp4");
        let orch = setup(&[image.clone(), video.clone()]);

        let video_dir = orch.store.path().parent().unwrap().join("video");
        let frames: Vec<(u32, Hamming)> = (0..20)
            .map(|i| (i, if i == 7 { Hamming(0xAAAA_AAAA_AAAA_AAAA) } else { Hamming((i as u64) << 20) }))
            .collect();
        VideoIndexFile { frames }.save(&video_dir.join("2.vdx")).unwrap();
        orch.video_index.add([2u32]);

        let params = SearchParams {
            algo: Algo::DctVideo,
            dct_threshold: 1,
            filter_self: false,
            negative_match: false,
            query_types: vec![MediaType::Image],
            ..Default::default()
        };

        let group = orch.similar_to(&image, &params).unwrap();
        assert_eq!(group.candidates.len(), 1);
        assert_eq!(group.candidates[0].record.id, 2);
        assert_eq!(group.candidates[0].range.unwrap().dst_in, 7);
    }
}
