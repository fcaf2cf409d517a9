//! Video-frame index: lazily-built bit-partition tree over every indexed video's frame
//! hashes, supporting image-to-video and video-to-video search.
//!
//! Frames with fewer than 5 bits set or clear are dropped as too flat to be useful (a
//! near-solid-color frame matches almost anything); head/tail frames within `skip_frames`
//! are dropped too, unless the video is too short to survive it. Frame positions are
//! packed into tree keys as `(media_index << 16) | frame_number`. `find_frame` picks the
//! nearest matching frame per video; `find_video` scores a whole clip by how often its
//! matched frames land in ascending order against the needle
//! (`percent_near = 100 * num_ascending / num`, `score = 100 - percent_near`).

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::bittree::BitTree;
use crate::hamming::Hamming;
use crate::record::{MatchRange, MediaId, VideoIndexFile};

const MIN_SET_OR_CLEAR_BITS: u32 = 5;

/// A single matched video, produced by either `find_frame` or `find_video`.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMatch {
    pub media_id: MediaId,
    pub range: MatchRange,
    /// Lower is better; `find_frame` always reports the raw Hamming distance of the best
    /// frame, `find_video` reports `100 - percent_near`.
    pub score: u32,
}

struct Inner {
    /// `media_index -> media_id`, ordered by id.
    media_ids: Vec<MediaId>,
    tree: Option<BitTree>,
    /// Per-target single-video subtrees, keyed by media_id, protected by their own mutex
    /// separate from the main tree's read/write lock.
    target_cache: Mutex<HashMap<MediaId, BitTree>>,
}

/// `add`/`remove`/`save`/`load` take the write lock; `find_frame`/`find_video` take the
/// read lock.
pub struct VideoIndex {
    inner: RwLock<Inner>,
}

impl Default for VideoIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoIndex {
    pub fn new() -> Self {
        VideoIndex {
            inner: RwLock::new(Inner {
                media_ids: Vec::new(),
                tree: None,
                target_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Extend the `media_index -> media_id` vector and invalidate the tree (rebuild is
    /// lazy, on next query).
    pub fn add(&self, media_ids: impl IntoIterator<Item = MediaId>) {
        let mut inner = self.inner.write().unwrap();
        inner.media_ids.extend(media_ids);
        inner.tree = None;
    }

    /// Drop ids, drop any cached single-video trees for those ids, invalidate the main
    /// tree.
    pub fn remove(&self, ids: &[MediaId]) {
        let mut inner = self.inner.write().unwrap();
        inner.media_ids.retain(|id| !ids.contains(id));
        inner.tree = None;
        let mut cache = inner.target_cache.lock().unwrap();
        for id in ids {
            cache.remove(id);
        }
    }

    pub fn media_ids(&self) -> Vec<MediaId> {
        self.inner.read().unwrap().media_ids.clone()
    }

    /// Apply the per-video frame filter and emit the surviving `(frame_number, hash)`
    /// pairs, already encoded for `media_index`.
    fn filtered_encoded_frames(media_index: u16, file: &VideoIndexFile, skip_frames: u32) -> Vec<(u32, Hamming)> {
        let total = file.frames.len() as u32;
        let keep_all_despite_skip = total <= 2 * skip_frames;

        file.frames
            .iter()
            .filter(|(frame_number, hash)| {
                let insufficient_detail = hash.count_ones() < MIN_SET_OR_CLEAR_BITS
                    || hash.count_zeros() < MIN_SET_OR_CLEAR_BITS;
                if insufficient_detail {
                    return false;
                }
                if keep_all_despite_skip {
                    return true;
                }
                *frame_number >= skip_frames && *frame_number < total.saturating_sub(skip_frames)
            })
            .map(|&(frame_number, hash)| (encode(media_index, frame_number), hash))
            .collect()
    }

    /// Build the full tree from a loader that supplies each video's `VideoIndexFile`.
    /// `skip_frames` applies uniformly to every video at build time.
    pub fn build_tree(
        &self,
        skip_frames: u32,
        mut load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) {
        let mut inner = self.inner.write().unwrap();
        let mut tree = BitTree::new();
        for (idx, &media_id) in inner.media_ids.clone().iter().enumerate() {
            let Some(file) = load_file(media_id) else {
                log::warn!("corrupt or missing video index file for media_id={media_id}, skipping");
                continue;
            };
            let encoded = Self::filtered_encoded_frames(idx as u16, &file, skip_frames);
            tree.insert_all(encoded);
        }
        inner.tree = Some(tree);
    }

    fn ensure_tree<'a>(inner: &'a mut Inner, skip_frames: u32, mut load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>) -> &'a BitTree {
        if inner.tree.is_none() {
            let mut tree = BitTree::new();
            for (idx, &media_id) in inner.media_ids.clone().iter().enumerate() {
                if let Some(file) = load_file(media_id) {
                    let encoded = Self::filtered_encoded_frames(idx as u16, &file, skip_frames);
                    tree.insert_all(encoded);
                }
            }
            inner.tree = Some(tree);
        }
        inner.tree.as_ref().unwrap()
    }

    /// image -> video search: keep the single nearest frame per matched video, searching
    /// the whole lazily-built tree.
    pub fn find_frame(
        &self,
        needle_hash: Hamming,
        threshold: u32,
        skip_frames: u32,
        src_in: u32,
        load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) -> Vec<VideoMatch> {
        let mut inner = self.inner.write().unwrap();
        let media_ids = inner.media_ids.clone();
        let tree = Self::ensure_tree(&mut inner, skip_frames, load_file);
        search_frame_in_tree(tree, &media_ids, needle_hash, threshold, src_in)
    }

    /// Same as `find_frame`, but restricted to a single video: builds and caches a subtree
    /// over just that video's frames, keyed by `media_id`, reused across subsequent calls
    /// until invalidated by `remove`.
    pub fn find_frame_for_target(
        &self,
        media_id: MediaId,
        needle_hash: Hamming,
        threshold: u32,
        skip_frames: u32,
        src_in: u32,
        load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) -> Vec<VideoMatch> {
        let Some((_media_index, tree)) = self.target_tree(media_id, skip_frames, load_file) else {
            return Vec::new();
        };
        search_frame_in_tree(&tree, std::slice::from_ref(&media_id), needle_hash, threshold, src_in)
    }

    /// video -> video search, searching the whole lazily-built tree.
    pub fn find_video(
        &self,
        needle: &VideoIndexFile,
        threshold: u32,
        skip_frames: u32,
        min_frames_matched: u32,
        min_frames_near_percent: u32,
        load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) -> Vec<VideoMatch> {
        let mut inner = self.inner.write().unwrap();
        let media_ids = inner.media_ids.clone();
        let tree = Self::ensure_tree(&mut inner, skip_frames, load_file);
        search_video_in_tree(tree, &media_ids, needle, threshold, min_frames_matched, min_frames_near_percent)
    }

    /// Same as `find_video`, but restricted to a single target video via the per-target
    /// cache.
    pub fn find_video_for_target(
        &self,
        media_id: MediaId,
        needle: &VideoIndexFile,
        threshold: u32,
        skip_frames: u32,
        min_frames_matched: u32,
        min_frames_near_percent: u32,
        load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) -> Vec<VideoMatch> {
        let Some((_media_index, tree)) = self.target_tree(media_id, skip_frames, load_file) else {
            return Vec::new();
        };
        search_video_in_tree(
            &tree,
            std::slice::from_ref(&media_id),
            needle,
            threshold,
            min_frames_matched,
            min_frames_near_percent,
        )
    }

    /// Build (or fetch from cache) a subtree containing only `media_id`'s frames, encoded
    /// at `media_index = 0` so the single-video tree's decoded indices index straight into
    /// a one-element `media_ids` slice.
    fn target_tree(
        &self,
        media_id: MediaId,
        skip_frames: u32,
        mut load_file: impl FnMut(MediaId) -> Option<VideoIndexFile>,
    ) -> Option<(u16, BitTree)> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(tree) = inner.target_cache.lock().unwrap().get(&media_id) {
                return Some((0, tree.clone()));
            }
        }

        let file = load_file(media_id)?;
        let encoded = Self::filtered_encoded_frames(0, &file, skip_frames);
        let mut tree = BitTree::new();
        tree.insert_all(encoded);

        let inner = self.inner.read().unwrap();
        inner.target_cache.lock().unwrap().insert(media_id, tree.clone());
        Some((0, tree))
    }

    pub fn stats(&self) -> Option<crate::bittree::Stats> {
        self.inner.read().unwrap().tree.as_ref().map(|t| t.stats())
    }
}

fn encode(media_index: u16, frame_number: u32) -> u32 {
    ((media_index as u32) << 16) | (frame_number & 0xFFFF)
}

fn decode(value: u32) -> (u16, u32) {
    ((value >> 16) as u16, value & 0xFFFF)
}

/// One `VideoMatch` per matched video, keeping the nearest frame.
fn search_frame_in_tree(tree: &BitTree, media_ids: &[MediaId], needle_hash: Hamming, threshold: u32, src_in: u32) -> Vec<VideoMatch> {
    let mut best: HashMap<u16, (u32, u32)> = HashMap::new(); // media_index -> (frame, dist)
    for (encoded, dist) in tree.find(needle_hash, threshold) {
        let (media_index, frame) = decode(encoded);
        match best.get(&media_index) {
            Some(&(_, best_dist)) if best_dist <= dist => {}
            _ => {
                best.insert(media_index, (frame, dist));
            }
        }
    }

    best.into_iter()
        .map(|(media_index, (frame, dist))| VideoMatch {
            media_id: media_ids[media_index as usize],
            // range.length is always 1 regardless of adjacent frame clustering.
            range: MatchRange {
                src_in,
                dst_in: frame,
                length: 1,
            },
            score: dist,
        })
        .collect()
}

/// Monotone-ascending-`dst_frame` clip scoring.
fn search_video_in_tree(
    tree: &BitTree,
    media_ids: &[MediaId],
    needle: &VideoIndexFile,
    threshold: u32,
    min_frames_matched: u32,
    min_frames_near_percent: u32,
) -> Vec<VideoMatch> {
    // needle_frames already have the "insufficient detail" filter applied so false
    // matches on solid frames don't pollute the candidate pool; skip_frames is not
    // re-applied to the needle itself (only the haystack was built with it).
    let needle_frames: Vec<(u32, Hamming)> = needle
        .frames
        .iter()
        .filter(|(_, h)| h.count_ones() >= MIN_SET_OR_CLEAR_BITS && h.count_zeros() >= MIN_SET_OR_CLEAR_BITS)
        .cloned()
        .collect();

    let mut per_video: HashMap<u16, Vec<(u32, u32)>> = HashMap::new(); // media_index -> [(src_frame, dst_frame)]
    for (src_frame, hash) in &needle_frames {
        for (encoded, _) in tree.find(*hash, threshold) {
            let (media_index, dst_frame) = decode(encoded);
            per_video.entry(media_index).or_default().push((*src_frame, dst_frame));
        }
    }

    let mut out = Vec::new();
    for (media_index, mut pairs) in per_video {
        let num = pairs.len() as u32;
        pairs.sort_by_key(|&(src, _)| src);

        // The first matched frame has no predecessor to compare against, but it still
        // belongs to the run: a fully-ascending clip match must score 100% near, not
        // (num-1)/num.
        let mut num_ascending = 0u32;
        let mut prev_dst: Option<u32> = None;
        for &(_, dst) in &pairs {
            match prev_dst {
                Some(prev) if dst > prev => num_ascending += 1,
                None => num_ascending += 1,
                _ => {}
            }
            prev_dst = Some(dst);
        }
        let percent_near = if num > 0 { 100 * num_ascending / num } else { 0 };

        if num > min_frames_matched && percent_near > min_frames_near_percent {
            let first = pairs.first().copied().unwrap();
            let last = pairs.last().copied().unwrap();
            let length = (last.0.saturating_sub(first.0)).max(last.1.saturating_sub(first.1));
            out.push(VideoMatch {
                media_id: media_ids[media_index as usize],
                range: MatchRange {
                    src_in: first.0,
                    dst_in: first.1,
                    length,
                },
                score: 100 - percent_near,
            });
        } else if log::log_enabled!(log::Level::Debug) {
            log::debug!("rejected candidate media_index={media_index}: num={num} percent_near={percent_near}");
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn file(frames: &[(u32, u64)]) -> VideoIndexFile {
        VideoIndexFile {
            frames: frames.iter().map(|&(f, h)| (f, Hamming(h))).collect(),
        }
    }

    #[test]
    fn find_frame_locates_matching_frame_in_video() {
        let index = VideoIndex::new();
        index.add([1u32]);

        let frames: Vec<(u32, u64)> = (0..100)
            .map(|i| (i, if i == 42 { 0xAAAA_AAAA_AAAA_AAAA } else { (i as u64) << 20 }))
            .collect();
        let video = file(&frames);

        let matches = index.find_frame(Hamming(0xAAAA_AAAA_AAAA_AAAA), 1, 0, 0, move |_| Some(video.clone()));

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].media_id, 1);
        assert_eq!(matches[0].range.src_in, 0);
        assert_eq!(matches[0].range.dst_in, 42);
        assert_eq!(matches[0].range.length, 1);
    }

    #[test]
    fn scenario_four_self_query() {
        let index = VideoIndex::new();
        index.add([1u32]);

        let mix = |i: u32| (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ 0xA5A5_A5A5_A5A5_A5A5;
        let frames: Vec<(u32, u64)> = (1..=100u32).map(|i| (i, mix(i))).collect();
        let video = file(&frames);
        let video_for_load = video.clone();

        let matches = index.find_video(&video, 1, 0, 1, 50, move |_| Some(video_for_load.clone()));

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].media_id, 1);
        assert_eq!(matches[0].score, 0);
        assert!(matches[0].range.length >= 99);
    }

    #[test]
    fn short_video_keeps_all_frames_despite_skip() {
        let index = VideoIndex::new();
        index.add([1u32]);
        // 10 frames, skip_frames=10 -> total (10) <= 2*skip_frames (20), so nothing is
        // dropped by the head/tail rule.
        let frames: Vec<(u32, u64)> = (0..10u32).map(|i| (i, 0xAAAA_0000_0000_0000 | i as u64)).collect();
        let video = file(&frames);
        let video2 = video.clone();

        let matches = index.find_frame(Hamming(0xAAAA_0000_0000_0000), 1, 10, 0, move |_| Some(video2.clone()));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].range.dst_in, 0);
        let _ = video;
    }

    #[test]
    fn all_zero_hash_is_dropped() {
        let filtered = VideoIndex::filtered_encoded_frames(0, &file(&[(0, 0x0000_0000_0000_0000)]), 0);
        assert!(filtered.is_empty());
    }

    #[test]
    fn all_one_hash_is_dropped() {
        let filtered = VideoIndex::filtered_encoded_frames(0, &file(&[(0, 0xFFFF_FFFF_FFFF_FFFF)]), 0);
        assert!(filtered.is_empty());
    }

    #[test]
    fn encode_decode_roundtrip() {
        for media_index in [0u16, 1, 65535] {
            for frame in [0u32, 1, 65535] {
                let (mi, f) = decode(encode(media_index, frame));
                assert_eq!(mi, media_index);
                assert_eq!(f, frame);
            }
        }
    }
}
