//! C10: video decoder facade ("opens a media file, seeks, yields frames; used by C5
//! and the scanner").
//!
//! Grounded on `examples/erikvader-imgdup/videodup/src/frame_extractor/frame_extractor.rs`
//! and `video_source.rs`: lazy one-time `ffmpeg_next::init()` behind a `OnceLock`, a
//! `format::context::Input` opened from a path, the best video stream's `decoder::Video`,
//! and a `software::scaling::Context` used to convert decoded frames into a fixed-size
//! luminance plane. `videocontext.cpp` threads a generic `Logger` type parameter through
//! `FrameExtractor<L: Logger>` to buffer ffmpeg's own log output per-thread; this facade
//! uses the `log` crate directly instead (documented simplification — the core doesn't
//! need that GUI-facing log-buffer-then-flush behavior, only `log::debug!`).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ffmpeg_next as ffmpeg;

use crate::dct::dct_hash_from_luma32;
use crate::hamming::Hamming;

static FFMPEG_INITIALIZED: OnceLock<()> = OnceLock::new();

fn ensure_ffmpeg_initialized() {
    FFMPEG_INITIALIZED.get_or_init(|| {
        ffmpeg::init().expect("failed to initialize ffmpeg");
        ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
    });
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("ffmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg::Error),
    #[error("no video stream found in {0}")]
    NoVideoStream(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

const HASH_SAMPLE_SIZE: u32 = 32;

/// A single decoded frame's timestamp (presentation timestamp in stream time-base units)
/// and the perceptual hash computed from it, ready to append to a `VideoIndexFile`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedFrame {
    pub frame_number: u32,
    pub hash: Hamming,
}

/// Opens one video file and yields perceptually-hashed frames in presentation order.
/// Frames are decoded and downsampled to a `32x32` luma plane inline, one at a time, so
/// memory use does not grow with video length; memory pressure from large candidate
/// images is the caller's concern, not this facade's, which stays O(1) regardless.
pub struct VideoDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_number: u32,
}

impl VideoDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_ffmpeg_initialized();

        let input = ffmpeg::format::input(&path)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::NoVideoStream(path.to_path_buf()))?;
        let stream_index = stream.index();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().video()?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::GRAY8,
            HASH_SAMPLE_SIZE,
            HASH_SAMPLE_SIZE,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )?;

        Ok(VideoDecoder {
            input,
            stream_index,
            decoder,
            scaler,
            frame_number: 0,
        })
    }

    /// Decode the whole video, yielding `(frame_number, hash)` in presentation order, by
    /// calling `on_frame` for each decoded frame.
    pub fn for_each_frame(&mut self, mut on_frame: impl FnMut(DecodedFrame)) -> Result<()> {
        let stream_index = self.stream_index;
        let mut decoded = ffmpeg::util::frame::Video::empty();
        let mut scaled = ffmpeg::util::frame::Video::empty();

        let packets: Vec<_> = self
            .input
            .packets()
            .filter(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet)
            .collect();

        for packet in packets {
            self.decoder.send_packet(&packet)?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler.run(&decoded, &mut scaled)?;
                let samples = luma_plane(&scaled, HASH_SAMPLE_SIZE);
                let hash = dct_hash_from_luma32(&samples);
                on_frame(DecodedFrame {
                    frame_number: self.frame_number,
                    hash,
                });
                self.frame_number += 1;
            }
        }

        self.decoder.send_eof()?;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            self.scaler.run(&decoded, &mut scaled)?;
            let samples = luma_plane(&scaled, HASH_SAMPLE_SIZE);
            let hash = dct_hash_from_luma32(&samples);
            on_frame(DecodedFrame {
                frame_number: self.frame_number,
                hash,
            });
            self.frame_number += 1;
        }

        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }
}

fn luma_plane(frame: &ffmpeg::util::frame::Video, size: u32) -> Vec<u8> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    let mut out = Vec::with_capacity((size * size) as usize);
    for y in 0..size as usize {
        let row_start = y * stride;
        out.extend_from_slice(&data[row_start..row_start + size as usize]);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_missing_file_errors() {
        let result = VideoDecoder::open(Path::new("/nonexistent/path/does-not-exist.mp4"));
        assert!(result.is_err());
    }
}
