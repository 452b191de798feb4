//! Motion-JPEG frame extraction.
//!
//! This module provides `MjpegExtractor`, an incremental parser that turns a
//! continuous byte stream into complete JPEG frames, and `MjpegReader`, the
//! backend that pulls a camera's HTTP body through the extractor and posts
//! decoded images to the session's surface.
//!
//! The extractor is responsible for:
//! - Finding frames by their `FF D8` / `FF D9` markers, across read boundaries
//! - Bounding the frame buffer and resynchronising after an oversized frame
//! - Stopping at a chunk boundary once its session is cancelled
//!
//! The extractor MUST NOT:
//! - Emit a partial frame (on end of stream, read failure or cancellation)
//! - Abort the connection because of garbage or oversized frames

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::camera::redact_url;
use crate::error::StreamError;
use crate::surface::FrameSink;

/// Hard cap on one frame's size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

/// Bytes requested from the socket per read.
pub const DEFAULT_READ_CHUNK_BYTES: usize = 8 * 1024;

const MARKER_PREFIX: u8 = 0xFF;
const START_OF_IMAGE: u8 = 0xD8;
const END_OF_IMAGE: u8 = 0xD9;

/// Counters for one connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames: u64,
    pub overflows: u64,
    pub bytes_discarded: u64,
    /// Overflows since the last complete frame.
    pub consecutive_overflows: u64,
}

/// Incremental JPEG frame extractor over any `Read`.
pub struct MjpegExtractor<R> {
    reader: R,
    chunk: Vec<u8>,
    pos: usize,
    len: usize,
    frame: Vec<u8>,
    in_frame: bool,
    prev: Option<u8>,
    max_frame_bytes: usize,
    active: Option<Arc<AtomicBool>>,
    finished: bool,
    stats: ExtractorStats,
}

impl<R: Read> MjpegExtractor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk: vec![0u8; DEFAULT_READ_CHUNK_BYTES],
            pos: 0,
            len: 0,
            frame: Vec::with_capacity(64 * 1024),
            in_frame: false,
            prev: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            active: None,
            finished: false,
            stats: ExtractorStats::default(),
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes.max(4);
        self
    }

    pub fn with_chunk_size(mut self, chunk_bytes: usize) -> Self {
        self.chunk = vec![0u8; chunk_bytes.max(1)];
        self.pos = 0;
        self.len = 0;
        self
    }

    /// Stop extracting once `active` is cleared. Checked between reads.
    pub fn with_active_flag(mut self, active: Arc<AtomicBool>) -> Self {
        self.active = Some(active);
        self
    }

    pub fn stats(&self) -> &ExtractorStats {
        &self.stats
    }

    fn cancelled(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| !active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Next complete frame, `Ok(None)` on end of stream or cancellation.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.pos == self.len {
                if self.cancelled() {
                    self.finished = true;
                    return Ok(None);
                }
                let read = match self.reader.read(&mut self.chunk) {
                    Ok(read) => read,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.finished = true;
                        return Err(err);
                    }
                };
                if read == 0 {
                    self.finished = true;
                    return Ok(None);
                }
                self.pos = 0;
                self.len = read;
            }

            while self.pos < self.len {
                let byte = self.chunk[self.pos];
                self.pos += 1;

                if !self.in_frame {
                    if self.prev == Some(MARKER_PREFIX) && byte == START_OF_IMAGE {
                        self.frame.clear();
                        self.frame.extend_from_slice(&[MARKER_PREFIX, START_OF_IMAGE]);
                        self.in_frame = true;
                        self.prev = None;
                    } else {
                        self.prev = Some(byte);
                    }
                    continue;
                }

                self.frame.push(byte);
                if self.frame.len() > self.max_frame_bytes {
                    self.overflow();
                    continue;
                }
                if self.prev == Some(MARKER_PREFIX) && byte == END_OF_IMAGE {
                    self.in_frame = false;
                    self.prev = None;
                    if self.cancelled() {
                        self.frame.clear();
                        self.finished = true;
                        return Ok(None);
                    }
                    let frame = self.frame.to_vec();
                    self.frame.clear();
                    self.stats.frames += 1;
                    self.stats.consecutive_overflows = 0;
                    return Ok(Some(frame));
                }
                self.prev = Some(byte);
            }
        }
    }

    fn overflow(&mut self) {
        self.stats.overflows += 1;
        self.stats.consecutive_overflows += 1;
        self.stats.bytes_discarded += self.frame.len() as u64;
        self.frame.clear();
        self.frame.shrink_to(64 * 1024);
        self.in_frame = false;
        self.prev = None;
        let streak = self.stats.consecutive_overflows;
        if streak.is_power_of_two() && streak > 1 {
            log::warn!(
                "MjpegExtractor: {} consecutive frames exceeded {} bytes; stream may be desynchronised",
                streak,
                self.max_frame_bytes
            );
        } else {
            log::debug!(
                "MjpegExtractor: frame exceeded {} bytes, resynchronising",
                self.max_frame_bytes
            );
        }
    }
}

impl<R: Read> Iterator for MjpegExtractor<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Decode one JPEG frame. `None` means the frame is dropped.
pub fn decode_frame(bytes: &[u8]) -> Option<RgbImage> {
    match image::load_from_memory_with_format(bytes, ImageFormat::Jpeg) {
        Ok(image) => Some(image.into_rgb8()),
        Err(err) => {
            log::debug!("MjpegExtractor: dropping undecodable frame ({} bytes): {}", bytes.len(), err);
            None
        }
    }
}

/// HTTP MJPEG backend: one connection, one reader thread.
#[derive(Clone)]
pub struct MjpegReader {
    agent: ureq::Agent,
    url: String,
    authorization: Option<String>,
    max_frame_bytes: usize,
    chunk_bytes: usize,
}

impl MjpegReader {
    pub fn new(agent: ureq::Agent, url: impl Into<String>) -> Self {
        Self {
            agent,
            url: url.into(),
            authorization: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn with_limits(mut self, max_frame_bytes: usize, chunk_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self.chunk_bytes = chunk_bytes;
        self
    }

    /// Start reading on a dedicated thread. Frames, failures and the end of
    /// the stream are posted through `sink`.
    pub fn spawn(self, sink: FrameSink) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("mjpeg-reader-{}", sink.generation()))
            .spawn(move || self.run(sink))
            .context("spawn mjpeg reader thread")
    }

    fn run(&self, sink: FrameSink) {
        let shown_url = redact_url(&self.url);
        let mut request = self.agent.get(&self.url);
        if let Some(auth) = &self.authorization {
            request = request.set("Authorization", auth);
        }
        let response = match request.call() {
            Ok(response) => response,
            Err(err) => {
                log::warn!("MjpegReader: request to {} failed: {}", shown_url, err);
                sink.fail(StreamError::from_ureq(err));
                return;
            }
        };
        log::info!(
            "MjpegReader: connected to {} ({})",
            shown_url,
            response.content_type()
        );

        let mut extractor = MjpegExtractor::new(response.into_reader())
            .with_max_frame_bytes(self.max_frame_bytes)
            .with_chunk_size(self.chunk_bytes)
            .with_active_flag(sink.active_flag());

        loop {
            match extractor.next_frame() {
                Ok(Some(frame)) => {
                    let Some(image) = decode_frame(&frame) else {
                        continue;
                    };
                    if !sink.deliver(image) {
                        break;
                    }
                }
                Ok(None) => {
                    sink.finish();
                    break;
                }
                Err(err) => {
                    if sink.is_active() {
                        log::warn!("MjpegReader: read from {} failed: {}", shown_url, err);
                    }
                    sink.fail(StreamError::Read(err.to_string()));
                    break;
                }
            }
        }

        let stats = extractor.stats();
        log::info!(
            "MjpegReader: {} closed after {} frames ({} overflow resyncs, {} bytes discarded)",
            shown_url,
            stats.frames,
            stats.overflows,
            stats.bytes_discarded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    fn collect(stream: Vec<u8>, chunk: usize, max: usize) -> Vec<Vec<u8>> {
        MjpegExtractor::new(Cursor::new(stream))
            .with_chunk_size(chunk)
            .with_max_frame_bytes(max)
            .collect::<io::Result<Vec<_>>>()
            .unwrap_or_default()
    }

    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let read = self.data.read(buf)?;
            if read == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            Ok(read)
        }
    }

    #[test]
    fn extracts_frames_interleaved_with_garbage() {
        let frames = [frame(b"one"), frame(&[0x00, 0xFF, 0x00, 0x12]), frame(b"three")];
        let mut stream = b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        for f in &frames {
            stream.extend_from_slice(f);
            stream.extend_from_slice(b"\r\n--boundary\r\n\xFF\x00junk");
        }

        for chunk in [1, 3, 7, 8192] {
            let got = collect(stream.clone(), chunk, DEFAULT_MAX_FRAME_BYTES);
            assert_eq!(got, frames.to_vec(), "chunk size {}", chunk);
        }
    }

    #[test]
    fn oversized_frame_is_dropped_and_next_frame_survives() {
        let big = frame(&vec![0x42; 64]);
        let small = frame(b"ok");
        let mut stream = big.clone();
        stream.extend_from_slice(&small);
        stream.extend_from_slice(&big);
        stream.extend_from_slice(&small);

        let mut extractor = MjpegExtractor::new(Cursor::new(stream))
            .with_chunk_size(5)
            .with_max_frame_bytes(32);
        let mut got = Vec::new();
        while let Some(frame) = extractor.next_frame().expect("read") {
            got.push(frame);
        }

        assert_eq!(got, vec![small.clone(), small]);
        assert_eq!(extractor.stats().frames, 2);
        assert_eq!(extractor.stats().overflows, 2);
        assert_eq!(extractor.stats().consecutive_overflows, 0);
    }

    #[test]
    fn stream_ending_mid_frame_emits_nothing_partial() {
        let mut stream = frame(b"complete");
        stream.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF]);
        assert_eq!(collect(stream, 4, 1024), vec![frame(b"complete")]);
    }

    #[test]
    fn stream_without_start_marker_ends_cleanly() {
        let mut extractor = MjpegExtractor::new(Cursor::new(b"HTTP garbage \xFF\xD9".to_vec()));
        assert!(extractor.next_frame().expect("clean end").is_none());
        assert!(extractor.next_frame().expect("stays ended").is_none());
    }

    #[test]
    fn read_failure_terminates_without_partial_frame() {
        let mut data = frame(b"first");
        data.extend_from_slice(&[0xFF, 0xD8, 9, 9]);
        let mut extractor = MjpegExtractor::new(FailingReader {
            data: Cursor::new(data),
        })
        .with_chunk_size(3);

        assert_eq!(extractor.next_frame().expect("first frame"), Some(frame(b"first")));
        let err = extractor.next_frame().expect_err("reset surfaces");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(extractor.next().is_none());
    }

    #[test]
    fn cancellation_is_observed_between_reads() {
        let active = Arc::new(AtomicBool::new(true));
        let mut stream = frame(b"a");
        stream.extend_from_slice(&frame(b"b"));
        let mut extractor = MjpegExtractor::new(Cursor::new(stream))
            .with_chunk_size(5)
            .with_active_flag(active.clone());

        assert_eq!(extractor.next_frame().expect("frame"), Some(frame(b"a")));
        active.store(false, Ordering::SeqCst);
        assert_eq!(extractor.next_frame().expect("cancelled"), None);
    }

    #[test]
    fn decodes_real_jpeg_and_drops_corrupt_one() -> Result<()> {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([200, 10, 10]));
        let mut jpeg = Cursor::new(Vec::new());
        image.write_to(&mut jpeg, ImageFormat::Jpeg)?;
        let jpeg = jpeg.into_inner();

        let decoded = decode_frame(&jpeg).expect("valid jpeg decodes");
        assert_eq!(decoded.dimensions(), (8, 4));
        assert!(decode_frame(&frame(b"not a jpeg")).is_none());
        Ok(())
    }
}
