//! Stream ingestion.
//!
//! This module decides how a camera's feed is consumed and provides the
//! two backends:
//! - Packaged decoding for packetized protocols (RTSP, RTMP, progressive HTTP)
//! - Raw frame extraction for motion-JPEG over HTTP
//!
//! Classification is a pure function of the stream locator and the
//! optional protocol hint. It never touches the network.

pub mod mjpeg;
pub mod packaged;

pub use mjpeg::{ExtractorStats, MjpegExtractor, MjpegReader, DEFAULT_MAX_FRAME_BYTES};
pub use packaged::{DecoderFactory, DefaultDecoderFactory, PackagedDecoder};

use url::Url;

/// Backend selected for a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStrategy {
    /// Hand the locator to a packaged decoder.
    RtspLike,
    /// Pull the HTTP body and extract JPEG frames ourselves.
    RawFrameStream,
}

/// Classify a stream locator. First matching rule wins; total over all inputs.
pub fn classify(locator: &str, protocol: Option<&str>) -> StreamStrategy {
    let hint = protocol.map(|p| p.trim().to_ascii_lowercase());
    let hint = hint.as_deref();
    let hint_is_mjpeg = matches!(hint, Some("mjpeg") | Some("mjpg"));
    let lower = locator.trim().to_ascii_lowercase();

    if lower.starts_with("rtsp") || hint == Some("rtsp") {
        return StreamStrategy::RtspLike;
    }
    if lower.starts_with("rtmp") || hint == Some("rtmp") {
        return StreamStrategy::RtspLike;
    }
    if !lower.starts_with("http") {
        return if hint_is_mjpeg {
            StreamStrategy::RawFrameStream
        } else {
            StreamStrategy::RtspLike
        };
    }
    if hint_is_mjpeg {
        return StreamStrategy::RawFrameStream;
    }
    if mentions_mjpeg(&lower) {
        StreamStrategy::RawFrameStream
    } else {
        StreamStrategy::RtspLike
    }
}

/// Only the path and query count; a host named "mjpeg-gw" says nothing
/// about the payload.
fn mentions_mjpeg(lower: &str) -> bool {
    let haystack = match Url::parse(lower) {
        Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or("")),
        Err(_) => lower.to_string(),
    };
    haystack.contains("mjpg") || haystack.contains("mjpeg")
}
