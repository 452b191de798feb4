//! Packaged decoder backend.
//!
//! Packetized protocols (RTSP, RTMP, progressive HTTP) are handed to an
//! external media decoder. The engine only needs to start one against a
//! locator and stop it again, so the seam is two small traits.
//!
//! `DefaultDecoderFactory` uses GStreamer when built with the
//! `packaged-gstreamer` feature, with a synthetic fallback for `stub://`
//! locators so sessions can be exercised without a media stack.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::StreamError;
use crate::surface::FrameSink;

/// A running packaged decoder.
pub trait PackagedDecoder: Send {
    /// Stop decoding and release the media pipeline. Must not block on the network.
    fn stop(&mut self);
}

/// Builds packaged decoders for a locator.
///
/// Decoded frames, playback failures and end of stream are reported
/// through `sink`; a failure to construct the decoder is returned directly.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, source: &str, sink: FrameSink) -> Result<Box<dyn PackagedDecoder>, StreamError>;
}

/// Synthetic rendering parameters for `stub://` locators.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 10,
        }
    }
}

/// Factory used when the host does not inject its own.
#[derive(Clone, Debug, Default)]
pub struct DefaultDecoderFactory {
    pub synthetic: SyntheticConfig,
}

impl DecoderFactory for DefaultDecoderFactory {
    fn open(&self, source: &str, sink: FrameSink) -> Result<Box<dyn PackagedDecoder>, StreamError> {
        if source.starts_with("stub://") {
            let decoder = SyntheticDecoder::start(source, self.synthetic.clone(), sink)
                .map_err(|err| StreamError::DecoderUnavailable(format!("{:#}", err)))?;
            return Ok(Box::new(decoder));
        }
        #[cfg(feature = "packaged-gstreamer")]
        {
            let decoder = gst_backend::GstreamerDecoder::start(source, sink)
                .map_err(|err| StreamError::DecoderUnavailable(format!("{:#}", err)))?;
            Ok(Box::new(decoder))
        }
        #[cfg(not(feature = "packaged-gstreamer"))]
        {
            let _ = sink;
            Err(StreamError::DecoderUnavailable(
                "packaged decoding requires the packaged-gstreamer feature".to_string(),
            ))
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic decoder (stub://) for tests and demos
// ----------------------------------------------------------------------------

/// Renders a moving gradient at a fixed rate.
///
/// `stub://name?frames=N` ends the stream after N frames; adding `&fail`
/// reports a playback failure instead of a clean end.
struct SyntheticDecoder {
    stopped: Arc<AtomicBool>,
}

impl SyntheticDecoder {
    fn start(source: &str, config: SyntheticConfig, sink: FrameSink) -> Result<Self> {
        let url = Url::parse(source).context("parse stub locator")?;
        let mut frame_limit = None;
        let mut fail_at_end = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    frame_limit = Some(value.parse::<u64>().context("stub frames must be an integer")?)
                }
                "fail" => fail_at_end = true,
                _ => {}
            }
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = stopped.clone();
        let interval = Duration::from_millis((1000 / config.fps.max(1)) as u64);
        std::thread::Builder::new()
            .name(format!("synthetic-decoder-{}", sink.generation()))
            .spawn(move || {
                let mut frame_count = 0u64;
                loop {
                    if stop_flag.load(Ordering::SeqCst) || !sink.is_active() {
                        return;
                    }
                    if frame_limit.is_some_and(|limit| frame_count >= limit) {
                        break;
                    }
                    frame_count += 1;
                    if !sink.deliver(synthetic_frame(&config, frame_count)) {
                        return;
                    }
                    std::thread::sleep(interval);
                }
                if fail_at_end {
                    sink.fail(StreamError::Playback("synthetic stream failure".to_string()));
                } else {
                    sink.finish();
                }
            })
            .context("spawn synthetic decoder thread")?;

        log::info!("SyntheticDecoder: playing {}", source);
        Ok(Self { stopped })
    }
}

impl PackagedDecoder for SyntheticDecoder {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn synthetic_frame(config: &SyntheticConfig, frame_count: u64) -> RgbImage {
    let shift = (frame_count % 256) as u32;
    RgbImage::from_fn(config.width.max(1), config.height.max(1), |x, y| {
        Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift) % 256) as u8,
            (shift % 256) as u8,
        ])
    })
}

// ----------------------------------------------------------------------------
// Production decoder using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "packaged-gstreamer")]
mod gst_backend {
    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;
    use image::RgbImage;

    use super::PackagedDecoder;
    use crate::error::StreamError;
    use crate::surface::FrameSink;

    pub(super) struct GstreamerDecoder {
        pipeline: gstreamer::Pipeline,
    }

    impl GstreamerDecoder {
        /// Pipeline: uridecodebin ! videoconvert ! appsink (RGB). Samples are
        /// posted through the sink from the streaming thread; bus errors and
        /// EOS are reported from the bus sync handler.
        pub(super) fn start(source: &str, sink: FrameSink) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;

            let description = format!(
                "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
                 appsink name=appsink sync=false max-buffers=1 drop=true",
                source
            );
            let pipeline = gstreamer::parse::launch(&description)
                .context("build playback pipeline")?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("playback pipeline is not a Pipeline"))?;

            let appsink = pipeline
                .by_name("appsink")
                .context("appsink element missing from pipeline")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("appsink element has unexpected type"))?;

            let frames = sink.clone();
            appsink.set_callbacks(
                gstreamer_app::AppSinkCallbacks::builder()
                    .new_sample(move |appsink| {
                        let sample = appsink
                            .pull_sample()
                            .map_err(|_| gstreamer::FlowError::Eos)?;
                        match sample_to_image(&sample) {
                            Ok(image) => {
                                if !frames.deliver(image) {
                                    return Err(gstreamer::FlowError::Flushing);
                                }
                            }
                            Err(err) => log::debug!("GstreamerDecoder: dropping sample: {:#}", err),
                        }
                        Ok(gstreamer::FlowSuccess::Ok)
                    })
                    .build(),
            );

            let bus = pipeline.bus().context("playback pipeline has no bus")?;
            bus.set_sync_handler(move |_, message| {
                use gstreamer::MessageView;
                match message.view() {
                    MessageView::Error(err) => sink.fail(StreamError::Playback(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ))),
                    MessageView::Eos(..) => sink.finish(),
                    _ => {}
                }
                gstreamer::BusSyncReply::Drop
            });

            pipeline
                .set_state(gstreamer::State::Playing)
                .context("set playback pipeline to Playing")?;
            Ok(Self { pipeline })
        }
    }

    impl PackagedDecoder for GstreamerDecoder {
        fn stop(&mut self) {
            if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerDecoder: failed to stop pipeline: {}", err);
            }
        }
    }

    fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
        let buffer = sample.buffer().context("sample missing buffer")?;
        let caps = sample.caps().context("sample missing caps")?;
        let info =
            gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

        let width = info.width();
        let height = info.height();
        let row_bytes = (width as usize) * 3;
        let stride = info.stride()[0] as usize;

        let map = buffer.map_readable().context("map sample buffer")?;
        let data = map.as_slice();

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("sample row is out of bounds")?,
            );
        }
        RgbImage::from_raw(width, height, pixels).context("sample size does not match caps")
    }
}
