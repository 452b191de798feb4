//! Playback session.
//!
//! A `PlaybackSession` is "this engine is currently showing camera X". It
//! owns at most one backend (packaged decoder or MJPEG reader) bound to one
//! surface pair, and is only ever driven from the surface-owning context.
//!
//! States: `Idle -> Starting -> Active -> Stopping -> Idle`. Starting while
//! active (switching cameras) always runs the full stop path first.
//!
//! Every start bumps the session generation. Backends tag what they post
//! with the generation they were started for, so frames and failures from a
//! replaced or stopped backend are discarded on arrival.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use url::Url;

use crate::camera::{redact_url, CameraDescriptor};
use crate::config::EngineConfig;
use crate::error::StreamError;
use crate::ingest::{classify, DecoderFactory, MjpegReader, PackagedDecoder, StreamStrategy};
use crate::surface::{BackendEvent, FrameSink, SurfacePair, SurfaceTarget};

/// Receives configuration and streaming failures for a session.
pub type ErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// The running backend of an active session.
pub enum Backend {
    Packaged(Box<dyn PackagedDecoder>),
    Extracted(ExtractorHandle),
}

/// Cancellation handle for an MJPEG reader thread.
///
/// Cancellation is cooperative: the reader observes the cleared flag at its
/// next chunk boundary, or when its read times out. The blocking HTTP client
/// exposes no socket to shut down, so `cancel` returns before the connection
/// is released. The socket is closed when the reader's pending read returns,
/// at most `EngineConfig::stream_read_timeout` after `cancel` against a
/// camera that has gone quiet. Nothing the reader posts after `cancel` is
/// shown.
pub struct ExtractorHandle {
    active: Arc<AtomicBool>,
    _reader: JoinHandle<()>,
}

impl ExtractorHandle {
    /// Clear the reader's active flag. Does not wait for the reader.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

struct ActiveSession {
    camera: CameraDescriptor,
    strategy: StreamStrategy,
    generation: u64,
    active: Arc<AtomicBool>,
    backend: Backend,
    on_error: ErrorCallback,
}

pub struct PlaybackSession {
    state: SessionState,
    generation: u64,
    active: Option<ActiveSession>,
    last_camera: Option<CameraDescriptor>,
    surfaces: Option<SurfacePair>,
    decoders: Arc<dyn DecoderFactory>,
    stream_agent: ureq::Agent,
    max_frame_bytes: usize,
    read_chunk_bytes: usize,
    backend_tx: Sender<BackendEvent>,
}

impl PlaybackSession {
    pub fn new(
        config: &EngineConfig,
        decoders: Arc<dyn DecoderFactory>,
        backend_tx: Sender<BackendEvent>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            active: None,
            last_camera: None,
            surfaces: None,
            decoders,
            stream_agent: config.stream_agent(),
            max_frame_bytes: config.max_frame_bytes,
            read_chunk_bytes: config.read_chunk_bytes,
            backend_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn strategy(&self) -> Option<StreamStrategy> {
        self.active.as_ref().map(|active| active.strategy)
    }

    pub fn camera(&self) -> Option<&CameraDescriptor> {
        self.active.as_ref().map(|active| &active.camera)
    }

    pub fn has_surfaces(&self) -> bool {
        self.surfaces.is_some()
    }

    /// Tear down any current session, then start `camera` on `surfaces`.
    /// Failures are reported once through `on_error` and leave the session idle.
    pub fn start(&mut self, surfaces: SurfacePair, camera: CameraDescriptor, on_error: ErrorCallback) {
        if let Some(previous) = &self.active {
            log::info!(
                "PlaybackSession: switching from camera {} to {}",
                previous.camera.id,
                camera.id
            );
        }
        self.stop();

        self.state = SessionState::Starting;
        self.generation += 1;
        self.surfaces = Some(surfaces.clone());
        self.last_camera = Some(camera.clone());

        let strategy = classify(&camera.stream_url, camera.protocol.as_deref());
        let active = Arc::new(AtomicBool::new(true));
        match self.start_backend(&camera, strategy, &surfaces, &active) {
            Ok(backend) => {
                log::info!(
                    "PlaybackSession: camera {} streaming {} via {:?}",
                    camera.id,
                    redact_url(&camera.stream_url),
                    strategy
                );
                self.active = Some(ActiveSession {
                    camera,
                    strategy,
                    generation: self.generation,
                    active,
                    backend,
                    on_error,
                });
                self.state = SessionState::Active;
            }
            Err(error) => {
                active.store(false, Ordering::SeqCst);
                self.state = SessionState::Idle;
                log::warn!("PlaybackSession: camera {} failed to start: {}", camera.id, error);
                on_error(error);
            }
        }
    }

    fn start_backend(
        &self,
        camera: &CameraDescriptor,
        strategy: StreamStrategy,
        surfaces: &SurfacePair,
        active: &Arc<AtomicBool>,
    ) -> Result<Backend, StreamError> {
        let source = camera.stream_url.trim();
        if source.is_empty() {
            return Err(StreamError::EmptySource);
        }

        match strategy {
            StreamStrategy::RawFrameStream => {
                let url = Url::parse(source).map_err(|err| StreamError::InvalidSource {
                    url: redact_url(source),
                    reason: err.to_string(),
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(StreamError::InvalidSource {
                        url: redact_url(source),
                        reason: "frame extraction needs an http(s) url".to_string(),
                    });
                }

                surfaces.player.set_visible(false);
                surfaces.image.set_visible(true);
                let sink = FrameSink::new(
                    self.generation,
                    SurfaceTarget::Image,
                    active.clone(),
                    self.backend_tx.clone(),
                );
                let reader = MjpegReader::new(self.stream_agent.clone(), source)
                    .with_authorization(camera.basic_auth())
                    .with_limits(self.max_frame_bytes, self.read_chunk_bytes)
                    .spawn(sink)
                    .map_err(|err| StreamError::Connect(format!("{:#}", err)))?;
                Ok(Backend::Extracted(ExtractorHandle {
                    active: active.clone(),
                    _reader: reader,
                }))
            }
            StreamStrategy::RtspLike => {
                let sink = FrameSink::new(
                    self.generation,
                    SurfaceTarget::Player,
                    active.clone(),
                    self.backend_tx.clone(),
                );
                let decoder = self.decoders.open(source, sink)?;
                surfaces.image.clear();
                surfaces.image.set_visible(false);
                surfaces.player.bind_player(source);
                surfaces.player.set_visible(true);
                Ok(Backend::Packaged(decoder))
            }
        }
    }

    /// Tear down the active backend and hide both surfaces. Returns false
    /// (and does nothing) when already idle.
    pub fn stop(&mut self) -> bool {
        let Some(session) = self.active.take() else {
            return false;
        };
        self.state = SessionState::Stopping;
        session.active.store(false, Ordering::SeqCst);
        match session.backend {
            Backend::Packaged(mut decoder) => {
                decoder.stop();
                if let Some(surfaces) = &self.surfaces {
                    surfaces.player.unbind_player();
                }
            }
            Backend::Extracted(handle) => handle.cancel(),
        }
        if let Some(surfaces) = &self.surfaces {
            surfaces.hide_all();
        }
        self.state = SessionState::Idle;
        log::info!("PlaybackSession: camera {} stopped", session.camera.id);
        true
    }

    /// Restart the last camera on the last surfaces. Returns false when
    /// there is nothing to reconnect to.
    pub fn reconnect(&mut self, on_error: ErrorCallback) -> bool {
        let (Some(camera), Some(surfaces)) = (self.last_camera.clone(), self.surfaces.clone()) else {
            return false;
        };
        self.start(surfaces, camera, on_error);
        true
    }

    /// Release the surfaces without stopping the backend. Frames that
    /// arrive afterwards have nowhere to go and are dropped.
    pub fn detach_surfaces(&mut self) {
        if let Some(surfaces) = self.surfaces.take() {
            surfaces.player.unbind_player();
            log::debug!("PlaybackSession: surfaces detached");
        }
    }

    /// Apply an event posted by a backend. Events from any generation other
    /// than the active one are discarded.
    pub fn handle_backend_event(&mut self, event: BackendEvent) {
        let Some(session) = &self.active else {
            return;
        };
        if event.generation() != session.generation {
            log::debug!(
                "PlaybackSession: discarding event from stale generation {}",
                event.generation()
            );
            return;
        }

        match event {
            BackendEvent::Frame { target, image, .. } => {
                let Some(surfaces) = &self.surfaces else {
                    return;
                };
                match target {
                    SurfaceTarget::Image => {
                        surfaces.image.show(&image);
                        surfaces.image.set_visible(true);
                        surfaces.player.set_visible(false);
                    }
                    SurfaceTarget::Player => surfaces.player.show(&image),
                }
            }
            BackendEvent::Failed { error, .. } => {
                let on_error = session.on_error.clone();
                log::warn!("PlaybackSession: camera {} stream failed: {}", session.camera.id, error);
                self.stop();
                on_error(error);
            }
            BackendEvent::Ended { .. } => {
                log::info!("PlaybackSession: camera {} stream ended", session.camera.id);
                self.stop();
            }
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{PlayerSurface, Surface};
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockSurface {
        shown: AtomicUsize,
        visible: AtomicBool,
        bound: Mutex<Option<String>>,
    }

    impl Surface for MockSurface {
        fn set_visible(&self, visible: bool) {
            self.visible.store(visible, Ordering::SeqCst);
        }
        fn show(&self, _image: &RgbImage) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }
        fn clear(&self) {}
    }

    impl PlayerSurface for MockSurface {
        fn bind_player(&self, source: &str) {
            *self.bound.lock().unwrap() = Some(source.to_string());
        }
        fn unbind_player(&self) {
            *self.bound.lock().unwrap() = None;
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        live: Arc<AtomicUsize>,
        opened: AtomicUsize,
        fail: bool,
    }

    struct CountingDecoder {
        live: Arc<AtomicUsize>,
        stopped: bool,
    }

    impl PackagedDecoder for CountingDecoder {
        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl DecoderFactory for CountingFactory {
        fn open(&self, _source: &str, _sink: FrameSink) -> Result<Box<dyn PackagedDecoder>, StreamError> {
            if self.fail {
                return Err(StreamError::DecoderUnavailable("codec missing".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingDecoder {
                live: self.live.clone(),
                stopped: false,
            }))
        }
    }

    struct Harness {
        session: PlaybackSession,
        factory: Arc<CountingFactory>,
        player: Arc<MockSurface>,
        image: Arc<MockSurface>,
        errors: Arc<Mutex<Vec<StreamError>>>,
    }

    impl Harness {
        fn new(fail: bool) -> Self {
            let factory = Arc::new(CountingFactory {
                fail,
                ..CountingFactory::default()
            });
            let (tx, _rx) = crossbeam_channel::unbounded();
            Self {
                session: PlaybackSession::new(&EngineConfig::default(), factory.clone(), tx),
                factory,
                player: Arc::new(MockSurface::default()),
                image: Arc::new(MockSurface::default()),
                errors: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn surfaces(&self) -> SurfacePair {
            SurfacePair::new(self.player.clone(), self.image.clone())
        }

        fn on_error(&self) -> ErrorCallback {
            let errors = self.errors.clone();
            Arc::new(move |err| errors.lock().unwrap().push(err))
        }

        fn start(&mut self, url: &str) {
            let surfaces = self.surfaces();
            let on_error = self.on_error();
            self.session
                .start(surfaces, CameraDescriptor::new(url, url), on_error);
        }

        fn frame(&self, generation: u64, target: SurfaceTarget) -> BackendEvent {
            BackendEvent::Frame {
                generation,
                target,
                image: RgbImage::new(2, 2),
            }
        }
    }

    #[test]
    fn switching_cameras_leaves_exactly_one_backend() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        h.start("rtsp://cam-b/stream");

        assert_eq!(h.factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(h.factory.live.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.session.camera().map(|c| c.id.as_str()), Some("rtsp://cam-b/stream"));
        assert_eq!(
            h.player.bound.lock().unwrap().as_deref(),
            Some("rtsp://cam-b/stream")
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        assert!(h.session.stop());
        assert!(!h.session.stop());
        assert_eq!(h.factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.player.visible.load(Ordering::SeqCst));
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_locator_fails_through_callback() {
        let mut h = Harness::new(false);
        h.start("");
        assert_eq!(*h.errors.lock().unwrap(), vec![StreamError::EmptySource]);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.factory.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn decoder_failure_is_reported_once_and_not_retried() {
        let mut h = Harness::new(true);
        h.start("rtsp://cam-a/stream");
        let errors = h.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StreamError::DecoderUnavailable(_)));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn extraction_needs_http_locator() {
        let mut h = Harness::new(false);
        let surfaces = h.surfaces();
        let on_error = h.on_error();
        h.session.start(
            surfaces,
            CameraDescriptor::new("cam", "tcp://cam:9000/feed").with_protocol("mjpeg"),
            on_error,
        );
        assert!(matches!(
            h.errors.lock().unwrap().first(),
            Some(StreamError::InvalidSource { .. })
        ));
    }

    #[test]
    fn late_frames_from_replaced_session_are_discarded() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        let first = h.session.generation();
        h.start("rtsp://cam-b/stream");
        let second = h.session.generation();

        h.session
            .handle_backend_event(h.frame(first, SurfaceTarget::Player));
        assert_eq!(h.player.shown.load(Ordering::SeqCst), 0);

        h.session
            .handle_backend_event(h.frame(second, SurfaceTarget::Player));
        assert_eq!(h.player.shown.load(Ordering::SeqCst), 1);

        h.session.stop();
        h.session
            .handle_backend_event(h.frame(second, SurfaceTarget::Player));
        assert_eq!(h.player.shown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_failure_stops_session_and_reconnect_restarts_it() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        let generation = h.session.generation();
        h.session.handle_backend_event(BackendEvent::Failed {
            generation,
            error: StreamError::Playback("decoder crashed".into()),
        });
        h.session.handle_backend_event(BackendEvent::Failed {
            generation,
            error: StreamError::Playback("again".into()),
        });

        assert_eq!(h.errors.lock().unwrap().len(), 1);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.factory.live.load(Ordering::SeqCst), 0);

        let on_error = h.on_error();
        assert!(h.session.reconnect(on_error));
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.factory.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_without_history_is_a_no_op() {
        let mut h = Harness::new(false);
        let on_error = h.on_error();
        assert!(!h.session.reconnect(on_error));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn detached_surfaces_receive_nothing_and_block_reconnect() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        let generation = h.session.generation();
        h.session.detach_surfaces();

        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.player.bound.lock().unwrap().is_none());
        h.session
            .handle_backend_event(h.frame(generation, SurfaceTarget::Player));
        assert_eq!(h.player.shown.load(Ordering::SeqCst), 0);

        let on_error = h.on_error();
        assert!(!h.session.reconnect(on_error));
    }

    #[test]
    fn switching_to_extraction_stops_packaged_decoder() {
        let mut h = Harness::new(false);
        h.start("rtsp://cam-a/stream");
        h.start("http://127.0.0.1:9/video.mjpg");

        assert_eq!(h.factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.strategy(), Some(StreamStrategy::RawFrameStream));
        assert!(h.image.visible.load(Ordering::SeqCst));
        assert!(!h.player.visible.load(Ordering::SeqCst));
        h.session.stop();
    }
}
