#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;

use ptz_engine::{
    CameraEngine, PlayerSurface, SessionSnapshot, SessionState, StreamError, Surface, SurfacePair,
};

#[derive(Default)]
pub struct RecordingSurface {
    pub shown: AtomicUsize,
    pub visible: AtomicBool,
    pub last_size: Mutex<Option<(u32, u32)>>,
    pub bound: Mutex<Option<String>>,
}

impl RecordingSurface {
    pub fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}

impl Surface for RecordingSurface {
    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    fn show(&self, image: &RgbImage) {
        *self.last_size.lock().unwrap() = Some(image.dimensions());
        self.shown.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(&self) {}
}

impl PlayerSurface for RecordingSurface {
    fn bind_player(&self, source: &str) {
        *self.bound.lock().unwrap() = Some(source.to_string());
    }

    fn unbind_player(&self) {
        *self.bound.lock().unwrap() = None;
    }
}

pub struct Surfaces {
    pub player: Arc<RecordingSurface>,
    pub image: Arc<RecordingSurface>,
}

impl Surfaces {
    pub fn new() -> Self {
        Self {
            player: Arc::new(RecordingSurface::default()),
            image: Arc::new(RecordingSurface::default()),
        }
    }

    pub fn pair(&self) -> SurfacePair {
        SurfacePair::new(self.player.clone(), self.image.clone())
    }
}

#[derive(Clone, Default)]
pub struct ErrorLog(pub Arc<Mutex<Vec<StreamError>>>);

impl ErrorLog {
    pub fn callback(&self) -> impl Fn(StreamError) + Send + Sync + 'static {
        let errors = self.0.clone();
        move |err| errors.lock().unwrap().push(err)
    }

    pub fn snapshot(&self) -> Vec<StreamError> {
        self.0.lock().unwrap().clone()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

pub fn wait_for_state(engine: &CameraEngine, state: SessionState) -> SessionSnapshot {
    let mut last = None;
    wait_until(|| {
        last = engine.session_snapshot();
        last.as_ref().is_some_and(|snapshot| snapshot.state == state)
    });
    last.expect("engine answered snapshot")
}
