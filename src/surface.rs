//! Output surfaces and the posting handle backends use to reach them.
//!
//! Surfaces are only ever touched from the engine's surface-owning
//! context. Backends running on other threads hold a `FrameSink`, which
//! posts frames and failures into that context's mailbox instead of
//! writing to a surface directly.

use crossbeam_channel::Sender;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StreamError;

/// Frames waiting for the surface context beyond which new frames are dropped.
pub const MAX_PENDING_FRAMES: usize = 16;

/// A still-image sink.
pub trait Surface: Send + Sync {
    fn set_visible(&self, visible: bool);
    /// Replace whatever image is currently shown.
    fn show(&self, image: &RgbImage);
    fn clear(&self);
}

/// A video-capable sink driven by a packaged decoder.
pub trait PlayerSurface: Surface {
    /// Called when a packaged decoder is attached for `source`.
    fn bind_player(&self, source: &str);
    fn unbind_player(&self);
}

/// The two output surfaces a session renders into.
#[derive(Clone)]
pub struct SurfacePair {
    pub player: Arc<dyn PlayerSurface>,
    pub image: Arc<dyn Surface>,
}

impl SurfacePair {
    pub fn new(player: Arc<dyn PlayerSurface>, image: Arc<dyn Surface>) -> Self {
        Self { player, image }
    }

    pub(crate) fn hide_all(&self) {
        self.image.clear();
        self.image.set_visible(false);
        self.player.set_visible(false);
    }
}

/// Which surface a backend renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceTarget {
    Player,
    Image,
}

/// Event posted by a backend to the surface-owning context.
#[derive(Debug)]
pub enum BackendEvent {
    Frame {
        generation: u64,
        target: SurfaceTarget,
        image: RgbImage,
    },
    Failed {
        generation: u64,
        error: StreamError,
    },
    Ended {
        generation: u64,
    },
}

impl BackendEvent {
    pub fn generation(&self) -> u64 {
        match self {
            BackendEvent::Frame { generation, .. }
            | BackendEvent::Failed { generation, .. }
            | BackendEvent::Ended { generation } => *generation,
        }
    }
}

/// Handle a running backend uses to post into the surface-owning context.
///
/// Every post is tagged with the session generation it was created for, and
/// nothing is posted once the session has been cancelled.
#[derive(Clone)]
pub struct FrameSink {
    generation: u64,
    target: SurfaceTarget,
    active: Arc<AtomicBool>,
    tx: Sender<BackendEvent>,
}

impl FrameSink {
    pub(crate) fn new(
        generation: u64,
        target: SurfaceTarget,
        active: Arc<AtomicBool>,
        tx: Sender<BackendEvent>,
    ) -> Self {
        Self {
            generation,
            target,
            active,
            tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// False once the owning session has been stopped or replaced.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Post a decoded frame. Never blocks: when the surface context is
    /// behind, the frame is dropped. Returns false only when the session is gone.
    pub fn deliver(&self, image: RgbImage) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.tx.len() >= MAX_PENDING_FRAMES {
            log::trace!("FrameSink: surface context behind, dropping frame");
            return true;
        }
        self.tx
            .send(BackendEvent::Frame {
                generation: self.generation,
                target: self.target,
                image,
            })
            .is_ok()
    }

    pub fn fail(&self, error: StreamError) {
        if !self.is_active() {
            return;
        }
        let _ = self.tx.send(BackendEvent::Failed {
            generation: self.generation,
            error,
        });
    }

    pub fn finish(&self) {
        if !self.is_active() {
            return;
        }
        let _ = self.tx.send(BackendEvent::Ended {
            generation: self.generation,
        });
    }
}
