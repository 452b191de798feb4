//! PTZ camera engine
//!
//! Connects to network PTZ cameras, renders their live video onto
//! host-supplied surfaces, sends pan/tilt/zoom/preset commands over HTTP and
//! keeps a WebSocket event channel open for asynchronous camera events.
//!
//! # Module Structure
//!
//! - `camera`: camera descriptors and credential handling
//! - `ingest`: transport classification, MJPEG frame extraction, packaged decoders
//! - `surface`: surface traits and the frame posting handle
//! - `session`: the playback session state machine
//! - `control`: PTZ command encoding and dispatch
//! - `events`: the camera event channel
//! - `engine`: the `CameraEngine` facade tying these together
//!
//! ```no_run
//! use ptz_engine::{CameraDescriptor, CameraEngine, EngineConfig, SurfacePair};
//! # fn surfaces() -> SurfacePair { unimplemented!() }
//!
//! let engine = CameraEngine::new(EngineConfig::load()?)?;
//! let camera = CameraDescriptor::new("mast-1", "http://10.0.0.5/axis-cgi/mjpg/video.cgi")
//!     .with_control_url("http://10.0.0.5/axis-cgi/com/ptz.cgi")
//!     .with_credentials("operator", "secret");
//! engine.start_stream(surfaces(), &camera, |err| log::warn!("stream: {}", err));
//! engine.send_move(&camera, 0.5, 0.0);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod camera;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod ingest;
pub mod session;
pub mod surface;
pub mod worker;

pub use camera::CameraDescriptor;
pub use config::EngineConfig;
pub use control::{CommandDispatcher, PtzCommand};
pub use engine::{CameraEngine, EngineBuilder, SessionSnapshot};
pub use error::{ErrorCategory, StreamError};
pub use events::{EventChannelManager, EventConnection, EventTransport, WebSocketTransport};
pub use ingest::{classify, DecoderFactory, PackagedDecoder, StreamStrategy};
pub use session::{PlaybackSession, SessionState};
pub use surface::{BackendEvent, FrameSink, PlayerSurface, Surface, SurfacePair, SurfaceTarget};
