//! Camera control and streaming engine.
//!
//! `CameraEngine` is the facade a host application drives. It owns three
//! execution contexts:
//!
//! - the surface context, a dedicated thread that owns the playback session
//!   and every surface write. Session commands and backend events both land
//!   in its mailbox, so they are applied strictly one at a time;
//! - the worker, a single FIFO thread for PTZ commands and event-channel I/O;
//! - backend threads (MJPEG readers, decoders), which only post to the
//!   surface context through a `FrameSink`.
//!
//! Every public operation returns without waiting on the network.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::CameraDescriptor;
use crate::config::EngineConfig;
use crate::control::{CommandDispatcher, PtzCommand};
use crate::error::StreamError;
use crate::events::{EventChannelManager, EventTransport, MessageHandler, WebSocketTransport};
use crate::ingest::{DecoderFactory, DefaultDecoderFactory, StreamStrategy};
use crate::session::{ErrorCallback, PlaybackSession, SessionState};
use crate::surface::{BackendEvent, SurfacePair};
use crate::worker::Worker;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

enum SessionCommand {
    Start {
        surfaces: SurfacePair,
        camera: CameraDescriptor,
        on_error: ErrorCallback,
    },
    Stop,
    Reconnect {
        on_error: ErrorCallback,
    },
    Detach,
    Inspect(Sender<SessionSnapshot>),
    Shutdown,
}

/// Point-in-time view of the playback session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub strategy: Option<StreamStrategy>,
    pub camera_id: Option<String>,
    pub generation: u64,
    pub surfaces_attached: bool,
}

impl SessionSnapshot {
    fn of(session: &PlaybackSession) -> Self {
        Self {
            state: session.state(),
            strategy: session.strategy(),
            camera_id: session.camera().map(|camera| camera.id.clone()),
            generation: session.generation(),
            surfaces_attached: session.has_surfaces(),
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    decoders: Option<Arc<dyn DecoderFactory>>,
    transport: Option<Arc<dyn EventTransport>>,
}

impl EngineBuilder {
    /// Replace the packaged decoder backend.
    pub fn with_decoder_factory(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = Some(decoders);
        self
    }

    /// Replace the event-channel transport.
    pub fn with_event_transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<CameraEngine> {
        self.config.validate().context("engine config")?;
        let decoders = self
            .decoders
            .unwrap_or_else(|| Arc::new(DefaultDecoderFactory::default()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new(&self.config)));

        let (backend_tx, backend_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let session = PlaybackSession::new(&self.config, decoders, backend_tx);
        let surface_thread = std::thread::Builder::new()
            .name("surface-context".to_string())
            .spawn(move || run_surface_context(session, command_rx, backend_rx))
            .context("spawn surface context thread")?;

        let worker = Worker::spawn("camera-worker")?;
        log::info!(
            "CameraEngine: started (http timeout {:?}, max frame {} bytes)",
            self.config.http_timeout,
            self.config.max_frame_bytes
        );

        Ok(CameraEngine {
            commands: command_tx,
            surface_thread: Some(surface_thread),
            worker,
            dispatcher: Some(CommandDispatcher::new(&self.config)),
            events: Arc::new(EventChannelManager::new(transport)),
            shut_down: false,
        })
    }
}

pub struct CameraEngine {
    commands: Sender<SessionCommand>,
    surface_thread: Option<JoinHandle<()>>,
    worker: Worker,
    dispatcher: Option<CommandDispatcher>,
    events: Arc<EventChannelManager>,
    shut_down: bool,
}

impl CameraEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            decoders: None,
            transport: None,
        }
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Start streaming `camera` into `surfaces`, replacing any current
    /// session. Failures arrive through `on_error` on the surface context.
    pub fn start_stream<F>(&self, surfaces: SurfacePair, camera: &CameraDescriptor, on_error: F)
    where
        F: Fn(StreamError) + Send + Sync + 'static,
    {
        self.post(SessionCommand::Start {
            surfaces,
            camera: camera.clone(),
            on_error: Arc::new(on_error),
        });
    }

    pub fn stop_stream(&self) {
        self.post(SessionCommand::Stop);
    }

    /// Restart the most recent stream request. No-op if there was none.
    pub fn reconnect_stream<F>(&self, on_error: F)
    where
        F: Fn(StreamError) + Send + Sync + 'static,
    {
        self.post(SessionCommand::Reconnect {
            on_error: Arc::new(on_error),
        });
    }

    /// Drop the engine's references to the current surfaces.
    pub fn detach_surfaces(&self) {
        self.post(SessionCommand::Detach);
    }

    /// Ask the surface context for the current session state. Returns
    /// `None` once the engine is shut down.
    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.commands.send(SessionCommand::Inspect(tx)).is_err() {
            return None;
        }
        rx.recv_timeout(SNAPSHOT_TIMEOUT).ok()
    }

    fn post(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("CameraEngine: surface context is gone; dropping session command");
        }
    }

    // ------------------------------------------------------------------
    // PTZ commands
    // ------------------------------------------------------------------

    pub fn send_move(&self, camera: &CameraDescriptor, pan: f32, tilt: f32) {
        self.dispatch(camera, PtzCommand::pan_tilt(pan, tilt));
    }

    pub fn send_zoom(&self, camera: &CameraDescriptor, velocity: f32) {
        self.dispatch(camera, PtzCommand::zoom(velocity));
    }

    pub fn send_stop_motion(&self, camera: &CameraDescriptor) {
        self.dispatch(camera, PtzCommand::StopMotion);
    }

    pub fn send_goto_preset(&self, camera: &CameraDescriptor, name: &str) {
        self.dispatch(camera, PtzCommand::goto_preset(name));
    }

    fn dispatch(&self, camera: &CameraDescriptor, command: PtzCommand) {
        if camera.control_url.trim().is_empty() {
            log::debug!("CameraEngine: camera {} has no control endpoint", camera.id);
            return;
        }
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };
        let camera = camera.clone();
        let queued = self.worker.execute(move || {
            if let Err(err) = dispatcher.send(&camera, &command) {
                log::warn!("CommandDispatcher: {:#}", err);
            }
        });
        if !queued {
            log::debug!("CameraEngine: worker stopped; PTZ command dropped");
        }
    }

    // ------------------------------------------------------------------
    // Event channel
    // ------------------------------------------------------------------

    /// Open (or replace) the event channel. Each inbound text message is
    /// passed to `on_message` on the channel's reader thread.
    pub fn connect_event_channel<F>(&self, camera: &CameraDescriptor, on_message: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        if camera.event_endpoint().is_none() {
            log::debug!("CameraEngine: camera {} has no event endpoint", camera.id);
            return;
        }
        let events = self.events.clone();
        let camera = camera.clone();
        let handler: MessageHandler = Arc::new(on_message);
        self.worker.execute(move || {
            if let Err(err) = events.connect(&camera, handler) {
                log::warn!("EventChannel: {:#}", err);
            }
        });
    }

    pub fn close_event_channel(&self) {
        let events = self.events.clone();
        self.worker.execute(move || {
            events.close();
        });
    }

    pub fn event_channel_open(&self) -> bool {
        self.events.is_open()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Release everything: event channel, playback session, worker, HTTP
    /// clients, in that order. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.events.close();

        let _ = self.commands.send(SessionCommand::Shutdown);
        let surface_result = match self.surface_thread.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("surface context thread panicked")),
            None => Ok(()),
        };

        let worker_result = self.worker.shutdown_now();
        // A connect that was already running on the worker may have installed a channel.
        self.events.close();
        self.dispatcher.take();

        log::info!("CameraEngine: shut down");
        surface_result.and(worker_result)
    }
}

impl Drop for CameraEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("CameraEngine: {:#}", err);
        }
    }
}

fn run_surface_context(
    mut session: PlaybackSession,
    commands: Receiver<SessionCommand>,
    backend: Receiver<BackendEvent>,
) {
    loop {
        crossbeam_channel::select! {
            recv(commands) -> command => match command {
                Ok(SessionCommand::Start { surfaces, camera, on_error }) => {
                    session.start(surfaces, camera, on_error);
                }
                Ok(SessionCommand::Stop) => {
                    session.stop();
                }
                Ok(SessionCommand::Reconnect { on_error }) => {
                    if !session.reconnect(on_error) {
                        log::debug!("CameraEngine: nothing to reconnect");
                    }
                }
                Ok(SessionCommand::Detach) => session.detach_surfaces(),
                Ok(SessionCommand::Inspect(reply)) => {
                    let _ = reply.send(SessionSnapshot::of(&session));
                }
                Ok(SessionCommand::Shutdown) | Err(_) => {
                    session.stop();
                    return;
                }
            },
            recv(backend) -> event => {
                if let Ok(event) = event {
                    session.handle_backend_event(event);
                }
            }
        }
    }
}
