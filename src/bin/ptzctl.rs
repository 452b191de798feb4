//! ptzctl - command-line driver for the PTZ camera engine
//!
//! Classifies stream locators, sends one-shot PTZ commands, and watches a
//! live stream (saving the most recent frame to disk) with an optional
//! event channel attached.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use ptz_engine::{
    classify, CameraDescriptor, CameraEngine, CommandDispatcher, EngineConfig, PlayerSurface,
    PtzCommand, SessionState, StreamError, Surface, SurfacePair,
};

const WATCH_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a network PTZ camera from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print which backend a stream locator would use.
    Classify {
        locator: String,
        #[arg(long)]
        protocol: Option<String>,
    },
    /// Continuous pan/tilt at the given velocities in [-1, 1].
    Move {
        #[command(flatten)]
        camera: CameraArgs,
        #[arg(long, allow_hyphen_values = true)]
        pan: f32,
        #[arg(long, allow_hyphen_values = true)]
        tilt: f32,
    },
    /// Continuous zoom at the given velocity in [-1, 1].
    Zoom {
        #[command(flatten)]
        camera: CameraArgs,
        #[arg(long, allow_hyphen_values = true)]
        velocity: f32,
    },
    /// Halt all pan, tilt and zoom motion.
    Stop {
        #[command(flatten)]
        camera: CameraArgs,
    },
    /// Move to a named preset position.
    Preset {
        #[command(flatten)]
        camera: CameraArgs,
        name: String,
    },
    /// Stream the camera until Ctrl-C (or --seconds), saving the latest frame.
    Watch {
        #[command(flatten)]
        camera: CameraArgs,
        /// Where to write the most recent frame.
        #[arg(long, value_name = "PATH", default_value = "latest.jpg")]
        output: PathBuf,
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
        /// Also open the camera's event channel and print its messages.
        #[arg(long)]
        events: bool,
    },
}

#[derive(Args, Debug)]
struct CameraArgs {
    /// Camera descriptor file (JSON, or TOML by extension).
    #[arg(long, value_name = "PATH", env = "PTZ_CAMERA_FILE")]
    camera: Option<PathBuf>,
    #[arg(long, default_value = "camera")]
    id: String,
    #[arg(long, env = "PTZ_STREAM_URL")]
    stream_url: Option<String>,
    #[arg(long)]
    protocol: Option<String>,
    #[arg(long, env = "PTZ_CONTROL_URL")]
    control_url: Option<String>,
    #[arg(long, env = "PTZ_EVENT_URL")]
    event_url: Option<String>,
    #[arg(long, env = "PTZ_USERNAME")]
    username: Option<String>,
    #[arg(long, env = "PTZ_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl CameraArgs {
    /// File first, then any explicit flags on top.
    fn descriptor(&self) -> Result<CameraDescriptor> {
        let mut camera = match &self.camera {
            Some(path) => CameraDescriptor::from_file(path)?,
            None => CameraDescriptor::new(self.id.clone(), ""),
        };
        if let Some(url) = &self.stream_url {
            camera.stream_url = url.clone();
        }
        if let Some(protocol) = &self.protocol {
            camera.protocol = Some(protocol.clone());
        }
        if let Some(url) = &self.control_url {
            camera.control_url = url.clone();
        }
        if let Some(url) = &self.event_url {
            camera.event_url = Some(url.clone());
        }
        if let Some(user) = &self.username {
            camera.username = Some(user.clone());
        }
        if let Some(pass) = &self.password {
            camera.password = Some(pass.clone());
        }
        Ok(camera)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Classify { locator, protocol } => {
            println!("{:?}", classify(&locator, protocol.as_deref()));
            Ok(())
        }
        Command::Move { camera, pan, tilt } => {
            send_once(&camera.descriptor()?, PtzCommand::pan_tilt(pan, tilt))
        }
        Command::Zoom { camera, velocity } => {
            send_once(&camera.descriptor()?, PtzCommand::zoom(velocity))
        }
        Command::Stop { camera } => send_once(&camera.descriptor()?, PtzCommand::StopMotion),
        Command::Preset { camera, name } => {
            send_once(&camera.descriptor()?, PtzCommand::goto_preset(name))
        }
        Command::Watch {
            camera,
            output,
            seconds,
            events,
        } => watch(&camera.descriptor()?, output, seconds, events),
    }
}

fn send_once(camera: &CameraDescriptor, command: PtzCommand) -> Result<()> {
    let config = EngineConfig::load()?;
    let dispatcher = CommandDispatcher::new(&config);
    match dispatcher.send(camera, &command)? {
        Some(status) => {
            log::info!("{:?} accepted by camera {} (HTTP {})", command, camera.id, status);
            Ok(())
        }
        None => Err(anyhow!("camera {} has no control url", camera.id)),
    }
}

fn watch(camera: &CameraDescriptor, output: PathBuf, seconds: Option<u64>, events: bool) -> Result<()> {
    let config = EngineConfig::load()?;
    let mut engine = CameraEngine::new(config)?;
    let surface = Arc::new(FileSurface::new(output));
    let surfaces = SurfacePair::new(surface.clone(), surface.clone());

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<Option<StreamError>>(1);
    let ctrlc_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(None);
    })
    .context("install Ctrl-C handler")?;

    engine.start_stream(surfaces, camera, move |err| {
        let _ = stop_tx.try_send(Some(err));
    });
    if events {
        engine.connect_event_channel(camera, |message| println!("{}", message));
    }

    log::info!("ptzctl watching camera {} (Ctrl-C to stop)", camera.id);
    let deadline = seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
    let outcome = wait_for_watch_end(&engine, &stop_rx, deadline);

    engine.shutdown()?;
    log::info!(
        "ptzctl saw {} frames from camera {}",
        surface.frames.load(Ordering::SeqCst),
        camera.id
    );
    match outcome {
        Some(err) => Err(anyhow!("stream failed ({:?}): {}", err.category(), err)),
        None => Ok(()),
    }
}

/// Block until Ctrl-C, a stream error, the deadline, or the session going
/// idle on its own (the camera ended the stream).
fn wait_for_watch_end(
    engine: &CameraEngine,
    stop_rx: &Receiver<Option<StreamError>>,
    deadline: Option<Instant>,
) -> Option<StreamError> {
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return None;
                }
                left.min(WATCH_POLL)
            }
            None => WATCH_POLL,
        };
        match stop_rx.recv_timeout(wait) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let idle = engine
            .session_snapshot()
            .map_or(true, |snapshot| snapshot.state == SessionState::Idle);
        if idle {
            log::info!("ptzctl: stream ended");
            // A failure stops the session before its callback runs.
            return stop_rx.try_recv().ok().flatten();
        }
    }
}

/// Writes every shown frame over the same file.
struct FileSurface {
    path: PathBuf,
    frames: AtomicU64,
    visible: AtomicBool,
}

impl FileSurface {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            frames: AtomicU64::new(0),
            visible: AtomicBool::new(false),
        }
    }
}

impl Surface for FileSurface {
    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    fn show(&self, image: &RgbImage) {
        let count = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = image.save(&self.path) {
            log::warn!("failed to write frame to {}: {}", self.path.display(), err);
        } else if count == 1 {
            log::info!("first frame written to {}", self.path.display());
        }
    }

    fn clear(&self) {}
}

impl PlayerSurface for FileSurface {
    fn bind_player(&self, source: &str) {
        log::info!("player bound to {}", source);
    }

    fn unbind_player(&self) {}
}
