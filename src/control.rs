//! PTZ command dispatch.
//!
//! Each command is one HTTP GET against the camera's control endpoint with
//! action-specific query parameters. Dispatch is best-effort: the engine
//! queues commands on its worker and only logs failures.

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::camera::{redact_url, CameraDescriptor};
use crate::config::EngineConfig;

const PARAM_PAN_TILT: &str = "continuouspantiltmove";
const PARAM_ZOOM: &str = "continuouszoommove";
const PARAM_PRESET: &str = "gotopresetname";

/// One PTZ action. Velocities are clamped to [-1, 1] on construction.
#[derive(Clone, Debug, PartialEq)]
pub enum PtzCommand {
    Move { pan: f32, tilt: f32 },
    Zoom { velocity: f32 },
    StopMotion,
    GotoPreset { name: String },
}

impl PtzCommand {
    pub fn pan_tilt(pan: f32, tilt: f32) -> Self {
        PtzCommand::Move {
            pan: clamp_velocity(pan),
            tilt: clamp_velocity(tilt),
        }
    }

    pub fn zoom(velocity: f32) -> Self {
        PtzCommand::Zoom {
            velocity: clamp_velocity(velocity),
        }
    }

    pub fn goto_preset(name: impl Into<String>) -> Self {
        PtzCommand::GotoPreset { name: name.into() }
    }

    /// Query parameters for this action, in request order.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        match self {
            PtzCommand::Move { pan, tilt } => vec![(
                PARAM_PAN_TILT,
                format!(
                    "{},{}",
                    format_velocity(clamp_velocity(*pan)),
                    format_velocity(clamp_velocity(*tilt))
                ),
            )],
            PtzCommand::Zoom { velocity } => {
                vec![(PARAM_ZOOM, format_velocity(clamp_velocity(*velocity)))]
            }
            PtzCommand::StopMotion => vec![
                (PARAM_PAN_TILT, "0,0".to_string()),
                (PARAM_ZOOM, "0".to_string()),
            ],
            PtzCommand::GotoPreset { name } => vec![(PARAM_PRESET, name.clone())],
        }
    }
}

/// NaN counts as "no motion".
pub fn clamp_velocity(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// Decimal with at least one fractional digit: `1.0`, `-0.25`.
pub fn format_velocity(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Sends PTZ commands over HTTP.
#[derive(Clone)]
pub struct CommandDispatcher {
    agent: ureq::Agent,
}

impl CommandDispatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            agent: config.command_agent(),
        }
    }

    /// Full request URL, or `None` when the camera has no control endpoint.
    pub fn request_url(camera: &CameraDescriptor, command: &PtzCommand) -> Result<Option<Url>> {
        let endpoint = camera.control_url.trim();
        if endpoint.is_empty() {
            return Ok(None);
        }
        let mut url = Url::parse(endpoint)
            .with_context(|| format!("parse control url for camera {}", camera.id))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in command.query_params() {
                query.append_pair(key, &value);
            }
        }
        Ok(Some(url))
    }

    /// Send one command and wait for the response. Returns `Ok(None)` when
    /// nothing was sent because the control endpoint is blank.
    pub fn send(&self, camera: &CameraDescriptor, command: &PtzCommand) -> Result<Option<u16>> {
        let Some(url) = Self::request_url(camera, command)? else {
            return Ok(None);
        };
        let mut request = self.agent.request_url("GET", &url);
        if let Some(auth) = camera.basic_auth() {
            request = request.set("Authorization", &auth);
        }
        match request.call() {
            Ok(response) => {
                let status = response.status();
                log::debug!(
                    "CommandDispatcher: {:?} -> {} for camera {}",
                    command,
                    status,
                    camera.id
                );
                Ok(Some(status))
            }
            Err(ureq::Error::Status(status, _)) => Err(anyhow!(
                "camera {} rejected {:?} with HTTP {}",
                camera.id,
                command,
                status
            )),
            Err(err) => Err(anyhow!(
                "command {:?} to {} failed: {}",
                command,
                redact_url(url.as_str()),
                err
            )),
        }
    }
}
