//! Camera event channel.
//!
//! One persistent outbound WebSocket per engine. Replacing the channel
//! installs the new connection before the old one is closed, so a
//! concurrent `close` never observes a window with no channel to close.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::borrow::Cow;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Connector, Message};
use url::Url;

use crate::camera::{redact_url, CameraDescriptor};
use crate::config::EngineConfig;

/// Receives every inbound text message verbatim.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

const CLOSE_REASON_REPLACED: &str = "replaced";

/// An open event connection.
pub trait EventConnection: Send {
    /// Request a normal close. Must not block on the network.
    fn close(&mut self, reason: &str);

    /// False once the camera closed the connection or the transport failed.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Opens event connections. `open` may block for the handshake.
pub trait EventTransport: Send + Sync {
    fn open(
        &self,
        url: &str,
        authorization: Option<&str>,
        on_message: MessageHandler,
    ) -> Result<Box<dyn EventConnection>>;
}

pub struct EventChannelManager {
    transport: Arc<dyn EventTransport>,
    current: Mutex<Option<Box<dyn EventConnection>>>,
}

impl EventChannelManager {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            current: Mutex::new(None),
        }
    }

    /// Open a channel to the camera's event endpoint, replacing any open one.
    /// Returns `Ok(false)` when the camera has no event endpoint.
    pub fn connect(&self, camera: &CameraDescriptor, on_message: MessageHandler) -> Result<bool> {
        let Some(url) = camera.event_endpoint() else {
            return Ok(false);
        };
        let auth = camera.basic_auth();
        let connection = self
            .transport
            .open(url, auth.as_deref(), on_message)
            .with_context(|| format!("open event channel {}", redact_url(url)))?;

        let previous = self.slot().replace(connection);
        if let Some(mut previous) = previous {
            previous.close(CLOSE_REASON_REPLACED);
            log::info!("EventChannel: replaced channel with {} for camera {}", redact_url(url), camera.id);
        } else {
            log::info!("EventChannel: opened {} for camera {}", redact_url(url), camera.id);
        }
        Ok(true)
    }

    /// Close the current channel. Returns false if none was open.
    pub fn close(&self) -> bool {
        let current = self.slot().take();
        match current {
            Some(mut connection) => {
                connection.close("");
                log::info!("EventChannel: closed");
                true
            }
            None => false,
        }
    }

    /// True while a channel is installed and its connection is still up.
    pub fn is_open(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|connection| connection.is_alive())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn EventConnection>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// WebSocket transport
// ----------------------------------------------------------------------------

/// Blocking WebSocket transport; each connection gets a reader thread.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    poll_interval: Duration,
    user_agent: String,
}

impl WebSocketTransport {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.http_timeout,
            poll_interval: config.event_poll_interval,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl EventTransport for WebSocketTransport {
    fn open(
        &self,
        url: &str,
        authorization: Option<&str>,
        on_message: MessageHandler,
    ) -> Result<Box<dyn EventConnection>> {
        let parsed = Url::parse(url).context("parse event channel url")?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("event channel url missing host"))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow!("event channel url missing port"))?;

        let mut request = url.into_client_request().context("build event channel request")?;
        let headers = request.headers_mut();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).context("user agent header")?,
        );
        if let Some(auth) = authorization {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(auth).context("authorization header")?,
            );
        }

        let stream = connect_tcp(host, port, self.connect_timeout)?;
        stream
            .set_read_timeout(Some(self.connect_timeout))
            .context("set handshake timeout")?;
        let control = stream.try_clone().context("clone event channel socket")?;
        let connector = match parsed.scheme() {
            "wss" => Some(tls_connector()?),
            _ => None,
        };
        let (mut socket, _response) =
            tungstenite::client_tls_with_config(request, stream, None, connector)
                .map_err(|e| anyhow!("event channel handshake failed: {}", e))?;
        control
            .set_read_timeout(Some(self.poll_interval))
            .context("set event channel poll interval")?;

        let (close_tx, close_rx) = crossbeam_channel::bounded::<String>(1);
        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = alive.clone();
        let shown = redact_url(url);
        let join = std::thread::Builder::new()
            .name("event-channel".to_string())
            .spawn(move || {
                read_messages(&mut socket, &close_rx, &on_message, &shown);
                reader_alive.store(false, Ordering::SeqCst);
            })
            .context("spawn event channel thread")?;

        Ok(Box::new(WebSocketConnection {
            close_tx: Some(close_tx),
            alive,
            join: Some(join),
        }))
    }
}

struct WebSocketConnection {
    close_tx: Option<Sender<String>>,
    alive: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl EventConnection for WebSocketConnection {
    fn close(&mut self, reason: &str) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.try_send(reason.to_string());
        }
        // The reader exits on its next poll; it is never joined from here.
        self.join.take();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close("");
    }
}

/// rustls client config trusting the webpki root set.
fn tls_connector() -> Result<Connector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow!("failed to configure TLS versions: {}", e))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", host, port))?
    {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(anyhow!("connect to {}:{} failed: {}", host, port, err)),
        None => Err(anyhow!("{}:{} resolved to no addresses", host, port)),
    }
}

fn read_messages<S: std::io::Read + std::io::Write>(
    socket: &mut tungstenite::WebSocket<S>,
    close_rx: &Receiver<String>,
    on_message: &MessageHandler,
    shown_url: &str,
) {
    loop {
        let close_reason = match close_rx.try_recv() {
            Ok(reason) => Some(reason),
            Err(TryRecvError::Disconnected) => Some(String::new()),
            Err(TryRecvError::Empty) => None,
        };
        if let Some(reason) = close_reason {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Owned(reason),
            };
            if let Err(err) = socket.close(Some(frame)).and_then(|_| socket.flush()) {
                log::debug!("EventChannel: close of {} not acknowledged: {}", shown_url, err);
            }
            return;
        }

        match socket.read() {
            Ok(Message::Text(text)) => on_message(text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => on_message(text),
                Err(_) => log::debug!("EventChannel: dropping non-UTF-8 binary message"),
            },
            Ok(Message::Close(frame)) => {
                log::info!("EventChannel: {} closed by camera ({:?})", shown_url, frame);
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return
            }
            Err(err) => {
                log::warn!("EventChannel: failure on {}: {}", shown_url, err);
                return;
            }
        }
    }
}
