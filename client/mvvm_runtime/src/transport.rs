//! Reconnecting JSON message channel.
//!
//! One I/O thread owns the socket. Callers talk to it through a command
//! queue, so `send` never blocks on the network and messages queued while
//! the socket is down are written in order once it comes back.

use crate::config::ClientConfig;
use crate::error::{Error, Result, TransportError};
use crate::session::Channel;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tungstenite::client::{self, IntoClientRequest};
use tungstenite::error::UrlError;
use tungstenite::handshake::HandshakeError;
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::stream::{MaybeTlsStream, Mode};
use tungstenite::{Message, WebSocket};

pub type ConnectedHandler = Arc<dyn Fn() + Send + Sync>;
pub type ReceivedHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub trait Socket: Send {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Waits at most one poll interval. `Ok(None)` when nothing arrived.
    fn poll_text(&mut self) -> Result<Option<String>, TransportError>;

    fn close(&mut self) {}
}

pub trait Connector: Send + Sync + 'static {
    fn address(&self) -> &str;
    fn connect(&self) -> Result<Box<dyn Socket>, TransportError>;
}

/// Plain `ws://` connector. TCP connect and handshake are both bounded by
/// the dial timeout.
pub struct WsConnector {
    address: String,
    poll_interval: Duration,
    dial_timeout: Duration,
}

impl WsConnector {
    pub fn new(address: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            address: address.into(),
            poll_interval: config.poll_interval,
            dial_timeout: config.dial_timeout,
        }
    }
}

fn dial(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("{host} resolved to no address"))
    }))
}

fn handshake_error(
    err: HandshakeError<ClientHandshake<MaybeTlsStream<TcpStream>>>,
) -> TransportError {
    match err {
        HandshakeError::Failure(err) => ws_error(err),
        HandshakeError::Interrupted(_) => TransportError::Io(io::Error::new(
            ErrorKind::TimedOut,
            "websocket handshake timed out",
        )),
    }
}

impl Connector for WsConnector {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> Result<Box<dyn Socket>, TransportError> {
        let request = self.address.as_str().into_client_request()?;
        if let Mode::Tls = client::uri_mode(request.uri())? {
            return Err(tungstenite::Error::Url(UrlError::TlsFeatureNotEnabled).into());
        }
        let host = request
            .uri()
            .host()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or(tungstenite::Error::Url(UrlError::NoHostName))?;
        let port = request.uri().port_u16().unwrap_or(80);

        let stream = dial(&host, port, self.dial_timeout)?;
        stream.set_read_timeout(Some(self.dial_timeout))?;
        stream.set_write_timeout(Some(self.dial_timeout))?;
        let (mut socket, _response) =
            tungstenite::client(request, MaybeTlsStream::Plain(stream)).map_err(handshake_error)?;
        if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
            stream.set_read_timeout(Some(self.poll_interval))?;
        }
        Ok(Box::new(WsSocket { socket }))
    }
}

struct WsSocket {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl Socket for WsSocket {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.socket
            .send(Message::text(text.to_owned()))
            .map_err(ws_error)
    }

    fn poll_text(&mut self) -> Result<Option<String>, TransportError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Ok(Some(text)),
                Err(_) => {
                    warn!(len = bytes.len(), "dropping non-utf8 binary frame");
                    Ok(None)
                }
            },
            Ok(Message::Close(_)) => Err(TransportError::Closed),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(err) => Err(ws_error(err)),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

fn ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::WebSocket(other),
    }
}

enum Command {
    Send(String),
    Shutdown,
}

/// Handle to one reconnecting connection. Clones share the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    address: String,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    connected: bool,
    on_connected: Vec<ConnectedHandler>,
    on_received: Vec<ReceivedHandler>,
}

impl Transport {
    pub fn open(connector: Arc<dyn Connector>, config: &ClientConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            address: connector.address().to_string(),
            hooks: Mutex::new(Hooks::default()),
        });
        let (commands, rx) = mpsc::channel();
        let worker = Worker {
            connector,
            shared: Arc::clone(&shared),
            commands: rx,
            backlog: VecDeque::new(),
            backoff: config.reconnect_backoff,
        };
        let handle = thread::Builder::new()
            .name("mvvm-transport".to_string())
            .spawn(move || worker.run())
            .map_err(TransportError::Io)?;

        Ok(Self {
            inner: Arc::new(TransportInner {
                shared,
                commands,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.shared.address
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.hooks.lock().connected
    }

    /// Queues one message. A JSON string is written verbatim, anything else
    /// is serialised first.
    pub fn send(&self, message: Value) -> Result<()> {
        let text = match message {
            Value::Null => return Err(Error::NullMessage),
            Value::String(text) => text,
            other => other.to_string(),
        };
        self.inner
            .commands
            .send(Command::Send(text))
            .map_err(|_| Error::Transport(TransportError::Shutdown))
    }

    /// Runs on every transition to open. Runs right away when the
    /// connection is already open.
    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.add_connected(Arc::new(handler));
    }

    pub fn on_received(&self, handler: impl Fn(&Value) + Send + Sync + 'static) {
        self.add_received(Arc::new(handler));
    }

    fn add_connected(&self, handler: ConnectedHandler) {
        let already_open = {
            let mut hooks = self.inner.shared.hooks.lock();
            hooks.on_connected.push(Arc::clone(&handler));
            hooks.connected
        };
        if already_open {
            handler();
        }
    }

    fn add_received(&self, handler: ReceivedHandler) {
        self.inner.shared.hooks.lock().on_received.push(handler);
    }

    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            // Shutdown may be requested from a callback on the I/O thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Channel for Transport {
    fn send(&self, message: Value) -> Result<()> {
        Transport::send(self, message)
    }

    fn on_connected(&self, handler: ConnectedHandler) {
        self.add_connected(handler);
    }

    fn on_received(&self, handler: ReceivedHandler) {
        self.add_received(handler);
    }

    fn is_connected(&self) -> bool {
        Transport::is_connected(self)
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl Shared {
    fn mark_connected(&self) {
        let handlers = {
            let mut hooks = self.hooks.lock();
            hooks.connected = true;
            hooks.on_connected.clone()
        };
        for handler in handlers {
            handler();
        }
    }

    fn mark_disconnected(&self) {
        self.hooks.lock().connected = false;
    }

    fn deliver(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(address = %self.address, error = %err, "dropping undecodable inbound text");
                return;
            }
        };
        let handlers = self.hooks.lock().on_received.clone();
        for handler in handlers {
            handler(&message);
        }
    }
}

enum Outcome {
    Closed,
    SendFailed,
    Shutdown,
}

struct Worker {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    backlog: VecDeque<String>,
    backoff: Duration,
}

impl Worker {
    fn run(mut self) {
        let address = self.shared.address.clone();
        let mut retried_send = false;
        loop {
            let outcome = match self.connector.connect() {
                Ok(socket) => {
                    info!(%address, backlog = self.backlog.len(), "connected");
                    self.shared.mark_connected();
                    let outcome = self.pump(socket);
                    self.shared.mark_disconnected();
                    outcome
                }
                Err(err) => {
                    warn!(%address, error = %err, "connect failed");
                    Outcome::Closed
                }
            };

            match outcome {
                Outcome::Shutdown => break,
                Outcome::SendFailed if !retried_send => {
                    retried_send = true;
                    info!(%address, "send failed, reconnecting immediately");
                    continue;
                }
                Outcome::SendFailed | Outcome::Closed => {
                    info!(%address, backoff_ms = self.backoff.as_millis() as u64, "disconnected");
                }
            }
            retried_send = false;
            if !self.wait_backoff() {
                break;
            }
        }
        debug!(%address, dropped = self.backlog.len(), "transport stopped");
    }

    fn pump(&mut self, mut socket: Box<dyn Socket>) -> Outcome {
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(Command::Send(text)) => self.backlog.push_back(text),
                    Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                        socket.close();
                        return Outcome::Shutdown;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            while let Some(text) = self.backlog.front() {
                if let Err(err) = socket.send_text(text) {
                    warn!(address = %self.shared.address, error = %err, "send failed");
                    return Outcome::SendFailed;
                }
                self.backlog.pop_front();
            }

            match socket.poll_text() {
                Ok(Some(text)) => self.shared.deliver(&text),
                Ok(None) => {}
                Err(TransportError::Closed) => return Outcome::Closed,
                Err(err) => {
                    warn!(address = %self.shared.address, error = %err, "read failed");
                    return Outcome::Closed;
                }
            }
        }
    }

    /// Sleeps out the backoff while still accepting commands.
    /// Returns false once the transport is shutting down.
    fn wait_backoff(&mut self) -> bool {
        let deadline = Instant::now() + self.backoff;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match self.commands.recv_timeout(deadline - now) {
                Ok(Command::Send(text)) => {
                    self.backlog.push_back(text);
                    let held = self.backlog.len();
                    if held.is_power_of_two() {
                        info!(
                            address = %self.shared.address,
                            held,
                            "holding outbound messages until reconnect"
                        );
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }
}
