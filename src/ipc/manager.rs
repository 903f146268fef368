//! Per-app owner of named bus sockets.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::TopicFrame;
use super::message::{IpcPayload, MessageContent, encode_envelope};
use super::socket::{DEFAULT_HIGH_WATER_MARK, IpcSocket, SocketSpec};
use super::Topic;
use crate::{GdsError, Result};

/// How long shutdown waits for queued frames to leave.
const DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Handles every message arriving on one topic.
#[async_trait]
pub trait TopicHandler: Send {
    async fn handle(&mut self, payload: IpcPayload) -> Result<()>;
}

#[async_trait]
impl<F, Fut> TopicHandler for F
where
    F: FnMut(IpcPayload) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&mut self, payload: IpcPayload) -> Result<()> {
        (self)(payload).await
    }
}

pub struct IpcAppManagerBuilder {
    name: String,
    host: String,
    port_offset: u16,
    high_water_mark: usize,
    sockets: Vec<(String, SocketSpec)>,
}

impl IpcAppManagerBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port_offset(mut self, offset: u16) -> Self {
        self.port_offset = offset;
        self
    }

    /// Frames each socket queues before dropping the oldest.
    pub fn high_water_mark(mut self, frames: usize) -> Self {
        self.high_water_mark = frames;
        self
    }

    pub fn socket(mut self, name: impl Into<String>, spec: SocketSpec) -> Self {
        self.sockets.push((name.into(), spec));
        self
    }

    pub fn sockets(mut self, specs: impl IntoIterator<Item = (String, SocketSpec)>) -> Self {
        self.sockets.extend(specs);
        self
    }

    /// Opens every socket. `shutdown` is the app-wide token; once cancelled,
    /// reads return [`GdsError::Shutdown`].
    pub async fn build(self, shutdown: CancellationToken) -> Result<IpcAppManager> {
        let mut sockets = BTreeMap::new();
        for (name, spec) in self.sockets {
            if sockets.contains_key(&name) {
                return Err(GdsError::config(format!("socket '{name}' declared twice")));
            }
            let socket =
                IpcSocket::open(&name, spec, &self.host, self.port_offset, self.high_water_mark, shutdown.clone())
                    .await?;
            sockets.insert(name, socket);
        }
        info!(app = %self.name, sockets = sockets.len(), "IPC ready");
        Ok(IpcAppManager { name: self.name, sockets, handlers: HashMap::new(), shutdown })
    }
}

/// Sockets, handlers and shutdown for one app.
pub struct IpcAppManager {
    name: String,
    sockets: BTreeMap<String, IpcSocket>,
    handlers: HashMap<Topic, Box<dyn TopicHandler>>,
    shutdown: CancellationToken,
}

impl IpcAppManager {
    pub fn builder(name: impl Into<String>) -> IpcAppManagerBuilder {
        IpcAppManagerBuilder {
            name: name.into(),
            host: "127.0.0.1".into(),
            port_offset: 0,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            sockets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn socket(&self, name: &str) -> Result<&IpcSocket> {
        self.sockets.get(name).ok_or_else(|| GdsError::UnknownSocket { name: name.into() })
    }

    fn socket_mut(&mut self, name: &str) -> Result<&mut IpcSocket> {
        self.sockets.get_mut(name).ok_or_else(|| GdsError::UnknownSocket { name: name.into() })
    }

    pub fn socket_names(&self) -> impl Iterator<Item = &str> {
        self.sockets.keys().map(String::as_str)
    }

    /// Waits until `socket` has at least `n` peers.
    pub async fn wait_for_peers(&mut self, socket: &str, n: usize, timeout: Duration) -> Result<()> {
        let socket = self.socket_mut(socket)?;
        tokio::time::timeout(timeout, socket.wait_for_peers(n))
            .await
            .map_err(|_| GdsError::Timeout { duration: timeout })?
    }

    /// Publishes `content` on its topic. A message that fails to serialize
    /// is logged and dropped; only socket-level failures are returned.
    pub fn send_to(&self, socket: &str, content: &MessageContent) -> Result<()> {
        let socket = self.socket(socket)?;
        let envelope = match encode_envelope(content) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(socket = socket.name(), class = content.class(), "dropping message: {e}");
                return Ok(());
            }
        };
        socket.send(TopicFrame::new(content.topic(), envelope))
    }

    /// Next message on `socket`. Messages that fail to decode are logged and
    /// skipped.
    pub async fn read(&mut self, socket: &str) -> Result<IpcPayload> {
        let socket = self.socket_mut(socket)?;
        loop {
            let frame = socket.recv().await?;
            match IpcPayload::from_frame(frame) {
                Ok(payload) => return Ok(payload),
                Err(e) => error!(socket = socket.name(), "dropping message: {e}"),
            }
        }
    }

    /// [`read`](Self::read) with an optional deadline. On timeout the socket
    /// is left as it was and nothing is lost.
    pub async fn read_from(&mut self, socket: &str, timeout: Option<Duration>) -> Result<IpcPayload> {
        match timeout {
            None => self.read(socket).await,
            Some(duration) => tokio::time::timeout(duration, self.read(socket))
                .await
                .map_err(|_| GdsError::Timeout { duration })?,
        }
    }

    /// Registers the handler for `topic`, replacing any earlier one.
    pub fn on(&mut self, topic: Topic, handler: impl TopicHandler + 'static) {
        if self.handlers.insert(topic, Box::new(handler)).is_some() {
            debug!(app = %self.name, %topic, "replaced topic handler");
        }
    }

    /// Hands `payload` to its topic's handler. Returns whether one was
    /// registered.
    pub async fn dispatch(&mut self, payload: IpcPayload) -> Result<bool> {
        let topic = payload.topic;
        match self.handlers.get_mut(&topic) {
            Some(handler) => handler.handle(payload).await.map(|()| true),
            None => {
                debug!(app = %self.name, %topic, "no handler");
                Ok(false)
            }
        }
    }

    /// Reads `socket` and dispatches until shutdown. Handler errors are
    /// logged and reading continues.
    pub async fn run(&mut self, socket: &str) -> Result<()> {
        loop {
            let payload = match self.read(socket).await {
                Ok(payload) => payload,
                Err(GdsError::Shutdown) => return Ok(()),
                Err(e) => return Err(e),
            };
            let topic = payload.topic;
            if let Err(e) = self.dispatch(payload).await {
                warn!(app = %self.name, %topic, "handler failed: {e}");
            }
        }
    }

    /// Signals shutdown, drains outbound queues once and closes every
    /// socket.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for socket in self.sockets.values() {
            socket.flush(DRAIN_LIMIT).await;
        }
        for socket in self.sockets.values_mut() {
            socket.close().await;
        }
        info!(app = %self.name, "IPC closed");
    }

    pub fn is_closed(&self) -> bool {
        self.sockets.values().all(IpcSocket::is_closed)
    }
}
