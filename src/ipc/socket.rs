//! Bus sockets over local TCP.
//!
//! A socket either listens on its port or keeps dialling it, and may hold
//! any number of peer connections. Each peer gets its own task which reads
//! frames into the socket's inbound queue and writes frames from the
//! outbound queue. Both queues are bounded broadcast channels: a reader that
//! falls behind loses the oldest frames and is told how many.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::{IpcCodec, TopicFrame};
use super::{Port, SocketType, Topic};
use crate::retry::backoff;
use crate::{GdsError, Result};

/// Frames a socket queues before the oldest are dropped.
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024;

/// How a socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketSpec {
    pub sock_type: SocketType,
    pub port: Port,
    /// Subscription list. Empty means every topic.
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Listen instead of dial. Defaults by socket type.
    #[serde(default)]
    pub bind: Option<bool>,
}

impl SocketSpec {
    pub fn new(sock_type: SocketType, port: Port) -> Self {
        Self { sock_type, port, topics: Vec::new(), bind: None }
    }

    pub fn publisher(port: Port) -> Self {
        Self::new(SocketType::Publisher, port)
    }

    pub fn subscriber(port: Port, topics: impl IntoIterator<Item = Topic>) -> Self {
        Self { topics: topics.into_iter().collect(), ..Self::new(SocketType::Subscriber, port) }
    }

    pub fn server(port: Port) -> Self {
        Self::new(SocketType::Server, port)
    }

    pub fn client(port: Port) -> Self {
        Self::new(SocketType::Client, port)
    }

    pub fn with_bind(mut self, bind: bool) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn binds(&self) -> bool {
        self.bind.unwrap_or_else(|| self.sock_type.binds_by_default())
    }
}

#[derive(Debug, Clone)]
struct Inbound {
    peer: u64,
    frame: TopicFrame,
}

#[derive(Debug, Clone)]
struct Outbound {
    /// `None` goes to every peer.
    peer: Option<u64>,
    frame: TopicFrame,
}

/// State shared by a socket and its peer tasks.
#[derive(Clone)]
struct PeerContext {
    socket: Arc<str>,
    topics: Arc<[Topic]>,
    receives: bool,
    inbound: broadcast::Sender<Inbound>,
    outbound: broadcast::Sender<Outbound>,
    next_id: Arc<AtomicU64>,
    peers: Arc<watch::Sender<usize>>,
}

/// One named socket on the bus.
pub struct IpcSocket {
    name: String,
    spec: SocketSpec,
    addr: SocketAddr,
    ctx: PeerContext,
    inbound: broadcast::Receiver<Inbound>,
    peers: watch::Receiver<usize>,
    last_peer: Option<u64>,
    /// App-wide shutdown, observed by `recv`.
    shutdown: CancellationToken,
    /// Stops this socket's own tasks.
    close: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for IpcSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcSocket")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("addr", &self.addr)
            .field("peers", &*self.peers.borrow())
            .finish()
    }
}

impl IpcSocket {
    /// Opens the socket. Listening sockets bind before returning, so a busy
    /// port is reported here; dialling sockets keep retrying in the
    /// background until a peer answers.
    pub async fn open(
        name: impl Into<String>,
        spec: SocketSpec,
        host: &str,
        port_offset: u16,
        high_water_mark: usize,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let name = name.into();
        let port = spec.port.number(port_offset);
        let capacity = high_water_mark.max(1);
        let (inbound_tx, inbound) = broadcast::channel(capacity);
        let (outbound, _) = broadcast::channel(capacity);
        let (peers_tx, peers) = watch::channel(0);
        let ctx = PeerContext {
            socket: Arc::from(name.as_str()),
            topics: spec.topics.clone().into(),
            receives: spec.sock_type.can_receive(),
            inbound: inbound_tx,
            outbound,
            next_id: Arc::new(AtomicU64::new(0)),
            peers: Arc::new(peers_tx),
        };
        let close = CancellationToken::new();

        let (addr, task) = if spec.binds() {
            let listener = TcpListener::bind((host, port)).await.map_err(|e| {
                GdsError::connection_lost_with_source(format!("{name}: cannot bind {host}:{port}"), Box::new(e))
            })?;
            let addr = listener.local_addr()?;
            info!(socket = %name, kind = ?spec.sock_type, %addr, "listening on {}", spec.port);
            (addr, tokio::spawn(listen(listener, ctx.clone(), close.clone())))
        } else {
            let addr = tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| GdsError::config(format!("{name}: {host} does not resolve")))?;
            info!(socket = %name, kind = ?spec.sock_type, %addr, "dialling {}", spec.port);
            (addr, tokio::spawn(dial(addr, ctx.clone(), close.clone())))
        };

        Ok(Self { name, spec, addr, ctx, inbound, peers, last_peer: None, shutdown, close, task: Some(task) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &SocketSpec {
        &self.spec
    }

    /// Bound address for listening sockets, dialled address otherwise.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Peers currently connected.
    pub fn peers(&self) -> usize {
        *self.peers.borrow()
    }

    /// Waits until at least `n` peers are connected.
    pub async fn wait_for_peers(&mut self, n: usize) -> Result<()> {
        let name = &self.name;
        self.peers
            .wait_for(|count| *count >= n)
            .await
            .map(|_| ())
            .map_err(|_| GdsError::connection_lost(format!("{name} closed while waiting for peers")))
    }

    /// Queues `frame` for sending. Servers reply to the peer they last read
    /// from; everything else fans out. Never waits on slow peers.
    pub fn send(&self, frame: TopicFrame) -> Result<()> {
        if !self.spec.sock_type.can_send() {
            return Err(GdsError::config(format!("{} is a {:?} and cannot send", self.name, self.spec.sock_type)));
        }
        if self.close.is_cancelled() {
            return Err(GdsError::connection_lost(format!("{} is closed", self.name)));
        }
        let peer = match self.spec.sock_type {
            SocketType::Server => self.last_peer,
            _ => None,
        };
        if self.ctx.outbound.send(Outbound { peer, frame }).is_err() {
            trace!(socket = %self.name, "no peers, frame dropped");
        }
        Ok(())
    }

    /// Next frame matching the subscription list.
    ///
    /// Returns [`GdsError::Shutdown`] once shutdown is signalled. Dropping
    /// the future loses nothing.
    pub async fn recv(&mut self) -> Result<TopicFrame> {
        if !self.spec.sock_type.can_receive() {
            return Err(GdsError::config(format!("{} is a {:?} and cannot receive", self.name, self.spec.sock_type)));
        }
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(GdsError::Shutdown),
                received = self.inbound.recv() => received,
            };
            match received {
                Ok(Inbound { peer, frame }) => {
                    self.last_peer = Some(peer);
                    return Ok(frame);
                }
                Err(RecvError::Lagged(dropped)) => {
                    warn!(socket = %self.name, dropped, "inbound queue overflowed, dropped oldest frames");
                }
                Err(RecvError::Closed) => {
                    return Err(GdsError::connection_lost(format!("{} inbound queue closed", self.name)));
                }
            }
        }
    }

    /// Waits up to `limit` for peers to take every queued outbound frame.
    pub async fn flush(&self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while self.ctx.outbound.len() > 0 && self.peers() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(socket = %self.name, queued = self.ctx.outbound.len(), "closing with frames still queued");
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stops every task of this socket and waits for them to finish. Peers
    /// see their connection closed.
    pub async fn close(&mut self) {
        self.close.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(socket = %self.name, "socket task ended abnormally: {e}");
            }
            debug!(socket = %self.name, "closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for IpcSocket {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

async fn listen(listener: TcpListener, ctx: PeerContext, close: CancellationToken) {
    let mut peers = JoinSet::new();
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(socket = %ctx.socket, %remote, "peer connected");
                    peers.spawn(run_peer(stream, ctx.clone(), close.clone()));
                }
                Err(e) => warn!(socket = %ctx.socket, "accept failed: {e}"),
            },
            Some(_) = peers.join_next(), if !peers.is_empty() => {}
        }
    }
    drop(listener);
    while peers.join_next().await.is_some() {}
}

async fn dial(addr: SocketAddr, ctx: PeerContext, close: CancellationToken) {
    let mut failures = 0u32;
    loop {
        let connected = tokio::select! {
            _ = close.cancelled() => break,
            connected = TcpStream::connect(addr) => connected,
        };
        match connected {
            Ok(stream) => {
                failures = 0;
                debug!(socket = %ctx.socket, %addr, "connected");
                run_peer(stream, ctx.clone(), close.clone()).await;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                if failures == 1 {
                    debug!(socket = %ctx.socket, %addr, "waiting for peer: {e}");
                }
            }
        }
        tokio::select! {
            _ = close.cancelled() => break,
            _ = tokio::time::sleep(backoff(failures)) => {}
        }
    }
}

async fn run_peer(stream: TcpStream, ctx: PeerContext, close: CancellationToken) {
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        debug!(socket = %ctx.socket, peer = id, "could not disable Nagle: {e}");
    }
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, IpcCodec::default());
    let mut writer = FramedWrite::new(write, IpcCodec::default());
    let mut outbound = ctx.outbound.subscribe();
    ctx.peers.send_modify(|n| *n += 1);

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    if !ctx.receives {
                        trace!(socket = %ctx.socket, peer = id, "ignoring frame on a send-only socket");
                    } else if frame.matches(&ctx.topics) {
                        let _ = ctx.inbound.send(Inbound { peer: id, frame });
                    } else {
                        trace!(socket = %ctx.socket, peer = id, "frame outside subscription");
                    }
                }
                Some(Err(e)) => {
                    warn!(socket = %ctx.socket, peer = id, "dropping peer after bad frame: {e}");
                    break;
                }
                None => {
                    debug!(socket = %ctx.socket, peer = id, "peer disconnected");
                    break;
                }
            },
            out = outbound.recv() => match out {
                Ok(Outbound { peer, frame }) => {
                    if peer.is_none_or(|p| p == id)
                        && let Err(e) = writer.send(frame).await
                    {
                        warn!(socket = %ctx.socket, peer = id, "send failed: {e}");
                        break;
                    }
                }
                Err(RecvError::Lagged(dropped)) => {
                    warn!(socket = %ctx.socket, peer = id, dropped, "peer fell behind, dropped oldest frames");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    ctx.peers.send_modify(|n| *n = n.saturating_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "127.0.0.1";

    async fn pair(offset: u16, topics: Vec<Topic>) -> (IpcSocket, IpcSocket) {
        let shutdown = CancellationToken::new();
        let mut publisher = IpcSocket::open("pub", SocketSpec::publisher(Port::CommanderPub), HOST, offset, 8, shutdown.clone())
            .await
            .unwrap();
        let subscriber = IpcSocket::open("sub", SocketSpec::subscriber(Port::CommanderPub, topics), HOST, offset, 4, shutdown)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), publisher.wait_for_peers(1)).await.unwrap().unwrap();
        (publisher, subscriber)
    }

    #[tokio::test]
    async fn subscriber_filters_topics() {
        let (publisher, mut subscriber) = pair(1101, vec![Topic::UlPacket]).await;
        publisher.send(TopicFrame::new(Topic::DlPackets, &b"{}"[..])).unwrap();
        publisher.send(TopicFrame::new(Topic::UlPacket, &b"{\"n\":1}"[..])).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), subscriber.recv()).await.unwrap().unwrap();
        assert_eq!(frame.known_topic(), Some(Topic::UlPacket));
        assert_eq!(frame.envelope.as_ref(), b"{\"n\":1}");
    }

    #[tokio::test]
    async fn slow_subscriber_keeps_newest_frames() {
        let (publisher, mut subscriber) = pair(1102, Vec::new()).await;
        for n in 0..6u8 {
            publisher.send(TopicFrame::new(Topic::DlPackets, vec![n])).unwrap();
        }
        publisher.flush(Duration::from_secs(5)).await;
        // Give the subscriber's peer task time to push every frame through its
        // four-deep queue.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = tokio::time::timeout(Duration::from_secs(5), subscriber.recv()).await.unwrap().unwrap();
        assert_eq!(first.envelope.as_ref(), &[2]);
    }

    #[tokio::test]
    async fn subscribers_cannot_send() {
        let (_publisher, subscriber) = pair(1103, Vec::new()).await;
        assert!(subscriber.send(TopicFrame::new(Topic::DlPackets, vec![0])).is_err());
    }

    #[tokio::test]
    async fn shutdown_interrupts_recv_and_close_releases_port() {
        let shutdown = CancellationToken::new();
        let spec = SocketSpec::subscriber(Port::TransceiverSub, Vec::new()).with_bind(true);
        let mut socket = IpcSocket::open("sub", spec, HOST, 1110, 4, shutdown.clone()).await.unwrap();
        let addr = socket.addr();

        shutdown.cancel();
        assert!(matches!(socket.recv().await, Err(GdsError::Shutdown)));
        socket.close().await;
        assert!(socket.is_closed());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
