//! Driver spawns and manages the task that owns a transceiver

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::Transceiver;
use crate::codec::packet::Packet;
use crate::retry::backoff;

/// Consecutive failures tolerated before the driver gives up.
pub const MAX_ERRORS: u32 = 10;

/// Depth of the packet and uplink queues.
const QUEUE_DEPTH: usize = 256;

/// Link state as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Starting,
    Up,
    /// Retrying after `errors` consecutive failures.
    Degraded { errors: u32 },
    Down,
}

/// Handles returned by [`TransceiverDriver::spawn`]
pub struct DriverChannels {
    /// Downlinked packets, in arrival order
    pub packets: mpsc::Receiver<Packet>,
    /// Uplink packets to send, before framing
    pub uplink: mpsc::Sender<Vec<u8>>,
    pub status: watch::Receiver<LinkStatus>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

impl DriverChannels {
    /// Link status as a stream, starting with the current value.
    pub fn status_updates(&self) -> impl Stream<Item = LinkStatus> + 'static {
        WatchStream::new(self.status.clone())
    }
}

pub struct TransceiverDriver;

impl TransceiverDriver {
    /// Spawn the reader task for `xcvr`, cancelled with `cancel`.
    pub fn spawn<T>(xcvr: T, cancel: CancellationToken) -> DriverChannels
    where
        T: Transceiver,
    {
        let (packet_tx, packet_rx) = mpsc::channel(QUEUE_DEPTH);
        let (uplink_tx, uplink_rx) = mpsc::channel(QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Starting);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            Self::run(xcvr, packet_tx, uplink_rx, status_tx, task_cancel).await;
        });

        DriverChannels { packets: packet_rx, uplink: uplink_tx, status: status_rx, cancel }
    }

    async fn run<T>(
        mut xcvr: T,
        packet_tx: mpsc::Sender<Packet>,
        mut uplink_rx: mpsc::Receiver<Vec<u8>>,
        status_tx: watch::Sender<LinkStatus>,
        cancel: CancellationToken,
    ) where
        T: Transceiver,
    {
        let name = xcvr.name().to_string();
        info!("{name} driver started");
        let mut packet_count = 0u64;
        let mut error_count = 0u32;
        let mut started = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !started {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = xcvr.begin() => result,
                };
                match result {
                    Ok(()) => {
                        started = true;
                        error_count = 0;
                        let _ = status_tx.send(LinkStatus::Up);
                    }
                    Err(e) => {
                        error_count += 1;
                        error!("{name} failed to start ({error_count}/{MAX_ERRORS}): {e}");
                        if error_count >= MAX_ERRORS || !e.is_retryable() {
                            break;
                        }
                        let _ = status_tx.send(LinkStatus::Degraded { errors: error_count });
                        tokio::time::sleep(backoff(error_count)).await;
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("{name} driver cancelled");
                    break;
                }
                Some(bytes) = uplink_rx.recv() => {
                    if let Err(e) = xcvr.send_byte_packet(&bytes).await {
                        warn!("{name} uplink of {} bytes failed: {e}", bytes.len());
                    }
                }
                result = xcvr.read() => match result {
                    Ok(packets) => {
                        if error_count > 0 {
                            let _ = status_tx.send(LinkStatus::Up);
                        }
                        error_count = 0;
                        for packet in packets {
                            packet_count += 1;
                            trace!("{name} packet {packet_count}: {packet}");
                            if packet_tx.send(packet).await.is_err() {
                                debug!("Packet receiver dropped, shutting down");
                                let _ = status_tx.send(LinkStatus::Down);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error_count += 1;
                        error!("{name} read error ({error_count}/{MAX_ERRORS}): {e}");
                        if error_count >= MAX_ERRORS {
                            error!("Too many {name} errors, shutting down");
                            break;
                        }
                        let _ = status_tx.send(LinkStatus::Degraded { errors: error_count });
                        tokio::time::sleep(backoff(error_count)).await;
                        if let Err(e) = xcvr.restart().await {
                            warn!("{name} restart failed: {e}");
                        }
                    }
                }
            }
        }

        let _ = status_tx.send(LinkStatus::Down);
        info!("{name} driver ended (forwarded {packet_count} packets)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::PacketKind;
    use crate::{GdsError, Result};
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;

    /// Scripted transceiver: each read pops the next outcome.
    struct Scripted {
        reads: Vec<Result<Vec<Packet>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        restarts: Arc<Mutex<u32>>,
    }

    fn packet() -> Packet {
        Packet::new(PacketKind::Unsupported { annotation: None }, Default::default())
    }

    #[async_trait::async_trait]
    impl Transceiver for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn begin(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Vec<Packet>> {
            if self.reads.is_empty() {
                std::future::pending::<()>().await;
            }
            self.reads.remove(0)
        }

        async fn restart(&mut self) -> Result<()> {
            *self.restarts.lock().unwrap() += 1;
            Ok(())
        }

        async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_packets_and_restarts_after_errors() {
        let restarts = Arc::new(Mutex::new(0));
        let xcvr = Scripted {
            reads: vec![
                Ok(vec![packet(), packet()]),
                Err(GdsError::connection_lost("unplugged")),
                Ok(vec![packet()]),
            ],
            sent: Default::default(),
            restarts: restarts.clone(),
        };
        let mut channels = TransceiverDriver::spawn(xcvr, CancellationToken::new());
        for _ in 0..3 {
            assert!(channels.packets.recv().await.is_some());
        }
        assert_eq!(*restarts.lock().unwrap(), 1);
        assert_eq!(*channels.status.borrow(), LinkStatus::Up);
        channels.cancel.cancel();
        assert!(channels.packets.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_errors() {
        let xcvr = Scripted {
            reads: (0..MAX_ERRORS).map(|_| Err(GdsError::connection_lost("gone"))).collect(),
            sent: Default::default(),
            restarts: Default::default(),
        };
        let mut channels = TransceiverDriver::spawn(xcvr, CancellationToken::new());
        assert!(channels.packets.recv().await.is_none());
        assert_eq!(*channels.status.borrow(), LinkStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn status_stream_ends_down() {
        use futures::StreamExt;

        let xcvr = Scripted {
            reads: vec![Err(GdsError::connection_lost("flaky"))],
            sent: Default::default(),
            restarts: Default::default(),
        };
        let channels = TransceiverDriver::spawn(xcvr, CancellationToken::new());
        let updates = channels.status_updates();
        tokio::time::sleep(Duration::from_secs(1)).await;
        channels.cancel.cancel();
        let seen: Vec<LinkStatus> = updates.collect().await;
        assert_eq!(seen.last(), Some(&LinkStatus::Down));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_uplink_requests() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let xcvr = Scripted { reads: vec![], sent: sent.clone(), restarts: Default::default() };
        let channels = TransceiverDriver::spawn(xcvr, CancellationToken::new());
        channels.uplink.send(vec![1, 2, 3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent.lock().unwrap().as_slice(), &[vec![1, 2, 3]]);
        channels.cancel.cancel();
    }
}
