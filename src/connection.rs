// =============================================================================
// MESH CORE :: connection.rs
// One TCP link to an adjacent peer
// =============================================================================
//
// A Connection owns:
//   - the outbound queue drained by its write task
//   - PingStats, mutated by the heartbeat and the pong handler under one lock
//   - a cancellation token: the `disconnected` flag every per-connection task
//     checks at the top of its loop
//   - the JoinHandles of its tasks, joined by the node on removal
//
// Frames read off the socket are not routed here: the read task pushes them
// onto the node's event channel and the dispatcher handles them in order.
// =============================================================================

use crate::network::{decode_message, encode_message, Message};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

// -----------------------------------------------------------------------------
// PingStats
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PingStats {
    pub sum: u64,
    pub count: u64,
    /// Samples recorded over the connection lifetime, never reset
    pub samples: u64,
    pub current_ping: Option<u64>,
    pub last_ping_time: Instant,
}

impl PingStats {
    pub fn new() -> Self {
        PingStats {
            sum: 0,
            count: 0,
            samples: 0,
            current_ping: None,
            last_ping_time: Instant::now(),
        }
    }

    /// Accumulate one round trip. Returns the new `current_ping` when this
    /// sample triggered a recompute.
    pub fn record(&mut self, rtt: u64, lag: u64, update_rate: u64, dump_rate: u64) -> Option<u64> {
        self.sum += rtt;
        self.count += 1;
        self.samples += 1;
        self.last_ping_time = Instant::now();

        let mut updated = None;
        if self.samples % update_rate.max(1) == 0 {
            let ping = self.sum / self.count + lag;
            self.current_ping = Some(ping);
            updated = Some(ping);
        }
        if self.samples % dump_rate.max(1) == 0 {
            self.sum = 0;
            self.count = 0;
        }
        updated
    }

    /// A fresh connection is never timed out before its first round trip.
    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.samples > 0 && self.last_ping_time.elapsed() > timeout
    }
}

impl Default for PingStats {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub enum MeshEvent {
    Frame { from: String, message: Message },
    Closed { peer: String, id: u64 },
}

pub struct Connection {
    /// Distinguishes successive connections to the same peer name
    pub id: u64,
    pub local_name: String,
    pub peer_name: String,
    /// Address the peer advertised for introductions
    pub address: String,
    pub listening_port: u16,
    /// Remote port of this particular socket
    pub personal_port: u16,
    pub connected_at: Instant,
    stats: Mutex<PingStats>,
    lag_millis: AtomicU64,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Message>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        id: u64,
        local_name: &str,
        peer_name: &str,
        address: &str,
        listening_port: u16,
        personal_port: u16,
        queue_depth: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(queue_depth);
        let conn = Connection {
            id,
            local_name: local_name.to_string(),
            peer_name: peer_name.to_string(),
            address: address.to_string(),
            listening_port,
            personal_port,
            connected_at: Instant::now(),
            stats: Mutex::new(PingStats::new()),
            lag_millis: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            outbound,
            tasks: StdMutex::new(Vec::new()),
        };
        (conn, rx)
    }

    /// Queue a message for the write task. Never waits: a full queue or a
    /// closed connection drops the message and returns false.
    pub fn send(&self, message: Message) -> bool {
        if self.is_disconnected() {
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                log::warn!(
                    "[{}] Outbound queue to [{}] full, dropping {}",
                    self.local_name,
                    self.peer_name,
                    message.kind
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a route probe. Probes are the first traffic to go under load:
    /// they are only accepted while at least half of the queue is free, so
    /// pings and gossip still fit.
    pub fn send_probe(&self, message: Message) -> bool {
        if self.outbound.capacity() <= self.outbound.max_capacity() / 2 {
            log::debug!(
                "[{}] Queue to [{}] busy, skipping {}",
                self.local_name,
                self.peer_name,
                message.kind
            );
            return false;
        }
        self.send(message)
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn current_ping(&self) -> Option<u64> {
        self.stats.lock().await.current_ping
    }

    pub async fn stats(&self) -> PingStats {
        self.stats.lock().await.clone()
    }

    /// Forget the measured ping; the next recompute publishes a fresh one.
    pub async fn reset_ping(&self) {
        let mut stats = self.stats.lock().await;
        stats.current_ping = None;
        stats.sum = 0;
        stats.count = 0;
    }

    pub async fn record_rtt(&self, rtt: u64, update_rate: u64, dump_rate: u64) -> Option<u64> {
        let lag = self.lag();
        self.stats.lock().await.record(rtt, lag, update_rate, dump_rate)
    }

    pub async fn timed_out(&self, timeout: Duration) -> bool {
        self.stats.lock().await.timed_out(timeout)
    }

    pub fn set_lag(&self, millis: u64) {
        self.lag_millis.store(millis, Ordering::Relaxed);
    }

    pub fn lag(&self) -> u64 {
        self.lag_millis.load(Ordering::Relaxed)
    }

    pub fn attach_tasks(&self, handles: Vec<JoinHandle<()>>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    /// Wait up to `limit` for every attached task to exit, then abort the
    /// stragglers. Must not be called from one of those tasks.
    pub async fn join_tasks(&self, limit: Duration) {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let deadline = tokio::time::Instant::now() + limit;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("[{}] Task for [{}] ended badly: {}", self.local_name, self.peer_name, e);
                }
                Err(_) => {
                    log::warn!("[{}] Task for [{}] did not stop, aborting", self.local_name, self.peer_name);
                    handle.abort();
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Socket tasks
// -----------------------------------------------------------------------------

pub async fn read_loop<R>(
    conn: std::sync::Arc<Connection>,
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    events: mpsc::Sender<MeshEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = conn.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(bytes)) => match decode_message(&bytes) {
                Ok(message) => {
                    let event = MeshEvent::Frame {
                        from: conn.peer_name.clone(),
                        message,
                    };
                    // a full event queue holds this socket until the dispatcher catches up
                    let sent = tokio::select! {
                        _ = conn.cancelled() => break,
                        sent = events.send(event) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[{}] Dropping malformed frame from [{}]: {}",
                        conn.local_name,
                        conn.peer_name,
                        e
                    );
                }
            },
            Some(Err(e)) => {
                log::warn!("[{}] Read error from [{}]: {}", conn.local_name, conn.peer_name, e);
                break;
            }
            None => {
                log::info!("[{}] 👋 [{}] closed the connection", conn.local_name, conn.peer_name);
                break;
            }
        }
    }

    conn.disconnect();
    let closed = MeshEvent::Closed {
        peer: conn.peer_name.clone(),
        id: conn.id,
    };
    if events.send(closed).await.is_err() {
        log::debug!("[{}] Dispatcher gone, close of [{}] not reported", conn.local_name, conn.peer_name);
    }
}

pub async fn write_loop<W>(
    conn: std::sync::Arc<Connection>,
    mut writer: FramedWrite<W, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = conn.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match encode_message(&message) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[{}] Cannot encode {}: {}", conn.local_name, message.kind, e);
                continue;
            }
        };

        // a peer that stops reading blocks this send, so it must yield to cancel
        let written = tokio::select! {
            _ = conn.cancelled() => break,
            written = writer.send(frame) => written,
        };
        if let Err(e) = written {
            log::warn!("[{}] Write to [{}] failed: {}", conn.local_name, conn.peer_name, e);
            conn.disconnect();
            break;
        }
    }
}

/// Random delay before a periodic loop starts, so that connections opened
/// together do not tick in lockstep.
pub fn startup_jitter(rate: Duration) -> Duration {
    let max = rate.as_millis().min(u64::MAX as u128) as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}
