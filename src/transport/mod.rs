//! Byte-stream transport
//!
//! Owns the outbound byte queue to a connected channel. Submitting a
//! buffer never blocks the caller: buffers go into an unbounded channel
//! consumed by a dedicated writer task. The transport tracks bytes in
//! queue (clamped at zero), samples the achieved output bitrate over a
//! one-second window, and tears down terminally on channel error or
//! end-of-stream. Reconnect policy belongs to the caller.

pub mod handshake;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::event::StreamEvent;
use crate::telemetry::SharedStats;

pub use handshake::handshake;

struct TransportShared {
    bytes_in_queue: AtomicI64,
    total_bytes_out: AtomicU64,
    total_bytes_in: AtomicU64,
    /// Bytes written during the current one-second window
    window_bytes: AtomicU64,
    output_bitrate: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    stats: SharedStats,
    events: broadcast::Sender<StreamEvent>,
}

impl TransportShared {
    /// Terminal tear-down; safe to call from any task, only the first
    /// call has an effect
    fn teardown(&self, closed_tx: &watch::Sender<bool>, disconnected: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = closed_tx.send(true);
        if disconnected {
            tracing::warn!("transport closed by peer or error");
            let _ = self.events.send(StreamEvent::ConnectClosed);
        } else {
            tracing::debug!("transport closed");
        }
    }
}

/// Queued writer over a connected byte channel
pub struct Transport {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<TransportShared>,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl Transport {
    /// Take ownership of a connected channel and start the writer,
    /// reader and timeout tasks
    pub fn spawn<C>(
        io: C,
        config: &TransportConfig,
        stats: SharedStats,
        events: broadcast::Sender<StreamEvent>,
    ) -> Arc<Self>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(TransportShared {
            bytes_in_queue: AtomicI64::new(0),
            total_bytes_out: AtomicU64::new(0),
            total_bytes_in: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            output_bitrate: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats,
            events,
        });

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(writer_loop(
            write_half,
            rx,
            shared.clone(),
            closed_tx.clone(),
            closed_rx.clone(),
        )));
        tasks.push(tokio::spawn(reader_loop(
            read_half,
            inbound_tx,
            config.window_size,
            shared.clone(),
            closed_tx.clone(),
            closed_rx.clone(),
        )));
        tasks.push(tokio::spawn(timeout_loop(
            config.connect_timeout(),
            shared.clone(),
            closed_tx.clone(),
            closed_rx,
        )));

        Arc::new(Self {
            tx,
            shared,
            closed_tx,
            tasks: Mutex::new(tasks),
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Queue a buffer for output. Returns the number of bytes accepted;
    /// zero when the transport is already closed.
    pub fn write(&self, data: Bytes) -> usize {
        if self.shared.closed.load(Ordering::SeqCst) {
            tracing::debug!("dropping {} bytes, transport closed", data.len());
            return 0;
        }
        let len = data.len();
        self.shared.bytes_in_queue.fetch_add(len as i64, Ordering::Relaxed);
        self.shared.stats.add_queued_bytes(len);
        if self.tx.send(data).is_err() {
            // Writer already gone; undo the accounting
            sub_clamped(&self.shared.bytes_in_queue, len);
            self.shared.stats.sub_queued_bytes(len);
            return 0;
        }
        len
    }

    /// Mark the handshake as complete, disarming the connect timeout
    pub fn set_connected(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
        tracing::info!("transport connected");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Bytes accepted for output but not yet written
    pub fn bytes_in_queue(&self) -> u64 {
        self.shared.bytes_in_queue.load(Ordering::Relaxed).max(0) as u64
    }

    /// Bytes written per second over the last window
    pub fn output_bitrate(&self) -> u64 {
        self.shared.output_bitrate.load(Ordering::Relaxed)
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.shared.total_bytes_out.load(Ordering::Relaxed)
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.shared.total_bytes_in.load(Ordering::Relaxed)
    }

    /// Inbound byte stream for a caller-side command parser; can only
    /// be taken once
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().take()
    }

    /// Close both directions and cancel pending tasks. Idempotent;
    /// double-close is a no-op.
    pub fn close(&self) {
        self.shared.teardown(&self.closed_tx, false);
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn sub_clamped(counter: &AtomicI64, len: usize) {
    let previous = counter.fetch_sub(len as i64, Ordering::Relaxed);
    if previous - (len as i64) < 0 {
        counter.store(0, Ordering::Relaxed);
    }
}

async fn writer_loop<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<TransportShared>,
    closed_tx: watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut window_started = Instant::now();

    loop {
        tokio::select! {
            buffer = rx.recv() => {
                let Some(buffer) = buffer else { break };
                let len = buffer.len();
                if let Err(e) = writer.write_all(&buffer).await {
                    tracing::error!("transport write failed: {e}");
                    shared.teardown(&closed_tx, true);
                    break;
                }
                shared.total_bytes_out.fetch_add(len as u64, Ordering::Relaxed);
                shared.window_bytes.fetch_add(len as u64, Ordering::Relaxed);
                sub_clamped(&shared.bytes_in_queue, len);
                shared.stats.sub_queued_bytes(len);
            }
            _ = interval.tick() => {
                let elapsed = window_started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let bytes = shared.window_bytes.swap(0, Ordering::Relaxed);
                    let rate = (bytes as f64 / elapsed) as u64;
                    shared.output_bitrate.store(rate, Ordering::Relaxed);
                    shared.stats.set_output_bitrate(rate);
                }
                window_started = Instant::now();
            }
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop<R>(
    mut reader: tokio::io::ReadHalf<R>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    window_size: usize,
    shared: Arc<TransportShared>,
    closed_tx: watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buffer = vec![0u8; window_size];
    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("transport end of stream");
                        shared.teardown(&closed_tx, true);
                        break;
                    }
                    Ok(n) => {
                        shared.total_bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                        let _ = inbound_tx.send(Bytes::copy_from_slice(&buffer[..n]));
                    }
                    Err(e) => {
                        tracing::error!("transport read failed: {e}");
                        shared.teardown(&closed_tx, true);
                        break;
                    }
                }
            }
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn timeout_loop(
    timeout: std::time::Duration,
    shared: Arc<TransportShared>,
    closed_tx: watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            if !shared.connected.load(Ordering::SeqCst)
                && !shared.closed.load(Ordering::SeqCst)
            {
                tracing::error!("connect timeout after {} seconds", timeout.as_secs());
                let _ = shared
                    .events
                    .send(StreamEvent::ConnectTimeout { seconds: timeout.as_secs() });
                shared.teardown(&closed_tx, false);
            }
        }
        _ = closed_rx.changed() => {}
    }
}

/// Connect over TCP, run the handshake within the configured timeout
/// and hand the socket to a transport
pub async fn connect(
    addr: &str,
    config: &TransportConfig,
    stats: SharedStats,
    events: broadcast::Sender<StreamEvent>,
) -> Result<Arc<Transport>> {
    let attempt = async {
        let mut socket = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        handshake::handshake(&mut socket)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        Ok::<_, TransportError>(socket)
    };

    let socket = match tokio::time::timeout(config.connect_timeout(), attempt).await {
        Ok(result) => result?,
        Err(_) => {
            let seconds = config.connect_timeout().as_secs();
            let _ = events.send(StreamEvent::ConnectTimeout { seconds });
            return Err(TransportError::Timeout(seconds).into());
        }
    };

    let transport = Transport::spawn(socket, config, stats, events);
    transport.set_connected();
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StreamStats;
    use std::time::Duration;

    fn make_transport(
        io: tokio::io::DuplexStream,
        timeout_secs: u64,
    ) -> (Arc<Transport>, broadcast::Receiver<StreamEvent>) {
        let config = TransportConfig {
            connect_timeout_secs: timeout_secs,
            window_size: 1024,
        };
        let (events, events_rx) = broadcast::channel(64);
        let transport = Transport::spawn(io, &config, StreamStats::new(), events);
        (transport, events_rx)
    }

    #[tokio::test]
    async fn test_queue_drains_to_zero() {
        let (io, mut peer) = tokio::io::duplex(64 * 1024);
        let (transport, _events) = make_transport(io, 15);
        transport.set_connected();

        let accepted = transport.write(Bytes::from_static(&[1; 4096]));
        assert_eq!(accepted, 4096);

        let mut received = vec![0u8; 4096];
        peer.read_exact(&mut received).await.unwrap();
        // Give the writer task a moment to settle the counter
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.bytes_in_queue(), 0);
        assert_eq!(transport.total_bytes_out(), 4096);
    }

    #[tokio::test]
    async fn test_write_after_close_is_noop() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (transport, _events) = make_transport(io, 15);
        transport.close();
        assert_eq!(transport.write(Bytes::from_static(&[1; 100])), 0);
        assert_eq!(transport.bytes_in_queue(), 0);
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (transport, _events) = make_transport(io, 15);
        transport.close();
        transport.close();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_and_notifies() {
        let (io, peer) = tokio::io::duplex(1024);
        let (transport, mut events) = make_transport(io, 15);
        transport.set_connected();
        drop(peer);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StreamEvent::ConnectClosed));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fires_once() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (transport, mut events) = make_transport(io, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let event = events.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::ConnectTimeout { seconds: 1 }));
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_connected_disarms_timeout() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (transport, mut events) = make_transport(io, 1);
        transport.set_connected();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(events.try_recv().is_err());
        assert!(!transport.is_closed());
    }
}
