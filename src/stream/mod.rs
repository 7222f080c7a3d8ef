//! Publish/play stream lifecycle
//!
//! [`RtmpStream`] ties the transport, chunk codec, muxer, bitrate
//! controller and watchdog together behind a small async API. Lifecycle
//! operations (publish, play, close) are serialized on one lock, so
//! overlapping calls from different tasks run one at a time in arrival
//! order. A publish or play issued before the server has acknowledged
//! stream creation waits for the ready state to advance, bounded by the
//! transport connect timeout.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bitrate::{self, EncoderControl};
use crate::chunk::ChunkEncoder;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::event::StreamEvent;
use crate::message::{amf0::Amf0Value, Message, MessageKind};
use crate::monitor::{Stage, StateMonitor};
use crate::muxer::{EncodedSample, MediaChannel, Muxer};
use crate::telemetry::SharedStats;
use crate::transport::Transport;

/// Lifecycle states of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Connected, stream not yet created by the server
    Initialized,
    /// Stream created, no publish or play in flight
    Open,
    /// Play command sent, waiting for the server
    Play,
    /// Server acknowledged the play
    Playing,
    /// Publish command sent, waiting for the server
    Publish,
    /// Server acknowledged the publish; media is flowing
    Publishing,
    /// Terminal
    Closed,
}

/// How a published stream is stored on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Live,
    Record,
    Append,
    AppendWithGap,
    /// Publishes as `live` on the wire while a local recorder runs
    LocalRecord,
}

impl PublishMode {
    /// Mode string carried in the publish command
    pub fn wire_name(&self) -> &'static str {
        match self {
            PublishMode::Live | PublishMode::LocalRecord => "live",
            PublishMode::Record => "record",
            PublishMode::Append => "append",
            PublishMode::AppendWithGap => "appendWithGap",
        }
    }
}

/// Local sink for a `LocalRecord` publish session
pub trait Recorder: Send + Sync {
    fn start(&self, name: &str);
    fn stop(&self);
}

/// Counters surfaced through [`RtmpStream::info`]
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub resource_name: Option<String>,
    /// Wire bytes submitted since the last clear
    pub byte_count: u64,
    /// Bytes submitted during the last full second
    pub current_bytes_per_second: u64,
    /// Video messages submitted during the last full second
    pub current_fps: u64,
    previous_byte_count: u64,
    frame_count: u64,
}

impl StreamInfo {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn on_timer(&mut self) {
        self.current_bytes_per_second = self.byte_count.saturating_sub(self.previous_byte_count);
        self.previous_byte_count = self.byte_count;
        self.current_fps = self.frame_count;
        self.frame_count = 0;
    }
}

/// A client-side publish/play stream over one transport
pub struct RtmpStream {
    config: StreamConfig,
    transport: Arc<Transport>,
    stats: SharedStats,
    events: broadcast::Sender<StreamEvent>,
    monitor: Arc<StateMonitor>,
    encoder: Arc<dyn EncoderControl>,
    recorder: Option<Arc<dyn Recorder>>,

    state_tx: watch::Sender<ReadyState>,
    state_rx: watch::Receiver<ReadyState>,
    /// Serializes publish/play/close/send_data
    op_lock: tokio::sync::Mutex<()>,

    muxer: Mutex<Muxer>,
    chunks: Mutex<ChunkEncoder>,
    info: Mutex<StreamInfo>,
    mode: Mutex<PublishMode>,
    /// Media samples pass through only while publishing
    forwarding: AtomicBool,
    /// Stop signal for the bitrate control loop
    bitrate_running: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtmpStream {
    pub fn new(
        config: StreamConfig,
        transport: Arc<Transport>,
        stats: SharedStats,
        events: broadcast::Sender<StreamEvent>,
        encoder: Arc<dyn EncoderControl>,
        recorder: Option<Arc<dyn Recorder>>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ReadyState::Initialized);
        let monitor = StateMonitor::new(&config.monitor, stats.clone(), events.clone());
        let chunk_size = config.chunk_size;
        let stream = Arc::new(Self {
            config,
            transport,
            stats,
            events,
            monitor,
            encoder,
            recorder,
            state_tx,
            state_rx,
            op_lock: tokio::sync::Mutex::new(()),
            muxer: Mutex::new(Muxer::new()),
            chunks: Mutex::new(ChunkEncoder::new(chunk_size)),
            info: Mutex::new(StreamInfo::default()),
            mode: Mutex::new(PublishMode::Live),
            forwarding: AtomicBool::new(false),
            bitrate_running: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        stream.spawn_info_task();
        stream
    }

    /// Subscribe to stream and transport events
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state_rx.borrow()
    }

    /// Snapshot of the per-second counters
    pub fn info(&self) -> StreamInfo {
        self.info.lock().clone()
    }

    /// Watchdog handle for marking capture/encode stage activity
    pub fn monitor(&self) -> &Arc<StateMonitor> {
        &self.monitor
    }

    fn set_state(&self, next: ReadyState) {
        let current = *self.state_rx.borrow();
        if current != next {
            tracing::info!("stream state {current:?} -> {next:?}");
            let _ = self.state_tx.send(next);
        }
    }

    /// Block until the server has created the stream. Bounded by the
    /// connect timeout so a dead connection cannot hold the caller
    /// forever.
    async fn wait_ready(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        let wait = state_rx.wait_for(|state| *state != ReadyState::Initialized);
        let state = match tokio::time::timeout(self.config.transport.connect_timeout(), wait).await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(StreamError::Closed.into()),
            Err(_) => {
                tracing::warn!("dropping operation, stream never became ready");
                return Err(StreamError::ReadyTimeout.into());
            }
        };
        if state == ReadyState::Closed {
            return Err(StreamError::Closed.into());
        }
        Ok(())
    }

    fn send_message(&self, message: &Message) -> usize {
        let data = self.chunks.lock().encode(message);
        self.transport.write(data)
    }

    /// Start or stop publishing. `Some(name)` begins a publish under
    /// that stream key; `None` ends the current one.
    pub async fn publish(&self, name: Option<&str>, mode: PublishMode) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        match name {
            Some(name) => self.start_publish(name, mode).await,
            None => {
                if matches!(
                    self.ready_state(),
                    ReadyState::Publish | ReadyState::Publishing
                ) {
                    self.stop_publish();
                } else {
                    // Not publishing: only the stored mode changes
                    *self.mode.lock() = mode;
                    if mode == PublishMode::LocalRecord {
                        if let Some(recorder) = &self.recorder {
                            let name =
                                self.info.lock().resource_name.clone().unwrap_or_default();
                            recorder.start(&name);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    async fn start_publish(&self, name: &str, mode: PublishMode) -> Result<()> {
        if self.ready_state() == ReadyState::Closed {
            return Err(StreamError::Closed.into());
        }
        self.wait_ready().await?;

        // Fresh timestamp and header-compression state for the session
        self.muxer.lock().reset();
        self.chunks.lock().reset();
        *self.mode.lock() = mode;
        self.info.lock().resource_name = Some(name.to_string());

        let stream_id = self.muxer.lock().stream_id();
        let command = Message::command(
            stream_id,
            "publish",
            &[
                Amf0Value::String(name.to_string()),
                Amf0Value::String(mode.wire_name().to_string()),
            ],
        );
        self.send_message(&command);
        self.set_state(ReadyState::Publish);
        Ok(())
    }

    fn stop_publish(&self) {
        if !matches!(
            self.ready_state(),
            ReadyState::Publish | ReadyState::Publishing
        ) {
            return;
        }
        self.forwarding.store(false, Ordering::SeqCst);
        self.encoder.stop();
        if let Some(recorder) = &self.recorder {
            recorder.stop();
        }
        if let Some(running) = self.bitrate_running.lock().take() {
            let _ = running.send(false);
        }
        self.monitor.stop();

        let name = self.info.lock().resource_name.clone();
        let stream_id = self.muxer.lock().stream_id();
        self.send_message(&Message::command(stream_id, "closeStream", &[]));
        self.set_state(ReadyState::Open);
        let _ = self.events.send(StreamEvent::UnpublishSuccess { name });
    }

    /// Start or stop playing a remote stream
    pub async fn play(&self, name: Option<&str>) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        match name {
            Some(name) => {
                if self.ready_state() == ReadyState::Closed {
                    return Err(StreamError::Closed.into());
                }
                self.wait_ready().await?;
                self.info.lock().resource_name = Some(name.to_string());
                let stream_id = self.muxer.lock().stream_id();
                let command = Message::command(
                    stream_id,
                    "play",
                    &[Amf0Value::String(name.to_string())],
                );
                self.send_message(&command);
                self.set_state(ReadyState::Play);
            }
            None => self.stop_play(),
        }
        Ok(())
    }

    fn stop_play(&self) {
        if !matches!(self.ready_state(), ReadyState::Play | ReadyState::Playing) {
            return;
        }
        let stream_id = self.muxer.lock().stream_id();
        self.send_message(&Message::command(stream_id, "closeStream", &[]));
        self.set_state(ReadyState::Open);
    }

    /// The server created the message stream; publish and play waiters
    /// proceed from here
    pub fn on_stream_created(&self, stream_id: u32) {
        tracing::info!("stream created with id {stream_id}");
        self.info.lock().clear();
        self.muxer.lock().set_stream_id(stream_id);
        self.set_state(ReadyState::Open);
    }

    /// The server acknowledged the publish command
    pub fn on_publish_start(&self) {
        if self.ready_state() != ReadyState::Publish {
            return;
        }
        let name = self
            .info
            .lock()
            .resource_name
            .clone()
            .unwrap_or_default();

        // Metadata must be the first message of the session
        let stream_id = self.muxer.lock().stream_id();
        let metadata = Message::metadata(stream_id, &self.config.metadata);
        let sent = self.send_message(&metadata);
        self.info.lock().byte_count += sent as u64;

        self.stats.reset();
        self.stats
            .set_video_bitrate(self.config.bitrate.initial_bitrate);
        self.encoder
            .set_target_bitrate(self.config.bitrate.initial_bitrate);
        self.encoder.start();
        if *self.mode.lock() == PublishMode::LocalRecord {
            if let Some(recorder) = &self.recorder {
                recorder.start(&name);
            }
        }

        self.start_bitrate_loop();
        match self.config.monitor.start_after() {
            Some(grace) => self.monitor.start_after(grace),
            None => self.monitor.start(),
        }

        self.forwarding.store(true, Ordering::SeqCst);
        self.set_state(ReadyState::Publishing);
        let _ = self.events.send(StreamEvent::PublishStart { name });
    }

    /// The server acknowledged the play command
    pub fn on_play_start(&self) {
        if self.ready_state() != ReadyState::Play {
            return;
        }
        let name = self
            .info
            .lock()
            .resource_name
            .clone()
            .unwrap_or_default();
        self.set_state(ReadyState::Playing);
        let _ = self.events.send(StreamEvent::PlayStart { name });
    }

    fn start_bitrate_loop(&self) {
        let (running_tx, running_rx) = watch::channel(true);
        *self.bitrate_running.lock() = Some(running_tx);
        let task = tokio::spawn(bitrate::run(
            self.config.bitrate.clone(),
            self.transport.clone(),
            self.stats.clone(),
            self.encoder.clone(),
            self.events.clone(),
            running_rx,
        ));
        self.tasks.lock().push(task);
    }

    /// Channel for encoder output. Samples arriving while the stream is
    /// not publishing are dropped.
    pub fn sample_sink(self: &Arc<Self>) -> mpsc::UnboundedSender<EncodedSample> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EncodedSample>();
        let stream = self.clone();
        let task = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                stream.submit_sample(sample);
            }
        });
        self.tasks.lock().push(task);
        tx
    }

    fn submit_sample(&self, sample: EncodedSample) {
        let stage = match sample.channel {
            MediaChannel::Audio => Stage::AudioEncoder,
            MediaChannel::Video => Stage::VideoEncoder,
        };
        self.monitor.mark_active(stage);

        if !self.forwarding.load(Ordering::SeqCst)
            || self.ready_state() != ReadyState::Publishing
        {
            return;
        }

        let payload_len = sample.payload.len();
        let channel = sample.channel;
        let message = self.muxer.lock().tag(sample);
        let sent = self.send_message(&message);
        if sent == 0 {
            return;
        }

        match channel {
            MediaChannel::Audio => self.stats.add_audio_bytes(payload_len),
            MediaChannel::Video => self.stats.add_video_bytes(payload_len),
        }
        self.stats.add_input_bytes(sent);

        let mut info = self.info.lock();
        info.byte_count += sent as u64;
        if message.kind == MessageKind::Video {
            info.frame_count += 1;
        }
    }

    /// Send an AMF0 data message. Returns the wire bytes submitted;
    /// zero once the stream is closed.
    pub fn send_data(&self, handler: &str, arguments: &[Amf0Value]) -> usize {
        if self.ready_state() == ReadyState::Closed {
            return 0;
        }
        let stream_id = self.muxer.lock().stream_id();
        let sent = self.send_message(&Message::data(stream_id, handler, arguments));
        self.info.lock().byte_count += sent as u64;
        sent
    }

    /// Tear the stream down. Ends any publish or play in flight,
    /// deletes the server-side stream and closes the transport.
    /// Idempotent.
    pub async fn close(&self) {
        let _guard = self.op_lock.lock().await;
        if self.ready_state() == ReadyState::Closed {
            return;
        }
        self.stop_publish();
        self.stop_play();

        let stream_id = self.muxer.lock().stream_id();
        self.send_message(&Message::command(
            stream_id,
            "deleteStream",
            &[Amf0Value::Number(stream_id as f64)],
        ));
        // Let the writer drain the farewell before its task is cancelled
        tokio::task::yield_now().await;
        self.set_state(ReadyState::Closed);

        self.monitor.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.close();
    }

    fn spawn_info_task(self: &Arc<Self>) {
        let stream = self.clone();
        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(crate::constants::INFO_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut info = stream.info.lock();
                info.on_timer();
                tracing::debug!(
                    "stream info: {} KB total, {} KB/s, {} fps",
                    info.byte_count / 1024,
                    info.current_bytes_per_second / 1024,
                    info.current_fps,
                );
            }
        });
        self.tasks.lock().push(task);
    }
}
