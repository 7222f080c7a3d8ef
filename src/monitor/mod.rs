//! Connection health watchdog
//!
//! Tracks recency of activity across the capture, encode and socket
//! stages and raises a "publishing broken" signal plus a human-readable
//! status while any stage is stalled. The evaluation step is a pure
//! function over a telemetry snapshot so the staleness rules can be
//! tested without timers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
// The tokio clock is used so paused-clock tests advance it
use tokio::time::Instant;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::event::StreamEvent;
use crate::telemetry::SharedStats;

/// Monitored pipeline stages reporting "I am alive" timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AudioCapture = 0,
    VideoCapture = 1,
    AudioEncoder = 2,
    VideoEncoder = 3,
}

/// Classification of a broken tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    /// A capture/encode stage or media input stalled
    Input,
    /// The socket stalled or bandwidth ran short
    Network,
}

/// Per-stage liveness computed each tick
#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub audio_capture_active: bool,
    pub video_capture_active: bool,
    pub audio_encoder_active: bool,
    pub video_encoder_active: bool,
    pub audio_input_active: bool,
    pub video_input_active: bool,
    pub socket_output_active: bool,
}

impl Health {
    pub fn input_problem(&self) -> bool {
        !self.audio_capture_active
            || !self.video_capture_active
            || !self.audio_encoder_active
            || !self.video_encoder_active
            || !self.audio_input_active
            || !self.video_input_active
    }
}

/// Telemetry snapshot for one watchdog tick
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    /// Milliseconds since the monitor epoch
    pub now_ms: u64,
    /// Last activity per stage, milliseconds since the monitor epoch
    pub stage_ms: [u64; 4],
    pub total_audio_bytes: u64,
    pub total_video_bytes: u64,
    /// Bytes written per second over the last window
    pub output_bitrate: u64,
    /// Currently requested encoder bitrate (bits/s)
    pub video_bitrate: u64,
    pub not_enough_bandwidth: bool,
    pub bytes_in_queue: u64,
    pub input_bitrate: u64,
}

/// What a watchdog tick decided
#[derive(Debug, Clone)]
pub struct TickReport {
    pub health: Health,
    pub status: Option<String>,
    /// The status string differs from the previous tick's
    pub status_changed: bool,
    /// Broken this tick, with its classification
    pub broken: Option<Problem>,
    /// Still inside the startup grace period
    pub paused: bool,
}

/// Watchdog evaluation state between ticks
pub struct MonitorState {
    interval_ms: u64,
    pause_until_ms: Option<u64>,
    previous_status: Option<String>,
    previous_total_audio: i64,
    previous_total_video: i64,
    previous_output_bitrate: i64,
    previous_previous_total_audio: i64,
    previous_previous_total_video: i64,
    previous_previous_output_bitrate: i64,
}

impl MonitorState {
    pub fn new(interval: Duration, pause_until_ms: Option<u64>) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            pause_until_ms,
            previous_status: None,
            previous_total_audio: -1,
            previous_total_video: -1,
            previous_output_bitrate: -1,
            previous_previous_total_audio: -2,
            previous_previous_total_video: -2,
            previous_previous_output_bitrate: -2,
        }
    }

    /// Evaluate one tick
    pub fn tick(&mut self, snapshot: &Snapshot) -> TickReport {
        let stale = self.interval_ms * 2;
        let fresh = |stage: Stage| {
            snapshot.now_ms.saturating_sub(snapshot.stage_ms[stage as usize]) < stale
        };

        let health = Health {
            audio_capture_active: fresh(Stage::AudioCapture),
            video_capture_active: fresh(Stage::VideoCapture),
            audio_encoder_active: fresh(Stage::AudioEncoder),
            video_encoder_active: fresh(Stage::VideoEncoder),
            // One tick of lag avoids racing the muxer's own tick
            audio_input_active: snapshot.total_audio_bytes as i64
                != self.previous_previous_total_audio,
            video_input_active: snapshot.total_video_bytes as i64
                != self.previous_previous_total_video,
            socket_output_active: !(snapshot.output_bitrate == 0
                && self.previous_output_bitrate == 0
                && self.previous_previous_output_bitrate == 0),
        };

        let network_problem = !health.socket_output_active || snapshot.not_enough_bandwidth;
        let input_problem = health.input_problem();

        let status = if network_problem {
            if snapshot.not_enough_bandwidth {
                Some("Not enough bandwidth.".to_string())
            } else {
                Some("Connecting…".to_string())
            }
        } else if input_problem {
            Some("Connecting…".to_string())
        } else if snapshot.video_bitrate != 0 && snapshot.video_bitrate < 100_000 {
            Some("Slow connection.".to_string())
        } else {
            None
        };
        let status_changed = status != self.previous_status;
        self.previous_status = status.clone();

        // During the grace period nothing is flagged and the snapshot
        // history stays frozen
        if let Some(pause_until) = self.pause_until_ms {
            if snapshot.now_ms < pause_until {
                return TickReport {
                    health,
                    status,
                    status_changed,
                    broken: None,
                    paused: true,
                };
            }
            self.pause_until_ms = None;
        }

        let broken = if network_problem {
            Some(Problem::Network)
        } else if input_problem {
            Some(Problem::Input)
        } else {
            None
        };

        self.previous_previous_total_audio = self.previous_total_audio;
        self.previous_previous_total_video = self.previous_total_video;
        self.previous_previous_output_bitrate = self.previous_output_bitrate;
        self.previous_total_audio = snapshot.total_audio_bytes as i64;
        self.previous_total_video = snapshot.total_video_bytes as i64;
        self.previous_output_bitrate = snapshot.output_bitrate as i64;

        TickReport {
            health,
            status,
            status_changed,
            broken,
            paused: false,
        }
    }
}

/// Periodic watchdog over the shared telemetry
pub struct StateMonitor {
    epoch: Instant,
    interval: Duration,
    stage_ms: [AtomicU64; 4],
    stats: SharedStats,
    events: broadcast::Sender<StreamEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StateMonitor {
    pub fn new(
        config: &MonitorConfig,
        stats: SharedStats,
        events: broadcast::Sender<StreamEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            interval: config.interval(),
            stage_ms: Default::default(),
            stats,
            events,
            task: Mutex::new(None),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record activity for a pipeline stage
    pub fn mark_active(&self, stage: Stage) {
        self.stage_ms[stage as usize].store(self.now_ms(), Ordering::Relaxed);
    }

    /// Start ticking immediately
    pub fn start(self: &Arc<Self>) {
        self.start_with(None);
    }

    /// Start ticking but suppress alarms for the grace period
    pub fn start_after(self: &Arc<Self>, grace: Duration) {
        tracing::info!("start monitoring after {} seconds", grace.as_secs());
        self.start_with(Some(grace));
    }

    fn start_with(self: &Arc<Self>, grace: Option<Duration>) {
        self.stop();
        for stage in &self.stage_ms {
            stage.store(0, Ordering::Relaxed);
        }
        let pause_until_ms = grace.map(|g| self.now_ms() + g.as_millis() as u64);
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.run(pause_until_ms).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop ticking; idempotent
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            tracing::debug!("stop monitoring");
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            now_ms: self.now_ms(),
            stage_ms: [
                self.stage_ms[0].load(Ordering::Relaxed),
                self.stage_ms[1].load(Ordering::Relaxed),
                self.stage_ms[2].load(Ordering::Relaxed),
                self.stage_ms[3].load(Ordering::Relaxed),
            ],
            total_audio_bytes: self.stats.total_audio_bytes(),
            total_video_bytes: self.stats.total_video_bytes(),
            output_bitrate: self.stats.output_bitrate(),
            video_bitrate: self.stats.video_bitrate(),
            not_enough_bandwidth: self.stats.not_enough_bandwidth(),
            bytes_in_queue: self.stats.bytes_in_queue(),
            input_bitrate: self.stats.input_bitrate(),
        }
    }

    async fn run(self: Arc<Self>, pause_until_ms: Option<u64>) {
        let mut state = MonitorState::new(self.interval, pause_until_ms);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            let snapshot = self.snapshot();
            let report = state.tick(&snapshot);

            tracing::debug!(
                "health: input {} KB/s, output {} KB/s, in queue {} KB, \
                 session a{}/v{}, encoder a{}/v{}, input a{}/v{}, socket {}",
                snapshot.input_bitrate / 1024,
                snapshot.output_bitrate / 1024,
                snapshot.bytes_in_queue / 1024,
                u8::from(report.health.audio_capture_active),
                u8::from(report.health.video_capture_active),
                u8::from(report.health.audio_encoder_active),
                u8::from(report.health.video_encoder_active),
                u8::from(report.health.audio_input_active),
                u8::from(report.health.video_input_active),
                u8::from(report.health.socket_output_active),
            );

            if report.status_changed {
                let _ = self.events.send(StreamEvent::StatusChanged {
                    status: report.status.clone(),
                });
            }
            if report.paused {
                continue;
            }
            if let Some(problem) = report.broken {
                tracing::warn!("publishing is broken: {problem:?}");
                let _ = self.events.send(StreamEvent::PublishingBroken {
                    problem,
                    status: report
                        .status
                        .clone()
                        .unwrap_or_else(|| "publishing is broken".to_string()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(2);

    fn live_snapshot(now_ms: u64, tick: u64) -> Snapshot {
        Snapshot {
            now_ms,
            stage_ms: [now_ms, now_ms, now_ms, now_ms],
            // Totals grow every tick so input stays live
            total_audio_bytes: 1000 * (tick + 1),
            total_video_bytes: 5000 * (tick + 1),
            output_bitrate: 200_000,
            video_bitrate: 1_000_000,
            not_enough_bandwidth: false,
            bytes_in_queue: 0,
            input_bitrate: 150_000,
        }
    }

    #[test]
    fn test_healthy_ticks_are_quiet() {
        let mut state = MonitorState::new(INTERVAL, None);
        for tick in 0..5 {
            let report = state.tick(&live_snapshot(2000 * (tick + 1), tick));
            assert!(report.broken.is_none());
            assert_eq!(report.status, None);
        }
    }

    #[test]
    fn test_stale_video_encoder_is_input_problem_every_tick() {
        let mut state = MonitorState::new(INTERVAL, None);
        for tick in 0..3 {
            let now = 2000 * (tick + 1);
            let mut snapshot = live_snapshot(now, tick);
            // Video encoder last marked activity more than 4s ago
            snapshot.stage_ms[Stage::VideoEncoder as usize] = now.saturating_sub(5000);
            let report = state.tick(&snapshot);
            if now >= 5000 {
                assert!(!report.health.video_encoder_active);
                assert_eq!(report.broken, Some(Problem::Input));
                assert_eq!(report.status.as_deref(), Some("Connecting…"));
            }
        }
    }

    #[test]
    fn test_stalled_input_bytes_detected_with_one_tick_lag() {
        let mut state = MonitorState::new(INTERVAL, None);
        let mut frozen = live_snapshot(2000, 0);
        frozen.total_video_bytes = 4242;

        // Two ticks with frozen video totals: the two-tick comparison
        // still sees the sentinel history, so no alarm yet
        frozen.now_ms = 2000;
        frozen.stage_ms = [2000; 4];
        assert!(state.tick(&frozen).broken.is_none());
        frozen.now_ms = 4000;
        frozen.stage_ms = [4000; 4];
        assert!(state.tick(&frozen).broken.is_none());

        // Third tick compares against the total from two ticks ago
        frozen.now_ms = 6000;
        frozen.stage_ms = [6000; 4];
        let report = state.tick(&frozen);
        assert!(!report.health.video_input_active);
        assert_eq!(report.broken, Some(Problem::Input));
    }

    #[test]
    fn test_socket_flatline_needs_three_samples() {
        let mut state = MonitorState::new(INTERVAL, None);
        let mut snapshot = live_snapshot(2000, 0);
        snapshot.output_bitrate = 0;

        // First and second zero samples still count as live
        assert!(state.tick(&snapshot).health.socket_output_active);
        snapshot = live_snapshot(4000, 1);
        snapshot.output_bitrate = 0;
        assert!(state.tick(&snapshot).health.socket_output_active);

        // Third consecutive zero flips the socket to stalled
        snapshot = live_snapshot(6000, 2);
        snapshot.output_bitrate = 0;
        let report = state.tick(&snapshot);
        assert!(!report.health.socket_output_active);
        assert_eq!(report.broken, Some(Problem::Network));
    }

    #[test]
    fn test_status_priority_and_edge_triggering() {
        let mut state = MonitorState::new(INTERVAL, None);

        // Bandwidth shortage outranks everything
        let mut snapshot = live_snapshot(2000, 0);
        snapshot.not_enough_bandwidth = true;
        let report = state.tick(&snapshot);
        assert_eq!(report.status.as_deref(), Some("Not enough bandwidth."));
        assert!(report.status_changed);
        assert_eq!(report.broken, Some(Problem::Network));

        // Same status next tick: no change notification
        let mut snapshot = live_snapshot(4000, 1);
        snapshot.not_enough_bandwidth = true;
        let report = state.tick(&snapshot);
        assert!(!report.status_changed);

        // Recovered: back to no status, which is a change
        let report = state.tick(&live_snapshot(6000, 2));
        assert_eq!(report.status, None);
        assert!(report.status_changed);
    }

    #[test]
    fn test_low_bitrate_warning() {
        let mut state = MonitorState::new(INTERVAL, None);
        let mut snapshot = live_snapshot(2000, 0);
        snapshot.video_bitrate = 64_000;
        let report = state.tick(&snapshot);
        assert_eq!(report.status.as_deref(), Some("Slow connection."));
        assert!(report.broken.is_none());
    }

    #[test]
    fn test_grace_period_suppresses_alarms() {
        let mut state = MonitorState::new(INTERVAL, Some(10_000));
        let mut snapshot = live_snapshot(2000, 0);
        // Everything stale during startup
        snapshot.stage_ms = [0; 4];
        snapshot.now_ms = 6000;
        let report = state.tick(&snapshot);
        assert!(report.paused);
        assert!(report.broken.is_none());

        // Past the grace period alarms fire
        snapshot.now_ms = 12_000;
        let report = state.tick(&snapshot);
        assert!(!report.paused);
        assert_eq!(report.broken, Some(Problem::Input));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_task_emits_broken_events() {
        let (events, mut events_rx) = broadcast::channel(64);
        let stats = crate::telemetry::StreamStats::new();
        let config = MonitorConfig {
            interval_secs: 2,
            start_after_secs: None,
        };
        let monitor = StateMonitor::new(&config, stats, events);
        monitor.start();

        // Let the task register its interval, then step the paused
        // clock one period at a time so every tick is delivered
        tokio::task::yield_now().await;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
        }

        // No stage ever marked activity, so ticks two and three are
        // broken (the first still sees fresh zero-aged stages)
        let mut broken = 0;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, StreamEvent::PublishingBroken { .. }) {
                broken += 1;
            }
        }
        assert!(broken >= 2);
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
