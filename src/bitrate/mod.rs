//! Adaptive bitrate controller
//!
//! Periodic control loop that raises or lowers the requested encoder
//! bitrate based on output queue depth and measured throughput. The
//! decision step is a pure function over a telemetry snapshot so the
//! thresholds can be tested without timers.
//!
//! Units: encoder bitrates (current, floor, ceiling, steps) are bits
//! per second; measured input/output bitrates are bytes per second.
//! The only cross-unit computation is the ceiling reduction
//! `max(128 KiB, output * 8)`.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::BitrateConfig;
use crate::event::StreamEvent;
use crate::telemetry::SharedStats;
use crate::transport::Transport;

const KB: u64 = 1024;

/// Control signal sent to the external video encoder
pub trait EncoderControl: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn set_target_bitrate(&self, bitrate: u64);
    fn set_maximum_bitrate(&self, bitrate: u64);
}

/// Telemetry snapshot for one control tick
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    /// max(application queue depth, transport queue depth), bytes
    pub bytes_in_queue: u64,
    /// Achieved socket output, bytes/sec
    pub output_bitrate: u64,
    /// Muxed input, bytes/sec
    pub input_bitrate: u64,
}

/// What a control tick decided
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// New target bitrate to push to the encoder, when it changed
    pub new_bitrate: Option<u64>,
    /// Lowered ceiling, when the output cannot keep up with the input
    pub new_maximum: Option<u64>,
    /// Rising edge of the bandwidth-shortage condition
    pub bandwidth_shortage: bool,
}

/// Bitrate adjustment state machine
pub struct BitrateController {
    current: u64,
    maximum: u64,
    floor: u64,
    previous_bytes_in_queue: u64,
    not_enough_bandwidth: bool,
}

impl BitrateController {
    pub fn new(config: &BitrateConfig) -> Self {
        Self {
            current: config.initial_bitrate,
            maximum: config.maximum_bitrate,
            floor: config.minimum_bitrate,
            previous_bytes_in_queue: 0,
            not_enough_bandwidth: false,
        }
    }

    /// Currently requested bitrate (bits/s)
    pub fn current_bitrate(&self) -> u64 {
        self.current
    }

    pub fn maximum_bitrate(&self) -> u64 {
        self.maximum
    }

    pub fn not_enough_bandwidth(&self) -> bool {
        self.not_enough_bandwidth
    }

    /// Run one control step over a telemetry snapshot
    pub fn tick(&mut self, input: TickInput) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let bytes_in_queue = input.bytes_in_queue;
        let queue_is_growing =
            self.previous_bytes_in_queue > 0 && bytes_in_queue > self.previous_bytes_in_queue;

        let need_to_lower =
            bytes_in_queue > 100 * KB || (bytes_in_queue > 10 * KB && queue_is_growing);
        let need_to_raise = bytes_in_queue < 10 * KB;

        if need_to_lower || need_to_raise {
            let mut change: i64 = if need_to_lower {
                -(50 * KB as i64)
            } else {
                50 * KB as i64
            };
            // Escalate by queue severity; the largest matching tier wins
            if bytes_in_queue > 200 * KB {
                change = -(100 * KB as i64);
            }
            if bytes_in_queue > 500 * KB {
                change = -(200 * KB as i64);
            }
            if bytes_in_queue > 1000 * KB {
                change = -(500 * KB as i64);
            }
            if bytes_in_queue > 2000 * KB {
                change = -(1000 * KB as i64);
            }
            if bytes_in_queue > 4000 * KB {
                change = -(2000 * KB as i64);
            }

            // This tick clamps against the ceiling read at entry; a
            // lowered ceiling takes effect on the next tick
            let ceiling = self.maximum;
            if input.input_bitrate > input.output_bitrate && bytes_in_queue > 200 * KB {
                self.maximum = (128 * KB).max(input.output_bitrate * 8);
                outcome.new_maximum = Some(self.maximum);
            }

            let mut new_bitrate = (self.current as i64 + change).max(self.floor as i64) as u64;
            if new_bitrate > ceiling {
                new_bitrate = ceiling;
            }

            let mut not_enough_bandwidth = bytes_in_queue > 1000 * KB;
            if bytes_in_queue > 200 * KB && input.output_bitrate < 100 * KB && queue_is_growing {
                not_enough_bandwidth = true;
            }

            if new_bitrate == self.floor && not_enough_bandwidth {
                if !self.not_enough_bandwidth {
                    outcome.bandwidth_shortage = true;
                }
                self.not_enough_bandwidth = true;
            } else {
                self.not_enough_bandwidth = false;
            }

            if new_bitrate != self.current {
                self.current = new_bitrate;
                outcome.new_bitrate = Some(new_bitrate);
            }
        }

        self.previous_bytes_in_queue = bytes_in_queue;
        outcome
    }
}

/// Periodic task wrapping [`BitrateController::tick`]
///
/// Reads the shared telemetry, applies outcomes to the encoder and
/// emits the corresponding events. Exits when `running` flips to false.
pub async fn run(
    config: BitrateConfig,
    transport: Arc<Transport>,
    stats: SharedStats,
    encoder: Arc<dyn EncoderControl>,
    events: broadcast::Sender<StreamEvent>,
    mut running: watch::Receiver<bool>,
) {
    let mut controller = BitrateController::new(&config);
    stats.set_video_bitrate(controller.current_bitrate());

    let mut interval = tokio::time::interval(config.check_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately; the
    // first adjustment should happen one full period after start
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
                continue;
            }
        }

        let input = TickInput {
            bytes_in_queue: stats.bytes_in_queue().max(transport.bytes_in_queue()),
            output_bitrate: transport.output_bitrate(),
            input_bitrate: stats.input_bitrate(),
        };
        let detail = format!(
            "in queue: {} KB, input bitrate: {} KB/s, output bitrate: {} KB/s",
            input.bytes_in_queue / KB,
            input.input_bitrate / KB,
            input.output_bitrate / KB
        );
        tracing::debug!("bitrate check, {detail}");

        let outcome = controller.tick(input);
        stats.set_not_enough_bandwidth(controller.not_enough_bandwidth());

        if let Some(maximum) = outcome.new_maximum {
            encoder.set_maximum_bitrate(maximum);
            let _ = events.send(StreamEvent::MaximumBitrateChanged {
                maximum_bitrate: maximum,
            });
        }
        if outcome.bandwidth_shortage {
            tracing::warn!("not enough bandwidth, {detail}");
            let _ = events.send(StreamEvent::NotEnoughBandwidth {
                detail: detail.clone(),
            });
        }
        if let Some(bitrate) = outcome.new_bitrate {
            tracing::debug!("new video bitrate: {} kbit/s", bitrate / KB);
            encoder.set_target_bitrate(bitrate);
            stats.set_video_bitrate(bitrate);
            let _ = events.send(StreamEvent::BitrateChanged { bitrate, detail });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: u64, maximum: u64) -> BitrateController {
        BitrateController::new(&BitrateConfig {
            check_interval_secs: 2,
            minimum_bitrate: 32_000,
            maximum_bitrate: maximum,
            initial_bitrate: initial,
        })
    }

    fn quiet(bytes_in_queue: u64) -> TickInput {
        TickInput {
            bytes_in_queue,
            output_bitrate: 500 * KB,
            input_bitrate: 100 * KB,
        }
    }

    #[test]
    fn test_raise_when_queue_is_small() {
        let mut controller = controller(1_000_000, 2_500_000);
        let outcome = controller.tick(quiet(0));
        assert_eq!(outcome.new_bitrate, Some(1_000_000 + 50 * KB));
    }

    #[test]
    fn test_dead_band_is_idempotent() {
        let mut controller = controller(1_000_000, 2_500_000);
        // Constant queue between 10KB and 100KB: no growth, no change
        for _ in 0..10 {
            let outcome = controller.tick(quiet(50 * KB));
            assert_eq!(outcome.new_bitrate, None);
        }
        assert_eq!(controller.current_bitrate(), 1_000_000);
    }

    #[test]
    fn test_growing_queue_above_10kb_lowers() {
        let mut controller = controller(1_000_000, 2_500_000);
        controller.tick(quiet(20 * KB));
        let outcome = controller.tick(quiet(30 * KB));
        assert_eq!(outcome.new_bitrate, Some(1_000_000 - 50 * KB));
    }

    #[test]
    fn test_escalation_tier_250kb_growing() {
        let mut controller = controller(1_000_000, 2_500_000);
        // Dead-band tick records the previous depth without adjusting
        controller.tick(quiet(50 * KB));
        let outcome = controller.tick(quiet(250 * KB));
        // 250KB growing queue resolves to the -100KB tier
        assert_eq!(outcome.new_bitrate, Some(1_000_000 - 100 * KB));
    }

    #[test]
    fn test_largest_tier_and_floor_clamp() {
        let mut controller = controller(1_000_000, 2_500_000);
        let outcome = controller.tick(TickInput {
            bytes_in_queue: 5000 * KB,
            output_bitrate: 500 * KB,
            input_bitrate: 100 * KB,
        });
        // -2000KB from 1,000,000 goes below the floor and clamps
        assert_eq!(outcome.new_bitrate, Some(32_000));
        assert_eq!(controller.current_bitrate(), 32_000);
    }

    #[test]
    fn test_ceiling_clamp() {
        let mut controller = controller(2_480_000, 2_500_000);
        let outcome = controller.tick(quiet(0));
        assert_eq!(outcome.new_bitrate, Some(2_500_000));
    }

    #[test]
    fn test_maximum_lowered_when_output_lags_input() {
        let mut controller = controller(1_000_000, 2_500_000);
        let outcome = controller.tick(TickInput {
            bytes_in_queue: 300 * KB,
            output_bitrate: 50 * KB,
            input_bitrate: 120 * KB,
        });
        // max(128KB, 50KB * 8) = 400KB ceiling
        assert_eq!(outcome.new_maximum, Some(400 * KB));
        assert_eq!(controller.maximum_bitrate(), 400 * KB);
    }

    #[test]
    fn test_lowered_ceiling_applies_next_tick() {
        let mut controller = controller(2_000_000, 2_500_000);
        let congested = TickInput {
            bytes_in_queue: 300 * KB,
            output_bitrate: 50 * KB,
            input_bitrate: 120 * KB,
        };
        // The congested tick lowers the ceiling to max(128KB, 50KB*8)
        // but the target only takes the tier step this tick
        let outcome = controller.tick(congested);
        assert_eq!(outcome.new_maximum, Some(400 * KB));
        assert_eq!(outcome.new_bitrate, Some(2_000_000 - 100 * KB));

        // The next raise clamps against the new 400KB ceiling
        let outcome = controller.tick(quiet(0));
        assert_eq!(outcome.new_bitrate, Some(400 * KB));
        assert_eq!(controller.current_bitrate(), 400 * KB);
    }

    #[test]
    fn test_bandwidth_shortage_rising_edge_only() {
        let mut controller = controller(40_000, 2_500_000);
        let starving = TickInput {
            bytes_in_queue: 1500 * KB,
            output_bitrate: 10 * KB,
            input_bitrate: 100 * KB,
        };
        let outcome = controller.tick(starving);
        // First starving tick drops to the floor and flags shortage
        assert_eq!(outcome.new_bitrate, Some(32_000));
        assert!(outcome.bandwidth_shortage);
        assert!(controller.not_enough_bandwidth());

        // Condition persists: sticky flag, no repeat event
        let outcome = controller.tick(starving);
        assert!(!outcome.bandwidth_shortage);
        assert!(controller.not_enough_bandwidth());

        // Queue drains: flag clears
        let outcome = controller.tick(quiet(0));
        assert!(!outcome.bandwidth_shortage);
        assert!(!controller.not_enough_bandwidth());
    }

    #[test]
    fn test_shortage_requires_floor() {
        let mut controller = controller(2_000_000, 2_500_000);
        let outcome = controller.tick(TickInput {
            bytes_in_queue: 1500 * KB,
            output_bitrate: 10 * KB,
            input_bitrate: 100 * KB,
        });
        // Bitrate still far above the floor: lower, but no shortage yet
        assert_eq!(outcome.new_bitrate, Some(2_000_000 - 500 * KB));
        assert!(!outcome.bandwidth_shortage);
    }

    #[test]
    fn test_previous_queue_recorded_without_adjustment() {
        let mut controller = controller(1_000_000, 2_500_000);
        // Dead band tick still records the depth for growth detection
        controller.tick(quiet(50 * KB));
        let outcome = controller.tick(quiet(60 * KB));
        // 60KB > 10KB and growing against the recorded 50KB
        assert_eq!(outcome.new_bitrate, Some(1_000_000 - 50 * KB));
    }
}
