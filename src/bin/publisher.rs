//! RTMP Publisher Application
//!
//! Connects to an RTMP ingest server and publishes a synthetic
//! audio/video feed, logging stream events and per-second telemetry.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtmp_live_streamer::{
    bitrate::EncoderControl,
    config::StreamConfig,
    monitor::Stage,
    muxer::{EncodedSample, MediaChannel},
    telemetry::StreamStats,
    transport, PublishMode, RtmpStream,
};

/// Encoder stand-in that only logs the requested bitrates
struct LoggingEncoder;

impl EncoderControl for LoggingEncoder {
    fn start(&self) {
        tracing::info!("encoder started");
    }

    fn stop(&self) {
        tracing::info!("encoder stopped");
    }

    fn set_target_bitrate(&self, bitrate: u64) {
        tracing::info!("encoder target bitrate: {} kbit/s", bitrate / 1024);
    }

    fn set_maximum_bitrate(&self, bitrate: u64) {
        tracing::info!("encoder maximum bitrate: {} kbit/s", bitrate / 1024);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RTMP Publisher");

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1935".to_string());
    let stream_key = std::env::args().nth(2).unwrap_or_else(|| "live".to_string());

    let config = match std::env::var("PUBLISHER_CONFIG") {
        Ok(path) => StreamConfig::load(&path)?,
        Err(_) => StreamConfig::default(),
    };

    tracing::info!("Connecting to rtmp server at {addr}");
    let stats = StreamStats::new();
    let (events_tx, mut events) = tokio::sync::broadcast::channel(256);
    let transport =
        transport::connect(&addr, &config.transport, stats.clone(), events_tx.clone()).await?;

    let encoder = Arc::new(LoggingEncoder);
    let stream = RtmpStream::new(
        config,
        transport,
        stats.clone(),
        events_tx,
        encoder,
        None,
    );

    // Event log loop
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(
                code = event.code(),
                level = event.level().as_str(),
                "{}",
                event.description()
            );
        }
    });

    // Without a real server-side command parser the stream creation and
    // publish acknowledgements are assumed after a short settle delay
    tokio::time::sleep(Duration::from_millis(200)).await;
    stream.on_stream_created(1);
    stream.publish(Some(&stream_key), PublishMode::Live).await?;
    stream.on_publish_start();

    // Synthetic 30 fps video plus 43 Hz audio feed
    let sink = stream.sample_sink();
    let monitor = stream.monitor().clone();
    let feed = tokio::spawn(async move {
        let video_payload = Bytes::from(vec![0u8; 4096]);
        let audio_payload = Bytes::from(vec![0u8; 256]);
        let mut interval = tokio::time::interval(Duration::from_millis(33));
        let mut frame: u64 = 0;
        loop {
            interval.tick().await;
            monitor.mark_active(Stage::AudioCapture);
            monitor.mark_active(Stage::VideoCapture);
            let pts = frame as f64 / 30.0;
            let _ = sink.send(EncodedSample {
                channel: MediaChannel::Video,
                payload: video_payload.clone(),
                pts,
            });
            let _ = sink.send(EncodedSample {
                channel: MediaChannel::Audio,
                payload: audio_payload.clone(),
                pts,
            });
            frame += 1;
        }
    });

    tracing::info!("Publishing {stream_key}, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    feed.abort();
    stream.close().await;
    tracing::info!("Stopped");
    Ok(())
}
