//! Sink Tone
//!
//! Plays a sine tone through the sink and logs the reported delay while it
//! runs.
//!
//! Usage: sink-tone [seconds] [frequency_hz]

use anyhow::Result;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiotrack_sink::{
    audio::PacketData,
    constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE},
    device::{Backend, CapabilityFamily},
    AudioFormat, AudioTrackSink, SampleFormat, SinkConfig, SinkError,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let seconds: f32 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(3.0);
    let frequency: f32 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(440.0);

    let config = SinkConfig::load_or_default()?;
    let backend = default_backend();
    let device = format!("{}:{}", backend.name(), CapabilityFamily::Pcm.label());
    let format = AudioFormat::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, SampleFormat::F32);

    let (sink, negotiated) = AudioTrackSink::create(backend, &device, &format, config)?;
    tracing::info!(
        "Playing {:.0} Hz for {:.1}s, device buffer {:.1} ms",
        frequency,
        seconds,
        sink.cache_total() * 1000.0
    );

    let channels = format.channels as usize;
    let period = negotiated.period_frames as usize;
    let total_frames = (seconds * format.sample_rate as f32) as usize;
    let mut samples = vec![0.0f32; period * channels];
    let mut phase = 0.0f32;
    let step = TAU * frequency / format.sample_rate as f32;

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut sent = 0usize;

    while sent < total_frames {
        let frames = period.min(total_frames - sent);
        for frame in samples.chunks_exact_mut(channels).take(frames) {
            let value = phase.sin() * 0.2;
            frame.fill(value);
            phase = (phase + step) % TAU;
        }

        let mut offset = 0;
        while offset < frames {
            let accepted = sink.add_packets(PacketData::F32(&samples), frames - offset, offset)?;
            offset += accepted;
            if accepted == 0 {
                std::thread::sleep(negotiated.period_duration() / 2);
            }
        }
        sent += frames;

        if last_report.elapsed() >= Duration::from_millis(500) {
            let delay = sink.delay();
            tracing::info!(
                "t={:.2}s delay={:.1} ms latency={:.1} ms",
                started.elapsed().as_secs_f64(),
                delay.delay_secs * 1000.0,
                sink.latency() * 1000.0
            );
            last_report = Instant::now();
        }
    }

    match sink.drain() {
        Ok(()) => tracing::info!("Drained after {:.2}s", started.elapsed().as_secs_f64()),
        Err(SinkError::Timeout { pending_frames, .. }) => {
            tracing::warn!("Drain gave up with {} frames still queued", pending_frames)
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(counters) = sink.counters() {
        println!("{}", serde_json::to_string_pretty(&counters)?);
    }
    sink.deinitialize();

    Ok(())
}

#[cfg(feature = "cpal")]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(audiotrack_sink::device::CpalBackend::default_output())
}

#[cfg(not(feature = "cpal"))]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(audiotrack_sink::device::SimulatedBackend::new(Arc::new(
        audiotrack_sink::clock::SystemClock,
    )))
}
