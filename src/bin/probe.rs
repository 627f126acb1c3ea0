//! Sink Probe
//!
//! Lists the outputs the sink can open, one per supported format family,
//! as JSON on stdout.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiotrack_sink::{
    device::{Backend, CapabilityCache},
    enumerate_devices, SinkConfig,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SinkConfig::load_or_default()?;
    tracing::debug!("Using config: {:?}", config);

    let force = std::env::args().any(|arg| arg == "--force");
    let backend = default_backend();
    tracing::info!("Probing {}", backend.name());

    let devices = enumerate_devices(backend.as_ref(), &CapabilityCache::global(), force);
    if devices.is_empty() {
        tracing::warn!("{} reported no usable outputs", backend.name());
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);

    Ok(())
}

#[cfg(feature = "cpal")]
fn default_backend() -> Arc<dyn Backend> {
    for name in audiotrack_sink::device::cpal::list_output_devices() {
        tracing::info!("Found output device: {}", name);
    }
    Arc::new(audiotrack_sink::device::CpalBackend::default_output())
}

#[cfg(not(feature = "cpal"))]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(audiotrack_sink::device::SimulatedBackend::new(Arc::new(
        audiotrack_sink::clock::SystemClock,
    )))
}
