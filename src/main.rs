/// Distress monitor service binary
///
/// Starts background monitoring on launch and stops on Ctrl-C.

use anyhow::{bail, Context, Result};
use distress_monitor::{
    DeviceOwnership, EnvTokenProvider, MicrophoneSource, MonitorConfig, MonitorLifecycleState,
    MonitorService, RecognitionEscalationClient, TracingNotifier,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("distress_monitor=debug".parse()?),
        )
        .init();

    info!("Starting distress monitor service");

    let config = MonitorConfig::from_env().context("Failed to load configuration")?;
    info!(
        "Recognizer: {}, voice threshold {:.0}, silence {}ms",
        config.recognizer.base_url, config.vad.amplitude_threshold, config.vad.silence_duration_ms
    );

    let notifier = Arc::new(TracingNotifier);
    let client = RecognitionEscalationClient::with_http(
        &config.recognizer,
        Arc::new(EnvTokenProvider::default()),
        notifier.clone(),
    )
    .context("Failed to create recognizer client")?;

    let source = MicrophoneSource::new(&config.capture);
    let monitor = MonitorService::new(
        config.vad.clone(),
        config.dispatch.clone(),
        Box::new(source),
        Arc::new(client),
        DeviceOwnership::new(),
    )
    .with_notifier(notifier);

    monitor.start().await.context("Failed to start monitoring")?;
    info!("Monitoring for distress speech. Press Ctrl-C to stop.");

    let mut status = monitor.subscribe();
    let fault = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Stop requested");
            None
        }
        stopped = status.wait_for(|s| s.state == MonitorLifecycleState::Stopped) => {
            stopped.ok().and_then(|s| s.fault.clone())
        }
    };

    if let Err(e) = monitor.stop().await {
        error!("Error stopping monitor: {}", e);
    }

    // Let recognitions already in flight finish, bounded by one recognizer call
    if tokio::time::timeout(config.recognizer.timeout(), monitor.wait_for_dispatches())
        .await
        .is_err()
    {
        warn!("Recognitions still running, cancelling");
    }
    if let Err(e) = monitor.shutdown().await {
        error!("Error shutting down monitor: {}", e);
    }

    let stats = monitor.stats();
    info!(
        "Monitor stopped: {} frames, {} segments emitted, {} recognized, {} dropped",
        stats.frames_processed, stats.segments_emitted, stats.segments_completed, stats.segments_dropped
    );

    if let Some(fault) = fault {
        bail!("Monitoring stopped: {}", fault);
    }

    Ok(())
}
