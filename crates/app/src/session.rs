//! Headless control loop: drives [`RealtimeMode`] on a fixed tick.

use std::{
    io::{self, Write},
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, bail};
use capture_service::{
    CaptureService, CaptureSettings, RealtimeMode, Status, StopOutcome, telemetry,
};
use tracing::{info, warn};
use video_ingest::Frame;

use crate::{cli::RunArgs, processors, snapshot};

fn install_shutdown_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

pub fn run(args: RunArgs) -> Result<()> {
    let tick = args.tick();
    let duration = args.duration();
    let analysis_after = args.analysis_after();
    let first_frame_timeout = args.first_frame_timeout();
    let RunArgs {
        capture,
        width,
        height,
        processor,
        snapshot: snapshot_path,
        print_metrics,
        ..
    } = args;

    let settings = CaptureSettings::try_from(capture)?;
    let _telemetry_guard = telemetry::enter_runtime(&settings.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let shutdown = install_shutdown_handler();

    let service = CaptureService::new(
        processors::backend((width, height), first_frame_timeout),
        processors::factory(processor),
    );
    let mut mode = RealtimeMode::new(service);
    let session_span = tracing::info_span!(
        "capture.session",
        source = %settings.config.video_source(),
        processor = ?processor
    );
    let _session_guard = session_span.enter();

    mode.select(settings.config)?;
    info!("Capturing; press Ctrl+C to stop");

    let started = Instant::now();
    let mut analysis_requested = false;
    let mut last_frame: Option<Frame> = None;
    let mut frames_polled: u64 = 0;
    let mut packets_printed: u64 = 0;
    let mut last_error: Option<String> = None;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested");
            break;
        }
        let elapsed = started.elapsed();
        if duration.is_some_and(|limit| elapsed >= limit) {
            info!("Run duration reached");
            break;
        }
        if !analysis_requested && elapsed >= analysis_after && !mode.stream_ended() {
            analysis_requested = mode.start_analysis();
        }

        // sampled before draining so nothing sent before the worker returned is missed
        let worker_alive = mode.service().is_worker_alive();
        while let Some(message) = mode.next_status() {
            if message.status == Status::Error {
                last_error = Some(message.detail);
            }
        }
        let mut out = io::stdout().lock();
        while let Some(packet) = mode.next_feature_packet() {
            serde_json::to_writer(&mut out, &packet)?;
            out.write_all(b"\n")?;
            packets_printed += 1;
        }
        out.flush()?;
        drop(out);
        if let Some(frame) = mode.latest_frame() {
            frames_polled += 1;
            last_frame = Some(frame);
        }

        if !worker_alive {
            if !mode.stream_ended() {
                mode.deselect();
                bail!(
                    "capture worker stopped: {}",
                    last_error.as_deref().unwrap_or("no status reported")
                );
            }
            info!("Stream ended");
            break;
        }

        thread::sleep(tick);
    }

    if mode.deselect() == StopOutcome::Forced {
        warn!("Capture worker was terminated after the stop timeout");
    }
    info!(
        frames = frames_polled,
        packets = packets_printed,
        entities = mode.registry().len(),
        "Session finished"
    );

    if let Some(path) = snapshot_path {
        match last_frame {
            Some(frame) => {
                snapshot::write_snapshot(&frame, &path)?;
                info!("Snapshot written to {}", path.display());
            }
            None => warn!("No frame captured; snapshot skipped"),
        }
    }

    if print_metrics {
        match telemetry::prometheus_handle() {
            Some(handle) => println!("{}", handle.render()),
            None => warn!("Metrics recorder not installed"),
        }
    }
    Ok(())
}
