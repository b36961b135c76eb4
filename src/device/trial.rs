use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use super::backend::DeviceBackend;
use super::capture::run_with_capture;
use super::workload::{TimedRun, run_timed};
use crate::clock;
use crate::error::TrialError;
use crate::frame::Rdt;
use crate::port::Transport;
use crate::proto::config::{ExperimentConfig, Workload};
use crate::proto::message::Message;

pub const TIMESTAMPS_FILE: &str = "timestamps.json";

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub results_root: PathBuf,
    pub workload_duration: Duration,
    /// Idle time before STOP_CONFIG when no tracer was attached.
    pub idle_settle: Duration,
    pub poll: Duration,
}

/// Device-side timing metadata of one trial.
#[derive(Debug, Serialize)]
struct Timestamps<'a> {
    launch: u64,
    start_req: Option<u64>,
    stop_req: Option<u64>,
    requests: u64,
    results_dir: &'a Path,
}

/// Run the trial `cfg` describes, bracketed by START_REQ / STOP_REQ and
/// closed with STOP_CONFIG. Returns the results directory.
pub fn run_trial<T, B>(
    rdt: &mut Rdt<T>,
    backend: &mut B,
    cfg: &ExperimentConfig,
    settings: &DeviceSettings,
) -> Result<PathBuf, TrialError>
where
    T: Transport,
    B: DeviceBackend + ?Sized,
{
    let launch = clock::monotonic_ns();
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let dir = settings.results_root.join(cfg.capture_dir_name(&stamp));
    fs::create_dir_all(&dir)?;
    info!(dir = %dir.display(), workload = %cfg.workload, "trial started");

    rdt.send(&Message::StartReq)?;

    let run = match cfg.workload {
        Workload::Http => {
            let tracer = backend.tracer().map_err(TrialError::Capture)?;
            let marker = backend.marker().map_err(TrialError::Capture)?;
            let delay = Duration::try_from_secs_f64(cfg.delay)
                .with_context(|| format!("bad delay {}", cfg.delay))
                .map_err(TrialError::Workload)?;
            let (run, summary) =
                run_with_capture(tracer, marker, &dir, settings.poll, || {
                    run_timed(settings.workload_duration, delay, || backend.fetch(cfg))
                })?;
            info!(events = summary.events, "capture saved");
            run
        }
        Workload::Mqtt => {
            backend.publish(cfg).map_err(TrialError::Workload)?;
            TimedRun::default()
        }
    };

    rdt.send(&Message::StopReq)?;

    let stamps = Timestamps {
        launch,
        start_req: run.last.map(|t| t.start_ns),
        stop_req: run.last.map(|t| t.stop_ns),
        requests: run.requests,
        results_dir: &dir,
    };
    let text = serde_json::to_string_pretty(&stamps)
        .map_err(|e| TrialError::Persist(e.into()))?;
    fs::write(dir.join(TIMESTAMPS_FILE), text)?;

    if !cfg.workload.is_packet_level() {
        info!(secs = settings.idle_settle.as_secs_f64(), "waiting for interface to idle");
        thread::sleep(settings.idle_settle);
    }

    rdt.send(&Message::StopConfig)?;
    info!("trial completed");
    Ok(dir)
}
