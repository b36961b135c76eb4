//! Runs the packet tracer alongside a trial's workload.
//!
//! The capture task owns the tracer, the event log and the marker pulses.
//! Two signals connect it to the trial thread:
//!
//! - *ready*: a one-shot sent after both hook points are attached and the
//!   start pulse has fired. The trial thread generates no traffic before it.
//!   If the task exits without sending, attach failed.
//! - *stop*: a flag the trial thread raises once the workload is over; the
//!   task sees it within one poll interval.
//!
//! On stop the task drains the tracer, fires the stop pulse, writes both
//! markers and only then releases the hooks. The trial thread joins it
//! before reporting the trial stopped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{MarkerPulse, PacketTracer};
use crate::clock;
use crate::error::TrialError;

pub const CAPTURE_CSV: &str = "ebpf_trace.csv";
pub const MARKERS_FILE: &str = "markers.json";
pub const CSV_HEADER: &str = "Timestamp (ns),IAT (ns),Packet Length,Direction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Incoming,
    Outgoing,
}

impl PacketDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketDirection::Incoming => "Incoming",
            PacketDirection::Outgoing => "Outgoing",
        }
    }
}

/// One packet seen by the kernel tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEvent {
    pub timestamp_ns: u64,
    pub inter_arrival_ns: u64,
    pub length: u64,
    pub direction: PacketDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerEvent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMarker {
    pub event: MarkerEvent,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub events: u64,
    pub markers: [CaptureMarker; 2],
}

/// A running capture task. Dropping it raises the stop flag.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<Result<CaptureSummary>>>,
}

impl CaptureHandle {
    /// Raise the stop signal and wait for the hooks to be released.
    pub fn finish(mut self) -> Result<CaptureSummary, TrialError> {
        self.stop.store(true, Ordering::Release);
        let task = self
            .task
            .take()
            .ok_or_else(|| TrialError::Capture(anyhow!("capture already joined")))?;
        join(task)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn join(task: JoinHandle<Result<CaptureSummary>>) -> Result<CaptureSummary, TrialError> {
    match task.join() {
        Ok(res) => res.map_err(TrialError::Capture),
        Err(_) => Err(TrialError::Capture(anyhow!("capture thread panicked"))),
    }
}

/// Start the capture task and block until the tracer is attached.
pub fn start_capture(
    tracer: Box<dyn PacketTracer>,
    marker: Box<dyn MarkerPulse>,
    dir: &Path,
    poll: Duration,
) -> Result<CaptureHandle, TrialError> {
    let (ready_tx, ready_rx) = bounded::<()>(1);
    let stop = Arc::new(AtomicBool::new(false));
    let task = {
        let stop = Arc::clone(&stop);
        let dir = dir.to_path_buf();
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture_task(tracer, marker, dir, poll, ready_tx, stop))?
    };

    debug!("waiting for tracer to attach");
    match ready_rx.recv() {
        Ok(()) => Ok(CaptureHandle {
            stop,
            task: Some(task),
        }),
        // sender dropped without a ready signal: the task already ended
        Err(_) => match join(task) {
            Err(e) => Err(e),
            Ok(_) => Err(TrialError::Capture(anyhow!(
                "capture ended before tracer was ready"
            ))),
        },
    }
}

/// Run `workload` with the tracer attached for its whole duration. The
/// capture is always shut down, whatever the workload returns.
pub fn run_with_capture<R>(
    tracer: Box<dyn PacketTracer>,
    marker: Box<dyn MarkerPulse>,
    dir: &Path,
    poll: Duration,
    workload: impl FnOnce() -> Result<R, TrialError>,
) -> Result<(R, CaptureSummary), TrialError> {
    let capture = start_capture(tracer, marker, dir, poll)?;
    info!("tracer active, starting workload");
    let outcome = workload();
    let summary = capture.finish();
    info!("workload and capture completed");
    Ok((outcome?, summary?))
}

fn capture_task(
    mut tracer: Box<dyn PacketTracer>,
    mut marker: Box<dyn MarkerPulse>,
    dir: PathBuf,
    poll: Duration,
    ready: Sender<()>,
    stop: Arc<AtomicBool>,
) -> Result<CaptureSummary> {
    if let Err(e) = tracer.attach() {
        if let Err(d) = tracer.detach() {
            warn!("detach after failed attach: {d:#}");
        }
        return Err(e.context("attach packet tracer"));
    }
    let start = pulse(&mut *marker);
    info!(timestamp_ns = start, "tracer attached");
    // receiver only disappears if the trial thread is gone
    let _ = ready.send(());

    let streamed = File::create(dir.join(CAPTURE_CSV))
        .with_context(|| format!("create {CAPTURE_CSV} in {}", dir.display()))
        .map(BufWriter::new)
        .and_then(|mut out| {
            let n = stream_events(&mut *tracer, &mut out, poll, &stop)?;
            Ok((out, n))
        });

    let end = pulse(&mut *marker);
    let markers = [
        CaptureMarker {
            event: MarkerEvent::Start,
            timestamp_ns: start,
        },
        CaptureMarker {
            event: MarkerEvent::Stop,
            timestamp_ns: end,
        },
    ];
    let written = write_markers(&dir.join(MARKERS_FILE), &markers);

    info!("releasing tracer hooks");
    let detached = tracer.detach();

    let (mut out, mut events) = streamed?;
    let tail = detached.context("detach packet tracer")?;
    events += write_events(&mut out, tail)?;
    out.flush()?;
    written?;
    info!(events, "tracer stopped cleanly");
    Ok(CaptureSummary { events, markers })
}

/// Fire a marker pulse; falls back to the bare clock so a marker is
/// always recorded.
fn pulse(marker: &mut dyn MarkerPulse) -> u64 {
    match marker.emit() {
        Ok(ts) => ts,
        Err(e) => {
            warn!("marker pulse failed: {e:#}");
            clock::monotonic_ns()
        }
    }
}

fn stream_events(
    tracer: &mut dyn PacketTracer,
    out: &mut impl Write,
    poll: Duration,
    stop: &AtomicBool,
) -> Result<u64> {
    writeln!(out, "{CSV_HEADER}")?;

    let mut count = 0u64;
    while !stop.load(Ordering::Acquire) {
        count += write_events(&mut *out, tracer.poll(poll)?)?;
    }
    // whatever the tracer already holds
    count += write_events(&mut *out, tracer.poll(Duration::ZERO)?)?;
    Ok(count)
}

fn write_events(out: &mut impl Write, events: Vec<PacketEvent>) -> Result<u64> {
    let n = events.len() as u64;
    for e in events {
        writeln!(
            out,
            "{},{},{},{}",
            e.timestamp_ns,
            e.inter_arrival_ns,
            e.length,
            e.direction.as_str()
        )?;
    }
    Ok(n)
}

pub fn write_markers(path: &Path, markers: &[CaptureMarker]) -> Result<()> {
    let text = serde_json::to_string_pretty(markers)?;
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeMarker, FakeTracer};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn read_markers(dir: &Path) -> Vec<CaptureMarker> {
        serde_json::from_str(&std::fs::read_to_string(dir.join(MARKERS_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn workload_waits_for_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = FakeTracer::new().attach_delay(Duration::from_millis(150));
        let attached = tracer.attached.clone();
        let calls = AtomicUsize::new(0);
        let begun = Instant::now();

        let (seen, _) = run_with_capture(
            Box::new(tracer),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(10),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(attached.load(Ordering::SeqCst))
            },
        )
        .unwrap();

        assert!(seen, "workload ran before tracer attached");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(begun.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn two_markers_even_when_workload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = FakeTracer::new();
        let detached = tracer.detached.clone();

        let res: Result<((), _), _> = run_with_capture(
            Box::new(tracer),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(10),
            || Err(TrialError::Workload(anyhow!("connection refused"))),
        );

        assert!(matches!(res, Err(TrialError::Workload(_))));
        let markers = read_markers(dir.path());
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].event, MarkerEvent::Start);
        assert_eq!(markers[1].event, MarkerEvent::Stop);
        assert!(markers[0].timestamp_ns <= markers[1].timestamp_ns);
        assert!(detached.load(Ordering::SeqCst));
    }

    #[test]
    fn events_written_as_csv() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = FakeTracer::new().with_events(vec![
            PacketEvent {
                timestamp_ns: 100,
                inter_arrival_ns: 0,
                length: 60,
                direction: PacketDirection::Outgoing,
            },
            PacketEvent {
                timestamp_ns: 250,
                inter_arrival_ns: 150,
                length: 1500,
                direction: PacketDirection::Incoming,
            },
        ]);

        let (_, summary) = run_with_capture(
            Box::new(tracer),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(5),
            || {
                thread::sleep(Duration::from_millis(30));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(summary.events, 2);
        let csv = std::fs::read_to_string(dir.path().join(CAPTURE_CSV)).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines, [CSV_HEADER, "100,0,60,Outgoing", "250,150,1500,Incoming"]);
    }

    #[test]
    fn events_flushed_at_detach_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = FakeTracer::new().flush_on_detach(vec![PacketEvent {
            timestamp_ns: 30,
            inter_arrival_ns: 5,
            length: 80,
            direction: PacketDirection::Outgoing,
        }]);

        let (_, summary) = run_with_capture(
            Box::new(tracer),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(5),
            || Ok(()),
        )
        .unwrap();

        assert_eq!(summary.events, 1);
        let csv = std::fs::read_to_string(dir.path().join(CAPTURE_CSV)).unwrap();
        assert_eq!(csv.lines().collect::<Vec<_>>(), [CSV_HEADER, "30,5,80,Outgoing"]);
    }

    #[test]
    fn attach_failure_skips_workload() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = FakeTracer::new().failing_attach();
        let mut ran = false;

        let res = run_with_capture(
            Box::new(tracer),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(5),
            || {
                ran = true;
                Ok(())
            },
        );

        assert!(matches!(res, Err(TrialError::Capture(_))));
        assert!(!ran);
        assert!(!dir.path().join(MARKERS_FILE).exists());
    }

    #[test]
    fn stop_observed_within_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start_capture(
            Box::new(FakeTracer::new()),
            Box::new(FakeMarker),
            dir.path(),
            Duration::from_millis(20),
        )
        .unwrap();
        let t = Instant::now();
        handle.finish().unwrap();
        assert!(t.elapsed() < Duration::from_millis(500));
    }
}
