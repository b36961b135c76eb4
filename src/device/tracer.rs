use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::{debug, info, warn};

use super::backend::PacketTracer;
use super::capture::{PacketDirection, PacketEvent};

const READY: &str = "READY";
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum TracerLine {
    Ready,
    Event(PacketEvent),
}

/// Packet tracer run as a helper process (the eBPF loader). The helper
/// attaches its ingress/egress programs to the interface, prints `READY`,
/// then one `timestamp_ns,iat_ns,length,direction` line per packet.
/// SIGINT makes it detach and exit.
pub struct ProcessTracer {
    program: PathBuf,
    iface: String,
    attach_deadline: Duration,
    child: Option<Child>,
    lines: Option<Receiver<TracerLine>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessTracer {
    pub fn new(program: &Path, iface: &str, attach_deadline: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            iface: iface.to_string(),
            attach_deadline,
            child: None,
            lines: None,
            reader: None,
        }
    }

    fn lines(&self) -> Result<&Receiver<TracerLine>> {
        self.lines.as_ref().ok_or_else(|| anyhow!("tracer not attached"))
    }
}

/// Parse one event line. Direction is `0`/`1` or `Incoming`/`Outgoing`.
pub fn parse_event_line(line: &str) -> Result<PacketEvent> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let &[ts, iat, len, dir] = fields.as_slice() else {
        bail!("expected 4 fields, got {}", fields.len());
    };
    let direction = match dir {
        "0" | "Incoming" => PacketDirection::Incoming,
        "1" | "Outgoing" => PacketDirection::Outgoing,
        other => bail!("bad direction {other:?}"),
    };
    Ok(PacketEvent {
        timestamp_ns: ts.parse().context("timestamp")?,
        inter_arrival_ns: iat.parse().context("iat")?,
        length: len.parse().context("length")?,
        direction,
    })
}

impl PacketTracer for ProcessTracer {
    fn attach(&mut self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg(&self.iface)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.program.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("tracer stdout unavailable"))?;
        self.child = Some(child);

        let (tx, rx) = unbounded();
        self.reader = Some(thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                let parsed = if line == READY {
                    TracerLine::Ready
                } else {
                    match parse_event_line(line) {
                        Ok(ev) => TracerLine::Event(ev),
                        Err(e) => {
                            warn!("tracer line {line:?}: {e:#}");
                            continue;
                        }
                    }
                };
                if tx.send(parsed).is_err() {
                    break;
                }
            }
        }));
        self.lines = Some(rx);

        let deadline = Instant::now() + self.attach_deadline;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.lines()?.recv_timeout(left) {
                Ok(TracerLine::Ready) => break,
                Ok(TracerLine::Event(_)) => continue,
                Err(RecvTimeoutError::Timeout) => bail!("tracer not ready after {:?}", self.attach_deadline),
                Err(RecvTimeoutError::Disconnected) => bail!("tracer exited before attaching"),
            }
        }
        info!(iface = %self.iface, "tracer attached");
        Ok(())
    }

    fn poll(&mut self, wait: Duration) -> Result<Vec<PacketEvent>> {
        let rx = self.lines()?;
        let mut out = Vec::new();
        match rx.recv_timeout(wait) {
            Ok(TracerLine::Event(ev)) => out.push(ev),
            Ok(TracerLine::Ready) => {}
            Err(RecvTimeoutError::Timeout) => return Ok(out),
            Err(RecvTimeoutError::Disconnected) => bail!("tracer exited during capture"),
        }
        out.extend(rx.try_iter().filter_map(|l| match l {
            TracerLine::Event(ev) => Some(ev),
            TracerLine::Ready => None,
        }));
        Ok(out)
    }

    fn detach(&mut self) -> Result<Vec<PacketEvent>> {
        let Some(mut child) = self.child.take() else {
            return Ok(Vec::new());
        };
        // SIGINT lets the helper remove its hooks and flush before exiting
        let pid = child.id() as libc::pid_t;
        unsafe { libc::kill(pid, libc::SIGINT) };

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if start.elapsed() >= EXIT_GRACE {
                warn!("tracer ignored SIGINT, killing");
                child.kill()?;
                child.wait()?;
                break None;
            }
            thread::sleep(Duration::from_millis(20));
        };
        // the reader ends at EOF on the helper's stdout; keep the channel
        // open until then so nothing written on the way out is lost
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let tail: Vec<PacketEvent> = self
            .lines
            .take()
            .map(|rx| {
                rx.try_iter()
                    .filter_map(|l| match l {
                        TracerLine::Event(ev) => Some(ev),
                        TracerLine::Ready => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        debug!(?status, flushed = tail.len(), "tracer exited");
        Ok(tail)
    }
}

impl Drop for ProcessTracer {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("tracer cleanup: {e:#}");
        }
    }
}
