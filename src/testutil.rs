//! In-memory stand-ins for the serial link, the power instrument and
//! the packet tracer.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde_json::{Map, Value};

use crate::clock;
use crate::controller::instrument::PowerInstrument;
use crate::device::backend::{DeviceBackend, MarkerPulse, PacketTracer};
use crate::device::capture::PacketEvent;
use crate::device::workload::RequestTiming;
use crate::proto::config::ExperimentConfig;
use crate::frame::encode_frame;
use crate::port::Transport;
use crate::proto::message::Message;

/// One end of a lossless in-process duplex link.
pub struct MemoryTransport {
    tx: Sender<String>,
    rx: Receiver<String>,
    reference: Instant,
}

pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    let now = Instant::now();
    (
        MemoryTransport {
            tx: a_tx,
            rx: a_rx,
            reference: now,
        },
        MemoryTransport {
            tx: b_tx,
            rx: b_rx,
            reference: now,
        },
    )
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: &str) -> io::Result<()> {
        self.tx
            .send(text.to_string())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer gone"))
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<(String, Duration)> {
        let line = match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => String::new(),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(ErrorKind::BrokenPipe, "peer gone"));
                }
            },
            None => self
                .rx
                .recv()
                .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer gone"))?,
        };
        Ok((line, self.reference.elapsed()))
    }
}

/// Replays pre-recorded lines with fixed arrival times and records what
/// was sent. Runs dry as a timeout.
#[derive(Default)]
pub struct ScriptedTransport {
    pub incoming: VecDeque<(String, Duration)>,
    pub sent: Vec<String>,
}

impl ScriptedTransport {
    pub fn push(&mut self, msg: &Message, at_secs: f64) {
        let line = encode_frame(msg).expect("encode");
        self.push_raw(&line, at_secs);
    }

    pub fn push_raw(&mut self, line: &str, at_secs: f64) {
        self.incoming
            .push_back((line.to_string(), Duration::from_secs_f64(at_secs)));
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .iter()
            .map(|l| crate::frame::decode_frame(l).expect("sent frame decodes"))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, text: &str) -> io::Result<()> {
        self.sent.push(text.to_string());
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> io::Result<(String, Duration)> {
        Ok(self
            .incoming
            .pop_front()
            .unwrap_or((String::new(), Duration::ZERO)))
    }
}

/// Power instrument that records every call as a short string.
#[derive(Default)]
pub struct FakeInstrument {
    pub calls: Vec<String>,
    pub energy: f64,
    pub fail_start: bool,
    /// Number of upcoming `save_project` calls that fail.
    pub fail_saves: u32,
}

impl FakeInstrument {
    pub fn with_energy(energy: f64) -> Self {
        Self {
            energy,
            ..Self::default()
        }
    }
}

impl PowerInstrument for FakeInstrument {
    fn create_project(&mut self) -> Result<()> {
        self.calls.push("create".into());
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()> {
        self.calls.push("start".into());
        if self.fail_start {
            bail!("instrument unplugged");
        }
        Ok(())
    }

    fn stop_recording(&mut self, name: &str) -> Result<()> {
        self.calls.push(format!("stop {name}"));
        Ok(())
    }

    fn get_energy(&mut self, t_start: f64, t_end: f64) -> Result<Map<String, Value>> {
        self.calls.push(format!("energy {t_start} {t_end}"));
        let mut m = Map::new();
        m.insert("energy".into(), Value::from(self.energy));
        Ok(m)
    }

    fn save_project(&mut self, path: &std::path::Path) -> Result<()> {
        self.calls.push(format!("save {}", path.display()));
        if self.fail_saves > 0 {
            self.fail_saves -= 1;
            bail!("project file locked");
        }
        Ok(())
    }

    fn reset(&mut self, restore: Option<&std::path::Path>) -> Result<()> {
        match restore {
            Some(p) => self.calls.push(format!("reset {}", p.display())),
            None => self.calls.push("reset".into()),
        }
        Ok(())
    }
}

/// Tracer that hands out a fixed batch of events once, then idles.
#[derive(Default)]
pub struct FakeTracer {
    pub attached: Arc<AtomicBool>,
    pub detached: Arc<AtomicBool>,
    attach_delay: Duration,
    fail_attach: bool,
    events: Vec<PacketEvent>,
    tail: Vec<PacketEvent>,
}

impl FakeTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_delay(mut self, d: Duration) -> Self {
        self.attach_delay = d;
        self
    }

    pub fn with_events(mut self, events: Vec<PacketEvent>) -> Self {
        self.events = events;
        self
    }

    /// Events handed back by `detach`, as a helper flushing on exit would.
    pub fn flush_on_detach(mut self, tail: Vec<PacketEvent>) -> Self {
        self.tail = tail;
        self
    }

    pub fn failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }
}

impl PacketTracer for FakeTracer {
    fn attach(&mut self) -> Result<()> {
        thread::sleep(self.attach_delay);
        if self.fail_attach {
            bail!("permission denied loading program");
        }
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&mut self, wait: Duration) -> Result<Vec<PacketEvent>> {
        if self.events.is_empty() {
            thread::sleep(wait);
        }
        Ok(std::mem::take(&mut self.events))
    }

    fn detach(&mut self) -> Result<Vec<PacketEvent>> {
        self.detached.store(true, Ordering::SeqCst);
        Ok(std::mem::take(&mut self.tail))
    }
}

/// Marker with no hardware behind it.
pub struct FakeMarker;

impl MarkerPulse for FakeMarker {
    fn emit(&mut self) -> Result<u64> {
        Ok(clock::monotonic_ns())
    }
}

/// Device backend with fake tracer and marker, counting every call.
#[derive(Default)]
pub struct FakeBackend {
    pub configs: Vec<ExperimentConfig>,
    pub fetches: u32,
    pub fail_fetch: bool,
    pub published: bool,
    pub iface_ups: u32,
    pub radio_resets: u32,
}

impl DeviceBackend for FakeBackend {
    fn tracer(&mut self) -> Result<Box<dyn PacketTracer>> {
        Ok(Box::new(FakeTracer::new()))
    }

    fn marker(&mut self) -> Result<Box<dyn MarkerPulse>> {
        Ok(Box::new(FakeMarker))
    }

    fn fetch(&mut self, config: &ExperimentConfig) -> Result<RequestTiming> {
        if self.configs.last() != Some(config) {
            self.configs.push(config.clone());
        }
        self.fetches += 1;
        if self.fail_fetch {
            bail!("404 Not Found");
        }
        let t = clock::monotonic_ns();
        Ok(RequestTiming {
            start_ns: t,
            stop_ns: t + 1,
        })
    }

    fn publish(&mut self, config: &ExperimentConfig) -> Result<()> {
        self.configs.push(config.clone());
        self.published = true;
        Ok(())
    }

    fn iface_up(&mut self) -> Result<()> {
        self.iface_ups += 1;
        Ok(())
    }

    fn reset_radio(&mut self) -> Result<()> {
        self.radio_resets += 1;
        Ok(())
    }
}
