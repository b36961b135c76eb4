use anyhow::Result;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cli::SerialOpts;

/// Upper bound on a single blocking read, so deadlines are honoured.
const READ_SLICE: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 256;

/// Line-oriented duplex byte channel.
///
/// `receive` timestamps are measured from the moment the channel was
/// opened, giving each side its own self-consistent timeline.
pub trait Transport {
    /// Write `text` followed by `\n`; returns once fully written.
    fn send(&mut self, text: &str) -> io::Result<()>;

    /// Block until a full line arrives or `timeout` elapses (`None` waits
    /// forever). A timeout yields an empty string, not an error.
    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<(String, Duration)>;
}

pub fn open_port(opts: &SerialOpts) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(READ_SLICE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    reference: Instant,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn open(opts: &SerialOpts) -> Result<Self> {
        let port = open_port(opts)?;
        port.clear(ClearBuffer::All)
            .map_err(|e| anyhow::anyhow!("flush {}: {}", opts.dev, e))?;
        debug!(dev = %opts.dev, baud = opts.baud, "serial channel open");
        Ok(Self::from_port(port))
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            reference: Instant::now(),
            pending: Vec::with_capacity(READ_CHUNK),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, text: &str) -> io::Result<()> {
        let mut out = Vec::with_capacity(text.len() + 1);
        out.extend_from_slice(text.as_bytes());
        out.push(b'\n');
        self.port.write_all(&out)?;
        self.port.flush()?;
        debug!(line = text, "uart tx");
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<(String, Duration)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(line) = self.take_line() {
                debug!(line = %line, "uart rx");
                return Ok((line, self.reference.elapsed()));
            }

            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if !self.pending.is_empty() {
                            debug!(bytes = self.pending.len(), "dropping partial line at timeout");
                            self.pending.clear();
                        }
                        debug!("uart rx timeout");
                        return Ok((String::new(), self.reference.elapsed()));
                    }
                    (d - now).min(READ_SLICE)
                }
                None => READ_SLICE,
            };
            self.port.set_timeout(slice)?;

            match self.port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
