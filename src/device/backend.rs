use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use super::capture::PacketEvent;
use super::gpio::open_marker;
use super::tracer::ProcessTracer;
use super::workload::{HttpFetcher, RequestTiming, publish_mqtt};
use crate::cli::DeviceOpts;
use crate::proto::config::ExperimentConfig;
use crate::shell::run_checked;

const IFACE_DEADLINE: Duration = Duration::from_secs(10);
const RADIO_RESET_DEADLINE: Duration = Duration::from_secs(180);
const PUBLISH_DEADLINE: Duration = Duration::from_secs(120);
const TRACER_ATTACH_DEADLINE: Duration = Duration::from_secs(30);

/// Kernel packet tracer, consumed as a black-box event source.
pub trait PacketTracer: Send {
    /// Attach at both ingress and egress hook points.
    fn attach(&mut self) -> Result<()>;
    /// Wait at most `wait` for events; an empty batch is not an error.
    fn poll(&mut self, wait: Duration) -> Result<Vec<PacketEvent>>;
    /// Release the hooks. Returns events the tracer flushed while shutting
    /// down; they belong to the capture like any polled batch.
    fn detach(&mut self) -> Result<Vec<PacketEvent>>;
}

/// Hardware timing pulse; returns the monotonic time it was emitted.
pub trait MarkerPulse: Send {
    fn emit(&mut self) -> Result<u64>;
}

/// Everything the device state machine needs from the outside world.
pub trait DeviceBackend {
    fn tracer(&mut self) -> Result<Box<dyn PacketTracer>>;
    fn marker(&mut self) -> Result<Box<dyn MarkerPulse>>;
    /// One HTTP request of the timed workload.
    fn fetch(&mut self, config: &ExperimentConfig) -> Result<RequestTiming>;
    /// Whole message-publish workload; returns when the publisher does.
    fn publish(&mut self, config: &ExperimentConfig) -> Result<()>;
    fn iface_up(&mut self) -> Result<()>;
    /// Power-cycle and reconfigure the radio module.
    fn reset_radio(&mut self) -> Result<()>;
}

/// Backend for a real board: helper programs, sysfs GPIO, `ip`.
pub struct HostBackend {
    iface: String,
    recovery_iface: String,
    gpio_pin: u32,
    tracer_cmd: PathBuf,
    publisher: PathBuf,
    radio_reset_cmd: Option<String>,
    http: HttpFetcher,
}

impl HostBackend {
    pub fn from_opts(o: &DeviceOpts) -> Result<Self> {
        Ok(Self {
            iface: o.iface.clone(),
            recovery_iface: o.recovery_iface.clone(),
            gpio_pin: o.gpio_pin,
            tracer_cmd: o.tracer_cmd.clone(),
            publisher: o.publisher.clone(),
            radio_reset_cmd: o.radio_reset_cmd.clone(),
            http: HttpFetcher::new()?,
        })
    }
}

impl DeviceBackend for HostBackend {
    fn tracer(&mut self) -> Result<Box<dyn PacketTracer>> {
        Ok(Box::new(ProcessTracer::new(
            &self.tracer_cmd,
            &self.iface,
            TRACER_ATTACH_DEADLINE,
        )))
    }

    fn marker(&mut self) -> Result<Box<dyn MarkerPulse>> {
        Ok(open_marker(self.gpio_pin))
    }

    fn fetch(&mut self, config: &ExperimentConfig) -> Result<RequestTiming> {
        let file = config.payload_file_name()?;
        self.http.fetch(&config.host, config.port, &file)
    }

    fn publish(&mut self, config: &ExperimentConfig) -> Result<()> {
        publish_mqtt(&self.publisher, config, PUBLISH_DEADLINE)
    }

    fn iface_up(&mut self) -> Result<()> {
        let mut cmd = Command::new("ip");
        cmd.args(["link", "set", &self.recovery_iface, "up"]);
        run_checked(&mut cmd, IFACE_DEADLINE)?;
        info!(iface = %self.recovery_iface, "interface up");
        Ok(())
    }

    fn reset_radio(&mut self) -> Result<()> {
        let Some(script) = &self.radio_reset_cmd else {
            warn!("no radio reset command configured");
            bail!("radio reset unavailable");
        };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        run_checked(&mut cmd, RADIO_RESET_DEADLINE)?;
        info!("radio module reset");
        Ok(())
    }
}
