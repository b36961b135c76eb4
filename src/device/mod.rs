use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::cli::{DeviceOpts, secs};
use crate::error::TrialError;
use crate::frame::{LinkError, Rdt};
use crate::port::{SerialTransport, Transport};
use crate::proto::message::Message;

pub mod backend;
pub mod capture;
pub mod gpio;
pub mod tracer;
pub mod trial;
pub mod workload;

use backend::{DeviceBackend, HostBackend};
use trial::{DeviceSettings, run_trial};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    WaitingCommand,
    RunningTrial,
    Recovering,
    End,
}

/// Whether recovering from `err` includes a radio power-cycle. Link-level
/// failures only need the controller to resend.
pub fn needs_radio_reset(err: &TrialError) -> bool {
    !matches!(err, TrialError::Link(_) | TrialError::ProtocolViolation(_))
}

pub fn run(opts: DeviceOpts) -> Result<()> {
    let settings = DeviceSettings {
        results_root: opts.results_root.clone(),
        workload_duration: secs("workload-duration-s", opts.workload_duration_s)?,
        idle_settle: secs("idle-settle-s", opts.idle_settle_s)?,
        poll: std::time::Duration::from_millis(opts.poll_ms),
    };
    fs::create_dir_all(&settings.results_root)
        .with_context(|| format!("create {}", settings.results_root.display()))?;

    let transport = SerialTransport::open(&opts.ser)
        .with_context(|| format!("opening control channel on {}", opts.ser.dev))?;
    let backend = HostBackend::from_opts(&opts)?;
    info!("initialization completed, waiting for commands");

    Device::new(Rdt::new(transport), backend, settings).run_loop()
}

/// Device end of the experiment: serves one `START_CONFIG` at a time until
/// `END_EXPERIMENT`. Trial failures never end the loop.
pub struct Device<T, B> {
    rdt: Rdt<T>,
    backend: B,
    settings: DeviceSettings,
    state: DeviceState,
}

impl<T: Transport, B: DeviceBackend> Device<T, B> {
    pub fn new(rdt: Rdt<T>, backend: B, settings: DeviceSettings) -> Self {
        Self {
            rdt,
            backend,
            settings,
            state: DeviceState::WaitingCommand,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    fn set_state(&mut self, next: DeviceState) {
        debug!(from = ?self.state, to = ?next, "device state");
        self.state = next;
    }

    /// Returns once `END_EXPERIMENT` arrives, or with an error if the link
    /// itself is gone.
    pub fn run_loop(&mut self) -> Result<()> {
        loop {
            self.set_state(DeviceState::WaitingCommand);
            let msg = match self.rdt.receive(None) {
                Ok((msg, _)) => msg,
                Err(LinkError::Io(e)) => {
                    return Err(e).context("control channel lost");
                }
                // no trial in flight; the controller times out and resends
                Err(_) => continue,
            };

            match msg {
                Message::StartConfig(cfg) => {
                    self.set_state(DeviceState::RunningTrial);
                    info!(workload = %cfg.workload, payload = %cfg.payload_size, "configuration received");
                    if let Err(e) = run_trial(&mut self.rdt, &mut self.backend, &cfg, &self.settings) {
                        self.recover(&e);
                    }
                }
                Message::EndExperiment => {
                    self.set_state(DeviceState::End);
                    info!("experiment ended");
                    return Ok(());
                }
                other => {
                    let e = TrialError::ProtocolViolation(format!(
                        "unexpected {} while waiting for a command",
                        other.code()
                    ));
                    self.recover(&e);
                }
            }
        }
    }

    fn recover(&mut self, err: &TrialError) {
        self.set_state(DeviceState::Recovering);
        error!("trial failed: {err}");

        if let Err(e) = self.backend.iface_up() {
            warn!("interface up: {e:#}");
        }
        if needs_radio_reset(err) {
            info!("resetting radio module");
            if let Err(e) = self.backend.reset_radio() {
                error!("radio reset: {e:#}");
            }
        }
        match self.rdt.send(&Message::Error) {
            Ok(()) => info!("ERROR sent"),
            Err(e) => error!("ERROR not delivered: {e}"),
        }
    }
}
