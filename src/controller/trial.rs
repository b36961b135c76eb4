use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::instrument::{EnergyMetrics, PowerInstrument};
use crate::error::TrialError;
use crate::frame::Rdt;
use crate::port::Transport;
use crate::proto::config::ExperimentConfig;
use crate::proto::message::{ControlCode, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Configuring,
    Recording,
    AwaitingStart,
    Measuring,
    AwaitingStopConfig,
    Finalizing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Seconds since the controller opened the link.
    pub timestamp: f64,
    pub message: ControlCode,
}

/// One finalized trial, as appended to the result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trace_name: String,
    pub config: ExperimentConfig,
    pub messages: Vec<MessageRecord>,
    pub req_start: Option<f64>,
    pub req_stop: Option<f64>,
    pub energy: Option<EnergyMetrics>,
    /// Device-side status, filled by an external downloader when present.
    pub device: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub receive_timeout: Duration,
    /// Pacing pause after `START_REQ`. Heuristic, not a protocol rule.
    pub start_settle: Duration,
    /// Messages one clean attempt produces (START_REQ, STOP_REQ, STOP_CONFIG).
    pub expected_messages: usize,
}

/// What the driver does after a message has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Receive,
    Settle,
    Finalize,
    /// Attempt ended with an anomalous message count: resend START_CONFIG.
    Restart,
}

#[derive(Debug, Default, Clone)]
struct Attempt {
    messages: Vec<MessageRecord>,
    req_start: Option<f64>,
    req_stop: Option<f64>,
}

/// Controller-side state for the single trial in flight.
pub struct Trial {
    trace: String,
    config: ExperimentConfig,
    state: ControllerState,
    attempt: Attempt,
    expected_messages: usize,
}

impl Trial {
    pub fn new(trace: &str, config: ExperimentConfig, expected_messages: usize) -> Self {
        Self {
            trace: trace.to_string(),
            config,
            state: ControllerState::Idle,
            attempt: Attempt::default(),
            expected_messages,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    fn set_state(&mut self, next: ControllerState) {
        debug!(trace = %self.trace, from = ?self.state, to = ?next, "controller state");
        self.state = next;
    }

    /// Apply one received message. `at` is its arrival on the link timeline.
    pub fn on_message(&mut self, msg: &Message, at: Duration) -> Result<Step, TrialError> {
        let ts = at.as_secs_f64();
        self.attempt.messages.push(MessageRecord {
            timestamp: ts,
            message: msg.code(),
        });

        match msg {
            Message::StartReq => {
                self.attempt.req_start = Some(ts);
                self.set_state(ControllerState::Measuring);
                Ok(Step::Settle)
            }
            Message::StopReq => {
                self.attempt.req_stop = Some(ts);
                self.set_state(ControllerState::AwaitingStopConfig);
                Ok(Step::Receive)
            }
            Message::StopConfig if self.attempt_is_clean() => {
                self.set_state(ControllerState::Finalizing);
                Ok(Step::Finalize)
            }
            Message::StopConfig => {
                warn!(
                    trace = %self.trace,
                    got = self.attempt.messages.len(),
                    expected = self.expected_messages,
                    "anomalous attempt, restarting"
                );
                Ok(Step::Restart)
            }
            Message::Error => {
                self.set_state(ControllerState::Failed);
                Err(TrialError::DeviceError)
            }
            other => {
                let during = self.state;
                self.set_state(ControllerState::Failed);
                Err(TrialError::ProtocolViolation(format!(
                    "unexpected {} while {:?}",
                    other.code(),
                    during
                )))
            }
        }
    }

    fn attempt_is_clean(&self) -> bool {
        let a = &self.attempt;
        a.messages.len() == self.expected_messages
            && matches!((a.req_start, a.req_stop), (Some(s), Some(e)) if s < e)
    }

    /// Drop everything observed in the current attempt.
    pub fn restart(&mut self) {
        self.attempt = Attempt::default();
        self.set_state(ControllerState::AwaitingStart);
    }

    pub fn window(&self) -> Option<(f64, f64)> {
        Some((self.attempt.req_start?, self.attempt.req_stop?))
    }

    pub fn finish(mut self, energy: EnergyMetrics) -> TrialResult {
        self.set_state(ControllerState::Idle);
        TrialResult {
            trace_name: self.trace,
            config: self.config,
            messages: self.attempt.messages,
            req_start: self.attempt.req_start,
            req_stop: self.attempt.req_stop,
            energy: Some(energy),
            device: None,
        }
    }
}

/// Run one trial end to end: start recording, send `START_CONFIG`, track
/// the device's bracket messages, then stop recording and read energy for
/// `[req_start, req_stop]`. Anomalous attempts are restarted from
/// `START_CONFIG`; every other failure ends the trial with an error.
pub fn run_trial<T, I>(
    rdt: &mut Rdt<T>,
    instrument: &mut I,
    trace: &str,
    point: &ExperimentConfig,
    device_config: &ExperimentConfig,
    settings: &TrialSettings,
) -> Result<TrialResult, TrialError>
where
    T: Transport,
    I: PowerInstrument + ?Sized,
{
    let mut trial = Trial::new(trace, point.clone(), settings.expected_messages);
    info!(trace, "start configuration");

    trial.set_state(ControllerState::Configuring);
    instrument.start_recording().map_err(TrialError::Instrument)?;
    trial.set_state(ControllerState::Recording);
    info!(trace, "recording started");

    'attempt: loop {
        rdt.send(&Message::StartConfig(device_config.clone()))?;
        trial.set_state(ControllerState::AwaitingStart);
        info!(trace, "configuration message sent");

        loop {
            let (msg, at) = rdt.receive(Some(settings.receive_timeout))?;
            match trial.on_message(&msg, at)? {
                Step::Receive => {}
                Step::Settle => {
                    info!(trace, at = at.as_secs_f64(), "request start");
                    thread::sleep(settings.start_settle);
                }
                Step::Finalize => break 'attempt,
                Step::Restart => {
                    trial.restart();
                    continue 'attempt;
                }
            }
        }
    }

    instrument.stop_recording(trace).map_err(TrialError::Instrument)?;
    info!(trace, "recording stopped");

    let (start, stop) = trial
        .window()
        .ok_or_else(|| TrialError::ProtocolViolation("measurement window incomplete".into()))?;
    let reading = instrument
        .get_energy(start, stop)
        .map_err(TrialError::Instrument)?;
    let energy = EnergyMetrics::from_reading(reading, start, stop).map_err(TrialError::Instrument)?;
    Ok(trial.finish(energy))
}
