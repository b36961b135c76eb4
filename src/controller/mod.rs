use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cli::{ControllerOpts, secs};
use crate::error::TrialError;
use crate::frame::Rdt;
use crate::port::{SerialTransport, Transport};
use crate::proto::message::Message;

pub mod instrument;
pub mod results;
pub mod trial;

use instrument::{CommandInstrument, PowerInstrument};
use results::{Plan, ResultLog, write_meta};
use trial::{TrialResult, TrialSettings, run_trial};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub trial: TrialSettings,
    pub link_retry_pause: Duration,
    pub failure_retry_pause: Duration,
    pub end_repeats: u32,
}

impl ControllerSettings {
    pub fn from_opts(o: &ControllerOpts) -> Result<Self> {
        Ok(Self {
            trial: TrialSettings {
                receive_timeout: secs("receive-timeout-s", o.receive_timeout_s)?,
                start_settle: secs("start-settle-s", o.start_settle_s)?,
                expected_messages: o.expected_messages,
            },
            link_retry_pause: secs("link-retry-pause-s", o.link_retry_pause_s)?,
            failure_retry_pause: secs("failure-retry-pause-s", o.failure_retry_pause_s)?,
            end_repeats: o.end_repeats,
        })
    }
}

/// How the outer loop recovers before repeating a failed trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Link-level failure: the device likely never saw a clean message.
    Resend { pause: Duration },
    /// Anything else: reset the instrument, optionally restoring the last
    /// project saved in this iteration.
    ResetInstrument {
        pause: Duration,
        restore: Option<PathBuf>,
    },
}

pub fn retry_decision(
    err: &TrialError,
    last_saved: Option<&Path>,
    s: &ControllerSettings,
) -> RetryDecision {
    if err.is_link() {
        RetryDecision::Resend {
            pause: s.link_retry_pause,
        }
    } else {
        RetryDecision::ResetInstrument {
            pause: s.failure_retry_pause,
            restore: last_saved.map(Path::to_path_buf),
        }
    }
}

pub fn run(opts: ControllerOpts) -> Result<()> {
    let settings = ControllerSettings::from_opts(&opts)?;
    let plan = Plan::load(&opts.plan)?;

    let run_name = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let run_dir = opts.out_dir.join(&run_name);
    fs::create_dir_all(run_dir.join("projects"))
        .with_context(|| format!("create {}", run_dir.display()))?;
    write_meta(&run_dir, &plan)?;

    let transport = SerialTransport::open(&opts.ser)
        .with_context(|| format!("opening control channel on {}", opts.ser.dev))?;
    let instrument = CommandInstrument::new(&opts.instrument);
    info!(run = %run_dir.display(), "initialization completed");

    let mut controller = Controller::new(
        Rdt::new(transport),
        instrument,
        ResultLog::new(run_dir.join("summary.json")),
        run_dir.join("projects"),
        run_name,
        settings,
    );
    controller.run_plan(&plan)
}

/// Owns the link and the instrument for a whole experiment run; exactly
/// one trial is in flight at a time.
pub struct Controller<T, I> {
    rdt: Rdt<T>,
    instrument: I,
    log: ResultLog,
    project_dir: PathBuf,
    run_name: String,
    settings: ControllerSettings,
    trace_counter: u64,
}

impl<T: Transport, I: PowerInstrument> Controller<T, I> {
    pub fn new(
        rdt: Rdt<T>,
        instrument: I,
        log: ResultLog,
        project_dir: PathBuf,
        run_name: String,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            rdt,
            instrument,
            log,
            project_dir,
            run_name,
            settings,
            trace_counter: 0,
        }
    }

    pub fn run_plan(&mut self, plan: &Plan) -> Result<()> {
        info!(
            configs = plan.configs.len(),
            repetitions = plan.repetitions,
            "running plan"
        );

        for iteration in 0..plan.repetitions {
            self.instrument
                .create_project()
                .context("create instrument project")?;
            let mut last_saved: Option<PathBuf> = None;

            for point in &plan.configs {
                let trace = point.trace_name(self.trace_counter, iteration);
                let device_config = plan.device_config(point, &self.run_name, &trace);

                loop {
                    let outcome = run_trial(
                        &mut self.rdt,
                        &mut self.instrument,
                        &trace,
                        point,
                        &device_config,
                        &self.settings.trial,
                    )
                    .and_then(|result| self.finalize(&result, iteration));

                    match outcome {
                        Ok(saved) => {
                            last_saved = Some(saved);
                            info!(trace = %trace, "configuration completed");
                            break;
                        }
                        Err(e) => {
                            error!(trace = %trace, "configuration failed: {e:#}");
                            let decision =
                                retry_decision(&e, last_saved.as_deref(), &self.settings);
                            self.apply(decision);
                        }
                    }
                }
                self.trace_counter += 1;
            }
            info!(iteration, "iteration completed");
        }

        self.end_experiment();
        info!(results = %self.log.path().display(), "experiment completed");
        Ok(())
    }

    /// Save the instrument project, then append to the result log; returns
    /// the project path. The append is the last fallible step, so a retried
    /// trial never leaves a second record behind.
    fn finalize(&mut self, result: &TrialResult, iteration: u32) -> Result<PathBuf, TrialError> {
        let project = self.project_dir.join(format!("Iteration_{iteration}"));
        self.instrument
            .save_project(&project)
            .map_err(TrialError::Instrument)?;

        let n = self
            .log
            .append(result)
            .map_err(TrialError::Persist)?;
        info!(trace = %result.trace_name, records = n, "result appended");
        Ok(project)
    }

    fn apply(&mut self, decision: RetryDecision) {
        match decision {
            RetryDecision::Resend { pause } => thread::sleep(pause),
            RetryDecision::ResetInstrument { pause, restore } => {
                thread::sleep(pause);
                if let Err(e) = self.instrument.reset(restore.as_deref()) {
                    error!("instrument reset failed: {e:#}");
                }
            }
        }
    }

    /// Best effort: no acknowledgment is expected or awaited.
    fn end_experiment(&mut self) {
        for _ in 0..self.settings.end_repeats {
            if let Err(e) = self.rdt.send(&Message::EndExperiment) {
                warn!("END_EXPERIMENT not sent: {e}");
            }
        }
    }
}
