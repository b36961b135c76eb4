use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::shell::run_checked;

const CALL_DEADLINE: Duration = Duration::from_secs(120);

/// What the controller needs from the power-measurement instrument.
/// Times are seconds on the controller's link timeline.
pub trait PowerInstrument {
    fn create_project(&mut self) -> Result<()>;
    fn start_recording(&mut self) -> Result<()>;
    fn stop_recording(&mut self, name: &str) -> Result<()>;
    /// Raw reading for a window; must contain a numeric `energy` field.
    fn get_energy(&mut self, t_start: f64, t_end: f64) -> Result<Map<String, Value>>;
    fn save_project(&mut self, path: &Path) -> Result<()>;
    /// Close the current project and open a fresh one, or `restore`.
    fn reset(&mut self, restore: Option<&Path>) -> Result<()>;
}

/// Energy for the measured window. `diff_ej` is the instrument's
/// `energy`; other reading fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyMetrics {
    pub diff_ej: f64,
    pub diff_t: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnergyMetrics {
    pub fn from_reading(mut raw: Map<String, Value>, t_start: f64, t_end: f64) -> Result<Self> {
        let diff_ej = raw
            .remove("energy")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow!("instrument reading has no numeric energy"))?;
        Ok(Self {
            diff_ej,
            diff_t: t_end - t_start,
            extra: raw,
        })
    }
}

/// Drives the instrument through a helper program, one invocation per
/// operation: `start`, `stop <name>`, `energy <t0> <t1>` (JSON on stdout),
/// `create-project`, `save-project <path>`, `reset [<path>]`.
pub struct CommandInstrument {
    program: PathBuf,
}

impl CommandInstrument {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn call(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        let out = run_checked(&mut cmd, CALL_DEADLINE)
            .with_context(|| format!("instrument {}", args.join(" ")))?;
        debug!(op = args.first().copied().unwrap_or_default(), "instrument ok");
        Ok(out.stdout)
    }
}

impl PowerInstrument for CommandInstrument {
    fn create_project(&mut self) -> Result<()> {
        self.call(&["create-project"]).map(drop)
    }

    fn start_recording(&mut self) -> Result<()> {
        self.call(&["start"]).map(drop)
    }

    fn stop_recording(&mut self, name: &str) -> Result<()> {
        self.call(&["stop", name]).map(drop)
    }

    fn get_energy(&mut self, t_start: f64, t_end: f64) -> Result<Map<String, Value>> {
        let out = self.call(&["energy", &t_start.to_string(), &t_end.to_string()])?;
        serde_json::from_slice(&out).context("parse instrument energy reading")
    }

    fn save_project(&mut self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.call(&["save-project", &path]).map(drop)
    }

    fn reset(&mut self, restore: Option<&Path>) -> Result<()> {
        match restore {
            Some(p) => {
                let p = p.to_string_lossy();
                self.call(&["reset", &p]).map(drop)
            }
            None => self.call(&["reset"]).map(drop),
        }
    }
}
