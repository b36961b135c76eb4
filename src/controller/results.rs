use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::trial::TrialResult;
use crate::proto::config::ExperimentConfig;

/// Configurations to run, and how many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub repetitions: u32,
    /// Traffic server the device talks to.
    pub host: String,
    pub port: u16,
    pub configs: Vec<ExperimentConfig>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
        let plan: Plan =
            serde_json::from_str(&text).with_context(|| format!("parse plan {}", path.display()))?;
        if plan.configs.is_empty() {
            bail!("plan {} has no configurations", path.display());
        }
        if plan.repetitions == 0 {
            bail!("plan {} has zero repetitions", path.display());
        }
        Ok(plan)
    }

    /// The `START_CONFIG` payload for one trial: plan-wide server filled
    /// in where the point leaves it empty, results directory derived from
    /// the run and trace names.
    pub fn device_config(&self, point: &ExperimentConfig, run: &str, trace: &str) -> ExperimentConfig {
        let mut cfg = point.clone();
        if cfg.host.is_empty() {
            cfg.host = self.host.clone();
        }
        if cfg.port == 0 {
            cfg.port = self.port;
        }
        cfg.results_dir = format!("results/{run}/{trace}");
        cfg
    }
}

/// `summary.json`: every finalized trial of the run, rewritten in full
/// after each append.
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<TrialResult>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", self.path.display()))
    }

    /// Returns the number of records now in the log.
    pub fn append(&self, result: &TrialResult) -> Result<usize> {
        let mut all = self.load()?;
        all.push(result.clone());
        let text = serde_json::to_string_pretty(&all)?;
        fs::write(&self.path, text).with_context(|| format!("write {}", self.path.display()))?;
        Ok(all.len())
    }
}

pub fn write_meta(dir: &Path, plan: &Plan) -> Result<()> {
    let path = dir.join("meta.json");
    let text = serde_json::to_string_pretty(plan)?;
    fs::write(&path, text).with_context(|| format!("write {}", path.display()))
}
