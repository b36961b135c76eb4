use std::io;

use thiserror::Error;

use crate::frame::LinkError;
use crate::proto::config::ConfigError;

/// Why a trial attempt ended early. Every variant is recoverable by
/// retrying the trial; the variant picks the recovery path.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("device reported an error")]
    DeviceError,
    #[error("workload failed: {0:#}")]
    Workload(anyhow::Error),
    #[error("instrument failed: {0:#}")]
    Instrument(anyhow::Error),
    #[error("packet capture failed: {0:#}")]
    Capture(anyhow::Error),
    #[error("result log: {0:#}")]
    Persist(anyhow::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl TrialError {
    /// Failure of the framing layer itself: the peer most likely never saw
    /// a clean message and a plain resend is enough.
    pub fn is_link(&self) -> bool {
        matches!(self, TrialError::Link(_))
    }
}
