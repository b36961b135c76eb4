use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid payload size: {0}")]
    BadPayloadSize(String),
    #[error("mqtt workload requires mqtt parameters")]
    MissingMqtt,
}

/// Kind of traffic a trial generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// Timed HTTP fetch loop, packet tracer attached.
    Http,
    /// Message-publish stream through an external publisher.
    Mqtt,
}

impl Workload {
    pub fn as_str(self) -> &'static str {
        match self {
            Workload::Http => "http",
            Workload::Mqtt => "mqtt",
        }
    }

    /// Whether trials of this kind run under the packet tracer.
    pub fn is_packet_level(self) -> bool {
        matches!(self, Workload::Http)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttParams {
    pub transport_protocol: String,
    pub qos: u8,
    pub topic: String,
    /// messages per second
    pub rate: f64,
    /// seconds
    pub duration: u64,
    pub queue: u32,
}

/// One point of the configuration space. Sent verbatim as the
/// `START_CONFIG` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub workload: Workload,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub payload_size: String,
    #[serde(default)]
    pub radio_generation: String,
    #[serde(default)]
    pub bandwidth: String,
    /// Pause between consecutive requests, seconds.
    pub delay: f64,
    #[serde(default)]
    pub results_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttParams>,
}

impl ExperimentConfig {
    pub fn new(workload: Workload, payload_size: &str, delay: f64) -> Self {
        Self {
            workload,
            host: String::new(),
            port: 0,
            payload_size: payload_size.to_string(),
            radio_generation: String::new(),
            bandwidth: String::new(),
            delay,
            results_dir: String::new(),
            mqtt: None,
        }
    }

    pub fn payload_bytes(&self) -> Result<usize, ConfigError> {
        parse_payload_size(&self.payload_size)
    }

    /// Name of the file the HTTP workload fetches, e.g. `file-1kb`.
    pub fn payload_file_name(&self) -> Result<String, ConfigError> {
        parse_payload_size(&self.payload_size)?;
        Ok(format!("file-{}", self.payload_size.trim().to_ascii_lowercase()))
    }

    pub fn mqtt(&self) -> Result<&MqttParams, ConfigError> {
        self.mqtt.as_ref().ok_or(ConfigError::MissingMqtt)
    }

    /// `{counter}_{delay}S_{bandwidth}_{radio}_{payload}_{iteration}`;
    /// bandwidth is cut at the first `%`.
    pub fn trace_name(&self, counter: u64, iteration: u32) -> String {
        let bandwidth = self.bandwidth.split('%').next().unwrap_or_default();
        format!(
            "{}_{}S_{}_{}_{}_{:03}",
            counter, self.delay, bandwidth, self.radio_generation, self.payload_size, iteration
        )
    }

    /// Device-side results directory name for one run.
    pub fn capture_dir_name(&self, stamp: &str) -> String {
        format!(
            "ebpf_{}_{}S_{}_{}_{}",
            self.workload, self.delay, self.radio_generation, self.payload_size, stamp
        )
    }
}

/// Size suffixes, powers of 1024.
const PAYLOAD_UNITS: [(&str, usize); 4] = [("B", 1), ("KB", 1 << 10), ("MB", 1 << 20), ("GB", 1 << 30)];

/// Parse `"512B"`, `"1KB"`, `"2MB"`, `"1GB"` into bytes.
pub fn parse_payload_size(s: &str) -> Result<usize, ConfigError> {
    let bad = || ConfigError::BadPayloadSize(s.to_string());
    let t = s.trim();
    let split = t
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(bad)?;
    let (num, unit) = t.split_at(split);
    let unit = unit.to_ascii_uppercase();
    let mult = PAYLOAD_UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|&(_, m)| m)
        .ok_or_else(bad)?;
    let n: usize = num.trim().parse().map_err(|_| bad())?;
    n.checked_mul(mult).ok_or_else(bad)
}
