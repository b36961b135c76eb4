use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "otii-sync",
    about = "Energy experiment sequencing over a UART control link"
)]
pub struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Sequence trials, drive the power instrument, collect results
    Controller(ControllerOpts),
    /// Execute trials on the device under test
    Device(DeviceOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyS0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ControllerOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Experiment plan (JSON)
    #[arg(long)]
    pub plan: PathBuf,
    /// Directory receiving one sub-directory per run
    #[arg(long, default_value = "experiments")]
    pub out_dir: PathBuf,
    /// Power instrument helper program
    #[arg(long, default_value = "otii-cli")]
    pub instrument: PathBuf,
    /// Per-message receive timeout, seconds
    #[arg(long, default_value_t = 150.0)]
    pub receive_timeout_s: f64,
    /// Pause after START_REQ while the device settles into its window, seconds
    #[arg(long, default_value_t = 50.0)]
    pub start_settle_s: f64,
    /// Messages a clean trial attempt produces
    #[arg(long, default_value_t = 3)]
    pub expected_messages: usize,
    /// Pause before retrying after a link failure, seconds
    #[arg(long, default_value_t = 1.0)]
    pub link_retry_pause_s: f64,
    /// Pause before retrying after any other failure, seconds
    #[arg(long, default_value_t = 10.0)]
    pub failure_retry_pause_s: f64,
    /// END_EXPERIMENT repetitions (no acknowledgment)
    #[arg(long, default_value_t = 3)]
    pub end_repeats: u32,
}

#[derive(Args, Debug, Clone)]
pub struct DeviceOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Root of per-trial results directories
    #[arg(long, default_value = "results")]
    pub results_root: PathBuf,
    /// Length of the timed HTTP workload, seconds
    #[arg(long, default_value_t = 60.0)]
    pub workload_duration_s: f64,
    /// Idle time before STOP_CONFIG for non-packet workloads, seconds
    #[arg(long, default_value_t = 25.0)]
    pub idle_settle_s: f64,
    /// Capture poll interval, milliseconds
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
    /// Interface the packet tracer attaches to
    #[arg(long, default_value = "wlan0")]
    pub iface: String,
    /// Interface forced up during recovery
    #[arg(long, default_value = "eth0")]
    pub recovery_iface: String,
    /// GPIO (BCM numbering) driving the sync pulse
    #[arg(long, default_value_t = 17)]
    pub gpio_pin: u32,
    /// Packet tracer helper: prints READY, then `ts,iat,len,dir` lines
    #[arg(long, default_value = "ebpf-tracer")]
    pub tracer_cmd: PathBuf,
    /// Message-publish workload program
    #[arg(long, default_value = "raw-mqtt-stream-cli")]
    pub publisher: PathBuf,
    /// Shell command power-cycling and reconfiguring the radio module
    #[arg(long)]
    pub radio_reset_cmd: Option<String>,
}

/// Seconds from the command line to a `Duration`.
pub fn secs(name: &str, v: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(v).map_err(|_| anyhow!("{name} must be a non-negative number of seconds"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_defaults() {
        let cli = Cli::parse_from(["otii-sync", "controller", "--plan", "p.json"]);
        let Cmd::Controller(o) = cli.cmd else {
            panic!("wrong subcommand")
        };
        assert_eq!(o.receive_timeout_s, 150.0);
        assert_eq!(o.expected_messages, 3);
        assert_eq!(o.end_repeats, 3);
        assert_eq!(o.ser.baud, 115_200);
    }

    #[test]
    fn device_flags() {
        let cli = Cli::parse_from([
            "otii-sync",
            "--debug",
            "device",
            "--dev",
            "/dev/ttyAMA0",
            "--radio-reset-cmd",
            "modem-reset",
        ]);
        assert!(cli.debug);
        let Cmd::Device(o) = cli.cmd else {
            panic!("wrong subcommand")
        };
        assert_eq!(o.ser.dev, "/dev/ttyAMA0");
        assert_eq!(o.radio_reset_cmd.as_deref(), Some("modem-reset"));
        assert_eq!(o.poll_ms, 100);
    }

    #[test]
    fn negative_seconds_rejected() {
        assert!(secs("x", -1.0).is_err());
        assert_eq!(secs("x", 0.5).unwrap(), Duration::from_millis(500));
    }
}
