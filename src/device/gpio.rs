use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::backend::MarkerPulse;
use crate::clock;

const SYSFS_GPIO: &str = "/sys/class/gpio";
const STABILIZE: Duration = Duration::from_millis(50);
const PULSE_WIDTH: Duration = Duration::from_millis(10);

/// Sync pulse on a sysfs GPIO line, seen by the power instrument's
/// digital input.
pub struct SysfsGpio {
    value: PathBuf,
}

impl SysfsGpio {
    fn open_at(base: &Path, pin: u32) -> Result<Self> {
        let dir = base.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(base.join("export"), pin.to_string())
                .with_context(|| format!("export gpio{pin}"))?;
        }
        // "low" configures an output driven low
        fs::write(dir.join("direction"), "low")
            .with_context(|| format!("configure gpio{pin} as output"))?;
        thread::sleep(STABILIZE);
        Ok(Self {
            value: dir.join("value"),
        })
    }
}

impl MarkerPulse for SysfsGpio {
    fn emit(&mut self) -> Result<u64> {
        fs::write(&self.value, "1").context("gpio high")?;
        thread::sleep(PULSE_WIDTH);
        fs::write(&self.value, "0").context("gpio low")?;
        let ts = clock::monotonic_ns();
        debug!(timestamp_ns = ts, "marker pulse");
        Ok(ts)
    }
}

/// Marker with no line behind it: just the monotonic clock.
pub struct ClockMarker;

impl MarkerPulse for ClockMarker {
    fn emit(&mut self) -> Result<u64> {
        Ok(clock::monotonic_ns())
    }
}

/// The GPIO marker for `pin`, or [`ClockMarker`] when the line cannot be
/// set up. A missing line costs the hardware alignment, not the trial.
pub fn open_marker(pin: u32) -> Box<dyn MarkerPulse> {
    open_marker_at(Path::new(SYSFS_GPIO), pin)
}

fn open_marker_at(base: &Path, pin: u32) -> Box<dyn MarkerPulse> {
    match SysfsGpio::open_at(base, pin) {
        Ok(gpio) => Box::new(gpio),
        Err(e) => {
            warn!("gpio{pin} unavailable, markers use the clock only: {e:#}");
            Box::new(ClockMarker)
        }
    }
}
