use std::io;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock;
use crate::error::TrialError;
use crate::proto::config::ExperimentConfig;
use crate::shell::run_checked;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_KEEP_ALIVE: &str = "10";

/// Monotonic bounds of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTiming {
    pub start_ns: u64,
    pub stop_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimedRun {
    pub requests: u64,
    pub last: Option<RequestTiming>,
}

/// Repeat `fetch` until `duration` has elapsed, pausing `delay` between
/// requests. The pause never overruns the window. The first failed request
/// ends the run.
pub fn run_timed(
    duration: Duration,
    delay: Duration,
    mut fetch: impl FnMut() -> Result<RequestTiming>,
) -> Result<TimedRun, TrialError> {
    let begun = Instant::now();
    let mut run = TimedRun::default();
    while begun.elapsed() < duration {
        let timing = fetch().map_err(TrialError::Workload)?;
        run.requests += 1;
        run.last = Some(timing);
        let left = duration.saturating_sub(begun.elapsed());
        thread::sleep(delay.min(left));
    }
    info!(requests = run.requests, "timed workload finished");
    Ok(run)
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    /// GET `http://host:port/file`, reading the whole body.
    pub fn fetch(&self, host: &str, port: u16, file: &str) -> Result<RequestTiming> {
        let url = format!("http://{host}:{port}/{file}");
        let start_ns = clock::monotonic_ns();
        let mut resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            bail!("GET {url}: {}", resp.status());
        }
        let bytes = io::copy(&mut resp, &mut io::sink()).with_context(|| format!("read {url}"))?;
        let stop_ns = clock::monotonic_ns();
        debug!(%url, bytes, "request done");
        Ok(RequestTiming { start_ns, stop_ns })
    }
}

/// Command line of the external publisher for a message workload.
pub fn mqtt_command(program: &Path, cfg: &ExperimentConfig) -> Result<Command> {
    let mqtt = cfg.mqtt()?;
    let size = cfg.payload_bytes()?;
    let (transport, nagle_off) = match mqtt.transport_protocol.as_str() {
        "tls-nagle-off" => ("tls", true),
        other => (other, false),
    };

    let mut cmd = Command::new(program);
    cmd.arg("publish")
        .args(["--host", &cfg.host])
        .args(["--port", &cfg.port.to_string()])
        .args(["--transport", transport])
        .args(["--topic", &mqtt.topic])
        .args(["--size", &size.to_string()])
        .args(["--qos", &mqtt.qos.to_string()])
        .args(["--rate", &mqtt.rate.to_string()])
        .args(["--duration", &mqtt.duration.to_string()])
        .args(["--queue", &mqtt.queue.to_string()]);
    if nagle_off {
        cmd.arg("--nagle-off");
    }
    cmd.args(["--insecure", "--keep-alive", MQTT_KEEP_ALIVE]);
    Ok(cmd)
}

pub fn publish_mqtt(program: &Path, cfg: &ExperimentConfig, deadline: Duration) -> Result<()> {
    let mut cmd = mqtt_command(program, cfg)?;
    info!(program = %program.display(), "starting publisher");
    run_checked(&mut cmd, deadline)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::config::{MqttParams, Workload};
    use anyhow::anyhow;
    use std::ffi::OsStr;

    fn timing() -> RequestTiming {
        let t = clock::monotonic_ns();
        RequestTiming {
            start_ns: t,
            stop_ns: t,
        }
    }

    #[test]
    fn timed_run_fills_window() {
        let t = Instant::now();
        let run = run_timed(Duration::from_millis(120), Duration::from_millis(50), || {
            Ok(timing())
        })
        .unwrap();
        let took = t.elapsed();
        assert!(took >= Duration::from_millis(120));
        assert!(took < Duration::from_millis(400));
        assert!((2..=4).contains(&run.requests), "{}", run.requests);
        assert!(run.last.is_some());
    }

    #[test]
    fn delay_capped_at_remaining_window() {
        let t = Instant::now();
        let run = run_timed(Duration::from_millis(50), Duration::from_secs(10), || {
            Ok(timing())
        })
        .unwrap();
        assert_eq!(run.requests, 1);
        assert!(t.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn failed_request_is_workload_error() {
        let mut n = 0;
        let res = run_timed(Duration::from_secs(5), Duration::ZERO, || {
            n += 1;
            if n == 3 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(timing())
            }
        });
        assert!(matches!(res, Err(TrialError::Workload(_))));
        assert_eq!(n, 3);
    }

    fn mqtt_cfg(transport: &str) -> ExperimentConfig {
        let mut c = ExperimentConfig::new(Workload::Mqtt, "2KB", 0.0);
        c.host = "broker".into();
        c.port = 8883;
        c.mqtt = Some(MqttParams {
            transport_protocol: transport.into(),
            qos: 1,
            topic: "t/x".into(),
            rate: 5.0,
            duration: 60,
            queue: 100,
        });
        c
    }

    fn args(cmd: &Command) -> Vec<&str> {
        cmd.get_args().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn publisher_arguments() {
        let cmd = mqtt_command(Path::new("pub"), &mqtt_cfg("tcp")).unwrap();
        assert_eq!(cmd.get_program(), OsStr::new("pub"));
        assert_eq!(
            args(&cmd),
            [
                "publish", "--host", "broker", "--port", "8883", "--transport", "tcp", "--topic",
                "t/x", "--size", "2048", "--qos", "1", "--rate", "5", "--duration", "60",
                "--queue", "100", "--insecure", "--keep-alive", "10"
            ]
        );
    }

    #[test]
    fn nagle_off_maps_to_tls_flag() {
        let cmd = mqtt_command(Path::new("pub"), &mqtt_cfg("tls-nagle-off")).unwrap();
        let a = args(&cmd);
        let i = a.iter().position(|x| *x == "--transport").unwrap();
        assert_eq!(a[i + 1], "tls");
        assert!(a.contains(&"--nagle-off"));
    }

    #[test]
    fn mqtt_params_required() {
        let cfg = ExperimentConfig::new(Workload::Mqtt, "1KB", 0.0);
        assert!(mqtt_command(Path::new("pub"), &cfg).is_err());
    }

    #[test]
    fn unreachable_server_is_an_error() {
        let f = HttpFetcher::new().unwrap();
        // port 9 on loopback: nothing listens there in CI
        assert!(f.fetch("127.0.0.1", 9, "file-1kb").is_err());
    }
}
