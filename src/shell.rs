use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::debug;

const POLL: Duration = Duration::from_millis(20);

/// Run `cmd` to completion, killing it once `deadline` passes.
pub fn run_with_deadline(cmd: &mut Command, deadline: Duration) -> Result<Output> {
    let prog = cmd.get_program().to_string_lossy().into_owned();
    debug!(cmd = ?cmd, "spawn");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {prog}"))?;

    let out = child.stdout.take().map(drain);
    let err = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().with_context(|| format!("wait {prog}"))? {
            break status;
        }
        if start.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{prog} timed out after {:?}", deadline);
        }
        thread::sleep(POLL);
    };

    Ok(Output {
        status,
        stdout: collect(out),
        stderr: collect(err),
    })
}

/// Like [`run_with_deadline`] but a non-zero exit is an error.
pub fn run_checked(cmd: &mut Command, deadline: Duration) -> Result<Output> {
    let prog = cmd.get_program().to_string_lossy().into_owned();
    let out = run_with_deadline(cmd, deadline)?;
    if !out.status.success() {
        bail!(
            "{prog} exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out)
}

fn drain<R: Read + Send + 'static>(mut r: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        buf
    })
}

fn collect(h: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    h.and_then(|h| h.join().ok()).unwrap_or_default()
}
