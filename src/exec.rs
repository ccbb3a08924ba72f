//! Bounded-time execution of external commands used by `cmd` back-ends.

use std::{
    io::{self, Read},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default upper bound for a single command invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A program and its arguments as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCfg {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExecCfg {
    /// Runs the command, substituting `placeholder` in every argument.
    pub fn run_with(&self, placeholder: &str, value: &str, timeout: Duration) -> Result<String> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(placeholder, value))
            .collect();
        run_with_timeout(&self.exec, &args, timeout)
    }

    pub fn run(&self, timeout: Duration) -> Result<String> {
        run_with_timeout(&self.exec, &self.args, timeout)
    }
}

/// Runs `program` and returns its trimmed stdout.
///
/// The child is killed once `timeout` elapses. A non-zero exit status is an
/// error carrying the command's stderr. Both pipes are drained while the
/// child runs, so chatty commands cannot fill them and hang.
pub fn run_with_timeout(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn '{program}'"))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait for '{program}'"))?
        {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("'{program}' timed out after {timeout:?}");
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout).with_context(|| format!("Failed to read stdout of '{program}'"))?;
    if !status.success() {
        let stderr = collect(stderr).unwrap_or_default();
        bail!("'{program}' exited with {status}: {}", stderr.trim());
    }

    Ok(stdout.trim().to_string())
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buf = String::new();
        pipe.read_to_string(&mut buf).map(|_| buf)
    })
}

fn collect(reader: Option<JoinHandle<io::Result<String>>>) -> Result<String> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow::anyhow!("pipe reader panicked"))?
            .map_err(Into::into),
        None => Ok(String::new()),
    }
}
