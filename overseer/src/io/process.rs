//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for a call killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, with timeouts mapped to 124 and signals to -1.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(-1)
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&truncated_notice("stdout", self.stdout_truncated));
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&truncated_notice("stderr", self.stderr_truncated));
        text
    }

    /// stdout followed by stderr.
    pub fn merged_text(&self) -> String {
        let stdout = self.stdout_text();
        let stderr = self.stderr_text();
        match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (_, true) => stdout,
            (true, false) => stderr,
            (false, false) => format!("{}\n{}", stdout.trim_end(), stderr),
        }
    }
}

fn truncated_notice(stream: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{stream} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// Both pipes are drained on reader threads while the child runs, so a chatty
/// agent cannot deadlock on a full pipe. At most `output_limit_bytes` of each
/// stream is kept; the rest is counted and discarded. A child that outlives
/// `timeout` is killed and reported with `timed_out = true`.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "spawn failed");
        anyhow::Error::new(err).context(format!("spawn {:?}", cmd.get_program()))
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).context("write child stdin")?;
    }
    let stdout = spawn_reader(child.stdout.take(), output_limit_bytes)?;
    let stderr = spawn_reader(child.stderr.take(), output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!("child outlived its timeout, killing it");
            child.kill().context("kill child")?;
            (child.wait().context("reap killed child")?, true)
        }
    };

    let (stdout, stdout_truncated) = collect(stdout).context("collect stdout")?;
    let (stderr, stderr_truncated) = collect(stderr).context("collect stderr")?;
    if stdout_truncated + stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "child output over limit");
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type Captured = (Vec<u8>, usize);

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    limit: usize,
) -> Result<thread::JoinHandle<Result<Captured>>> {
    let pipe = pipe.ok_or_else(|| anyhow!("child pipe was not captured"))?;
    Ok(thread::spawn(move || read_limited(pipe, limit)))
}

fn collect(handle: thread::JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Keep the first `limit` bytes, drain and count the rest.
fn read_limited<R: Read>(reader: R, limit: usize) -> Result<Captured> {
    let mut kept = Vec::new();
    let mut head = reader.take(limit as u64);
    head.read_to_end(&mut kept).context("read output")?;
    let dropped = io::copy(&mut head.into_inner(), &mut io::sink()).context("drain output")?;
    Ok((kept, usize::try_from(dropped).unwrap_or(usize::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.exit_code(), 0);
        assert_eq!(out.merged_text(), "out\nerr\n");
    }

    /// Verifies a hung child is killed and reported with the timeout exit code.
    #[test]
    fn timeout_kills_child() {
        let out = run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(200), 1000)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), TIMEOUT_EXIT_CODE);
        assert!(!out.success());
    }

    #[test]
    fn stdin_is_forwarded_and_output_limited() {
        let out = run_command_with_timeout(
            Command::new("cat"),
            Some(b"abcdefghij"),
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_text().contains("[stdout truncated 6 bytes]"));
    }
}
