//! Subprocess execution for docbuild's external collaborators.
//!
//! Every external tool docbuild invokes (stitcher, git, the DAPS runner,
//! dc-hash, the archive tool, the navigation builder, rsync) goes through
//! [`run_command`] or [`run_command_with_timeout`] so that the caller
//! always gets a structured [`CommandOutput`] back instead of interleaving
//! subprocess execution with notification and retry decisions.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Structured result of running an external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed or the code was
    /// otherwise unavailable.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Whether execution was killed after exceeding its timeout.
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run a command in `working_dir` with no timeout (the scheduler never
/// imposes per-operation timeouts per SPEC_FULL.md §5).
pub fn run_command(program: &str, args: &[&str], working_dir: &Path) -> Result<CommandOutput> {
    run_command_with_timeout(program, args, working_dir, None)
}

/// Run a command, optionally bounding it with a timeout. A timed-out
/// process is killed and its output (whatever was captured before the
/// deadline) is returned with `timed_out: true`.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let Some(timeout_dur) = timeout else {
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for command: {program}"))?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {program}"))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        program,
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
