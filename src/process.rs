use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{CsError, CsResult};
use crate::runner::CancelToken;

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> CsResult<Output> {
    run_command_inner(program, args, cwd, timeout, None)
}

/// Run a subprocess with cancellation-aware polling.
///
/// The token is checked on every poll iteration; if it trips, the child is
/// killed immediately and `Err(Cancelled)` propagates. The hard timeout is
/// still honored as a safety net.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    token: &CancelToken,
    hard_timeout: Option<Duration>,
) -> CsResult<Output> {
    run_command_inner(program, args, cwd, hard_timeout, Some(token))
}

fn run_command_inner(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
    token: Option<&CancelToken>,
) -> CsResult<Output> {
    if !command_exists(program) {
        return Err(CsError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    if timeout.is_none() && token.is_none() {
        let output = command.output()?;
        return validate_command_output(&rendered, output);
    }

    let mut child = command.spawn()?;
    let started_at = Instant::now();

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let (stdout_tx, stdout_rx) = std::sync::mpsc::channel();
    let (stderr_tx, stderr_rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        let _ = stdout_tx.send(buf);
    });

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            return validate_command_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if let Some(tok) = token
            && let Err(err) = tok.checkpoint()
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        if let Some(limit) = timeout
            && started_at.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr_str = String::from_utf8_lossy(&stderr).into_owned();
            return Err(CsError::from_command_timeout(
                rendered,
                saturating_duration_ms(limit),
                stderr_str,
            ));
        }

        thread::sleep(Duration::from_millis(20));
    }
}

fn validate_command_output(rendered: &str, output: Output) -> CsResult<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(CsError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}

fn saturating_duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
