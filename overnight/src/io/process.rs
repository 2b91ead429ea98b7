//! Helpers for running child processes with timeouts and bounded output.
//!
//! Children are spawned into their own process group so that a timeout or
//! user interrupt kills the entire tree the agent may have forked, not just
//! the direct child. Output is drained concurrently to avoid pipe deadlocks.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often the wait loop wakes to check the deadline and interrupt flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The interrupt flag was observed while the child was running.
    pub interrupted: bool,
}

impl CommandOutput {
    /// Exit code if the child exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Signal number if the child was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

/// Run a command in its own process group with a hard wall-clock timeout.
///
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory
/// (bytes beyond this are discarded while still draining the pipe). When
/// `interrupt` is set while the child runs, the process group is killed and
/// the output is returned with `interrupted: true`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    interrupt: Option<&AtomicBool>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group: a later kill must reach the agent's descendants.
    cmd.process_group(0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Written from its own thread with the readers already draining, so a
    // prompt larger than the pipe buffer cannot deadlock against a child
    // that writes before it reads.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = POLL_INTERVAL.min(remaining.max(Duration::from_millis(1)));
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if interrupt.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            warn!("interrupt received, killing process group");
            interrupted = true;
            kill_process_group(&mut child);
            break child.wait().context("wait command after interrupt")?;
        }
        if Instant::now() >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
            kill_process_group(&mut child);
            break child.wait().context("wait command after kill")?;
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            // A child that exits without draining stdin breaks the pipe;
            // its output and exit status still tell the real story.
            Ok(Err(e)) => debug!(err = %e, "stdin write did not complete"),
            Ok(Ok(())) => {}
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        interrupted,
    })
}

/// Kill the child's entire process group, then the child itself as a
/// fallback in case the group signal was lost to a race with exit.
#[allow(unsafe_code)]
fn kill_process_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_within_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2");
        let out = run_command_with_timeout(cmd, None, Duration::from_secs(5), 1000, None)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy().trim(), "hello");
        assert_eq!(out.stderr_lossy().trim(), "oops");
        assert!(!out.timed_out);
        assert!(!out.interrupted);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'abcdefghij'");
        let out =
            run_command_with_timeout(cmd, None, Duration::from_secs(5), 4, None).expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.truncated_notice("agent").contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_whole_group_on_timeout() {
        // The child forks a grandchild; the group kill must take both down
        // quickly rather than waiting on the grandchild's sleep.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("(sleep 30) & sleep 30");
        let start = Instant::now();
        let out = run_command_with_timeout(cmd, None, Duration::from_millis(400), 1000, None)
            .expect("run");
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(out.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn interrupt_flag_terminates_child() {
        let flag = AtomicBool::new(true);
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let out = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(30),
            1000,
            Some(&flag),
        )
        .expect("run");
        assert!(out.interrupted);
        assert!(!out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn large_stdin_against_an_early_writer_does_not_deadlock() {
        // The child fills its stdout pipe before reading any stdin; both
        // payloads exceed the kernel pipe buffer.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 200000 /dev/zero; cat > /dev/null; echo done");
        let input = vec![b'x'; 256 * 1024];
        let out = run_command_with_timeout(
            cmd,
            Some(&input),
            Duration::from_secs(10),
            1_000_000,
            None,
        )
        .expect("run");
        assert!(out.status.success());
        assert!(!out.timed_out);
        assert!(out.stdout_lossy().ends_with("done\n"));
    }

    #[test]
    fn passes_stdin_to_child() {
        let cmd = Command::new("cat");
        let out = run_command_with_timeout(
            cmd,
            Some(b"piped input"),
            Duration::from_secs(5),
            1000,
            None,
        )
        .expect("run");
        assert_eq!(out.stdout_lossy(), "piped input");
    }
}
