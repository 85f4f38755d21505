//! Helpers for running child processes with timeouts, bounded output and
//! cooperative interruption.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Granularity at which streaming waits check for interrupts and deadlines.
const TICK: Duration = Duration::from_millis(200);

/// How long a stopped process group gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

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

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = spawn(&mut cmd)?;
    write_stdin(&mut child, stdin)?;

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

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// How a streamed command ended.
#[derive(Debug)]
pub struct StreamedExit {
    /// `None` if the child had to be killed.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub interrupted: bool,
}

/// Run a command, handing each stdout line to `on_line` as it arrives.
///
/// Stdout lines are read on a helper thread and delivered on the calling
/// thread, so `on_line` needs no synchronization. Each raw line is also
/// appended to `stream_path` when given. Stderr is inherited.
///
/// The child leads its own process group. `interrupted` is polled while
/// waiting; when it returns true, or `timeout` elapses, the whole group is
/// terminated and the partial result is returned without waiting for stdout
/// to close.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), streaming = stream_path.is_some()))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    stream_path: Option<&Path>,
    interrupted: &dyn Fn() -> bool,
    mut on_line: impl FnMut(&str),
) -> Result<StreamedExit> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
    own_process_group(&mut cmd);

    let mut stream_file = match stream_path {
        Some(path) => Some(create_stream_file(path)?),
        None => None,
    };

    debug!("spawning child process");
    let mut child = spawn(&mut cmd)?;
    write_stdin(&mut child, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let (tx, rx) = mpsc::channel::<String>();
    let reader = thread::spawn(move || {
        let mut lines = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match lines.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to read child stdout");
                    break;
                }
            }
        }
    });

    let deadline = Instant::now() + timeout;
    let mut stop: Option<Stop> = None;
    loop {
        match rx.recv_timeout(TICK) {
            Ok(line) => {
                if let Some(file) = stream_file.as_mut()
                    && let Err(err) = file.write_all(line.as_bytes()).and_then(|()| file.flush())
                {
                    warn!(%err, "failed to write to stream file");
                }
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Some(reason) = check_stop(interrupted, deadline) {
            stop = Some(reason);
            break;
        }
    }

    // Stdout is closed (or we are stopping); wait for the exit status.
    let status = loop {
        if let Some(reason) = stop {
            stop_group(&mut child, reason)?;
            break None;
        }
        if let Some(status) = child.wait_timeout(TICK).context("wait for command")? {
            break Some(status);
        }
        stop = check_stop(interrupted, deadline);
    };

    drop(rx);
    if stop.is_none() {
        if reader.join().is_err() {
            warn!("stdout reader thread panicked");
        }
    } else {
        // A survivor outside the group may still hold stdout open; the
        // detached reader exits on EOF or on its next send.
        drop(reader);
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), ?stop, "streamed command finished");
    Ok(StreamedExit {
        status,
        timed_out: stop == Some(Stop::TimedOut),
        interrupted: stop == Some(Stop::Interrupted),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Interrupted,
    TimedOut,
}

fn check_stop(interrupted: &dyn Fn() -> bool, deadline: Instant) -> Option<Stop> {
    if interrupted() {
        return Some(Stop::Interrupted);
    }
    if Instant::now() >= deadline {
        return Some(Stop::TimedOut);
    }
    None
}

/// SIGTERM the child's process group, give it [`STOP_GRACE`] to exit, then
/// SIGKILL whatever is left of the group and reap the child.
fn stop_group(child: &mut Child, reason: Stop) -> Result<()> {
    warn!(?reason, pid = child.id(), "stopping child process group");
    signal_group(child, false);
    if child
        .wait_timeout(STOP_GRACE)
        .context("wait command after SIGTERM")?
        .is_none()
    {
        debug!("child ignored SIGTERM");
    }
    // Members that outlived the leader.
    signal_group(child, true);
    if let Err(err) = child.kill() {
        // Already exited and reaped.
        debug!(%err, "kill failed");
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(child: &Child, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pid, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        debug!(%err, "group signal not delivered (already exited?)");
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _force: bool) {}

fn spawn(cmd: &mut Command) -> Result<Child> {
    match cmd.spawn() {
        Ok(c) => Ok(c),
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            Err(e).with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))
        }
    }
}

fn write_stdin(child: &mut Child, stdin: Option<&[u8]>) -> Result<()> {
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so the child sees EOF.
    }
    Ok(())
}

fn create_stream_file(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn timeout_command_captures_output() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1_000,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn timeout_command_is_killed() {
        let output =
            run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(200), 1_000)
                .expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn streaming_delivers_lines_and_tees_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs/stream.jsonl");
        let mut lines = Vec::new();
        let exit = run_command_streaming(
            sh("cat; echo second"),
            Some(b"first\n"),
            Duration::from_secs(5),
            Some(&stream),
            &|| false,
            |line| lines.push(line.to_string()),
        )
        .expect("run");
        assert_eq!(lines, vec!["first", "second"]);
        assert!(exit.status.is_some_and(|s| s.success()));
        assert_eq!(
            std::fs::read_to_string(&stream).expect("stream"),
            "first\nsecond\n"
        );
    }

    /// Shell that backgrounds a long sleep sharing its stdout, records the
    /// sleep's pid, and waits for it.
    fn sh_with_grandchild(pid_file: &Path) -> Command {
        sh(&format!(
            "sleep 30 & echo $! > {}; wait; echo late",
            pid_file.display()
        ))
    }

    fn read_pid(pid_file: &Path) -> i32 {
        std::fs::read_to_string(pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid number")
    }

    /// Exists and is not a zombie awaiting reaping.
    #[allow(unsafe_code)]
    fn running(pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
        !stat.contains(") Z ")
    }

    fn assert_gone(pid: i32) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!running(pid), "grandchild {pid} survived");
    }

    #[test]
    fn streaming_stops_on_interrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("grandchild.pid");
        let start = Instant::now();
        let exit = run_command_streaming(
            sh_with_grandchild(&pid_file),
            None,
            Duration::from_secs(30),
            None,
            &|| std::fs::read_to_string(&pid_file).is_ok_and(|pid| pid.ends_with('\n')),
            |_| {},
        )
        .expect("run");
        assert!(exit.interrupted);
        assert!(!exit.timed_out);
        assert!(exit.status.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_gone(read_pid(&pid_file));
    }

    #[test]
    fn streaming_timeout_kills_grandchildren_holding_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("grandchild.pid");
        let mut lines = Vec::new();
        let start = Instant::now();
        let exit = run_command_streaming(
            sh_with_grandchild(&pid_file),
            None,
            Duration::from_millis(500),
            None,
            &|| false,
            |line| lines.push(line.to_string()),
        )
        .expect("run");
        assert!(exit.timed_out);
        assert!(!exit.interrupted);
        assert!(exit.status.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(lines.is_empty());
        assert_gone(read_pid(&pid_file));
    }
}
