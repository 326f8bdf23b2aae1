//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use super::observer::{LineObserver, NoopObserver, StreamKind};

/// How often a waiting child is checked for interrupt requests.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long output readers may keep draining once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Bytes kept from one stream, plus the count discarded over the limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The caller's interrupt check fired and the child was killed.
    pub interrupted: bool,
    pub elapsed: Duration,
    pub pid: u32,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Options for a streamed child-process run.
pub struct StreamOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Receives each stdout/stderr line while the child runs.
    pub observer: Arc<dyn LineObserver>,
    /// Polled while waiting; returning true kills the child.
    pub interrupt: Option<&'a (dyn Fn() -> bool + Sync)>,
}

/// True if `err` came from the executable not existing.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == ErrorKind::NotFound)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_streaming(
        cmd,
        &StreamOptions {
            stdin,
            timeout,
            output_limit_bytes,
            observer: Arc::new(NoopObserver),
            interrupt: None,
        },
    )
}

/// Run a command, forwarding each output line to `options.observer` as it arrives.
///
/// Stdout and stderr are drained on two independent threads that are joined before
/// returning, and stdin is fed from a third so a child that never reads it cannot
/// stall the timeout. On timeout or interrupt the child's whole process group is
/// killed and reaped; no process is left running.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), output_limit_bytes = options.output_limit_bytes))]
pub fn run_command_streaming(mut cmd: Command, options: &StreamOptions<'_>) -> Result<CommandOutput> {
    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = options.output_limit_bytes;
    let stdout_sink = Arc::new(Mutex::new(Captured::default()));
    let stderr_sink = Arc::new(Mutex::new(Captured::default()));
    let stdout_handle = {
        let observer = options.observer.clone();
        let sink = stdout_sink.clone();
        thread::spawn(move || {
            read_lines_limited(stdout, limit, StreamKind::Stdout, observer.as_ref(), &sink)
        })
    };
    let stderr_handle = {
        let observer = options.observer.clone();
        let sink = stderr_sink.clone();
        thread::spawn(move || {
            read_lines_limited(stderr, limit, StreamKind::Stderr, observer.as_ref(), &sink)
        })
    };

    let stdin_handle = match options.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || match child_stdin.write_all(&input) {
                // The child may exit (or close stdin) before reading everything.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }))
        }
        None => None,
    };

    let deadline = start + options.timeout;
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            break terminate(&mut child)?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break status;
        }
        if options.interrupt.is_some_and(|check| check()) {
            warn!("interrupt requested, killing command");
            interrupted = true;
            break terminate(&mut child)?;
        }
    };
    let elapsed = start.elapsed();

    // A descendant that outlives the child keeps the pipes open. Readers get
    // until the original deadline (at least DRAIN_GRACE) before the group is
    // killed, then one more grace period before they are abandoned.
    let drain_deadline = if timed_out || interrupted {
        Instant::now() + DRAIN_GRACE
    } else {
        deadline.max(Instant::now() + DRAIN_GRACE)
    };
    let mut readers = [
        ("stdout", Some(stdout_handle)),
        ("stderr", Some(stderr_handle)),
    ];
    if !wait_for_readers(&readers, drain_deadline) {
        warn!(pid, "output still open after child exit, killing process group");
        #[cfg(unix)]
        kill_process_group(pid);
        if !wait_for_readers(&readers, Instant::now() + DRAIN_GRACE) {
            warn!(pid, "abandoning output readers held open by an escaped descendant");
        }
    }
    for (label, slot) in &mut readers {
        if slot.as_ref().is_some_and(|h| h.is_finished())
            && let Some(handle) = slot.take()
        {
            join_reader(handle).with_context(|| format!("join {label}"))?;
        }
    }
    let stdin_deadline = Instant::now() + DRAIN_GRACE;
    while stdin_handle
        .as_ref()
        .is_some_and(|h| !h.is_finished() && Instant::now() < stdin_deadline)
    {
        thread::sleep(Duration::from_millis(20));
    }
    match stdin_handle {
        Some(handle) if handle.is_finished() => match handle.join() {
            Ok(Err(e)) if !timed_out && !interrupted => warn!(err = %e, "failed to write stdin"),
            Ok(_) => {}
            Err(_) => warn!("stdin writer thread panicked"),
        },
        Some(_) => warn!(pid, "abandoning stdin writer blocked on an escaped descendant"),
        None => {}
    }
    let (stdout, stdout_truncated) = take_captured(&stdout_sink);
    let (stderr, stderr_truncated) = take_captured(&stderr_sink);

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
        elapsed,
        pid,
    })
}

/// Kill the child's process group (unix) and the child itself, then reap it.
fn terminate(child: &mut Child) -> Result<ExitStatus> {
    #[cfg(unix)]
    kill_process_group(child.id());
    if let Err(e) = child.kill() {
        // Already exited between the last poll and now.
        if e.kind() != ErrorKind::InvalidInput {
            return Err(e).context("kill command");
        }
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed process group"),
        // Every member already exited.
        Err(Errno::ESRCH) => debug!(pgid, "process group already gone"),
        Err(e) => warn!(pgid, err = %e, "failed to kill process group"),
    }
}

type ReaderHandle = thread::JoinHandle<Result<()>>;

/// Poll until every reader has finished or `deadline` passes. True if all finished.
fn wait_for_readers(readers: &[(&str, Option<ReaderHandle>)], deadline: Instant) -> bool {
    loop {
        let done = readers
            .iter()
            .all(|(_, h)| h.as_ref().is_none_or(|h| h.is_finished()));
        if done {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn join_reader(handle: ReaderHandle) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn take_captured(sink: &Mutex<Captured>) -> (Vec<u8>, usize) {
    let mut captured = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    (std::mem::take(&mut captured.bytes), captured.truncated)
}

/// Read a stream line by line with a size limit, forwarding each line to `observer`.
///
/// Kept bytes go to `sink` as they arrive, so a reader abandoned mid-stream still
/// leaves what it read.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream: StreamKind,
    observer: &dyn LineObserver,
    sink: &Mutex<Captured>,
) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&line);
        observer.on_line(stream, text.trim_end_matches(['\n', '\r']));

        let mut captured = sink
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&line[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Collect(Mutex<Vec<(StreamKind, String)>>);

    impl LineObserver for Collect {
        fn on_line(&self, stream: StreamKind, line: &str) {
            self.0.lock().expect("lock").push((stream, line.to_string()));
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    /// Zombies count as gone: an orphan's reaping is up to whoever adopted it.
    fn process_alive(pid: u32) -> bool {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            return stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z'));
        }
        let pid = nix::unistd::Pid::from_raw(i32::try_from(pid).expect("pid fits i32"));
        nix::sys::signal::kill(pid, None).is_ok()
    }

    #[test]
    fn captures_both_streams_and_feeds_stdin() {
        let out = run_command_with_timeout(
            sh("cat; echo err >&2"),
            Some(b"prompt text\n"),
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy(), "prompt text\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn large_output_on_both_streams_does_not_deadlock() {
        // Well beyond a 64 KiB pipe buffer on each stream.
        let script = "i=0; while [ $i -lt 5000 ]; do \
                      echo \"out line $i padding padding padding\"; \
                      echo \"err line $i padding padding padding\" >&2; \
                      i=$((i+1)); done";
        let out = run_command_with_timeout(sh(script), None, Duration::from_secs(60), 10_000_000)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy().lines().count(), 5000);
        assert_eq!(out.stderr_lossy().lines().count(), 5000);
    }

    #[test]
    fn output_beyond_limit_is_counted_as_truncated() {
        let out = run_command_with_timeout(sh("printf 'abcdefghij'"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_truncated_notice("agent").contains("truncated 6 bytes"));
    }

    #[test]
    fn observer_sees_lines_from_both_streams() {
        let collect = Arc::new(Collect::default());
        let out = run_command_streaming(
            sh("echo one; echo two >&2"),
            &StreamOptions {
                stdin: None,
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1000,
                observer: collect.clone(),
                interrupt: None,
            },
        )
        .expect("run");
        assert!(out.status.success());

        let lines = collect.0.lock().expect("lock").clone();
        assert!(lines.contains(&(StreamKind::Stdout, "one".to_string())));
        assert!(lines.contains(&(StreamKind::Stderr, "two".to_string())));
    }

    #[test]
    fn timeout_kills_child_and_leaves_no_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let out = run_command_with_timeout(cmd, None, Duration::from_secs(1), 1000).expect("run");

        assert!(out.timed_out);
        assert!(!out.status.success());
        assert!(out.elapsed >= Duration::from_secs(1));
        assert!(out.elapsed < Duration::from_secs(10));
        assert!(!process_alive(out.pid), "child {} still running", out.pid);
    }

    #[test]
    fn timeout_kills_background_grandchild_too() {
        let start = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 20 & echo $!; sleep 20"),
            None,
            Duration::from_secs(1),
            1000,
        )
        .expect("run");

        assert!(out.timed_out);
        assert!(
            start.elapsed() < Duration::from_secs(8),
            "returned after {:?}",
            start.elapsed()
        );
        let grandchild: u32 = out
            .stdout_lossy()
            .trim()
            .parse()
            .expect("grandchild pid on stdout");
        let settle = Instant::now() + Duration::from_secs(2);
        while process_alive(grandchild) && Instant::now() < settle {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!process_alive(grandchild), "grandchild {grandchild} still running");
    }

    #[test]
    fn interrupt_kills_child_before_timeout() {
        let flag = AtomicBool::new(false);
        let check = || {
            let fired = flag.load(Ordering::SeqCst);
            flag.store(true, Ordering::SeqCst);
            fired
        };
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let out = run_command_streaming(
            cmd,
            &StreamOptions {
                stdin: None,
                timeout: Duration::from_secs(30),
                output_limit_bytes: 1000,
                observer: Arc::new(NoopObserver),
                interrupt: Some(&check),
            },
        )
        .expect("run");

        assert!(out.interrupted);
        assert!(!out.timed_out);
        assert!(out.elapsed < Duration::from_secs(10));
        assert!(!process_alive(out.pid));
    }

    #[test]
    fn missing_executable_is_reported_as_not_found() {
        let cmd = Command::new("definitely-not-a-real-binary-autoloop");
        let err = run_command_with_timeout(cmd, None, Duration::from_secs(1), 10).unwrap_err();
        assert!(is_not_found(&err));
    }
}
