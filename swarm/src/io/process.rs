//! Helpers for running child processes with timeouts and bounded output.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

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
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Render stdout and stderr as a single log body.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Options for [`run_command`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Bytes to write to the child's stdin; stdin is null when `None`.
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bound on stdout/stderr kept in memory (the pipes are still drained).
    pub output_limit_bytes: usize,
    /// Append each stdout line to this file as it arrives.
    pub tee_path: Option<&'a Path>,
    /// Also copy each stdout line to our own stderr.
    pub echo: bool,
}

impl<'a> RunOptions<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            tee_path: None,
            echo: false,
        }
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn tee(mut self, path: &'a Path) -> Self {
        self.tee_path = Some(path);
        self
    }

    pub fn echo(mut self, enabled: bool) -> Self {
        self.echo = enabled;
        self
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. A child that outlives
/// `timeout` is killed and reported with `timed_out = true`.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), streaming = options.tee_path.is_some()))]
pub fn run_command(mut cmd: Command, options: RunOptions<'_>) -> Result<CommandOutput> {
    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let tee = match options.tee_path {
        Some(path) => Some(open_tee(path)?),
        None => None,
    };

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    if let Some(input) = options.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = options.output_limit_bytes;
    let echo = options.echo.then(std::io::stderr);
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, tee, echo));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match child
        .wait_timeout(options.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = options.timeout.as_secs(),
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

fn open_tee(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read line by line, keeping at most `limit` bytes and tee-ing every line.
fn read_lines_limited<R: Read, E: Write>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
    mut echo: Option<E>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut() {
            // Flush per line so `tail -f` sees progress.
            if let Err(e) = writer.write_all(&line).and_then(|()| writer.flush()) {
                warn!(err = %e, "failed to write to stream file");
            }
        }
        if let Some(out) = echo.as_mut() {
            // A closed stderr is ignored.
            let _ = out.write_all(&line).and_then(|()| out.flush());
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
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
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}
