//! External command runner.
//!
//! Launches one external process with merged stdout/stderr, streams its
//! output line by line as it is produced, and enforces wall-clock and
//! silence budgets. Output never materializes in full before the process
//! exits; callers see every line in arrival order, which is how live
//! progress reaches subscribers during multi-minute packaging steps.
//!
//! The runner never retries. Retry policy belongs to the calling stage.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

/// Lines of trailing output kept for exit classification and diagnostics.
const TAIL_LINES: usize = 30;

/// Poll interval for the timeout/cancellation watch loop.
const WATCH_TICK: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared between an orchestrator and the
/// runner's watch loop. The external tools have no cancellation protocol of
/// their own, so firing the token kills the running child outright.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token before a stage re-entry.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One external invocation: what to run, where, with which environment
/// additions and time budget.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Bare tool name (resolved via PATH and the fallback directory) or an
    /// explicit path (used as-is).
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Hard wall-clock budget for the whole invocation.
    pub timeout: Duration,
    /// Kill the child if it stays silent for this long. `None` disables
    /// silence detection.
    pub idle_timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(executable: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout,
            idle_timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    fallback_bin_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(fallback_bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            fallback_bin_dir: fallback_bin_dir.into(),
        }
    }

    /// Resolve an executable name to an absolute path: explicit paths are
    /// used verbatim, everything else is searched on PATH and then in the
    /// fallback installation directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, PipelineError> {
        if name.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(name);
            if path.is_file() {
                return Ok(path);
            }
            return Err(PipelineError::CommandNotFound {
                name: name.to_string(),
                fallback: self.fallback_bin_dir.clone(),
            });
        }

        if let Ok(found) = which::which(name) {
            return Ok(found);
        }

        let fallback = self.fallback_bin_dir.join(name);
        if fallback.is_file() {
            return Ok(fallback);
        }

        Err(PipelineError::CommandNotFound {
            name: name.to_string(),
            fallback: self.fallback_bin_dir.clone(),
        })
    }

    /// Spawn the command and return the lazy output stream. The stream is
    /// finite and non-restartable; drop it to abandon the child.
    pub fn spawn(
        &self,
        spec: &CommandSpec,
        cancel: &CancelToken,
    ) -> Result<CommandStream, PipelineError> {
        let resolved = self.resolve(&spec.executable)?;

        let mut command = Command::new(&resolved);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| PipelineError::Launch {
            executable: spec.executable.clone(),
            source,
        })?;

        // Both pipes feed one channel; lines arrive merged in the order the
        // child produces them.
        let (tx, rx) = mpsc::channel();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        spawn_line_reader(stdout, tx.clone());
        spawn_line_reader(stderr, tx);

        tracing::debug!(
            executable = %resolved.display(),
            args = ?spec.args,
            cwd = %spec.cwd.display(),
            "spawned external command"
        );

        Ok(CommandStream {
            child,
            rx,
            executable: spec.executable.clone(),
            args: spec.args.clone(),
            timeout: spec.timeout,
            idle_timeout: spec.idle_timeout,
            started: Instant::now(),
            last_output: Instant::now(),
            tail: VecDeque::with_capacity(TAIL_LINES),
            cancel: cancel.clone(),
            finished: false,
        })
    }

    /// Spawn, pump every output line to `sink` in arrival order, and wait
    /// for the terminal result.
    pub fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), PipelineError> {
        self.spawn(spec, cancel)?.drive(sink)
    }
}

fn spawn_line_reader(pipe: impl Read + Send + 'static, tx: Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Lazy, finite, non-restartable sequence of merged output lines ending in
/// a terminal result.
pub struct CommandStream {
    child: Child,
    rx: Receiver<String>,
    executable: String,
    args: Vec<String>,
    timeout: Duration,
    idle_timeout: Option<Duration>,
    started: Instant,
    last_output: Instant,
    tail: VecDeque<String>,
    cancel: CancelToken,
    finished: bool,
}

impl CommandStream {
    /// Next output line, or `Ok(None)` once the process has exited
    /// successfully. Timeout, silence, cancellation and failure exits all
    /// surface as typed errors; in every error path the child has already
    /// been killed and reaped.
    pub fn next_line(&mut self) -> Result<Option<String>, PipelineError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if self.cancel.is_cancelled() {
                self.kill_and_reap();
                return Err(PipelineError::Cancelled);
            }

            let elapsed = self.started.elapsed();
            if elapsed > self.timeout {
                self.kill_and_reap();
                return Err(PipelineError::TimedOut {
                    executable: self.executable.clone(),
                    elapsed,
                    limit: self.timeout,
                });
            }

            if let Some(idle) = self.idle_timeout {
                if self.last_output.elapsed() > idle {
                    self.kill_and_reap();
                    return Err(PipelineError::TimedOut {
                        executable: self.executable.clone(),
                        elapsed,
                        limit: idle,
                    });
                }
            }

            match self.rx.recv_timeout(WATCH_TICK) {
                Ok(line) => {
                    self.last_output = Instant::now();
                    if self.tail.len() == TAIL_LINES {
                        self.tail.pop_front();
                    }
                    self.tail.push_back(line.clone());
                    return Ok(Some(line));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                // Both pipes hit EOF: the child is done, classify its exit.
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return self.classify_exit().map(|()| None);
                }
            }
        }
    }

    /// Pump every remaining line to `sink` and return the terminal result.
    pub fn drive(mut self, sink: &mut dyn FnMut(&str)) -> Result<(), PipelineError> {
        while let Some(line) = self.next_line()? {
            sink(&line);
        }
        Ok(())
    }

    fn kill_and_reap(&mut self) {
        self.finished = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
        // Drain whatever the reader threads flushed before the kill so they
        // can observe the closed channel and exit.
        while self.rx.try_recv().is_ok() {}
    }

    fn classify_exit(&mut self) -> Result<(), PipelineError> {
        let status = self
            .child
            .wait()
            .map_err(|source| PipelineError::Launch {
                executable: self.executable.clone(),
                source,
            })?;

        if status.success() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Err(PipelineError::KilledBySystem {
                    executable: self.executable.clone(),
                    signal: Some(signal),
                });
            }
        }

        let exit_code = status.code().unwrap_or(-1);

        // Where the OS reports no structured signal, fall back to scanning
        // the trailing output for the usual OOM-kill fingerprints.
        #[cfg(not(unix))]
        if self
            .tail
            .iter()
            .any(|line| {
                let lower = line.to_ascii_lowercase();
                lower.contains("killed") || lower.contains("signal") || lower.contains("memory")
            })
        {
            return Err(PipelineError::KilledBySystem {
                executable: self.executable.clone(),
                signal: None,
            });
        }

        tracing::debug!(
            executable = %self.executable,
            exit_code,
            tail = ?self.tail,
            "external command failed"
        );

        Err(PipelineError::CommandFailed {
            executable: self.executable.clone(),
            args: self.args.clone(),
            exit_code,
        })
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if !self.finished {
            self.kill_and_reap();
        }
    }
}
