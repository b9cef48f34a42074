//! Timeout-bounded subprocess execution.
//!
//! [`Launcher`] is the seam between the engine and the operating system.
//! [`ProcessLauncher`] spawns real processes on a single-threaded tokio
//! runtime; tests substitute their own implementation.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Fully resolved command line, environment and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Complete environment; the child inherits nothing else.
    pub env: BTreeMap<OsString, OsString>,
    pub cwd: PathBuf,
}

impl Invocation {
    /// Invocation with the current process environment.
    #[must_use]
    pub fn inheriting(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            env: std::env::vars_os().collect(),
            cwd: cwd.into(),
        }
    }

    /// Command line for log messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr.
    pub output: String,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub elapsed: Duration,
}

impl Execution {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// How a launch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Completed(Execution),
    /// The timeout expired and the process was killed.
    TimedOut {
        started: DateTime<Local>,
        elapsed: Duration,
    },
}

/// Something that can run an [`Invocation`].
pub trait Launcher {
    /// Run `invocation` to completion, or until `timeout` expires.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] if the process cannot be spawned or waited on.
    fn launch(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<Launch, LaunchError>;
}

impl<F> Launcher for F
where
    F: Fn(&Invocation, Option<Duration>) -> Result<Launch, LaunchError>,
{
    fn launch(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<Launch, LaunchError> {
        self(invocation, timeout)
    }
}

/// Launches real processes.
#[derive(Debug)]
pub struct ProcessLauncher {
    runtime: Runtime,
}

impl ProcessLauncher {
    /// Create a launcher with its own single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Runtime`] if the runtime cannot be built.
    pub fn new() -> Result<Self, LaunchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LaunchError::Runtime)?;
        Ok(Self { runtime })
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<Launch, LaunchError> {
        self.runtime.block_on(run(invocation, timeout))
    }
}

async fn run(invocation: &Invocation, timeout: Option<Duration>) -> Result<Launch, LaunchError> {
    debug!(
        command = %invocation.command_line(),
        cwd = %invocation.cwd.display(),
        "spawning"
    );

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .env_clear()
        .envs(&invocation.env)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    let started = Local::now();
    let clock = Instant::now();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let work = async {
        let output = collect_output(stdout, stderr).await?;
        let status = child.wait().await?;
        Ok::<_, io::Error>((status, output))
    };

    let finished = match timeout {
        Some(limit) => tokio::time::timeout(limit, work).await.ok(),
        None => Some(work.await),
    };

    match finished {
        Some(result) => {
            let (status, output) = result.map_err(LaunchError::Wait)?;
            trace!(code = ?status.code(), bytes = output.len(), "process exited");
            Ok(Launch::Completed(Execution {
                exit_code: status.code(),
                output,
                started,
                finished: Local::now(),
                elapsed: clock.elapsed(),
            }))
        }
        None => {
            // The future holding the child's pipes is gone; reap the process.
            let _ = child.kill().await;
            Ok(Launch::TimedOut {
                started,
                elapsed: clock.elapsed(),
            })
        }
    }
}

/// Read both pipes line by line into one buffer, in arrival order.
async fn collect_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> io::Result<String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let readers = [
        stdout.map(|pipe| forward_lines(pipe, tx.clone())),
        stderr.map(|pipe| forward_lines(pipe, tx.clone())),
    ];
    drop(tx);

    let mut combined = Vec::new();
    while let Some(line) = rx.recv().await {
        combined.extend_from_slice(&line);
    }
    for reader in readers.into_iter().flatten() {
        reader.await.map_err(io::Error::other)??;
    }

    Ok(String::from_utf8_lossy(&combined).into_owned())
}

fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        loop {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line).await? == 0 || tx.send(line).is_err() {
                return Ok(());
            }
        }
    })
}

/// Failure to run a process at all, as opposed to the process failing.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("cannot start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error waiting for process: {0}")]
    Wait(#[source] io::Error),

    #[error("cannot create process runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl From<LaunchError> for io::Error {
    fn from(err: LaunchError) -> Self {
        Self::other(err)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::inheriting(
            "/bin/sh",
            vec![OsString::from("-c"), OsString::from(script)],
            std::env::temp_dir(),
        )
    }

    fn completed(launch: Launch) -> Execution {
        match launch {
            Launch::Completed(execution) => execution,
            Launch::TimedOut { .. } => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn captures_exit_code_and_both_streams() {
        let launcher = ProcessLauncher::new().unwrap();
        let execution = completed(
            launcher
                .launch(&sh("echo out; echo err >&2; exit 3"), None)
                .unwrap(),
        );
        assert_eq!(execution.exit_code, Some(3));
        assert!(!execution.success());
        assert!(execution.output.contains("out\n"));
        assert!(execution.output.contains("err\n"));
    }

    #[test]
    fn environment_is_exactly_the_invocation_env() {
        let launcher = ProcessLauncher::new().unwrap();
        let mut invocation = sh("printf '%s' \"$RUNTESTS_MARKER\"");
        invocation
            .env
            .insert(OsString::from("RUNTESTS_MARKER"), OsString::from("42"));
        let execution = completed(launcher.launch(&invocation, None).unwrap());
        assert!(execution.success());
        assert_eq!(execution.output, "42");
    }

    #[test]
    fn timeout_kills_the_process() {
        let launcher = ProcessLauncher::new().unwrap();
        let launch = launcher
            .launch(&sh("sleep 10"), Some(Duration::from_millis(200)))
            .unwrap();
        match launch {
            Launch::TimedOut { elapsed, .. } => assert!(elapsed < Duration::from_secs(5)),
            Launch::Completed(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let launcher = ProcessLauncher::new().unwrap();
        let invocation = Invocation::inheriting(
            "/nonexistent/runtests-missing",
            Vec::new(),
            std::env::temp_dir(),
        );
        let err = launcher.launch(&invocation, None).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
