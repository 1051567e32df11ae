//! Child process handle and spawning.
//!
//! The worker never touches `tokio::process` directly: it only needs a
//! writable sink, two readable sources and a future that resolves when the
//! child is gone. [`ProcessHandle`] bundles those, so tests can drive a
//! worker over in-memory pipes and callers can plug in their own launchers
//! through [`WorkerSpawner`].

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the child exited normally and the code is known.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn from_code(code: Option<i32>) -> Self {
        Self { code }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "no exit code"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

/// A running child as the worker sees it.
pub struct ProcessHandle {
    pub(crate) stdin: BoxedWriter,
    pub(crate) stdout: BoxedReader,
    pub(crate) stderr: BoxedReader,
    pub(crate) exit: BoxFuture<'static, ProcessExit>,
    pub(crate) kill: CancellationToken,
    pub(crate) pid: Option<u32>,
}

impl ProcessHandle {
    /// Assemble a handle from arbitrary streams.
    ///
    /// `exit` must resolve once the "process" is gone. Use
    /// [`ProcessHandle::kill_token`] inside it to honour kill requests.
    pub fn from_parts<W, O, E, F>(stdin: W, stdout: O, stderr: E, exit: F) -> Self
    where
        W: AsyncWrite + Send + 'static,
        O: AsyncRead + Send + 'static,
        E: AsyncRead + Send + 'static,
        F: Future<Output = ProcessExit> + Send + 'static,
    {
        Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit.boxed(),
            kill: CancellationToken::new(),
            pid: None,
        }
    }

    /// Take ownership of a child spawned with all three stdio streams piped.
    pub fn from_child(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;
        let pid = child.id();

        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        let exit = async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.cancelled() => {
                    tracing::debug!(?pid, "Killing child process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(?pid, error = %e, "Failed to kill child process");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => ProcessExit::from_status(status),
                Err(e) => {
                    tracing::error!(?pid, error = %e, "Failed to wait for child process");
                    ProcessExit::from_code(None)
                }
            }
        };

        Ok(Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit.boxed(),
            kill,
            pid,
        })
    }

    /// Token cancelled when the worker is asked to kill the child.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Extension point for different launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<ProcessHandle, SpawnError>;
}

/// Launches a program with piped stdio.
///
/// The child is killed if its handle is dropped while still running.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Run a JavaScript file with `node`.
    pub fn node(script: impl Into<OsString>) -> Self {
        Self::new("node").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<ProcessHandle, SpawnError> {
        let child = self.command().spawn()?;
        tracing::debug!(
            program = ?self.program,
            args = ?self.args,
            pid = ?child.id(),
            "Spawned child process"
        );
        ProcessHandle::from_child(child)
    }
}
