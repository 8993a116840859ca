// Child-process supervision shared by the postgres and worker managers.
//
// One lifecycle implementation (spawn, readiness wait, graceful terminate)
// reused by both; the managers own state/status bookkeeping.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

/// How a managed child process should be launched.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Pipe stderr back to the manager (worker build-error capture).
    pub capture_stderr: bool,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            capture_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn capture_stderr(mut self) -> Self {
        self.capture_stderr = true;
        self
    }
}

/// A live supervised child process.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
}

impl ProcessHandle {
    pub fn spawn(spec: SpawnSpec) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if spec.capture_stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.program))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("`{}` exited before a pid was recorded", spec.program))?;
        debug!(program = %spec.program, pid, "spawned child process");

        Ok(Self { child, pid, program: spec.program })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Whether the child is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code if the child has already exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Graceful stop: SIGTERM, bounded wait, then SIGKILL.
    pub async fn terminate(mut self, grace: Duration) {
        #[cfg(unix)]
        {
            let _ = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(self.pid.to_string())
                .status();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => debug!(program = %self.program, pid = self.pid, "child exited"),
            Err(_) => {
                warn!(
                    program = %self.program,
                    pid = self.pid,
                    "child did not exit within grace period, killing"
                );
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

/// Wait until something accepts TCP connections on `127.0.0.1:port`.
pub async fn wait_for_tcp(port: u16, retries: usize, delay: Duration) -> Result<()> {
    for _ in 0..retries {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(delay).await;
    }
    Err(anyhow!("nothing is accepting connections on 127.0.0.1:{port} after {retries} attempts"))
}
