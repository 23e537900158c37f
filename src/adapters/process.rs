//! Engine subprocess supervision.
//!
//! A powered-on instance owns exactly one [`EngineProcess`]. The child is
//! held by a supervisor task that pumps its output into the instance console,
//! enforces the wall-clock budget and publishes how the process ended. The
//! adapter only ever observes the process through the exit watch.

use super::console::ConsoleHub;
use super::engine::LaunchPlan;
use super::OpContext;
use crate::error::{Result, SimError};
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay between attempts to attach to an engine's console socket.
const CONSOLE_RETRY_MS: u64 = 200;
/// Attempts before giving up on the console socket.
const CONSOLE_RETRIES: u32 = 50;

/// How an engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// Exited on its own.
    Exited(String),
    /// Killed after exceeding its wall-clock budget.
    TimedOut,
    /// Killed on request.
    Killed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(status) => write!(f, "exited ({status})"),
            ExitReason::TimedOut => f.write_str("killed after timeout"),
            ExitReason::Killed => f.write_str("killed"),
        }
    }
}

/// A supervised engine child process.
#[derive(Debug)]
pub(crate) struct EngineProcess {
    pid: Option<u32>,
    stop: CancellationToken,
    exit: watch::Receiver<Option<ExitReason>>,
    supervisor: JoinHandle<()>,
    reaped: bool,
}

impl EngineProcess {
    /// Spawn `plan`, optionally wrapped by `launcher_prefix`.
    ///
    /// When a prefix is given its first element is executed with the rest of
    /// the prefix, the engine program and the engine arguments as arguments.
    pub fn spawn(
        plan: &LaunchPlan,
        launcher_prefix: &[String],
        work_dir: &Path,
        console: ConsoleHub,
        budget: Option<Duration>,
        label: &str,
    ) -> Result<Self> {
        let (program, args): (&str, Vec<&str>) = match launcher_prefix.split_first() {
            Some((first, rest)) => (
                first.as_str(),
                rest.iter()
                    .map(String::as_str)
                    .chain(std::iter::once(plan.program.as_str()))
                    .chain(plan.args.iter().map(String::as_str))
                    .collect(),
            ),
            None => (
                plan.program.as_str(),
                plan.args.iter().map(String::as_str).collect(),
            ),
        };

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SimError::Internal(format!("failed to spawn {}: {e}", plan.program)))?;

        let pid = child.id();
        info!(instance_id = %label, pid = ?pid, program = %plan.program, "Engine spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, console.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, console.clone()));
        }

        let stop = CancellationToken::new();
        if let Some(port) = plan.console_port {
            tokio::spawn(attach_console(port, console.clone(), stop.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let token = stop.clone();
        let label = label.to_string();
        let supervisor = tokio::spawn(async move {
            let deadline = async {
                match budget {
                    Some(limit) => sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);

            let reason = tokio::select! {
                status = child.wait() => {
                    let status = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!(instance_id = %label, status = %status, "Engine exited");
                    ExitReason::Exited(status)
                }
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    debug!(instance_id = %label, "Engine killed");
                    ExitReason::Killed
                }
                _ = &mut deadline => {
                    warn!(instance_id = %label, "Engine exceeded its time budget, killing");
                    let _ = child.kill().await;
                    ExitReason::TimedOut
                }
            };
            token.cancel();
            console.note(&format!("engine {reason}"));
            let _ = exit_tx.send(Some(reason));
        });

        Ok(Self {
            pid,
            stop,
            exit: exit_rx,
            supervisor,
            reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How the process ended, or `None` while it is alive.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.borrow().clone()
    }

    /// Watch the process for `grace`; fail if it dies or the caller cancels.
    pub async fn wait_for_early_exit(&self, grace: Duration, ctx: &OpContext) -> Result<()> {
        let mut exit = self.exit.clone();
        tokio::select! {
            _ = sleep(grace) => Ok(()),
            _ = ctx.token().cancelled() => {
                Err(SimError::Cancelled("power on".to_string()))
            }
            reason = async { exit.wait_for(Option::is_some).await.ok().and_then(|r| r.clone()) } => {
                let reason = reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "vanished".to_string());
                Err(SimError::Internal(format!("engine {reason} during startup")))
            }
        }
    }

    /// Kill the process and wait up to `grace` for the supervisor to reap it.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitReason> {
        self.stop.cancel();
        if !self.reaped {
            if timeout(grace, &mut self.supervisor).await.is_err() {
                warn!(pid = ?self.pid, "Engine supervisor did not finish, aborting");
                self.supervisor.abort();
            }
            self.reaped = true;
        }
        self.exit_reason()
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, console: ConsoleHub) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => console.publish(Bytes::copy_from_slice(&buf[..n])),
        }
    }
}

async fn attach_console(port: u16, console: ConsoleHub, stop: CancellationToken) {
    for _ in 0..CONSOLE_RETRIES {
        let connect = TcpStream::connect(("127.0.0.1", port));
        let stream = tokio::select! {
            _ = stop.cancelled() => return,
            res = connect => res,
        };
        match stream {
            Ok(stream) => {
                debug!(port = port, "Attached to engine console");
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = pump(stream, console) => {}
                }
                return;
            }
            Err(_) => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sleep(Duration::from_millis(CONSOLE_RETRY_MS)) => {}
                }
            }
        }
    }
    debug!(port = port, "Engine console socket never came up");
}
