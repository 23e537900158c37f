//! Line-oriented client for engine monitor consoles.
//!
//! Both the QEMU human monitor and the Renode monitor are interactive shells
//! on a TCP port: they print a banner, echo input and end every answer with a
//! prompt. A [`MonitorSession`] runs commands one at a time and returns the
//! text printed between the echoed command and the next prompt.

use crate::error::{Result, SimError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

const CONNECT_RETRY_MS: u64 = 100;
const IAC: u8 = 0xff;

/// Remove telnet negotiation and terminal control sequences.
fn clean(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            IAC if raw.get(i + 1) == Some(&IAC) => {
                out.push(IAC);
                i += 2;
            }
            // IAC WILL/WONT/DO/DONT <option>
            IAC if matches!(raw.get(i + 1), Some(0xfb..=0xfe)) => i += 3,
            // IAC SB ... IAC SE
            IAC if raw.get(i + 1) == Some(&0xfa) => {
                i += 2;
                while i < raw.len() && !(raw[i] == IAC && raw.get(i + 1) == Some(&0xf0)) {
                    i += 1;
                }
                i += 2;
            }
            IAC => i += 2,
            0x1b if raw.get(i + 1) == Some(&b'[') => {
                i += 2;
                while i < raw.len() && !(0x40..=0x7e).contains(&raw[i]) {
                    i += 1;
                }
                i += 1;
            }
            b'\r' | 0 => i += 1,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// An open monitor connection.
#[derive(Debug)]
pub(crate) struct MonitorSession {
    stream: TcpStream,
    port: u16,
    /// Text every prompt ends with, e.g. `"(qemu) "`.
    prompt: &'static str,
    command_timeout: Duration,
}

impl MonitorSession {
    /// Connect, retrying until `deadline`, and swallow the banner.
    pub async fn open(
        port: u16,
        prompt: &'static str,
        deadline: Instant,
        command_timeout: Duration,
    ) -> Result<Self> {
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => {
                    return Err(SimError::Transport(format!(
                        "monitor on port {port}: {e}"
                    )));
                }
                Err(_) => sleep(Duration::from_millis(CONNECT_RETRY_MS)).await,
            }
        };
        let mut session = Self {
            stream,
            port,
            prompt,
            command_timeout,
        };
        session.read_to_prompt().await?;
        Ok(session)
    }

    async fn read_to_prompt(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.command_timeout;
        let mut raw = Vec::new();
        let mut chunk = [0u8; 2048];
        loop {
            let n = match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => {
                    return Err(SimError::Transport(format!(
                        "monitor on port {}: no prompt within {:?}",
                        self.port, self.command_timeout
                    )))
                }
                Ok(Ok(0)) => {
                    return Err(SimError::Transport(format!(
                        "monitor on port {} closed the connection",
                        self.port
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(SimError::Transport(format!(
                        "monitor on port {}: {e}",
                        self.port
                    )))
                }
            };
            raw.extend_from_slice(&chunk[..n]);
            let text = clean(&raw);
            if let Some(body) = text.strip_suffix(self.prompt) {
                // Drop the prompt's own label, e.g. "(machine-0"
                let body = match body.rfind('\n') {
                    Some(end) => &body[..end],
                    None => "",
                };
                return Ok(body.to_string());
            }
        }
    }

    /// Run one command and return its output without the echo.
    pub async fn run(&mut self, command: &str) -> Result<String> {
        trace!(port = self.port, command = command, "monitor <-");
        let write = async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.write_all(b"\n").await?;
            self.stream.flush().await
        };
        write.await.map_err(|e| {
            SimError::Transport(format!("monitor on port {}: {e}", self.port))
        })?;

        let text = self.read_to_prompt().await?;
        let mut lines = text.lines().peekable();
        if lines
            .peek()
            .is_some_and(|first| first.trim_end().ends_with(command.trim()))
        {
            lines.next();
        }
        let output = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        debug!(port = self.port, command = command, output = %output, "Monitor command");
        Ok(output)
    }
}

/// Run `commands` in order on a fresh connection.
///
/// The answer to each command is checked with `failed`; the first failure
/// aborts the script with [`SimError::Internal`].
pub(crate) async fn run_script(
    port: u16,
    prompt: &'static str,
    commands: &[String],
    command_timeout: Duration,
    failed: fn(&str) -> bool,
) -> Result<Vec<String>> {
    let deadline = Instant::now() + command_timeout;
    let mut session = MonitorSession::open(port, prompt, deadline, command_timeout).await?;
    let mut outputs = Vec::with_capacity(commands.len());
    for command in commands {
        let output = session.run(command).await?;
        if failed(&output) {
            return Err(SimError::Internal(format!(
                "monitor command `{command}` failed: {output}"
            )));
        }
        outputs.push(output);
    }
    Ok(outputs)
}
