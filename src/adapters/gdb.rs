//! GDB remote serial protocol client.
//!
//! Covers the packet layer (`$payload#cs` framing, `+`/`-` acknowledgement,
//! `}` escaping, run-length decoding) and the requests the debug link issues.
//! Every engine exposes its CPU through such a stub on the instance's debug
//! port.
//!
//! Any I/O failure, timeout or protocol violation poisons the client: the
//! request/reply pairing can no longer be trusted, so later calls fail with
//! [`SimError::Transport`] until a new connection is made.

use super::console::ConsoleHub;
use crate::error::{Result, SimError};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// Out-of-band interrupt byte (Ctrl-C).
const INTERRUPT: u8 = 0x03;
const CONNECT_RETRY_MS: u64 = 100;
/// Retransmissions of a packet the stub rejected.
const MAX_RETRANSMITS: u32 = 3;
/// Payload budget when the stub does not advertise `PacketSize`.
const DEFAULT_PACKET_SIZE: usize = 1024;
/// Upper bound on bytes moved by one `m`/`M` packet.
const MAX_CHUNK: usize = 4096;

/// Encode `payload` as a framed packet.
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    let mut sum = 0u8;
    for &b in payload {
        if matches!(b, b'$' | b'#' | b'}' | b'*') {
            out.extend_from_slice(&[b'}', b ^ 0x20]);
            sum = sum.wrapping_add(b'}').wrapping_add(b ^ 0x20);
        } else {
            out.push(b);
            sum = sum.wrapping_add(b);
        }
    }
    out.push(b'#');
    out.extend_from_slice(format!("{sum:02x}").as_bytes());
    out
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Ack,
    Nak,
    /// Raw packet body, still escaped.
    Packet(Vec<u8>),
    /// Checksum mismatch.
    Corrupt,
}

/// Pull one frame off the front of `buf`, or `None` if more bytes are needed.
///
/// `%` notifications and stray bytes between frames are dropped.
fn take_frame(buf: &mut Vec<u8>) -> Option<Frame> {
    loop {
        let start = buf.iter().position(|b| matches!(b, b'+' | b'-' | b'$' | b'%'));
        let Some(start) = start else {
            buf.clear();
            return None;
        };
        buf.drain(..start);
        match buf[0] {
            b'+' => {
                buf.drain(..1);
                return Some(Frame::Ack);
            }
            b'-' => {
                buf.drain(..1);
                return Some(Frame::Nak);
            }
            _ => {}
        }

        let hash = buf.iter().position(|&b| b == b'#')?;
        if buf.len() < hash + 3 {
            return None;
        }
        let notification = buf[0] == b'%';
        let body = buf[1..hash].to_vec();
        let sent = std::str::from_utf8(&buf[hash + 1..hash + 3])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok());
        buf.drain(..hash + 3);
        if notification {
            continue;
        }
        let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        return Some(if sent == Some(sum) {
            Frame::Packet(body)
        } else {
            Frame::Corrupt
        });
    }
}

/// Undo `}` escaping and expand `*` run-length encoding.
fn decode_body(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'}' if i + 1 < raw.len() => {
                out.push(raw[i + 1] ^ 0x20);
                i += 2;
            }
            b'*' if i + 1 < raw.len() => {
                if let Some(&last) = out.last() {
                    let repeat = raw[i + 1].saturating_sub(29) as usize;
                    out.extend(std::iter::repeat(last).take(repeat));
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn from_hex(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

/// `Enn` error reply code.
fn error_code(reply: &[u8]) -> Option<u8> {
    match reply {
        [b'E', hi, lo] => std::str::from_utf8(&[*hi, *lo])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok()),
        [b'E', b'.', ..] => Some(0),
        _ => None,
    }
}

/// Why the target stopped, as reported by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopReply {
    /// Halted with `signal`; `registers` holds expedited values (regnum → hex).
    Signal {
        signal: u8,
        registers: BTreeMap<u32, String>,
    },
    Exited {
        code: u8,
    },
    Terminated {
        signal: u8,
    },
}

pub(crate) fn parse_stop_reply(reply: &[u8]) -> Option<StopReply> {
    let text = std::str::from_utf8(reply).ok()?;
    let kind = text.get(..1)?;
    let code = u8::from_str_radix(text.get(1..3)?, 16).ok()?;
    match kind {
        "S" => Some(StopReply::Signal {
            signal: code,
            registers: BTreeMap::new(),
        }),
        "T" => {
            let registers = text[3..]
                .split(';')
                .filter_map(|pair| pair.split_once(':'))
                .filter_map(|(key, value)| {
                    let regnum = u32::from_str_radix(key, 16).ok()?;
                    Some((regnum, value.to_string()))
                })
                .collect();
            Some(StopReply::Signal {
                signal: code,
                registers,
            })
        }
        "W" => Some(StopReply::Exited { code }),
        "X" => Some(StopReply::Terminated { signal: code }),
        _ => None,
    }
}

/// Breakpoint flavour in `Z`/`z` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BreakpointType {
    Software,
    Hardware,
}

impl BreakpointType {
    fn code(self) -> u8 {
        match self {
            BreakpointType::Software => 0,
            BreakpointType::Hardware => 1,
        }
    }
}

/// A connection to one engine's GDB stub.
#[derive(Debug)]
pub(crate) struct GdbClient {
    stream: TcpStream,
    port: u16,
    buf: Vec<u8>,
    /// Packets that arrived while an acknowledgement was awaited.
    inbox: VecDeque<Vec<u8>>,
    acks: bool,
    packet_size: usize,
    request_timeout: Duration,
    console: ConsoleHub,
    poisoned: Option<String>,
}

impl GdbClient {
    /// Connect to `127.0.0.1:port`, retrying until `deadline`, then negotiate
    /// features with the stub.
    pub async fn connect(
        port: u16,
        deadline: Instant,
        request_timeout: Duration,
        console: ConsoleHub,
    ) -> Result<Self> {
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() >= deadline => {
                    return Err(SimError::Transport(format!(
                        "no GDB stub on port {port}: {e}"
                    )));
                }
                Err(_) => sleep(Duration::from_millis(CONNECT_RETRY_MS)).await,
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(port = port, "Connected to GDB stub");

        let mut client = Self {
            stream,
            port,
            buf: Vec::new(),
            inbox: VecDeque::new(),
            acks: true,
            packet_size: DEFAULT_PACKET_SIZE,
            request_timeout,
            console,
            poisoned: None,
        };
        let features = client.request(b"qSupported:swbreak+;hwbreak+").await?;
        let features = String::from_utf8_lossy(&features).into_owned();
        for feature in features.split(';') {
            if let Some(size) = feature.strip_prefix("PacketSize=") {
                if let Ok(size) = usize::from_str_radix(size, 16) {
                    client.packet_size = size.max(64);
                }
            }
        }
        if features.split(';').any(|f| f == "QStartNoAckMode+")
            && client.request(b"QStartNoAckMode").await? == b"OK"
        {
            client.acks = false;
        }
        Ok(client)
    }

    fn check(&self) -> Result<()> {
        match &self.poisoned {
            Some(why) => Err(SimError::Transport(why.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, why: impl std::fmt::Display) -> SimError {
        let message = format!("GDB stub on port {}: {why}", self.port);
        debug!(error = %message, "Debug link poisoned");
        self.poisoned = Some(message.clone());
        SimError::Transport(message)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match timeout(self.request_timeout, self.stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.poison(e)),
            Err(_) => Err(self.poison("write timed out")),
        }
    }

    /// Read more bytes, or `Ok(false)` once `deadline` passes.
    async fn fill(&mut self, deadline: Instant) -> Result<bool> {
        let mut chunk = [0u8; 4096];
        match timeout_at(deadline, self.stream.read(&mut chunk)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(self.poison("connection closed")),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Ok(Err(e)) => Err(self.poison(e)),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.check()?;
        trace!(packet = %String::from_utf8_lossy(payload), "gdb <-");
        let framed = frame(payload);
        self.write_raw(&framed).await?;
        if !self.acks {
            return Ok(());
        }

        let deadline = Instant::now() + self.request_timeout;
        let mut retransmits = 0;
        loop {
            match take_frame(&mut self.buf) {
                Some(Frame::Ack) => return Ok(()),
                Some(Frame::Nak) if retransmits < MAX_RETRANSMITS => {
                    retransmits += 1;
                    self.write_raw(&framed).await?;
                }
                Some(Frame::Nak) => return Err(self.poison("packet rejected")),
                Some(Frame::Packet(body)) => self.inbox.push_back(body),
                Some(Frame::Corrupt) => {}
                None => {
                    if !self.fill(deadline).await? {
                        return Err(self.poison("no acknowledgement"));
                    }
                }
            }
        }
    }

    /// Next packet, or `None` once `deadline` passes.
    async fn next_packet(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(body) = self.inbox.pop_front() {
                if self.acks {
                    self.write_raw(b"+").await?;
                }
                return Ok(Some(decode_body(&body)));
            }
            match take_frame(&mut self.buf) {
                Some(Frame::Packet(body)) => self.inbox.push_back(body),
                Some(Frame::Corrupt) if self.acks => self.write_raw(b"-").await?,
                Some(Frame::Corrupt) => return Err(self.poison("bad checksum")),
                Some(Frame::Ack | Frame::Nak) => {}
                None => {
                    if !self.fill(deadline).await? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn reply(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.request_timeout;
        match self.next_packet(deadline).await? {
            Some(reply) => {
                trace!(packet = %String::from_utf8_lossy(&reply), "gdb ->");
                Ok(reply)
            }
            None => Err(self.poison(format!("no reply within {:?}", self.request_timeout))),
        }
    }

    /// Send one packet and return the stub's reply.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;
        self.reply().await
    }

    async fn expect_ok(&mut self, payload: &[u8], what: &str) -> Result<()> {
        let reply = self.request(payload).await?;
        if reply == b"OK" {
            Ok(())
        } else {
            Err(self.poison(format!(
                "{what}: unexpected reply {}",
                String::from_utf8_lossy(&reply)
            )))
        }
    }

    /// Current halt reason (`?`).
    pub async fn halt_reason(&mut self) -> Result<StopReply> {
        let reply = self.request(b"?").await?;
        parse_stop_reply(&reply).ok_or_else(|| {
            self.poison(format!(
                "bad halt reason {}",
                String::from_utf8_lossy(&reply)
            ))
        })
    }

    /// Hex text of the `g` register block.
    pub async fn read_registers(&mut self) -> Result<Vec<u8>> {
        let reply = self.request(b"g").await?;
        if error_code(&reply).is_some() || reply.is_empty() {
            return Err(SimError::Transport(format!(
                "GDB stub on port {} refused to read registers",
                self.port
            )));
        }
        Ok(reply)
    }

    pub async fn write_registers(&mut self, hex: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(hex.len() + 1);
        packet.push(b'G');
        packet.extend_from_slice(hex);
        let reply = self.request(&packet).await?;
        match reply.as_slice() {
            b"OK" => Ok(()),
            _ => Err(SimError::AccessDenied(format!(
                "engine refused register write: {}",
                String::from_utf8_lossy(&reply)
            ))),
        }
    }

    /// Hex text of one register, or `None` if the stub cannot provide it.
    pub async fn read_register(&mut self, regnum: u32) -> Result<Option<Vec<u8>>> {
        let reply = self.request(format!("p{regnum:x}").as_bytes()).await?;
        if reply.is_empty() || error_code(&reply).is_some() {
            return Ok(None);
        }
        Ok(Some(reply))
    }

    /// Write one register; `Ok(false)` if the stub lacks `P`.
    pub async fn write_register(&mut self, regnum: u32, hex: &str) -> Result<bool> {
        let reply = self
            .request(format!("P{regnum:x}={hex}").as_bytes())
            .await?;
        if reply.is_empty() {
            return Ok(false);
        }
        if reply == b"OK" {
            return Ok(true);
        }
        Err(SimError::AccessDenied(format!(
            "engine refused write of register {regnum}: {}",
            String::from_utf8_lossy(&reply)
        )))
    }

    fn chunk_size(&self) -> usize {
        // Two hex digits per byte plus framing and the address header.
        (self.packet_size.saturating_sub(32) / 2).clamp(16, MAX_CHUNK)
    }

    pub async fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let at = address.wrapping_add(out.len() as u64);
            let want = (len - out.len()).min(self.chunk_size());
            let reply = self.request(format!("m{at:x},{want:x}").as_bytes()).await?;
            if let Some(code) = error_code(&reply) {
                return Err(SimError::AccessDenied(format!(
                    "engine refused read of {at:#x}+{want:#x} (E{code:02x})"
                )));
            }
            let bytes = from_hex(&reply)
                .ok_or_else(|| self.poison("malformed memory reply"))?;
            if bytes.is_empty() {
                return Err(SimError::AccessDenied(format!(
                    "engine returned no data at {at:#x}"
                )));
            }
            let take = bytes.len().min(want);
            out.extend_from_slice(&bytes[..take]);
        }
        Ok(out)
    }

    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = address.wrapping_add(done as u64);
            let n = (data.len() - done).min(self.chunk_size());
            let packet = format!("M{at:x},{n:x}:{}", to_hex(&data[done..done + n]));
            let reply = self.request(packet.as_bytes()).await?;
            if reply != b"OK" {
                return Err(SimError::AccessDenied(format!(
                    "engine refused write of {at:#x}+{n:#x}: {}",
                    String::from_utf8_lossy(&reply)
                )));
            }
            done += n;
        }
        Ok(())
    }

    pub async fn insert_breakpoint(
        &mut self,
        kind: BreakpointType,
        address: u64,
        width: u64,
    ) -> Result<()> {
        let packet = format!("Z{},{address:x},{width:x}", kind.code());
        let reply = self.request(packet.as_bytes()).await?;
        match (reply.as_slice(), kind) {
            (b"OK", _) => Ok(()),
            ([], _) => Err(SimError::Unsupported(format!(
                "engine does not implement {kind:?} breakpoints"
            ))),
            (_, BreakpointType::Hardware) => Err(SimError::ResourceExhausted(format!(
                "engine refused a hardware breakpoint at {address:#x}"
            ))),
            (_, BreakpointType::Software) => Err(SimError::AccessDenied(format!(
                "engine refused a breakpoint at {address:#x}"
            ))),
        }
    }

    pub async fn remove_breakpoint(
        &mut self,
        kind: BreakpointType,
        address: u64,
        width: u64,
    ) -> Result<()> {
        let packet = format!("z{},{address:x},{width:x}", kind.code());
        self.expect_ok(packet.as_bytes(), "remove breakpoint").await
    }

    /// Resume (`c`). The stop reply arrives later through [`GdbClient::wait_stop`].
    pub async fn resume(&mut self) -> Result<()> {
        self.send(b"c").await
    }

    /// Single-step (`s`). The stop reply arrives through [`GdbClient::wait_stop`].
    pub async fn step(&mut self) -> Result<()> {
        self.send(b"s").await
    }

    /// Ask a running target to stop.
    pub async fn interrupt(&mut self) -> Result<()> {
        self.check()?;
        self.write_raw(&[INTERRUPT]).await
    }

    /// Wait for a stop reply until `deadline`. Console output packets (`O`)
    /// are forwarded to the instance console on the way.
    pub async fn wait_stop(&mut self, deadline: Instant) -> Result<Option<StopReply>> {
        self.check()?;
        loop {
            let Some(packet) = self.next_packet(deadline).await? else {
                return Ok(None);
            };
            if packet.first() == Some(&b'O') && packet != b"OK" {
                if let Some(text) = from_hex(&packet[1..]) {
                    self.console.publish(Bytes::from(text));
                }
                continue;
            }
            return match parse_stop_reply(&packet) {
                Some(stop) => Ok(Some(stop)),
                None => Err(self.poison(format!(
                    "expected a stop reply, got {}",
                    String::from_utf8_lossy(&packet)
                ))),
            };
        }
    }

    /// Stop reply for a step or interrupt, bounded by the request timeout.
    pub async fn expect_stop(&mut self) -> Result<StopReply> {
        let deadline = Instant::now() + self.request_timeout;
        match self.wait_stop(deadline).await? {
            Some(stop) => Ok(stop),
            None => Err(self.poison("target did not stop")),
        }
    }
}
