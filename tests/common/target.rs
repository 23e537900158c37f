//! In-process stand-in for what an engine exposes on its sockets: a
//! Cortex-M GDB stub on the debug port and a QEMU-style monitor.
//!
//! The CPU executes one two-byte instruction per step and every program
//! loops over the first [`LOOP_LEN`] bytes of RAM, so breakpoints behind PC
//! are reached again on the next pass.

use super::{FLASH_BASE, RAM_BASE};
use std::collections::{BTreeSet, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use virserver::adapters::PortSet;

/// RAM backed by the stub. The test board declares more, so accesses past
/// this answer `E01` although the memory map allows them.
pub const STUB_RAM: u64 = 0x1_0000;
const STUB_FLASH: u64 = 0x4_0000;
/// Length of the loop every program runs.
pub const LOOP_LEN: u64 = 0x40;
/// Instructions `c` executes looking for a breakpoint before it reports
/// nothing until interrupted.
const RUN_HORIZON: usize = 256;
const PC: usize = 15;

#[derive(Debug, Clone)]
struct Cpu {
    regs: [u32; 16],
    xpsr: u32,
    ram: Vec<u8>,
    flash: Vec<u8>,
    breakpoints: BTreeSet<u32>,
}

impl Cpu {
    fn new() -> Self {
        let mut regs = [0u32; 16];
        regs[PC] = FLASH_BASE as u32;
        Self {
            regs,
            xpsr: 0x0100_0000,
            ram: vec![0; STUB_RAM as usize],
            flash: vec![0xff; STUB_FLASH as usize],
            breakpoints: BTreeSet::new(),
        }
    }

    fn next_pc(pc: u32) -> u32 {
        let next = pc.wrapping_add(2);
        if u64::from(next) == RAM_BASE + LOOP_LEN {
            RAM_BASE as u32
        } else {
            next
        }
    }

    fn memory(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
        let end = address.checked_add(len as u64)?;
        if address >= RAM_BASE && end <= RAM_BASE + STUB_RAM {
            let at = (address - RAM_BASE) as usize;
            return Some(&mut self.ram[at..at + len]);
        }
        if address >= FLASH_BASE && end <= FLASH_BASE + STUB_FLASH {
            let at = (address - FLASH_BASE) as usize;
            return Some(&mut self.flash[at..at + len]);
        }
        None
    }
}

#[derive(Debug, Default)]
struct Trace {
    log: Option<PathBuf>,
    enabled: bool,
}

#[derive(Debug)]
struct State {
    cpu: Cpu,
    saved: HashMap<String, Cpu>,
    trace: Trace,
    /// Debug connections accepted so far.
    attaches: usize,
    monitor_log: Vec<String>,
}

impl State {
    fn executed(&self, pcs: &[u32]) {
        let (Some(path), true) = (&self.trace.log, self.trace.enabled) else {
            return;
        };
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            for pc in pcs {
                let _ = writeln!(file, "Trace 0: 0x7f0000001000 [00000000/{pc:08x}/00000000/ff200000] ");
            }
        }
    }
}

/// Sockets of one fake engine. Dropping it closes them.
pub struct FakeTarget {
    state: Arc<Mutex<State>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for FakeTarget {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl FakeTarget {
    /// Listen on the instance's debug port and, if it has one, its monitor port.
    pub async fn serve(ports: PortSet) -> Self {
        let state = Arc::new(Mutex::new(State {
            cpu: Cpu::new(),
            saved: HashMap::new(),
            trace: Trace::default(),
            attaches: 0,
            monitor_log: Vec::new(),
        }));
        let mut tasks = Vec::new();

        let debug = ports.debug.expect("instance has a debug port");
        let listener = TcpListener::bind(("127.0.0.1", debug))
            .await
            .expect("bind debug port");
        let shared = state.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                {
                    // Every attach sees a freshly started engine.
                    let mut state = shared.lock().expect("state");
                    state.cpu = Cpu::new();
                    state.attaches += 1;
                }
                tokio::spawn(debug_session(sock, shared.clone()));
            }
        }));

        if let Some(monitor) = ports.monitor {
            let listener = TcpListener::bind(("127.0.0.1", monitor))
                .await
                .expect("bind monitor port");
            let shared = state.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok((sock, _)) = listener.accept().await {
                    tokio::spawn(monitor_session(sock, shared.clone()));
                }
            }));
        }
        Self { state, tasks }
    }

    pub fn attaches(&self) -> usize {
        self.state.lock().expect("state").attaches
    }

    pub fn pc(&self) -> u64 {
        u64::from(self.state.lock().expect("state").cpu.regs[PC])
    }

    pub fn ram(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().expect("state").cpu.ram[offset..offset + len].to_vec()
    }

    pub fn inserted_breakpoints(&self) -> Vec<u64> {
        let state = self.state.lock().expect("state");
        state.cpu.breakpoints.iter().map(|a| u64::from(*a)).collect()
    }

    /// Monitor commands received, in order.
    pub fn monitor_log(&self) -> Vec<String> {
        self.state.lock().expect("state").monitor_log.clone()
    }
}

fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

fn parse_num(text: &str) -> Option<u64> {
    u64::from_str_radix(text, 16).ok()
}

fn stop_at(signal: u8, pc: u32) -> String {
    format!("T{signal:02x}0f:{};", hex(&pc.to_le_bytes()))
}

enum Input {
    Interrupt,
    Packet(String),
}

/// Pull the next interrupt or complete packet out of `buf`.
fn next_input(buf: &mut Vec<u8>) -> Option<Input> {
    loop {
        let first = *buf.first()?;
        match first {
            0x03 => {
                buf.remove(0);
                return Some(Input::Interrupt);
            }
            b'$' => {
                let hash = buf.iter().position(|b| *b == b'#')?;
                if buf.len() < hash + 3 {
                    return None;
                }
                let mut body = Vec::new();
                let mut escaped = false;
                for b in &buf[1..hash] {
                    match (escaped, *b) {
                        (true, b) => {
                            body.push(b ^ 0x20);
                            escaped = false;
                        }
                        (false, b'}') => escaped = true,
                        (false, b) => body.push(b),
                    }
                }
                buf.drain(..hash + 3);
                return Some(Input::Packet(String::from_utf8_lossy(&body).into_owned()));
            }
            _ => {
                buf.remove(0);
            }
        }
    }
}

async fn send(sock: &mut TcpStream, body: &str) -> std::io::Result<()> {
    let framed = format!("${body}#{:02x}", checksum(body.as_bytes()));
    sock.write_all(framed.as_bytes()).await
}

async fn debug_session(mut sock: TcpStream, state: Arc<Mutex<State>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut acks = true;
    let mut running = false;
    loop {
        while let Some(input) = next_input(&mut buf) {
            let reply = match input {
                Input::Interrupt if running => {
                    running = false;
                    let pc = state.lock().expect("state").cpu.regs[PC];
                    Some(stop_at(2, pc))
                }
                Input::Interrupt => None,
                Input::Packet(body) => {
                    if acks && sock.write_all(b"+").await.is_err() {
                        return;
                    }
                    if body == "QStartNoAckMode" {
                        if send(&mut sock, "OK").await.is_err() {
                            return;
                        }
                        acks = false;
                        continue;
                    }
                    let (reply, runs) = handle(&body, &state);
                    running = runs;
                    reply
                }
            };
            if let Some(reply) = reply {
                if send(&mut sock, &reply).await.is_err() {
                    return;
                }
            }
        }
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Answer one packet; the flag tells whether the target is left running.
fn handle(body: &str, state: &Mutex<State>) -> (Option<String>, bool) {
    let mut state = state.lock().expect("state");
    let cpu = &mut state.cpu;
    let reply = match body.as_bytes().first() {
        Some(b'q') if body.starts_with("qSupported") => {
            "PacketSize=1000;QStartNoAckMode+;swbreak+;hwbreak+".to_string()
        }
        Some(b'?') => "S05".to_string(),
        Some(b'g') => cpu.regs.iter().map(|r| hex(&r.to_le_bytes())).collect(),
        Some(b'G') => match unhex(&body[1..]) {
            Some(bytes) if bytes.len() >= 64 => {
                for (i, reg) in bytes.chunks(4).take(16).enumerate() {
                    cpu.regs[i] = u32::from_le_bytes([reg[0], reg[1], reg[2], reg[3]]);
                }
                "OK".to_string()
            }
            _ => "E01".to_string(),
        },
        Some(b'p') => match parse_num(&body[1..]) {
            Some(n) if n < 16 => hex(&cpu.regs[n as usize].to_le_bytes()),
            Some(0x19) => hex(&cpu.xpsr.to_le_bytes()),
            _ => "E01".to_string(),
        },
        Some(b'P') => {
            let parsed = body[1..].split_once('=').and_then(|(n, v)| {
                let bytes = unhex(v)?;
                let mut word = [0u8; 4];
                word[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
                Some((parse_num(n)?, u32::from_le_bytes(word)))
            });
            match parsed {
                Some((n, value)) if n < 16 => {
                    cpu.regs[n as usize] = value;
                    "OK".to_string()
                }
                Some((0x19, value)) => {
                    cpu.xpsr = value;
                    "OK".to_string()
                }
                _ => "E01".to_string(),
            }
        }
        Some(b'm') => {
            let range = body[1..]
                .split_once(',')
                .and_then(|(a, l)| Some((parse_num(a)?, parse_num(l)? as usize)));
            match range.and_then(|(address, len)| cpu.memory(address, len)) {
                Some(bytes) => hex(bytes),
                None => "E01".to_string(),
            }
        }
        Some(b'M') => {
            let write = body[1..].split_once(':').and_then(|(head, data)| {
                let (a, l) = head.split_once(',')?;
                Some((parse_num(a)?, parse_num(l)? as usize, unhex(data)?))
            });
            match write {
                Some((address, len, data)) if data.len() == len => {
                    match cpu.memory(address, len) {
                        Some(slot) => {
                            slot.copy_from_slice(&data);
                            "OK".to_string()
                        }
                        None => "E01".to_string(),
                    }
                }
                _ => "E01".to_string(),
            }
        }
        Some(b'Z' | b'z') => {
            let address = body[3..].split(',').next().and_then(parse_num);
            match address {
                Some(address) if body.starts_with('Z') => {
                    cpu.breakpoints.insert(address as u32);
                    "OK".to_string()
                }
                Some(address) => {
                    cpu.breakpoints.remove(&(address as u32));
                    "OK".to_string()
                }
                None => "E01".to_string(),
            }
        }
        Some(b's') => {
            let pc = cpu.regs[PC];
            cpu.regs[PC] = Cpu::next_pc(pc);
            let stop = stop_at(5, cpu.regs[PC]);
            state.executed(&[pc]);
            stop
        }
        Some(b'c') => {
            let mut pc = cpu.regs[PC];
            let mut executed = Vec::new();
            let mut hit = false;
            for _ in 0..RUN_HORIZON {
                executed.push(pc);
                pc = Cpu::next_pc(pc);
                if cpu.breakpoints.contains(&pc) {
                    hit = true;
                    break;
                }
            }
            cpu.regs[PC] = pc;
            state.executed(&executed);
            if !hit {
                return (None, true);
            }
            stop_at(5, pc)
        }
        _ => String::new(),
    };
    (Some(reply), false)
}

/// `LoadBinary @<path> <address>`
fn load_binary(cpu: &mut Cpu, arg: &str) -> String {
    let words: Vec<&str> = arg.split_whitespace().collect();
    let ["LoadBinary", path, address] = words.as_slice() else {
        return format!("There was an error executing command 'sysbus {arg}'");
    };
    let data = std::fs::read(path.trim_start_matches('@')).unwrap_or_default();
    let address = parse_num(address.trim_start_matches("0x")).unwrap_or(0);
    match cpu.memory(address, data.len()) {
        Some(slot) if !data.is_empty() => {
            slot.copy_from_slice(&data);
            String::new()
        }
        _ => format!("There was an error executing command 'sysbus {arg}'"),
    }
}

async fn monitor_session(sock: TcpStream, state: Arc<Mutex<State>>) {
    const PROMPT: &str = "(qemu) ";
    let (read, mut write) = sock.into_split();
    let banner = format!("QEMU 8.2.0 monitor - type 'help' for more information\r\n{PROMPT}");
    if write.write_all(banner.as_bytes()).await.is_err() {
        return;
    }
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let output = {
            let mut state = state.lock().expect("state");
            state.monitor_log.push(command.clone());
            let (verb, arg) = command.split_once(' ').unwrap_or((command.as_str(), ""));
            match verb {
                "system_reset" => {
                    let cpu = &mut state.cpu;
                    cpu.regs = [0; 16];
                    cpu.regs[PC] = FLASH_BASE as u32;
                    String::new()
                }
                "savevm" => {
                    let cpu = state.cpu.clone();
                    state.saved.insert(arg.to_string(), cpu);
                    String::new()
                }
                "loadvm" => match state.saved.get(arg).cloned() {
                    Some(cpu) => {
                        state.cpu = cpu;
                        String::new()
                    }
                    None => format!("Error: Snapshot '{arg}' does not exist in one or more devices"),
                },
                "logfile" => {
                    state.trace.log = Some(PathBuf::from(arg));
                    String::new()
                }
                "log" => {
                    state.trace.enabled = arg.split(',').any(|item| item == "exec");
                    String::new()
                }
                // Renode machine selection and loaders.
                "mach" => String::new(),
                "sysbus" => load_binary(&mut state.cpu, arg),
                other => format!("unknown command: '{other}'; Error"),
            }
        };
        let reply = if output.is_empty() {
            format!("{line}\r\n{PROMPT}")
        } else {
            format!("{line}\r\n{output}\r\n{PROMPT}")
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}
