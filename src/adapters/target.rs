//! What the broker knows about a target without asking the engine.
//!
//! Register files are described in GDB register numbering so the debug link
//! can decode `g` replies and address single registers with `p`/`P`. The
//! memory map of the board is used to reject accesses before they reach the
//! engine; the engine's own answer is still authoritative.

use crate::board::{MemoryRegion, NodeConfig};
use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};

/// Largest single memory transfer.
pub(crate) const MAX_TRANSFER: u64 = 16 * 1024 * 1024;

/// Register file layout family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuFamily {
    /// ARMv6-M/v7-M/v8-M, Thumb only.
    CortexM,
    /// 32-bit ARM application and classic cores.
    Arm32,
    Aarch64,
    RiscV32,
    RiscV64,
    X86_64,
}

impl CpuFamily {
    /// Classify a human processor name such as "ARM Cortex-M4".
    pub fn from_processor(name: &str) -> Self {
        let n = name.to_ascii_lowercase();
        if n.contains("rv64") || n.contains("riscv64") {
            CpuFamily::RiscV64
        } else if n.contains("risc-v") || n.contains("riscv") || n.contains("rv32") {
            CpuFamily::RiscV32
        } else if n.contains("x86") || n.contains("amd64") {
            CpuFamily::X86_64
        } else if n.contains("cortex-m") {
            CpuFamily::CortexM
        } else if n.contains("cortex-a53")
            || n.contains("cortex-a57")
            || n.contains("cortex-a72")
            || n.contains("aarch64")
            || n.contains("armv8")
        {
            CpuFamily::Aarch64
        } else {
            CpuFamily::Arm32
        }
    }

    /// Breakpoint `kind` argument for `Z0`/`Z1`: the instruction width.
    pub fn breakpoint_kind(self) -> u64 {
        match self {
            CpuFamily::CortexM => 2,
            CpuFamily::X86_64 => 1,
            _ => 4,
        }
    }

    /// Address bits that never reach the program counter.
    ///
    /// Thumb entry points and function pointers carry bit 0.
    pub fn pc_mask(self) -> u64 {
        match self {
            CpuFamily::CortexM => u64::from(u32::MAX) & !1,
            CpuFamily::Arm32 | CpuFamily::RiscV32 => u64::from(u32::MAX),
            CpuFamily::Aarch64 | CpuFamily::RiscV64 | CpuFamily::X86_64 => u64::MAX,
        }
    }
}

/// One register in GDB numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegisterDef {
    pub name: &'static str,
    pub regnum: u32,
    /// Width in bytes.
    pub size: usize,
    pub control: bool,
    /// Byte offset inside a `g` reply, when the stub is known to include it.
    pub offset: Option<usize>,
}

const ARM_GPR: [&str; 13] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
];

const X_REGS: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "x31",
];

const X86_GPR: [&str; 16] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// Register file of one processor family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegisterLayout {
    family: CpuFamily,
    regs: Vec<RegisterDef>,
}

impl RegisterLayout {
    pub fn for_family(family: CpuFamily) -> Self {
        // (name, regnum, size, control)
        let mut table: Vec<(&'static str, u32, usize, bool)> = Vec::new();
        match family {
            CpuFamily::CortexM | CpuFamily::Arm32 => {
                for (n, name) in ARM_GPR.iter().copied().enumerate() {
                    table.push((name, n as u32, 4, false));
                }
                table.push(("sp", 13, 4, true));
                table.push(("lr", 14, 4, true));
                table.push(("pc", 15, 4, true));
                let flags = if family == CpuFamily::CortexM { "xpsr" } else { "cpsr" };
                table.push((flags, 25, 4, true));
            }
            CpuFamily::Aarch64 => {
                for (n, name) in X_REGS.iter().copied().take(31).enumerate() {
                    table.push((name, n as u32, 8, false));
                }
                table.push(("sp", 31, 8, true));
                table.push(("pc", 32, 8, true));
                table.push(("pstate", 33, 4, true));
            }
            CpuFamily::RiscV32 | CpuFamily::RiscV64 => {
                let xlen = if family == CpuFamily::RiscV32 { 4 } else { 8 };
                for (n, name) in X_REGS.iter().copied().enumerate() {
                    table.push((name, n as u32, xlen, false));
                }
                table.push(("pc", 32, xlen, true));
            }
            CpuFamily::X86_64 => {
                for (n, name) in X86_GPR.iter().copied().enumerate() {
                    table.push((name, n as u32, 8, false));
                }
                table.push(("rip", 16, 8, true));
                table.push(("rflags", 17, 4, true));
            }
        }

        // Offsets are only known for the run of registers numbered from 0
        // without gaps; anything after a gap is fetched with `p`.
        let mut regs = Vec::with_capacity(table.len());
        let mut next = Some((0u32, 0usize));
        for (name, regnum, size, control) in table {
            let offset = match next {
                Some((expected, offset)) if expected == regnum => {
                    next = Some((regnum + 1, offset + size));
                    Some(offset)
                }
                _ => {
                    next = None;
                    None
                }
            };
            regs.push(RegisterDef {
                name,
                regnum,
                size,
                control,
                offset,
            });
        }
        Self { family, regs }
    }

    pub fn family(&self) -> CpuFamily {
        self.family
    }

    pub fn registers(&self) -> &[RegisterDef] {
        &self.regs
    }

    /// Look a register up by name, ignoring case.
    pub fn find(&self, name: &str) -> Option<&RegisterDef> {
        let key = name.trim().to_ascii_lowercase();
        self.regs.iter().find(|r| r.name == key)
    }

    pub fn pc(&self) -> RegisterDef {
        let name = match self.family {
            CpuFamily::X86_64 => "rip",
            _ => "pc",
        };
        self.regs
            .iter()
            .copied()
            .find(|r| r.name == name)
            .unwrap_or(RegisterDef {
                name,
                regnum: 15,
                size: 4,
                control: true,
                offset: None,
            })
    }

    /// Registers that ignore writes.
    pub fn read_only(&self, reg: &RegisterDef) -> bool {
        matches!(self.family, CpuFamily::RiscV32 | CpuFamily::RiscV64) && reg.regnum == 0
    }

    /// Decode `reg` from the hex text of a `g` reply.
    ///
    /// `None` when the reply is too short or the stub marked the bytes
    /// unavailable (`xx`).
    pub fn decode(&self, reg: &RegisterDef, g_reply: &[u8]) -> Option<u64> {
        let offset = reg.offset?;
        let hex = g_reply.get(offset * 2..(offset + reg.size) * 2)?;
        le_value(hex)
    }

    /// Splice `value` into the hex text of a `g` reply.
    pub fn encode_into(&self, reg: &RegisterDef, value: u64, g_reply: &mut [u8]) -> bool {
        let Some(offset) = reg.offset else {
            return false;
        };
        let Some(slot) = g_reply.get_mut(offset * 2..(offset + reg.size) * 2) else {
            return false;
        };
        slot.copy_from_slice(le_hex(value, reg.size).as_bytes());
        true
    }
}

/// Target-order (little-endian) hex encoding of the low `size` bytes of `value`.
pub(crate) fn le_hex(value: u64, size: usize) -> String {
    value.to_le_bytes()[..size.min(8)]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Decode little-endian hex text of up to eight bytes.
pub(crate) fn le_value(hex: &[u8]) -> Option<u64> {
    if hex.len() % 2 != 0 || hex.len() > 16 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, pair) in hex.chunks(2).enumerate() {
        let text = std::str::from_utf8(pair).ok()?;
        bytes[i] = u8::from_str_radix(text, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

/// Intended use of a memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    /// Instruction fetch, e.g. a breakpoint address.
    Fetch,
    /// Image loading ignores the region's access mode.
    Load,
}

/// Check `[address, address + len)` against the node's memory map.
pub(crate) fn check_access(
    node: &NodeConfig,
    address: u64,
    len: u64,
    access: Access,
) -> Result<&MemoryRegion> {
    if len == 0 {
        return Err(SimError::InvalidArgument("zero-length transfer".to_string()));
    }
    if len > MAX_TRANSFER {
        return Err(SimError::InvalidArgument(format!(
            "transfer of {len} bytes exceeds {MAX_TRANSFER}"
        )));
    }
    let region = node
        .memory
        .iter()
        .filter(|r| r.contains(address, len))
        .min_by_key(|r| r.alias)
        .ok_or_else(|| {
            SimError::AccessDenied(format!("no memory mapped at {address:#x}+{len:#x}"))
        })?;
    let allowed = match access {
        Access::Read | Access::Fetch => region.access.readable(),
        Access::Write => region.access.writable(),
        Access::Load => true,
    };
    if !allowed {
        return Err(SimError::AccessDenied(format!(
            "{access:?} of {address:#x}+{len:#x} not permitted by the {:?} region at {:#x}",
            region.access, region.address
        )));
    }
    Ok(region)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Breakpoint guard of the form `<register> <op> <value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Condition {
    pub register: String,
    op: CmpOp,
    value: u64,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self> {
        const OPS: [(&str, CmpOp); 6] = [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ];
        let bad = || SimError::InvalidArgument(format!("unsupported breakpoint condition: {text}"));
        let (idx, sym, op) = OPS
            .iter()
            .find_map(|(sym, op)| text.find(sym).map(|idx| (idx, *sym, *op)))
            .ok_or_else(bad)?;
        let register = text[..idx].trim().to_ascii_lowercase();
        let value = parse_u64(text[idx + sym.len()..].trim()).ok_or_else(bad)?;
        if register.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            register,
            op,
            value,
        })
    }

    pub fn holds(&self, actual: u64) -> bool {
        match self.op {
            CmpOp::Eq => actual == self.value,
            CmpOp::Ne => actual != self.value,
            CmpOp::Lt => actual < self.value,
            CmpOp::Le => actual <= self.value,
            CmpOp::Gt => actual > self.value,
            CmpOp::Ge => actual >= self.value,
        }
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BackendType;
    use crate::board::tests::sample_board;
    use crate::board::{AccessMode, MemoryType};
    use crate::error::ErrorKind;

    #[test]
    fn test_family_classification() {
        assert_eq!(CpuFamily::from_processor("ARM Cortex-M4"), CpuFamily::CortexM);
        assert_eq!(CpuFamily::from_processor("ARM Cortex-A9"), CpuFamily::Arm32);
        assert_eq!(CpuFamily::from_processor("ARM Cortex-A53"), CpuFamily::Aarch64);
        assert_eq!(CpuFamily::from_processor("RISC-V RV32"), CpuFamily::RiscV32);
        assert_eq!(CpuFamily::from_processor("RISC-V RV64"), CpuFamily::RiscV64);
        assert_eq!(CpuFamily::from_processor("ARM7TDMI"), CpuFamily::Arm32);
        assert_eq!(CpuFamily::from_processor("x86_64"), CpuFamily::X86_64);
    }

    #[test]
    fn test_arm_layout_offsets_stop_at_gap() {
        let layout = RegisterLayout::for_family(CpuFamily::CortexM);
        let pc = layout.pc();
        assert_eq!((pc.regnum, pc.offset), (15, Some(60)));
        let xpsr = layout.find("XPSR").expect("xpsr");
        assert_eq!(xpsr.regnum, 25);
        assert_eq!(xpsr.offset, None);
        assert_eq!(layout.registers().iter().filter(|r| !r.control).count(), 13);
    }

    #[test]
    fn test_aarch64_and_x86_layouts() {
        let a64 = RegisterLayout::for_family(CpuFamily::Aarch64);
        let pstate = a64.find("pstate").expect("pstate");
        assert_eq!((pstate.regnum, pstate.size, pstate.offset), (33, 4, Some(264)));

        let x86 = RegisterLayout::for_family(CpuFamily::X86_64);
        assert_eq!(x86.pc().name, "rip");
        assert_eq!(x86.find("rflags").and_then(|r| r.offset), Some(136));
    }

    #[test]
    fn test_riscv_x0_is_read_only() {
        let layout = RegisterLayout::for_family(CpuFamily::RiscV32);
        let x0 = *layout.find("x0").expect("x0");
        let x1 = *layout.find("x1").expect("x1");
        assert!(layout.read_only(&x0));
        assert!(!layout.read_only(&x1));
        assert_eq!(layout.pc().size, 4);
    }

    #[test]
    fn test_decode_and_encode_g_reply() {
        let layout = RegisterLayout::for_family(CpuFamily::CortexM);
        let mut reply = "00".repeat(64).into_bytes();
        let pc = layout.pc();
        assert!(layout.encode_into(&pc, 0x0800_0130, &mut reply));
        assert_eq!(&reply[120..128], b"30010008");
        assert_eq!(layout.decode(&pc, &reply), Some(0x0800_0130));

        let r1 = *layout.find("r1").expect("r1");
        reply[8..16].copy_from_slice(b"xxxxxxxx");
        assert_eq!(layout.decode(&r1, &reply), None);
        let xpsr = *layout.find("xpsr").expect("xpsr");
        assert_eq!(layout.decode(&xpsr, &reply), None);
    }

    #[test]
    fn test_access_checks_follow_region_modes() {
        let mut board = sample_board(BackendType::Qemu);
        board.nodes[0].memory.push(MemoryRegion {
            kind: MemoryType::Flash,
            address: 0x0800_0000,
            size: 0x1_0000,
            access: AccessMode::ReadExecute,
            alias: false,
        });
        let node = &board.nodes[0];

        assert!(check_access(node, 0x2000_0ffe, 4, Access::Write).is_ok());
        assert!(check_access(node, 0x0800_0000, 2, Access::Fetch).is_ok());
        assert!(check_access(node, 0x0800_0000, 2, Access::Load).is_ok());
        let denied = |addr, len, access| {
            check_access(node, addr, len, access).map(|_| ()).unwrap_err().kind()
        };
        assert_eq!(denied(0x0800_0000, 1, Access::Write), ErrorKind::AccessDenied);
        assert_eq!(denied(0x1000_0000, 4, Access::Read), ErrorKind::AccessDenied);
        assert_eq!(denied(0x2001_fffe, 4, Access::Read), ErrorKind::AccessDenied);
        assert_eq!(denied(0x2000_0000, 0, Access::Read), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_condition_parsing() {
        let cond = Condition::parse("R0 >= 0x10").expect("parse");
        assert_eq!(cond.register, "r0");
        assert!(cond.holds(0x10));
        assert!(!cond.holds(0xf));
        assert!(Condition::parse("r1 != 7").expect("parse").holds(8));
        assert_eq!(
            Condition::parse("r0 ~ 5").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(Condition::parse("== 5").is_err());
    }
}
