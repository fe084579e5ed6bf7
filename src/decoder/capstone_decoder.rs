//! Capstone-backed implementation of the [`Decoder`] contract.

use std::fmt;

use capstone::arch::arm::{ArchMode as ArmMode, ArmOperandType};
use capstone::arch::arm64::{ArchMode as Arm64Mode, Arm64OperandType};
use capstone::arch::mips::{ArchMode as MipsMode, MipsOperand};
use capstone::arch::ppc::{ArchMode as PpcMode, PpcOperand};
use capstone::arch::riscv::{ArchMode as RiscVMode, RiscVOperand};
use capstone::arch::x86::{ArchMode as X86Mode, X86OperandType};
use capstone::arch::{ArchDetail, ArchOperand};
use capstone::prelude::BuildsCapstone;
use capstone::{Capstone, RegAccessType};

use super::{
    DecodeStatus, DecodedInsn, DecodedOperand, Decoder, Immediate, InsnCategory, OperandFlags,
    OperandKind, ScratchBuffer,
};
use crate::Architecture;

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

/// Capstone groups that mark a control-flow instruction
const CONTROL_FLOW_GROUPS: [&str; 6] = ["jump", "call", "ret", "return", "iret", "branch_relative"];

/// Capstone groups whose operands may designate a branch destination
const TARGET_GROUPS: [&str; 3] = ["jump", "call", "branch_relative"];

/// A detail-enabled Capstone handle for one ISA.
///
/// The handle is opened on construction and closed when dropped. x86 uses
/// Capstone's default Intel syntax.
pub struct CapstoneDecoder {
    cs: Capstone,
    architecture: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture
    pub fn for_architecture(architecture: Architecture) -> Result<Self, DecoderError> {
        let builder = Capstone::new();
        let cs = match architecture {
            Architecture::X86_32 => builder.x86().mode(X86Mode::Mode32).detail(true).build(),
            Architecture::X86_64 => builder.x86().mode(X86Mode::Mode64).detail(true).build(),
            Architecture::Arm => builder.arm().mode(ArmMode::Arm).detail(true).build(),
            Architecture::Thumb => builder.arm().mode(ArmMode::Thumb).detail(true).build(),
            Architecture::AArch64 => builder.arm64().mode(Arm64Mode::Arm).detail(true).build(),
            Architecture::Mips32 => builder.mips().mode(MipsMode::Mips32).detail(true).build(),
            Architecture::RiscV32 => builder.riscv().mode(RiscVMode::RiscV32).detail(true).build(),
            Architecture::RiscV64 => builder.riscv().mode(RiscVMode::RiscV64).detail(true).build(),
            Architecture::Ppc32 => builder.ppc().mode(PpcMode::Mode32).detail(true).build(),
            Architecture::Unknown => return Err(DecoderError::UnsupportedArchitecture(architecture)),
        }?;

        Ok(Self { cs, architecture })
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Decode the single instruction starting at `at`, looking no further than `end`.
    ///
    /// Addresses handed to Capstone are buffer offsets, so branch targets
    /// come back buffer-relative.
    fn decode_at(&self, bytes: &[u8], at: usize, end: usize) -> Option<DecodedInsn> {
        let insns = self.cs.disasm_count(&bytes[at..end], at as u64, 1).ok()?;
        let insn = insns.iter().next()?;

        let mnemonic = insn.mnemonic().unwrap_or("");
        let op_str = insn.op_str().unwrap_or("");
        let ascii = if op_str.is_empty() {
            mnemonic.to_string()
        } else {
            format!("{} {}", mnemonic, op_str)
        };

        let mut decoded = DecodedInsn {
            offset: insn.address(),
            size: insn.bytes().len(),
            ascii,
            status: DecodeStatus::empty(),
            category: InsnCategory::Unknown,
            target: None,
            operands: Vec::new(),
        };

        let Ok(detail) = self.cs.insn_detail(&insn) else {
            return Some(decoded);
        };

        let groups: Vec<String> = detail
            .groups()
            .iter()
            .filter_map(|g| self.cs.group_name(*g))
            .collect();

        decoded.status |= DecodeStatus::MNEMONIC_FLAGS;
        decoded.category = categorize(mnemonic, &groups);

        let arch_detail = detail.arch_detail();
        let is_x86 = matches!(arch_detail, ArchDetail::X86Detail(_));
        let is_branch = groups.iter().any(|g| TARGET_GROUPS.contains(&g.as_str()));

        let mut operands: Vec<_> = arch_detail
            .operands()
            .into_iter()
            .map(|op| self.operand_kind(op))
            .collect();

        if is_x86 && is_branch {
            if let Some(far) = far_pointer(&operands) {
                operands = vec![far];
            }
        }

        decoded.operands = with_text(operands, op_str);
        decoded.status |= DecodeStatus::OPERANDS;

        if is_branch {
            decoded.target = self.branch_target(&decoded.operands, is_x86, insn.address());
        }

        Some(decoded)
    }

    /// Access flags and kind for one Capstone operand
    fn operand_kind(&self, op: ArchOperand) -> (OperandFlags, OperandKind) {
        match op {
            ArchOperand::X86Operand(op) => {
                let kind = match op.op_type {
                    X86OperandType::Reg(reg) => OperandKind::Register(reg.0),
                    X86OperandType::Imm(imm) => OperandKind::Immediate(self.immediate(imm)),
                    X86OperandType::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (access_flags(op.access), kind)
            }
            ArchOperand::ArmOperand(op) => {
                let kind = match op.op_type {
                    ArmOperandType::Reg(reg) | ArmOperandType::SysReg(reg) => OperandKind::Register(reg.0),
                    ArmOperandType::Imm(imm) => OperandKind::Immediate(self.immediate(imm.into())),
                    ArmOperandType::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (access_flags(op.access), kind)
            }
            ArchOperand::Arm64Operand(op) => {
                let kind = match op.op_type {
                    Arm64OperandType::Reg(reg) => OperandKind::Register(reg.0),
                    Arm64OperandType::Imm(imm) => OperandKind::Immediate(self.immediate(imm)),
                    Arm64OperandType::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (OperandFlags::empty(), kind)
            }
            ArchOperand::MipsOperand(op) => {
                let kind = match op {
                    MipsOperand::Reg(reg) => OperandKind::Register(reg.0),
                    MipsOperand::Imm(imm) => OperandKind::Immediate(self.immediate(imm)),
                    MipsOperand::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (OperandFlags::empty(), kind)
            }
            ArchOperand::RiscVOperand(op) => {
                let kind = match op {
                    RiscVOperand::Reg(reg) => OperandKind::Register(reg.0),
                    RiscVOperand::Imm(imm) => OperandKind::Immediate(self.immediate(imm)),
                    RiscVOperand::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (OperandFlags::empty(), kind)
            }
            ArchOperand::PpcOperand(op) => {
                let kind = match op {
                    PpcOperand::Reg(reg) => OperandKind::Register(reg.0),
                    PpcOperand::Imm(imm) => OperandKind::Immediate(self.immediate(imm)),
                    PpcOperand::Mem(_) => OperandKind::Memory,
                    _ => OperandKind::Unknown,
                };
                (OperandFlags::empty(), kind)
            }
            _ => (OperandFlags::empty(), OperandKind::Unknown),
        }
    }

    /// Build an immediate whose address view wraps at the architecture's address width.
    fn immediate(&self, value: i64) -> Immediate {
        Immediate {
            vma: self.wrap_address(value),
            ..Immediate::from_signed(value)
        }
    }

    fn wrap_address(&self, value: i64) -> u64 {
        if self.architecture.address_bits() == 32 {
            value as i32 as i64 as u64
        } else {
            value as u64
        }
    }

    /// Pick the operand holding the branch destination.
    ///
    /// x86 names it first. Elsewhere the destination is the last immediate,
    /// after any registers or bit numbers the branch tests.
    fn branch_target(&self, operands: &[DecodedOperand], is_x86: bool, address: u64) -> Option<DecodedOperand> {
        let candidate = if is_x86 {
            operands.first()
        } else {
            operands.iter().rev().find(|op| matches!(op.kind, OperandKind::Immediate(_)))
        };

        let mut target = candidate
            .filter(|op| matches!(op.kind, OperandKind::Immediate(_) | OperandKind::Absolute { .. }))
            .cloned()?;

        // Capstone reports RISC-V branch immediates as raw pc-relative offsets
        if let (Architecture::RiscV32 | Architecture::RiscV64, OperandKind::Immediate(imm)) =
            (self.architecture, &mut target.kind)
        {
            imm.vma = self.wrap_address((address as i64).wrapping_add(imm.signed));
        }

        Some(target)
    }
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapstoneDecoder")
            .field("architecture", &self.architecture)
            .finish()
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.architecture)
    }
}

impl Decoder for CapstoneDecoder {
    fn disasm_linear(
        &mut self,
        buffer: &ScratchBuffer,
        start: usize,
        len: usize,
        display: &mut dyn FnMut(&DecodedInsn),
    ) {
        let bytes = buffer.as_slice();
        let end = start.saturating_add(len).min(bytes.len());
        let mut at = start;
        let mut skipped = 0usize;

        while at < end {
            match self.decode_at(bytes, at, end) {
                Some(insn) if insn.size > 0 => {
                    at += insn.size;
                    display(&insn);
                }
                _ => {
                    // Couldn't decode an instruction, skip one byte
                    log::trace!("No instruction at offset 0x{:x}", at);
                    at += 1;
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            log::debug!("{}: skipped {} undecodable bytes", self, skipped);
        }
    }
}

/// Pick a decoder category from Capstone's groups, falling back to the mnemonic.
fn categorize(mnemonic: &str, groups: &[String]) -> InsnCategory {
    let in_group = |name: &str| groups.iter().any(|g| g == name);

    if CONTROL_FLOW_GROUPS.iter().any(|g| in_group(g)) {
        InsnCategory::ControlFlow
    } else if in_group("privilege") {
        InsnCategory::Privileged
    } else if in_group("int") {
        InsnCategory::Trap
    } else {
        categorize_mnemonic(&mnemonic.to_ascii_lowercase())
    }
}

fn categorize_mnemonic(m: &str) -> InsnCategory {
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| m.starts_with(p));
    let is = |names: &[&str]| names.contains(&m);

    if is(&[
        "mrs", "msr", "eret", "wfi", "wfe", "cps", "mtmsr", "mfmsr", "mtspr", "mfspr", "rfi", "sret", "mret", "tlbwi",
        "tlbr",
    ]) {
        InsnCategory::Privileged
    } else if starts(&["push", "pop"]) || is(&["enter", "leave"]) {
        InsnCategory::Stack
    } else if starts(&["nop"]) {
        InsnCategory::Nop
    } else if starts(&["cmp", "test", "bt", "tst", "teq", "cmn"]) {
        InsnCategory::Test
    } else if starts(&["add", "adc", "sub", "sbb", "inc", "dec", "mul", "imul", "div", "idiv", "neg", "sdiv", "udiv", "mla", "rsb"]) {
        InsnCategory::Math
    } else if starts(&["and", "or", "xor", "eor", "not", "bic", "shl", "shr", "sal", "sar", "rol", "ror", "rcl", "rcr", "lsl", "lsr", "asr", "sll", "srl", "sra"]) {
        InsnCategory::Bit
    } else if is(&["in", "out", "insb", "insw", "insd", "outsb", "outsw", "outsd"]) {
        InsnCategory::Io
    } else if starts(&["mov", "cmov", "xchg", "lods", "stos", "ldr", "ldp", "str", "stp"])
        || is(&["lea", "ld", "sd", "lw", "sw", "lh", "sh", "lb", "sb", "lbu", "lhu", "lwz", "stw"])
    {
        InsnCategory::LoadStore
    } else if m.starts_with('f') {
        InsnCategory::Float
    } else {
        InsnCategory::General
    }
}

fn access_flags(access: Option<RegAccessType>) -> OperandFlags {
    match access {
        Some(RegAccessType::ReadOnly) => OperandFlags::READ,
        Some(RegAccessType::WriteOnly) => OperandFlags::WRITE,
        Some(RegAccessType::ReadWrite) => OperandFlags::READ | OperandFlags::WRITE,
        None => OperandFlags::empty(),
    }
}

/// Fold the `segment:offset` immediate pair of an x86 far jump or call into
/// one absolute operand.
fn far_pointer(operands: &[(OperandFlags, OperandKind)]) -> Option<(OperandFlags, OperandKind)> {
    match operands {
        [(flags, OperandKind::Immediate(segment)), (_, OperandKind::Immediate(offset))] => Some((
            *flags,
            OperandKind::Absolute {
                segment: segment.unsigned as u16,
                offset: offset.unsigned,
            },
        )),
        _ => None,
    }
}

/// Pair each operand with its slice of the operand text.
fn with_text(operands: Vec<(OperandFlags, OperandKind)>, op_str: &str) -> Vec<DecodedOperand> {
    let texts = split_operands(op_str);

    operands
        .into_iter()
        .enumerate()
        .map(|(i, (flags, kind))| DecodedOperand::new(texts.get(i).copied().unwrap_or(""), flags, kind))
        .collect()
}

/// Split an operand string on commas outside brackets and parentheses.
///
/// A register list such as `{r4, lr}` yields one part per register.
fn split_operands(op_str: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in op_str.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(trim_list_braces(&op_str[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }

    let last = trim_list_braces(&op_str[start..]);
    if !last.is_empty() {
        parts.push(last);
    }

    parts
}

/// Drop the braces a register list wraps around its first and last entries.
/// Decorations like the x86 `{k1}` mask stay attached.
fn trim_list_braces(part: &str) -> &str {
    let part = part.trim();
    let part = part.strip_prefix('{').map_or(part, str::trim_start);
    if part.contains('{') {
        part
    } else {
        part.strip_suffix('}').map_or(part, str::trim_end)
    }
}
