//! ISA-agnostic instruction model over a linear disassembly pass.
//!
//! This library turns a buffer of machine code at a known load address into
//! a list of [`Instruction`]s with a small, stable classification
//! ([`InstructionType`]), a privilege [`Ternary`] and structured
//! [`Operand`]s. Byte-level decoding is delegated to a [`Decoder`]; the
//! bundled [`CapstoneDecoder`] wraps the Capstone engine.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use isa_lens::{Architecture, Disassembler, InstructionType};
//!
//! // Raw code bytes and the address they are loaded at
//! let code = [0x55, 0x48, 0x89, 0xe5, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3];
//! let base = 0x40_1000;
//!
//! let mut disasm = Disassembler::for_architecture(Architecture::X86_64).unwrap();
//!
//! for insn in disasm.execute(&code, base) {
//!     if insn.ty() == InstructionType::ControlFlow {
//!         println!("0x{:x}: {} -> 0x{:x}", insn.address(), insn.encoding(), insn.target_address());
//!     }
//! }
//! ```

pub mod decoder;
pub mod disassembler;
pub mod instruction;
pub mod operand;

pub use decoder::{CapstoneDecoder, Decoder, DecoderError};
pub use disassembler::Disassembler;
pub use instruction::{Instruction, InstructionType};
pub use operand::{Operand, OperandType};

use std::fmt;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Represents an address in memory
pub type Address = u64;

/// Three-valued logic: a decoder may know a fact is true, know it is false,
/// or not know at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Ternary {
    True,
    False,
    #[default]
    Unknown,
}

impl Ternary {
    /// `Some(bool)` when known, `None` when unknown
    pub fn as_option(self) -> Option<bool> {
        match self {
            Ternary::True => Some(true),
            Ternary::False => Some(false),
            Ternary::Unknown => None,
        }
    }

    pub fn is_true(self) -> bool {
        self == Ternary::True
    }

    pub fn is_known(self) -> bool {
        self != Ternary::Unknown
    }
}

impl From<bool> for Ternary {
    fn from(value: bool) -> Self {
        if value {
            Ternary::True
        } else {
            Ternary::False
        }
    }
}

impl From<Option<bool>> for Ternary {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Ternary::Unknown, Ternary::from)
    }
}

impl fmt::Display for Ternary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ternary::True => write!(f, "true"),
            Ternary::False => write!(f, "false"),
            Ternary::Unknown => write!(f, "unknown"),
        }
    }
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    #[value(name = "x86-32")]
    X86_32,
    /// 64-bit x86
    #[value(name = "x86-64")]
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// ARM Thumb mode
    Thumb,
    /// AArch64 (ARM 64-bit)
    #[value(name = "aarch64")]
    AArch64,
    /// MIPS 32-bit
    #[value(name = "mips32")]
    Mips32,
    /// RISC-V 32-bit
    #[value(name = "riscv32")]
    RiscV32,
    /// RISC-V 64-bit
    #[value(name = "riscv64")]
    RiscV64,
    /// PowerPC 32-bit
    #[value(name = "ppc32")]
    Ppc32,
    /// Unknown architecture
    #[value(skip)]
    Unknown,
}

impl Architecture {
    /// Width of a code address, in bits
    pub fn address_bits(self) -> u32 {
        match self {
            Architecture::X86_32
            | Architecture::Arm
            | Architecture::Thumb
            | Architecture::Mips32
            | Architecture::RiscV32
            | Architecture::Ppc32 => 32,
            Architecture::X86_64 | Architecture::AArch64 | Architecture::RiscV64 | Architecture::Unknown => 64,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Thumb => write!(f, "Thumb"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Mips32 => write!(f, "MIPS32"),
            Architecture::RiscV32 => write!(f, "RISC-V 32"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
            Architecture::Ppc32 => write!(f, "PowerPC 32"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for disassembly operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Decoder error
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    /// The decoder could not stage the whole input
    #[error("Staged {staged} of {expected} bytes")]
    ShortStage {
        expected: usize,
        staged: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ternary_conversions() {
        assert_eq!(Ternary::from(true), Ternary::True);
        assert_eq!(Ternary::from(false), Ternary::False);
        assert_eq!(Ternary::from(None), Ternary::Unknown);
        assert_eq!(Ternary::Unknown.as_option(), None);
        assert_eq!(Ternary::False.as_option(), Some(false));
        assert!(!Ternary::Unknown.is_known());
        assert_eq!(Ternary::default(), Ternary::Unknown);
    }

    #[test]
    fn test_architecture_value_names() {
        assert_eq!(Architecture::from_str("x86-64", true), Ok(Architecture::X86_64));
        assert_eq!(Architecture::from_str("AARCH64", true), Ok(Architecture::AArch64));
        assert_eq!(Architecture::from_str("riscv32", false), Ok(Architecture::RiscV32));
        assert!(Architecture::from_str("unknown", true).is_err());
    }

    #[test]
    fn test_architecture_display() {
        assert_eq!(Architecture::X86_64.to_string(), "x86-64");
        assert_eq!(Architecture::Ppc32.to_string(), "PowerPC 32");
    }

    #[test]
    fn test_architecture_address_bits() {
        assert_eq!(Architecture::X86_32.address_bits(), 32);
        assert_eq!(Architecture::Thumb.address_bits(), 32);
        assert_eq!(Architecture::AArch64.address_bits(), 64);
        assert_eq!(Architecture::RiscV64.address_bits(), 64);
    }

    #[test]
    fn test_decoder_error_converts() {
        let err: DisassemblyError = DecoderError::UnsupportedArchitecture(Architecture::Unknown).into();
        assert_eq!(err.to_string(), "Decoder error: Unsupported architecture: Unknown");
    }

    #[test]
    fn test_short_stage_message() {
        let err = DisassemblyError::ShortStage { expected: 5, staged: 2 };
        assert_eq!(err.to_string(), "Staged 2 of 5 bytes");
    }
}
