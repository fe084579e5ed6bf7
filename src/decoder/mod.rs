//! The external decoding engine contract.
//!
//! A [`Decoder`] turns raw bytes into [`DecodedInsn`] descriptors during a
//! linear pass. Descriptors use the engine's own vocabulary: a category per
//! instruction, and a kind plus a flag set per operand. Mapping that
//! vocabulary onto [`Instruction`](crate::Instruction) and
//! [`Operand`](crate::Operand) is the job of the
//! [`Disassembler`](crate::Disassembler).

mod capstone_decoder;

pub use self::capstone_decoder::*;

use bitflags::bitflags;

bitflags! {
    /// What the decoder managed to decode for one instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DecodeStatus: u8 {
        /// Mnemonic and category information is valid
        const MNEMONIC_FLAGS = 0x01;
        /// Operand information is valid
        const OPERANDS = 0x02;
    }
}

bitflags! {
    /// Access flags reported for one operand.
    ///
    /// An empty set means the decoder reported nothing about the access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperandFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
    }
}

/// Instruction category as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InsnCategory {
    #[default]
    Unknown,
    /// Branches, calls, returns
    ControlFlow,
    /// Push, pop and other stack manipulation
    Stack,
    /// Loads, stores and register moves
    LoadStore,
    /// Comparisons
    Test,
    Math,
    Bit,
    Io,
    /// Software interrupts and traps
    Trap,
    Privileged,
    Nop,
    Float,
    /// Recognized, but in none of the other categories
    General,
}

/// Immediate operand value in the forms the decoder reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Immediate {
    pub signed: i64,
    pub unsigned: u64,
    /// Buffer-relative address the immediate designates, for branch targets
    pub vma: u64,
}

impl Immediate {
    /// Build an immediate from a raw signed value; all three views share the bits.
    pub fn from_signed(value: i64) -> Self {
        Self {
            signed: value,
            unsigned: value as u64,
            vma: value as u64,
        }
    }
}

/// Operand category together with its category-specific value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Register, by decoder-specific id
    Register(u16),
    Immediate(Immediate),
    /// Direct `segment:offset` address, such as a far jump destination.
    /// The offset is already in the flat address space.
    Absolute { segment: u16, offset: u64 },
    /// Memory reference; the address it resolves to is not known at decode time
    Memory,
    Unknown,
}

/// One operand as reported by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOperand {
    pub ascii: String,
    pub flags: OperandFlags,
    pub kind: OperandKind,
}

impl DecodedOperand {
    pub fn new(ascii: impl Into<String>, flags: OperandFlags, kind: OperandKind) -> Self {
        Self {
            ascii: ascii.into(),
            flags,
            kind,
        }
    }
}

/// One instruction as reported by the decoder's linear pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInsn {
    /// Byte offset of the instruction within the staged buffer
    pub offset: u64,
    /// Size of the instruction in bytes
    pub size: usize,
    /// Full disassembly text
    pub ascii: String,
    pub status: DecodeStatus,
    pub category: InsnCategory,
    /// The operand carrying the branch destination, if any
    pub target: Option<DecodedOperand>,
    pub operands: Vec<DecodedOperand>,
}

/// Scratch buffer the decoder reads from during a pass.
///
/// The buffer has a fixed size chosen at allocation and is released when
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchBuffer {
    bytes: Vec<u8>,
}

impl ScratchBuffer {
    /// Allocate a zeroed buffer of `size` bytes
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    /// Copy `data` to `offset`, returning the number of bytes transferred.
    ///
    /// Copies only what fits; an offset past the end transfers nothing.
    pub fn fill(&mut self, offset: usize, data: &[u8]) -> usize {
        let Some(room) = self.bytes.len().checked_sub(offset) else {
            return 0;
        };
        let n = room.min(data.len());
        self.bytes[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// External decoding engine.
///
/// Implementors are initialized on construction and terminated on drop.
/// The display callback is supplied per pass, so no callback state outlives
/// a call.
pub trait Decoder {
    /// Allocate a scratch buffer of `size` bytes.
    fn alloc_buffer(&self, size: usize) -> ScratchBuffer {
        ScratchBuffer::new(size)
    }

    /// Stage `data` into `buffer` at `offset`.
    ///
    /// # Returns
    /// The number of bytes actually transferred
    fn fill_buffer(&self, buffer: &mut ScratchBuffer, offset: usize, data: &[u8]) -> usize {
        buffer.fill(offset, data)
    }

    /// Run a linear disassembly pass over `len` bytes of `buffer` starting at `start`.
    ///
    /// `display` is called synchronously, once per recognized instruction and
    /// in offset order. Bytes that do not decode produce no call.
    fn disasm_linear(
        &mut self,
        buffer: &ScratchBuffer,
        start: usize,
        len: usize,
        display: &mut dyn FnMut(&DecodedInsn),
    );
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted decoder used by the engine tests.

    use std::cell::Cell;

    use super::*;

    /// Replays canned descriptors whose offsets fall inside the pass range.
    #[derive(Debug, Default)]
    pub struct MockDecoder {
        pub script: Vec<DecodedInsn>,
        /// Caps every staging transfer, to simulate a short fill
        pub fill_limit: Option<usize>,
        pub passes: usize,
        pub fills: Cell<usize>,
        /// Buffer contents seen by the last pass
        pub last_buffer: Vec<u8>,
    }

    impl MockDecoder {
        pub fn new(script: Vec<DecodedInsn>) -> Self {
            Self {
                script,
                ..Self::default()
            }
        }
    }

    impl Decoder for MockDecoder {
        fn fill_buffer(&self, buffer: &mut ScratchBuffer, offset: usize, data: &[u8]) -> usize {
            self.fills.set(self.fills.get() + 1);
            let data = match self.fill_limit {
                Some(limit) => &data[..limit.min(data.len())],
                None => data,
            };
            buffer.fill(offset, data)
        }

        fn disasm_linear(
            &mut self,
            buffer: &ScratchBuffer,
            start: usize,
            len: usize,
            display: &mut dyn FnMut(&DecodedInsn),
        ) {
            self.passes += 1;
            self.last_buffer = buffer.as_slice().to_vec();
            let range = start as u64..(start + len) as u64;
            for insn in self.script.iter().filter(|i| range.contains(&i.offset)) {
                display(insn);
            }
        }
    }

    /// Descriptor with mnemonic flags and operands decoded
    pub fn insn(offset: u64, size: usize, ascii: &str, category: InsnCategory) -> DecodedInsn {
        DecodedInsn {
            offset,
            size,
            ascii: ascii.to_string(),
            status: DecodeStatus::MNEMONIC_FLAGS | DecodeStatus::OPERANDS,
            category,
            target: None,
            operands: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_fill_exact() {
        let mut buf = ScratchBuffer::new(4);
        assert_eq!(buf.fill(0, &[1, 2, 3, 4]), 4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_scratch_fill_truncates() {
        let mut buf = ScratchBuffer::new(3);
        assert_eq!(buf.fill(1, &[9, 9, 9]), 2);
        assert_eq!(buf.as_slice(), &[0, 9, 9]);
        assert_eq!(buf.fill(7, &[1]), 0);
    }

    #[test]
    fn test_immediate_views() {
        let imm = Immediate::from_signed(-1);
        assert_eq!(imm.unsigned, u64::MAX);
        assert_eq!(imm.vma, u64::MAX);
    }
}
