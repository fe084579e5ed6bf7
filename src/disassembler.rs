//! Disassembly engine: stages bytes, drives a linear pass and classifies
//! every instruction the decoder reports.

use crate::decoder::{
    CapstoneDecoder, DecodeStatus, DecodedInsn, DecodedOperand, Decoder, InsnCategory, OperandFlags, OperandKind,
};
use crate::{Address, Architecture, DisassemblyError, Instruction, InstructionType, Operand, OperandType, Ternary};

/// A disassembler owning one decoder instance.
///
/// Each call to [`execute`](Self::execute) runs a full pass on the calling
/// thread and returns a freshly built list. Nothing about a pass is kept on
/// the engine once the call returns.
///
/// # Example
///
/// ```rust,no_run
/// use isa_lens::{Architecture, Disassembler};
///
/// let mut disasm = Disassembler::for_architecture(Architecture::X86_64).unwrap();
///
/// // jmp +0x1e, landing 0x20 bytes past the load address
/// let insns = disasm.execute(&[0xeb, 0x1e], 0x40_0000);
/// assert_eq!(insns[0].target_address(), 0x40_0020);
/// ```
#[derive(Debug)]
pub struct Disassembler<D> {
    decoder: D,
}

impl<D: Decoder> Disassembler<D> {
    pub fn new(decoder: D) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Consume the engine and hand back its decoder
    pub fn into_decoder(self) -> D {
        self.decoder
    }

    /// Disassemble `data`, loaded at `base_address`.
    pub fn execute(&mut self, data: &[u8], base_address: Address) -> Vec<Instruction> {
        self.execute_sized(Some(data), data.len(), base_address)
    }

    /// Disassemble `size` bytes of `data`, loaded at `base_address`.
    ///
    /// A missing buffer or a zero size yields an empty list without touching
    /// the decoder. If fewer than `size` bytes can be staged, the pass is
    /// skipped and the list is empty as well; use
    /// [`try_execute`](Self::try_execute) to tell that case apart.
    pub fn execute_sized(&mut self, data: Option<&[u8]>, size: usize, base_address: Address) -> Vec<Instruction> {
        match self.try_execute(data, size, base_address) {
            Ok(insns) => insns,
            Err(e) => {
                log::warn!("Skipping disassembly at 0x{:x}: {}", base_address, e);
                Vec::new()
            }
        }
    }

    /// Like [`execute_sized`](Self::execute_sized), but reports a short
    /// staging transfer as [`DisassemblyError::ShortStage`].
    pub fn try_execute(
        &mut self,
        data: Option<&[u8]>,
        size: usize,
        base_address: Address,
    ) -> Result<Vec<Instruction>, DisassemblyError> {
        let data = match data {
            Some(data) if size > 0 => data,
            _ => return Ok(Vec::new()),
        };

        let mut buffer = self.decoder.alloc_buffer(size);
        let staged = self.decoder.fill_buffer(&mut buffer, 0, &data[..size.min(data.len())]);
        if staged != size {
            return Err(DisassemblyError::ShortStage { expected: size, staged });
        }

        log::debug!("Disassembling {} bytes at 0x{:x}", size, base_address);

        let mut sink = DecodeSink::new();
        debug_assert!(sink.is_idle());
        sink.open(base_address);
        self.decoder.disasm_linear(&buffer, 0, size, &mut |insn: &DecodedInsn| sink.display(insn));
        let insns = sink.close();

        log::debug!("Decoded {} instructions at 0x{:x}", insns.len(), base_address);

        Ok(insns)
    }
}

impl Disassembler<CapstoneDecoder> {
    /// Create an engine over a Capstone decoder for `architecture`
    pub fn for_architecture(architecture: Architecture) -> Result<Self, DisassemblyError> {
        let decoder = CapstoneDecoder::for_architecture(architecture)?;
        Ok(Self::new(decoder))
    }
}

/// Receives decoder callbacks for the duration of one pass.
///
/// The sink is idle until [`open`](Self::open) registers a result list and
/// base address, and idle again after [`close`](Self::close) hands the list
/// back.
#[derive(Debug, Default)]
pub(crate) struct DecodeSink {
    list: Option<Vec<Instruction>>,
    base_address: Address,
}

impl DecodeSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.list.is_none()
    }

    pub(crate) fn open(&mut self, base_address: Address) {
        self.list = Some(Vec::new());
        self.base_address = base_address;
    }

    pub(crate) fn close(&mut self) -> Vec<Instruction> {
        self.base_address = 0;
        self.list.take().unwrap_or_default()
    }

    /// Classify one decoded instruction and append it to the open list.
    ///
    /// # Panics
    /// If no list is open. Reaching this outside a pass is a lifecycle bug in
    /// the engine, not bad input.
    pub(crate) fn display(&mut self, insn: &DecodedInsn) {
        let instruction = translate(insn, self.base_address);
        match self.list.as_mut() {
            Some(list) => list.push(instruction),
            None => panic!("no open result list while displaying instruction at offset 0x{:x}", insn.offset),
        }
    }
}

/// Map one decoder descriptor onto an [`Instruction`].
fn translate(insn: &DecodedInsn, base_address: Address) -> Instruction {
    let address = base_address.wrapping_add(insn.offset);
    let mut target_address = address;
    let mut ty = InstructionType::Unknown;
    let mut privileged = Ternary::Unknown;

    if insn.status.contains(DecodeStatus::MNEMONIC_FLAGS) {
        (ty, privileged) = classify(insn.category);
    }

    let operands_decoded = insn.status.contains(DecodeStatus::OPERANDS);

    if operands_decoded {
        if let Some(target) = &insn.target {
            match target.kind {
                OperandKind::Immediate(imm) => target_address = base_address.wrapping_add(imm.vma),
                // Flat address space: absolute targets need no base adjustment
                OperandKind::Absolute { offset, .. } => target_address = offset,
                _ => {}
            }
        }
    }

    let mut instruction = Instruction::new(address, target_address, ty, insn.ascii.as_str(), privileged);

    if operands_decoded {
        for op in &insn.operands {
            instruction.add_operand(convert_operand(op));
        }
    }

    instruction
}

/// Instruction type and privilege for a decoder category.
fn classify(category: InsnCategory) -> (InstructionType, Ternary) {
    match category {
        InsnCategory::ControlFlow => (InstructionType::ControlFlow, Ternary::False),
        InsnCategory::Stack | InsnCategory::LoadStore => (InstructionType::DataHandling, Ternary::False),
        InsnCategory::Test | InsnCategory::Math | InsnCategory::Bit => {
            (InstructionType::ArithmeticLogic, Ternary::False)
        }
        InsnCategory::Privileged => (InstructionType::Other, Ternary::True),
        _ => (InstructionType::Other, Ternary::False),
    }
}

fn convert_operand(op: &DecodedOperand) -> Operand {
    let is_target = if op.flags.is_empty() {
        Ternary::Unknown
    } else {
        op.flags.contains(OperandFlags::WRITE).into()
    };

    let (ty, value) = match op.kind {
        OperandKind::Register(_) => (OperandType::Register, 0),
        OperandKind::Immediate(imm) => (OperandType::Immediate, imm.unsigned),
        OperandKind::Absolute { offset, .. } => (OperandType::Address, offset),
        OperandKind::Memory | OperandKind::Unknown => (OperandType::Unknown, 0),
    };

    Operand::new(op.ascii.as_str(), is_target, ty, value)
}
