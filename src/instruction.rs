//! Decoded instructions and their ISA-agnostic classification.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::{Address, Operand, Ternary};

/// Coarse, ISA-independent instruction class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionType {
    /// Jumps, calls, returns and other branches
    ControlFlow,
    /// Loads, stores, moves and stack manipulation
    DataHandling,
    /// Tests, arithmetic and bitwise operations
    ArithmeticLogic,
    /// Recognized by the decoder but outside the other classes
    Other,
    /// The decoder reported no mnemonic information
    Unknown,
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstructionType::ControlFlow => write!(f, "control-flow"),
            InstructionType::DataHandling => write!(f, "data-handling"),
            InstructionType::ArithmeticLogic => write!(f, "arithmetic-logic"),
            InstructionType::Other => write!(f, "other"),
            InstructionType::Unknown => write!(f, "unknown"),
        }
    }
}

/// One decoded instruction.
///
/// The operand list keeps the order the decoder reported. The first operand
/// is not necessarily the source or the destination; use
/// [`Operand::is_target`] to tell written operands apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    address: Address,
    target_address: Address,
    #[serde(rename = "type")]
    ty: InstructionType,
    encoding: String,
    privileged: Ternary,
    operands: Vec<Operand>,
}

impl Instruction {
    /// Create an instruction with an empty operand list
    pub fn new(
        address: Address,
        target_address: Address,
        ty: InstructionType,
        encoding: impl Into<String>,
        privileged: Ternary,
    ) -> Self {
        Self {
            address,
            target_address,
            ty,
            encoding: encoding.into(),
            privileged,
            operands: Vec::new(),
        }
    }

    /// Append an operand in decode order.
    pub(crate) fn add_operand(&mut self, op: Operand) {
        self.operands.push(op);
    }

    /// Absolute address of the first byte of the instruction
    pub fn address(&self) -> Address {
        self.address
    }

    /// Resolved branch target.
    ///
    /// Equal to [`address`](Self::address) when the instruction does not
    /// branch or its target could not be resolved.
    pub fn target_address(&self) -> Address {
        self.target_address
    }

    pub fn ty(&self) -> InstructionType {
        self.ty
    }

    /// Whether the instruction requires elevated privilege
    pub fn privileged(&self) -> Ternary {
        self.privileged
    }

    /// Disassembly text
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Operands in decoder order
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn is_control_flow(&self) -> bool {
        self.ty == InstructionType::ControlFlow
    }

    /// Returns true if a branch target distinct from the instruction itself was resolved
    pub fn has_branch_target(&self) -> bool {
        self.target_address != self.address
    }

    /// Operands the decoder definitely reported as written
    pub fn written_operands(&self) -> impl Iterator<Item = &Operand> {
        self.operands.iter().filter(|op| op.is_target().is_true())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperandType;

    #[test]
    fn test_new_instruction_has_no_operands() {
        let insn = Instruction::new(0x1000, 0x1000, InstructionType::Other, "nop", Ternary::False);

        assert_eq!(insn.address(), 0x1000);
        assert_eq!(insn.target_address(), 0x1000);
        assert_eq!(insn.encoding(), "nop");
        assert!(insn.operands().is_empty());
        assert!(!insn.has_branch_target());
        assert!(!insn.is_control_flow());
    }

    #[test]
    fn test_operand_order_is_preserved() {
        let mut insn = Instruction::new(0x40, 0x40, InstructionType::ArithmeticLogic, "add eax, ebx", Ternary::False);
        insn.add_operand(Operand::new("eax", Ternary::True, OperandType::Register, 0));
        insn.add_operand(Operand::new("ebx", Ternary::False, OperandType::Register, 0));

        let names: Vec<_> = insn.operands().iter().map(|op| op.encoding()).collect();
        assert_eq!(names, ["eax", "ebx"]);

        let written: Vec<_> = insn.written_operands().map(|op| op.encoding()).collect();
        assert_eq!(written, ["eax"]);
    }

    #[test]
    fn test_branch_target() {
        let insn = Instruction::new(0x1000, 0x1020, InstructionType::ControlFlow, "jmp 0x20", Ternary::False);

        assert!(insn.is_control_flow());
        assert!(insn.has_branch_target());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = Instruction::new(0, 0, InstructionType::Unknown, "", Ternary::Unknown);
        let b = a.clone();
        a.add_operand(Operand::new("r0", Ternary::Unknown, OperandType::Register, 0));

        assert_eq!(a.operands().len(), 1);
        assert!(b.operands().is_empty());
    }

    #[test]
    fn test_instruction_type_display() {
        assert_eq!(InstructionType::ControlFlow.to_string(), "control-flow");
        assert_eq!(InstructionType::ArithmeticLogic.to_string(), "arithmetic-logic");
    }
}
