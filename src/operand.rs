//! Decoded operand descriptors.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::Ternary;

/// Kind of a decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    /// A register
    Register,
    /// An immediate value
    Immediate,
    /// An absolute address
    Address,
    /// Anything the decoder could not put in one of the other kinds
    Unknown,
}

impl fmt::Display for OperandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandType::Register => write!(f, "register"),
            OperandType::Immediate => write!(f, "immediate"),
            OperandType::Address => write!(f, "address"),
            OperandType::Unknown => write!(f, "unknown"),
        }
    }
}

/// One operand of a decoded instruction.
///
/// Operands are built once by the disassembler and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    encoding: String,
    is_target: Ternary,
    #[serde(rename = "type")]
    ty: OperandType,
    value: u64,
}

impl Operand {
    /// Create a new operand
    pub fn new(encoding: impl Into<String>, is_target: Ternary, ty: OperandType, value: u64) -> Self {
        Self {
            encoding: encoding.into(),
            is_target,
            ty,
            value,
        }
    }

    /// Operand text as produced by the decoder
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Whether the instruction writes this operand
    pub fn is_target(&self) -> Ternary {
        self.is_target
    }

    pub fn ty(&self) -> OperandType {
        self.ty
    }

    /// Numeric value; only meaningful for immediates and addresses, zero otherwise
    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_accessors() {
        let op = Operand::new("0x20", Ternary::False, OperandType::Immediate, 0x20);

        assert_eq!(op.encoding(), "0x20");
        assert_eq!(op.is_target(), Ternary::False);
        assert_eq!(op.ty(), OperandType::Immediate);
        assert_eq!(op.value(), 0x20);
    }

    #[test]
    fn test_operand_json_shape() {
        let op = Operand::new("eax", Ternary::True, OperandType::Register, 0);
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["encoding"], "eax");
        assert_eq!(json["type"], "Register");
        assert_eq!(json["is_target"], "True");
        assert_eq!(json["value"], 0);
    }

    #[test]
    fn test_operand_type_display() {
        assert_eq!(OperandType::Address.to_string(), "address");
        assert_eq!(OperandType::Unknown.to_string(), "unknown");
    }
}
