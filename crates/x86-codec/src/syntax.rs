//! Operand-level AST for parsed assembly instructions.
//!
//! Both directions of the codec meet here: the parser produces an
//! [`AstInstr`] from text, the decoder produces one from bytes, and the
//! `Display` impls render either back into assembly syntax.

use std::fmt;

// ---------------------------------------------------------------------------
//  Operand sizes
// ---------------------------------------------------------------------------

/// Operand size class. `S16Or32` is resolved to 16 or 32 bits by the
/// operand-size mode active for the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SizeClass {
    S8,
    S16,
    S32,
    S16Or32,
}

impl SizeClass {
    /// The reference-manual spelling used in template signatures.
    pub fn spelling(self) -> &'static str {
        match self {
            SizeClass::S8 => "8",
            SizeClass::S16 => "16",
            SizeClass::S32 => "32",
            SizeClass::S16Or32 => "16/32",
        }
    }

    /// Concrete bit width. `S16Or32` counts as 32.
    pub fn bit_size(self) -> u32 {
        match self {
            SizeClass::S8 => 8,
            SizeClass::S16 => 16,
            SizeClass::S32 | SizeClass::S16Or32 => 32,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spelling())
    }
}

/// Default operand width of the instruction set, toggled by the 0x66
/// operand-size override prefix. This is the only configuration surface of
/// the codec; every entry point threads it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperandWidth {
    Bits16,
    Bits32,
}

impl OperandWidth {
    /// The other width.
    pub fn flipped(self) -> OperandWidth {
        match self {
            OperandWidth::Bits16 => OperandWidth::Bits32,
            OperandWidth::Bits32 => OperandWidth::Bits16,
        }
    }

    /// The concrete size class of this width.
    pub fn size(self) -> SizeClass {
        match self {
            OperandWidth::Bits16 => SizeClass::S16,
            OperandWidth::Bits32 => SizeClass::S32,
        }
    }

    /// Resolve a possibly width-dependent size class to a concrete one.
    pub fn resolve(self, size: SizeClass) -> SizeClass {
        match size {
            SizeClass::S16Or32 => self.size(),
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
//  Instruction AST
// ---------------------------------------------------------------------------

/// A parsed (or decoded) instruction: mnemonic plus operand list.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AstInstr {
    pub name: String,
    pub operands: Vec<AstOperand>,
}

/// A single instruction operand.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AstOperand {
    Register(String),
    Immediate(i64),
    EffectiveAddress(MemoryOperand),
}

/// A memory operand: `size [base + index*scale + displacement]`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemoryOperand {
    pub size: SizeClass,
    pub base: Option<String>,
    pub index: Option<IndexExpr>,
    pub displacement: i64,
}

/// A scaled index register. Scale is always one of 1, 2, 4, 8.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndexExpr {
    pub register: String,
    pub scale: u8,
}

// ---------------------------------------------------------------------------
//  Display rendering
// ---------------------------------------------------------------------------

/// Integer display convention: decimal below 1000, lowercase hex with a
/// trailing `h` otherwise.
pub fn display_int(value: i64) -> String {
    if value < 1000 {
        value.to_string()
    } else {
        format!("{value:x}h")
    }
}

impl fmt::Display for AstInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operands: Vec<String> = self.operands.iter().map(|o| o.to_string()).collect();
        write!(f, "{} {}", self.name, operands.join(", "))
    }
}

impl fmt::Display for AstOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstOperand::Register(name) => f.write_str(name),
            AstOperand::Immediate(value) => f.write_str(&display_int(*value)),
            AstOperand::EffectiveAddress(memory) => memory.fmt(f),
        }
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self.size {
            SizeClass::S8 => "BYTEPTR ",
            SizeClass::S16 => "WORDPTR ",
            _ => "",
        };
        let mut terms: Vec<String> = Vec::new();
        if let Some(base) = &self.base {
            terms.push(base.clone());
        }
        if let Some(index) = &self.index {
            terms.push(format!("{}*{}", index.register, index.scale));
        }
        if self.displacement != 0 {
            terms.push(display_int(self.displacement));
        }
        let mut inner = String::new();
        for (i, term) in terms.iter().enumerate() {
            // A negative displacement carries its own sign.
            if i > 0 && !term.starts_with('-') {
                inner.push('+');
            }
            inner.push_str(term);
        }
        write!(f, "{keyword}[{inner}]")
    }
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_int_decimal_and_hex() {
        assert_eq!(display_int(10), "10");
        assert_eq!(display_int(999), "999");
        assert_eq!(display_int(0x1234), "1234h");
        assert_eq!(display_int(-4), "-4");
    }

    #[test]
    fn test_resolve_width() {
        assert_eq!(OperandWidth::Bits32.resolve(SizeClass::S16Or32), SizeClass::S32);
        assert_eq!(OperandWidth::Bits16.resolve(SizeClass::S16Or32), SizeClass::S16);
        assert_eq!(OperandWidth::Bits16.resolve(SizeClass::S8), SizeClass::S8);
    }

    #[test]
    fn test_instr_display() {
        let instr = AstInstr {
            name: "MOV".to_string(),
            operands: vec![
                AstOperand::Register("EAX".to_string()),
                AstOperand::Immediate(10),
            ],
        };
        assert_eq!(instr.to_string(), "MOV EAX, 10");
    }

    #[test]
    fn test_memory_display_full() {
        let memory = MemoryOperand {
            size: SizeClass::S16,
            base: Some("ESI".to_string()),
            index: Some(IndexExpr { register: "EAX".to_string(), scale: 4 }),
            displacement: 0x100,
        };
        assert_eq!(memory.to_string(), "WORDPTR [ESI+EAX*4+100h]");
    }

    #[test]
    fn test_memory_display_negative_displacement() {
        let memory = MemoryOperand {
            size: SizeClass::S32,
            base: Some("EBP".to_string()),
            index: None,
            displacement: -8,
        };
        assert_eq!(memory.to_string(), "[EBP-8]");
    }

    #[test]
    fn test_memory_display_displacement_only() {
        let memory = MemoryOperand {
            size: SizeClass::S8,
            base: None,
            index: None,
            displacement: 0x2000,
        };
        assert_eq!(memory.to_string(), "BYTEPTR [2000h]");
    }
}
