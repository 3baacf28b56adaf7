//! Instruction catalog — the static table of machine-instruction templates.
//!
//! Each template pairs an opcode pattern with the operand shapes it encodes.
//! The catalog is built once at first use and is read-only afterwards; both
//! the matcher and the decoder trie resolve ambiguity by catalog order, so
//! the table order is load-bearing.
//!
//! Opcode and operand data taken from the Intel SDM as published at
//! <http://www.felixcloutier.com/x86/>.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::syntax::SizeClass;

// ---------------------------------------------------------------------------
//  Opcode pattern
// ---------------------------------------------------------------------------

/// One step of an opcode pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OpcodeStep {
    /// A literal opcode byte.
    Fixed(u8),
    /// An opcode byte whose low 3 bits embed a register number
    /// (8 concrete byte values, `base | 0..=7`).
    WithRegister(u8),
    /// A ModRM byte whose reg field selects among opcode variants
    /// instead of naming an operand.
    Extension(u8),
    /// A ModRM byte whose reg field is a genuine register operand.
    ModRm,
}

// ---------------------------------------------------------------------------
//  Operand templates
// ---------------------------------------------------------------------------

/// A register that appears by name in an operand template (implicit operand).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FixedRegName {
    Ax,
    Al,
    Dx,
}

/// The operand shape a template slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperandKind {
    /// A general register of the given size (`r8`, `r16/32`, ...).
    Reg(SizeClass),
    /// A specific register (`AL`, `E_AX`, `DX`).
    FixedReg(SizeClass, FixedRegName),
    /// Register or memory (`r/m8`, `r/m16/32`, ...).
    RegMem(SizeClass),
    /// An immediate value (`imm8`, `imm16/32`, ...).
    Imm(SizeClass),
    /// A relative branch offset (`rel16/32`).
    Rel(SizeClass),
    /// A form outside the supported scope (`sreg`, `moffs*`, bare `m`).
    /// Kept so the opcodes still branch in the decoder trie, but never
    /// matched and never decoded.
    Unsupported,
}

/// Display name of a fixed register at a concrete size.
pub fn fixed_reg_display(size: SizeClass, name: FixedRegName) -> &'static str {
    match name {
        FixedRegName::Ax => {
            if size == SizeClass::S16 {
                "AX"
            } else {
                "EAX"
            }
        }
        FixedRegName::Al => "AL",
        FixedRegName::Dx => "DX",
    }
}

impl OperandKind {
    /// Parse a reference-manual spelling into an operand template.
    fn from_spelling(spelling: &str) -> OperandKind {
        if let Some(rest) = spelling.strip_prefix("r/m") {
            return size_of(rest).map_or(OperandKind::Unsupported, OperandKind::RegMem);
        }
        if let Some(rest) = spelling.strip_prefix("rel") {
            return size_of(rest).map_or(OperandKind::Unsupported, OperandKind::Rel);
        }
        if let Some(rest) = spelling.strip_prefix("imm") {
            return size_of(rest).map_or(OperandKind::Unsupported, OperandKind::Imm);
        }
        if let Some(rest) = spelling.strip_prefix('r') {
            if let Some(size) = size_of(rest) {
                return OperandKind::Reg(size);
            }
        }
        match spelling {
            "E_AX" => OperandKind::FixedReg(SizeClass::S16Or32, FixedRegName::Ax),
            "EAX" => OperandKind::FixedReg(SizeClass::S32, FixedRegName::Ax),
            "AX" => OperandKind::FixedReg(SizeClass::S16, FixedRegName::Ax),
            "AL" => OperandKind::FixedReg(SizeClass::S8, FixedRegName::Al),
            "DX" => OperandKind::FixedReg(SizeClass::S16, FixedRegName::Dx),
            _ => OperandKind::Unsupported,
        }
    }

    /// The reference-manual spelling used in signatures.
    pub fn spelling(self) -> String {
        match self {
            OperandKind::Reg(size) => format!("r{size}"),
            OperandKind::RegMem(size) => format!("r/m{size}"),
            OperandKind::Imm(size) => format!("imm{size}"),
            OperandKind::Rel(size) => format!("rel{size}"),
            OperandKind::FixedReg(size, name) => fixed_reg_display(size, name).to_string(),
            OperandKind::Unsupported => "<error>".to_string(),
        }
    }
}

fn size_of(text: &str) -> Option<SizeClass> {
    match text {
        "8" => Some(SizeClass::S8),
        "16" => Some(SizeClass::S16),
        "32" => Some(SizeClass::S32),
        "16/32" => Some(SizeClass::S16Or32),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
//  Templates
// ---------------------------------------------------------------------------

/// An instruction template: opcode pattern, mnemonic, operand templates.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InsnTemplate {
    pub pattern: Vec<OpcodeStep>,
    pub mnemonic: String,
    pub operands: Vec<OperandKind>,
}

impl InsnTemplate {
    /// Canonical signature string, e.g. `MOV r/m16/32,imm16/32`.
    pub fn signature(&self) -> String {
        let operands: Vec<String> = self.operands.iter().map(|o| o.spelling()).collect();
        format!("{} {}", self.mnemonic, operands.join(","))
    }
}

// ---------------------------------------------------------------------------
//  Catalog
// ---------------------------------------------------------------------------

/// The ordered template table plus a by-mnemonic index.
#[derive(Debug)]
pub struct InsnCatalog {
    templates: Vec<InsnTemplate>,
    by_name: HashMap<String, Vec<usize>>,
    name_order: Vec<String>,
}

impl InsnCatalog {
    fn new(templates: Vec<InsnTemplate>) -> InsnCatalog {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        let mut name_order = Vec::new();
        for (index, template) in templates.iter().enumerate() {
            let entry = by_name.entry(template.mnemonic.clone()).or_default();
            if entry.is_empty() {
                name_order.push(template.mnemonic.clone());
            }
            entry.push(index);
        }
        InsnCatalog { templates, by_name, name_order }
    }

    /// All templates, in table order.
    pub fn templates(&self) -> &[InsnTemplate] {
        &self.templates
    }

    /// Template indices for an exact mnemonic, in table order.
    pub fn lookup(&self, name: &str) -> &[usize] {
        self.by_name.get(name).map_or(&[], |indices| indices.as_slice())
    }

    /// Mnemonics in first-occurrence order.
    pub fn mnemonics(&self) -> &[String] {
        &self.name_order
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// The process-wide catalog, built once and never mutated.
pub static CATALOG: LazyLock<InsnCatalog> = LazyLock::new(|| InsnCatalog::new(table()));

fn o(value: u8) -> OpcodeStep {
    OpcodeStep::Fixed(value)
}

fn o_r(value: u8) -> OpcodeStep {
    OpcodeStep::WithRegister(value)
}

fn e(value: u8) -> OpcodeStep {
    OpcodeStep::Extension(value)
}

const MODRM: OpcodeStep = OpcodeStep::ModRm;

fn row(pattern: &[OpcodeStep], mnemonic: &str, operands: &[&str]) -> InsnTemplate {
    InsnTemplate {
        pattern: pattern.to_vec(),
        mnemonic: mnemonic.to_string(),
        operands: operands.iter().map(|s| OperandKind::from_spelling(s)).collect(),
    }
}

#[rustfmt::skip]
fn table() -> Vec<InsnTemplate> {
    vec![
        row(&[o(0x00), MODRM], "ADD", &["r/m8", "r8"]),
        row(&[o(0x01), MODRM], "ADD", &["r/m16/32", "r16/32"]),
        row(&[o(0x02), MODRM], "ADD", &["r8", "r/m8"]),
        row(&[o(0x03), MODRM], "ADD", &["r16/32", "r/m16/32"]),
        row(&[o(0x04)], "ADD", &["AL", "imm8"]),
        row(&[o(0x05)], "ADD", &["E_AX", "imm16/32"]),
        row(&[o(0x80), e(0)], "ADD", &["r/m8", "imm8"]),
        row(&[o(0x81), e(0)], "ADD", &["r/m16/32", "imm16/32"]),
        row(&[o(0x83), e(0)], "ADD", &["r/m16/32", "imm8"]),

        row(&[o(0xfe), e(1)], "DEC", &["r/m8"]),
        row(&[o(0xff), e(1)], "DEC", &["r/m16/32"]),
        row(&[o_r(0x48)], "DEC", &["r16/32"]),

        row(&[o(0xf6), e(6)], "DIV", &["r/m8"]),
        row(&[o(0xf7), e(6)], "DIV", &["r/m16/32"]),

        row(&[o(0xf4)], "HLT", &[]),
        row(&[o(0x0f), o(0x01), e(2)], "LGDT", &["r/m16/32"]),
        row(&[o(0x0f), o(0x01), e(3)], "LIDT", &["r/m16/32"]),

        row(&[o(0xf6), e(7)], "IDIV", &["r/m8"]),
        row(&[o(0xf7), e(7)], "IDIV", &["r/m16/32"]),

        row(&[o(0xf6), e(5)], "IMUL", &["r/m8"]),
        row(&[o(0xf7), e(5)], "IMUL", &["r/m16/32"]),
        row(&[o(0x0f), o(0xaf), MODRM], "IMUL", &["r16/32", "r/m16/32"]),
        row(&[o(0x6b), MODRM], "IMUL", &["r16/32", "r/m16/32", "imm8"]),
        row(&[o(0x69), MODRM], "IMUL", &["r16/32", "r/m16/32", "imm16/32"]),

        row(&[o(0xe4)], "IN", &["AL", "imm8"]),
        row(&[o(0xe5)], "IN", &["E_AX", "imm8"]),
        row(&[o(0xec)], "IN", &["AL", "DX"]),
        row(&[o(0xed)], "IN", &["E_AX", "DX"]),

        row(&[o(0xfe), e(0)], "INC", &["r/m8"]),
        row(&[o(0xff), e(0)], "INC", &["r/m16/32"]),
        row(&[o_r(0x40)], "INC", &["r16/32"]),

        row(&[o(0xcc)], "INT3", &[]),
        row(&[o(0xcd)], "INT", &["imm8"]),

        row(&[o(0x0f), o(0x84)], "JE", &["rel16/32"]),
        row(&[o(0xe9)], "JMP", &["rel16/32"]),

        row(&[o(0x8d), MODRM], "LEA", &["r16/32", "m"]),

        row(&[o(0x88), MODRM], "MOV", &["r/m8", "r8"]),
        row(&[o(0x89), MODRM], "MOV", &["r/m16/32", "r16/32"]),
        row(&[o(0x8a), MODRM], "MOV", &["r8", "r/m8"]),
        row(&[o(0x8b), MODRM], "MOV", &["r16/32", "r/m16/32"]),
        row(&[o(0x8c), MODRM], "MOV", &["r/m16", "sreg"]),
        row(&[o(0x8e), MODRM], "MOV", &["sreg", "r/m16"]),
        row(&[o(0xa0)], "MOV", &["AL", "moffs8"]),
        row(&[o(0xa1)], "MOV", &["E_AX", "moffs16/32"]),
        row(&[o(0xa2)], "MOV", &["moffs8", "AL"]),
        row(&[o(0xa3)], "MOV", &["moffs16/32", "E_AX"]),
        row(&[o_r(0xb0)], "MOV", &["r8", "imm8"]),
        row(&[o_r(0xb8)], "MOV", &["r16/32", "imm16/32"]),
        row(&[o(0xc6), e(0)], "MOV", &["r/m8", "imm8"]),
        row(&[o(0xc7), e(0)], "MOV", &["r/m16/32", "imm16/32"]),

        row(&[o(0x0f), o(0xb6), MODRM], "MOVZX", &["r16/32", "r/m8"]),
        row(&[o(0x0f), o(0xb7), MODRM], "MOVZX", &["r32", "r/m16"]),

        row(&[o(0xf6), e(4)], "MUL", &["r/m8"]),
        row(&[o(0xf7), e(4)], "MUL", &["r/m16/32"]),

        row(&[o(0x90)], "NOP", &[]),

        row(&[o(0xe6)], "OUT", &["imm8", "AL"]),
        row(&[o(0xe7)], "OUT", &["imm8", "E_AX"]),
        row(&[o(0xee)], "OUT", &["DX", "AL"]),
        row(&[o(0xef)], "OUT", &["DX", "E_AX"]),

        row(&[o_r(0x58)], "POP", &["r32"]),
        row(&[o_r(0x50)], "PUSH", &["r32"]),

        row(&[o(0xc3)], "RET", &[]),

        row(&[o(0x2c)], "SUB", &["AL", "imm8"]),
        row(&[o(0x2d)], "SUB", &["E_AX", "imm16/32"]),
        row(&[o(0x80), e(5)], "SUB", &["r/m8", "imm8"]),
        row(&[o(0x81), e(5)], "SUB", &["r/m16/32", "imm16/32"]),
        row(&[o(0x83), e(5)], "SUB", &["r/m16/32", "imm8"]),
        row(&[o(0x28), MODRM], "SUB", &["r/m8", "r8"]),
        row(&[o(0x29), MODRM], "SUB", &["r/m16/32", "r16/32"]),
        row(&[o(0x2a), MODRM], "SUB", &["r8", "r/m8"]),
        row(&[o(0x2b), MODRM], "SUB", &["r16/32", "r/m16/32"]),

        row(&[o(0xa8)], "TEST", &["AL", "imm8"]),
        row(&[o(0xa9)], "TEST", &["E_AX", "imm16/32"]),
        row(&[o(0xf6), e(0)], "TEST", &["r/m8", "imm8"]),
        row(&[o(0xf7), e(0)], "TEST", &["r/m16/32", "imm16/32"]),
        row(&[o(0x84), MODRM], "TEST", &["r/m8", "r8"]),
        row(&[o(0x85), MODRM], "TEST", &["r/m16/32", "r16/32"]),
    ]
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_not_empty() {
        assert!(!CATALOG.is_empty());
        assert_eq!(CATALOG.len(), CATALOG.templates().len());
    }

    #[test]
    fn test_lookup_preserves_table_order() {
        let indices = CATALOG.lookup("MOV");
        assert_eq!(indices.len(), 14);
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        assert_eq!(indices, sorted.as_slice());
    }

    #[test]
    fn test_lookup_unknown_mnemonic() {
        assert!(CATALOG.lookup("XCHG").is_empty());
    }

    #[test]
    fn test_mnemonics_first_occurrence_order() {
        let names = CATALOG.mnemonics();
        assert_eq!(names[0], "ADD");
        assert_eq!(names[1], "DEC");
        // IN must come before INC, INT3 and INT for prefix lookups.
        let position = |name: &str| names.iter().position(|n| n == name).unwrap();
        assert!(position("IN") < position("INC"));
        assert!(position("INT3") < position("INT"));
    }

    #[test]
    fn test_operand_spelling_round_trip() {
        for spelling in ["r/m16/32", "r8", "imm16/32", "rel16/32", "AL", "DX"] {
            let kind = OperandKind::from_spelling(spelling);
            assert_ne!(kind, OperandKind::Unsupported, "{spelling}");
        }
        assert_eq!(OperandKind::from_spelling("sreg"), OperandKind::Unsupported);
        assert_eq!(OperandKind::from_spelling("moffs8"), OperandKind::Unsupported);
        assert_eq!(OperandKind::from_spelling("m"), OperandKind::Unsupported);
    }

    #[test]
    fn test_signature() {
        let template = &CATALOG.templates()[CATALOG.lookup("MOV")[13]];
        assert_eq!(template.signature(), "MOV r/m16/32,imm16/32");
        let ret = &CATALOG.templates()[CATALOG.lookup("RET")[0]];
        assert_eq!(ret.signature(), "RET ");
    }

    #[test]
    fn test_fixed_reg_spelling() {
        assert_eq!(OperandKind::from_spelling("E_AX").spelling(), "EAX");
        assert_eq!(OperandKind::from_spelling("AX").spelling(), "AX");
    }
}
