//! Template search — match a parsed instruction against the catalog.
//!
//! Matching is permissive by design: a partially typed instruction (bare
//! mnemonic prefix, or fewer operands than the template takes) still lists
//! candidate signatures, and the encoding is attached only for the
//! candidates the operands fully satisfy.

use crate::catalog::{fixed_reg_display, FixedRegName, OperandKind, CATALOG};
use crate::encode::{encode, EncodingElement};
use crate::syntax::{AstInstr, AstOperand, OperandWidth, SizeClass};

/// One matching template: its canonical signature and, when the operands
/// complete an encodable instruction, the encoding itself.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Vec<EncodingElement>>,
}

/// Find every catalog template compatible with an instruction. With no
/// operands the mnemonic matches as a prefix; once operands appear the
/// mnemonic must match exactly.
pub fn search(instr: &AstInstr, width: OperandWidth) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for mnemonic in CATALOG.mnemonics() {
        let name_matches = if instr.operands.is_empty() {
            mnemonic.starts_with(&instr.name)
        } else {
            mnemonic == &instr.name
        };
        if !name_matches {
            continue;
        }
        for &index in CATALOG.lookup(mnemonic) {
            let template = &CATALOG.templates()[index];
            if !operands_match(&template.operands, &instr.operands) {
                continue;
            }
            results.push(SearchResult {
                name: template.signature(),
                encoding: encode(width, template, &instr.operands).ok(),
            });
        }
    }
    results
}

/// Match the given operands against the leading template slots. Extra
/// operands beyond the template's arity disqualify it; missing ones do not.
fn operands_match(kinds: &[OperandKind], operands: &[AstOperand]) -> bool {
    if operands.len() > kinds.len() {
        return false;
    }
    kinds
        .iter()
        .zip(operands)
        .all(|(kind, operand)| operand_matches(*kind, operand))
}

fn operand_matches(kind: OperandKind, operand: &AstOperand) -> bool {
    match (kind, operand) {
        (OperandKind::Reg(size), AstOperand::Register(name)) => {
            reg_matches(size, name)
        }
        (OperandKind::FixedReg(_, fixed), AstOperand::Register(name)) => {
            fixed_reg_matches(fixed, name)
        }
        (OperandKind::RegMem(size), AstOperand::Register(name)) => {
            reg_matches(size, name)
        }
        (OperandKind::RegMem(size), AstOperand::EffectiveAddress(memory)) => {
            size_matches(size, memory.size)
        }
        (OperandKind::Imm(size), AstOperand::Immediate(value)) => {
            imm_fits(size, *value)
        }
        (OperandKind::Rel(_), AstOperand::Immediate(_)) => true,
        _ => false,
    }
}

fn reg_matches(size: SizeClass, name: &str) -> bool {
    match reg_size_class(name) {
        Some(actual) => size_matches(size, actual),
        // An unrecognized register name matches any size slot.
        None => true,
    }
}

fn size_matches(template: SizeClass, actual: SizeClass) -> bool {
    match template {
        SizeClass::S16Or32 => actual != SizeClass::S8,
        other => other == actual,
    }
}

/// Size class implied by a register spelling, if any.
fn reg_size_class(name: &str) -> Option<SizeClass> {
    if name.starts_with('E') {
        Some(SizeClass::S32)
    } else if name.ends_with('X') || matches!(name, "SP" | "BP" | "SI" | "DI") {
        Some(SizeClass::S16)
    } else if name.ends_with('H') || name.ends_with('L') {
        Some(SizeClass::S8)
    } else {
        None
    }
}

fn fixed_reg_matches(fixed: FixedRegName, name: &str) -> bool {
    name == fixed_reg_display(SizeClass::S16, fixed)
        || name == fixed_reg_display(SizeClass::S32, fixed)
}

/// A literal fits a sized immediate slot when it stays within the slot's
/// bit width; full-width slots take anything.
fn imm_fits(size: SizeClass, value: i64) -> bool {
    match size {
        SizeClass::S32 | SizeClass::S16Or32 => true,
        other => value < (1 << other.bit_size()),
    }
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{Mode, RegField, RmField};
    use crate::parser::parse;

    fn search_line(content: &str) -> Vec<SearchResult> {
        let outcome = parse(content, OperandWidth::Bits32);
        assert_eq!(outcome.errors, vec![]);
        search(&outcome.instr.unwrap(), OperandWidth::Bits32)
    }

    fn names(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_register_immediate_candidates() {
        let results = search_line("mov ecx, 80000f8h");
        assert_eq!(
            names(&results),
            vec!["MOV r16/32,imm16/32", "MOV r/m16/32,imm16/32"]
        );
        assert_eq!(
            results[0].encoding,
            Some(vec![
                EncodingElement::OpcodeAndReg { opcode: 23, register: 1 },
                EncodingElement::Immediate {
                    size: SizeClass::S32,
                    value: 0x080000f8,
                },
            ])
        );
        assert_eq!(
            results[1].encoding,
            Some(vec![
                EncodingElement::Opcode(0xc7),
                EncodingElement::ModRm {
                    mode: Mode::Reg,
                    reg: RegField::Ext(0),
                    rm: RmField::Reg("ECX".to_string()),
                },
                EncodingElement::Immediate {
                    size: SizeClass::S32,
                    value: 0x080000f8,
                },
            ])
        );
    }

    #[test]
    fn test_mnemonic_prefix_search() {
        let results = search_line("in");
        assert_eq!(
            names(&results),
            vec![
                "IN AL,imm8",
                "IN EAX,imm8",
                "IN AL,DX",
                "IN EAX,DX",
                "INC r/m8",
                "INC r/m16/32",
                "INC r16/32",
                "INT3 ",
                "INT imm8",
            ]
        );
        // Only the nullary template is encodable without operands.
        let int3 = results.iter().find(|r| r.name == "INT3 ").unwrap();
        assert_eq!(int3.encoding, Some(vec![EncodingElement::Opcode(0xcc)]));
        assert!(results.iter().filter(|r| r.encoding.is_some()).count() == 1);
    }

    #[test]
    fn test_prefix_match_requires_no_operands() {
        // With an operand present the mnemonic must match exactly.
        let results = search_line("int 128");
        assert_eq!(names(&results), vec!["INT imm8"]);
    }

    #[test]
    fn test_byte_immediate_slot_rejects_wide_literal() {
        let results = search_line("int 1234h");
        assert_eq!(names(&results), Vec::<&str>::new());
    }

    #[test]
    fn test_extra_operand_disqualifies() {
        let results = search_line("inc eax, ebx");
        assert_eq!(names(&results), Vec::<&str>::new());
    }

    #[test]
    fn test_sixteen_bit_register_emits_prefix() {
        let results = search_line("mov ax, 10h");
        assert_eq!(
            names(&results),
            vec!["MOV r16/32,imm16/32", "MOV r/m16/32,imm16/32"]
        );
        assert_eq!(
            results[0].encoding,
            Some(vec![
                EncodingElement::Prefix(0x66),
                EncodingElement::OpcodeAndReg { opcode: 23, register: 0 },
                EncodingElement::Immediate { size: SizeClass::S16, value: 0x10 },
            ])
        );
    }

    #[test]
    fn test_fixed_register_slot_is_exact() {
        // DIV's template only names r/m slots; use IN's fixed AL/DX pair.
        let results = search_line("in al, dx");
        assert_eq!(names(&results), vec!["IN AL,DX"]);
        let results = search_line("in bl, dx");
        assert_eq!(names(&results), Vec::<&str>::new());
    }

    #[test]
    fn test_memory_operand_against_rm_slot() {
        let results = search_line("mov byteptr [ecx], 10");
        assert_eq!(names(&results), vec!["MOV r/m8,imm8"]);
        assert_eq!(
            results[0].encoding,
            Some(vec![
                EncodingElement::Opcode(0xc6),
                EncodingElement::ModRm {
                    mode: Mode::Memory,
                    reg: RegField::Ext(0),
                    rm: RmField::Reg("ECX".to_string()),
                },
                EncodingElement::Immediate { size: SizeClass::S8, value: 10 },
            ])
        );
    }

    #[test]
    fn test_relative_slot_takes_any_immediate() {
        let results = search_line("jmp 8000000h");
        assert_eq!(names(&results), vec!["JMP rel16/32"]);
    }
}
