//! Encoding diagrams — explode an encoding into labelled byte and bit
//! fields for display.
//!
//! Each encoding element becomes one block: single-role bytes are leaves
//! (prefix, opcode, displacement, immediate), packed bytes are nodes whose
//! children label each bit field (opcode+register, ModRM, SIB). Block text
//! carries the byte hex, child text the bits.

use crate::encode::{reg_number, scale_bits, EncodingElement, RegField, RmField};
use crate::syntax::display_int;

/// One diagram block: the rendered bytes plus their labelled breakdown.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiagramBlock {
    pub text: String,
    pub element: DiagramElement,
}

/// A block body: either a plain label or a labelled list of sub-blocks.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "t")]
pub enum DiagramElement {
    Leaf { text: String },
    Node { text: String, blocks: Vec<DiagramBlock> },
}

/// Render an encoding as a diagram, one block per element.
pub fn to_diagram(elements: &[EncodingElement]) -> Vec<DiagramBlock> {
    elements.iter().map(diagram_block).collect()
}

fn diagram_block(element: &EncodingElement) -> DiagramBlock {
    match element {
        EncodingElement::Prefix(value) => leaf(&[*value as i64], "Prefix".to_string()),
        EncodingElement::Opcode(value) => leaf(&[*value as i64], "Opcode".to_string()),
        EncodingElement::OpcodeAndReg { opcode, register } => packed_byte(
            "Opcode and Register",
            &[
                Field { label: "Opcode".to_string(), size: 5, shift: 3, value: *opcode as i64 },
                Field { label: "Reg".to_string(), size: 3, shift: 0, value: *register as i64 },
            ],
        ),
        EncodingElement::ModRm { mode, reg, rm } => {
            let (reg_value, reg_label) = match reg {
                RegField::Reg(name) => (reg_number(name) as i64, name.clone()),
                RegField::Ext(value) => (*value as i64, format!("Opcode Ext {value}")),
            };
            let (rm_value, rm_label) = match rm {
                RmField::Reg(name) => (reg_number(name) as i64, name.clone()),
                // SIB presence is signalled through the ESP slot.
                RmField::Sib => (reg_number("ESP") as i64, "SIB".to_string()),
            };
            packed_byte(
                "ModRM",
                &[
                    Field {
                        label: format!("Mode ({mode})"),
                        size: 2,
                        shift: 6,
                        value: mode.bits() as i64,
                    },
                    Field {
                        label: format!("Reg ({reg_label})"),
                        size: 3,
                        shift: 3,
                        value: reg_value,
                    },
                    Field {
                        label: format!("RM ({rm_label})"),
                        size: 3,
                        shift: 0,
                        value: rm_value,
                    },
                ],
            )
        }
        EncodingElement::Sib { base, index, scale } => packed_byte(
            "SIB",
            &[
                Field {
                    label: "Scale".to_string(),
                    size: 2,
                    shift: 6,
                    value: scale_bits(*scale) as i64,
                },
                Field { label: "Index".to_string(), size: 3, shift: 3, value: *index as i64 },
                Field { label: "Base".to_string(), size: 3, shift: 0, value: *base as i64 },
            ],
        ),
        EncodingElement::Disp8(value) => {
            leaf(&[*value], format!("Displacement: {}", display_int(*value)))
        }
        EncodingElement::Disp32(value) => DiagramBlock {
            text: bytes_text(&little_endian(32, *value)),
            element: DiagramElement::Leaf {
                text: format!("Displacement: {}", display_int(*value)),
            },
        },
        EncodingElement::Immediate { size, value } => DiagramBlock {
            text: bytes_text(&little_endian(size.bit_size(), *value)),
            element: DiagramElement::Leaf {
                text: format!("Immediate value: {}", display_int(*value)),
            },
        },
    }
}

/// A labelled bit field inside a packed byte.
struct Field {
    label: String,
    size: u32,
    shift: u32,
    value: i64,
}

fn packed_byte(name: &str, fields: &[Field]) -> DiagramBlock {
    let mut byte: i64 = 0;
    let mut blocks = Vec::new();
    for field in fields {
        blocks.push(DiagramBlock {
            text: to_bits(field.size, field.value),
            element: DiagramElement::Leaf { text: field.label.clone() },
        });
        byte |= field.value << field.shift;
    }
    DiagramBlock {
        text: byte_hex(byte),
        element: DiagramElement::Node { text: name.to_string(), blocks },
    }
}

fn leaf(values: &[i64], text: String) -> DiagramBlock {
    DiagramBlock { text: bytes_text(values), element: DiagramElement::Leaf { text } }
}

/// Most-significant-first bit string of a field's low `size` bits.
pub fn to_bits(size: u32, value: i64) -> String {
    (1..=size).map(|i| char::from(b'0' + ((value >> (size - i)) & 1) as u8)).collect()
}

fn little_endian(bits: u32, value: i64) -> Vec<i64> {
    (0..bits / 8).map(|i| (value >> (i * 8)) & 0xff).collect()
}

fn bytes_text(values: &[i64]) -> String {
    values.iter().map(|v| byte_hex(*v)).collect::<Vec<String>>().join(" ")
}

fn byte_hex(value: i64) -> String {
    format!("{:02x}", value & 0xff)
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Mode;
    use crate::syntax::SizeClass;

    fn leaf_text(block: &DiagramBlock) -> &str {
        match &block.element {
            DiagramElement::Leaf { text } => text,
            DiagramElement::Node { .. } => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_to_bits() {
        assert_eq!(to_bits(5, 23), "10111");
        assert_eq!(to_bits(3, 0), "000");
        assert_eq!(to_bits(2, 2), "10");
        // Negative field values render their low bits.
        assert_eq!(to_bits(3, -1), "111");
    }

    #[test]
    fn test_single_byte_leaves() {
        let diagram = to_diagram(&[
            EncodingElement::Prefix(0x66),
            EncodingElement::Opcode(0xc7),
            EncodingElement::Disp8(-8),
        ]);
        assert_eq!(diagram[0].text, "66");
        assert_eq!(leaf_text(&diagram[0]), "Prefix");
        assert_eq!(diagram[1].text, "c7");
        assert_eq!(leaf_text(&diagram[1]), "Opcode");
        assert_eq!(diagram[2].text, "f8");
        assert_eq!(leaf_text(&diagram[2]), "Displacement: -8");
    }

    #[test]
    fn test_opcode_and_register_node() {
        let diagram = to_diagram(&[EncodingElement::OpcodeAndReg {
            opcode: 23,
            register: 1,
        }]);
        assert_eq!(diagram[0].text, "b9");
        let DiagramElement::Node { text, blocks } = &diagram[0].element else {
            panic!("expected node");
        };
        assert_eq!(text, "Opcode and Register");
        assert_eq!(blocks[0].text, "10111");
        assert_eq!(leaf_text(&blocks[0]), "Opcode");
        assert_eq!(blocks[1].text, "001");
        assert_eq!(leaf_text(&blocks[1]), "Reg");
    }

    #[test]
    fn test_modrm_node_with_extension_and_sib() {
        let diagram = to_diagram(&[EncodingElement::ModRm {
            mode: Mode::MemoryDisp32,
            reg: RegField::Ext(0),
            rm: RmField::Sib,
        }]);
        assert_eq!(diagram[0].text, "84");
        let DiagramElement::Node { blocks, .. } = &diagram[0].element else {
            panic!("expected node");
        };
        assert_eq!(blocks[0].text, "10");
        assert_eq!(leaf_text(&blocks[0]), "Mode (MEMORY_DISP32)");
        assert_eq!(blocks[1].text, "000");
        assert_eq!(leaf_text(&blocks[1]), "Reg (Opcode Ext 0)");
        assert_eq!(blocks[2].text, "100");
        assert_eq!(leaf_text(&blocks[2]), "RM (SIB)");
    }

    #[test]
    fn test_modrm_register_labels() {
        let diagram = to_diagram(&[EncodingElement::ModRm {
            mode: Mode::Reg,
            reg: RegField::Reg("EAX".to_string()),
            rm: RmField::Reg("ECX".to_string()),
        }]);
        assert_eq!(diagram[0].text, "c1");
        let DiagramElement::Node { blocks, .. } = &diagram[0].element else {
            panic!("expected node");
        };
        assert_eq!(leaf_text(&blocks[0]), "Mode (REG)");
        assert_eq!(leaf_text(&blocks[1]), "Reg (EAX)");
        assert_eq!(leaf_text(&blocks[2]), "RM (ECX)");
    }

    #[test]
    fn test_sib_node() {
        let diagram = to_diagram(&[EncodingElement::Sib {
            base: 6,
            index: 0,
            scale: 4,
        }]);
        assert_eq!(diagram[0].text, "86");
        let DiagramElement::Node { text, blocks } = &diagram[0].element else {
            panic!("expected node");
        };
        assert_eq!(text, "SIB");
        assert_eq!(blocks[0].text, "10");
        assert_eq!(leaf_text(&blocks[0]), "Scale");
        assert_eq!(blocks[1].text, "000");
        assert_eq!(leaf_text(&blocks[1]), "Index");
        assert_eq!(blocks[2].text, "110");
        assert_eq!(leaf_text(&blocks[2]), "Base");
    }

    #[test]
    fn test_multi_byte_little_endian() {
        let diagram = to_diagram(&[
            EncodingElement::Disp32(0x100),
            EncodingElement::Immediate { size: SizeClass::S16, value: 0x1234 },
            EncodingElement::Immediate { size: SizeClass::S32, value: 0x080000f8 },
        ]);
        assert_eq!(diagram[0].text, "00 01 00 00");
        assert_eq!(leaf_text(&diagram[0]), "Displacement: 256");
        assert_eq!(diagram[1].text, "34 12");
        assert_eq!(leaf_text(&diagram[1]), "Immediate value: 1234h");
        assert_eq!(diagram[2].text, "f8 00 00 08");
        assert_eq!(leaf_text(&diagram[2]), "Immediate value: 80000f8h");
    }
}
