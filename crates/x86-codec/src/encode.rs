//! Instruction encoder — (template, AST operands) → encoding elements.
//!
//! The output alphabet is [`EncodingElement`]; concatenating the byte
//! serialization of an element sequence ([`element_bytes`]) reproduces the
//! exact machine code, and [`encoding_size`] equals that byte count.

use std::fmt;

use tracing::warn;

use crate::catalog::{InsnTemplate, OpcodeStep, OperandKind};
use crate::syntax::{AstOperand, MemoryOperand, OperandWidth, SizeClass};

/// Fixed base address used for relative-offset arithmetic on both the
/// encode and decode sides. Display-only, not a real load address.
pub const PROGRAM_COUNTER: i64 = 0x0800_0000;

// ---------------------------------------------------------------------------
//  Encoding elements
// ---------------------------------------------------------------------------

/// ModRM addressing mode (top two bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Mode {
    Reg,
    Memory,
    MemoryDisp8,
    MemoryDisp32,
}

impl Mode {
    pub fn bits(self) -> u8 {
        match self {
            Mode::Memory => 0,
            Mode::MemoryDisp8 => 1,
            Mode::MemoryDisp32 => 2,
            Mode::Reg => 3,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Reg => "REG",
            Mode::Memory => "MEMORY",
            Mode::MemoryDisp8 => "MEMORY_DISP8",
            Mode::MemoryDisp32 => "MEMORY_DISP32",
        })
    }
}

/// The ModRM reg field: a named register, or an opcode-extension value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegField {
    Reg(String),
    Ext(u8),
}

/// The ModRM r/m field: a named register, or the SIB marker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RmField {
    Reg(String),
    Sib,
}

/// One element of an instruction encoding, in emission order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum EncodingElement {
    Prefix(u8),
    Opcode(u8),
    OpcodeAndReg { opcode: u8, register: i8 },
    Immediate { size: SizeClass, value: i64 },
    ModRm { mode: Mode, reg: RegField, rm: RmField },
    Sib { base: i8, index: i8, scale: u8 },
    Disp8(i64),
    Disp32(i64),
}

/// Byte count of an element sequence.
pub fn encoding_size(elements: &[EncodingElement]) -> usize {
    elements
        .iter()
        .map(|element| match element {
            EncodingElement::Prefix(_)
            | EncodingElement::Opcode(_)
            | EncodingElement::OpcodeAndReg { .. }
            | EncodingElement::ModRm { .. }
            | EncodingElement::Sib { .. }
            | EncodingElement::Disp8(_) => 1,
            EncodingElement::Disp32(_) => 4,
            EncodingElement::Immediate { size, .. } => size.bit_size() as usize / 8,
        })
        .sum()
}

/// Serialize an element sequence into the machine-code bytes it denotes.
pub fn element_bytes(elements: &[EncodingElement]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoding_size(elements));
    for element in elements {
        match element {
            EncodingElement::Prefix(value) | EncodingElement::Opcode(value) => {
                bytes.push(*value);
            }
            EncodingElement::OpcodeAndReg { opcode, register } => {
                bytes.push((opcode << 3) | (*register as u8 & 0x07));
            }
            EncodingElement::ModRm { mode, reg, rm } => {
                let reg_bits = match reg {
                    RegField::Reg(name) => reg_number(name) as u8,
                    RegField::Ext(value) => *value,
                };
                let rm_bits = match rm {
                    RmField::Reg(name) => reg_number(name) as u8,
                    // SIB is signalled through r/m = ESP.
                    RmField::Sib => 4,
                };
                bytes.push((mode.bits() << 6) | ((reg_bits & 0x07) << 3) | (rm_bits & 0x07));
            }
            EncodingElement::Sib { base, index, scale } => {
                bytes.push(
                    (scale_bits(*scale) << 6) | ((*index as u8 & 0x07) << 3) | (*base as u8 & 0x07),
                );
            }
            EncodingElement::Disp8(value) => bytes.push(*value as u8),
            EncodingElement::Disp32(value) => {
                bytes.extend_from_slice(&(*value as i32).to_le_bytes());
            }
            EncodingElement::Immediate { size, value } => {
                let width = size.bit_size() as usize / 8;
                bytes.extend_from_slice(&(*value as i32).to_le_bytes()[..width]);
            }
        }
    }
    bytes
}

/// SIB scale bits: 1, 2, 4, 8 → 0, 1, 2, 3.
pub fn scale_bits(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

// ---------------------------------------------------------------------------
//  Register numbering
// ---------------------------------------------------------------------------

/// The machine number of a register name. An unknown name yields -1,
/// which poisons the emitted field (see the module notes in DESIGN.md).
pub fn reg_number(name: &str) -> i8 {
    match name.to_uppercase().as_str() {
        "AL" | "AX" | "EAX" => 0,
        "CL" | "CX" | "ECX" => 1,
        "DL" | "DX" | "EDX" => 2,
        "BL" | "BX" | "EBX" => 3,
        "AH" | "SP" | "ESP" => 4,
        "CH" | "BP" | "EBP" => 5,
        "DH" | "SI" | "ESI" => 6,
        "BH" | "DI" | "EDI" => 7,
        other => {
            warn!("REG: unknown register name {other}");
            -1
        }
    }
}

/// Size hint inferred from a register name when resolving the 16/32
/// ambiguity: leading `E` means 32-bit, a 16-bit name pattern means
/// 16-bit, anything else 8-bit.
fn reg_size_hint(name: &str) -> SizeClass {
    let name = name.to_uppercase();
    if name.starts_with('E') {
        SizeClass::S32
    } else if name.ends_with('X') || matches!(name.as_str(), "SP" | "BP" | "SI" | "DI") {
        SizeClass::S16
    } else {
        SizeClass::S8
    }
}

// ---------------------------------------------------------------------------
//  Errors
// ---------------------------------------------------------------------------

/// Encoder failure. Sticky and local to one (template, operands) pairing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("operand count mismatch: template takes {expected}, got {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("no encoding for this operand/template pairing")]
    NoEncoding,
}

// ---------------------------------------------------------------------------
//  Encoder
// ---------------------------------------------------------------------------

/// Pending memory (or plain register) shape for the ModRM r/m side.
struct MemoryShape {
    is_reg: bool,
    base: Option<String>,
    index: Option<(i8, u8)>,
    disp: Option<i64>,
}

struct EncodeContext {
    width: OperandWidth,
    elements: Vec<EncodingElement>,
    reg: Option<RegField>,
    rm: Option<MemoryShape>,
}

/// Encode an instruction template against concrete operands.
pub fn encode(
    width: OperandWidth,
    template: &InsnTemplate,
    operands: &[AstOperand],
) -> Result<Vec<EncodingElement>, EncodeError> {
    if template.operands.len() != operands.len() {
        return Err(EncodeError::ArityMismatch {
            expected: template.operands.len(),
            found: operands.len(),
        });
    }
    let mut context =
        EncodeContext { width, elements: Vec::new(), reg: None, rm: None };

    check_operand_size_prefix(template, operands, &mut context);

    for step in &template.pattern {
        match step {
            OpcodeStep::Fixed(value) => context.elements.push(EncodingElement::Opcode(*value)),
            OpcodeStep::WithRegister(value) => {
                context.elements.push(EncodingElement::OpcodeAndReg {
                    opcode: value >> 3,
                    register: embedded_register(template, operands),
                });
            }
            OpcodeStep::Extension(value) => context.reg = Some(RegField::Ext(*value)),
            OpcodeStep::ModRm => {}
        }
    }
    for (kind, operand) in template.operands.iter().zip(operands) {
        encode_operand(&mut context, *kind, operand)?;
    }
    Ok(context.elements)
}

/// Emit the 0x66 prefix when a size-ambiguous slot resolves against the
/// default width. Conflicting hints are reported; the first one wins.
fn check_operand_size_prefix(
    template: &InsnTemplate,
    operands: &[AstOperand],
    context: &mut EncodeContext,
) {
    let ambiguous = template.operands.iter().any(|kind| {
        matches!(
            kind,
            OperandKind::Reg(SizeClass::S16Or32) | OperandKind::RegMem(SizeClass::S16Or32)
        )
    });
    if !ambiguous {
        return;
    }
    let mut size: Option<SizeClass> = None;
    for operand in operands {
        let hint = match operand {
            AstOperand::Register(name) => Some(reg_size_hint(name)),
            AstOperand::EffectiveAddress(memory) => Some(memory.size),
            AstOperand::Immediate(_) => None,
        };
        if let Some(hint) = hint {
            match size {
                Some(seen) if seen != hint => {
                    warn!("SIZE: operand size mismatch ({seen} vs {hint})");
                }
                _ => size = Some(hint),
            }
        }
    }
    let flip = matches!(
        (context.width, size),
        (OperandWidth::Bits32, Some(SizeClass::S16)) | (OperandWidth::Bits16, Some(SizeClass::S32))
    );
    if flip {
        context.width = context.width.flipped();
        context.elements.push(EncodingElement::Prefix(0x66));
    }
}

/// Register number for a `ByteOrRegister` opcode, taken from the operand
/// filling the template's plain-register slot.
fn embedded_register(template: &InsnTemplate, operands: &[AstOperand]) -> i8 {
    for (kind, operand) in template.operands.iter().zip(operands) {
        if let (OperandKind::Reg(_), AstOperand::Register(name)) = (kind, operand) {
            return reg_number(name);
        }
    }
    0
}

fn encode_operand(
    context: &mut EncodeContext,
    kind: OperandKind,
    operand: &AstOperand,
) -> Result<(), EncodeError> {
    match (kind, operand) {
        (OperandKind::RegMem(_), AstOperand::EffectiveAddress(memory)) => {
            add_memory(context, extract_memory(memory))
        }
        (OperandKind::RegMem(_), AstOperand::Register(name)) => {
            let shape = MemoryShape {
                is_reg: true,
                base: Some(name.to_uppercase()),
                index: None,
                disp: None,
            };
            add_memory(context, shape)
        }
        (OperandKind::Reg(_), AstOperand::Register(name)) => {
            let reg = RegField::Reg(name.to_uppercase());
            if let Some(rm) = context.rm.take() {
                complete_modrm(context, reg, rm)
            } else {
                context.reg = Some(reg);
                Ok(())
            }
        }
        (OperandKind::Imm(size), AstOperand::Immediate(value)) => {
            context.elements.push(EncodingElement::Immediate {
                size: context.width.resolve(size),
                value: *value,
            });
            Ok(())
        }
        (OperandKind::Rel(size), AstOperand::Immediate(target)) => {
            // Offset relative to the instruction end, assuming the offset
            // field itself occupies the final 4 bytes.
            let value =
                target - PROGRAM_COUNTER - encoding_size(&context.elements) as i64 - 4;
            context.elements.push(EncodingElement::Immediate {
                size: context.width.resolve(size),
                value,
            });
            Ok(())
        }
        // Implicit register operands encode no bytes.
        (OperandKind::FixedReg(_, _), AstOperand::Register(_)) => Ok(()),
        _ => Err(EncodeError::NoEncoding),
    }
}

fn extract_memory(memory: &MemoryOperand) -> MemoryShape {
    MemoryShape {
        is_reg: false,
        base: memory.base.as_ref().map(|b| b.to_uppercase()),
        index: memory
            .index
            .as_ref()
            .map(|index| (reg_number(&index.register), index.scale)),
        disp: (memory.displacement != 0).then_some(memory.displacement),
    }
}

fn add_memory(context: &mut EncodeContext, shape: MemoryShape) -> Result<(), EncodeError> {
    if let Some(reg) = context.reg.take() {
        complete_modrm(context, reg, shape)
    } else {
        context.rm = Some(shape);
        Ok(())
    }
}

/// Emit the ModRM byte (plus SIB and displacement) once both sides are known.
fn complete_modrm(
    context: &mut EncodeContext,
    reg: RegField,
    rm: MemoryShape,
) -> Result<(), EncodeError> {
    match (rm.is_reg, &rm.base, &rm.index) {
        (true, Some(base), _) => {
            context.elements.push(EncodingElement::ModRm {
                mode: Mode::Reg,
                reg,
                rm: RmField::Reg(base.clone()),
            });
            Ok(())
        }
        (false, Some(base), None) => {
            let (mode, disp) = displacement_mode(rm.disp);
            context.elements.push(EncodingElement::ModRm {
                mode,
                reg,
                rm: RmField::Reg(base.clone()),
            });
            context.elements.extend(disp);
            Ok(())
        }
        (false, Some(base), Some((index, scale))) => {
            let (mode, disp) = displacement_mode(rm.disp);
            context.elements.push(EncodingElement::ModRm { mode, reg, rm: RmField::Sib });
            context.elements.push(EncodingElement::Sib {
                base: reg_number(base),
                index: *index,
                scale: *scale,
            });
            context.elements.extend(disp);
            Ok(())
        }
        (false, None, Some((index, scale))) => {
            // x86's no-base SIB convention: base = EBP, mandatory disp32.
            context.elements.push(EncodingElement::ModRm {
                mode: Mode::Memory,
                reg,
                rm: RmField::Sib,
            });
            context.elements.push(EncodingElement::Sib {
                base: reg_number("EBP"),
                index: *index,
                scale: *scale,
            });
            context.elements.push(EncodingElement::Disp32(rm.disp.unwrap_or(0)));
            Ok(())
        }
        _ => Err(EncodeError::NoEncoding),
    }
}

/// ModRM mode and displacement element for a base-register operand.
fn displacement_mode(disp: Option<i64>) -> (Mode, Option<EncodingElement>) {
    match disp {
        None => (Mode::Memory, None),
        Some(d) if -128 < d && d < 127 => (Mode::MemoryDisp8, Some(EncodingElement::Disp8(d))),
        Some(d) => (Mode::MemoryDisp32, Some(EncodingElement::Disp32(d))),
    }
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------
