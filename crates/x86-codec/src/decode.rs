//! Instruction decoder — raw bytes → AST plus the encoding trace.
//!
//! A decision trie is built once from the catalog: templates are grouped by
//! their first concrete opcode byte, singleton groups recurse into the next
//! pattern step, and groups that can no longer be told apart by opcode bytes
//! branch on the ModRM reg field. Decoding walks the trie with an owned
//! context threaded through every step; the first error is sticky and stops
//! all further consumption.

use std::sync::LazyLock;

use tracing::debug;

use crate::catalog::{InsnTemplate, OpcodeStep, OperandKind, CATALOG};
use crate::encode::{
    encoding_size, EncodingElement, Mode, RegField, RmField, PROGRAM_COUNTER,
};
use crate::syntax::{AstInstr, AstOperand, MemoryOperand, OperandWidth, SizeClass};

// ---------------------------------------------------------------------------
//  Errors
// ---------------------------------------------------------------------------

/// Decode failure. Sticky: once raised, the current call consumes nothing
/// more and yields no instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("not enough bytes")]
    TruncatedInput,
    #[error("unknown opcode {0:02x}")]
    UnknownOpcode(u8),
    #[error("unknown prefix {0:02x}")]
    UnknownPrefix(u8),
    #[error("no opcode variant for ModRM reg field {0}")]
    UnmatchedModRmExtension(u8),
    #[error("not implemented: {0}")]
    NotYetImplemented(&'static str),
    #[error("no register to decode")]
    MissingRegister,
    #[error("expecting a ModRM byte")]
    MissingModRm,
    #[error("operand template cannot be decoded")]
    UnresolvedOperand,
}

impl serde::Serialize for DecodeError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DecodeError", 1)?;
        state.serialize_field("msg", &self.to_string())?;
        state.end()
    }
}

// ---------------------------------------------------------------------------
//  Results
// ---------------------------------------------------------------------------

/// A decoded instruction: display name (with the template's canonical
/// signature in parentheses) plus the encoding trace.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DecodedInstruction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Vec<EncodingElement>>,
}

/// Result of a decode entry point: zero or more instructions plus errors.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DecodeResult {
    pub errors: Vec<DecodeError>,
    pub instructions: Vec<DecodedInstruction>,
}

// ---------------------------------------------------------------------------
//  Decision trie
// ---------------------------------------------------------------------------

/// A node of the opcode decision trie.
#[derive(Debug)]
enum DecoderNode {
    /// Peek the next byte and branch on its value.
    BranchOnOpcode(Vec<Branch>),
    /// Consume one opcode byte.
    ConsumeOpcode(Box<DecoderNode>),
    /// Consume one byte with a register embedded in its low 3 bits.
    ConsumeRegByte(Box<DecoderNode>),
    /// Consume a ModRM byte and record its fields.
    ConsumeModRm(Box<DecoderNode>),
    /// Branch on the recorded ModRM reg field (opcode extension).
    BranchOnRegField(Vec<Branch>),
    /// Pattern exhausted: decode the template's operands (catalog index).
    Terminal(usize),
    /// The 0x66 operand-size override: flip the width, restart at the root.
    SizePrefix,
}

#[derive(Debug)]
struct Branch {
    value: u8,
    node: DecoderNode,
}

/// A template whose opcode pattern is partially consumed.
#[derive(Clone, Copy)]
struct Pending {
    template: usize,
    offset: usize,
}

impl Pending {
    fn steps(self) -> &'static [OpcodeStep] {
        &CATALOG.templates()[self.template].pattern[self.offset..]
    }

    fn advanced(self) -> Pending {
        if self.steps().is_empty() {
            self
        } else {
            Pending { template: self.template, offset: self.offset + 1 }
        }
    }
}

/// The process-wide decision trie, built once from the catalog.
static DECODER: LazyLock<DecoderNode> = LazyLock::new(|| {
    debug!("DECODER: building decision trie over {} templates", CATALOG.len());
    build_root()
});

fn build_root() -> DecoderNode {
    let pendings: Vec<(u8, Pending)> = (0..CATALOG.len())
        .flat_map(|template| extract_opcodes(Pending { template, offset: 0 }))
        .collect();
    let mut branches = build_branches(pendings);
    branches.push(Branch { value: 0x66, node: DecoderNode::SizePrefix });
    DecoderNode::BranchOnOpcode(branches)
}

/// Group pendings by byte value, first-seen order (catalog order breaks ties).
fn build_branches(pendings: Vec<(u8, Pending)>) -> Vec<Branch> {
    let mut groups: Vec<(u8, Vec<Pending>)> = Vec::new();
    for (value, pending) in pendings {
        match groups.iter_mut().find(|(v, _)| *v == value) {
            Some((_, group)) => group.push(pending),
            None => groups.push((value, vec![pending])),
        }
    }
    groups
        .into_iter()
        .map(|(value, group)| Branch { value, node: process_group(group) })
        .collect()
}

fn process_group(group: Vec<Pending>) -> DecoderNode {
    if let [pending] = group[..] {
        return process_steps(pending);
    }
    let advanced: Vec<Pending> = group.into_iter().map(Pending::advanced).collect();
    if advanced.iter().all(|p| matches!(p.steps().first(), Some(OpcodeStep::Fixed(_)))) {
        // Still separable by opcode bytes.
        let pendings = advanced.into_iter().flat_map(extract_opcodes).collect();
        DecoderNode::ConsumeOpcode(Box::new(DecoderNode::BranchOnOpcode(build_branches(
            pendings,
        ))))
    } else {
        // All remaining disambiguation comes from the ModRM reg field.
        let branches = advanced.into_iter().filter_map(extract_extension).collect();
        DecoderNode::ConsumeOpcode(Box::new(DecoderNode::ConsumeModRm(Box::new(
            DecoderNode::BranchOnRegField(branches),
        ))))
    }
}

fn process_steps(pending: Pending) -> DecoderNode {
    match pending.steps().first() {
        None => DecoderNode::Terminal(pending.template),
        Some(OpcodeStep::Fixed(_)) => {
            DecoderNode::ConsumeOpcode(Box::new(process_group(vec![pending.advanced()])))
        }
        Some(OpcodeStep::WithRegister(_)) => {
            DecoderNode::ConsumeRegByte(Box::new(process_group(vec![pending.advanced()])))
        }
        Some(OpcodeStep::Extension(value)) => {
            DecoderNode::ConsumeModRm(Box::new(DecoderNode::BranchOnRegField(vec![Branch {
                value: *value,
                node: process_group(vec![pending.advanced()]),
            }])))
        }
        Some(OpcodeStep::ModRm) => {
            DecoderNode::ConsumeModRm(Box::new(process_group(vec![pending.advanced()])))
        }
    }
}

/// Concrete first-byte values of a pending pattern. A register-embedded
/// opcode expands into its 8 derivable byte values.
fn extract_opcodes(pending: Pending) -> Vec<(u8, Pending)> {
    match pending.steps().first() {
        Some(OpcodeStep::Fixed(value)) => vec![(*value, pending)],
        Some(OpcodeStep::WithRegister(value)) => {
            (0u8..8).map(|r| (*value | r, pending)).collect()
        }
        _ => Vec::new(),
    }
}

fn extract_extension(pending: Pending) -> Option<Branch> {
    match pending.steps().first() {
        Some(OpcodeStep::Extension(value)) => Some(Branch {
            value: *value,
            node: process_steps(pending.advanced()),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
//  Decode context
// ---------------------------------------------------------------------------

struct DecodeContext<'a> {
    bytes: &'a [u8],
    length: usize,
    width: OperandWidth,
    reg: Option<u8>,
    mode: Option<Mode>,
    rm: Option<u8>,
    template: Option<usize>,
    elements: Vec<EncodingElement>,
    operands: Vec<AstOperand>,
    error: Option<DecodeError>,
}

impl<'a> DecodeContext<'a> {
    fn new(width: OperandWidth, bytes: &'a [u8]) -> DecodeContext<'a> {
        DecodeContext {
            bytes,
            length: bytes.len(),
            width,
            reg: None,
            mode: None,
            rm: None,
            template: None,
            elements: Vec::new(),
            operands: Vec::new(),
            error: None,
        }
    }

    fn fail(mut self, error: DecodeError) -> DecodeContext<'a> {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    fn take_byte(&mut self) -> Option<u8> {
        let (first, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(*first)
    }

    fn take_word(&mut self) -> Option<i64> {
        if self.bytes.len() < 2 {
            return None;
        }
        let value = u16::from_le_bytes([self.bytes[0], self.bytes[1]]);
        self.bytes = &self.bytes[2..];
        Some(i64::from(value))
    }

    /// 32-bit reads are signed, matching the element vocabulary's i64
    /// values produced by the encoder's signed arithmetic.
    fn take_long(&mut self) -> Option<i64> {
        if self.bytes.len() < 4 {
            return None;
        }
        let value = i32::from_le_bytes([
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
        ]);
        self.bytes = &self.bytes[4..];
        Some(i64::from(value))
    }

    fn consumed(&self) -> usize {
        self.length - self.bytes.len()
    }

    /// Retag the emitted ModRM's reg slot as an opcode extension.
    fn patch_reg_ext(&mut self, value: u8) {
        for element in &mut self.elements {
            if let EncodingElement::ModRm { reg, .. } = element {
                *reg = RegField::Ext(value);
            }
        }
    }

    fn patch_reg_name(&mut self, size: SizeClass, register: u8) {
        for element in &mut self.elements {
            if let EncodingElement::ModRm { reg, .. } = element {
                *reg = RegField::Reg(reg_name(size, register).to_string());
            }
        }
    }

    fn patch_rm_name(&mut self, size: SizeClass, register: u8) {
        for element in &mut self.elements {
            if let EncodingElement::ModRm { rm, .. } = element {
                *rm = RmField::Reg(reg_name(size, register).to_string());
            }
        }
    }
}

/// Register name at a concrete size. A still-ambiguous size falls back to
/// the 32-bit table; callers resolve before naming.
pub fn reg_name(size: SizeClass, register: u8) -> &'static str {
    const R8: [&str; 8] = ["AL", "CL", "DL", "BL", "AH", "CH", "DH", "BH"];
    const R16: [&str; 8] = ["AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI"];
    const R32: [&str; 8] = ["EAX", "ECX", "EDX", "EBX", "ESP", "EBP", "ESI", "EDI"];
    let index = (register & 0x07) as usize;
    match size {
        SizeClass::S8 => R8[index],
        SizeClass::S16 => R16[index],
        SizeClass::S32 | SizeClass::S16Or32 => R32[index],
    }
}

// ---------------------------------------------------------------------------
//  Entry points
// ---------------------------------------------------------------------------

/// Decode a single instruction from the head of a byte buffer.
pub fn decode_bytes(width: OperandWidth, bytes: &[u8]) -> DecodeResult {
    let context = walk(&DECODER, DecodeContext::new(width, bytes));
    match context.error {
        Some(error) => DecodeResult { errors: vec![error], instructions: Vec::new() },
        None => {
            let instructions = context
                .template
                .map(|index| {
                    let template = &CATALOG.templates()[index];
                    vec![DecodedInstruction {
                        name: instruction_name(template, &context.operands),
                        encoding: Some(context.elements),
                    }]
                })
                .unwrap_or_default();
            DecodeResult { errors: Vec::new(), instructions }
        }
    }
}

/// Decode a single instruction from free-form hex text. Non-hex characters
/// are skipped; a dangling nibble becomes its own byte.
pub fn decode(width: OperandWidth, content: &str) -> DecodeResult {
    decode_bytes(width, &to_bytes(content))
}

/// Decode a byte stream instruction by instruction, stopping at the first
/// error. The cursor advances by the encoding size of each instruction.
pub fn decode_stream(width: OperandWidth, bytes: &[u8]) -> DecodeResult {
    let mut remaining = bytes;
    let mut result = DecodeResult { errors: Vec::new(), instructions: Vec::new() };
    while !remaining.is_empty() {
        let one = decode_bytes(width, remaining);
        if !one.errors.is_empty() {
            result.errors.extend(one.errors);
            break;
        }
        let Some(instruction) = one.instructions.into_iter().next() else {
            break;
        };
        let size = instruction.encoding.as_deref().map_or(0, encoding_size);
        result.instructions.push(instruction);
        if size == 0 {
            break;
        }
        remaining = &remaining[size.min(remaining.len())..];
    }
    result
}

/// Pack the hex digits of a text into bytes, high nibble first.
pub fn to_bytes(content: &str) -> Vec<u8> {
    let mut result = Vec::new();
    let mut pending: Option<u8> = None;
    for c in content.chars() {
        if let Some(nibble) = c.to_digit(16) {
            match pending.take() {
                Some(high) => result.push((high << 4) | nibble as u8),
                None => pending = Some(nibble as u8),
            }
        }
    }
    if let Some(nibble) = pending {
        result.push(nibble);
    }
    result
}

fn instruction_name(template: &InsnTemplate, operands: &[AstOperand]) -> String {
    let instr = AstInstr { name: template.mnemonic.clone(), operands: operands.to_vec() };
    format!("{}  ({})", instr, template.signature())
}

// ---------------------------------------------------------------------------
//  Trie walk
// ---------------------------------------------------------------------------

fn walk<'a>(node: &DecoderNode, mut context: DecodeContext<'a>) -> DecodeContext<'a> {
    if context.error.is_some() {
        return context;
    }
    match node {
        DecoderNode::BranchOnOpcode(branches) => {
            let Some(byte) = context.bytes.first().copied() else {
                return context.fail(DecodeError::TruncatedInput);
            };
            match branches.iter().find(|b| b.value == byte) {
                Some(branch) => walk(&branch.node, context),
                None => context.fail(DecodeError::UnknownOpcode(byte)),
            }
        }
        DecoderNode::ConsumeOpcode(next) => {
            let Some(byte) = context.take_byte() else {
                return context.fail(DecodeError::TruncatedInput);
            };
            context.elements.push(EncodingElement::Opcode(byte));
            walk(next, context)
        }
        DecoderNode::ConsumeRegByte(next) => {
            let Some(byte) = context.take_byte() else {
                return context.fail(DecodeError::TruncatedInput);
            };
            let register = byte & 0x07;
            context.elements.push(EncodingElement::OpcodeAndReg {
                opcode: (byte >> 3) & 0x1f,
                register: register as i8,
            });
            context.reg = Some(register);
            walk(next, context)
        }
        DecoderNode::ConsumeModRm(next) => {
            let Some(byte) = context.take_byte() else {
                return context.fail(DecodeError::TruncatedInput);
            };
            let mode = decode_mode(byte >> 6);
            let reg = (byte >> 3) & 0x07;
            let rm = byte & 0x07;
            // Register fields are named at the active width here; operand
            // decoding repatches them when an 8-bit size resolves.
            let size = context.width.size();
            context.elements.push(EncodingElement::ModRm {
                mode,
                reg: RegField::Reg(reg_name(size, reg).to_string()),
                rm: RmField::Reg(reg_name(size, rm).to_string()),
            });
            context.mode = Some(mode);
            context.reg = Some(reg);
            context.rm = Some(rm);
            walk(next, context)
        }
        DecoderNode::BranchOnRegField(branches) => {
            let Some(reg) = context.reg else {
                return context.fail(DecodeError::MissingModRm);
            };
            match branches.iter().find(|b| b.value == reg) {
                Some(branch) => {
                    context.patch_reg_ext(reg);
                    walk(&branch.node, context)
                }
                None => context.fail(DecodeError::UnmatchedModRmExtension(reg)),
            }
        }
        DecoderNode::SizePrefix => match context.take_byte() {
            Some(0x66) => {
                context.width = context.width.flipped();
                context.elements.push(EncodingElement::Prefix(0x66));
                walk(&DECODER, context)
            }
            Some(byte) => context.fail(DecodeError::UnknownPrefix(byte)),
            None => context.fail(DecodeError::TruncatedInput),
        },
        DecoderNode::Terminal(index) => {
            context.template = Some(*index);
            let template = &CATALOG.templates()[*index];
            for kind in &template.operands {
                if context.error.is_some() {
                    break;
                }
                context = decode_operand(*kind, context);
            }
            context
        }
    }
}

fn decode_mode(bits: u8) -> Mode {
    match bits & 0x03 {
        0 => Mode::Memory,
        1 => Mode::MemoryDisp8,
        2 => Mode::MemoryDisp32,
        _ => Mode::Reg,
    }
}

// ---------------------------------------------------------------------------
//  Operand decoding
// ---------------------------------------------------------------------------

fn decode_operand(kind: OperandKind, context: DecodeContext<'_>) -> DecodeContext<'_> {
    match kind {
        OperandKind::Reg(size) => decode_reg(size, context),
        OperandKind::FixedReg(size, name) => {
            let mut context = context;
            let resolved = context.width.resolve(size);
            context.operands.push(AstOperand::Register(
                crate::catalog::fixed_reg_display(resolved, name).to_string(),
            ));
            context
        }
        OperandKind::RegMem(size) => decode_rm(size, context),
        OperandKind::Imm(size) => decode_imm(size, context),
        OperandKind::Rel(size) => decode_rel(size, context),
        OperandKind::Unsupported => context.fail(DecodeError::UnresolvedOperand),
    }
}

fn decode_reg<'a>(size: SizeClass, mut context: DecodeContext<'a>) -> DecodeContext<'a> {
    let Some(register) = context.reg else {
        return context.fail(DecodeError::MissingRegister);
    };
    let resolved = context.width.resolve(size);
    if resolved == SizeClass::S8 {
        context.patch_reg_name(SizeClass::S8, register);
    }
    context
        .operands
        .push(AstOperand::Register(reg_name(resolved, register).to_string()));
    context
}

fn decode_rm<'a>(size: SizeClass, mut context: DecodeContext<'a>) -> DecodeContext<'a> {
    match context.mode {
        Some(Mode::Reg) => {
            let register = context.rm.unwrap_or(0);
            let resolved = context.width.resolve(size);
            if resolved == SizeClass::S8 {
                context.patch_rm_name(SizeClass::S8, register);
            }
            context
                .operands
                .push(AstOperand::Register(reg_name(resolved, register).to_string()));
            context
        }
        Some(Mode::Memory) => match context.rm {
            Some(4) => context.fail(DecodeError::NotYetImplemented("SIB without displacement")),
            Some(5) => {
                // Displacement-only address, read at the active width. The
                // element is tagged at the width actually read so the byte
                // count stays exact even for an 8-bit slot.
                let resolved = context.width.resolve(size);
                let value = match context.width {
                    OperandWidth::Bits32 => context.take_long(),
                    OperandWidth::Bits16 => context.take_word(),
                };
                let Some(value) = value else {
                    return context.fail(DecodeError::TruncatedInput);
                };
                context
                    .elements
                    .push(EncodingElement::Immediate { size: context.width.size(), value });
                context.operands.push(AstOperand::EffectiveAddress(MemoryOperand {
                    size: resolved,
                    base: None,
                    index: None,
                    displacement: value,
                }));
                context
            }
            Some(rm) => {
                context.patch_rm_name(SizeClass::S32, rm);
                context.operands.push(AstOperand::EffectiveAddress(MemoryOperand {
                    size,
                    base: Some(reg_name(SizeClass::S32, rm).to_string()),
                    index: None,
                    displacement: 0,
                }));
                context
            }
            None => context.fail(DecodeError::MissingModRm),
        },
        Some(Mode::MemoryDisp8) => match context.rm {
            Some(4) => context.fail(DecodeError::NotYetImplemented("SIB with disp8")),
            Some(rm) => {
                let Some(byte) = context.take_byte() else {
                    return context.fail(DecodeError::TruncatedInput);
                };
                let value = i64::from(byte as i8);
                let width_size = context.width.size();
                context.patch_rm_name(width_size, rm);
                context.elements.push(EncodingElement::Disp8(value));
                context.operands.push(AstOperand::EffectiveAddress(MemoryOperand {
                    size: width_size,
                    base: Some(reg_name(width_size, rm).to_string()),
                    index: None,
                    displacement: value,
                }));
                context
            }
            None => context.fail(DecodeError::MissingModRm),
        },
        Some(Mode::MemoryDisp32) => {
            context.fail(DecodeError::NotYetImplemented("memory with disp32"))
        }
        None => context.fail(DecodeError::MissingModRm),
    }
}

fn decode_imm<'a>(size: SizeClass, mut context: DecodeContext<'a>) -> DecodeContext<'a> {
    let resolved = context.width.resolve(size);
    let value = match resolved {
        SizeClass::S8 => context.take_byte().map(i64::from),
        SizeClass::S16 => context.take_word(),
        _ => context.take_long(),
    };
    let Some(value) = value else {
        return context.fail(DecodeError::TruncatedInput);
    };
    context.elements.push(EncodingElement::Immediate { size: resolved, value });
    context.operands.push(AstOperand::Immediate(value));
    context
}

fn decode_rel<'a>(size: SizeClass, mut context: DecodeContext<'a>) -> DecodeContext<'a> {
    let resolved = context.width.resolve(size);
    let value = match resolved {
        SizeClass::S8 => context.take_byte().map(i64::from),
        SizeClass::S16 => context.take_word(),
        _ => context.take_long(),
    };
    let Some(value) = value else {
        return context.fail(DecodeError::TruncatedInput);
    };
    // The raw offset is relative to the end of the instruction; the operand
    // shows the resolved target address.
    let target = PROGRAM_COUNTER + value + context.consumed() as i64;
    context.elements.push(EncodingElement::Immediate { size: resolved, value });
    context.operands.push(AstOperand::Immediate(target));
    context
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn decode32(bytes: &[u8]) -> DecodeResult {
        decode_bytes(OperandWidth::Bits32, bytes)
    }

    fn single(result: &DecodeResult) -> &DecodedInstruction {
        assert_eq!(result.errors, vec![], "unexpected errors");
        assert_eq!(result.instructions.len(), 1);
        &result.instructions[0]
    }

    #[test]
    fn test_decode_register_embedded_opcode() {
        let result = decode32(&[0xb9, 0xf8, 0x00, 0x00, 0x08]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV ECX, 80000f8h  (MOV r16/32,imm16/32)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::OpcodeAndReg { opcode: 23, register: 1 },
                EncodingElement::Immediate { size: SizeClass::S32, value: 0x080000f8 },
            ])
        );
    }

    #[test]
    fn test_decode_empty_input() {
        let result = decode32(&[]);
        assert_eq!(result.errors, vec![DecodeError::TruncatedInput]);
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let result = decode32(&[0xd9]);
        assert_eq!(result.errors, vec![DecodeError::UnknownOpcode(0xd9)]);
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_decode_truncated_immediate() {
        let result = decode32(&[0xb8, 0x01]);
        assert_eq!(result.errors, vec![DecodeError::TruncatedInput]);
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_decode_modrm_extension_branch() {
        // 0xff is shared by DEC /1 and INC /0.
        let dec = decode32(&[0xff, 0xc8]);
        assert_eq!(
            single(&dec).name,
            "DEC EAX  (DEC r/m16/32)"
        );
        let inc = decode32(&[0xff, 0xc1]);
        assert_eq!(single(&inc).name, "INC ECX  (INC r/m16/32)");
        // The reg slot is retagged as an opcode extension.
        assert!(matches!(
            single(&dec).encoding.as_deref(),
            Some([_, EncodingElement::ModRm { reg: RegField::Ext(1), .. }])
        ));
    }

    #[test]
    fn test_decode_unmatched_extension() {
        // 0xff /7 selects no template.
        let result = decode32(&[0xff, 0xf8]);
        assert_eq!(result.errors, vec![DecodeError::UnmatchedModRmExtension(7)]);
    }

    #[test]
    fn test_decode_two_byte_opcode() {
        let result = decode32(&[0x0f, 0xaf, 0xdf]);
        assert_eq!(single(&result).name, "IMUL EBX, EDI  (IMUL r16/32,r/m16/32)");
    }

    #[test]
    fn test_decode_modrm_extension_after_two_opcode_bytes() {
        let result = decode32(&[0x0f, 0x01, 0x10]);
        assert_eq!(single(&result).name, "LGDT [EAX]  (LGDT r/m16/32)");
    }

    #[test]
    fn test_decode_relative_offset() {
        let result = decode32(&[0x0f, 0x84, 0x17, 0x00, 0x00, 0x00]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "JE 800001dh  (JE rel16/32)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::Opcode(0x0f),
                EncodingElement::Opcode(0x84),
                EncodingElement::Immediate { size: SizeClass::S32, value: 0x17 },
            ])
        );
    }

    #[test]
    fn test_decode_backward_jump() {
        let result = decode32(&[0xe9, 0xe1, 0xff, 0xff, 0xff]);
        // Raw offset -31, resolved against pc + consumed bytes.
        assert_eq!(single(&result).name, "JMP 7ffffe6h  (JMP rel16/32)");
    }

    #[test]
    fn test_decode_memory_operand_with_byte_size() {
        let result = decode32(&[0xc6, 0x01, 0x0a]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV BYTEPTR [ECX], 10  (MOV r/m8,imm8)");
        assert_eq!(
            instruction.encoding,
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
    fn test_decode_displacement_only_memory() {
        // rm=5 in memory mode: the 4-byte displacement is read at the
        // active width even though the slot is 8-bit, and the element's
        // size tag must account for all 7 consumed bytes.
        let result = decode32(&[0xc6, 0x05, 0x10, 0x20, 0x00, 0x00, 0x0a]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV BYTEPTR [2010h], 10  (MOV r/m8,imm8)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::Opcode(0xc6),
                EncodingElement::ModRm {
                    mode: Mode::Memory,
                    reg: RegField::Ext(0),
                    rm: RmField::Reg("EBP".to_string()),
                },
                EncodingElement::Immediate { size: SizeClass::S32, value: 0x2010 },
                EncodingElement::Immediate { size: SizeClass::S8, value: 10 },
            ])
        );
        assert_eq!(encoding_size(instruction.encoding.as_deref().unwrap()), 7);
    }

    #[test]
    fn test_decode_eight_bit_reg_patches_modrm() {
        // MOV r/m8,r8 in memory mode: 88 11 = mov [ecx], dl.
        let result = decode32(&[0x88, 0x11]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV BYTEPTR [ECX], DL  (MOV r/m8,r8)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::Opcode(0x88),
                EncodingElement::ModRm {
                    mode: Mode::Memory,
                    reg: RegField::Reg("DL".to_string()),
                    rm: RmField::Reg("ECX".to_string()),
                },
            ])
        );
    }

    #[test]
    fn test_decode_disp8_memory() {
        let result = decode32(&[0x89, 0x45, 0xf8]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV [EBP-8], EAX  (MOV r/m16/32,r16/32)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::Opcode(0x89),
                EncodingElement::ModRm {
                    mode: Mode::MemoryDisp8,
                    reg: RegField::Reg("EAX".to_string()),
                    rm: RmField::Reg("EBP".to_string()),
                },
                EncodingElement::Disp8(-8),
            ])
        );
    }

    #[test]
    fn test_decode_sib_not_implemented() {
        let result = decode32(&[0x89, 0x04, 0x86]);
        assert_eq!(
            result.errors,
            vec![DecodeError::NotYetImplemented("SIB without displacement")]
        );
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_decode_size_prefix_flips_width() {
        let result = decode32(&[0x66, 0xb8, 0x34, 0x12]);
        let instruction = single(&result);
        assert_eq!(instruction.name, "MOV AX, 1234h  (MOV r16/32,imm16/32)");
        assert_eq!(
            instruction.encoding,
            Some(vec![
                EncodingElement::Prefix(0x66),
                EncodingElement::OpcodeAndReg { opcode: 23, register: 0 },
                EncodingElement::Immediate { size: SizeClass::S16, value: 0x1234 },
            ])
        );
        assert_eq!(encoding_size(instruction.encoding.as_deref().unwrap()), 4);
    }

    #[test]
    fn test_decode_unsupported_operand_form() {
        // 0x8c = MOV r/m16,sreg; the sreg slot is out of scope.
        let result = decode32(&[0x8c, 0xc0]);
        assert_eq!(result.errors, vec![DecodeError::UnresolvedOperand]);
        assert!(result.instructions.is_empty());
    }

    #[test]
    fn test_decode_hex_text() {
        let result = decode(OperandWidth::Bits32, "cd 80");
        assert_eq!(single(&result).name, "INT 128  (INT imm8)");
    }

    #[test]
    fn test_to_bytes_tolerant_scanner() {
        assert_eq!(to_bytes("b9 f8"), vec![0xb9, 0xf8]);
        assert_eq!(to_bytes("0xB9,0xF8"), vec![0x0b, 0x90, 0xf8]);
        assert_eq!(to_bytes("abc"), vec![0xab, 0x0c]);
        assert_eq!(to_bytes(""), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_stream_two_instructions() {
        let result = decode_stream(OperandWidth::Bits32, &[0x90, 0xc3]);
        assert_eq!(result.errors, vec![]);
        let names: Vec<&str> =
            result.instructions.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["NOP   (NOP )", "RET   (RET )"]);
    }

    #[test]
    fn test_decode_stream_stops_at_error() {
        let result = decode_stream(OperandWidth::Bits32, &[0x90, 0xd9, 0x90]);
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.errors, vec![DecodeError::UnknownOpcode(0xd9)]);
    }
}
