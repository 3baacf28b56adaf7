//! x86 instruction codec.
//!
//! This crate provides:
//!
//! - **Parser** — Intel-syntax assembly text to an operand-level AST
//! - **Search** — catalog template matching over a parsed instruction
//! - **Encoder** — template plus operands to a sequence of encoding elements
//! - **Decoder** — raw bytes back to the AST, with the element trace
//! - **Diagrams** — labelled byte/bit-field breakdown of an encoding
//!
//! The encoding element is the common currency: the encoder produces it,
//! the decoder reproduces it, `element_bytes` serializes it, and
//! `to_diagram` explains it.

pub mod catalog;
pub mod decode;
pub mod diagram;
pub mod encode;
pub mod lexer;
pub mod parser;
pub mod search;
pub mod syntax;

pub use catalog::{InsnCatalog, InsnTemplate, OpcodeStep, OperandKind, CATALOG};
pub use decode::{
    decode, decode_bytes, decode_stream, to_bytes, DecodeError, DecodeResult,
    DecodedInstruction,
};
pub use diagram::{to_diagram, DiagramBlock, DiagramElement};
pub use encode::{
    element_bytes, encode, encoding_size, EncodeError, EncodingElement, Mode, RegField,
    RmField, PROGRAM_COUNTER,
};
pub use parser::{parse, ParseError, ParseOutcome};
pub use search::{search, SearchResult};
pub use syntax::{
    AstInstr, AstOperand, IndexExpr, MemoryOperand, OperandWidth, SizeClass,
};
