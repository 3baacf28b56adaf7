//! Recursive-descent assembly parser.
//!
//! One token of lookahead, case-insensitive mnemonics and register names
//! (normalized to uppercase). Parsing is best-effort: errors are collected
//! into a list and never abort the whole parse — a failed operand is
//! dropped while siblings already parsed are kept.

use tracing::warn;

use crate::lexer::{Lexer, Token};
use crate::syntax::{AstInstr, AstOperand, IndexExpr, MemoryOperand, OperandWidth, SizeClass};

// ---------------------------------------------------------------------------
//  Errors
// ---------------------------------------------------------------------------

/// A parse diagnostic. Collected, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected char '{0}'")]
    Lexical(char),
    #[error("expecting {0}")]
    Syntax(&'static str),
}

impl serde::Serialize for ParseError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ParseError", 1)?;
        state.serialize_field("msg", &self.to_string())?;
        state.end()
    }
}

/// Parse outcome: a best-effort AST plus every diagnostic encountered.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ParseOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instr: Option<AstInstr>,
    pub errors: Vec<ParseError>,
}

/// Parse one assembly instruction.
pub fn parse(content: &str, width: OperandWidth) -> ParseOutcome {
    let mut parser = Parser::new(content, width);
    let instr = parser.parse_assembly();
    ParseOutcome { instr, errors: parser.errors }
}

// ---------------------------------------------------------------------------
//  Parser
// ---------------------------------------------------------------------------

/// An effective-address term before reduction into base/index/displacement.
enum EaTerm {
    Register { name: String, scale: Option<String> },
    Displacement { positive: bool, literal: String },
}

struct Parser {
    lexer: Lexer,
    current: Token,
    errors: Vec<ParseError>,
    size: SizeClass,
}

impl Parser {
    fn new(content: &str, width: OperandWidth) -> Parser {
        let mut parser = Parser {
            lexer: Lexer::new(content),
            current: Token::Eof,
            errors: Vec::new(),
            size: width.size(),
        };
        parser.advance();
        parser
    }

    fn parse_assembly(&mut self) -> Option<AstInstr> {
        let name = self.parse_ident()?;
        let operands = self.parse_operands();
        Some(AstInstr { name: name.to_uppercase(), operands })
    }

    fn parse_operands(&mut self) -> Vec<AstOperand> {
        let mut operands = Vec::new();
        while self.current != Token::Eof {
            let Some(operand) = self.parse_operand() else {
                break;
            };
            operands.push(operand);
            if self.current == Token::Comma {
                self.advance();
            }
        }
        operands
    }

    fn parse_operand(&mut self) -> Option<AstOperand> {
        match self.current.clone() {
            Token::Ident(text) => {
                let name = text.to_uppercase();
                self.advance();
                match name.as_str() {
                    "BYTEPTR" => self.parse_memory(SizeClass::S8),
                    "WORDPTR" => self.parse_memory(SizeClass::S16),
                    _ => Some(AstOperand::Register(name)),
                }
            }
            Token::Integer(literal) => {
                self.advance();
                Some(AstOperand::Immediate(imm_value(&literal).unwrap_or(0)))
            }
            Token::LBracket => self.parse_memory(self.size),
            _ => {
                self.error_expecting("IDENT, INTEGER or [");
                None
            }
        }
    }

    fn parse_memory(&mut self, size: SizeClass) -> Option<AstOperand> {
        if self.current != Token::LBracket {
            self.error_expecting("[");
            return None;
        }
        self.advance();
        let terms = self.parse_effective_address()?;
        Some(AstOperand::EffectiveAddress(self.make_memory_operand(terms, size)))
    }

    fn parse_effective_address(&mut self) -> Option<Vec<EaTerm>> {
        let mut terms = Vec::new();
        let mut positive = true;
        loop {
            terms.push(self.parse_ea_term(positive)?);
            match self.current {
                Token::Plus => {
                    self.advance();
                    positive = true;
                }
                Token::Minus => {
                    self.advance();
                    positive = false;
                }
                Token::RBracket => {
                    self.advance();
                    return Some(terms);
                }
                _ => {
                    self.error_expecting("]");
                    return None;
                }
            }
        }
    }

    fn parse_ea_term(&mut self, positive: bool) -> Option<EaTerm> {
        match self.current.clone() {
            Token::Ident(text) => {
                let name = text.to_uppercase();
                self.advance();
                let scale = self.parse_scale()?;
                Some(EaTerm::Register { name, scale })
            }
            Token::Integer(literal) => {
                self.advance();
                Some(EaTerm::Displacement { positive, literal })
            }
            _ => {
                self.error_expecting("IDENT or INTEGER");
                None
            }
        }
    }

    /// Optional `* INTEGER` scale factor after an index register.
    fn parse_scale(&mut self) -> Option<Option<String>> {
        if self.current != Token::Star {
            return Some(None);
        }
        self.advance();
        match self.current.clone() {
            Token::Integer(literal) => {
                self.advance();
                Some(Some(literal))
            }
            _ => {
                self.error_expecting("INTEGER");
                None
            }
        }
    }

    /// Fold the term list left to right into base/index/displacement.
    fn make_memory_operand(&mut self, terms: Vec<EaTerm>, size: SizeClass) -> MemoryOperand {
        let mut memory =
            MemoryOperand { size, base: None, index: None, displacement: 0 };
        for term in terms {
            match term {
                EaTerm::Register { name, scale: None } => {
                    if memory.base.is_some() {
                        memory.index = Some(IndexExpr { register: name, scale: 1 });
                    } else {
                        memory.base = Some(name);
                    }
                }
                EaTerm::Register { name, scale: Some(scale) } => {
                    let scale = scale_of(&scale);
                    // A *1 index behaves as an unscaled register for
                    // base-filling purposes.
                    if memory.base.is_none() && scale == 1 {
                        memory.base = Some(name);
                    } else {
                        memory.index = Some(IndexExpr { register: name, scale });
                    }
                }
                EaTerm::Displacement { positive, literal } => {
                    if let Some(value) = imm_value(&literal) {
                        memory.displacement += if positive { value } else { -value };
                    }
                }
            }
        }
        memory
    }

    fn parse_ident(&mut self) -> Option<String> {
        if let Token::Ident(text) = self.current.clone() {
            self.advance();
            Some(text)
        } else {
            self.error_expecting("IDENT");
            None
        }
    }

    fn error_expecting(&mut self, expected: &'static str) {
        self.errors.push(ParseError::Syntax(expected));
    }

    fn advance(&mut self) {
        self.current = self.lexer.next_token();
        // Lexical errors are reported and skipped so parsing continues
        // on the next well-formed token.
        while let Token::Error(c) = self.current {
            self.errors.push(ParseError::Lexical(c));
            self.current = self.lexer.next_token();
        }
    }
}

/// Scale factors are limited to 1, 2, 4, 8; anything else falls back to 1.
fn scale_of(literal: &str) -> u8 {
    match decimal_prefix(literal) {
        Some(x @ (1 | 2 | 4 | 8)) => x as u8,
        _ => {
            warn!("SCALE: invalid scale factor {literal}");
            1
        }
    }
}

/// Integer literal value: trailing `h` means hex, otherwise the leading
/// decimal digits count. The `b` marker is tokenized but carries no
/// binary semantics.
fn imm_value(literal: &str) -> Option<i64> {
    if let Some(digits) = literal.strip_suffix(['h', 'H']) {
        i64::from_str_radix(digits, 16).ok()
    } else {
        decimal_prefix(literal)
    }
}

fn decimal_prefix(literal: &str) -> Option<i64> {
    let digits: &str = literal
        .split_once(|c: char| !c.is_ascii_digit())
        .map_or(literal, |(head, _)| head);
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------
