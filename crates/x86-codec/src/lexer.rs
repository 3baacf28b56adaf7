//! Assembly tokenizer.
//!
//! A conventional character scanner producing one token per call:
//! identifiers, integer literals, the effective-address punctuation
//! (`[ ] + - *`) and commas. Whitespace is skipped silently; anything
//! else becomes an [`Token::Error`] for the parser to report.

/// An assembly token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Eof,
    Comma,
    LBracket,
    RBracket,
    Star,
    Plus,
    Minus,
    /// A letter-then-alphanumerics run. Case preserved; the parser
    /// normalizes.
    Ident(String),
    /// A digit-led run of hex digits plus trailing `h`/`b` markers.
    /// Radix interpretation is deferred to the parser.
    Integer(String),
    /// An unexpected character.
    Error(char),
}

/// Tokenizer over an assembly line.
pub struct Lexer {
    chars: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(content: &str) -> Lexer {
        Lexer { chars: content.chars().collect(), position: 0 }
    }

    /// Scan the next token.
    pub fn next_token(&mut self) -> Token {
        loop {
            let Some(c) = self.get_char() else {
                return Token::Eof;
            };
            if is_space(c) {
                continue;
            }
            if c.is_ascii_alphabetic() {
                return self.scan_ident(c);
            }
            if c.is_ascii_digit() {
                return self.scan_integer(c);
            }
            return match c {
                ',' => Token::Comma,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                other => Token::Error(other),
            };
        }
    }

    fn get_char(&mut self) -> Option<char> {
        let c = self.chars.get(self.position).copied();
        if c.is_some() {
            self.position += 1;
        }
        c
    }

    fn push_back(&mut self) {
        self.position -= 1;
    }

    fn scan_ident(&mut self, first: char) -> Token {
        let mut buffer = String::from(first);
        while let Some(c) = self.get_char() {
            if c.is_ascii_alphanumeric() {
                buffer.push(c);
            } else {
                self.push_back();
                break;
            }
        }
        Token::Ident(buffer)
    }

    fn scan_integer(&mut self, first: char) -> Token {
        let mut buffer = String::from(first);
        while let Some(c) = self.get_char() {
            if c.is_ascii_hexdigit() || c == 'h' || c == 'b' {
                buffer.push(c);
            } else {
                self.push_back();
                break;
            }
        }
        Token::Integer(buffer)
    }
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\n'
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------
