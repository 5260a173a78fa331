//! Literal scanning: strings, numbers, identifiers and keywords

use super::Lexer;
use crate::token::{Token, TokenKind};

impl Lexer {
    /// Scan a string literal. `quote` is the opening quote character; the
    /// string terminates at the matching quote. There are no escape
    /// sequences.
    pub(super) fn string(&mut self, quote: char) -> Token {
        let content_start = self.current;

        while !self.is_at_end() && self.peek() != quote {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token_with_code("ML1002", "Unterminated string literal");
        }

        let content: String = self.chars[content_start..self.current].iter().collect();
        self.advance(); // closing quote

        self.make_token(TokenKind::Str(content.clone()), &content)
    }

    /// Scan an integer or float literal.
    ///
    /// A `.` is consumed as a decimal point only when it is not immediately
    /// followed by another `.` — `0..5` must lex as `0`, `..`, `5`.
    pub(super) fn number(&mut self) -> Token {
        let mut dot_found = false;

        loop {
            let c = self.peek();
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && self.peek_next() != Some('.') {
                if dot_found {
                    // consume the stray dot so we don't loop on it
                    self.advance();
                    return self.error_token_with_code(
                        "ML1003",
                        "Float cannot have more than one decimal point",
                    );
                }
                dot_found = true;
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.chars[self.start_pos..self.current].iter().collect();
        if dot_found {
            match text.parse::<f64>() {
                Ok(value) => self.make_token(TokenKind::Float(value), &text),
                Err(_) => self.error_token_with_code("ML1003", "Malformed float literal"),
            }
        } else {
            match text.parse::<i32>() {
                Ok(value) => self.make_token(TokenKind::Int(value), &text),
                Err(_) => {
                    self.error_token_with_code("ML1004", "Integer literal out of range")
                }
            }
        }
    }

    /// Scan an identifier or keyword
    pub(super) fn identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.chars[self.start_pos..self.current].iter().collect();
        let kind = keyword_kind(&text).unwrap_or_else(|| TokenKind::Ident(text.clone()));
        self.make_token(kind, &text)
    }
}

/// Map an identifier to its keyword kind, if it is one
fn keyword_kind(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "var" => TokenKind::Var,
        "func" => TokenKind::Func,
        "class" => TokenKind::Class,
        "static" => TokenKind::Static,
        "operator" => TokenKind::Operator,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        _ => return None,
    };
    Some(kind)
}
