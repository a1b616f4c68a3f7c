//! Tokenizer for condition and property expressions.

use super::ExprError;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    None,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExprError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            if self.pos >= self.input.len() {
                tokens.push(Token::Eof);
                return Ok(tokens);
            }
            tokens.push(self.next_token()?);
        }
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        let ch = self.input[self.pos];
        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '.' if !self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => Some(Token::Dot),
            _ => None,
        };
        if let Some(token) = single {
            self.pos += 1;
            return Ok(token);
        }

        match ch {
            '=' | '!' | '<' | '>' => self.read_comparison(),
            '"' | '\'' => self.read_string(ch),
            c if c.is_ascii_digit() || c == '.' => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_word()),
            _ => Err(ExprError::Syntax {
                pos: self.pos,
                message: format!("unexpected character '{ch}'"),
            }),
        }
    }

    fn read_comparison(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        let ch = self.input[self.pos];
        let eq = self.peek_at(1) == Some('=');
        self.pos += if eq { 2 } else { 1 };
        match (ch, eq) {
            ('=', true) => Ok(Token::EqEq),
            ('!', true) => Ok(Token::NotEq),
            ('<', true) => Ok(Token::Le),
            ('<', false) => Ok(Token::Lt),
            ('>', true) => Ok(Token::Ge),
            ('>', false) => Ok(Token::Gt),
            _ => Err(ExprError::Syntax {
                pos: start,
                message: format!("unexpected character '{ch}'"),
            }),
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ExprError> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        while let Some(&c) = self.input.get(self.pos) {
            self.pos += 1;
            match c {
                c if c == quote => return Ok(Token::Str(text)),
                '\\' => {
                    let escaped = self.input.get(self.pos).copied().ok_or(ExprError::Syntax {
                        pos: start,
                        message: "unterminated string literal".into(),
                    })?;
                    self.pos += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c => text.push(c),
            }
        }
        Err(ExprError::Syntax {
            pos: start,
            message: "unterminated string literal".into(),
        })
    }

    fn read_number(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        let mut text = String::new();
        let mut is_float = false;
        while let Some(&c) = self.input.get(self.pos) {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
            } else {
                break;
            }
            self.pos += 1;
        }
        let invalid = || ExprError::Syntax {
            pos: start,
            message: format!("invalid number literal '{text}'"),
        };
        if is_float {
            text.parse().map(Token::Float).map_err(|_| invalid())
        } else {
            text.parse().map(Token::Int).map_err(|_| invalid())
        }
    }

    fn read_word(&mut self) -> Token {
        let mut text = String::new();
        while let Some(&c) = self.input.get(self.pos) {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            text.push(c);
            self.pos += 1;
        }
        match text.as_str() {
            "True" | "true" => Token::True,
            "False" | "false" => Token::False,
            "None" | "null" => Token::None,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            _ => Token::Ident(text),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.input.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}
