//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Precedence, lowest first: `or`, `and`, `not`, comparisons (including
//! `in` / `not in`), `+ -`, `* / %`, unary `-`, postfix access.

use serde_json::Value;

use super::ExprError;
use super::lexer::{Lexer, Token};

/// Deepest nesting accepted before parsing is refused.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `target.get(key[, default])`, the only callable form.
    Get {
        target: Box<Expr>,
        key: Box<Expr>,
        default: Option<Box<Expr>>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let node = parser.expression()?;
    match parser.peek() {
        Token::Eof => Ok(node.expr),
        other => Err(parser.error(format!("unexpected {other:?} after expression"))),
    }
}

/// A parsed subtree and its height. Left-associative chains such as
/// `1 + 1 + 1` grow the height without growing the parser's own recursion,
/// so both are bounded by [`MAX_DEPTH`].
struct Node {
    expr: Expr,
    height: usize,
}

impl Node {
    fn leaf(expr: Expr) -> Self {
        Self { expr, height: 1 }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn expression(&mut self) -> Result<Node, ExprError> {
        self.descend()?;
        let node = self.or_expr();
        self.depth -= 1;
        node
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".into()));
        }
        Ok(())
    }

    fn wrap(&self, height: usize, expr: Expr) -> Result<Node, ExprError> {
        let height = height + 1;
        if height > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".into()));
        }
        Ok(Node { expr, height })
    }

    fn unary_node(&self, inner: Node, f: impl FnOnce(Box<Expr>) -> Expr) -> Result<Node, ExprError> {
        self.wrap(inner.height, f(Box::new(inner.expr)))
    }

    fn binary_node(
        &self,
        left: Node,
        right: Node,
        f: impl FnOnce(Box<Expr>, Box<Expr>) -> Expr,
    ) -> Result<Node, ExprError> {
        let height = left.height.max(right.height);
        self.wrap(height, f(Box::new(left.expr), Box::new(right.expr)))
    }

    fn or_expr(&mut self) -> Result<Node, ExprError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = self.binary_node(left, right, Expr::Or)?;
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Node, ExprError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = self.binary_node(left, right, Expr::And)?;
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.not_expr()?;
            self.depth -= 1;
            return self.unary_node(inner, Expr::Not);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Token::EqEq => BinOp::Eq,
            Token::NotEq => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            Token::In => BinOp::In,
            Token::Not if self.peek_at(1) == &Token::In => BinOp::NotIn,
            _ => return Ok(left),
        };
        self.pos += if op == BinOp::NotIn { 2 } else { 1 };
        let right = self.additive()?;
        self.binary_node(left, right, |l, r| Expr::Binary(op, l, r))
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = self.binary_node(left, right, |l, r| Expr::Binary(op, l, r))?;
        }
    }

    fn multiplicative(&mut self) -> Result<Node, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = self.binary_node(left, right, |l, r| Expr::Binary(op, l, r))?;
        }
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return self.unary_node(inner, Expr::Neg);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    other => return Err(self.error(format!("expected attribute name, found {other:?}"))),
                };
                if name == "get" && self.eat(&Token::LParen) {
                    let key = self.expression()?;
                    let default = if self.eat(&Token::Comma) {
                        Some(self.expression()?)
                    } else {
                        None
                    };
                    self.expect(&Token::RParen)?;
                    let height = node
                        .height
                        .max(key.height)
                        .max(default.as_ref().map_or(0, |d| d.height));
                    let expr = Expr::Get {
                        target: Box::new(node.expr),
                        key: Box::new(key.expr),
                        default: default.map(|d| Box::new(d.expr)),
                    };
                    node = self.wrap(height, expr)?;
                } else if self.peek() == &Token::LParen {
                    return Err(self.error(format!("calling `{name}` is not allowed")));
                } else {
                    node = self.unary_node(node, |target| Expr::Attr(target, name))?;
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket)?;
                node = self.binary_node(node, index, Expr::Index)?;
            } else if self.peek() == &Token::LParen {
                return Err(self.error("function calls are not allowed".into()));
            } else {
                return Ok(node);
            }
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.advance() {
            Token::True => Ok(Node::leaf(Expr::Literal(Value::Bool(true)))),
            Token::False => Ok(Node::leaf(Expr::Literal(Value::Bool(false)))),
            Token::None => Ok(Node::leaf(Expr::Literal(Value::Null))),
            Token::Int(i) => Ok(Node::leaf(Expr::Literal(Value::from(i)))),
            Token::Float(f) => Ok(Node::leaf(Expr::Literal(Value::from(f)))),
            Token::Str(s) => Ok(Node::leaf(Expr::Literal(Value::String(s)))),
            Token::Ident(name) => Ok(Node::leaf(Expr::Name(name))),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.sequence(&Token::RBracket, |p| p.expression())?;
                let height = items.iter().map(|n| n.height).max().unwrap_or(0);
                self.wrap(height, Expr::List(items.into_iter().map(|n| n.expr).collect()))
            }
            Token::LBrace => {
                let entries = self.sequence(&Token::RBrace, |p| {
                    let key = p.expression()?;
                    p.expect(&Token::Colon)?;
                    let value = p.expression()?;
                    Ok((key, value))
                })?;
                let height = entries
                    .iter()
                    .map(|(k, v)| k.height.max(v.height))
                    .max()
                    .unwrap_or(0);
                let entries = entries.into_iter().map(|(k, v)| (k.expr, v.expr)).collect();
                self.wrap(height, Expr::Dict(entries))
            }
            other => Err(self.error(format!("unexpected {other:?}"))),
        }
    }

    /// Comma separated items up to `close`, allowing a trailing comma.
    fn sequence<T>(
        &mut self,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> Result<T, ExprError>,
    ) -> Result<Vec<T>, ExprError> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(items);
            }
            items.push(item(self)?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            let found = self.peek().clone();
            Err(self.error(format!("expected {token:?}, found {found:?}")))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Syntax {
            pos: self.pos,
            message,
        }
    }
}
