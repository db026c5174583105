//! Pratt parser producing the expression tree.

use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
}

impl BinaryOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::In => "in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Len,
    Lower,
    Upper,
    String,
    Int,
    Float,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "string" => Self::String,
            "int" => Self::Int,
            "float" => Self::Float,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Literal(Value),
    Var(String),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Conditional(Box<Node>, Box<Node>, Box<Node>),
    Array(Vec<Node>),
    Map(Vec<(String, Node)>),
    Call(Func, Box<Node>),
}

// Binding powers, loosest first.
const BP_TERNARY: u8 = 1;
const BP_OR: u8 = 2;
const BP_AND: u8 = 3;
const BP_EQUALITY: u8 = 4;
const BP_COMPARE: u8 = 5;
const BP_SUM: u8 = 6;
const BP_PRODUCT: u8 = 7;
const BP_PREFIX: u8 = 8;

#[derive(Clone, Copy)]
enum Infix {
    Conditional,
    Or,
    And,
    Binary(BinaryOp),
}

impl Infix {
    fn of(token: &Token) -> Option<Self> {
        Some(match token {
            Token::Question => Self::Conditional,
            Token::OrOr => Self::Or,
            Token::AndAnd => Self::And,
            Token::EqEq => Self::Binary(BinaryOp::Eq),
            Token::NotEq => Self::Binary(BinaryOp::Ne),
            Token::Lt => Self::Binary(BinaryOp::Lt),
            Token::Le => Self::Binary(BinaryOp::Le),
            Token::Gt => Self::Binary(BinaryOp::Gt),
            Token::Ge => Self::Binary(BinaryOp::Ge),
            Token::In => Self::Binary(BinaryOp::In),
            Token::Plus => Self::Binary(BinaryOp::Add),
            Token::Minus => Self::Binary(BinaryOp::Sub),
            Token::Star => Self::Binary(BinaryOp::Mul),
            Token::Slash => Self::Binary(BinaryOp::Div),
            Token::Percent => Self::Binary(BinaryOp::Rem),
            _ => return None,
        })
    }

    fn binding_power(self) -> u8 {
        match self {
            Self::Conditional => BP_TERNARY,
            Self::Or => BP_OR,
            Self::And => BP_AND,
            Self::Binary(BinaryOp::Eq | BinaryOp::Ne) => BP_EQUALITY,
            Self::Binary(
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::In,
            ) => BP_COMPARE,
            Self::Binary(BinaryOp::Add | BinaryOp::Sub) => BP_SUM,
            Self::Binary(BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem) => BP_PRODUCT,
        }
    }
}

pub(crate) fn parse(src: &str) -> Result<Node, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        end: src.len(),
    };
    let node = parser.expression(0)?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::parse(extra.pos, "unexpected trailing input"));
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.cursor)
    }

    fn pos(&self) -> usize {
        self.peek().map_or(self.end, |s| s.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let item = self.tokens.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|s| &s.token == token) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ExprError::parse(self.pos(), format!("expected {what}")))
        }
    }

    fn expression(&mut self, min_bp: u8) -> Result<Node, ExprError> {
        let mut lhs = self.prefix()?;

        while let Some(infix) = self.peek().and_then(|s| Infix::of(&s.token)) {
            let bp = infix.binding_power();
            if bp <= min_bp {
                break;
            }
            self.cursor += 1;

            lhs = match infix {
                Infix::Conditional => {
                    let then = self.expression(0)?;
                    self.expect(&Token::Colon, "':' in conditional")?;
                    // Right associative: `a ? b : c ? d : e`.
                    let otherwise = self.expression(BP_TERNARY - 1)?;
                    Node::Conditional(Box::new(lhs), Box::new(then), Box::new(otherwise))
                }
                Infix::Or => Node::Or(Box::new(lhs), Box::new(self.expression(BP_OR)?)),
                Infix::And => Node::And(Box::new(lhs), Box::new(self.expression(BP_AND)?)),
                Infix::Binary(op) => {
                    Node::Binary(op, Box::new(lhs), Box::new(self.expression(bp)?))
                }
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Node, ExprError> {
        let pos = self.pos();
        let Some(Spanned { token, .. }) = self.advance() else {
            return Err(ExprError::parse(pos, "unexpected end of expression"));
        };

        let node = match token {
            Token::Int(i) => Node::Literal(Value::Int(i)),
            Token::Float(f) => Node::Literal(Value::Float(f)),
            Token::Str(s) => Node::Literal(Value::String(s)),
            Token::True => Node::Literal(Value::Bool(true)),
            Token::False => Node::Literal(Value::Bool(false)),
            Token::Null => Node::Literal(Value::Null),
            Token::Not => Node::Unary(UnaryOp::Not, Box::new(self.expression(BP_PREFIX)?)),
            Token::Minus => Node::Unary(UnaryOp::Neg, Box::new(self.expression(BP_PREFIX)?)),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen, "')'")?;
                inner
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression(0)?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or ']'")?;
                    }
                }
                Node::Array(items)
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key_pos = self.pos();
                        let key = match self.advance().map(|s| s.token) {
                            Some(Token::Ident(k) | Token::Str(k)) => k,
                            _ => return Err(ExprError::parse(key_pos, "expected map key")),
                        };
                        self.expect(&Token::Colon, "':' after map key")?;
                        entries.push((key, self.expression(0)?));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or '}'")?;
                    }
                }
                Node::Map(entries)
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let func = Func::lookup(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    let arg = self.expression(0)?;
                    self.expect(&Token::RParen, "')' after function argument")?;
                    Node::Call(func, Box::new(arg))
                } else {
                    Node::Var(name)
                }
            }
            other => {
                return Err(ExprError::parse(pos, format!("unexpected token {other:?}")));
            }
        };

        self.postfix(node)
    }

    fn postfix(&mut self, mut node: Node) -> Result<Node, ExprError> {
        loop {
            if self.eat(&Token::Dot) {
                let pos = self.pos();
                match self.advance().map(|s| s.token) {
                    Some(Token::Ident(field)) => node = Node::Member(Box::new(node), field),
                    Some(Token::Int(i)) => {
                        node = Node::Index(Box::new(node), Box::new(Node::Literal(Value::Int(i))));
                    }
                    _ => return Err(ExprError::parse(pos, "expected field name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression(0)?;
                self.expect(&Token::RBracket, "']'")?;
                node = Node::Index(Box::new(node), Box::new(index));
            } else {
                return Ok(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Box<Node> {
        Box::new(Node::Var(name.into()))
    }

    fn int(i: i64) -> Box<Node> {
        Box::new(Node::Literal(Value::Int(i)))
    }

    #[test]
    fn product_binds_tighter_than_sum() {
        assert_eq!(
            parse("a + b * 2").unwrap(),
            Node::Binary(
                BinaryOp::Add,
                var("a"),
                Box::new(Node::Binary(BinaryOp::Mul, var("b"), int(2)))
            )
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(
            parse("a - 1 - 2").unwrap(),
            Node::Binary(
                BinaryOp::Sub,
                Box::new(Node::Binary(BinaryOp::Sub, var("a"), int(1))),
                int(2)
            )
        );
    }

    #[test]
    fn member_index_and_calls() {
        assert_eq!(
            parse("len(input.items[0])").unwrap(),
            Node::Call(
                Func::Len,
                Box::new(Node::Index(
                    Box::new(Node::Member(var("input"), "items".into())),
                    int(0)
                ))
            )
        );
    }

    #[test]
    fn conditional_nests_to_the_right() {
        let node = parse("a ? 1 : b ? 2 : 3").unwrap();
        let Node::Conditional(_, _, otherwise) = node else {
            panic!("expected conditional");
        };
        assert!(matches!(*otherwise, Node::Conditional(..)));
    }

    #[test]
    fn errors() {
        assert!(matches!(parse("a +"), Err(ExprError::Parse { pos: 3, .. })));
        assert!(matches!(parse("(a"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("a b"), Err(ExprError::Parse { pos: 2, .. })));
        assert!(matches!(parse("nope(1)"), Err(ExprError::UnknownFunction(name)) if name == "nope"));
    }
}
