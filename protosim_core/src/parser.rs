//! Tokenizer and recursive-descent parser for rule expressions.
//!
//! Precedence, loosest first: `||`, `&&`, comparisons, `+ -`, `* / %`,
//! unary `! -`. Comparisons do not chain.

use crate::error::CoreError;
use crate::expr::{BinaryOp, Builtin, Expr, UnaryOp};
use crate::path::{Root, Segment, StatePath};
use num_bigint::BigInt;
use num_traits::{Num, Pow};
use protosim_env::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(BigInt),
    Str(String),
    Ident(String),
    Op(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(i) => write!(f, "{}", i),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Op(op) => write!(f, "{}", op),
        }
    }
}

const OPERATORS: [&str; 21] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[", "]",
    ".", ",", "=",
];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, CoreError> {
    let err = |position: usize, message: String| CoreError::Parse {
        input: input.to_string(),
        position,
        message,
    };

    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        if c.is_ascii_digit() {
            let value = if input[i..].starts_with("0x") || input[i..].starts_with("0X") {
                i += 2;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                BigInt::from_str_radix(&input[start + 2..i], 16)
                    .map_err(|_| err(start, "invalid hex literal".into()))?
            } else {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
                    i += 1;
                }
                let digits: String = input[start..i].chars().filter(|c| *c != '_').collect();
                let mut value: BigInt = digits
                    .parse()
                    .map_err(|_| err(start, "invalid integer literal".into()))?;
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let exp_start = i + 1;
                    let mut j = exp_start;
                    while j < bytes.len() && bytes[j].is_ascii_digit() {
                        j += 1;
                    }
                    if j == exp_start {
                        return Err(err(i, "missing exponent".into()));
                    }
                    let exp: u32 = input[exp_start..j]
                        .parse()
                        .map_err(|_| err(exp_start, "exponent too large".into()))?;
                    value *= BigInt::from(10u32).pow(exp);
                    i = j;
                }
                value
            };
            if i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
                return Err(err(i, "identifier cannot follow a number".into()));
            }
            tokens.push((start, Token::Int(value)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(input[start..i].to_string())));
            continue;
        }

        if c == b'"' {
            i += 1;
            let body_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            if i == bytes.len() {
                return Err(err(start, "unterminated string".into()));
            }
            tokens.push((start, Token::Str(input[body_start..i].to_string())));
            i += 1;
            continue;
        }

        match OPERATORS.iter().find(|op| input[i..].starts_with(**op)) {
            // a lone `=` is almost always a typo for `==`
            Some(&"=") => return Err(err(start, "unexpected '=' (use '==')".into())),
            Some(op) => {
                i += op.len();
                tokens.push((start, Token::Op(op)));
            }
            None => {
                let ch = input[i..].chars().next().unwrap_or('?');
                return Err(err(start, format!("unexpected character '{}'", ch)));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, CoreError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn error(&self, message: impl Into<String>) -> CoreError {
        let position = self
            .tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or(self.input.len());
        CoreError::Parse {
            input: self.input.to_string(),
            position,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), CoreError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn finish(&self) -> Result<(), CoreError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected trailing '{}'", token))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.and_expr()?;
        while self.eat_op("||") || self.eat_word("or") {
            let rhs = self.and_expr()?;
            lhs = Expr::binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat_op("&&") || self.eat_word("and") {
            let rhs = self.cmp_expr()?;
            lhs = Expr::binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, CoreError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        if matches!(
            self.peek(),
            Some(Token::Op("==" | "!=" | "<" | "<=" | ">" | ">="))
        ) {
            return Err(self.error("comparisons cannot be chained"));
        }
        Ok(Expr::binary(op, lhs, rhs))
    }

    fn add_expr(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.mul_expr()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn mul_expr(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("%") {
                BinaryOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary_expr()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, CoreError> {
        if self.eat_op("!") || self.eat_word("not") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary_expr()?)));
        }
        if self.eat_op("-") {
            return Ok(match self.unary_expr()? {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, CoreError> {
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Text(s))),
            Some(Token::Op("(")) => {
                let inner = self.or_expr()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                _ if matches!(self.peek(), Some(Token::Op("("))) => self.call(&word),
                _ => match Root::from_ident(&word) {
                    Some(root) => Ok(Expr::Path(self.segments(root)?)),
                    None => {
                        self.pos -= 1;
                        Err(self.error(format!("unknown identifier '{}'", word)))
                    }
                },
            },
            Some(token) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected '{}'", token)))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, CoreError> {
        let builtin = Builtin::from_name(name)
            .ok_or_else(|| self.error(format!("unknown function '{}'", name)))?;
        self.expect_op("(")?;
        let mut args = Vec::new();
        if !self.eat_op(")") {
            loop {
                args.push(self.or_expr()?);
                if self.eat_op(")") {
                    break;
                }
                self.expect_op(",")?;
            }
        }
        if args.len() != builtin.arity() {
            return Err(self.error(format!(
                "{}() takes {} argument(s), got {}",
                builtin.name(),
                builtin.arity(),
                args.len()
            )));
        }
        if builtin == Builtin::Exists && !matches!(args[0], Expr::Path(_)) {
            return Err(self.error("exists() takes a path"));
        }
        Ok(Expr::Call(builtin, args))
    }

    fn segments(&mut self, root: Root) -> Result<StatePath, CoreError> {
        let mut segments = Vec::new();
        loop {
            if self.eat_op(".") {
                match self.advance() {
                    Some(Token::Ident(name)) => segments.push(Segment::Field(name)),
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected field name after '.'"));
                    }
                }
            } else if self.eat_op("[") {
                let index = self.or_expr()?;
                self.expect_op("]")?;
                segments.push(Segment::Index(index));
            } else {
                return Ok(StatePath::new(root, segments));
            }
        }
    }
}

/// Parses a rule expression.
pub fn parse_expr(input: &str) -> Result<Expr, CoreError> {
    let mut parser = Parser::new(input)?;
    let expr = parser.or_expr()?;
    parser.finish()?;
    Ok(expr)
}

/// Parses a bare state path such as `StableBaseCDP.safes[params.safeId].weight`,
/// resolved against whichever snapshot is under inspection.
pub fn parse_target(input: &str) -> Result<StatePath, CoreError> {
    let mut parser = Parser::new(input)?;
    let first = match parser.advance() {
        Some(Token::Ident(name)) if Root::from_ident(&name).is_none() => name,
        _ => {
            parser.pos = 0;
            return Err(parser.error("a state path starts with a contract name or 'accounts'"));
        }
    };
    let mut path = parser.segments(Root::State)?;
    path.segments.insert(0, Segment::Field(first));
    parser.finish()?;
    Ok(path)
}
