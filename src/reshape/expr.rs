//! Row-wise expression language used by instruction definitions.
//!
//! The syntax follows the C++ subset commonly written in column definitions:
//! arithmetic, comparisons, logical operators, the ternary operator, vector
//! indexing and calls to math / vector-reduction functions. Every value is a
//! double or a vector of doubles; booleans are `1.0` and `0.0`.

use std::collections::BTreeSet;

use crate::error::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn is_vector(&self) -> bool {
        matches!(self, Value::Vector(_))
    }

    fn as_slice(&self) -> &[f64] {
        match self {
            Value::Scalar(x) => std::slice::from_ref(x),
            Value::Vector(values) => values,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(x) => Value::Scalar(f(x)),
            Value::Vector(values) => Value::Vector(values.into_iter().map(f).collect()),
        }
    }

    fn zip_with(self, other: Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
        Ok(match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
            (Value::Scalar(a), Value::Vector(b)) => Value::Vector(b.into_iter().map(|y| f(a, y)).collect()),
            (Value::Vector(a), Value::Scalar(b)) => Value::Vector(a.into_iter().map(|x| f(x, b)).collect()),
            (Value::Vector(a), Value::Vector(b)) => {
                if a.len() != b.len() {
                    return Err(ExprError::Type(format!(
                        "vector operands differ in length ({} vs {})",
                        a.len(),
                        b.len()
                    )));
                }
                Value::Vector(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
            }
        })
    }
}

/// Source of column values for the row being evaluated.
pub trait Env {
    fn lookup(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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
    And,
    Or,
}

impl BinaryOp {
    fn from_symbol(symbol: &str) -> Option<(BinaryOp, u8)> {
        Some(match symbol {
            "||" => (BinaryOp::Or, 1),
            "&&" => (BinaryOp::And, 2),
            "==" => (BinaryOp::Eq, 3),
            "!=" => (BinaryOp::Ne, 3),
            "<" => (BinaryOp::Lt, 4),
            "<=" => (BinaryOp::Le, 4),
            ">" => (BinaryOp::Gt, 4),
            ">=" => (BinaryOp::Ge, 4),
            "+" => (BinaryOp::Add, 5),
            "-" => (BinaryOp::Sub, 5),
            "*" => (BinaryOp::Mul, 6),
            "/" => (BinaryOp::Div, 6),
            "%" => (BinaryOp::Rem, 6),
            _ => return None,
        })
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            BinaryOp::Lt => truth(a < b),
            BinaryOp::Le => truth(a <= b),
            BinaryOp::Gt => truth(a > b),
            BinaryOp::Ge => truth(a >= b),
            BinaryOp::Eq => truth(a == b),
            BinaryOp::Ne => truth(a != b),
            BinaryOp::And => truth(a != 0.0 && b != 0.0),
            BinaryOp::Or => truth(a != 0.0 || b != 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sqrt,
    Abs,
    Exp,
    Log,
    Log10,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Floor,
    Ceil,
    Round,
    Hypot,
    Min,
    Max,
    Sum,
    Mean,
    Length,
}

impl Function {
    /// Resolve a possibly namespaced name such as `std::sqrt` or `TMath::Sqrt`.
    fn resolve(name: &str) -> Option<Function> {
        let bare = name.rsplit("::").next().unwrap_or(name).to_ascii_lowercase();
        Some(match bare.as_str() {
            "sqrt" => Function::Sqrt,
            "abs" | "fabs" => Function::Abs,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "pow" | "power" => Function::Pow,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "atan2" => Function::Atan2,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "round" => Function::Round,
            "hypot" => Function::Hypot,
            "min" => Function::Min,
            "max" => Function::Max,
            "sum" => Function::Sum,
            "mean" => Function::Mean,
            "length" | "size" => Function::Length,
            _ => return None,
        })
    }

    fn accepts(self, argc: usize) -> Result<(), usize> {
        let expected = match self {
            Function::Pow | Function::Atan2 | Function::Hypot => 2,
            Function::Min | Function::Max if argc == 2 => 2,
            _ => 1,
        };
        if argc == expected {
            Ok(())
        } else {
            Err(expected)
        }
    }

    fn unary(self) -> Option<fn(f64) -> f64> {
        Some(match self {
            Function::Sqrt => f64::sqrt,
            Function::Abs => f64::abs,
            Function::Exp => f64::exp,
            Function::Log => f64::ln,
            Function::Log10 => f64::log10,
            Function::Sin => f64::sin,
            Function::Cos => f64::cos,
            Function::Tan => f64::tan,
            Function::Asin => f64::asin,
            Function::Acos => f64::acos,
            Function::Atan => f64::atan,
            Function::Sinh => f64::sinh,
            Function::Cosh => f64::cosh,
            Function::Tanh => f64::tanh,
            Function::Floor => f64::floor,
            Function::Ceil => f64::ceil,
            Function::Round => f64::round,
            _ => return None,
        })
    }

    fn binary(self) -> Option<fn(f64, f64) -> f64> {
        Some(match self {
            Function::Pow => f64::powf,
            Function::Atan2 => f64::atan2,
            Function::Hypot => f64::hypot,
            Function::Min => f64::min,
            Function::Max => f64::max,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Column(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        match parser.peek() {
            Token::End => Ok(expr),
            _ => Err(parser.error("unexpected trailing input")),
        }
    }

    /// Names of every column the expression reads.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_columns(&mut names);
        names
    }

    fn collect_columns(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Column(name) => {
                names.insert(name.clone());
            }
            Expr::Unary(_, inner) => inner.collect_columns(names),
            Expr::Binary(_, lhs, rhs) | Expr::Index(lhs, rhs) => {
                lhs.collect_columns(names);
                rhs.collect_columns(names);
            }
            Expr::Ternary(cond, then, otherwise) => {
                cond.collect_columns(names);
                then.collect_columns(names);
                otherwise.collect_columns(names);
            }
            Expr::Call(_, args) => args.iter().for_each(|arg| arg.collect_columns(names)),
        }
    }

    pub fn eval(&self, env: &dyn Env) -> Result<Value, ExprError> {
        match self {
            Expr::Number(x) => Ok(Value::Scalar(*x)),
            Expr::Column(name) => env
                .lookup(name)
                .ok_or_else(|| ExprError::UnknownColumn(name.clone())),
            Expr::Unary(op, inner) => {
                let value = inner.eval(env)?;
                Ok(match op {
                    UnaryOp::Neg => value.map(|x| -x),
                    UnaryOp::Plus => value,
                    UnaryOp::Not => value.map(|x| if x == 0.0 { 1.0 } else { 0.0 }),
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let left = lhs.eval(env)?;
                let decided = match (op, &left) {
                    (BinaryOp::And, Value::Scalar(a)) if *a == 0.0 => Some(0.0),
                    (BinaryOp::Or, Value::Scalar(a)) if *a != 0.0 => Some(1.0),
                    _ => None,
                };
                // A vector right side still broadcasts; a scalar one short-circuits
                // like C++, so guards such as `n > 0 && v[0] > 1` never fail.
                let right = match (decided, rhs.eval(env)) {
                    (Some(_), Ok(right @ Value::Vector(_))) => right,
                    (Some(result), _) => return Ok(Value::Scalar(result)),
                    (None, right) => right?,
                };
                left.zip_with(right, |a, b| op.apply(a, b))
            }
            Expr::Ternary(cond, then, otherwise) => match cond.eval(env)? {
                Value::Scalar(c) if c != 0.0 => then.eval(env),
                Value::Scalar(_) => otherwise.eval(env),
                Value::Vector(_) => Err(ExprError::Type(
                    "ternary condition must be a scalar".to_string(),
                )),
            },
            Expr::Index(base, index) => {
                let values = match base.eval(env)? {
                    Value::Vector(values) => values,
                    Value::Scalar(_) => {
                        return Err(ExprError::Type("cannot index a scalar".to_string()))
                    }
                };
                let index = match index.eval(env)? {
                    Value::Scalar(i) => i.trunc() as i64,
                    Value::Vector(_) => {
                        return Err(ExprError::Type("index must be a scalar".to_string()))
                    }
                };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| values.get(i).copied())
                    .map(Value::Scalar)
                    .ok_or(ExprError::IndexOutOfBounds {
                        index,
                        len: values.len(),
                    })
            }
            Expr::Call(function, args) => call(*function, args, env),
        }
    }
}

fn call(function: Function, args: &[Expr], env: &dyn Env) -> Result<Value, ExprError> {
    let mut values = args
        .iter()
        .map(|arg| arg.eval(env))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(f) = function.unary() {
        return Ok(values.remove(0).map(f));
    }
    if values.len() == 2 {
        if let Some(f) = function.binary() {
            let rhs = values.remove(1);
            return values.remove(0).zip_with(rhs, f);
        }
    }

    let items = values[0].as_slice();
    let reduced = match function {
        Function::Sum => items.iter().sum(),
        Function::Mean if items.is_empty() => 0.0,
        Function::Mean => items.iter().sum::<f64>() / items.len() as f64,
        Function::Length => items.len() as f64,
        Function::Max | Function::Min if items.is_empty() => {
            return Err(ExprError::Type(format!(
                "{:?} of an empty vector",
                function
            )))
        }
        Function::Max => items.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Min => items.iter().copied().fold(f64::INFINITY, f64::min),
        _ => unreachable!("arity checked at parse time"),
    };
    Ok(Value::Scalar(reduced))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    End,
}

const OPERATORS: [&str; 15] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "=",
];

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).map_or(false, u8::is_ascii_digit)) {
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                let mut lookahead = pos + 1;
                if lookahead < bytes.len() && (bytes[lookahead] == b'+' || bytes[lookahead] == b'-') {
                    lookahead += 1;
                }
                if lookahead < bytes.len() && bytes[lookahead].is_ascii_digit() {
                    pos = lookahead;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text = &source[start..pos];
            // C++ literal suffixes (1.5f, 10L) carry no meaning here.
            while pos < bytes.len() && matches!(bytes[pos], b'f' | b'F' | b'l' | b'L' | b'u' | b'U') {
                pos += 1;
            }
            let value = text.parse::<f64>().map_err(|_| ExprError::Syntax {
                pos: start,
                message: format!("invalid number literal '{}'", text),
            })?;
            tokens.push((Token::Number(value), start));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            loop {
                while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                    pos += 1;
                }
                let namespaced = source[pos..].starts_with("::")
                    && bytes
                        .get(pos + 2)
                        .map_or(false, |b| b.is_ascii_alphabetic() || *b == b'_');
                if !namespaced {
                    break;
                }
                pos += 2;
            }
            tokens.push((Token::Ident(source[start..pos].to_string()), start));
            continue;
        }

        let single = match c {
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b'[' => Some(Token::LBracket),
            b']' => Some(Token::RBracket),
            b',' => Some(Token::Comma),
            b'?' => Some(Token::Question),
            b':' => Some(Token::Colon),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((token, start));
            pos += 1;
            continue;
        }

        match OPERATORS.iter().find(|op| source[pos..].starts_with(**op)) {
            Some(&"=") | None => {
                return Err(ExprError::Syntax {
                    pos,
                    message: format!("unexpected character '{}'", source[pos..].chars().next().unwrap_or('?')),
                })
            }
            Some(op) => {
                tokens.push((Token::Op(*op), start));
                pos += op.len();
            }
        }
    }

    tokens.push((Token::End, source.len()));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].0.clone();
        if token != Token::End {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> ExprError {
        ExprError::Syntax {
            pos: self.offset(),
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprError> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if *self.peek() != Token::Question {
            return Ok(cond);
        }
        self.advance();
        let then = self.expression()?;
        self.expect(Token::Colon, "':' in conditional expression")?;
        let otherwise = self.expression()?;
        Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    fn binary(&mut self, min_power: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let (op, power) = match self.peek() {
                Token::Op(symbol) => match BinaryOp::from_symbol(symbol) {
                    Some(found) => found,
                    None => break,
                },
                _ => break,
            };
            if power <= min_power {
                break;
            }
            self.advance();
            let rhs = self.binary(power)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Token::Op("-") => UnaryOp::Neg,
            Token::Op("+") => UnaryOp::Plus,
            Token::Op("!") => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        while *self.peek() == Token::LBracket {
            self.advance();
            let index = self.expression()?;
            self.expect(Token::RBracket, "']'")?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let start = self.offset();
        match self.advance() {
            Token::Number(x) => Ok(Expr::Number(x)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) if *self.peek() == Token::LParen => {
                self.advance();
                let args = self.arguments()?;
                let function =
                    Function::resolve(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                function.accepts(args.len()).map_err(|expected| ExprError::Arity {
                    name: name.clone(),
                    expected,
                    actual: args.len(),
                })?;
                Ok(Expr::Call(function, args))
            }
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Number(1.0),
                "false" => Expr::Number(0.0),
                _ => Expr::Column(name),
            }),
            Token::End => Err(ExprError::Syntax {
                pos: start,
                message: "unexpected end of expression".to_string(),
            }),
            _ => Err(ExprError::Syntax {
                pos: start,
                message: "expected a value".to_string(),
            }),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.peek() {
                Token::Comma => {
                    self.advance();
                }
                Token::RParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.error("expected ',' or ')' in argument list")),
            }
        }
    }
}
