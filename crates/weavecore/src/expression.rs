//! Boolean condition expressions.
//!
//! Deliberately small: operands are literals or interpolation references,
//! joined by comparisons (`== != > >= < <=`), `&&`, `||`, `!` and
//! parentheses. There is no arithmetic and no function call syntax.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | "(" expr ")" | compare
//! compare := operand (op operand)?
//! ```

use crate::reference::{Reference, ReferenceError};
use crate::template::Template;
use crate::value::{compare, loose_eq, ValueExt};
use crate::StepError;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected '{token}' at offset {offset}")]
    Unexpected { token: String, offset: usize },

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error(transparent)]
    Reference(#[from] ReferenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            _ => None,
        }
    }

    pub fn apply(self, left: &Value, right: &Value) -> Result<bool, StepError> {
        Ok(match self {
            CompareOp::Eq => loose_eq(left, right),
            CompareOp::Ne => !loose_eq(left, right),
            CompareOp::Gt => self.ordering(left, right)? == Ordering::Greater,
            CompareOp::Ge => self.ordering(left, right)? != Ordering::Less,
            CompareOp::Lt => self.ordering(left, right)? == Ordering::Less,
            CompareOp::Le => self.ordering(left, right)? != Ordering::Greater,
        })
    }

    fn ordering(self, left: &Value, right: &Value) -> Result<Ordering, StepError> {
        compare(left, right).ok_or_else(|| {
            StepError::execution(format!(
                "cannot compare {} with {} using '{}'",
                left.kind_name(),
                right.kind_name(),
                self
            ))
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        f.write_str(s)
    }
}

/// Operand of a comparison. String literals go through the same
/// interpolation rules as step inputs, so `"$A.value"` is a reference.
/// A parenthesised sub-expression compares as its boolean result.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Template(Template),
    Group(Box<Expression>),
}

impl Operand {
    fn value<F>(&self, lookup: &F) -> Result<Value, StepError>
    where
        F: Fn(&Reference) -> Result<Value, StepError>,
    {
        match self {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Template(t) => t.render_with(lookup),
            Operand::Group(expr) => Ok(Value::Bool(expr.evaluate(lookup)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Operand(Operand),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((token, offset)) => Err(ExpressionError::Unexpected {
                token: token.to_string(),
                offset: *offset,
            }),
        }
    }

    pub fn references(&self) -> Vec<&Reference> {
        fn operand_refs<'a>(operand: &'a Operand, out: &mut Vec<&'a Reference>) {
            match operand {
                Operand::Template(t) => out.extend(t.references()),
                Operand::Group(expr) => out.extend(expr.references()),
                Operand::Literal(_) => {}
            }
        }
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Expression::Operand(o) => operand_refs(o, &mut out),
                Expression::Compare { left, right, .. } => {
                    operand_refs(left, &mut out);
                    operand_refs(right, &mut out);
                }
                Expression::Not(inner) => stack.push(inner),
                Expression::And(a, b) | Expression::Or(a, b) => {
                    stack.push(b);
                    stack.push(a);
                }
            }
        }
        out
    }

    pub fn evaluate<F>(&self, lookup: &F) -> Result<bool, StepError>
    where
        F: Fn(&Reference) -> Result<Value, StepError>,
    {
        match self {
            Expression::Operand(o) => Ok(o.value(lookup)?.is_truthy()),
            Expression::Compare { left, op, right } => {
                let l = left.value(lookup)?;
                let r = right.value(lookup)?;
                op.apply(&l, &r)
            }
            Expression::Not(inner) => Ok(!inner.evaluate(lookup)?),
            Expression::And(a, b) => Ok(a.evaluate(lookup)? && b.evaluate(lookup)?),
            Expression::Or(a, b) => Ok(a.evaluate(lookup)? || b.evaluate(lookup)?),
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
    Str(String),
    Num(Number),
    Bool(bool),
    Null,
    Ref(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Op(op) => write!(f, "{}", op),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Num(n) => write!(f, "{}", n),
            Token::Bool(b) => write!(f, "{}", b),
            Token::Null => f.write_str("null"),
            Token::Ref(r) => write!(f, "${}", r),
        }
    }
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']')
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let unexpected = || ExpressionError::Unexpected {
            token: c.to_string(),
            offset,
        };

        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Op(CompareOp::Eq), offset));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Op(CompareOp::Ne), offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Not, offset));
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push((Token::Op(op), offset));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let (_, ch) = *chars.get(i).ok_or(ExpressionError::UnterminatedString)?;
                    i += 1;
                    match ch {
                        '\\' => {
                            let (_, escaped) =
                                *chars.get(i).ok_or(ExpressionError::UnterminatedString)?;
                            text.push(escaped);
                            i += 1;
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push((Token::Str(text), offset));
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ref_char(chars[end].1) {
                    end += 1;
                }
                let body: String = chars[start..end].iter().map(|(_, c)| c).collect();
                if body.is_empty() {
                    return Err(unexpected());
                }
                tokens.push((Token::Ref(body), offset));
                i = end;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].1.is_ascii_digit() || matches!(chars[i].1, '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Num(parse_number(&literal)?), offset));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].1.is_ascii_alphanumeric() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let token = match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => {
                        return Err(ExpressionError::Unexpected {
                            token: word,
                            offset,
                        })
                    }
                };
                tokens.push((token, offset));
            }
            _ => return Err(unexpected()),
        }
    }

    Ok(tokens)
}

fn parse_number(literal: &str) -> Result<Number, ExpressionError> {
    if let Ok(i) = literal.parse::<i64>() {
        return Ok(Number::from(i));
    }
    literal
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| ExpressionError::InvalidNumber(literal.to_string()))
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Result<(Token, usize), ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression, ExpressionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expression::Not(Box::new(self.parse_not()?)))
            }
            _ => self.parse_compare(),
        }
    }

    fn parse_compare(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expression::Compare { left, op, right });
        }
        Ok(match left {
            Operand::Group(inner) => *inner,
            other => Expression::Operand(other),
        })
    }

    fn parse_group(&mut self) -> Result<Operand, ExpressionError> {
        let inner = self.parse_or()?;
        match self.advance()? {
            (Token::RParen, _) => Ok(match inner {
                Expression::Operand(operand) => operand,
                other => Operand::Group(Box::new(other)),
            }),
            (token, offset) => Err(ExpressionError::Unexpected {
                token: token.to_string(),
                offset,
            }),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ExpressionError> {
        let (token, offset) = self.advance()?;
        Ok(match token {
            Token::LParen => self.parse_group()?,
            Token::Str(s) => match Template::parse_str(&s)? {
                Template::Literal(v) => Operand::Literal(v),
                other => Operand::Template(other),
            },
            Token::Ref(body) => Operand::Template(Template::Reference(Reference::parse(&body)?)),
            Token::Num(n) => Operand::Literal(Value::Number(n)),
            Token::Bool(b) => Operand::Literal(Value::Bool(b)),
            Token::Null => Operand::Literal(Value::Null),
            other => {
                return Err(ExpressionError::Unexpected {
                    token: other.to_string(),
                    offset,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(r: &Reference) -> Result<Value, StepError> {
        let data = json!({
            "A": {"value": 12, "label": "big"},
            "B": {"value": "7", "flags": []},
        });
        data.get(&r.root)
            .and_then(|v| v.at_path(&r.path))
            .cloned()
            .ok_or_else(|| StepError::VariableResolution {
                reference: r.to_string(),
                reason: "not found".into(),
            })
    }

    fn eval(src: &str) -> Result<bool, StepError> {
        Expression::parse(src).unwrap().evaluate(&context)
    }

    #[test]
    fn test_quoted_reference_compares_as_value() {
        assert!(eval("\"$A.value\" > 10").unwrap());
        assert!(!eval("$A.value <= 10").unwrap());
    }

    #[test]
    fn test_boolean_combinators() {
        assert!(eval("$A.value > 10 && $A.label == 'big'").unwrap());
        assert!(eval("$B.value > 10 || !$B.flags").unwrap());
        assert!(eval("not ($A.value < 5 or $A.label != \"big\")").unwrap());
    }

    #[test]
    fn test_string_number_coercion() {
        assert!(eval("$B.value == \"7\"").unwrap());
        assert!(eval("$B.value >= 7").unwrap());
    }

    #[test]
    fn test_incomparable_values_fail_execution() {
        let err = eval("$A.label > 3").unwrap_err();
        assert!(matches!(err, StepError::Execution { .. }));
    }

    #[test]
    fn test_missing_field_is_resolution_error() {
        let err = eval("$A.nope == 1").unwrap_err();
        assert!(matches!(err, StepError::VariableResolution { .. }));
    }

    #[test]
    fn test_references_collected() {
        let expr = Expression::parse("$A.value > 1 && ($B.value == '${A.label}')").unwrap();
        let roots: Vec<&str> = expr.references().iter().map(|r| r.root.as_str()).collect();
        assert_eq!(roots, vec!["A", "B", "A"]);
    }

    #[test]
    fn test_parenthesised_operands_compare() {
        assert!(eval("($A.value) > 3").unwrap());
        assert!(eval("3 < ($A.value)").unwrap());
        assert!(eval("($A.value > 10) == true").unwrap());
        assert!(!eval("(($B.value)) != 7").unwrap());
        assert!(eval("(true)").unwrap());
    }

    #[test]
    fn test_ordering_operators() {
        let (twelve, seven) = (json!(12), json!(7));
        assert!(CompareOp::Gt.apply(&twelve, &seven).unwrap());
        assert!(CompareOp::Ge.apply(&seven, &seven).unwrap());
        assert!(!CompareOp::Lt.apply(&twelve, &seven).unwrap());
        assert!(CompareOp::Le.apply(&seven, &twelve).unwrap());
        assert!(CompareOp::Ne.apply(&twelve, &seven).unwrap());
        assert!(CompareOp::Lt.apply(&json!("a"), &json!(null)).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("").is_err());
        assert!(Expression::parse("$A.value >").is_err());
        assert!(Expression::parse("($A.value > 1").is_err());
        assert!(Expression::parse("($A.value) >").is_err());
        assert!(Expression::parse("()").is_err());
        assert!(Expression::parse("$A.value = 1").is_err());
        assert!(Expression::parse("foo > 1").is_err());
        assert!(Expression::parse("'open").is_err());
    }
}
