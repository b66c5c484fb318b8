//! Record filter DSL parser and evaluator for rule-level filtering.
//!
//! Tracking rules can restrict themselves to records matching a filter
//! expression. Supported syntax:
//! - Field comparisons: `state == 'sale'`, `total > 100`, `qty <= 5`
//! - Field presence: `has('partner_id')`
//! - Logical operators: `&&` (AND), `||` (OR), `!` (NOT)
//! - Grouping: `(a) && (b || c)`
//!
//! Parse errors surface at rule-save time as configuration errors.
//! Evaluation errors (e.g., ordering a non-numeric field) are reported to
//! the caller, which defaults to *match* and logs: a broken filter must
//! never silently drop events.
//!
//! # Examples
//!
//! ```ignore
//! let parser = FilterParser::new();
//! let ast = parser.parse("state == 'sale' && total > 100")?;
//! let matched = parser.evaluate(&ast, &record)?;
//! ```

use std::fmt;

use crate::{
    entity::{EntityRecord, TypedValue},
    error::{PipelineError, Result},
};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
}

impl CmpOp {
    /// Source form of the operator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }
}

/// Literal value on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Quoted string
    Str(String),
    /// Number (integers and floats share one representation)
    Num(f64),
    /// `true` / `false`
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "'{s}'"),
            Literal::Num(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Abstract syntax tree for record filters.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterAst {
    /// Comparison: field op literal
    Compare {
        /// Field name
        field: String,
        /// Operator
        op:    CmpOp,
        /// Literal to compare against
        value: Literal,
    },
    /// Field presence check
    Has {
        /// Field name
        field: String,
    },
    /// Logical AND
    And {
        /// Left operand
        left:  Box<FilterAst>,
        /// Right operand
        right: Box<FilterAst>,
    },
    /// Logical OR
    Or {
        /// Left operand
        left:  Box<FilterAst>,
        /// Right operand
        right: Box<FilterAst>,
    },
    /// Logical NOT
    Not {
        /// Operand
        expr: Box<FilterAst>,
    },
}

impl fmt::Display for FilterAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAst::Compare { field, op, value } => {
                write!(f, "{field} {} {value}", op.as_str())
            },
            FilterAst::Has { field } => write!(f, "has('{field}')"),
            FilterAst::And { left, right } => write!(f, "({left}) && ({right})"),
            FilterAst::Or { left, right } => write!(f, "({left}) || ({right})"),
            FilterAst::Not { expr } => write!(f, "!({expr})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Filter parser and evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterParser;

impl FilterParser {
    /// Create a new filter parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parse a filter string into an AST.
    pub fn parse(&self, filter: &str) -> Result<FilterAst> {
        let tokens = tokenize(filter)?;
        if tokens.is_empty() {
            return Err(PipelineError::InvalidFilter {
                reason: "empty filter expression".to_string(),
            });
        }
        let mut cursor = Cursor {
            tokens: &tokens,
            pos:    0,
        };
        let ast = cursor.parse_or()?;
        if cursor.pos != tokens.len() {
            return Err(PipelineError::InvalidFilter {
                reason: format!("unexpected trailing input at token {}", cursor.pos),
            });
        }
        Ok(ast)
    }

    /// Evaluate a parsed filter against a record snapshot.
    pub fn evaluate(&self, ast: &FilterAst, record: &dyn EntityRecord) -> Result<bool> {
        match ast {
            FilterAst::Compare { field, op, value } => {
                eval_compare(record.value(field), *op, value, field)
            },
            FilterAst::Has { field } => {
                Ok(!matches!(record.value(field), None | Some(TypedValue::Null)))
            },
            FilterAst::And { left, right } => {
                Ok(self.evaluate(left, record)? && self.evaluate(right, record)?)
            },
            FilterAst::Or { left, right } => {
                Ok(self.evaluate(left, record)? || self.evaluate(right, record)?)
            },
            FilterAst::Not { expr } => Ok(!self.evaluate(expr, record)?),
        }
    }

    /// Parse and evaluate in one step.
    pub fn parse_and_evaluate(&self, filter: &str, record: &dyn EntityRecord) -> Result<bool> {
        let ast = self.parse(filter)?;
        self.evaluate(&ast, record)
    }
}

fn eval_compare(
    value: Option<TypedValue>,
    op: CmpOp,
    literal: &Literal,
    field: &str,
) -> Result<bool> {
    let value = match value {
        None | Some(TypedValue::Null) => {
            // Missing fields never match equality, always mismatch inequality.
            return Ok(matches!(op, CmpOp::Ne));
        },
        Some(v) => v,
    };

    match op {
        CmpOp::Eq => Ok(values_equal(&value, literal)),
        CmpOp::Ne => Ok(!values_equal(&value, literal)),
        CmpOp::Gt | CmpOp::Lt | CmpOp::Ge | CmpOp::Le => {
            let lhs = numeric(&value).ok_or_else(|| PipelineError::FilterEvaluationFailed {
                reason: format!("field '{field}' is not numeric, cannot order"),
            })?;
            let rhs = match literal {
                Literal::Num(n) => *n,
                other => {
                    return Err(PipelineError::FilterEvaluationFailed {
                        reason: format!("cannot order field '{field}' against {other}"),
                    });
                },
            };
            Ok(match op {
                CmpOp::Gt => lhs > rhs,
                CmpOp::Lt => lhs < rhs,
                CmpOp::Ge => lhs >= rhs,
                CmpOp::Le => lhs <= rhs,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        },
    }
}

fn values_equal(value: &TypedValue, literal: &Literal) -> bool {
    match (value, literal) {
        (TypedValue::Str(s), Literal::Str(l)) => s == l,
        (TypedValue::Bool(b), Literal::Bool(l)) => b == l,
        (TypedValue::Int(i), Literal::Num(n)) => (*i as f64 - n).abs() < f64::EPSILON,
        (TypedValue::Float(f), Literal::Num(n)) => (f - n).abs() < f64::EPSILON,
        // References compare by display name, the only stable operator-facing form.
        (TypedValue::OneRef(Some(r)), Literal::Str(l)) => &r.name == l,
        _ => false,
    }
}

fn numeric(value: &TypedValue) -> Option<f64> {
    match value {
        TypedValue::Int(i) => Some(*i as f64),
        TypedValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            },
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            },
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            },
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::And);
                } else {
                    return Err(PipelineError::InvalidFilter {
                        reason: "expected '&&', got single '&'".to_string(),
                    });
                }
            },
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Or);
                } else {
                    return Err(PipelineError::InvalidFilter {
                        reason: "expected '||', got single '|'".to_string(),
                    });
                }
            },
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            },
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Eq));
                } else {
                    return Err(PipelineError::InvalidFilter {
                        reason: "expected '==', got single '='".to_string(),
                    });
                }
            },
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            },
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            },
            '\'' => {
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => lit.push(c),
                        None => {
                            return Err(PipelineError::InvalidFilter {
                                reason: "unterminated string literal".to_string(),
                            });
                        },
                    }
                }
                tokens.push(Token::Str(lit));
            },
            _ if ch.is_ascii_digit() || ch == '-' => {
                let mut num = String::new();
                num.push(ch);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = num.parse::<f64>().map_err(|_| PipelineError::InvalidFilter {
                    reason: format!("invalid number literal '{num}'"),
                })?;
                tokens.push(Token::Num(parsed));
            },
            _ if ch.is_alphabetic() || ch == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(ident)),
                }
            },
            other => {
                return Err(PipelineError::InvalidFilter {
                    reason: format!("unexpected character '{other}'"),
                });
            },
        }
    }

    Ok(tokens)
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos:    usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, context: &str) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(PipelineError::InvalidFilter {
                reason: format!("{context}: expected {expected:?}, got {other:?}"),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<FilterAst> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FilterAst::Or {
                left:  Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterAst> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = FilterAst::And {
                left:  Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterAst> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                let expr = self.parse_unary()?;
                Ok(FilterAst::Not {
                    expr: Box::new(expr),
                })
            },
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "group")?;
                Ok(inner)
            },
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<FilterAst> {
        let ident = match self.next() {
            Some(Token::Ident(name)) => name.clone(),
            other => {
                return Err(PipelineError::InvalidFilter {
                    reason: format!("expected field name, got {other:?}"),
                });
            },
        };

        // has('field') presence check
        if ident == "has" && self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let field = match self.next() {
                Some(Token::Str(name)) => name.clone(),
                other => {
                    return Err(PipelineError::InvalidFilter {
                        reason: format!("has(): expected quoted field name, got {other:?}"),
                    });
                },
            };
            self.expect(&Token::RParen, "has()")?;
            return Ok(FilterAst::Has { field });
        }

        let op = match self.next() {
            Some(Token::Op(op)) => *op,
            other => {
                return Err(PipelineError::InvalidFilter {
                    reason: format!("expected comparison operator after '{ident}', got {other:?}"),
                });
            },
        };

        let value = match self.next() {
            Some(Token::Str(s)) => Literal::Str(s.clone()),
            Some(Token::Num(n)) => Literal::Num(*n),
            Some(Token::Bool(b)) => Literal::Bool(*b),
            other => {
                return Err(PipelineError::InvalidFilter {
                    reason: format!("expected literal after operator, got {other:?}"),
                });
            },
        };

        Ok(FilterAst::Compare {
            field: ident,
            op,
            value,
        })
    }
}
