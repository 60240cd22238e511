//! Conditional evaluator for `if` directives.
//!
//! Conditions are tokenized with logos, parsed by recursive descent with
//! conventional precedence (`!` binds tightest, then comparisons, then `&&`,
//! then `||`, left-associative), and evaluated exactly once at encounter
//! time. `&&` and `||` short-circuit so runnable macros on the untaken side
//! never execute.
//!
//! Values are integers, text, or booleans. Comparison coerces to numeric
//! when both operands parse as integers and otherwise compares literal
//! text; mixing a boolean with anything else is a condition type error.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use logos::Logos;

use crate::errors::{Pos, PrepError, PrepResult};

/// Condition tokens.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t]+")]
enum Tok {
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,

    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
}

/// Strip surrounding quotes and resolve backslash escapes.
fn unescape(slice: &str) -> Option<String> {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '\\' => out.push('\\'),
                '"' => out.push('"'),
                other => out.push(other),
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CondExpr {
    Int(i64),
    Str(String),
    /// A macro call; arguments are kept as verbatim text.
    Call { name: String, args: Vec<String> },
    Cmp {
        op: CmpOp,
        lhs: Box<CondExpr>,
        rhs: Box<CondExpr>,
    },
    And(Box<CondExpr>, Box<CondExpr>),
    Or(Box<CondExpr>, Box<CondExpr>),
    Not(Box<CondExpr>),
}

/// A value a condition sub-expression reduces to.
#[derive(Debug, Clone, PartialEq)]
pub enum CondValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl CondValue {
    /// Truthiness of a bare value used as a condition or logic operand.
    pub fn truthy(&self) -> bool {
        match self {
            CondValue::Bool(b) => *b,
            CondValue::Int(i) => *i != 0,
            CondValue::Text(t) => !(t.is_empty() || t == "0" || t == "false"),
        }
    }

    fn as_numeric(&self) -> Option<i64> {
        match self {
            CondValue::Int(i) => Some(*i),
            CondValue::Text(t) => t.trim().parse().ok(),
            CondValue::Bool(_) => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            CondValue::Int(i) => i.to_string(),
            CondValue::Text(t) => t.clone(),
            CondValue::Bool(b) => b.to_string(),
        }
    }
}

/// Macro invocation hook for condition evaluation.
///
/// The expansion engine implements this; the evaluator stays ignorant of
/// tables and toolchains. [`NoOpRunner`] is for conditions that must not
/// call anything.
#[async_trait]
pub trait CallRunner: Send {
    /// Invoke macro `name` with verbatim argument texts, returning its
    /// expansion value.
    async fn call(&mut self, name: &str, args: &[String], pos: &Pos) -> PrepResult<String>;
}

/// A runner that rejects every call.
pub struct NoOpRunner;

#[async_trait]
impl CallRunner for NoOpRunner {
    async fn call(&mut self, name: &str, _args: &[String], pos: &Pos) -> PrepResult<String> {
        Err(PrepError::ConditionType {
            pos: pos.clone(),
            msg: format!("no runner available for call to '{name}'"),
        })
    }
}

/// Parse a condition string.
pub fn parse(raw: &str, pos: &Pos) -> PrepResult<CondExpr> {
    let mut tokens = Vec::new();
    for (result, span) in Tok::lexer(raw).spanned() {
        match result {
            Ok(tok) => tokens.push((tok, span)),
            Err(()) => {
                return Err(PrepError::DirectiveSyntax {
                    pos: pos.clone(),
                    msg: format!("unrecognized token in condition: '{}'", &raw[span]),
                })
            }
        }
    }
    let mut parser = Parser {
        raw,
        tokens,
        at: 0,
        pos,
    };
    let expr = parser.parse_or()?;
    if parser.at != parser.tokens.len() {
        return Err(parser.error("trailing tokens after condition"));
    }
    Ok(expr)
}

struct Parser<'a> {
    raw: &'a str,
    tokens: Vec<(Tok, std::ops::Range<usize>)>,
    at: usize,
    pos: &'a Pos,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> PrepError {
        PrepError::DirectiveSyntax {
            pos: self.pos.clone(),
            msg: msg.to_string(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.at).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.at).map(|(t, _)| t.clone());
        if t.is_some() {
            self.at += 1;
        }
        t
    }

    fn parse_or(&mut self) -> PrepResult<CondExpr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = CondExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PrepResult<CondExpr> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.bump();
            let rhs = self.parse_cmp()?;
            lhs = CondExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> PrepResult<CondExpr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => CmpOp::Eq,
                Some(Tok::NotEq) => CmpOp::Ne,
                Some(Tok::Lt) => CmpOp::Lt,
                Some(Tok::Gt) => CmpOp::Gt,
                Some(Tok::LtEq) => CmpOp::Le,
                Some(Tok::GtEq) => CmpOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = CondExpr::Cmp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PrepResult<CondExpr> {
        if self.peek() == Some(&Tok::Bang) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(CondExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PrepResult<CondExpr> {
        match self.bump() {
            Some(Tok::Int(i)) => Ok(CondExpr::Int(i)),
            Some(Tok::Str(s)) => Ok(CondExpr::Str(s)),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Tok::Ident(name)) => {
                if self.peek() != Some(&Tok::LParen) {
                    return Err(self.error(&format!("expected '(' after '{name}'")));
                }
                self.bump();
                let args = self.parse_call_args()?;
                Ok(CondExpr::Call { name, args })
            }
            _ => Err(self.error("expected a value, call, or '('")),
        }
    }

    /// Collect verbatim argument texts up to the matching ')'. Nested
    /// parentheses stay inside the argument; top-level commas split.
    fn parse_call_args(&mut self) -> PrepResult<Vec<String>> {
        let mut args = Vec::new();
        let mut depth = 0usize;
        let mut arg_span: Option<(usize, usize)> = None;

        loop {
            let (tok, span) = match self.tokens.get(self.at) {
                Some(t) => t.clone(),
                None => return Err(self.error("unterminated argument list")),
            };
            self.at += 1;
            match tok {
                Tok::RParen if depth == 0 => {
                    if let Some((s, e)) = arg_span.take() {
                        args.push(self.raw[s..e].trim().to_string());
                    }
                    return Ok(args);
                }
                Tok::Comma if depth == 0 => {
                    let (s, e) = arg_span
                        .take()
                        .ok_or_else(|| self.error("empty argument"))?;
                    args.push(self.raw[s..e].trim().to_string());
                }
                other => {
                    if other == Tok::LParen {
                        depth += 1;
                    } else if other == Tok::RParen {
                        depth -= 1;
                    }
                    arg_span = Some(match arg_span {
                        None => (span.start, span.end),
                        Some((s, _)) => (s, span.end),
                    });
                }
            }
        }
    }
}

/// Evaluate a condition to its truth value.
pub async fn eval(expr: &CondExpr, runner: &mut dyn CallRunner, pos: &Pos) -> PrepResult<bool> {
    Ok(eval_value(expr, runner, pos).await?.truthy())
}

fn eval_value<'a>(
    expr: &'a CondExpr,
    runner: &'a mut dyn CallRunner,
    pos: &'a Pos,
) -> Pin<Box<dyn Future<Output = PrepResult<CondValue>> + Send + 'a>> {
    Box::pin(async move {
        match expr {
            CondExpr::Int(i) => Ok(CondValue::Int(*i)),
            CondExpr::Str(s) => Ok(CondValue::Text(s.clone())),
            CondExpr::Call { name, args } => {
                let value = runner.call(name, args, pos).await?;
                Ok(CondValue::Text(value))
            }
            CondExpr::Cmp { op, lhs, rhs } => {
                let l = eval_value(lhs, &mut *runner, pos).await?;
                let r = eval_value(rhs, &mut *runner, pos).await?;
                compare(*op, &l, &r, pos).map(CondValue::Bool)
            }
            CondExpr::And(lhs, rhs) => {
                if !eval_value(lhs, &mut *runner, pos).await?.truthy() {
                    return Ok(CondValue::Bool(false));
                }
                let r = eval_value(rhs, &mut *runner, pos).await?;
                Ok(CondValue::Bool(r.truthy()))
            }
            CondExpr::Or(lhs, rhs) => {
                if eval_value(lhs, &mut *runner, pos).await?.truthy() {
                    return Ok(CondValue::Bool(true));
                }
                let r = eval_value(rhs, &mut *runner, pos).await?;
                Ok(CondValue::Bool(r.truthy()))
            }
            CondExpr::Not(inner) => {
                let v = eval_value(inner, &mut *runner, pos).await?;
                Ok(CondValue::Bool(!v.truthy()))
            }
        }
    })
}

/// Apply a comparison. Numeric when both sides parse as integers, literal
/// text otherwise; booleans only compare for (in)equality with booleans.
fn compare(op: CmpOp, l: &CondValue, r: &CondValue, pos: &Pos) -> PrepResult<bool> {
    use CondValue::Bool;
    match (l, r) {
        (Bool(a), Bool(b)) => match op {
            CmpOp::Eq => Ok(a == b),
            CmpOp::Ne => Ok(a != b),
            _ => Err(PrepError::ConditionType {
                pos: pos.clone(),
                msg: "booleans do not support ordering comparisons".to_string(),
            }),
        },
        (Bool(_), _) | (_, Bool(_)) => Err(PrepError::ConditionType {
            pos: pos.clone(),
            msg: "cannot compare a boolean with a non-boolean".to_string(),
        }),
        _ => {
            if let (Some(a), Some(b)) = (l.as_numeric(), r.as_numeric()) {
                Ok(apply(op, &a, &b))
            } else {
                Ok(apply(op, &l.as_text(), &r.as_text()))
            }
        }
    }
}

fn apply<T: PartialOrd + PartialEq>(op: CmpOp, a: &T, b: &T) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Ge => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pos() -> Pos {
        Pos::new("cond.test", 1)
    }

    fn parse_ok(s: &str) -> CondExpr {
        parse(s, &pos()).unwrap()
    }

    /// Returns canned values and counts invocations.
    struct ScriptedRunner {
        values: HashMap<String, String>,
        calls: usize,
    }

    impl ScriptedRunner {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                values: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl CallRunner for ScriptedRunner {
        async fn call(&mut self, name: &str, _args: &[String], pos: &Pos) -> PrepResult<String> {
            self.calls += 1;
            self.values.get(name).cloned().ok_or_else(|| {
                PrepError::ConditionType {
                    pos: pos.clone(),
                    msg: format!("unknown call '{name}'"),
                }
            })
        }
    }

    async fn eval_str(s: &str, runner: &mut dyn CallRunner) -> PrepResult<bool> {
        eval(&parse_ok(s), runner, &pos()).await
    }

    #[tokio::test]
    async fn test_literals_and_truthiness() {
        let mut r = NoOpRunner;
        assert!(eval_str("1", &mut r).await.unwrap());
        assert!(!eval_str("0", &mut r).await.unwrap());
        assert!(eval_str("\"yes\"", &mut r).await.unwrap());
        assert!(!eval_str("\"\"", &mut r).await.unwrap());
        assert!(!eval_str("\"false\"", &mut r).await.unwrap());
    }

    #[tokio::test]
    async fn test_numeric_comparison() {
        let mut r = NoOpRunner;
        assert!(eval_str("2 > 1", &mut r).await.unwrap());
        assert!(eval_str("10 >= 10", &mut r).await.unwrap());
        assert!(!eval_str("3 == 4", &mut r).await.unwrap());
        // Both sides parse as integers, so this is numeric, not lexical.
        assert!(eval_str("\"10\" > \"9\"", &mut r).await.unwrap());
    }

    #[tokio::test]
    async fn test_text_comparison_fallback() {
        let mut r = NoOpRunner;
        assert!(eval_str("\"abc\" == \"abc\"", &mut r).await.unwrap());
        assert!(eval_str("\"abc\" < \"abd\"", &mut r).await.unwrap());
        assert!(eval_str("\"x1\" != 1", &mut r).await.unwrap());
    }

    #[tokio::test]
    async fn test_boolean_shape_errors() {
        let mut r = NoOpRunner;
        let err = eval_str("(1 == 1) > 0", &mut r).await.unwrap_err();
        assert!(matches!(err, PrepError::ConditionType { .. }));
        let err = eval_str("(1 == 1) < (2 == 2)", &mut r).await.unwrap_err();
        assert!(matches!(err, PrepError::ConditionType { .. }));
    }

    #[tokio::test]
    async fn test_precedence() {
        let mut r = NoOpRunner;
        // ! binds tighter than comparison; && tighter than ||.
        assert!(eval_str("!0 && 1", &mut r).await.unwrap());
        assert!(eval_str("0 && 0 || 1", &mut r).await.unwrap());
        assert!(!eval_str("0 && (0 || 1)", &mut r).await.unwrap());
        assert!(eval_str("1 == 1 && 2 == 2", &mut r).await.unwrap());
    }

    #[tokio::test]
    async fn test_call_value_used_in_comparison() {
        let mut r = ScriptedRunner::new(&[("version", "42")]);
        assert!(eval_str("version() >= 40", &mut r).await.unwrap());
        assert_eq!(r.calls, 1);
    }

    #[tokio::test]
    async fn test_short_circuit_and() {
        let mut r = ScriptedRunner::new(&[("expensive", "1")]);
        assert!(!eval_str("0 && expensive()", &mut r).await.unwrap());
        assert_eq!(r.calls, 0, "short-circuited operand must not run");
    }

    #[tokio::test]
    async fn test_short_circuit_or() {
        let mut r = ScriptedRunner::new(&[("expensive", "1")]);
        assert!(eval_str("1 || expensive()", &mut r).await.unwrap());
        assert_eq!(r.calls, 0, "short-circuited operand must not run");
    }

    #[tokio::test]
    async fn test_call_args_kept_verbatim() {
        let expr = parse_ok("probe(raw_word, \"x,y\", nested(1))");
        match expr {
            CondExpr::Call { name, args } => {
                assert_eq!(name, "probe");
                assert_eq!(args, vec!["raw_word", "\"x,y\"", "nested(1)"]);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("&&", &pos()).is_err());
        assert!(parse("foo", &pos()).is_err());
        assert!(parse("(1", &pos()).is_err());
        assert!(parse("1 2", &pos()).is_err());
        assert!(parse("probe(1", &pos()).is_err());
    }
}
