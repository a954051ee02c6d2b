//! Expression language of the default evaluator.
//!
//! Expressions read variables from the context through `ctx.` paths:
//!
//! - `ctx.field` - variable value (truthy check when used as a condition)
//! - `ctx.field.nested` - nested object access
//! - `a == b`, `a != b` - equality (strings, numbers, booleans, null)
//! - `a > b`, `a >= b`, `a < b`, `a <= b` - numeric comparison
//! - `!expr`, `expr && expr`, `expr || expr` - logic (`&&` binds tighter)
//! - `(expr)` - grouping
//! - `42`, `-1.5`, `"text"`, `true`, `false`, `null` - literals
//!
//! Examples:
//! - `ctx.enabled`
//! - `ctx.amount > 100 && ctx.approved`
//! - `ctx._event.data.code == "E42"`
//! - `ctx.retries < ctx.max_retries`
//!
//! Missing variables read as `null`. Ordering comparisons on anything other
//! than two numbers are evaluation errors.

use crate::context::Context;
use crate::error::CoreError;
use serde_json::{Map, Value};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// JSON literal.
    Literal(Value),
    /// `ctx.` path, split on dots.
    Field(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses an expression from text.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let tokens = lex(s)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected {:?}", tok)));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context.
    pub fn eval(&self, ctx: &dyn Context) -> Result<Value, CoreError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(path) => Ok(read_path(ctx, path)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(ctx)?))),
            Expr::And(left, right) => {
                let ok = is_truthy(&left.eval(ctx)?) && is_truthy(&right.eval(ctx)?);
                Ok(Value::Bool(ok))
            }
            Expr::Or(left, right) => {
                let ok = is_truthy(&left.eval(ctx)?) || is_truthy(&right.eval(ctx)?);
                Ok(Value::Bool(ok))
            }
            Expr::Compare(op, left, right) => {
                let l = left.eval(ctx)?;
                let r = right.eval(ctx)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidExpression {
        reason: reason.into(),
    }
}

fn read_path(ctx: &dyn Context, path: &[String]) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return Value::Object(ctx.variables());
    };
    let mut current = ctx.get(head).unwrap_or(Value::Null);
    for part in rest {
        current = match current {
            Value::Object(mut map) => map.remove(part).unwrap_or(Value::Null),
            Value::Array(mut items) => match part.parse::<usize>() {
                Ok(i) if i < items.len() => items.swap_remove(i),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
    }
    current
}

/// Truthiness used for conditions: null, false, 0, "" and empty
/// collections are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, CoreError> {
    let numbers = || {
        l.as_f64()
            .zip(r.as_f64())
            .ok_or_else(|| CoreError::Evaluation {
                expr: format!("{} {} {}", l, op.symbol(), r),
                reason: "ordering comparison requires two numbers".to_string(),
            })
    };

    match op {
        CmpOp::Eq => Ok(values_equal(l, r)),
        CmpOp::Ne => Ok(!values_equal(l, r)),
        CmpOp::Gt => numbers().map(|(a, b)| a > b),
        CmpOp::Ge => numbers().map(|(a, b)| a >= b),
        CmpOp::Lt => numbers().map(|(a, b)| a < b),
        CmpOp::Le => numbers().map(|(a, b)| a <= b),
    }
}

/// Sets `value` at a dotted variable location (`a`, `a.b.c`, optionally
/// prefixed with `ctx.`), creating intermediate objects.
pub fn assign_path(ctx: &mut dyn Context, location: &str, value: Value) -> Result<(), CoreError> {
    let location = location.strip_prefix("ctx.").unwrap_or(location);
    let parts: Vec<&str> = location.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(invalid(format!("invalid assignment location '{}'", location)));
    }

    let Some((head, rest)) = parts.split_first() else {
        return Err(invalid("empty assignment location"));
    };
    if rest.is_empty() {
        ctx.set(head, value);
        return Ok(());
    }

    let mut root = match ctx.get(head) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    insert_nested(&mut root, rest, value);
    ctx.set(head, Value::Object(root));
    Ok(())
}

fn insert_nested(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = map
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_nested(inner, rest, value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Dot,
    Number(f64),
    Str(String),
    Cmp(CmpOp),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, CoreError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(other) => s.push(*other),
                                None => return Err(invalid("unterminated string")),
                            }
                            i += 2;
                        }
                        Some(other) => {
                            s.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("invalid number: '{}'", text)))?;
                tokens.push(Token::Number(num));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

/// Recursive descent over the token stream.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, CoreError> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(invalid("expected ')'"));
                }
                Ok(expr)
            }
            Some(Token::Number(n)) => serde_json::Number::from_f64(n)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| invalid(format!("invalid number: '{}'", n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "ctx" => self.parse_path(),
                other => Err(invalid(format!(
                    "unknown identifier '{}'; variables are read as ctx.<name>",
                    other
                ))),
            },
            Some(tok) => Err(invalid(format!("unexpected {:?}", tok))),
            None => Err(invalid("unexpected end of expression")),
        }
    }

    fn parse_path(&mut self) -> Result<Expr, CoreError> {
        let mut path = Vec::new();
        while self.eat(&Token::Dot) {
            match self.next() {
                Some(Token::Ident(part)) => path.push(part),
                Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                    path.push(format!("{}", n as u64))
                }
                _ => return Err(invalid("expected field name after '.'")),
            }
        }
        if path.is_empty() {
            return Err(invalid("field must be written as ctx.<name>"));
        }
        Ok(Expr::Field(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonContext;
    use serde_json::json;

    fn eval(expr: &str, vars: Value) -> Value {
        let ctx = JsonContext::from_value(vars);
        Expr::parse(expr).unwrap().eval(&ctx).unwrap()
    }

    fn check(expr: &str, vars: Value) -> bool {
        is_truthy(&eval(expr, vars))
    }

    #[test]
    fn test_truthy_check() {
        assert!(check("ctx.enabled", json!({"enabled": true})));
        assert!(!check("ctx.enabled", json!({"enabled": false})));
        assert!(!check("ctx.enabled", json!({"enabled": null})));
        assert!(!check("ctx.enabled", json!({})));
    }

    #[test]
    fn test_equality() {
        assert!(check("ctx.status == \"active\"", json!({"status": "active"})));
        assert!(!check("ctx.status == \"active\"", json!({"status": "inactive"})));
        assert!(check("ctx.status != \"inactive\"", json!({"status": "active"})));
        assert!(check("ctx.count == 42", json!({"count": 42})));
        assert!(check("ctx.value == null", json!({})));
        assert!(check("ctx.flag == false", json!({"flag": false})));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(check("ctx.amount > 100", json!({"amount": 150})));
        assert!(!check("ctx.amount > 100", json!({"amount": 100})));
        assert!(check("ctx.amount >= 100", json!({"amount": 100})));
        assert!(check("ctx.temp > -10", json!({"temp": 0})));
        assert!(check("ctx.rate <= 0.5", json!({"rate": 0.5})));
        assert!(check("ctx.retries < ctx.max", json!({"retries": 1, "max": 3})));
    }

    #[test]
    fn test_ordering_on_non_numbers_is_an_error() {
        let ctx = JsonContext::from_value(json!({"value": "not a number"}));
        let expr = Expr::parse("ctx.value > 10").unwrap();
        assert!(matches!(expr.eval(&ctx), Err(CoreError::Evaluation { .. })));

        let expr = Expr::parse("ctx.missing < 1").unwrap();
        assert!(expr.eval(&ctx).is_err());
    }

    #[test]
    fn test_logic_and_precedence() {
        let vars = json!({"a": true, "b": false, "c": true});
        assert!(!check("ctx.a && ctx.b", vars.clone()));
        assert!(check("ctx.a || ctx.b", vars.clone()));
        assert!(check("ctx.b && ctx.a || ctx.c", vars.clone()));
        assert!(!check("ctx.b && (ctx.a || ctx.c)", vars.clone()));
        assert!(check("!(ctx.a && ctx.b)", vars.clone()));
        assert!(check("!!ctx.a", vars));
    }

    #[test]
    fn test_nested_and_indexed_fields() {
        let vars = json!({"order": {"customer": {"verified": true}, "items": [5, 7]}});
        assert!(check("ctx.order.customer.verified", vars.clone()));
        assert!(!check("ctx.order.missing.verified", vars.clone()));
        assert_eq!(eval("ctx.order.items.1", vars), json!(7));
    }

    #[test]
    fn test_value_expressions() {
        assert_eq!(eval("42", json!({})), json!(42.0));
        assert_eq!(eval("\"hi \\\"there\\\"\"", json!({})), json!("hi \"there\""));
        assert_eq!(eval("ctx.name", json!({"name": "x"})), json!("x"));
        assert_eq!(eval("ctx.n > 1", json!({"n": 2})), json!(true));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "   ",
            "foo.bar",
            "ctx.",
            "ctx",
            "(ctx.a && ctx.b",
            "ctx.name == \"unclosed",
            "ctx.value > abc",
            "ctx.a ctx.b",
            "ctx.a # 1",
        ] {
            assert!(
                matches!(Expr::parse(bad), Err(CoreError::InvalidExpression { .. })),
                "expected parse error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_assign_path() {
        let mut ctx = JsonContext::from_value(json!({"order": {"id": 1}}));
        assign_path(&mut ctx, "ctx.order.total", json!(9)).unwrap();
        assign_path(&mut ctx, "count", json!(1)).unwrap();
        assign_path(&mut ctx, "a.b.c", json!(true)).unwrap();
        assert_eq!(ctx.get("order"), Some(json!({"id": 1, "total": 9})));
        assert_eq!(ctx.get("count"), Some(json!(1)));
        assert_eq!(ctx.get("a"), Some(json!({"b": {"c": true}})));
        assert!(assign_path(&mut ctx, "a..b", json!(1)).is_err());
    }
}
