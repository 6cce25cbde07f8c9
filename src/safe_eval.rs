//! Sandboxed boolean/arithmetic expression evaluation for `condition` steps.
//!
//! Parses an expression into a small AST and evaluates it against a scope
//! with no built-in functions and no way to call anything. The grammar
//! itself has no call syntax, and parsing a name immediately followed by `(`
//! raises an explicit diagnostic rather than silently treating it as a
//! grouped expression — likewise `lambda`. This is deliberately stricter
//! than the implementation this was distilled from, which allowed calls;
//! SPEC_FULL.md §4.2 is explicit that "Call and lambda forms are rejected"
//! and this module follows the spec.

use serde_json::Value;

use crate::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    Op(&'static str),
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn tokenize(mut self) -> Result<Vec<Tok>> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.rest().is_empty() {
                out.push(Tok::Eof);
                break;
            }
            let c = self.rest().chars().next().unwrap();
            if c == '\'' || c == '"' {
                out.push(self.read_string(c)?);
            } else if c.is_ascii_digit() {
                out.push(self.read_number());
            } else if c.is_alphabetic() || c == '_' {
                out.push(self.read_ident());
            } else if let Some(op) = self.read_op() {
                out.push(op);
            } else {
                return Err(EngineError::SafeEval(format!("unexpected character '{c}'")));
            }
        }
        Ok(out)
    }

    fn skip_ws(&mut self) {
        let bytes: usize = self.rest().chars().take_while(|c| c.is_whitespace()).map(|c| c.len_utf8()).sum();
        self.pos += bytes;
    }

    fn read_string(&mut self, quote: char) -> Result<Tok> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        chars.next(); // consume opening quote
        let mut s = String::new();
        let mut closed = false;
        let mut consumed = 1;
        for (i, c) in chars {
            consumed = i + c.len_utf8();
            if c == quote {
                closed = true;
                break;
            }
            s.push(c);
        }
        if !closed {
            return Err(EngineError::SafeEval("unterminated string literal".into()));
        }
        self.pos += consumed;
        Ok(Tok::Str(s))
    }

    fn read_number(&mut self) -> Tok {
        let rest = self.rest();
        let n: usize = rest
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
            .count();
        let byte_len: usize = rest.chars().take(n).map(|c| c.len_utf8()).sum();
        let text = &rest[..byte_len];
        self.pos += byte_len;
        Tok::Number(text.parse().unwrap_or(0.0))
    }

    fn read_ident(&mut self) -> Tok {
        let rest = self.rest();
        let byte_len: usize = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .map(|c| c.len_utf8())
            .sum();
        let text = rest[..byte_len].to_string();
        self.pos += byte_len;
        Tok::Ident(text)
    }

    fn read_op(&mut self) -> Option<Tok> {
        const TWO: &[&str] = &["==", "!=", "<=", ">="];
        const ONE: &str = "+-*/%()[].,:{}<>";
        let rest = self.rest();
        for op in TWO {
            if rest.starts_with(op) {
                self.pos += op.len();
                return Some(Tok::Op(match *op {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    _ => unreachable!(),
                }));
            }
        }
        let c = rest.chars().next()?;
        if ONE.contains(c) {
            self.pos += c.len_utf8();
            let s: &'static str = match c {
                '+' => "+",
                '-' => "-",
                '*' => "*",
                '/' => "/",
                '%' => "%",
                '(' => "(",
                ')' => ")",
                '[' => "[",
                ']' => "]",
                '.' => ".",
                ',' => ",",
                ':' => ":",
                '{' => "{",
                '}' => "}",
                '<' => "<",
                '>' => ">",
                _ => unreachable!(),
            };
            return Some(Tok::Op(s));
        }
        None
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Const(Value),
    Name(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    BoolOp { is_and: bool, values: Vec<Expr> },
    BinOp { left: Box<Expr>, op: &'static str, right: Box<Expr> },
    Compare { left: Box<Expr>, ops: Vec<(&'static str, Expr)> },
    Attribute { base: Box<Expr>, attr: String },
    Subscript { base: Box<Expr>, index: Box<Expr> },
    ListLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        match self.advance() {
            Tok::Op(o) if o == op => Ok(()),
            other => Err(EngineError::SafeEval(format!("expected '{op}', found {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut values = vec![self.parse_and()?];
        while matches!(self.peek(), Tok::Ident(s) if s == "or") {
            self.advance();
            values.push(self.parse_and()?);
        }
        if values.len() == 1 {
            Ok(values.pop().unwrap())
        } else {
            Ok(Expr::BoolOp { is_and: false, values })
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut values = vec![self.parse_not()?];
        while matches!(self.peek(), Tok::Ident(s) if s == "and") {
            self.advance();
            values.push(self.parse_not()?);
        }
        if values.len() == 1 {
            Ok(values.pop().unwrap())
        } else {
            Ok(Expr::BoolOp { is_and: true, values })
        }
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Tok::Ident(s) if s == "not") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek().clone() {
                Tok::Op(o @ ("==" | "!=" | "<" | "<=" | ">" | ">=")) => o,
                Tok::Ident(s) if s == "in" => "in",
                Tok::Ident(s) if s == "is" => "is",
                Tok::Ident(s) if s == "not" => {
                    // lookahead for "not in"
                    if self.pos + 1 < self.toks.len()
                        && matches!(&self.toks[self.pos + 1], Tok::Ident(n) if n == "in")
                    {
                        self.advance();
                        self.advance();
                        ops.push(("not in", self.parse_arith()?));
                        continue;
                    }
                    break;
                }
                _ => break,
            };
            self.advance();
            if op == "is" && matches!(self.peek(), Tok::Ident(s) if s == "not") {
                self.advance();
                ops.push(("is not", self.parse_arith()?));
                continue;
            }
            ops.push((op, self.parse_arith()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare { left: Box::new(left), ops })
        }
    }

    fn parse_arith(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Op(o @ ("+" | "-")) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::BinOp { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op(o @ ("*" | "/" | "%")) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::BinOp { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Tok::Op("-")) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Tok::Op("(") => {
                    return Err(EngineError::SafeEval(
                        "call expressions are not allowed in conditions".into(),
                    ));
                }
                Tok::Op(".") => {
                    self.advance();
                    let name = match self.advance() {
                        Tok::Ident(n) => n,
                        other => {
                            return Err(EngineError::SafeEval(format!(
                                "expected attribute name, found {other:?}"
                            )))
                        }
                    };
                    expr = Expr::Attribute { base: Box::new(expr), attr: name };
                }
                Tok::Op("[") => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect_op("]")?;
                    expr = Expr::Subscript { base: Box::new(expr), index: Box::new(index) };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Tok::Number(n) => Ok(Expr::Const(serde_json::json!(n))),
            Tok::Str(s) => Ok(Expr::Const(Value::String(s))),
            Tok::Ident(s) if s == "lambda" => {
                Err(EngineError::SafeEval("lambda expressions are not allowed".into()))
            }
            Tok::Ident(s) if s == "True" || s == "true" => Ok(Expr::Const(Value::Bool(true))),
            Tok::Ident(s) if s == "False" || s == "false" => Ok(Expr::Const(Value::Bool(false))),
            Tok::Ident(s) if s == "None" || s == "null" => Ok(Expr::Const(Value::Null)),
            Tok::Ident(name) => Ok(Expr::Name(name)),
            Tok::Op("(") => {
                let inner = self.parse_expr()?;
                if matches!(self.peek(), Tok::Op(",")) {
                    let mut items = vec![inner];
                    while matches!(self.peek(), Tok::Op(",")) {
                        self.advance();
                        if matches!(self.peek(), Tok::Op(")")) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect_op(")")?;
                    return Ok(Expr::TupleLit(items));
                }
                self.expect_op(")")?;
                Ok(inner)
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::Op("]")) {
                    items.push(self.parse_expr()?);
                    while matches!(self.peek(), Tok::Op(",")) {
                        self.advance();
                        if matches!(self.peek(), Tok::Op("]")) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::ListLit(items))
            }
            Tok::Op("{") => {
                let mut pairs = Vec::new();
                if !matches!(self.peek(), Tok::Op("}")) {
                    pairs.push(self.parse_map_entry()?);
                    while matches!(self.peek(), Tok::Op(",")) {
                        self.advance();
                        if matches!(self.peek(), Tok::Op("}")) {
                            break;
                        }
                        pairs.push(self.parse_map_entry()?);
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::MapLit(pairs))
            }
            other => Err(EngineError::SafeEval(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_map_entry(&mut self) -> Result<(Expr, Expr)> {
        let key = self.parse_expr()?;
        self.expect_op(":")?;
        let value = self.parse_expr()?;
        Ok((key, value))
    }
}

fn parse(expression: &str) -> Result<Expr> {
    let toks = Lexer::new(expression).tokenize()?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.parse_expr()?;
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(EngineError::SafeEval(format!(
            "unexpected trailing input near {:?}",
            parser.peek()
        )));
    }
    Ok(expr)
}

fn as_f64(v: &Value) -> Result<f64> {
    v.as_f64().ok_or_else(|| EngineError::SafeEval(format!("expected a number, got {v}")))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(expr: &Expr, scope: &Value) -> Result<Value> {
    match expr {
        Expr::Const(v) => Ok(v.clone()),
        Expr::Name(name) => crate::template::deep_get(scope, name)
            .cloned()
            .ok_or_else(|| EngineError::MissingPath(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::Neg(inner) => Ok(serde_json::json!(-as_f64(&eval(inner, scope)?)?)),
        Expr::BoolOp { is_and, values } => {
            let mut last = Value::Bool(*is_and);
            for v in values {
                last = eval(v, scope)?;
                let t = truthy(&last);
                if *is_and && !t {
                    return Ok(last);
                }
                if !*is_and && t {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::BinOp { left, op, right } => {
            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            if *op == "+" {
                if let (Value::String(a), Value::String(b)) = (&l, &r) {
                    return Ok(Value::String(format!("{a}{b}")));
                }
            }
            let (a, b) = (as_f64(&l)?, as_f64(&r)?);
            let result = match *op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                "%" => a % b,
                _ => unreachable!(),
            };
            Ok(serde_json::json!(result))
        }
        Expr::Compare { left, ops } => {
            let mut current = eval(left, scope)?;
            for (op, rhs_expr) in ops {
                let rhs = eval(rhs_expr, scope)?;
                let ok = match *op {
                    "==" => current == rhs,
                    "!=" => current != rhs,
                    "<" | "<=" | ">" | ">=" => {
                        let (a, b) = (as_f64(&current)?, as_f64(&rhs)?);
                        match *op {
                            "<" => a < b,
                            "<=" => a <= b,
                            ">" => a > b,
                            ">=" => a >= b,
                            _ => unreachable!(),
                        }
                    }
                    "in" => membership(&rhs, &current),
                    "not in" => !membership(&rhs, &current),
                    "is" => current == rhs,
                    "is not" => current != rhs,
                    _ => unreachable!(),
                };
                if !ok {
                    return Ok(Value::Bool(false));
                }
                current = rhs;
            }
            Ok(Value::Bool(true))
        }
        Expr::Attribute { base, attr } => {
            let b = eval(base, scope)?;
            b.as_object()
                .and_then(|m| m.get(attr))
                .cloned()
                .ok_or_else(|| EngineError::MissingPath(attr.clone()))
        }
        Expr::Subscript { base, index } => {
            let b = eval(base, scope)?;
            let i = eval(index, scope)?;
            match (&b, &i) {
                (Value::Array(arr), Value::Number(n)) => {
                    let idx = n.as_u64().ok_or_else(|| EngineError::SafeEval("invalid index".into()))? as usize;
                    arr.get(idx).cloned().ok_or_else(|| EngineError::SafeEval("index out of range".into()))
                }
                (Value::Object(map), Value::String(k)) => {
                    map.get(k).cloned().ok_or_else(|| EngineError::MissingPath(k.clone()))
                }
                _ => Err(EngineError::SafeEval("invalid subscript".into())),
            }
        }
        Expr::ListLit(items) | Expr::TupleLit(items) => {
            let mut out = Vec::with_capacity(items.len());
            for it in items {
                out.push(eval(it, scope)?);
            }
            Ok(Value::Array(out))
        }
        Expr::MapLit(pairs) => {
            let mut out = serde_json::Map::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = match eval(k, scope)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, eval(v, scope)?);
            }
            Ok(Value::Object(out))
        }
    }
}

fn membership(container: &Value, item: &Value) -> bool {
    match container {
        Value::Array(arr) => arr.contains(item),
        Value::String(s) => item.as_str().map(|needle| s.contains(needle)).unwrap_or(false),
        Value::Object(map) => item.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

/// Parses and evaluates `expression` against `scope`. Coercion to boolean for
/// branching is the caller's responsibility (via `truthy_value`), matching
/// the spec's "returns the evaluated value" contract.
pub fn safe_eval(expression: &str, scope: &Value) -> Result<Value> {
    let ast = parse(expression)?;
    eval(&ast, scope)
}

pub fn truthy_value(v: &Value) -> bool {
    truthy(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_true() {
        assert_eq!(safe_eval("True", &json!({})).unwrap(), json!(true));
    }

    #[test]
    fn comparison() {
        let scope = json!({"x": 5});
        assert_eq!(safe_eval("x > 3", &scope).unwrap(), json!(true));
        assert_eq!(safe_eval("x > 10", &scope).unwrap(), json!(false));
    }

    #[test]
    fn boolean_and_or_not() {
        let scope = json!({"x": 5, "y": 0});
        assert_eq!(safe_eval("x > 0 and y > 0", &scope).unwrap(), json!(false));
        assert_eq!(safe_eval("x > 0 or y > 0", &scope).unwrap(), json!(true));
        assert_eq!(safe_eval("not (y > 0)", &scope).unwrap(), json!(true));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(safe_eval("1 + 2 * 3", &json!({})).unwrap(), json!(7.0));
    }

    #[test]
    fn attribute_and_subscript_access() {
        let scope = json!({"step": {"result": {"items": [10, 20, 30]}}});
        assert_eq!(safe_eval("step.result.items[1]", &scope).unwrap(), json!(20));
    }

    #[test]
    fn membership() {
        let scope = json!({"tags": ["a", "b", "c"]});
        assert_eq!(safe_eval("'b' in tags", &scope).unwrap(), json!(true));
        assert_eq!(safe_eval("'z' not in tags", &scope).unwrap(), json!(true));
    }

    #[test]
    fn list_and_map_literals() {
        assert_eq!(safe_eval("[1, 2, 3]", &json!({})).unwrap(), json!([1, 2, 3]));
        assert_eq!(safe_eval("{'a': 1}", &json!({})).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn call_expression_rejected() {
        let err = safe_eval("len(x)", &json!({"x": [1]})).unwrap_err();
        match err {
            EngineError::SafeEval(msg) => assert!(msg.contains("call")),
            _ => panic!("expected SafeEval error"),
        }
    }

    #[test]
    fn lambda_rejected() {
        let err = safe_eval("lambda x: x", &json!({})).unwrap_err();
        match err {
            EngineError::SafeEval(msg) => assert!(msg.contains("lambda")),
            _ => panic!("expected SafeEval error"),
        }
    }

    #[test]
    fn missing_name_is_reference_error() {
        let err = safe_eval("missing_var", &json!({})).unwrap_err();
        assert!(matches!(err, EngineError::MissingPath(_)));
    }

    #[test]
    fn syntax_error_is_diagnostic() {
        let err = safe_eval("x +", &json!({"x": 1})).unwrap_err();
        assert!(matches!(err, EngineError::SafeEval(_)));
    }
}
