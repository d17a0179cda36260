use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use std::fmt::Debug;
use tracing::debug;

use crate::data::scope::Scope;
use crate::error::ResolveError;

/// Evaluates a reference against a scope. Resolution must be a pure function
/// of the scope and report failures as errors.
pub trait Resolver: Send + Sync + Debug {
    fn resolve(&self, reference: &str, scope: &dyn Scope) -> Result<Value, ResolveError>;
}

/// Default resolver.
///
/// `$name`, `${name}`, `$.name`, `$name.field`, `$name[0]` and `$name["key"]`
/// are plain lookups and may return any JSON value. Everything else is handed
/// to evalexpr after `$` references are rewritten to bare identifiers.
#[derive(Debug, Default, Clone)]
pub struct ExprResolver;

impl ExprResolver {
    pub fn new() -> Self {
        Self
    }

    fn eval_expression(&self, expr: &str, scope: &dyn Scope) -> Result<Value, ResolveError> {
        let rewritten = strip_references(expr);
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for name in scope.attr_names() {
            if let Some(attr) = scope.get_attr(&name) {
                expose(&mut eval_ctx, name, &attr.value);
            }
        }

        let result = eval_with_context(&rewritten, &eval_ctx).map_err(|e| ResolveError::Expression {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(from_eval(result))
    }
}

impl Resolver for ExprResolver {
    fn resolve(&self, reference: &str, scope: &dyn Scope) -> Result<Value, ResolveError> {
        let reference = reference.trim();
        match PathRef::parse(reference) {
            Some(path) => path.lookup(scope),
            None => self.eval_expression(reference, scope),
        }
    }
}

fn expose(ctx: &mut HashMapContext<DefaultNumericTypes>, name: String, value: &Value) {
    if let Value::Object(map) = value {
        for (k, v) in map {
            expose(ctx, format!("{}.{}", name, k), v);
        }
        return;
    }
    if let Some(ev) = to_eval(value) {
        if let Err(e) = ctx.set_value(name.clone(), ev) {
            debug!(attr = %name, error = %e, "Attribute not exposed to expression");
        }
    }
}

fn to_eval(value: &Value) -> Option<evalexpr::Value> {
    match value {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        Value::Null => Some(evalexpr::Value::Empty),
        Value::Array(items) => items
            .iter()
            .map(to_eval)
            .collect::<Option<Vec<_>>>()
            .map(evalexpr::Value::Tuple),
        Value::Object(_) => None,
    }
}

fn from_eval(value: evalexpr::Value) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(items.into_iter().map(from_eval).collect()),
        _ => Value::Null,
    }
}

/// Rewrites `${a}`, `$.a` and `$a` to `a`, leaving string literals alone.
fn strip_references(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            break;
                        }
                        out.push(inner);
                    }
                }
                Some('.') => {
                    chars.next();
                }
                _ => {}
            },
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A plain attribute lookup such as `$order.items[0].sku`.
#[derive(Debug, Clone, PartialEq)]
struct PathRef {
    root: String,
    segments: Vec<Segment>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl PathRef {
    fn parse(reference: &str) -> Option<Self> {
        let body = if let Some(inner) = reference.strip_prefix("${") {
            inner.strip_suffix('}')?
        } else if let Some(inner) = reference.strip_prefix("$.") {
            inner
        } else {
            reference.strip_prefix('$')?
        };

        let chars: Vec<char> = body.chars().collect();
        let mut pos = 0;
        let root = read_ident(&chars, &mut pos)?;
        let mut segments = Vec::new();

        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    segments.push(Segment::Field(read_ident(&chars, &mut pos)?));
                }
                '[' => {
                    pos += 1;
                    let close = chars[pos..].iter().position(|c| *c == ']')? + pos;
                    let inner: String = chars[pos..close].iter().collect();
                    let inner = inner.trim();
                    let segment = if let Ok(idx) = inner.parse::<usize>() {
                        Segment::Index(idx)
                    } else if inner.len() >= 2
                        && ((inner.starts_with('"') && inner.ends_with('"'))
                            || (inner.starts_with('\'') && inner.ends_with('\'')))
                    {
                        Segment::Field(inner[1..inner.len() - 1].to_string())
                    } else if !inner.is_empty() && inner.chars().all(is_ident_char) {
                        Segment::Field(inner.to_string())
                    } else {
                        return None;
                    };
                    segments.push(segment);
                    pos = close + 1;
                }
                _ => return None,
            }
        }

        Some(Self { root, segments })
    }

    fn lookup(&self, scope: &dyn Scope) -> Result<Value, ResolveError> {
        let attr = scope
            .get_attr(&self.root)
            .ok_or_else(|| ResolveError::Unresolved(self.root.clone()))?;

        let mut current = &attr.value;
        for segment in &self.segments {
            let next = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name),
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx),
                (Segment::Index(idx), Value::Object(map)) => map.get(&idx.to_string()),
                _ => None,
            };
            current = next.ok_or_else(|| ResolveError::InvalidPath(self.render()))?;
        }
        Ok(current.clone())
    }

    fn render(&self) -> String {
        let mut out = format!("${}", self.root);
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => {
                    out.push('.');
                    out.push_str(name);
                }
                Segment::Index(idx) => out.push_str(&format!("[{}]", idx)),
            }
        }
        out
    }
}

fn read_ident(chars: &[char], pos: &mut usize) -> Option<String> {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    if *pos == start {
        None
    } else {
        Some(chars[start..*pos].iter().collect())
    }
}
