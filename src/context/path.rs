//! Path lookups (`ctx.a.b.c`) and `AND`/`OR` combinators (§4.1, §9).

use serde_json::Value;

use super::Context;

/// A dotted path into the context map, e.g. `a.b.c`. An empty path (no
/// segments) is a distinct "bare placeholder" value: resolving it always
/// succeeds truthy without looking anything up, matching the "empty path =
/// use parameter name" rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn new(expr: &str) -> Self {
        if expr.is_empty() {
            Path { segments: vec![] }
        } else {
            Path {
                segments: expr.split('.').map(|s| s.to_string()).collect(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn root(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }
}

/// A boolean combination of path lookups.
#[derive(Debug, Clone)]
pub enum PathExpr {
    Lookup(Path),
    And(Box<PathExpr>, Box<PathExpr>),
    Or(Box<PathExpr>, Box<PathExpr>),
}

impl PathExpr {
    pub fn path(expr: &str) -> Self {
        PathExpr::Lookup(Path::new(expr))
    }

    pub fn and(self, other: PathExpr) -> Self {
        PathExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: PathExpr) -> Self {
        PathExpr::Or(Box::new(self), Box::new(other))
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Turns a frozen message into the same JSON-object shape `Message::to_value`
/// produces, so a path rooted at it can navigate it like any other JSON
/// context value.
fn message_to_value(frozen: &crate::message::FrozenMessage) -> Value {
    Value::Object(frozen.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Resolves a dotted path, returning `None` on any missing hop (§4.1).
///
/// The arriving message is installed in context as an opaque service (see
/// `crate::engine::build_base_context`), not a `Json` value, so a path
/// rooted at it is special-cased here: rather than bailing out the moment
/// the root resolves to a `Service`, a message-shaped service is read
/// through to its fields (or, with no further segment, converted whole),
/// the same as any other path.
pub async fn resolve_path(ctx: &Context, path: &Path) -> Option<Value> {
    if path.is_empty() {
        // Present-empty-path is truthy-by-convention; represented as `true`
        // so callers combining it with AND/OR see it as present.
        return Some(Value::Bool(true));
    }
    let mut segments = path.segments.iter();
    let root = segments.next()?;
    let mut current = match ctx.get_value(root).await.ok()? {
        super::ContextValue::Json(v) => v,
        super::ContextValue::Service(s) => {
            let frozen = s.downcast_ref::<crate::message::FrozenMessage>()?;
            match segments.next() {
                Some(field) => frozen.get(field)?.clone(),
                None => message_to_value(frozen),
            }
        }
    };
    for segment in segments {
        current = current.get(segment)?.clone();
    }
    Some(current)
}

/// Evaluates an `AND`/`OR` combinator tree against `ctx`: the first operand
/// is resolved; on a factory-backed path this means actually calling it;
/// evaluation short-circuits on truthiness, mirroring Python `and`/`or`.
pub async fn resolve_expr(ctx: &Context, expr: &PathExpr) -> Option<Value> {
    match expr {
        PathExpr::Lookup(path) => resolve_path(ctx, path).await,
        PathExpr::And(a, b) => match resolve_expr_boxed(ctx, a).await {
            Some(v) if is_truthy(&v) => resolve_expr_boxed(ctx, b).await,
            other => other,
        },
        PathExpr::Or(a, b) => match resolve_expr_boxed(ctx, a).await {
            Some(v) if is_truthy(&v) => Some(v),
            _ => resolve_expr_boxed(ctx, b).await,
        },
    }
}

fn resolve_expr_boxed<'a>(
    ctx: &'a Context,
    expr: &'a PathExpr,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Value>> + 'a>> {
    Box::pin(resolve_expr(ctx, expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_hop_returns_none() {
        let ctx = Context::new();
        ctx.set_json("a", serde_json::json!({"b": 1}));
        let path = Path::new("a.c");
        assert_eq!(resolve_path(&ctx, &path).await, None);
    }

    #[tokio::test]
    async fn empty_path_is_truthy() {
        let ctx = Context::new();
        let path = Path::new("");
        assert!(path.is_empty());
        let v = resolve_path(&ctx, &path).await.unwrap();
        assert!(is_truthy(&v));
    }

    #[tokio::test]
    async fn or_short_circuits_on_first_truthy() {
        let ctx = Context::new();
        ctx.set_json("a", 0);
        ctx.set_json("b", 5);
        let expr = PathExpr::path("a").or(PathExpr::path("b"));
        let v = resolve_expr(&ctx, &expr).await.unwrap();
        assert_eq!(v, Value::from(5));
    }
}
