use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};

/// Legacy command ids kept alive for older IDE-side callers. Table-driven on
/// purpose; extend here, never pattern-match on id shapes.
pub const LEGACY_COMMAND_ALIASES: &[(&str, &str)] = &[
    ("extension.openDiff", "hostlink.openDiff"),
    ("extension.applyPatch", "hostlink.applyPatch"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    Value,
    /// The variant takes the full ordered argument list as a single value;
    /// per-parameter coercion is skipped entirely.
    ArgList,
}

type BlockingHandler = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;
type AsyncHandler = Arc<
    dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

enum HandlerFn {
    Blocking(BlockingHandler),
    Async(AsyncHandler),
}

/// One overload of a command: a static parameter shape plus the handler that
/// receives the coerced arguments.
pub struct CommandVariant {
    params: Vec<ParamKind>,
    handler: HandlerFn,
}

impl CommandVariant {
    pub fn blocking<F>(params: Vec<ParamKind>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            params,
            handler: HandlerFn::Blocking(Arc::new(handler)),
        }
    }

    pub fn asynchronous<F, Fut>(params: Vec<ParamKind>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            params,
            handler: HandlerFn::Async(Arc::new(move |args| Box::pin(handler(args)))),
        }
    }
}

struct CommandRegistration {
    method: String,
    variants: Vec<CommandVariant>,
}

/// String-keyed command table routing inbound RPC calls to IDE-side logic.
/// Commands are fire-and-forget at this layer: every failure is logged with
/// the command id and yields no result, so one bad call can never take down
/// the dispatcher or other in-flight commands.
pub struct CommandRegistry {
    entries: RwLock<HashMap<String, Arc<CommandRegistration>>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Last registration for an id wins; there is no duplicate detection.
    pub fn register(&self, id: &str, method: &str, variants: Vec<CommandVariant>) {
        let registration = Arc::new(CommandRegistration {
            method: method.to_string(),
            variants,
        });
        self.entries
            .write()
            .expect("command registry lock poisoned")
            .insert(id.to_string(), registration);
    }

    pub fn list(&self) -> BTreeSet<String> {
        self.entries
            .read()
            .expect("command registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn canonical_id(id: &str) -> &str {
        LEGACY_COMMAND_ALIASES
            .iter()
            .find(|(legacy, _)| *legacy == id)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(id)
    }

    pub async fn execute(&self, id: &str, args: Vec<Value>) -> Option<Value> {
        let canonical = Self::canonical_id(id);
        let registration = {
            let entries = self
                .entries
                .read()
                .expect("command registry lock poisoned");
            entries.get(canonical).cloned()
        };
        let Some(registration) = registration else {
            crate::event_log::log(
                "command_not_found",
                json!({"id": id, "canonical": canonical}),
            );
            eprintln!("[hostlink] no handler registered for command {canonical}");
            return None;
        };
        if registration.variants.is_empty() {
            eprintln!(
                "[hostlink] command {canonical} registered without variants (method {})",
                registration.method
            );
            return None;
        }

        let variant_index = match registration
            .variants
            .iter()
            .position(|variant| variant.params.len() == args.len())
        {
            Some(index) => index,
            None => {
                // Lenient by contract: with no arity match, the first variant
                // runs anyway. Logged so a mis-dispatch stays observable.
                crate::event_log::log(
                    "dispatch_arity_fallback",
                    json!({"id": canonical, "supplied": args.len()}),
                );
                0
            }
        };
        let variant = &registration.variants[variant_index];

        let coerced = if matches!(variant.params.as_slice(), [ParamKind::ArgList]) {
            vec![Value::Array(args)]
        } else {
            coerce_args(&variant.params, args)
        };

        let result = match &variant.handler {
            HandlerFn::Blocking(handler) => {
                let handler = handler.clone();
                match tokio::task::spawn_blocking(move || handler(coerced)).await {
                    Ok(result) => result,
                    Err(join_err) => Err(format!("handler panicked: {join_err}")),
                }
            }
            HandlerFn::Async(handler) => match tokio::spawn(handler(coerced)).await {
                Ok(result) => result,
                Err(join_err) => Err(format!("handler panicked: {join_err}")),
            },
        };

        match result {
            Ok(value) => Some(value),
            Err(message) => {
                crate::event_log::log(
                    "command_failed",
                    json!({"id": canonical, "error": message}),
                );
                eprintln!("[hostlink] command {canonical} failed: {message}");
                None
            }
        }
    }
}

fn coerce_args(params: &[ParamKind], args: Vec<Value>) -> Vec<Value> {
    let mut supplied = args.into_iter();
    let mut out = Vec::with_capacity(params.len());
    for kind in params {
        match supplied.next() {
            Some(value) => out.push(coerce_value(*kind, value)),
            // Missing trailing arguments: empty string for string params,
            // null otherwise. Numeric defaults are never fabricated.
            None => out.push(match kind {
                ParamKind::Str => Value::String(String::new()),
                _ => Value::Null,
            }),
        }
    }
    out
}

/// Fixed table of safe widenings; values with no applicable rule pass
/// through unchanged.
pub fn coerce_value(kind: ParamKind, value: Value) -> Value {
    match kind {
        ParamKind::Int => match value {
            Value::Number(num) => {
                if num.is_i64() || num.is_u64() {
                    return Value::Number(num);
                }
                match num.as_f64() {
                    Some(float) if float.is_finite() => json!(float.trunc() as i64),
                    _ => Value::Number(num),
                }
            }
            other => other,
        },
        ParamKind::Float => match value {
            Value::Number(num) => match num.as_i64() {
                Some(int) => json!(int as f64),
                None => Value::Number(num),
            },
            other => other,
        },
        ParamKind::Bool => match value {
            Value::Number(num) => match num.as_f64() {
                Some(float) => json!(float != 0.0),
                None => Value::Number(num),
            },
            other => other,
        },
        ParamKind::Str => match value {
            // Identifier-like objects arrive as {"value": "..."}; unwrap them.
            Value::Object(map) => match map.get("value") {
                Some(Value::String(inner)) => Value::String(inner.clone()),
                _ => Value::Object(map),
            },
            other => other,
        },
        ParamKind::Value | ParamKind::ArgList => value,
    }
}
