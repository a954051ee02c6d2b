//! Evaluation hooks: the pluggable expression evaluator and the
//! error-reporting collaborator.

use crate::context::Context;
use crate::error::CoreError;
use crate::expr::{is_truthy, Expr};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Evaluates guard and value expressions against a context.
pub trait Evaluator: Send + Sync {
    /// Evaluates an expression to a value.
    fn evaluate(&self, context: &dyn Context, expr: &str) -> Result<Value, CoreError>;

    /// Evaluates a guard; the default is the truthiness of [`Evaluator::evaluate`].
    fn evaluate_condition(&self, context: &dyn Context, expr: &str) -> Result<bool, CoreError> {
        self.evaluate(context, expr).map(|v| is_truthy(&v))
    }
}

/// Default evaluator for the `ctx.` expression language, with a cache of
/// parsed expressions.
#[derive(Debug, Default)]
pub struct CtxEvaluator {
    cache: RwLock<HashMap<String, Arc<Expr>>>,
}

impl CtxEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an expression, reusing an earlier parse of the same text.
    pub fn compile(&self, expr: &str) -> Result<Arc<Expr>, CoreError> {
        if let Some(parsed) = self.cache.read().get(expr) {
            return Ok(parsed.clone());
        }
        let parsed = Arc::new(Expr::parse(expr)?);
        self.cache
            .write()
            .insert(expr.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Number of distinct expressions parsed so far.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

impl Evaluator for CtxEvaluator {
    fn evaluate(&self, context: &dyn Context, expr: &str) -> Result<Value, CoreError> {
        self.compile(expr)?.eval(context)
    }
}

/// Receives non-fatal errors raised while the engine runs.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &CoreError);
}

/// Reports through `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &CoreError) {
        tracing::warn!(code = error.error_code(), "{}", error);
    }
}

/// Keeps reported errors in memory; handy for hosts that poll and for tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    errors: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages reported so far.
    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &CoreError) {
        self.errors.lock().push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonContext;
    use serde_json::json;

    #[test]
    fn test_condition_truthiness() {
        let evaluator = CtxEvaluator::new();
        let ctx = JsonContext::from_value(json!({"ok": true, "n": 0}));

        assert!(evaluator.evaluate_condition(&ctx, "ctx.ok").unwrap());
        assert!(!evaluator.evaluate_condition(&ctx, "ctx.n").unwrap());
        assert!(evaluator.evaluate_condition(&ctx, "ctx.n == 0").unwrap());
    }

    #[test]
    fn test_compile_is_cached() {
        let evaluator = CtxEvaluator::new();
        let ctx = JsonContext::new();
        evaluator.evaluate(&ctx, "ctx.a || ctx.b").unwrap();
        evaluator.evaluate(&ctx, "ctx.a || ctx.b").unwrap();
        evaluator.evaluate(&ctx, "1").unwrap();
        assert_eq!(evaluator.cached(), 2);
    }

    #[test]
    fn test_parse_errors_are_not_cached() {
        let evaluator = CtxEvaluator::new();
        let ctx = JsonContext::new();
        assert!(matches!(
            evaluator.evaluate(&ctx, "ctx.a &&"),
            Err(CoreError::InvalidExpression { .. })
        ));
        assert_eq!(evaluator.cached(), 0);
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::new();
        let handle = reporter.clone();
        reporter.report(&CoreError::QueueClosed);
        assert_eq!(handle.messages(), vec!["external event queue is closed"]);
    }
}
