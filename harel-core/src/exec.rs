//! Executable content: `log`, `raise` and `assign`.

use crate::context::Context;
use crate::error::CoreError;
use crate::eval::{ErrorReporter, Evaluator};
use crate::event::Event;
use crate::expr::assign_path;
use crate::model::{Model, NodeId, NodeKind};
use crate::queue::InternalQueue;

/// Name of the internal event raised when executable content fails.
pub const ERROR_EXECUTION: &str = "error.execution";

/// Runs executable content blocks for one microstep.
///
/// Raised events only ever land in the internal queue, so nothing executed
/// here can affect the microstep in progress.
pub struct Executor<'a> {
    pub model: &'a Model,
    pub evaluator: &'a dyn Evaluator,
    pub reporter: &'a dyn ErrorReporter,
    pub context: &'a mut dyn Context,
    pub internal: &'a mut InternalQueue,
}

impl<'a> Executor<'a> {
    /// Runs every `onentry` block of a state.
    pub fn on_entry(&mut self, state: NodeId) {
        let blocks: Vec<NodeId> = self.model.onentry_blocks(state).collect();
        for block in blocks {
            self.run_block(block);
        }
    }

    /// Runs every `onexit` block of a state.
    pub fn on_exit(&mut self, state: NodeId) {
        let blocks: Vec<NodeId> = self.model.onexit_blocks(state).collect();
        for block in blocks {
            self.run_block(block);
        }
    }

    /// Runs the children of a transition, `onentry` or `onexit` node in
    /// document order. The first failure is reported, raises
    /// `error.execution` and abandons the rest of the block.
    pub fn run_block(&mut self, block: NodeId) {
        let model = self.model;
        for &child in model.node(block).children() {
            if let Err(err) = self.execute(child) {
                self.reporter.report(&err);
                self.internal.push(
                    Event::platform(ERROR_EXECUTION)
                        .with_data(serde_json::json!({ "message": err.to_string() })),
                );
                break;
            }
        }
    }

    fn execute(&mut self, node: NodeId) -> Result<(), CoreError> {
        let model = self.model;
        match model.kind(node) {
            NodeKind::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => Some(self.eval(expr)?),
                    None => None,
                };
                let label = label.as_deref().unwrap_or("");
                match value {
                    Some(value) => tracing::info!(label, "{}", value),
                    None => tracing::info!(label, ""),
                }
            }
            NodeKind::Raise { event } => {
                tracing::trace!(event = %event, "internal event raised");
                self.internal.push(Event::internal(event.clone()));
            }
            NodeKind::Assign { location, expr } => {
                let value = self.eval(expr)?;
                assign_path(&mut *self.context, location, value).map_err(|e| {
                    CoreError::Evaluation {
                        expr: location.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<serde_json::Value, CoreError> {
        self.evaluator
            .evaluate(&*self.context, expr)
            .map_err(|e| match e {
                CoreError::Evaluation { .. } => e,
                other => CoreError::Evaluation {
                    expr: expr.to_string(),
                    reason: other.to_string(),
                },
            })
    }
}
