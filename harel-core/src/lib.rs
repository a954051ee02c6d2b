//! # harel-core
//!
//! Statechart interpreter for harel.
//!
//! This crate provides:
//! - The node tree ([`Model`]) with containment rules and validation
//! - Chart documents in JSON or YAML ([`Document`])
//! - The active-state set ([`Configuration`]), transition selection and
//!   preemption
//! - Internal and external event queues
//! - The macrostep/microstep engine ([`Engine`])
//! - A pluggable expression evaluator and variable context

pub mod configuration;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod eval;
pub mod event;
pub mod exec;
pub mod expr;
pub mod model;
pub mod queue;

pub use configuration::Configuration;
pub use context::{Context, JsonContext};
pub use document::{Document, DocumentRaw};
pub use engine::{Engine, EngineConfig, EngineState, EngineStats, StepOutcome};
pub use error::CoreError;
pub use eval::{CollectingReporter, CtxEvaluator, ErrorReporter, Evaluator, TracingReporter};
pub use event::{Event, EventDescriptor, EventKind};
pub use expr::Expr;
pub use model::{Model, Node, NodeDecl, NodeId, NodeKind, Transition, TransitionType};
pub use queue::{ExternalQueue, InternalQueue};
