//! Step engine - runs macrosteps and microsteps over a validated model.
//!
//! The engine is an explicit state machine. Each call to [`Engine::step`]
//! performs exactly one transition of the run loop:
//!
//! ```text
//! Stopped -> Stabilizing -> WaitingForExternalEvent -> ProcessingExternalEvent
//!                 ^                                              |
//!                 +----------------------------------------------+
//! ```
//!
//! While stabilizing, each step runs one microstep for the eventless
//! pseudo-event or, if no eventless transition is enabled, for the next
//! internal event. Stabilization ends when neither yields work. Events raised
//! by executable content always go to the internal queue, so they are seen
//! by later microsteps only.

use crate::configuration::Configuration;
use crate::context::{Context, JsonContext};
use crate::error::CoreError;
use crate::eval::{CtxEvaluator, ErrorReporter, Evaluator, TracingReporter};
use crate::event::Event;
use crate::exec::Executor;
use crate::model::{Model, NodeId};
use crate::queue::{ExternalQueue, InternalQueue};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Name of the context variable bound to the current event.
pub const EVENT_VARIABLE: &str = "_event";

/// Run-loop state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Stabilizing,
    WaitingForExternalEvent,
    ProcessingExternalEvent,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Stabilizing => "stabilizing",
            EngineState::WaitingForExternalEvent => "waiting for an external event",
            EngineState::ProcessingExternalEvent => "processing an external event",
        };
        f.write_str(name)
    }
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on microsteps in a single stabilization.
    pub max_microsteps: usize,
    /// Bind the current event as `_event` before selecting transitions.
    pub expose_event: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_microsteps: 10_000,
            expose_event: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_microsteps(mut self, max: usize) -> Self {
        self.max_microsteps = max;
        self
    }

    pub fn with_expose_event(mut self, expose: bool) -> Self {
        self.expose_event = expose;
        self
    }
}

/// Counters kept across the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Microsteps that executed at least one transition.
    pub microsteps: u64,
    /// External events consumed.
    pub macrosteps: u64,
    /// Internal events consumed.
    pub internal_events: u64,
    /// Configurations published, including the initial one.
    pub configurations: u64,
}

/// What a single [`Engine::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A microstep ran; `event` is `None` for the eventless pseudo-event.
    Microstep {
        event: Option<String>,
        transitions: usize,
    },
    /// Stabilization finished; the engine now waits for external events.
    Settled,
    /// An external event was taken off the queue.
    Dequeued(String),
    /// Waiting, and the external queue is empty.
    Idle,
    /// The chart reached a top-level final state.
    Halted,
    /// The engine is not running.
    Stopped,
}

/// Interprets a model: owns the published configuration, the internal
/// queue and the evaluation collaborators.
pub struct Engine {
    model: Arc<Model>,
    config: EngineConfig,
    state: EngineState,
    configuration: Arc<Configuration>,
    internal: InternalQueue,
    external: ExternalQueue,
    current: Option<Event>,
    evaluator: Arc<dyn Evaluator>,
    reporter: Arc<dyn ErrorReporter>,
    context: Box<dyn Context>,
    stats: EngineStats,
    stabilization_steps: usize,
    halted: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("configuration", &self.configuration.ids())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Engine {
    /// Creates a stopped engine; the model is validated first.
    pub fn new(model: Model) -> Result<Self, CoreError> {
        Self::from_arc(Arc::new(model))
    }

    /// Creates a stopped engine over a shared model.
    pub fn from_arc(model: Arc<Model>) -> Result<Self, CoreError> {
        model.validate()?;
        let external = ExternalQueue::new();
        external.close();
        Ok(Self {
            configuration: Arc::new(Configuration::new(model.clone())),
            model,
            config: EngineConfig::default(),
            state: EngineState::Stopped,
            internal: InternalQueue::new(),
            external,
            current: None,
            evaluator: Arc::new(CtxEvaluator::new()),
            reporter: Arc::new(TracingReporter),
            context: Box::new(JsonContext::new()),
            stats: EngineStats::default(),
            stabilization_steps: 0,
            halted: false,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_context(mut self, context: impl Context + 'static) -> Self {
        self.context = Box::new(context);
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != EngineState::Stopped
    }

    /// Returns true once the chart has reached a top-level final state.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn context(&self) -> &dyn Context {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> &mut dyn Context {
        self.context.as_mut()
    }

    /// A producer handle for the external queue, usable from other threads.
    /// The queue only accepts events while the engine is running.
    pub fn external_queue(&self) -> ExternalQueue {
        self.external.clone()
    }

    /// The last published configuration.
    pub fn get_configuration(&self) -> Arc<Configuration> {
        self.configuration.clone()
    }

    /// Enters the initial configuration, running `onentry` content, and
    /// stabilizes.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.state != EngineState::Stopped {
            return Err(self.state_error("start"));
        }

        self.internal.clear();
        self.external.reopen();
        self.current = None;
        self.halted = false;
        self.stabilization_steps = 0;

        let initial = Configuration::initial(self.model.clone())?;
        let empty = Configuration::new(self.model.clone());
        let entered: Vec<NodeId> = initial.states().iter().copied().collect();
        let next = {
            let mut exec = Executor {
                model: self.model.as_ref(),
                evaluator: self.evaluator.as_ref(),
                reporter: self.reporter.as_ref(),
                context: self.context.as_mut(),
                internal: &mut self.internal,
            };
            empty.enter_states(initial.states(), |s| exec.on_entry(s))
        };
        next.is_valid()?;
        self.publish(next);
        self.raise_done_events(&entered);

        tracing::info!(
            configuration = %self.configuration,
            "engine started"
        );

        if self.halted {
            self.halt();
            return Ok(());
        }
        self.state = EngineState::Stabilizing;
        self.stabilize()?;
        Ok(())
    }

    /// Stops the engine at the next macrostep boundary: any stabilization
    /// in progress is finished first.
    pub fn stop(&mut self) -> Result<(), CoreError> {
        if self.state == EngineState::Stopped {
            return Err(self.state_error("stop"));
        }
        if self.state == EngineState::ProcessingExternalEvent {
            self.step()?;
        }
        if self.state == EngineState::Stabilizing {
            self.stabilize()?;
        }
        if self.state != EngineState::Stopped {
            self.shutdown("stop requested");
        }
        Ok(())
    }

    /// Queues an external event.
    pub fn inject_external_event(&self, event: Event) -> Result<(), CoreError> {
        if self.state == EngineState::Stopped {
            return Err(self.state_error("inject event"));
        }
        self.external.push(event)
    }

    /// Performs one transition of the run loop without blocking.
    pub fn step(&mut self) -> Result<StepOutcome, CoreError> {
        match self.state {
            EngineState::Stopped => Ok(StepOutcome::Stopped),
            EngineState::Stabilizing => self.stabilize_once(),
            EngineState::WaitingForExternalEvent => {
                if self.external.is_closed() {
                    self.shutdown("external queue closed");
                    return Ok(StepOutcome::Stopped);
                }
                match self.external.pop() {
                    Some(event) => Ok(self.accept(event)),
                    None => Ok(StepOutcome::Idle),
                }
            }
            EngineState::ProcessingExternalEvent => {
                let Some(event) = self.current.take() else {
                    self.state = EngineState::WaitingForExternalEvent;
                    return Ok(StepOutcome::Idle);
                };
                self.stats.macrosteps += 1;
                let transitions = self.guarded_microstep(Some(&event))?;
                if self.halted {
                    self.halt();
                    return Ok(StepOutcome::Halted);
                }
                self.stabilization_steps = 0;
                self.state = if transitions > 0 {
                    EngineState::Stabilizing
                } else {
                    EngineState::WaitingForExternalEvent
                };
                Ok(StepOutcome::Microstep {
                    event: Some(event.name().to_string()),
                    transitions,
                })
            }
        }
    }

    /// Runs microsteps until the configuration is stable. Returns the number
    /// of microsteps that executed transitions.
    pub fn stabilize(&mut self) -> Result<usize, CoreError> {
        let mut executed = 0;
        while self.state == EngineState::Stabilizing {
            if let StepOutcome::Microstep { transitions, .. } = self.step()? {
                if transitions > 0 {
                    executed += 1;
                }
            }
        }
        Ok(executed)
    }

    /// Processes one queued external event, including the stabilization it
    /// triggers. Returns false if no event was waiting.
    pub fn process_next_external(&mut self) -> Result<bool, CoreError> {
        if self.state != EngineState::WaitingForExternalEvent {
            return Err(self.state_error("process an external event"));
        }
        match self.step()? {
            StepOutcome::Dequeued(_) => {}
            _ => return Ok(false),
        }
        self.step()?;
        self.stabilize()?;
        Ok(true)
    }

    /// Blocks on the external queue, processing events until the queue is
    /// closed or the chart halts.
    pub fn run(&mut self) -> Result<(), CoreError> {
        self.run_with(|_| {})
    }

    /// Like [`Engine::run`], calling `observer` with every configuration
    /// published after a macrostep.
    pub fn run_with<F>(&mut self, mut observer: F) -> Result<(), CoreError>
    where
        F: FnMut(&Arc<Configuration>),
    {
        if self.state == EngineState::Stopped {
            return Err(self.state_error("run"));
        }
        let mut last = self.configuration.clone();
        loop {
            match self.state {
                EngineState::Stopped => break,
                EngineState::Stabilizing => {
                    self.stabilize()?;
                }
                EngineState::WaitingForExternalEvent => {
                    if !Arc::ptr_eq(&last, &self.configuration) {
                        last = self.configuration.clone();
                        observer(&last);
                    }
                    match self.external.wait() {
                        Some(event) => {
                            self.accept(event);
                        }
                        None => self.shutdown("external queue closed"),
                    }
                }
                EngineState::ProcessingExternalEvent => {
                    self.step()?;
                }
            }
        }
        if !Arc::ptr_eq(&last, &self.configuration) {
            observer(&self.configuration);
        }
        Ok(())
    }

    fn accept(&mut self, event: Event) -> StepOutcome {
        tracing::debug!(event = event.name(), "external event dequeued");
        let name = event.name().to_string();
        self.current = Some(event);
        self.state = EngineState::ProcessingExternalEvent;
        StepOutcome::Dequeued(name)
    }

    fn stabilize_once(&mut self) -> Result<StepOutcome, CoreError> {
        let transitions = self.guarded_microstep(None)?;
        if transitions > 0 {
            return self.after_stabilizing_microstep(None, transitions);
        }

        if let Some(event) = self.internal.pop() {
            self.stats.internal_events += 1;
            let transitions = self.guarded_microstep(Some(&event))?;
            return self.after_stabilizing_microstep(Some(event.name().to_string()), transitions);
        }

        self.state = EngineState::WaitingForExternalEvent;
        tracing::debug!(
            configuration = %self.configuration,
            "configuration stable"
        );
        Ok(StepOutcome::Settled)
    }

    fn after_stabilizing_microstep(
        &mut self,
        event: Option<String>,
        transitions: usize,
    ) -> Result<StepOutcome, CoreError> {
        if self.halted {
            self.halt();
            return Ok(StepOutcome::Halted);
        }
        if transitions > 0 {
            self.stabilization_steps += 1;
            if self.stabilization_steps > self.config.max_microsteps {
                let limit = self.config.max_microsteps;
                self.shutdown("stabilization limit exceeded");
                return Err(CoreError::StabilizationLimit { limit });
            }
        }
        Ok(StepOutcome::Microstep { event, transitions })
    }

    /// Runs a microstep; a fatal failure stops the engine and leaves the
    /// last published configuration in place.
    fn guarded_microstep(&mut self, event: Option<&Event>) -> Result<usize, CoreError> {
        match self.microstep(event) {
            Ok(n) => Ok(n),
            Err(err) => {
                tracing::error!(code = err.error_code(), "microstep failed: {}", err);
                self.shutdown("microstep failed");
                Err(err)
            }
        }
    }

    fn microstep(&mut self, event: Option<&Event>) -> Result<usize, CoreError> {
        if let (Some(event), true) = (event, self.config.expose_event) {
            self.context.set(EVENT_VARIABLE, event.to_value());
        }

        let current = self.configuration.clone();
        let transitions = current.select_transitions(
            event,
            self.evaluator.as_ref(),
            self.context.as_ref(),
            self.reporter.as_ref(),
        );
        if transitions.is_empty() {
            return Ok(0);
        }

        let exits = current.exit_set(&transitions);
        let entries = current.entry_set(&transitions);
        let entered: Vec<NodeId> = entries.iter().copied().collect();

        let next = {
            let model = self.model.as_ref();
            let mut exec = Executor {
                model,
                evaluator: self.evaluator.as_ref(),
                reporter: self.reporter.as_ref(),
                context: self.context.as_mut(),
                internal: &mut self.internal,
            };
            let after_exit = current.exit_states(&exits, |s| exec.on_exit(s));
            for &t in &transitions {
                exec.run_block(t);
            }
            after_exit.enter_states(&entries, |s| exec.on_entry(s))
        };
        next.is_valid()?;

        tracing::debug!(
            event = event.map(Event::name).unwrap_or("<eventless>"),
            transitions = transitions.len(),
            exited = ?labels(&self.model, &exits),
            entered = ?labels(&self.model, &entries),
            "microstep"
        );

        self.stats.microsteps += 1;
        self.publish(next);
        self.raise_done_events(&entered);
        Ok(transitions.len())
    }

    fn publish(&mut self, next: Configuration) {
        self.configuration = Arc::new(next);
        self.stats.configurations += 1;
    }

    /// Raises `done.state.*` events for final states just entered and marks
    /// the engine halted when a top-level final state became active.
    fn raise_done_events(&mut self, entered: &[NodeId]) {
        let model = self.model.clone();
        let config = self.configuration.clone();
        let mut completed = BTreeSet::new();

        for &state in entered {
            if !model.is_final(state) || !config.contains(state) {
                continue;
            }
            let Some(parent) = model.parent(state) else {
                continue;
            };
            if model.is_root(parent) {
                self.halted = true;
                continue;
            }
            self.internal
                .push(Event::platform(format!("done.state.{}", model.label(parent))));

            if let Some(grandparent) = model.parent(parent) {
                if model.is_parallel(grandparent)
                    && model
                        .target_children(grandparent)
                        .all(|region| in_final_state(&model, &config, region))
                {
                    completed.insert(grandparent);
                }
            }
        }

        // Several regions can finish in one microstep; the parallel completes once.
        for parallel in completed {
            self.internal
                .push(Event::platform(format!("done.state.{}", model.label(parallel))));
        }
    }

    fn halt(&mut self) {
        self.shutdown("top-level final state reached");
    }

    fn shutdown(&mut self, reason: &str) {
        self.state = EngineState::Stopped;
        self.internal.clear();
        self.external.close();
        self.current = None;
        tracing::info!(
            reason,
            configuration = %self.configuration,
            stats = ?self.stats,
            "engine stopped"
        );
    }

    fn state_error(&self, operation: &'static str) -> CoreError {
        CoreError::EngineState {
            operation,
            state: self.state.to_string(),
        }
    }
}

/// A compound state is in a final state when its active child is final; a
/// parallel state when every region is.
fn in_final_state(model: &Model, config: &Configuration, state: NodeId) -> bool {
    if model.is_parallel(state) {
        return model
            .target_children(state)
            .all(|region| in_final_state(model, config, region));
    }
    model
        .target_children(state)
        .any(|child| config.contains(child) && model.is_final(child))
}

fn labels(model: &Model, states: &BTreeSet<NodeId>) -> Vec<String> {
    states.iter().map(|s| model.label(*s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::eval::CollectingReporter;
    use proptest::prelude::*;
    use serde_json::json;
    use std::thread;

    fn engine_for(doc: serde_json::Value) -> Engine {
        let model = Document::from_json(&doc).unwrap().build().unwrap();
        Engine::new(model).unwrap()
    }

    fn active(engine: &Engine) -> Vec<String> {
        engine.get_configuration().ids()
    }

    fn chain_document(n: usize) -> serde_json::Value {
        let states: Vec<serde_json::Value> = (0..=n)
            .map(|i| {
                if i < n {
                    json!({"id": format!("s{}", i), "transitions": [{"target": format!("s{}", i + 1)}]})
                } else {
                    json!({"id": format!("s{}", i)})
                }
            })
            .collect();
        json!({ "states": states })
    }

    fn traffic_document() -> serde_json::Value {
        json!({
            "name": "traffic",
            "states": [
                {
                    "id": "operating",
                    "onentry": [{"assign": {"location": "ctx.cycles", "expr": "0"}}],
                    "transitions": [{"event": "power.off", "target": "off"}],
                    "states": [
                        {"id": "red", "transitions": [{"event": "tick", "target": "green"}]},
                        {"id": "green", "transitions": [{"event": "tick", "target": "yellow"}]},
                        {"id": "yellow",
                         "onexit": [{"raise": {"event": "cycled"}}],
                         "transitions": [{"event": "tick", "target": "red"}]}
                    ]
                },
                {"id": "off"}
            ]
        })
    }

    #[test]
    fn test_start_enters_initial_configuration() {
        let mut engine = engine_for(traffic_document());
        assert!(!engine.is_running());
        assert!(engine.get_configuration().is_empty());

        engine.start().unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.state(), EngineState::WaitingForExternalEvent);
        assert_eq!(active(&engine), vec!["operating", "red"]);
        assert_eq!(engine.context().get("cycles"), Some(json!(0.0)));
    }

    #[test]
    fn test_chain_stabilizes_in_exactly_n_microsteps() {
        for n in [1, 3, 7] {
            let mut engine = engine_for(chain_document(n));
            engine.start().unwrap();
            assert_eq!(engine.stats().microsteps, n as u64);
            assert_eq!(active(&engine), vec![format!("s{}", n)]);
            assert_eq!(engine.state(), EngineState::WaitingForExternalEvent);
        }
    }

    #[test]
    fn test_step_driven_stabilization() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "transitions": [{"target": "c"}]},
                {"id": "c"}
            ]
        }));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();

        assert_eq!(engine.step().unwrap(), StepOutcome::Dequeued("go".to_string()));
        assert_eq!(engine.state(), EngineState::ProcessingExternalEvent);
        assert_eq!(
            engine.step().unwrap(),
            StepOutcome::Microstep {
                event: Some("go".to_string()),
                transitions: 1
            }
        );
        assert_eq!(active(&engine), vec!["b"]);
        assert_eq!(engine.state(), EngineState::Stabilizing);
        assert_eq!(
            engine.step().unwrap(),
            StepOutcome::Microstep {
                event: None,
                transitions: 1
            }
        );
        assert_eq!(engine.step().unwrap(), StepOutcome::Settled);
        assert_eq!(engine.step().unwrap(), StepOutcome::Idle);
        assert_eq!(active(&engine), vec!["c"]);
    }

    #[test]
    fn test_macrostep_with_internal_cascade() {
        let mut engine = engine_for(traffic_document());
        engine.start().unwrap();

        for _ in 0..3 {
            engine.inject_external_event(Event::new("tick")).unwrap();
        }
        assert!(engine.process_next_external().unwrap());
        assert_eq!(active(&engine), vec!["operating", "green"]);
        assert!(engine.process_next_external().unwrap());
        assert!(engine.process_next_external().unwrap());
        assert_eq!(active(&engine), vec!["operating", "red"]);
        assert!(!engine.process_next_external().unwrap());

        let stats = engine.stats();
        assert_eq!(stats.macrosteps, 3);
        assert_eq!(stats.microsteps, 3);
        // `cycled` was raised on exit from yellow and consumed with no effect.
        assert_eq!(stats.internal_events, 1);
    }

    #[test]
    fn test_unmatched_event_is_consumed() {
        let mut engine = engine_for(traffic_document());
        engine.start().unwrap();
        let before = engine.get_configuration();

        engine.inject_external_event(Event::new("honk")).unwrap();
        assert!(engine.process_next_external().unwrap());
        assert!(Arc::ptr_eq(&before, &engine.get_configuration()));
        assert_eq!(engine.stats().macrosteps, 1);
        assert_eq!(engine.external_queue().len(), 0);
    }

    #[test]
    fn test_entry_and_exit_order() {
        let mut engine = engine_for(json!({
            "states": [
                {
                    "id": "outer",
                    "onexit": [{"assign": {"location": "ctx.last_exit", "expr": "\"outer\""}}],
                    "transitions": [{"event": "leave", "target": "other",
                                     "actions": [{"assign": {"location": "ctx.during", "expr": "ctx.last_exit"}}]}],
                    "states": [
                        {"id": "inner",
                         "onexit": [{"assign": {"location": "ctx.last_exit", "expr": "\"inner\""}}]}
                    ]
                },
                {
                    "id": "other",
                    "onentry": [{"assign": {"location": "ctx.last_entry", "expr": "\"other\""}}],
                    "states": [
                        {"id": "leaf",
                         "onentry": [{"assign": {"location": "ctx.last_entry", "expr": "\"leaf\""}}]}
                    ]
                }
            ]
        }));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("leave")).unwrap();
        engine.process_next_external().unwrap();

        let ctx = engine.context();
        // Innermost exited first, outermost entered first, transition content between.
        assert_eq!(ctx.get("last_exit"), Some(json!("outer")));
        assert_eq!(ctx.get("during"), Some(json!("outer")));
        assert_eq!(ctx.get("last_entry"), Some(json!("leaf")));
        assert_eq!(active(&engine), vec!["other", "leaf"]);
    }

    #[test]
    fn test_raised_events_wait_for_later_microstep() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b", "actions": [{"raise": {"event": "next"}}]},
                    {"event": "next", "target": "wrong"}
                ]},
                {"id": "b", "transitions": [{"event": "next", "target": "c"}]},
                {"id": "c"},
                {"id": "wrong"}
            ]
        }));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["c"]);
    }

    #[test]
    fn test_internal_transition_keeps_source_active() {
        let mut engine = engine_for(json!({
            "states": [
                {
                    "id": "s",
                    "onentry": [{"assign": {"location": "ctx.entries", "expr": "ctx.entries == null"}}],
                    "transitions": [
                        {"event": "in", "target": "b", "type": "internal"},
                        {"event": "out", "target": "b"}
                    ],
                    "states": [{"id": "a"}, {"id": "b"}]
                }
            ]
        }));
        engine.start().unwrap();
        assert_eq!(engine.context().get("entries"), Some(json!(true)));

        engine.inject_external_event(Event::new("in")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["s", "b"]);
        // `s` was not re-entered.
        assert_eq!(engine.context().get("entries"), Some(json!(true)));

        engine.inject_external_event(Event::new("out")).unwrap();
        engine.process_next_external().unwrap();
        // External transition re-entered `s`; the assignment sees a non-null value.
        assert_eq!(engine.context().get("entries"), Some(json!(false)));
    }

    #[test]
    fn test_parallel_regions_fire_together() {
        let mut engine = engine_for(json!({
            "states": [
                {
                    "id": "p", "type": "parallel",
                    "states": [
                        {"id": "r1", "states": [
                            {"id": "a1", "transitions": [{"event": "go", "target": "a2"}]},
                            {"id": "a2"}
                        ]},
                        {"id": "r2", "states": [
                            {"id": "b1", "transitions": [{"event": "go", "target": "b2"}]},
                            {"id": "b2"}
                        ]}
                    ]
                }
            ]
        }));
        engine.start().unwrap();
        assert_eq!(active(&engine), vec!["p", "r1", "a1", "r2", "b1"]);

        engine.inject_external_event(Event::new("go")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["p", "r1", "a2", "r2", "b2"]);
        assert_eq!(engine.stats().microsteps, 1);
    }

    #[test]
    fn test_done_events_and_halt() {
        let mut engine = engine_for(json!({
            "states": [
                {
                    "id": "job",
                    "transitions": [{"event": "done.state.job", "target": "finished"}],
                    "states": [
                        {"id": "p", "type": "parallel",
                         "transitions": [{"event": "done.state.p", "target": "wrapup"}],
                         "states": [
                            {"id": "r1", "states": [
                                {"id": "w1", "transitions": [{"event": "ok1", "target": "f1"}]},
                                {"id": "f1", "type": "final"}
                            ]},
                            {"id": "r2", "states": [
                                {"id": "w2", "transitions": [{"event": "ok2", "target": "f2"}]},
                                {"id": "f2", "type": "final"}
                            ]}
                         ]},
                        {"id": "wrapup", "transitions": [{"target": "end"}]},
                        {"id": "end", "type": "final"}
                    ]
                },
                {"id": "finished", "type": "final"}
            ]
        }));
        engine.start().unwrap();

        engine.inject_external_event(Event::new("ok1")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["job", "p", "r1", "f1", "r2", "w2"]);

        engine.inject_external_event(Event::new("ok2")).unwrap();
        engine.process_next_external().unwrap();

        assert!(engine.is_halted());
        assert!(!engine.is_running());
        assert_eq!(active(&engine), vec!["finished"]);
        assert!(matches!(
            engine.inject_external_event(Event::new("late")),
            Err(CoreError::EngineState { .. })
        ));
    }

    #[test]
    fn test_event_is_exposed_to_guards() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "idle", "transitions": [
                    {"event": "order", "cond": "ctx._event.data.amount > 100", "target": "review"},
                    {"event": "order", "target": "accepted"}
                ]},
                {"id": "review"},
                {"id": "accepted"}
            ]
        }));
        engine.start().unwrap();
        engine
            .inject_external_event(Event::new("order").with_data(json!({"amount": 250})))
            .unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["review"]);
        assert_eq!(
            engine.context().get(EVENT_VARIABLE),
            Some(json!({"name": "order", "type": "external", "data": {"amount": 250}}))
        );
    }

    #[test]
    fn test_guard_error_is_reported_and_skipped() {
        let reporter = CollectingReporter::new();
        let model = Document::from_json(&json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "ctx.n > \"x\"", "target": "b"},
                    {"event": "go", "target": "c"}
                ]},
                {"id": "b"},
                {"id": "c"}
            ]
        }))
        .unwrap()
        .build()
        .unwrap();
        let mut engine = Engine::new(model)
            .unwrap()
            .with_reporter(Arc::new(reporter.clone()))
            .with_context(JsonContext::from_value(json!({"n": 1})));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();
        engine.process_next_external().unwrap();

        assert_eq!(active(&engine), vec!["c"]);
        assert_eq!(reporter.messages().len(), 1);
        assert!(engine.is_running());
    }

    #[test]
    fn test_execution_error_raises_error_event() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b", "actions": [{"assign": {"location": "x", "expr": "ctx.y <"}}]}
                ]},
                {"id": "b", "transitions": [{"event": "error.execution", "target": "failed"}]},
                {"id": "failed"}
            ]
        }))
        .with_reporter(Arc::new(CollectingReporter::new()));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["failed"]);
    }

    #[test]
    fn test_stabilization_limit_stops_engine() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [{"target": "b"}]},
                {"id": "b", "transitions": [{"target": "a"}]}
            ]
        }))
        .with_config(EngineConfig::default().with_max_microsteps(50));

        let err = engine.start().unwrap_err();
        assert!(matches!(err, CoreError::StabilizationLimit { limit: 50 }));
        assert!(!engine.is_running());
        assert!(engine.get_configuration().is_legal());
    }

    #[test]
    fn test_engine_state_errors() {
        let mut engine = engine_for(traffic_document());
        assert!(matches!(
            engine.inject_external_event(Event::new("tick")),
            Err(CoreError::EngineState { operation: "inject event", .. })
        ));
        assert!(engine.stop().is_err());
        assert!(engine.run().is_err());

        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop().unwrap();
        assert!(!engine.is_running());
        // The last configuration stays readable after stopping.
        assert_eq!(active(&engine), vec!["operating", "red"]);

        // Restarting re-enters the initial configuration.
        engine.start().unwrap();
        assert_eq!(active(&engine), vec!["operating", "red"]);
    }

    #[test]
    fn test_new_rejects_invalid_model() {
        let mut model = Model::new();
        model.add_node(crate::model::NodeDecl::scxml(), None).unwrap();
        assert!(matches!(
            Engine::new(model),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_run_with_producer_thread() {
        let mut engine = engine_for(traffic_document());
        engine.start().unwrap();
        let queue = engine.external_queue();
        let closer = engine.external_queue();

        let producer = thread::spawn(move || {
            for _ in 0..4 {
                queue.push(Event::new("tick")).unwrap();
            }
            queue.push(Event::new("power.off")).unwrap();
        });

        let mut seen = Vec::new();
        engine
            .run_with(|config| {
                seen.push(config.ids());
                if config.is_active("off") {
                    closer.close();
                }
            })
            .unwrap();
        producer.join().unwrap();

        assert!(!engine.is_running());
        assert_eq!(seen.last().unwrap(), &vec!["off".to_string()]);
        assert_eq!(engine.stats().macrosteps, 5);
    }

    #[test]
    fn test_queue_rejects_events_while_stopped() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b"}
            ]
        }));
        let handle = engine.external_queue();
        assert!(matches!(
            handle.push(Event::new("go")),
            Err(CoreError::QueueClosed)
        ));

        engine.start().unwrap();
        engine.stop().unwrap();
        assert!(matches!(
            handle.push(Event::new("go")),
            Err(CoreError::QueueClosed)
        ));
        assert!(matches!(
            engine.inject_external_event(Event::new("go")),
            Err(CoreError::EngineState { .. })
        ));

        // Nothing from the stopped session carries over.
        engine.start().unwrap();
        assert!(!engine.process_next_external().unwrap());
        assert_eq!(active(&engine), vec!["a"]);

        handle.push(Event::new("go")).unwrap();
        assert!(engine.process_next_external().unwrap());
        assert_eq!(active(&engine), vec!["b"]);
    }

    #[test]
    fn test_parallel_completion_raised_once() {
        let mut engine = engine_for(json!({
            "states": [{
                "id": "p", "type": "parallel",
                "states": [
                    {"id": "r1", "states": [
                        {"id": "w1", "transitions": [{"event": "go", "target": "f1"}]},
                        {"id": "f1", "type": "final"}
                    ]},
                    {"id": "r2", "states": [
                        {"id": "w2", "transitions": [{"event": "go", "target": "f2"}]},
                        {"id": "f2", "type": "final"}
                    ]}
                ]
            }]
        }));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();
        assert_eq!(engine.step().unwrap(), StepOutcome::Dequeued("go".to_string()));
        assert_eq!(
            engine.step().unwrap(),
            StepOutcome::Microstep {
                event: Some("go".to_string()),
                transitions: 2
            }
        );

        let mut raised = Vec::new();
        while let Some(event) = engine.internal.pop() {
            raised.push(event.name().to_string());
        }
        assert_eq!(
            raised,
            vec!["done.state.r1", "done.state.r2", "done.state.p"]
        );
    }

    #[test]
    fn test_stop_finishes_event_in_flight() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "transitions": [{"target": "c"}]},
                {"id": "c"}
            ]
        }));
        engine.start().unwrap();
        engine.inject_external_event(Event::new("go")).unwrap();
        assert_eq!(engine.step().unwrap(), StepOutcome::Dequeued("go".to_string()));
        assert_eq!(engine.state(), EngineState::ProcessingExternalEvent);

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        // The external microstep and its eventless follow-up both completed.
        assert_eq!(active(&engine), vec!["c"]);
        assert_eq!(engine.stats().microsteps, 2);
        assert_eq!(engine.stats().macrosteps, 1);
        assert!(engine.get_configuration().is_legal());
    }

    #[test]
    fn test_multi_target_enters_orthogonal_regions() {
        let mut engine = engine_for(json!({
            "states": [
                {"id": "idle", "transitions": [{"event": "go", "target": "a2 b2"}]},
                {
                    "id": "p", "type": "parallel",
                    "states": [
                        {"id": "r1", "states": [{"id": "a1"}, {"id": "a2"}]},
                        {"id": "r2", "states": [{"id": "b1"}, {"id": "b2"}]}
                    ]
                }
            ]
        }));
        engine.start().unwrap();
        assert_eq!(active(&engine), vec!["idle"]);

        engine.inject_external_event(Event::new("go")).unwrap();
        engine.process_next_external().unwrap();
        assert_eq!(active(&engine), vec!["p", "r1", "a2", "r2", "b2"]);
        assert_eq!(engine.stats().microsteps, 1);
    }

    proptest! {
        #[test]
        fn prop_published_configurations_are_legal(events in proptest::collection::vec(0usize..5, 0..40)) {
            let names = ["tick", "power.off", "ok1", "ok2", "noise"];
            let mut engine = engine_for(traffic_document());
            engine.start().unwrap();
            for i in events {
                if !engine.is_running() {
                    break;
                }
                engine.inject_external_event(Event::new(names[i])).unwrap();
                engine.process_next_external().unwrap();
                let config = engine.get_configuration();
                prop_assert!(config.is_valid().is_ok());
                prop_assert!(!config.atomic_states().is_empty());
            }
        }
    }
}
