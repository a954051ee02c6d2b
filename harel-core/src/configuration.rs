//! The active-state set.
//!
//! A [`Configuration`] is an immutable snapshot once published by the engine:
//! each microstep builds a new one through [`Configuration::exit_states`] and
//! [`Configuration::enter_states`]. Both indexes are `BTreeSet`s keyed by
//! [`NodeId`], so iteration is always in document order.

use crate::context::Context;
use crate::error::CoreError;
use crate::eval::{ErrorReporter, Evaluator};
use crate::event::Event;
use crate::model::{Model, NodeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// The set of active states, excluding the document root.
#[derive(Debug, Clone)]
pub struct Configuration {
    model: Arc<Model>,
    states: BTreeSet<NodeId>,
    atomic: BTreeSet<NodeId>,
}

impl Configuration {
    /// An empty configuration over `model`.
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            states: BTreeSet::new(),
            atomic: BTreeSet::new(),
        }
    }

    /// The configuration entered when a chart starts: the root's
    /// initial-descendant expansion.
    pub fn initial(model: Arc<Model>) -> Result<Self, CoreError> {
        let root = model
            .root()
            .ok_or_else(|| CoreError::validation("model has no scxml root"))?;
        let mut config = Self::new(model);
        config.add_state(root)?;
        config.is_valid()?;
        Ok(config)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Adds a state together with its ancestors and, if it is composite,
    /// its initial descendants. Adding a state that is already active is a
    /// no-op.
    pub fn add_state(&mut self, target: NodeId) -> Result<(), CoreError> {
        let node = self.model.get_node(target).ok_or_else(|| {
            CoreError::IllegalConfiguration {
                reason: format!("unknown node {}", target),
            }
        })?;
        let is_root = self.model.is_root(target);
        if !is_root && !node.kind().is_target() {
            return Err(CoreError::IllegalConfiguration {
                reason: format!(
                    "{} '{}' cannot be active",
                    node.kind().name(),
                    self.model.label(target)
                ),
            });
        }
        if self.states.contains(&target) {
            return Ok(());
        }

        if !is_root {
            self.states.insert(target);
        }
        for ancestor in self.model.ancestors(target) {
            if !self.model.is_root(ancestor) {
                self.states.insert(ancestor);
            }
        }
        self.states.extend(self.model.initial_descendants(target));
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.atomic = self
            .states
            .iter()
            .copied()
            .filter(|s| self.model.is_atomic(*s))
            .collect();
    }

    pub fn contains(&self, state: NodeId) -> bool {
        self.states.contains(&state)
    }

    /// Active states in document order.
    pub fn states(&self) -> &BTreeSet<NodeId> {
        &self.states
    }

    /// Active atomic states in document order.
    pub fn atomic_states(&self) -> &BTreeSet<NodeId> {
        &self.atomic
    }

    /// Labels of the active states in document order.
    pub fn ids(&self) -> Vec<String> {
        self.states.iter().map(|s| self.model.label(*s)).collect()
    }

    pub fn atomic_ids(&self) -> Vec<String> {
        self.atomic.iter().map(|s| self.model.label(*s)).collect()
    }

    /// Returns true if the state with this id is active.
    pub fn is_active(&self, id: &str) -> bool {
        self.model
            .get_target(id)
            .map(|s| self.contains(s))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Checks the legality invariants.
    pub fn is_valid(&self) -> Result<(), CoreError> {
        let illegal = |reason: String| Err(CoreError::IllegalConfiguration { reason });
        let model = &self.model;

        if self.atomic.is_empty() {
            return illegal("no atomic state is active".to_string());
        }

        for &state in &self.states {
            if !model.node(state).kind().is_target() {
                return illegal(format!("'{}' is not a state", model.label(state)));
            }
            for ancestor in model.ancestors(state) {
                if !model.is_root(ancestor) && !self.contains(ancestor) {
                    return illegal(format!(
                        "'{}' is active but its ancestor '{}' is not",
                        model.label(state),
                        model.label(ancestor)
                    ));
                }
            }

            let active_children = model
                .target_children(state)
                .filter(|c| self.contains(*c))
                .count();
            if model.is_parallel(state) {
                let total = model.target_children(state).count();
                if active_children != total {
                    return illegal(format!(
                        "parallel '{}' has {} of {} regions active",
                        model.label(state),
                        active_children,
                        total
                    ));
                }
            } else if model.is_compound(state) && active_children != 1 {
                return illegal(format!(
                    "compound '{}' has {} active children",
                    model.label(state),
                    active_children
                ));
            }
        }

        if let Some(root) = model.root() {
            let top = model
                .target_children(root)
                .filter(|c| self.contains(*c))
                .count();
            if top != 1 {
                return illegal(format!("{} top-level states are active", top));
            }
        }

        Ok(())
    }

    /// Returns true if [`Configuration::is_valid`] succeeds.
    pub fn is_legal(&self) -> bool {
        self.is_valid().is_ok()
    }

    /// Selects the transitions enabled by `event`, or by the eventless
    /// pseudo-event when `event` is `None`, after preemption.
    ///
    /// Each active state contributes at most its first enabled transition in
    /// document order. A guard that fails to evaluate counts as false and is
    /// reported.
    pub fn select_transitions(
        &self,
        event: Option<&Event>,
        evaluator: &dyn Evaluator,
        context: &dyn Context,
        reporter: &dyn ErrorReporter,
    ) -> Vec<NodeId> {
        let mut candidates = Vec::new();

        for &state in &self.states {
            for t in self.model.transitions_of(state) {
                let Some(transition) = self.model.transition(t) else {
                    continue;
                };
                let event_matches = match event {
                    Some(e) => !transition.is_eventless() && transition.matches(e.name()),
                    None => transition.is_eventless(),
                };
                if !event_matches {
                    continue;
                }

                let enabled = match transition.cond() {
                    None => true,
                    Some(cond) => match evaluator.evaluate_condition(context, cond.expr()) {
                        Ok(value) => value,
                        Err(err) => {
                            reporter.report(&CoreError::GuardEvaluation {
                                expr: cond.expr().to_string(),
                                reason: err.to_string(),
                            });
                            false
                        }
                    },
                };
                if enabled {
                    candidates.push(t);
                    break;
                }
            }
        }

        self.preempt(candidates)
    }

    /// Drops candidates that conflict with an earlier one in document order.
    ///
    /// Two transitions conflict when their exit sets intersect or when one
    /// exits the source of the other. Transitions confined to disjoint
    /// parallel regions never conflict.
    pub fn preempt(&self, mut candidates: Vec<NodeId>) -> Vec<NodeId> {
        candidates.sort();
        candidates.dedup();

        let mut survivors: Vec<(NodeId, BTreeSet<NodeId>)> = Vec::with_capacity(candidates.len());
        for t in candidates {
            let exits = self.exit_set(&[t]);
            let source = self.model.source(t);
            let conflicts = survivors.iter().any(|(kept, kept_exits)| {
                let kept_source = self.model.source(*kept);
                !exits.is_disjoint(kept_exits)
                    || source.map(|s| kept_exits.contains(&s)).unwrap_or(false)
                    || kept_source.map(|s| exits.contains(&s)).unwrap_or(false)
            });
            if conflicts {
                tracing::trace!(
                    transition = %t,
                    source = %source.map(|s| self.model.label(s)).unwrap_or_default(),
                    "transition preempted"
                );
            } else {
                survivors.push((t, exits));
            }
        }

        survivors.into_iter().map(|(t, _)| t).collect()
    }

    /// Active states the given transitions leave: every active descendant of
    /// each transition's domain.
    pub fn exit_set(&self, transitions: &[NodeId]) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for &t in transitions {
            if let Some(domain) = self.model.transition_domain(t) {
                out.extend(
                    self.states
                        .iter()
                        .copied()
                        .filter(|s| self.model.is_descendant(*s, domain)),
                );
            }
        }
        out
    }

    /// States the given transitions enter: for each transition, the closure
    /// from its domain down through its targets' initial descendants.
    pub fn entry_set(&self, transitions: &[NodeId]) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        for &t in transitions {
            if let Some(domain) = self.model.transition_domain(t) {
                let targets = self.model.resolved_targets(t);
                self.model.enter_closure(domain, &targets, &mut out);
            }
        }
        out
    }

    /// Leaves `exits` innermost first, calling `on_exit` for each active
    /// state, and returns the resulting configuration.
    pub fn exit_states<F>(&self, exits: &BTreeSet<NodeId>, mut on_exit: F) -> Configuration
    where
        F: FnMut(NodeId),
    {
        let mut next = self.clone();
        for &state in exits.iter().rev() {
            if next.states.remove(&state) {
                on_exit(state);
            }
        }
        next.reindex();
        next
    }

    /// Enters `entries` outermost first, calling `on_enter` for each newly
    /// active state, and returns the resulting configuration.
    pub fn enter_states<F>(&self, entries: &BTreeSet<NodeId>, mut on_enter: F) -> Configuration
    where
        F: FnMut(NodeId),
    {
        let mut next = self.clone();
        for &state in entries {
            if next.states.insert(state) {
                on_enter(state);
            }
        }
        next.reindex();
        next
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.model, &other.model) && self.states == other.states
    }
}

impl Eq for Configuration {}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.ids().join(", "))
    }
}
