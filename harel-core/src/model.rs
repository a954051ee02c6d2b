//! Statechart node tree.
//!
//! Nodes live in an arena owned by [`Model`]. A node's [`NodeId`] is its
//! document order: the counter value assigned when the node was added, so
//! sorting by `NodeId` is sorting by document order everywhere in the crate.
//! Parent/child links and transition targets are stored as handles and ids;
//! transition target ids are resolved against the model's id index only after
//! the whole tree exists.

use crate::error::CoreError;
use crate::event::EventDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Prefix of the synthetic index keys given to anonymous states.
const ANONYMOUS_PREFIX: &str = "__TID__";

/// Handle of a node in the model arena; equal to its document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn document_order(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// External transitions exit their source; internal ones may stay inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    #[default]
    External,
    Internal,
}

/// A guard expression, evaluated against the context when selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(String);

impl Condition {
    pub fn new(expr: impl Into<String>) -> Self {
        Self(expr.into())
    }

    pub fn expr(&self) -> &str {
        &self.0
    }
}

/// Transition payload of a [`NodeKind::Transition`] node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    events: Vec<EventDescriptor>,
    cond: Option<Condition>,
    targets: Vec<String>,
    kind: TransitionType,
}

impl Transition {
    /// An eventless, unguarded transition with no targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transition to the space-separated list of target ids.
    pub fn to(targets: &str) -> Self {
        Self::new().with_targets(targets.split_whitespace())
    }

    /// Sets the space-separated list of event descriptors.
    pub fn on(mut self, events: &str) -> Self {
        self.events = EventDescriptor::parse_list(events);
        self
    }

    /// Sets the guard condition.
    pub fn when(mut self, cond: impl Into<String>) -> Self {
        self.cond = Some(Condition::new(cond));
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, kind: TransitionType) -> Self {
        self.kind = kind;
        self
    }

    pub fn events(&self) -> &[EventDescriptor] {
        &self.events
    }

    pub fn cond(&self) -> Option<&Condition> {
        self.cond.as_ref()
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn kind(&self) -> TransitionType {
        self.kind
    }

    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }

    /// Returns true if any descriptor matches the event name.
    pub fn matches(&self, event: &str) -> bool {
        self.events.iter().any(|d| d.matches(event))
    }

    /// The `event` attribute as written, used in diagnostics.
    pub fn descriptor(&self) -> String {
        self.events
            .iter()
            .map(EventDescriptor::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Document root.
    Scxml { initial: Option<String> },
    /// Atomic or compound state, with an optional `initial` attribute.
    State { initial: Option<String> },
    Parallel,
    Final,
    /// Default-child pseudo-state holding a single transition.
    Initial,
    Transition(Transition),
    OnEntry,
    OnExit,
    Log {
        label: Option<String>,
        expr: Option<String>,
    },
    Raise {
        event: String,
    },
    Assign {
        location: String,
        expr: String,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Scxml { .. } => "scxml",
            NodeKind::State { .. } => "state",
            NodeKind::Parallel => "parallel",
            NodeKind::Final => "final",
            NodeKind::Initial => "initial",
            NodeKind::Transition(_) => "transition",
            NodeKind::OnEntry => "onentry",
            NodeKind::OnExit => "onexit",
            NodeKind::Log { .. } => "log",
            NodeKind::Raise { .. } => "raise",
            NodeKind::Assign { .. } => "assign",
        }
    }

    /// States that can be active and be named as transition targets.
    pub fn is_target(&self) -> bool {
        matches!(
            self,
            NodeKind::State { .. } | NodeKind::Parallel | NodeKind::Final
        )
    }

    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            NodeKind::Log { .. } | NodeKind::Raise { .. } | NodeKind::Assign { .. }
        )
    }

    fn initial_attr(&self) -> Option<&str> {
        match self {
            NodeKind::Scxml { initial } | NodeKind::State { initial } => initial.as_deref(),
            _ => None,
        }
    }
}

/// Returns true if `parent` may own a child of kind `child`.
pub fn is_valid_child(parent: &NodeKind, child: &NodeKind) -> bool {
    match parent {
        NodeKind::Scxml { .. } => matches!(
            child,
            NodeKind::State { .. } | NodeKind::Parallel | NodeKind::Final | NodeKind::Initial
        ),
        NodeKind::State { .. } => matches!(
            child,
            NodeKind::State { .. }
                | NodeKind::Parallel
                | NodeKind::Final
                | NodeKind::Initial
                | NodeKind::Transition(_)
                | NodeKind::OnEntry
                | NodeKind::OnExit
        ),
        NodeKind::Parallel => matches!(
            child,
            NodeKind::State { .. }
                | NodeKind::Parallel
                | NodeKind::Transition(_)
                | NodeKind::OnEntry
                | NodeKind::OnExit
        ),
        NodeKind::Final => matches!(child, NodeKind::OnEntry | NodeKind::OnExit),
        NodeKind::Initial => matches!(child, NodeKind::Transition(_)),
        NodeKind::Transition(_) | NodeKind::OnEntry | NodeKind::OnExit => child.is_executable(),
        NodeKind::Log { .. } | NodeKind::Raise { .. } | NodeKind::Assign { .. } => false,
    }
}

/// Returns true if a node of kind `child` may live under `parent`.
pub fn is_valid_parent(child: &NodeKind, parent: &NodeKind) -> bool {
    match child {
        NodeKind::Scxml { .. } => false,
        NodeKind::State { .. } | NodeKind::Final => matches!(
            parent,
            NodeKind::Scxml { .. } | NodeKind::State { .. } | NodeKind::Parallel
        ),
        NodeKind::Parallel => matches!(
            parent,
            NodeKind::Scxml { .. } | NodeKind::State { .. } | NodeKind::Parallel
        ),
        NodeKind::Initial => matches!(parent, NodeKind::Scxml { .. } | NodeKind::State { .. }),
        NodeKind::Transition(_) => parent.is_target() || matches!(parent, NodeKind::Initial),
        NodeKind::OnEntry | NodeKind::OnExit => parent.is_target(),
        NodeKind::Log { .. } | NodeKind::Raise { .. } | NodeKind::Assign { .. } => matches!(
            parent,
            NodeKind::Transition(_) | NodeKind::OnEntry | NodeKind::OnExit
        ),
    }
}

/// A node before it is added to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDecl {
    id: Option<String>,
    kind: NodeKind,
}

impl NodeDecl {
    pub fn new(kind: NodeKind) -> Self {
        Self { id: None, kind }
    }

    pub fn scxml() -> Self {
        Self::new(NodeKind::Scxml { initial: None })
    }

    pub fn state(id: impl Into<String>) -> Self {
        Self::new(NodeKind::State { initial: None }).with_id(id)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Parallel).with_id(id)
    }

    pub fn final_state(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Final).with_id(id)
    }

    pub fn initial_element() -> Self {
        Self::new(NodeKind::Initial)
    }

    pub fn transition(transition: Transition) -> Self {
        Self::new(NodeKind::Transition(transition))
    }

    pub fn onentry() -> Self {
        Self::new(NodeKind::OnEntry)
    }

    pub fn onexit() -> Self {
        Self::new(NodeKind::OnExit)
    }

    pub fn log(label: Option<&str>, expr: Option<&str>) -> Self {
        Self::new(NodeKind::Log {
            label: label.map(str::to_string),
            expr: expr.map(str::to_string),
        })
    }

    pub fn raise(event: impl Into<String>) -> Self {
        Self::new(NodeKind::Raise {
            event: event.into(),
        })
    }

    pub fn assign(location: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::new(NodeKind::Assign {
            location: location.into(),
            expr: expr.into(),
        })
    }

    /// Sets the id; an empty id leaves the node anonymous.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.id = if id.is_empty() { None } else { Some(id) };
        self
    }

    /// Sets the `initial` attribute of a state or of the root.
    pub fn with_initial(mut self, child: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Scxml { initial } | NodeKind::State { initial } => {
                *initial = Some(child.into())
            }
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

/// A node owned by a model.
#[derive(Debug, Clone)]
pub struct Node {
    order: NodeId,
    id: Option<String>,
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn node_id(&self) -> NodeId {
        self.order
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn transition(&self) -> Option<&Transition> {
        match &self.kind {
            NodeKind::Transition(t) => Some(t),
            _ => None,
        }
    }
}

/// The node tree, its id index and the list of transitions.
#[derive(Debug, Clone, Default)]
pub struct Model {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    targets: HashMap<String, NodeId>,
    transitions: Vec<NodeId>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node under `parent`, assigning it the next document order.
    ///
    /// The root must be an `scxml` node and be added first without a parent;
    /// every other node needs an existing parent that accepts it.
    pub fn add_node(&mut self, decl: NodeDecl, parent: Option<NodeId>) -> Result<NodeId, CoreError> {
        let NodeDecl { id, kind } = decl;

        match (parent, &kind) {
            (Some(_), NodeKind::Scxml { .. }) => {
                return Err(CoreError::structural("scxml root cannot have a parent"));
            }
            (None, NodeKind::Scxml { .. }) if self.root.is_some() => {
                return Err(CoreError::structural("model already has an scxml root"));
            }
            (None, NodeKind::Scxml { .. }) => {}
            (None, other) => {
                return Err(CoreError::structural(format!(
                    "{} node must have a parent",
                    other.name()
                )));
            }
            (Some(p), _) => self.check_containment(p, &kind)?,
        }

        if let Some(name) = &id {
            if kind.is_target() {
                if name.starts_with(ANONYMOUS_PREFIX) {
                    return Err(CoreError::structural(format!(
                        "id '{}' uses the reserved prefix '{}'",
                        name, ANONYMOUS_PREFIX
                    )));
                }
                if self.targets.contains_key(name) {
                    return Err(CoreError::structural(format!("duplicate state id '{}'", name)));
                }
            }
        }

        let order = NodeId(self.nodes.len() as u32);
        if kind.is_target() {
            let key = id
                .clone()
                .unwrap_or_else(|| format!("{}{}", ANONYMOUS_PREFIX, order.0));
            self.targets.insert(key, order);
        }
        if matches!(kind, NodeKind::Transition(_)) {
            self.transitions.push(order);
        }
        match parent {
            Some(p) => self.nodes[p.index()].children.push(order),
            None => self.root = Some(order),
        }

        self.nodes.push(Node {
            order,
            id,
            kind,
            parent,
            children: Vec::new(),
        });

        Ok(order)
    }

    fn check_containment(&self, parent: NodeId, child: &NodeKind) -> Result<(), CoreError> {
        let parent_node = self
            .nodes
            .get(parent.index())
            .ok_or_else(|| CoreError::structural(format!("unknown parent node {}", parent)))?;

        if !is_valid_child(&parent_node.kind, child) || !is_valid_parent(child, &parent_node.kind) {
            return Err(CoreError::structural(format!(
                "{} is not a valid child of {} '{}'",
                child.name(),
                parent_node.kind.name(),
                self.label(parent)
            )));
        }

        match child {
            NodeKind::Initial => {
                if let Some(attr) = parent_node.kind.initial_attr() {
                    return Err(CoreError::structural(format!(
                        "'{}' cannot use an initial element together with initial attribute '{}'",
                        self.label(parent),
                        attr
                    )));
                }
                if self.children_of_kind(parent, |k| matches!(k, NodeKind::Initial)).next().is_some() {
                    return Err(CoreError::structural(format!(
                        "'{}' already has an initial element",
                        self.label(parent)
                    )));
                }
            }
            NodeKind::Transition(t) if matches!(parent_node.kind, NodeKind::Initial) => {
                if !parent_node.children.is_empty() {
                    return Err(CoreError::structural(
                        "initial element holds exactly one transition",
                    ));
                }
                if !t.is_eventless() {
                    return Err(CoreError::structural("initial transition cannot have an event"));
                }
                if t.cond().is_some() {
                    return Err(CoreError::structural(
                        "initial transition cannot have a condition",
                    ));
                }
                if t.is_targetless() {
                    return Err(CoreError::structural("initial transition must name a target"));
                }
            }
            k if k.is_executable() => {
                let owner = parent_node.parent.map(|gp| &self.nodes[gp.index()].kind);
                if matches!(parent_node.kind, NodeKind::Transition(_))
                    && matches!(owner, Some(NodeKind::Initial))
                {
                    return Err(CoreError::structural(
                        "initial transition cannot contain executable content",
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Returns the node for an id issued by this model.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this model. Use [`Model::get_node`]
    /// for ids of unknown origin.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Looks up a state by id (or by its synthetic key if anonymous).
    pub fn get_target(&self, id: &str) -> Option<NodeId> {
        self.targets.get(id).copied()
    }

    pub fn is_target(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    /// All transition nodes in document order.
    pub fn transitions(&self) -> &[NodeId] {
        &self.transitions
    }

    pub fn transition(&self, id: NodeId) -> Option<&Transition> {
        self.node(id).transition()
    }

    /// The state (or initial element) owning a transition.
    pub fn source(&self, transition: NodeId) -> Option<NodeId> {
        self.parent(transition)
    }

    /// The id of a node, or `kind#order` for anonymous nodes.
    pub fn label(&self, id: NodeId) -> String {
        let node = self.node(id);
        match &node.id {
            Some(name) => name.clone(),
            None => format!("{}{}", node.kind.name(), id),
        }
    }

    fn children_of_kind<'a, F>(&'a self, id: NodeId, pred: F) -> impl Iterator<Item = NodeId> + 'a
    where
        F: Fn(&NodeKind) -> bool + 'a,
    {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(move |c| pred(&self.nodes[c.index()].kind))
    }

    /// Child states in document order.
    pub fn target_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, NodeKind::is_target)
    }

    /// Outgoing transitions of a state in document order.
    pub fn transitions_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, |k| matches!(k, NodeKind::Transition(_)))
    }

    pub fn onentry_blocks(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, |k| matches!(k, NodeKind::OnEntry))
    }

    pub fn onexit_blocks(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children_of_kind(id, |k| matches!(k, NodeKind::OnExit))
    }

    /// Target nodes a transition names, in the order written.
    pub fn resolved_targets(&self, transition: NodeId) -> Vec<NodeId> {
        self.transition(transition)
            .map(|t| {
                t.targets()
                    .iter()
                    .filter_map(|id| self.get_target(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A state with no child states.
    pub fn is_atomic(&self, id: NodeId) -> bool {
        self.node(id).kind.is_target() && self.target_children(id).next().is_none()
    }

    /// A non-parallel state with child states.
    pub fn is_compound(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::State { .. }) && !self.is_atomic(id)
    }

    pub fn is_parallel(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Parallel)
    }

    pub fn is_final(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Final)
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.root == Some(id)
    }

    /// Proper ancestors, nearest first, ending with the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Returns true if `id` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    /// The states a compound state (or the root) enters by default.
    ///
    /// Priority: the initial element's transition targets, then the `initial`
    /// attribute, then the first child state in document order.
    pub fn default_targets(&self, id: NodeId) -> Vec<NodeId> {
        if let Some(initial) = self
            .children_of_kind(id, |k| matches!(k, NodeKind::Initial))
            .next()
        {
            if let Some(t) = self.transitions_of(initial).next() {
                return self.resolved_targets(t);
            }
        }

        if let Some(attr) = self.node(id).kind.initial_attr() {
            if let Some(child) = self.get_target(attr) {
                return vec![child];
            }
        }

        self.target_children(id).take(1).collect()
    }

    /// States implied by entering `id`, excluding `id` itself.
    ///
    /// Atomic states expand to nothing, compound states follow their default
    /// child down to an atomic state, parallel states expand every region.
    pub fn initial_descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        self.enter_closure(id, &[], &mut out);
        out
    }

    /// Collects every descendant of `node` that must be active so that all
    /// of `required` (proper descendants of `node`) are active and the result
    /// below `node` is complete: compound states without a required
    /// descendant take their default child, parallel states take all regions.
    pub fn enter_closure(&self, node: NodeId, required: &[NodeId], out: &mut BTreeSet<NodeId>) {
        match &self.node(node).kind {
            NodeKind::Parallel => {
                for region in self.target_children(node) {
                    out.insert(region);
                    let below: Vec<NodeId> = required
                        .iter()
                        .copied()
                        .filter(|r| self.is_descendant(*r, region))
                        .collect();
                    self.enter_closure(region, &below, out);
                }
            }
            NodeKind::State { .. } | NodeKind::Scxml { .. } => {
                let required = if required.is_empty() {
                    self.default_targets(node)
                } else {
                    required.to_vec()
                };
                for child in self.target_children(node) {
                    let hits: Vec<NodeId> = required
                        .iter()
                        .copied()
                        .filter(|r| *r == child || self.is_descendant(*r, child))
                        .collect();
                    if hits.is_empty() {
                        continue;
                    }
                    out.insert(child);
                    let below: Vec<NodeId> = hits.into_iter().filter(|r| *r != child).collect();
                    self.enter_closure(child, &below, out);
                }
            }
            _ => {}
        }
    }

    /// Least common compound ancestor: the nearest proper ancestor of the
    /// first state that is compound (or the root) and contains all others.
    pub fn lcca(&self, states: &[NodeId]) -> Option<NodeId> {
        let (first, rest) = states.split_first()?;
        self.ancestors(*first).into_iter().find(|anc| {
            (self.is_compound(*anc) || self.is_root(*anc))
                && rest.iter().all(|s| self.is_descendant(*s, *anc))
        })
    }

    /// The subtree a transition exits and re-enters; `None` for targetless
    /// transitions, which neither exit nor enter anything.
    pub fn transition_domain(&self, transition: NodeId) -> Option<NodeId> {
        let t = self.transition(transition)?;
        let targets = self.resolved_targets(transition);
        if targets.is_empty() {
            return None;
        }
        let source = self.source(transition)?;

        if t.kind() == TransitionType::Internal
            && self.is_compound(source)
            && targets.iter().all(|s| self.is_descendant(*s, source))
        {
            return Some(source);
        }

        let mut states = Vec::with_capacity(targets.len() + 1);
        states.push(source);
        states.extend(targets);
        self.lcca(&states)
    }

    /// Validates the finished tree; no engine accepts an unvalidated model.
    pub fn validate(&self) -> Result<(), CoreError> {
        let root = self
            .root
            .ok_or_else(|| CoreError::validation("model has no scxml root"))?;

        for &t in &self.transitions {
            let Some(transition) = self.transition(t) else {
                continue;
            };
            for target in transition.targets() {
                if !self.is_target(target) {
                    return Err(CoreError::UnresolvedTarget {
                        event: transition.descriptor(),
                        target: target.clone(),
                    });
                }
            }
        }

        if self.target_children(root).next().is_none() {
            return Err(CoreError::validation("document contains no states"));
        }

        for node in &self.nodes {
            let id = node.order;
            if let Some(attr) = node.kind.initial_attr() {
                let ok = self
                    .get_target(attr)
                    .map(|child| self.parent(child) == Some(id))
                    .unwrap_or(false);
                if !ok {
                    return Err(CoreError::validation(format!(
                        "initial attribute '{}' of '{}' does not name a child state",
                        attr,
                        self.label(id)
                    )));
                }
            }

            match &node.kind {
                NodeKind::Parallel if self.target_children(id).next().is_none() => {
                    return Err(CoreError::validation(format!(
                        "parallel '{}' has no regions",
                        self.label(id)
                    )));
                }
                NodeKind::Initial => self.validate_initial(id)?,
                NodeKind::Transition(t) if t.targets().len() > 1 => {
                    self.validate_orthogonal_targets(id, t)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn validate_initial(&self, initial: NodeId) -> Result<(), CoreError> {
        let owner = self.parent(initial).unwrap_or(initial);
        let Some(t) = self.transitions_of(initial).next() else {
            return Err(CoreError::validation(format!(
                "initial element of '{}' has no transition",
                self.label(owner)
            )));
        };
        for target in self.resolved_targets(t) {
            if !self.is_descendant(target, owner) {
                return Err(CoreError::validation(format!(
                    "initial target '{}' is not a descendant of '{}'",
                    self.label(target),
                    self.label(owner)
                )));
            }
        }
        Ok(())
    }

    fn validate_orthogonal_targets(&self, id: NodeId, t: &Transition) -> Result<(), CoreError> {
        let targets = self.resolved_targets(id);
        for (i, a) in targets.iter().enumerate() {
            for b in &targets[i + 1..] {
                let common = self
                    .ancestors(*a)
                    .into_iter()
                    .find(|anc| self.is_descendant(*b, *anc));
                let orthogonal = a != b
                    && !self.is_descendant(*a, *b)
                    && !self.is_descendant(*b, *a)
                    && common.map(|c| self.is_parallel(c)).unwrap_or(false);
                if !orthogonal {
                    return Err(CoreError::validation(format!(
                        "targets '{}' and '{}' of transition with event '{}' are not in orthogonal regions",
                        self.label(*a),
                        self.label(*b),
                        t.descriptor()
                    )));
                }
            }
        }
        Ok(())
    }

    fn write_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let node = self.node(id);
        write!(f, "{}{}", "    ".repeat(depth), node.kind.name())?;
        if let Some(name) = &node.id {
            write!(f, " id={}", name)?;
        }
        write!(f, " order={}", id.0)?;
        match &node.kind {
            NodeKind::Scxml { .. } | NodeKind::State { .. } if !self.is_atomic(id) || self.is_root(id) => {
                let defaults: Vec<String> =
                    self.default_targets(id).into_iter().map(|d| self.label(d)).collect();
                write!(f, " initial={}", defaults.join(","))?;
            }
            NodeKind::Transition(t) => {
                write!(
                    f,
                    " event={} cond={} targets={}",
                    if t.is_eventless() { "-".to_string() } else { t.descriptor() },
                    t.cond().map(Condition::expr).unwrap_or("-"),
                    t.targets().join(",")
                )?;
            }
            NodeKind::Log { label, expr } => write!(
                f,
                " label={} expr={}",
                label.as_deref().unwrap_or("-"),
                expr.as_deref().unwrap_or("-")
            )?,
            NodeKind::Raise { event } => write!(f, " event={}", event)?,
            NodeKind::Assign { location, expr } => {
                write!(f, " location={} expr={}", location, expr)?
            }
            _ => {}
        }
        writeln!(f)?;
        for child in &node.children {
            self.write_node(f, *child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            Some(root) => self.write_node(f, root, 0),
            None => writeln!(f, "<empty model>"),
        }
    }
}
