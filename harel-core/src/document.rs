//! Chart documents.
//!
//! Charts are written as JSON or YAML:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "states": [
//!     {"id": "closed", "transitions": [{"event": "open", "target": "opened"}]},
//!     {"id": "opened",
//!      "onentry": [{"log": {"label": "door", "expr": "\"open\""}}],
//!      "transitions": [{"event": "close", "target": "closed", "cond": "ctx.safe"}]}
//!   ]
//! }
//! ```
//!
//! [`Document::build`] turns a document into a validated [`Model`] by adding
//! nodes in document order: for each state its initial element, `onentry`,
//! `onexit`, transitions and then child states.

use crate::error::CoreError;
use crate::model::{Model, NodeDecl, NodeId, NodeKind, Transition, TransitionType};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn deserialize_tokens<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct TokensVisitor;

    impl<'de> Visitor<'de> for TokensVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a space-separated string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut tokens = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                tokens.extend(s.split_whitespace().map(str::to_string));
            }
            Ok(tokens)
        }
    }

    deserializer.deserialize_any(TokensVisitor)
}

/// Kind of a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    #[default]
    State,
    Parallel,
    Final,
}

/// Executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRaw {
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
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

/// A transition entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionRaw {
    /// Event descriptors; empty for an eventless transition.
    #[serde(
        default,
        deserialize_with = "deserialize_tokens",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub event: Vec<String>,

    /// Guard expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,

    /// Target state ids; empty for a targetless transition.
    #[serde(
        default,
        deserialize_with = "deserialize_tokens",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub target: Vec<String>,

    #[serde(default, rename = "type")]
    pub kind: TransitionType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRaw>,
}

/// A state entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: StateType,

    /// Default child given as an attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Default child targets given as an initial element.
    #[serde(
        default,
        deserialize_with = "deserialize_tokens",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub initial_transition: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onentry: Vec<ActionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onexit: Vec<ActionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateRaw>,
}

/// Raw chart document as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_tokens",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub initial_transition: Vec<String>,

    pub states: Vec<StateRaw>,
}

/// A parsed chart document.
#[derive(Debug, Clone)]
pub struct Document {
    raw: DocumentRaw,
    checksum: String,
}

impl Document {
    /// Creates a document from raw parts.
    pub fn from_raw(raw: DocumentRaw) -> Result<Self, CoreError> {
        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));
        Ok(Self { raw, checksum })
    }

    /// Parses a document from a JSON value.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: DocumentRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let raw: DocumentRaw = serde_json::from_str(s)?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, CoreError> {
        let raw: DocumentRaw = serde_yaml::from_str(s)?;
        Self::from_raw(raw)
    }

    /// Loads a document; `.yaml` and `.yml` files are read as YAML,
    /// anything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.raw.name.as_deref()
    }

    /// crc32c of the canonical JSON encoding.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn raw(&self) -> &DocumentRaw {
        &self.raw
    }

    /// Returns the canonical JSON encoding.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }

    /// Builds and validates the node tree. A failure never yields a
    /// partially built model.
    pub fn build(&self) -> Result<Model, CoreError> {
        let mut model = Model::new();
        let mut root = NodeDecl::scxml();
        if let Some(initial) = &self.raw.initial {
            root = root.with_initial(initial.clone());
        }
        let root = model.add_node(root, None)?;

        add_initial_element(&mut model, root, &self.raw.initial_transition)?;
        for state in &self.raw.states {
            add_state(&mut model, root, state)?;
        }

        model.validate()?;
        tracing::debug!(
            name = self.name().unwrap_or("-"),
            nodes = model.len(),
            checksum = %self.checksum,
            "chart built"
        );
        Ok(model)
    }
}

fn add_initial_element(model: &mut Model, parent: NodeId, targets: &[String]) -> Result<(), CoreError> {
    if targets.is_empty() {
        return Ok(());
    }
    let initial = model.add_node(NodeDecl::initial_element(), Some(parent))?;
    model.add_node(
        NodeDecl::transition(Transition::new().with_targets(targets.iter().cloned())),
        Some(initial),
    )?;
    Ok(())
}

fn add_state(model: &mut Model, parent: NodeId, raw: &StateRaw) -> Result<NodeId, CoreError> {
    let kind = match raw.kind {
        StateType::State => NodeKind::State { initial: None },
        StateType::Parallel => NodeKind::Parallel,
        StateType::Final => NodeKind::Final,
    };
    let mut decl = NodeDecl::new(kind).with_id(raw.id.clone().unwrap_or_default());
    if let Some(initial) = &raw.initial {
        if raw.kind != StateType::State {
            return Err(CoreError::structural(format!(
                "initial attribute '{}' is only allowed on a state",
                initial
            )));
        }
        decl = decl.with_initial(initial.clone());
    }
    let id = model.add_node(decl, Some(parent))?;

    add_initial_element(model, id, &raw.initial_transition)?;
    if !raw.onentry.is_empty() {
        let block = model.add_node(NodeDecl::onentry(), Some(id))?;
        add_actions(model, block, &raw.onentry)?;
    }
    if !raw.onexit.is_empty() {
        let block = model.add_node(NodeDecl::onexit(), Some(id))?;
        add_actions(model, block, &raw.onexit)?;
    }
    for t in &raw.transitions {
        let mut transition = Transition::new()
            .on(&t.event.join(" "))
            .with_targets(t.target.iter().cloned())
            .with_type(t.kind);
        if let Some(cond) = &t.cond {
            transition = transition.when(cond.clone());
        }
        let node = model.add_node(NodeDecl::transition(transition), Some(id))?;
        add_actions(model, node, &t.actions)?;
    }
    for child in &raw.states {
        add_state(model, id, child)?;
    }
    Ok(id)
}

fn add_actions(model: &mut Model, parent: NodeId, actions: &[ActionRaw]) -> Result<(), CoreError> {
    for action in actions {
        let decl = match action {
            ActionRaw::Log { label, expr } => NodeDecl::log(label.as_deref(), expr.as_deref()),
            ActionRaw::Raise { event } => NodeDecl::raise(event.clone()),
            ActionRaw::Assign { location, expr } => NodeDecl::assign(location.clone(), expr.clone()),
        };
        model.add_node(decl, Some(parent))?;
    }
    Ok(())
}
