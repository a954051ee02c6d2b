//! Variable context.
//!
//! The engine never stores variables itself; executable content and
//! expressions read and write them through a [`Context`].

use serde_json::{Map, Value};

/// Variable store seen by expressions and executable content.
pub trait Context: Send {
    /// Returns a variable, looking through parent scopes.
    fn get(&self, name: &str) -> Option<Value>;

    /// Sets a variable in this scope.
    fn set(&mut self, name: &str, value: Value);

    /// Removes a variable from this scope.
    fn clear(&mut self, name: &str);

    /// Removes every variable from this scope.
    fn clear_all(&mut self);

    /// All visible variables; this scope shadows its parents.
    fn variables(&self) -> Map<String, Value>;

    /// The enclosing scope, if any.
    fn parent(&self) -> Option<&dyn Context>;
}

/// A [`Context`] backed by a JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonContext {
    vars: Map<String, Value>,
    parent: Option<Box<JsonContext>>,
}

impl JsonContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from a JSON object; non-object values give an
    /// empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(vars) => Self { vars, parent: None },
            _ => Self::default(),
        }
    }

    /// Creates a child scope whose reads fall back to `parent`.
    pub fn with_parent(parent: JsonContext) -> Self {
        Self {
            vars: Map::new(),
            parent: Some(Box::new(parent)),
        }
    }

    /// The visible variables as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.variables())
    }
}

impl Context for JsonContext {
    fn get(&self, name: &str) -> Option<Value> {
        match self.vars.get(name) {
            Some(v) => Some(v.clone()),
            None => self.parent.as_ref().and_then(|p| p.get(name)),
        }
    }

    fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    fn clear(&mut self, name: &str) {
        self.vars.remove(name);
    }

    fn clear_all(&mut self) {
        self.vars.clear();
    }

    fn variables(&self) -> Map<String, Value> {
        let mut all = self
            .parent
            .as_ref()
            .map(|p| p.variables())
            .unwrap_or_default();
        for (k, v) in &self.vars {
            all.insert(k.clone(), v.clone());
        }
        all
    }

    fn parent(&self) -> Option<&dyn Context> {
        self.parent.as_deref().map(|p| p as &dyn Context)
    }
}
