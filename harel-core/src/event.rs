//! Events and event descriptors.
//!
//! An event name is a sequence of `.`-separated tokens. A transition lists
//! descriptors; a descriptor matches every event whose leading tokens equal
//! the descriptor's tokens, so `error` matches `error.execution` and
//! `error.execution.assign`. A trailing empty token or a trailing `*` is
//! ignored (`error.` and `error.*` behave like `error`), and a bare `*`
//! matches any event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const TOKEN_SEPARATOR: char = '.';

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Injected by the host through the external queue.
    #[default]
    External,
    /// Raised by executable content.
    Internal,
    /// Generated by the engine itself (`done.*`, `error.*`).
    Platform,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::External => f.write_str("external"),
            EventKind::Internal => f.write_str("internal"),
            EventKind::Platform => f.write_str("platform"),
        }
    }
}

/// A concrete event with an optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    kind: EventKind,
}

impl Event {
    /// Creates an external event without payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            kind: EventKind::External,
        }
    }

    /// Creates an event raised by executable content.
    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name).with_kind(EventKind::Internal)
    }

    /// Creates an engine-generated event.
    pub fn platform(name: impl Into<String>) -> Self {
        Self::new(name).with_kind(EventKind::Platform)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The event as seen by expressions through the `_event` variable.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "type": self.kind,
            "data": self.data,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A single event descriptor from a transition's `event` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDescriptor(String);

impl EventDescriptor {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    /// Splits a space-separated `event` attribute into descriptors.
    pub fn parse_list(attr: &str) -> Vec<EventDescriptor> {
        attr.split_whitespace().map(EventDescriptor::new).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this descriptor matches the given event name.
    pub fn matches(&self, event: &str) -> bool {
        if self.0 == "*" {
            return true;
        }

        let mine = tokens(&self.0);
        let theirs = tokens(event);
        if mine.len() > theirs.len() {
            return false;
        }

        mine.iter().zip(theirs.iter()).all(|(a, b)| a == b)
    }
}

impl From<&str> for EventDescriptor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn tokens(descriptor: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = descriptor.split(TOKEN_SEPARATOR).collect();
    if matches!(tokens.last(), Some(&"") | Some(&"*")) {
        tokens.pop();
    }
    tokens
}
