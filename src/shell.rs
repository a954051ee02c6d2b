//! Input lines accepted by `harel run`.

use harel_core::Event;
use serde_json::Value;
use std::time::Duration;

pub const HELP_TEXT: &str = r#"
Input, one command per line:
  <event> [json]                 Queue an external event with optional payload
  after <ms> <event> [json]      Queue an event after a delay
  config                         Print the current configuration
  help                           Show this help
  quit, exit                     Stop the engine and exit
"#;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Empty,
    Send(Event),
    After(Duration, Event),
    Config,
    Help,
    Quit,
}

/// Parses one input line.
pub fn parse_line(line: &str) -> Result<Line, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Line::Empty);
    }

    let (head, rest) = split_word(line);
    match head {
        "quit" | "exit" => Ok(Line::Quit),
        "help" => Ok(Line::Help),
        "config" => Ok(Line::Config),
        "after" => {
            let (ms, rest) = split_word(rest);
            let ms: u64 = ms
                .parse()
                .map_err(|_| format!("invalid delay '{}', expected milliseconds", ms))?;
            let (name, payload) = split_word(rest);
            if name.is_empty() {
                return Err("usage: after <ms> <event> [json]".to_string());
            }
            Ok(Line::After(
                Duration::from_millis(ms),
                make_event(name, payload)?,
            ))
        }
        name => Ok(Line::Send(make_event(name, rest)?)),
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn make_event(name: &str, payload: &str) -> Result<Event, String> {
    let event = Event::new(name);
    if payload.is_empty() {
        return Ok(event);
    }
    let data: Value =
        serde_json::from_str(payload).map_err(|e| format!("invalid JSON payload: {}", e))?;
    Ok(event.with_data(data))
}
