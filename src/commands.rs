//! One-shot commands and output formatting.

use colored::Colorize;
use harel_core::{Configuration, Document, Model, NodeKind};
use std::path::Path;
use std::sync::Arc;

/// Loads and builds a chart file.
pub fn load_chart(path: &Path) -> Result<(Document, Model), Box<dyn std::error::Error>> {
    let document = Document::from_path(path)?;
    let model = document.build()?;
    Ok((document, model))
}

/// `harel validate`: builds the chart and summarizes it.
pub fn validate(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let (document, model) = load_chart(path)?;
    let states = model.nodes().filter(|n| n.kind().is_target()).count();
    let finals = model
        .nodes()
        .filter(|n| matches!(n.kind(), NodeKind::Final))
        .count();

    Ok(format!(
        "{} chart {} ({} states, {} final, {} transitions, checksum {})",
        "Valid".green(),
        document
            .name()
            .unwrap_or_else(|| path.to_str().unwrap_or("-"))
            .cyan(),
        states,
        finals,
        model.transitions().len(),
        document.checksum()
    ))
}

/// `harel show`: the node tree followed by the initial configuration.
pub fn show(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let (document, model) = load_chart(path)?;
    let model = Arc::new(model);
    let initial = Configuration::initial(model.clone())?;

    Ok(format!(
        "{}\n{}\n{} {}",
        format!("Chart {}", document.name().unwrap_or("-").cyan()).bold(),
        model.to_string().trim_end(),
        "Initial configuration:".bold(),
        format_configuration(&initial)
    ))
}

/// Renders a configuration with its atomic states highlighted.
pub fn format_configuration(config: &Configuration) -> String {
    let model = config.model();
    let states: Vec<String> = config
        .states()
        .iter()
        .map(|s| {
            let label = model.label(*s);
            if config.atomic_states().contains(s) {
                label.green().bold().to_string()
            } else {
                label
            }
        })
        .collect();
    format!("{{{}}}", states.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chart_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name: door
states:
  - id: closed
    transitions:
      - event: open
        target: opened
  - id: opened
    transitions:
      - event: close
        target: closed
      - event: smash
        target: broken
  - id: broken
    type: final
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_validate_summary() {
        colored::control::set_override(false);
        let file = chart_file();
        let summary = validate(file.path()).unwrap();
        assert!(summary.starts_with("Valid chart door (3 states, 1 final, 3 transitions"));
    }

    #[test]
    fn test_show_lists_tree_and_initial_configuration() {
        colored::control::set_override(false);
        let file = chart_file();
        let output = show(file.path()).unwrap();
        assert!(output.contains("state id=closed order=1"));
        assert!(output.ends_with("Initial configuration: {closed}"));
    }

    #[test]
    fn test_invalid_chart_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"states": [{{"id": "a", "transitions": [{{"target": "b"}}]}}]}}"#).unwrap();
        let err = validate(file.path()).unwrap_err();
        assert_eq!(err.to_string(), "invalid target 'b' for transition with event ''");
    }
}
