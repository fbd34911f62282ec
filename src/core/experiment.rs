use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One named command to run as a Kubernetes Job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub command: String,
}

impl Experiment {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    /// Name usable as a Kubernetes object name
    pub fn job_name(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("no commands provided to run")]
    Empty,
}

fn auto_name(index: usize) -> String {
    format!("exp-{:03}", index + 1)
}

/// Command text for a JSON value; `None` for arrays and objects.
fn scalar_command(value: Value) -> Option<String> {
    match value {
        Value::String(command) => Some(command),
        Value::Array(_) | Value::Object(_) => None,
        other => Some(other.to_string()),
    }
}

/// Parse the dispatcher's stdin.
///
/// Accepts, in order of preference:
/// - a JSON object mapping experiment name to command (document order kept)
/// - a JSON array of commands, named `exp-001`, `exp-002`, ...
/// - plain text with one command per line, named the same way
///
/// Numbers, bools and null inside a JSON object or array become their JSON text.
/// A nested array or object sends the whole input down the line-split path.
pub fn parse_commands_input(input: &str) -> Result<Vec<Experiment>, InputError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(InputError::Empty);
    }

    let parsed = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .map(|(name, command)| scalar_command(command).map(|c| Experiment::new(name, c)))
            .collect::<Option<Vec<_>>>(),
        Ok(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, command)| scalar_command(command).map(|c| Experiment::new(auto_name(i), c)))
            .collect::<Option<Vec<_>>>(),
        _ => None,
    };

    Ok(parsed.unwrap_or_else(|| parse_lines(trimmed)))
}

fn parse_lines(input: &str) -> Vec<Experiment> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| Experiment::new(auto_name(i), line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_rejected() {
        assert_eq!(parse_commands_input(""), Err(InputError::Empty));
        assert_eq!(parse_commands_input("  \n\t\n"), Err(InputError::Empty));
    }

    #[test]
    fn test_json_object_keeps_document_order() {
        let input = r#"{"zeta": "python a.py", "alpha": "python b.py", "mid": "echo hi"}"#;
        let experiments = parse_commands_input(input).unwrap();
        let names: Vec<_> = experiments.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(experiments[2].command, "echo hi");
    }

    #[test]
    fn test_json_non_string_values_keep_their_text() {
        let experiments = parse_commands_input(r#"{"a": "echo hi", "b": 3, "c": true}"#).unwrap();
        assert_eq!(
            experiments,
            vec![
                Experiment::new("a", "echo hi"),
                Experiment::new("b", "3"),
                Experiment::new("c", "true"),
            ]
        );

        let experiments = parse_commands_input(r#"["echo 1", 2]"#).unwrap();
        assert_eq!(
            experiments,
            vec![
                Experiment::new("exp-001", "echo 1"),
                Experiment::new("exp-002", "2"),
            ]
        );
    }

    #[test]
    fn test_nested_json_value_falls_back_to_lines() {
        let input = "{\"a\": [\"echo 1\"]}";
        let experiments = parse_commands_input(input).unwrap();
        assert_eq!(experiments, vec![Experiment::new("exp-001", input)]);
    }

    #[test]
    fn test_json_array_gets_generated_names() {
        let input = r#"["echo 1", "echo 2"]"#;
        let experiments = parse_commands_input(input).unwrap();
        assert_eq!(
            experiments,
            vec![
                Experiment::new("exp-001", "echo 1"),
                Experiment::new("exp-002", "echo 2"),
            ]
        );
    }

    #[test]
    fn test_newline_fallback_skips_blank_lines() {
        let input = "python train.py --lr 0.1\n\npython train.py --lr 0.01\n";
        let experiments = parse_commands_input(input).unwrap();
        assert_eq!(
            experiments,
            vec![
                Experiment::new("exp-001", "python train.py --lr 0.1"),
                Experiment::new("exp-002", "python train.py --lr 0.01"),
            ]
        );
    }

    #[test]
    fn test_json_scalar_is_treated_as_a_line() {
        let experiments = parse_commands_input("42").unwrap();
        assert_eq!(experiments, vec![Experiment::new("exp-001", "42")]);
    }

    #[test]
    fn test_job_name_is_lowercase() {
        let exp = Experiment::new("Exp-ABC", "true");
        assert_eq!(exp.job_name(), "exp-abc");
    }
}
