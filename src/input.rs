//! Parsing of `key=value` runtime arguments from the command line.

use thiserror::Error;
use wdl_slurm::Runtime;
use wdl_slurm::RuntimeValue;

/// Errors that can occur when parsing command-line runtime values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandLineError {
    /// Input string was not in the expected `key=value` format.
    #[error("invalid runtime value `{0}`: expected `key=value`")]
    InvalidFormat(String),

    /// Key part of the input was empty.
    #[error("empty key in runtime value `{0}`")]
    EmptyKey(String),

    /// Value part of the input was missing.
    #[error("missing value after `=` for runtime key `{0}`")]
    MissingValue(String),

    /// The same key was given more than once.
    #[error("runtime key `{0}` was specified more than once")]
    DuplicateKey(String),
}

/// Parses a single `key=value` string.
pub fn parse_runtime_arg(input: &str) -> Result<(String, RuntimeValue), CommandLineError> {
    let Some((key, value)) = input.split_once('=') else {
        return Err(CommandLineError::InvalidFormat(input.to_string()));
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(CommandLineError::EmptyKey(input.to_string()));
    }

    let value = value.trim();
    if value.is_empty() {
        return Err(CommandLineError::MissingValue(key.to_string()));
    }

    Ok((key.to_string(), parse_value(value)))
}

/// Parses a value, trying integer, then float, then boolean, then string.
///
/// Quoted values are always strings.
fn parse_value(input: &str) -> RuntimeValue {
    if input.len() >= 2 && input.starts_with('"') && input.ends_with('"') {
        return RuntimeValue::String(input[1..input.len() - 1].to_string());
    }

    if let Ok(i) = input.parse::<i64>() {
        return RuntimeValue::Integer(i);
    }

    if let Ok(f) = input.parse::<f64>() {
        return RuntimeValue::Float(f);
    }

    match input {
        "true" => RuntimeValue::Boolean(true),
        "false" => RuntimeValue::Boolean(false),
        _ => RuntimeValue::String(input.to_string()),
    }
}

/// Parses a list of `key=value` strings into runtime values.
pub fn parse_runtime(inputs: &[String]) -> Result<Runtime, CommandLineError> {
    let mut runtime = Runtime::new();
    for input in inputs {
        let (key, value) = parse_runtime_arg(input)?;
        if runtime.contains_key(&key) {
            return Err(CommandLineError::DuplicateKey(key));
        }

        runtime.insert(key, value);
    }

    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_values() {
        assert_eq!(parse_value("4"), RuntimeValue::Integer(4));
        assert_eq!(parse_value("-1"), RuntimeValue::Integer(-1));
        assert_eq!(parse_value("1.5"), RuntimeValue::Float(1.5));
        assert_eq!(parse_value("true"), RuntimeValue::Boolean(true));
        assert_eq!(parse_value("4 GiB"), RuntimeValue::String("4 GiB".into()));
        assert_eq!(parse_value("\"42\""), RuntimeValue::String("42".into()));
        assert_eq!(parse_value("\""), RuntimeValue::String("\"".into()));
    }

    #[test]
    fn test_error_handling() {
        assert_eq!(
            parse_runtime_arg("cpu"),
            Err(CommandLineError::InvalidFormat("cpu".into()))
        );
        assert_eq!(
            parse_runtime_arg("=4"),
            Err(CommandLineError::EmptyKey("=4".into()))
        );
        assert_eq!(
            parse_runtime_arg("cpu= "),
            Err(CommandLineError::MissingValue("cpu".into()))
        );
        assert_eq!(
            parse_runtime(&["cpu=1".into(), "cpu=2".into()]).unwrap_err(),
            CommandLineError::DuplicateKey("cpu".into())
        );
    }

    #[test]
    fn parses_runtime() {
        let runtime = parse_runtime(&[
            "cpu=4".into(),
            "memory=4 GiB".into(),
            "gpu=true".into(),
            "slurm_partition=short".into(),
        ])
        .unwrap();
        assert_eq!(runtime.len(), 4);
        assert_eq!(runtime["cpu"], RuntimeValue::Integer(4));
        assert_eq!(runtime["memory"], RuntimeValue::String("4 GiB".into()));
        assert_eq!(runtime["gpu"], RuntimeValue::Boolean(true));
        assert_eq!(
            runtime["slurm_partition"],
            RuntimeValue::String("short".into())
        );
    }
}
