//! Configuration loading and validation for spawn specifications
//!
//! This module parses a TOML document into a [`schema::SpawnSpec`],
//! applies defaults (via serde defaults on the schema type), and performs
//! strict validation with field-path error messages.

use crate::command;
use crate::{CoreError, Result};
use schema::SpawnSpec;
use std::fs;
use std::path::Path;

/// Parse a spawn specification from a TOML string
pub fn parse_spec(input: &str) -> Result<SpawnSpec> {
    let spec: SpawnSpec = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("invalid spawn spec: {e}")))?;
    validate_spec(&spec)?;
    Ok(spec)
}

/// Load a spawn specification from a TOML file
pub fn load_spec(path: impl AsRef<Path>) -> Result<SpawnSpec> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        CoreError::ConfigurationError(format!("cannot read '{}': {e}", path.display()))
    })?;
    parse_spec(&contents)
}

/// Validate a spawn specification
///
/// Checks that the command tokenizes to a non-empty argument vector, that
/// the buffer size is usable, and that the environment mapping is well
/// formed.
pub fn validate_spec(spec: &SpawnSpec) -> Result<()> {
    command::split_command(&spec.command)
        .map_err(|e| CoreError::ValidationError(format!("command: {e}")))?;

    if spec.buffer_size == 0 {
        return Err(CoreError::ValidationError(
            "bufferSize: must be greater than 0".to_string(),
        ));
    }

    command::validate_environment(&spec.environment)?;

    if let Some(dir) = &spec.working_directory {
        if dir.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "workingDirectory: cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{SpawnOptions, DEFAULT_BUFFER_SIZE};

    #[test]
    fn test_parse_minimal_spec() {
        let spec = parse_spec(r#"command = "echo hello""#).unwrap();
        assert_eq!(spec.command, "echo hello");
        assert_eq!(spec.options, SpawnOptions::empty());
        assert_eq!(spec.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_parse_full_spec() {
        let spec = parse_spec(
            r#"
            command = "env"
            options = ["newProcessGroup", "combinedStdoutStderr"]
            bufferSize = 512
            workingDirectory = "/tmp"

            [environment]
            MODE = "test"
            "#,
        )
        .unwrap();
        assert!(spec.options.contains(SpawnOptions::NEW_PROCESS_GROUP));
        assert!(spec.options.contains(SpawnOptions::COMBINED_STDOUT_STDERR));
        assert_eq!(spec.buffer_size, 512);
        assert_eq!(spec.working_directory.as_deref(), Some("/tmp"));
        assert_eq!(spec.environment.get("MODE").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_parse_rejects_unknown_option() {
        let result = parse_spec(
            r#"
            command = "echo hi"
            options = ["runDetached"]
            "#,
        );
        match result.unwrap_err() {
            CoreError::ConfigurationError(msg) => assert!(msg.contains("runDetached")),
            e => panic!("Expected ConfigurationError, got: {e:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let result = parse_spec(r#"command = """#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let result = parse_spec(
            r#"
            command = "echo hi"
            bufferSize = 0
            "#,
        );
        match result.unwrap_err() {
            CoreError::ValidationError(msg) => assert!(msg.contains("bufferSize")),
            e => panic!("Expected ValidationError, got: {e:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_malformed_environment() {
        let result = parse_spec(
            r#"
            command = "echo hi"

            [environment]
            "BAD=KEY" = "value"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_spec_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawn.toml");
        std::fs::write(&path, "command = \"sleep 1\"\nbufferSize = 128\n").unwrap();

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.command, "sleep 1");
        assert_eq!(spec.buffer_size, 128);
    }

    #[test]
    fn test_load_spec_missing_file() {
        let result = load_spec("/nonexistent/spawn.toml");
        match result.unwrap_err() {
            CoreError::ConfigurationError(msg) => assert!(msg.contains("cannot read")),
            e => panic!("Expected ConfigurationError, got: {e:?}"),
        }
    }
}
