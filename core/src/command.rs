//! Command-line tokenization and environment validation
//!
//! A spawn specification carries the command as a single string. It is
//! split into an argument vector here, honoring the usual quoting
//! convention: a delimiter inside double quotes is part of the argument,
//! not a separator.

use crate::{CoreError, Result};
use std::collections::HashMap;

/// Split a command line into an argument vector
///
/// Returns the program followed by its arguments. An empty or
/// unparseable command (e.g. an unterminated quote) is a validation
/// error.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let argv = shlex::split(command)
        .ok_or_else(|| CoreError::ValidationError(format!("cannot parse command '{command}'")))?;
    if argv.is_empty() {
        return Err(CoreError::ValidationError("command cannot be empty".to_string()));
    }
    Ok(argv)
}

/// Validate an environment mapping before handing it to the spawn call
///
/// Keys must be non-empty and must not contain `=` or NUL; values must
/// not contain NUL. Errors carry the offending key in the message.
pub fn validate_environment(environment: &HashMap<String, String>) -> Result<()> {
    for (key, value) in environment {
        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "environment: key cannot be empty".to_string(),
            ));
        }
        if key.contains('=') || key.contains('\0') {
            return Err(CoreError::ValidationError(format!(
                "environment['{key}']: key cannot contain '=' or NUL"
            )));
        }
        if value.contains('\0') {
            return Err(CoreError::ValidationError(format!(
                "environment['{key}']: value cannot contain NUL"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_command() {
        let argv = split_command("echo hello world").unwrap();
        assert_eq!(argv, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn test_split_quoted_argument() {
        // The space inside the quotes is literal, not a separator
        let argv = split_command(r#"grep "hello world" file.txt"#).unwrap();
        assert_eq!(argv, vec!["grep", "hello world", "file.txt"]);
    }

    #[test]
    fn test_split_empty_command() {
        assert!(split_command("").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn test_split_unterminated_quote() {
        let result = split_command(r#"echo "unterminated"#);
        match result.unwrap_err() {
            CoreError::ValidationError(_) => {}
            e => panic!("Expected ValidationError, got: {e:?}"),
        }
    }

    #[test]
    fn test_validate_environment_ok() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("LANG".to_string(), "C".to_string());
        assert!(validate_environment(&env).is_ok());
    }

    #[test]
    fn test_validate_environment_rejects_bad_keys() {
        let mut env = HashMap::new();
        env.insert(String::new(), "x".to_string());
        assert!(validate_environment(&env).is_err());

        let mut env = HashMap::new();
        env.insert("A=B".to_string(), "x".to_string());
        assert!(validate_environment(&env).is_err());

        let mut env = HashMap::new();
        env.insert("OK".to_string(), "a\0b".to_string());
        assert!(validate_environment(&env).is_err());
    }
}
