// ABOUTME: Shell-style tokenizer for the optional command appended to a container run

use crate::engine::{EngineError, Result};

/// Split a command line into arguments, honoring single/double quotes and
/// backslash escapes. Unterminated quotes are rejected.
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    shell_words::split(command).map_err(|e| {
        EngineError::Configuration(format!("Cannot parse container command `{}`: {}", command, e))
    })
}
