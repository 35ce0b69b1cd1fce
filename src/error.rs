//! Errors produced while driving ntc-cli.

use std::path::PathBuf;

/// Coarse classification used by batch tooling for tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The task was rejected before any process was spawned
    Configuration,
    /// The tool could not be started or exited with a failure
    Execution,
    /// The tool succeeded but printed something we could not interpret
    Parse,
}

/// Errors from validating, launching or interpreting a single ntc-cli run
#[derive(Debug, thiserror::Error)]
pub enum NtcError {
    #[error("Invalid task configuration: {0}")]
    Configuration(String),

    #[error("Failed to launch {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", format_execution_failure(command, *code, stdout, stderr))]
    Execution {
        command: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Unexpected ntc-cli output ({reason}): {line}")]
    Parse { line: String, reason: String },
}

impl NtcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NtcError::Configuration(_) => ErrorKind::Configuration,
            NtcError::Spawn { .. } | NtcError::Execution { .. } => ErrorKind::Execution,
            NtcError::Parse { .. } => ErrorKind::Parse,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        NtcError::Configuration(message.into())
    }

    pub(crate) fn parse(line: &str, reason: impl Into<String>) -> Self {
        NtcError::Parse {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

fn format_execution_failure(command: &[String], code: Option<i32>, stdout: &str, stderr: &str) -> String {
    let mut s = match code {
        Some(code) => format!("The following command failed with code {}:\n", code),
        None => "The following command was terminated by a signal:\n".to_string(),
    };
    s.push_str(&format!("> {}\n", command.join(" ")));
    if !stdout.is_empty() {
        s.push_str(&format!("stdout:\n{}", stdout));
    }
    if !stderr.is_empty() {
        s.push_str(&format!("stderr:\n{}", stderr));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_message_includes_command_and_streams() {
        let err = NtcError::Execution {
            command: vec!["ntc-cli".into(), "--describe".into()],
            code: Some(1),
            stdout: "partial\n".into(),
            stderr: "boom\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed with code 1"));
        assert!(msg.contains("> ntc-cli --describe"));
        assert!(msg.contains("stdout:\npartial"));
        assert!(msg.contains("stderr:\nboom"));
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(NtcError::config("x").kind(), ErrorKind::Configuration);
        assert_eq!(NtcError::parse("line", "bad").kind(), ErrorKind::Parse);
    }
}
