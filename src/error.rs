use std::path::PathBuf;

/// Failures while acquiring a bearer token from the credential CLI.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential command '{command}' not found. Install it (npm i -g @pnp/cli-microsoft365) or set GRAPH_CREDENTIAL_COMMAND")]
    CliNotFound { command: String },

    #[error("credential command '{command}' is not logged in. Run '{command} login' first")]
    NotLoggedIn { command: String },

    #[error("credential command returned an empty token")]
    EmptyToken,

    #[error("no token from the credential command within {}ms", .after.as_millis())]
    Timeout { after: std::time::Duration },

    #[error("credential command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("failed to run credential command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Every failure a tool call can surface to the agent layer.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Credential(#[from] AuthError),

    #[error("Graph request failed ({status} {status_text}): {body}")]
    Request {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("unknown tool '{name}'. Supported tools: {}", supported.join(", "))]
    UnknownTool { name: String, supported: Vec<String> },

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ToolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Error message cut to at most `max` characters, for log lines.
    pub fn truncated(&self, max: usize) -> String {
        let message = self.to_string();
        if message.chars().count() <= max {
            return message;
        }
        let mut cut: String = message.chars().take(max).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_lists_supported_names() {
        let err = ToolError::UnknownTool {
            name: "no.such.tool".to_string(),
            supported: vec!["mail.messages.list".to_string(), "calendar.events.list".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("no.such.tool"));
        assert!(msg.contains("mail.messages.list, calendar.events.list"));
    }

    #[test]
    fn test_truncated_keeps_short_messages() {
        let err = ToolError::validation("subject is required");
        assert_eq!(err.truncated(200), "invalid input: subject is required");
    }

    #[test]
    fn test_truncated_cuts_long_messages() {
        let err = ToolError::Request {
            status: 500,
            status_text: "Internal Server Error".to_string(),
            body: "x".repeat(1000),
        };
        let cut = err.truncated(50);
        assert_eq!(cut.chars().count(), 51);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_credential_error_is_transparent() {
        let err: ToolError = AuthError::EmptyToken.into();
        assert_eq!(err.to_string(), "credential command returned an empty token");
    }
}
