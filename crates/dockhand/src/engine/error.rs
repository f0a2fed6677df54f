//! Container engine error types.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while talking to the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An engine command or API request failed.
    #[error("engine {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation was cancelled before the engine finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine could not be reached at all.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const DAEMON_PREFIXES: &[&str] = &["Error response from daemon: ", "Error: ", "error: "];

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Message safe to hand to a client.
    ///
    /// Engine-reported failures keep the engine's own wording (first line,
    /// daemon boilerplate stripped). Local faults never leak their details.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::CommandFailed { command, message } => {
                let line = first_line(message);
                if line.is_empty() {
                    format!("{command} failed")
                } else {
                    line
                }
            }
            EngineError::ContainerNotFound(id) => format!("container not found: {id}"),
            EngineError::ImageNotFound(image) => format!("image not found: {image}"),
            EngineError::InvalidInput(msg) => msg.clone(),
            EngineError::Cancelled => "operation cancelled".to_string(),
            EngineError::Unavailable(_) => "container engine is unavailable".to_string(),
            EngineError::ParseError(_) | EngineError::Io(_) => {
                "container engine request failed".to_string()
            }
        }
    }
}

fn first_line(message: &str) -> String {
    let line = message.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut line = line;
    for prefix in DAEMON_PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest;
        }
    }
    line.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_strips_daemon_prefix() {
        let err = EngineError::CommandFailed {
            command: "stop".to_string(),
            message: "Error response from daemon: No such container: abc\n".to_string(),
        };
        assert_eq!(err.user_message(), "No such container: abc");
    }

    #[test]
    fn user_message_hides_local_faults() {
        let err = EngineError::Io(std::io::Error::other("/var/run/docker.sock: permission denied"));
        assert_eq!(err.user_message(), "container engine request failed");

        let err = EngineError::ParseError("expected value at line 1".to_string());
        assert!(!err.user_message().contains("line 1"));
    }

    #[test]
    fn user_message_falls_back_to_command() {
        let err = EngineError::CommandFailed {
            command: "rm".to_string(),
            message: "   \n".to_string(),
        };
        assert_eq!(err.user_message(), "rm failed");
    }
}
