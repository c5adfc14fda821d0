use thiserror::Error;

/// Failure taxonomy shared across the dispatch core.
///
/// The core never swallows a failure: every operation resolves with a value or
/// rejects with one of these. Only dispatchers decide which variants are
/// surfaced to the user-facing log (`Cancelled` never is).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SniffError {
    /// The operation was superseded or torn down. Expected, never logged.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid or unresolvable settings (typically the tool executable).
    /// Reported before anything is spawned whenever possible.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The external tool's own execution failed: nonzero exit outside the
    /// findings range, or output we could not parse.
    #[error("analysis tool failed{}: {stderr}", exit_label(.exit_code))]
    Tool {
        /// Exit code, when the process exited rather than being signalled.
        exit_code: Option<i32>,
        /// Raw diagnostic text from the tool's stderr (or a parse error).
        stderr: String,
    },

    /// The worker pool was disposed while this operation was queued.
    #[error("worker pool shut down")]
    PoolShutdown,
}

impl SniffError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn tool(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Tool {
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// True for the one variant dispatchers must treat as silent.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}
