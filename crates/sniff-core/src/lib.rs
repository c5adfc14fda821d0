//! Core shared types for sniff.
//!
//! This crate is intentionally small: identifiers, request/report values and
//! the failure taxonomy shared by the registry, pool, worker and dispatchers.

use std::fmt;
use std::path::Path;

mod error;
mod report;
mod request;

pub use error::SniffError;
pub use report::Report;
pub use request::{ExitCodePolicy, Request, RequestKind, ToolInvocation};

/// The unit of work cancellation is scoped to — one document.
///
/// Subjects are compared by their normalized path string, so the same document
/// always maps to the same cancellation source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for Subject {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// Serialization domain for the worker pool.
///
/// Operations sharing a key never run concurrently; operations with distinct
/// keys may, bounded by pool capacity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    /// Key for a whole-document diagnostics run.
    pub fn diagnostic(path: impl AsRef<Path>) -> Self {
        Self(format!("diagnostic:{}", path.as_ref().display()))
    }

    /// Key for resolving the fix of one finding.
    pub fn resolve(path: impl AsRef<Path>, code: &str, line: u32, column: u32) -> Self {
        Self(format!(
            "resolve:{}:{code}:{line}:{column}",
            path.as_ref().display()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
