use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which findings-range convention the external tool follows.
///
/// Tools in this family conventionally exit 0 for "clean", use one or more low
/// codes for "findings present" and reserve higher codes for execution errors,
/// but the exact split varies between tools and versions, so it is
/// configuration rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitCodePolicy {
    /// Highest exit code that still means "the run itself succeeded".
    pub max_findings_code: i32,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        // 0 = clean, 1 = findings, 2+ = execution error.
        Self {
            max_findings_code: 1,
        }
    }
}

impl ExitCodePolicy {
    pub fn is_success(&self, exit_code: i32) -> bool {
        (0..=self.max_findings_code).contains(&exit_code)
    }
}

/// Resolved invocation of the external tool: everything the worker needs to
/// spawn it, independent of how configuration found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Absolute path of the executable.
    pub program: PathBuf,
    /// Ruleset/standard passed as `--standard=<value>` when set.
    pub standard: Option<String>,
    pub exit_codes: ExitCodePolicy,
}

/// What a single tool run should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Analyze the whole document; yields diagnostics plus candidate actions.
    Diagnostic,
    /// Resolve the edits for one finding; yields a list of text edits.
    CodeAction {
        /// Rule code of the finding being fixed.
        code: String,
        line: u32,
        column: u32,
    },
}

/// Immutable description of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    /// Working directory for the process (the resolved workspace root).
    pub cwd: PathBuf,
    /// Path of the document under analysis, passed to the tool for reporting.
    pub path: PathBuf,
    /// Document text, delivered on the tool's stdin.
    pub contents: String,
    pub tool: ToolInvocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_treats_findings_exit_as_success() {
        let policy = ExitCodePolicy::default();
        assert!(policy.is_success(0));
        assert!(policy.is_success(1));
        assert!(!policy.is_success(2));
        assert!(!policy.is_success(-1));
    }

    #[test]
    fn strict_policy_rejects_any_nonzero_exit() {
        let policy = ExitCodePolicy {
            max_findings_code: 0,
        };
        assert!(policy.is_success(0));
        assert!(!policy.is_success(1));
    }
}
