use serde_json::Value;

/// Structured result of one tool run.
///
/// The entries are opaque tool JSON; the core carries and counts them without
/// interpreting their schema. Callers receive `Option<Report>` — `None` means
/// the tool produced no payload at all ("no findings").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Result of a [`RequestKind::Diagnostic`](crate::RequestKind::Diagnostic) run.
    Diagnostics {
        diagnostics: Vec<Value>,
        code_actions: Vec<Value>,
    },
    /// Result of a [`RequestKind::CodeAction`](crate::RequestKind::CodeAction) run.
    Edits { edits: Vec<Value> },
}

impl Report {
    /// Number of findings carried by the report, regardless of kind.
    pub fn findings(&self) -> usize {
        match self {
            Self::Diagnostics { diagnostics, .. } => diagnostics.len(),
            Self::Edits { edits } => edits.len(),
        }
    }
}
