//! Configuration for the sniff dispatch core.
//!
//! Loading and merging of editor settings is the embedder's concern; this
//! crate defines the settings shape, semantic validation, and resolution of
//! the external tool executable for a given document.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sniff_core::{ExitCodePolicy, SniffError, ToolInvocation};

/// When a document update should trigger an analysis run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Only analyze when the document is saved.
    #[default]
    Save,
    /// Analyze as the document changes (save still triggers too).
    Type,
}

/// Why a dispatcher was asked to update a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    Save,
    Type,
}

impl TriggerMode {
    pub fn accepts(&self, reason: UpdateReason) -> bool {
        match self {
            TriggerMode::Save => matches!(reason, UpdateReason::Save),
            TriggerMode::Type => true,
        }
    }
}

/// Semantic validation failure for a [`SniffConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no tool executable configured and none was found near `{dir}`")]
    ExecutableNotFound { dir: PathBuf },

    #[error("configured tool executable `{path}` does not exist")]
    ExecutableMissing { path: PathBuf },

    #[error("invalid exclude pattern `{pattern}`: {source}")]
    InvalidExcludePattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("max_workers must be at least 1")]
    ZeroWorkers,
}

impl From<ConfigError> for SniffError {
    fn from(err: ConfigError) -> Self {
        SniffError::config(err.to_string())
    }
}

/// User-facing settings for the dispatcher.
///
/// Every field has a default so a partially-specified settings blob
/// deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SniffConfig {
    /// Explicit path of the tool executable. Used when auto-detection is off
    /// or finds nothing.
    pub executable: Option<PathBuf>,

    /// Look for a project-local executable (`vendor/bin/<tool>`) in the
    /// document's ancestor directories before falling back to `executable`.
    pub auto_detect: bool,

    /// Ruleset/standard handed to the tool as `--standard=<value>`.
    pub standard: Option<String>,

    pub trigger: TriggerMode,

    /// Glob patterns; documents whose path matches any of them are skipped.
    pub exclude: Vec<String>,

    /// Pool capacity: maximum number of concurrently running tool processes.
    pub max_workers: usize,

    pub exit_codes: ExitCodePolicy,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            executable: None,
            auto_detect: true,
            standard: None,
            trigger: TriggerMode::default(),
            exclude: Vec::new(),
            max_workers: default_max_workers(),
            exit_codes: ExitCodePolicy::default(),
        }
    }
}

fn default_max_workers() -> usize {
    // `available_parallelism()` can report the host CPU count even when the
    // process is constrained by cgroups, and each worker is a whole external
    // process. Keep the default conservative; users can raise it explicitly.
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

/// Name of the project-local executable looked up during auto-detection.
#[cfg(windows)]
const LOCAL_TOOL: &str = "phpcs.bat";
#[cfg(not(windows))]
const LOCAL_TOOL: &str = "phpcs";

impl SniffConfig {
    /// Check settings that can be rejected without any document context.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        self.exclude_set()?;
        Ok(())
    }

    /// Compile the exclude patterns. Callers should compile once and reuse.
    pub fn exclude_set(&self) -> Result<GlobSet, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob =
                Glob::new(pattern).map_err(|source| ConfigError::InvalidExcludePattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|source| ConfigError::InvalidExcludePattern {
                pattern: self.exclude.join(", "),
                source,
            })
    }

    /// Resolve the tool invocation for a document located in `subject_dir`.
    ///
    /// Auto-detection walks up from the document towards the filesystem root
    /// looking for `vendor/bin/phpcs`, so a Composer-managed project wins over
    /// a globally configured executable. The resolved path is checked for
    /// existence here, before any process is spawned.
    pub fn resolve_tool(&self, subject_dir: &Path) -> Result<ToolInvocation, ConfigError> {
        if self.auto_detect {
            if let Some(program) = find_local_tool(subject_dir) {
                tracing::debug!(
                    target: "sniff.config",
                    program = %program.display(),
                    "using project-local tool"
                );
                return Ok(self.invocation(program));
            }
        }

        match &self.executable {
            Some(path) if path.is_file() => Ok(self.invocation(path.clone())),
            Some(path) => Err(ConfigError::ExecutableMissing { path: path.clone() }),
            None => Err(ConfigError::ExecutableNotFound {
                dir: subject_dir.to_path_buf(),
            }),
        }
    }

    fn invocation(&self, program: PathBuf) -> ToolInvocation {
        ToolInvocation {
            program,
            standard: self.standard.clone(),
            exit_codes: self.exit_codes,
        }
    }
}

fn find_local_tool(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join("vendor").join("bin").join(LOCAL_TOOL))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let config: SniffConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SniffConfig::default());
        assert!(config.max_workers >= 1);
        assert!(config.auto_detect);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = SniffConfig {
            max_workers: 0,
            ..SniffConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn validate_rejects_bad_exclude_pattern() {
        let config = SniffConfig {
            exclude: vec!["vendor/**".into(), "a{b".into()],
            ..SniffConfig::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidExcludePattern { pattern, .. }) => {
                assert_eq!(pattern, "a{b");
            }
            other => panic!("expected invalid pattern error, got {other:?}"),
        }
    }

    #[test]
    fn exclude_set_matches_document_paths() {
        let config = SniffConfig {
            exclude: vec!["**/vendor/**".into(), "**/*.blade.php".into()],
            ..SniffConfig::default()
        };
        let set = config.exclude_set().unwrap();
        assert!(set.is_match("/proj/vendor/lib/a.php"));
        assert!(set.is_match("/proj/views/home.blade.php"));
        assert!(!set.is_match("/proj/src/a.php"));
    }

    #[test]
    fn auto_detect_prefers_project_local_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let bin = root.join("vendor").join("bin");
        fs::create_dir_all(&bin).unwrap();
        let local = bin.join(LOCAL_TOOL);
        fs::write(&local, "#!/bin/sh\n").unwrap();

        let fallback = root.join("global-phpcs");
        fs::write(&fallback, "#!/bin/sh\n").unwrap();

        let config = SniffConfig {
            executable: Some(fallback),
            ..SniffConfig::default()
        };

        let subject_dir = root.join("src").join("deep");
        fs::create_dir_all(&subject_dir).unwrap();
        let tool = config.resolve_tool(&subject_dir).unwrap();
        assert_eq!(tool.program, local);
    }

    #[test]
    fn missing_everything_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SniffConfig {
            executable: None,
            ..SniffConfig::default()
        };
        assert!(matches!(
            config.resolve_tool(tmp.path()),
            Err(ConfigError::ExecutableNotFound { .. })
        ));
    }

    #[test]
    fn configured_executable_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SniffConfig {
            auto_detect: false,
            executable: Some(tmp.path().join("nope")),
            ..SniffConfig::default()
        };
        let err = config.resolve_tool(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ExecutableMissing { .. }));

        // The mapping into the shared taxonomy is a configuration failure.
        let shared: SniffError = err.into();
        assert!(matches!(shared, SniffError::Config { .. }));
    }

    #[test]
    fn trigger_mode_gates_reasons() {
        assert!(TriggerMode::Save.accepts(UpdateReason::Save));
        assert!(!TriggerMode::Save.accepts(UpdateReason::Type));
        assert!(TriggerMode::Type.accepts(UpdateReason::Save));
        assert!(TriggerMode::Type.accepts(UpdateReason::Type));
    }
}
