//! Request dispatchers: the consumers of the dispatch core.
//!
//! A dispatcher begins a registry operation for its subject, gates on
//! configuration (trigger mode, exclude patterns), acquires a pool lease for
//! its key, runs the tool, and translates the outcome. Cancellation is always
//! silent; configuration and tool failures are surfaced to the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::GlobSet;
use serde_json::Value;

use sniff_cancel::{CancellationRegistry, CancellationToken};
use sniff_config::{ConfigError, SniffConfig};
use sniff_core::{PoolKey, Report, Request, RequestKind, SniffError, Subject};
use sniff_pool::WorkerPool;
use sniff_process::{run_tool, RunOptions};

pub use sniff_config::UpdateReason;

/// Seam to the editor-integration layer, which renders results.
pub trait DiagnosticsSink: Send + Sync {
    /// Replace the previously published results for `path`.
    fn publish(&self, path: &Path, diagnostics: Vec<Value>, code_actions: Vec<Value>);
    /// Remove any previously published results for `path`.
    fn clear(&self, path: &Path);
}

/// Shared plumbing for the dispatchers: registry, pool and resolved settings.
pub struct DispatchContext {
    registry: CancellationRegistry,
    pool: WorkerPool,
    config: SniffConfig,
    exclude: GlobSet,
    workspace_root: PathBuf,
    run_options: RunOptions,
}

impl DispatchContext {
    pub fn new(config: SniffConfig, workspace_root: PathBuf) -> Result<Self, ConfigError> {
        Self::with_run_options(config, workspace_root, RunOptions::default())
    }

    pub fn with_run_options(
        config: SniffConfig,
        workspace_root: PathBuf,
        run_options: RunOptions,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let exclude = config.exclude_set()?;
        let pool = WorkerPool::new(config.max_workers);
        Ok(Self {
            registry: CancellationRegistry::new(),
            pool,
            config,
            exclude,
            workspace_root,
            run_options,
        })
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Tear down: queued operations are rejected by the pool, in-flight ones
    /// are cancelled through the registry (which makes their workers kill the
    /// external processes), and no new operation can begin. Queued and
    /// in-flight operations alike reject with [`SniffError::PoolShutdown`].
    ///
    /// The pool is marked shut down before the tokens fire so that `execute`
    /// can tell a teardown cancellation from an ordinary supersede.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.registry.shutdown();
    }

    fn excluded(&self, path: &Path) -> bool {
        self.exclude.is_match(path)
    }

    fn build_request(
        &self,
        kind: RequestKind,
        path: &Path,
        contents: String,
    ) -> Result<Request, SniffError> {
        let subject_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tool = self.config.resolve_tool(subject_dir)?;
        Ok(Request {
            kind,
            cwd: self.workspace_root.clone(),
            path: path.to_path_buf(),
            contents,
            tool,
        })
    }

    async fn execute(
        &self,
        key: PoolKey,
        request: Request,
        token: &CancellationToken,
    ) -> Result<Option<Report>, SniffError> {
        let result = async {
            let _lease = self.pool.acquire(key, token).await?;
            run_tool(&request, &self.run_options, token).await
        }
        .await;
        match result {
            // Teardown cancels in-flight tokens through the registry; report
            // that as the pool going away, not as a superseding request.
            Err(err) if err.is_cancelled() && self.pool.is_shut_down() => {
                Err(SniffError::PoolShutdown)
            }
            other => other,
        }
    }
}

/// Keeps published diagnostics for open documents up to date.
pub struct DiagnosticsDispatcher<S> {
    ctx: Arc<DispatchContext>,
    sink: S,
}

impl<S: DiagnosticsSink> DiagnosticsDispatcher<S> {
    pub fn new(ctx: Arc<DispatchContext>, sink: S) -> Self {
        Self { ctx, sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Analyze `path` and publish or clear its results.
    ///
    /// A newer update for the same document supersedes this one; the
    /// superseded run ends silently. Tool and configuration failures are
    /// logged and leave previously published results untouched.
    pub async fn update_document(&self, path: &Path, contents: &str, reason: UpdateReason) {
        match self.try_update(path, contents, reason).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                tracing::error!(
                    target: "sniff.dispatch",
                    path = %path.display(),
                    error = %err,
                    "diagnostics update failed"
                );
            }
        }
    }

    async fn try_update(
        &self,
        path: &Path,
        contents: &str,
        reason: UpdateReason,
    ) -> Result<(), SniffError> {
        let Some(mut guard) = self.ctx.registry.begin(Subject::new(path), None) else {
            // Shutting down.
            return Ok(());
        };

        if !self.ctx.config.trigger.accepts(reason) {
            return Ok(());
        }
        if self.ctx.excluded(path) {
            tracing::debug!(target: "sniff.dispatch", path = %path.display(), "document excluded");
            return Ok(());
        }

        let token = guard.token().clone();
        let result = async {
            let request =
                self.ctx
                    .build_request(RequestKind::Diagnostic, path, contents.to_string())?;
            self.ctx
                .execute(PoolKey::diagnostic(path), request, &token)
                .await
        }
        .await;
        guard.end();

        match result? {
            None => self.sink.clear(path),
            Some(Report::Diagnostics {
                diagnostics,
                code_actions,
            }) => self.sink.publish(path, diagnostics, code_actions),
            Some(report) => {
                return Err(SniffError::tool(
                    None,
                    format!("unexpected report shape for a diagnostics run: {report:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// Resolves the concrete edits for one finding on demand.
pub struct FixDispatcher {
    ctx: Arc<DispatchContext>,
}

impl FixDispatcher {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    /// Ask the tool for the edits fixing `code` at `line`:`column`.
    ///
    /// Returns `Err(Cancelled)` when superseded (callers drop that silently)
    /// and `Err(PoolShutdown)` once the context is torn down. An absent
    /// report maps to no edits.
    pub async fn resolve_fix(
        &self,
        path: &Path,
        contents: &str,
        code: &str,
        line: u32,
        column: u32,
    ) -> Result<Vec<Value>, SniffError> {
        let key = PoolKey::resolve(path, code, line, column);
        // The subject mirrors the key: a repeated request for the same fix
        // supersedes the previous one without disturbing diagnostics runs for
        // the document.
        let subject = Subject::new(key.as_str());
        let Some(mut guard) = self.ctx.registry.begin(subject, None) else {
            return Err(SniffError::PoolShutdown);
        };

        if self.ctx.excluded(path) {
            return Ok(Vec::new());
        }

        let token = guard.token().clone();
        let kind = RequestKind::CodeAction {
            code: code.to_string(),
            line,
            column,
        };
        let result = async {
            let request = self.ctx.build_request(kind, path, contents.to_string())?;
            self.ctx.execute(key, request, &token).await
        }
        .await;
        guard.end();

        match result {
            Ok(None) => Ok(Vec::new()),
            Ok(Some(Report::Edits { edits })) => Ok(edits),
            Ok(Some(report)) => Err(SniffError::tool(
                None,
                format!("unexpected report shape for a fix run: {report:?}"),
            )),
            Err(err) => {
                if !err.is_cancelled() {
                    tracing::error!(
                        target: "sniff.dispatch",
                        path = %path.display(),
                        code,
                        error = %err,
                        "fix resolution failed"
                    );
                }
                Err(err)
            }
        }
    }
}
