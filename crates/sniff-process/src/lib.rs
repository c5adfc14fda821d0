//! Runs the external analysis tool for one request.
//!
//! The tool receives the document text on stdin and writes a single JSON
//! payload to stdout (diagnostic text goes to stderr). Output capture is
//! bounded per stream so a misbehaving tool cannot OOM the host, and
//! cancellation kills the whole process group since the tool offers no
//! graceful-cancel protocol.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use sniff_core::{Report, Request, RequestKind, SniffError};

pub use tokio_util::sync::CancellationToken;

/// Options controlling one tool run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the process if it has not exited after this duration. There is no
    /// implicit timeout: a hung tool is otherwise only bounded by its token
    /// being cancelled.
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture *per stream* (stdout and stderr).
    pub max_bytes: usize,
    /// How long to wait after SIGTERM before force-killing the process tree.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            // 16MiB per stream keeps memory bounded while still capturing
            // enough context for diagnostics.
            max_bytes: 16 * 1024 * 1024,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// Run the external tool for `request`, feeding the document on stdin and
/// translating exit status plus output into a [`Report`].
///
/// `Ok(None)` means the tool produced no payload ("no findings"). A cancelled
/// token terminates the process and yields [`SniffError::Cancelled`] without
/// parsing partial output.
pub async fn run_tool(
    request: &Request,
    opts: &RunOptions,
    token: &CancellationToken,
) -> Result<Option<Report>, SniffError> {
    if token.is_cancelled() {
        return Err(SniffError::Cancelled);
    }

    let mut cmd = Command::new(&request.tool.program);
    cmd.args(build_args(request))
        .current_dir(&request.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Put the child into its own process group on Unix so cancellation can
    // kill the whole tree (wrapper scripts spawning the real tool would
    // otherwise keep the output pipes open).
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This runs after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| spawn_error(&request.tool.program, err))?;

    let Some(mut stdin) = child.stdin.take() else {
        return Err(SniffError::tool(None, "child stdin was not captured"));
    };
    let Some(stdout) = child.stdout.take() else {
        return Err(SniffError::tool(None, "child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(SniffError::tool(None, "child stderr was not captured"));
    };

    let contents = request.contents.clone();
    let feed = tokio::spawn(async move {
        // The tool may exit before consuming all input; a closed pipe is not
        // an error for this side.
        match stdin.write_all(contents.as_bytes()).await {
            Ok(()) => {
                let _ = stdin.shutdown().await;
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Err(err) => {
                tracing::debug!(target: "sniff.process", error = %err, "failed to feed tool stdin");
            }
        }
    });

    let max_bytes = opts.max_bytes;
    let stdout_task = tokio::spawn(read_bounded(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_bounded(stderr, max_bytes));

    let status = tokio::select! {
        biased;
        _ = token.cancelled() => {
            terminate_process_tree(&mut child, opts.kill_grace).await;
            feed.abort();
            stdout_task.abort();
            stderr_task.abort();
            tracing::debug!(
                target: "sniff.process",
                path = %request.path.display(),
                "tool run cancelled"
            );
            return Err(SniffError::Cancelled);
        }
        _ = sleep_or_forever(opts.timeout) => {
            terminate_process_tree(&mut child, opts.kill_grace).await;
            feed.abort();
            stdout_task.abort();
            stderr_task.abort();
            return Err(SniffError::tool(
                None,
                format!("tool did not exit within {:?}", opts.timeout.unwrap_or_default()),
            ));
        }
        status = child.wait() => {
            status.map_err(|err| SniffError::tool(None, format!("failed to wait for tool: {err}")))?
        }
    };

    let _ = feed.await;
    let (stdout_bytes, stdout_truncated) = join_capture(stdout_task, "stdout").await?;
    let (stderr_bytes, _) = join_capture(stderr_task, "stderr").await?;

    let exit_ok = status
        .code()
        .is_some_and(|code| request.tool.exit_codes.is_success(code));
    if !exit_ok {
        let stderr_text = String::from_utf8_lossy(&stderr_bytes)
            .trim_end()
            .to_string();
        return Err(SniffError::Tool {
            exit_code: status.code(),
            stderr: stderr_text,
        });
    }

    parse_report(&request.kind, &stdout_bytes, stdout_truncated)
}

fn spawn_error(program: &Path, err: io::Error) -> SniffError {
    match err.kind() {
        // A missing or non-executable tool is a configuration problem, not
        // the failure of a run that never started.
        io::ErrorKind::NotFound => SniffError::config(format!(
            "analysis tool `{}` was not found",
            program.display()
        )),
        io::ErrorKind::PermissionDenied => SniffError::config(format!(
            "analysis tool `{}` is not executable",
            program.display()
        )),
        _ => SniffError::tool(
            None,
            format!("failed to spawn `{}`: {err}", program.display()),
        ),
    }
}

fn build_args(request: &Request) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        format!("--stdin-path={}", request.path.display()),
    ];
    if let Some(standard) = &request.tool.standard {
        args.push(format!("--standard={standard}"));
    }
    match &request.kind {
        RequestKind::Diagnostic => {
            args.push("--report=json".to_string());
        }
        RequestKind::CodeAction { code, line, column } => {
            args.push("--report=fixes".to_string());
            args.push(format!("--sniffs={code}"));
            args.push(format!("--line={line}"));
            args.push(format!("--column={column}"));
        }
    }
    // Read the document from stdin.
    args.push("-".to_string());
    args
}

#[derive(Deserialize)]
struct DiagnosticsPayload {
    #[serde(default)]
    diagnostics: Vec<Value>,
    #[serde(default, rename = "codeActions")]
    code_actions: Vec<Value>,
}

#[derive(Deserialize)]
struct EditsPayload {
    #[serde(default)]
    edits: Vec<Value>,
}

fn parse_report(
    kind: &RequestKind,
    stdout: &[u8],
    truncated: bool,
) -> Result<Option<Report>, SniffError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if truncated {
        // A truncated payload would parse as garbage or, worse, as a shorter
        // valid report. Surface it as a tool failure instead.
        return Err(SniffError::tool(
            None,
            "tool output exceeded the capture limit",
        ));
    }

    let report = match kind {
        RequestKind::Diagnostic => {
            let payload: DiagnosticsPayload = serde_json::from_str(text)
                .map_err(|err| SniffError::tool(None, format!("unparseable tool output: {err}")))?;
            Report::Diagnostics {
                diagnostics: payload.diagnostics,
                code_actions: payload.code_actions,
            }
        }
        RequestKind::CodeAction { .. } => {
            let payload: EditsPayload = serde_json::from_str(text)
                .map_err(|err| SniffError::tool(None, format!("unparseable tool output: {err}")))?;
            Report::Edits {
                edits: payload.edits,
            }
        }
    };
    Ok(Some(report))
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn join_capture(
    task: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> Result<(Vec<u8>, bool), SniffError> {
    match task.await {
        Ok(Ok(capture)) => Ok(capture),
        Ok(Err(err)) => Err(SniffError::tool(
            None,
            format!("failed to read tool {stream}: {err}"),
        )),
        Err(_) => Err(SniffError::tool(None, format!("{stream} reader task failed"))),
    }
}

async fn read_bounded(
    mut reader: impl AsyncRead + Unpin,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        if out.len() < max_bytes {
            let remaining = max_bytes - out.len();
            let to_store = remaining.min(n);
            out.extend_from_slice(&buf[..to_store]);
            if to_store < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((out, truncated))
}

async fn terminate_process_tree(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        let pid = pid as i32;
        // Negative pid targets the process group we set up via `setpgid(0, 0)`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        let _ = child.wait().await;
    }

    #[cfg(windows)]
    {
        let _ = grace;
        // `Child::kill` only terminates the immediate process; `taskkill /T`
        // takes down children of wrapper scripts (e.g. `.bat` launchers) too.
        if let Some(pid) = child.id() {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
