//! Executes tool commands through a login shell (spec.md §4.4, C7).
//!
//! Generalizes `tools::bash::BashTool::execute_command` (spawn, timeout via
//! `tokio::time::timeout`, tee stdout/stderr via `tokio::spawn` reader
//! tasks) into a standalone runner that every shelling-out tool (`kubectl`,
//! `bash`, `scan_image_with_trivy`) shares: interactive-command refusal,
//! a 7-second cap for watch/follow/attach-shaped commands, and
//! `KUBECONFIG` injection.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

/// The kind of streaming command detected, carried in the returned
/// outcome so a caller can tell a `kubectl logs -f` tee apart from a
/// `kubectl get -w` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Watch,
    Logs,
    Attach,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Watch => "watch",
            StreamKind::Logs => "logs",
            StreamKind::Attach => "attach",
        }
    }
}

/// Result of running a command through the [`CommandRunner`].
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub stream_kind: Option<StreamKind>,
    /// Set when a streaming command hit the 7-second wall-clock cap and
    /// was killed rather than exiting on its own.
    pub timed_out: bool,
}

impl CommandOutcome {
    fn refused(reason: String) -> Self {
        Self {
            exit_code: -1,
            error: Some(reason),
            ..Default::default()
        }
    }

    /// Coerces the outcome into the structured map the agent loop appends
    /// to history as a `FunctionCallResult` (spec.md §4.6).
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("stdout".to_string(), serde_json::Value::String(self.stdout.clone()));
        map.insert("stderr".to_string(), serde_json::Value::String(self.stderr.clone()));
        map.insert("exit_code".to_string(), serde_json::Value::Number(self.exit_code.into()));
        if let Some(err) = &self.error {
            map.insert("error".to_string(), serde_json::Value::String(err.clone()));
        }
        if let Some(kind) = self.stream_kind {
            let tag = if self.timed_out { "timeout" } else { kind.as_str() };
            map.insert("stream_type".to_string(), serde_json::Value::String(tag.to_string()));
        }
        serde_json::Value::Object(map)
    }
}

const STREAMING_CAP: Duration = Duration::from_secs(7);

/// Executes shell commands on behalf of a registered tool, applying the
/// interactive-refusal and streaming-cap rules that are common to every
/// tool that shells out (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    kubeconfig: Option<PathBuf>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Runs `command`, refusing interactive forms and capping streaming
    /// forms at 7 seconds.
    pub async fn run(&self, command: &str) -> CommandOutcome {
        if command.trim().is_empty() {
            return CommandOutcome::refused("command cannot be empty".to_string());
        }
        if let Some(reason) = interactive_refusal_reason(command) {
            warn!("runner: refusing interactive command `{command}`: {reason}");
            return CommandOutcome::refused(reason);
        }
        match detect_stream_kind(command) {
            Some(kind) => self.run_streaming(command, kind).await,
            None => self.run_captured(command).await,
        }
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let comspec = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
            let mut c = Command::new(comspec);
            c.args(["/c", command]);
            c
        } else {
            let mut c = Command::new("bash");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd
    }

    async fn run_captured(&self, command: &str) -> CommandOutcome {
        let mut cmd = self.build_command(command);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("runner: failed to spawn `{command}`: {e}");
                return CommandOutcome::refused(format!("failed to spawn command: {e}"));
            }
        };
        let (stdout_handle, stderr_handle) = spawn_readers(&mut child);

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => return CommandOutcome::refused(format!("command execution failed: {e}")),
        };

        let stdout = join_reader(stdout_handle).await;
        let stderr = join_reader(stderr_handle).await;

        CommandOutcome {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            error: None,
            stream_kind: None,
            timed_out: false,
        }
    }

    async fn run_streaming(&self, command: &str, kind: StreamKind) -> CommandOutcome {
        let mut cmd = self.build_command(command);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("runner: failed to spawn `{command}`: {e}");
                return CommandOutcome::refused(format!("failed to spawn command: {e}"));
            }
        };
        // Streaming commands tee their output to the parent process's own
        // stdout/stderr as it arrives, in addition to the buffers returned
        // in the outcome (spec.md §4.4).
        let (stdout_handle, stderr_handle) =
            spawn_readers_tee(&mut child, tokio::io::stdout(), tokio::io::stderr());

        match tokio::time::timeout(STREAMING_CAP, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = join_reader(stdout_handle).await;
                let stderr = join_reader(stderr_handle).await;
                CommandOutcome {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                    error: None,
                    stream_kind: Some(kind),
                    timed_out: false,
                }
            }
            Ok(Err(e)) => CommandOutcome::refused(format!("command execution failed: {e}")),
            Err(_) => {
                debug!("runner: `{command}` hit the {STREAMING_CAP:?} streaming cap, killing it");
                let _ = child.kill().await;
                let exit_code = match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                    Ok(Ok(status)) => status.code().unwrap_or(-1),
                    _ => -1,
                };
                let stdout = join_reader(stdout_handle).await;
                let stderr = join_reader(stderr_handle).await;
                CommandOutcome {
                    stdout,
                    stderr,
                    exit_code,
                    error: None,
                    stream_kind: Some(kind),
                    timed_out: true,
                }
            }
        }
    }
}

type ReaderHandle = tokio::task::JoinHandle<std::io::Result<Vec<u8>>>;

fn spawn_readers(child: &mut tokio::process::Child) -> (Option<ReaderHandle>, Option<ReaderHandle>) {
    let stdout_handle = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stdout).read_to_end(&mut buf).await?;
            Ok(buf)
        })
    });
    let stderr_handle = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stderr).read_to_end(&mut buf).await?;
            Ok(buf)
        })
    });
    (stdout_handle, stderr_handle)
}

/// Reads `reader` to completion in chunks, writing each chunk both into
/// the returned buffer and to `tee` as it arrives — the "tee stdout/stderr
/// to buffers and to the parent streams" behavior spec.md §4.4 requires
/// of streaming commands, so a user watching the parent terminal sees
/// `kubectl logs -f`/`get -w`/`attach` output live instead of only after
/// the 7-second cap or exit.
async fn read_and_tee<R, W>(mut reader: R, mut tee: W) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        tee.write_all(&chunk[..n]).await?;
    }
    tee.flush().await?;
    Ok(buf)
}

/// Like [`spawn_readers`], but each chunk is also written to `stdout_tee`/
/// `stderr_tee` as it's read rather than only accumulated in memory.
fn spawn_readers_tee<WO, WE>(
    child: &mut tokio::process::Child,
    stdout_tee: WO,
    stderr_tee: WE,
) -> (Option<ReaderHandle>, Option<ReaderHandle>)
where
    WO: AsyncWrite + Unpin + Send + 'static,
    WE: AsyncWrite + Unpin + Send + 'static,
{
    let stdout_handle = child.stdout.take().map(|stdout| tokio::spawn(read_and_tee(stdout, stdout_tee)));
    let stderr_handle = child.stderr.take().map(|stderr| tokio::spawn(read_and_tee(stderr, stderr_tee)));
    (stdout_handle, stderr_handle)
}

async fn join_reader(handle: Option<ReaderHandle>) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
            Ok(Err(e)) => format!("(failed to read output: {e})"),
            Err(e) => format!("(failed to join reader task: {e})"),
        },
        None => String::new(),
    }
}

fn tokenize(command: &str) -> Option<Vec<String>> {
    shell_words::split(command).ok()
}

fn basename(arg0: &str) -> &str {
    arg0.rsplit(['/', '\\']).next().unwrap_or(arg0)
}

fn is_kubectl_invocation(tokens: &[String]) -> bool {
    match tokens.first() {
        Some(arg0) => matches!(basename(arg0), "kubectl" | "kubectl.exe"),
        None => false,
    }
}

fn first_non_flag_after(tokens: &[String], start: usize) -> Option<&str> {
    tokens[start..].iter().find(|t| !t.starts_with('-')).map(|s| s.as_str())
}

/// Returns `Some(reason)` for commands that must be refused without
/// spawning: `kubectl exec -it`, `kubectl port-forward`, `kubectl edit`.
pub fn interactive_refusal_reason(command: &str) -> Option<String> {
    let tokens = tokenize(command)?;
    if !is_kubectl_invocation(&tokens) {
        return None;
    }
    let verb = first_non_flag_after(&tokens, 1)?;
    match verb {
        "edit" => Some("kubectl edit opens an interactive editor and cannot be run non-interactively".to_string()),
        "port-forward" => Some("kubectl port-forward blocks waiting for connections and cannot be run non-interactively".to_string()),
        "exec" => {
            let has_tty_flags = tokens.iter().any(|t| {
                t == "-it" || t == "-ti" || t == "-i" || t == "-t" || t == "--stdin" || t == "--tty"
            });
            if has_tty_flags {
                Some("kubectl exec with -i/-t attaches an interactive session and cannot be run non-interactively".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Returns `Some(kind)` when `command` is shaped like a long-running
/// streaming operation that must be capped at 7 seconds.
pub fn detect_stream_kind(command: &str) -> Option<StreamKind> {
    let tokens = tokenize(command)?;
    if !is_kubectl_invocation(&tokens) {
        return None;
    }
    let verb = first_non_flag_after(&tokens, 1)?;
    match verb {
        "attach" => Some(StreamKind::Attach),
        "logs" => {
            if tokens.iter().any(|t| t == "-f" || t == "--follow") {
                Some(StreamKind::Logs)
            } else {
                None
            }
        }
        "get" => {
            if tokens.iter().any(|t| t == "-w" || t == "--watch") {
                Some(StreamKind::Watch)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_is_refused() {
        assert!(interactive_refusal_reason("kubectl edit deployment/nginx").is_some());
    }

    #[test]
    fn port_forward_is_refused() {
        assert!(interactive_refusal_reason("kubectl port-forward pod/nginx 8080:80").is_some());
    }

    #[test]
    fn exec_with_it_is_refused() {
        assert!(interactive_refusal_reason("kubectl exec -it mypod -- /bin/sh").is_some());
    }

    #[test]
    fn exec_without_tty_flags_is_not_refused() {
        assert!(interactive_refusal_reason("kubectl exec mypod -- ls").is_none());
    }

    #[test]
    fn plain_get_is_not_refused_or_streaming() {
        assert!(interactive_refusal_reason("kubectl get pods").is_none());
        assert!(detect_stream_kind("kubectl get pods").is_none());
    }

    #[test]
    fn watch_flag_is_detected() {
        assert_eq!(detect_stream_kind("kubectl get pods -w"), Some(StreamKind::Watch));
        assert_eq!(detect_stream_kind("kubectl get pods --watch"), Some(StreamKind::Watch));
    }

    #[test]
    fn follow_flag_is_detected() {
        assert_eq!(detect_stream_kind("kubectl logs -f mypod"), Some(StreamKind::Logs));
        assert_eq!(detect_stream_kind("kubectl logs mypod"), None);
    }

    #[test]
    fn attach_always_streams() {
        assert_eq!(detect_stream_kind("kubectl attach mypod"), Some(StreamKind::Attach));
    }

    #[tokio::test]
    async fn streaming_reads_mirror_every_chunk_to_the_tee_writer() {
        // Stands in for "the parent process's own stdout/stderr" with a
        // mockable writer, so the tee behavior can be asserted without
        // capturing the test binary's real stdout.
        let (mut source, child_stdout) = tokio::io::duplex(1024);
        let (tee_writer, mut tee_reader) = tokio::io::duplex(1024);

        source.write_all(b"tick one\ntick two\n").await.unwrap();
        drop(source);

        let buffered = read_and_tee(child_stdout, tee_writer).await.unwrap();

        let mut mirrored = Vec::new();
        tee_reader.read_to_end(&mut mirrored).await.unwrap();

        assert_eq!(buffered, b"tick one\ntick two\n");
        assert_eq!(mirrored, buffered);
    }

    #[tokio::test]
    async fn captured_command_reports_exit_code_and_output() {
        let runner = CommandRunner::new();
        let outcome = runner.run("echo hello").await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.stream_kind.is_none());
    }

    #[tokio::test]
    async fn empty_command_is_refused() {
        let runner = CommandRunner::new();
        let outcome = runner.run("   ").await;
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn non_kubectl_commands_are_never_capped_or_tagged() {
        // The 7-second cap and stream_kind tagging are scoped to
        // kubectl-shaped invocations; a plain shell command runs to
        // completion untouched even if it looks watch-like in spirit.
        let runner = CommandRunner::new();
        let outcome = runner.run("echo watching").await;
        assert!(outcome.stream_kind.is_none());
        assert!(!outcome.timed_out);
    }

    #[test]
    fn outcome_to_json_tags_timeout_over_detected_kind() {
        let outcome = CommandOutcome {
            stdout: "tick\n".to_string(),
            stderr: String::new(),
            exit_code: -1,
            error: None,
            stream_kind: Some(StreamKind::Watch),
            timed_out: true,
        };
        let json = outcome.to_json();
        assert_eq!(json["stream_type"], serde_json::json!("timeout"));
    }
}
