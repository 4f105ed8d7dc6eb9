//! Subprocess executor for the assistant CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitDetector, RateLimitInfo};
use crate::stream::{StreamEvent, StreamParser};

use super::claude::{claude_args, StreamInterpreter};
use super::{AgentRunner, Completion, ExecutorMessage};

/// How the assistant binary is launched.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Absolute path or bare command name.
    pub binary: String,
    /// Arguments placed before the instruction string.
    pub args: Vec<String>,
    /// Time allowed between SIGTERM and a forced kill.
    pub kill_grace: Duration,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl ExecutorConfig {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
            kill_grace: Duration::from_secs(5),
            env: Vec::new(),
        }
    }

    /// Headless Claude Code in stream-json mode.
    pub fn claude(binary: impl Into<String>, model: Option<&str>) -> Self {
        Self::new(binary, claude_args(model))
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    kill_signal: Mutex<Option<Arc<Notify>>>,
}

impl Shared {
    fn signal_slot(&self) -> MutexGuard<'_, Option<Arc<Notify>>> {
        self.kill_signal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the executor. The kill signal is registered under the same
    /// lock, so a `kill` never sees a busy executor without a signal.
    fn claim(&self) -> Option<Arc<Notify>> {
        let mut slot = self.signal_slot();
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        let signal = Arc::new(Notify::new());
        *slot = Some(signal.clone());
        Some(signal)
    }

    fn finish(&self) {
        let mut slot = self.signal_slot();
        *slot = None;
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Owns at most one assistant subprocess at a time.
pub struct SubprocessExecutor {
    config: ExecutorConfig,
    resolved: OnceLock<PathBuf>,
    shared: Arc<Shared>,
}

impl SubprocessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            resolved: OnceLock::new(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Resolves the binary once; bare names are looked up on PATH.
    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }

        let candidate = Path::new(&self.config.binary);
        let resolved = if candidate.is_absolute() || candidate.components().count() > 1 {
            candidate.to_path_buf()
        } else {
            find_on_path(&self.config.binary)
                .ok_or_else(|| Error::BinaryNotFound(self.config.binary.clone()))?
        };

        tracing::debug!(binary = %self.config.binary, resolved = ?resolved, "resolved assistant binary");
        Ok(self.resolved.get_or_init(|| resolved).clone())
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl AgentRunner for SubprocessExecutor {
    async fn execute(
        &self,
        instructions: &str,
        working_dir: &Path,
    ) -> Result<mpsc::Receiver<ExecutorMessage>> {
        let binary = self.resolve_binary()?;

        let Some(kill_signal) = self.shared.claim() else {
            return Err(Error::ExecutorBusy);
        };

        tracing::info!(
            binary = ?binary,
            working_dir = ?working_dir,
            instructions_len = instructions.len(),
            "spawning assistant"
        );

        let mut command = Command::new(&binary);
        command
            .args(&self.config.args)
            .arg(instructions)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.finish();
                return Err(Error::Spawn(format!("{}: {}", binary.display(), e)));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            self.shared.finish();
            return Err(Error::Spawn("assistant output was not captured".to_string()));
        };

        let (tx, rx) = mpsc::channel(256);
        let supervisor = Supervisor {
            child,
            stdout,
            stderr,
            tx,
            kill_signal,
            shared: self.shared.clone(),
            kill_grace: self.config.kill_grace,
        };
        tokio::spawn(supervisor.run());

        Ok(rx)
    }

    fn kill(&self) {
        let signal = self.shared.signal_slot().clone();
        if let Some(signal) = signal {
            tracing::info!("kill requested for assistant subprocess");
            signal.notify_one();
        }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// Supervising task for one invocation.
struct Supervisor {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<ExecutorMessage>,
    kill_signal: Arc<Notify>,
    shared: Arc<Shared>,
    kill_grace: Duration,
}

/// Why the read loop stopped early.
enum Interruption {
    Killed,
    RateLimited(RateLimitInfo),
    ReceiverGone,
}

impl Supervisor {
    async fn run(mut self) {
        let start = Instant::now();
        let detector = RateLimitDetector::new();
        let mut parser = StreamParser::new();
        let mut interpreter = StreamInterpreter::new();
        let mut raw_stdout = Vec::new();
        let mut buf = vec![0u8; 8192];

        let mut stderr = self.stderr;
        let mut stderr_task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut bytes).await {
                tracing::warn!(error = %e, "error reading assistant stderr");
            }
            String::from_utf8_lossy(&bytes).into_owned()
        });

        let mut interruption = None;
        loop {
            tokio::select! {
                read = self.stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        raw_stdout.extend_from_slice(&buf[..n]);
                        for event in parser.feed(&buf[..n]) {
                            if let Some(stop) =
                                forward(&event, &detector, &mut interpreter, &self.tx).await
                            {
                                interruption = Some(stop);
                                break;
                            }
                        }
                        if interruption.is_some() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "error reading assistant stdout");
                        break;
                    }
                },
                _ = self.kill_signal.notified() => {
                    interruption = Some(Interruption::Killed);
                    break;
                }
            }
        }

        if interruption.is_some() {
            terminate(&mut self.child, self.kill_grace).await;
        }

        // Stdout can close while the process keeps running.
        let status = if interruption.is_none() {
            tokio::select! {
                status = self.child.wait() => status,
                _ = self.kill_signal.notified() => {
                    interruption = Some(Interruption::Killed);
                    terminate(&mut self.child, self.kill_grace).await;
                    self.child.wait().await
                }
            }
        } else {
            self.child.wait().await
        };

        // A leftover grandchild may hold stderr open after the exit.
        let stderr_text = match tokio::time::timeout(self.kill_grace, &mut stderr_task).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => {
                tracing::warn!("assistant stderr still open after exit, not waiting for it");
                stderr_task.abort();
                String::new()
            }
        };

        if interruption.is_none() {
            for event in parser.flush() {
                if let Some(stop) = forward(&event, &detector, &mut interpreter, &self.tx).await {
                    interruption = Some(stop);
                    break;
                }
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let mut completion = Completion {
            success: false,
            cost_usd: interpreter.cost_usd(),
            duration_ms: interpreter.duration_ms().unwrap_or(elapsed),
            output: interpreter.output(),
            error: None,
            exit_code,
        };

        let terminal = match interruption {
            Some(Interruption::RateLimited(info)) => ExecutorMessage::RateLimited(info),
            Some(Interruption::Killed) | Some(Interruption::ReceiverGone) => {
                completion.error = Some("assistant was terminated".to_string());
                ExecutorMessage::Completed(completion)
            }
            None => match status {
                Ok(status) if status.success() => {
                    completion.success = !interpreter.result_error();
                    if !completion.success {
                        completion.error = Some("assistant reported an error result".to_string());
                    }
                    ExecutorMessage::Completed(completion)
                }
                Ok(status) => {
                    let combined = format!("{}\n{}", String::from_utf8_lossy(&raw_stdout), stderr_text);
                    let info = detector.check_text(&combined);
                    if info.detected {
                        ExecutorMessage::RateLimited(info)
                    } else {
                        completion.error = Some(describe_failure(status.code(), &stderr_text));
                        ExecutorMessage::Completed(completion)
                    }
                }
                Err(e) => {
                    completion.error = Some(format!("failed to wait for assistant: {}", e));
                    ExecutorMessage::Completed(completion)
                }
            },
        };

        tracing::info!(
            exit_code = ?exit_code,
            duration_ms = elapsed,
            rate_limited = matches!(terminal, ExecutorMessage::RateLimited(_)),
            "assistant finished"
        );

        self.shared.finish();
        if self.tx.send(terminal).await.is_err() {
            tracing::debug!("invocation receiver dropped before completion");
        }
    }
}

/// Checks and forwards one record; returns why reading should stop, if it should.
async fn forward(
    event: &StreamEvent,
    detector: &RateLimitDetector,
    interpreter: &mut StreamInterpreter,
    tx: &mpsc::Sender<ExecutorMessage>,
) -> Option<Interruption> {
    let info = detector.check_event(event);
    if info.detected {
        tracing::warn!(message = %info.message, "rate limit signalled in stream");
        return Some(Interruption::RateLimited(info));
    }

    for agent_event in interpreter.interpret(event) {
        if tx.send(ExecutorMessage::Event(agent_event)).await.is_err() {
            tracing::warn!("output receiver dropped");
            return Some(Interruption::ReceiverGone);
        }
    }
    None
}

/// Graceful termination: SIGTERM, then a forced kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(grace_ms = grace.as_millis() as u64, "assistant ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            tracing::error!(error = %e, "failed to kill assistant");
        }
    }
}

fn describe_failure(code: Option<i32>, stderr: &str) -> String {
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    match code {
        Some(code) if tail.is_empty() => format!("assistant exited with code {}", code),
        Some(code) => format!("assistant exited with code {}: {}", code, tail.join("\n")),
        None => "assistant was killed by a signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_binary_used_as_is() {
        let executor = SubprocessExecutor::new(ExecutorConfig::new("/opt/tools/claude", vec![]));
        assert_eq!(
            executor.resolve_binary().unwrap(),
            PathBuf::from("/opt/tools/claude")
        );
    }

    #[test]
    fn unknown_bare_name_fails_fast() {
        let executor = SubprocessExecutor::new(ExecutorConfig::new(
            "definitely-not-an-installed-assistant-xyz",
            vec![],
        ));
        assert!(matches!(
            executor.resolve_binary(),
            Err(Error::BinaryNotFound(name)) if name == "definitely-not-an-installed-assistant-xyz"
        ));
    }

    #[cfg(unix)]
    #[test]
    fn bare_name_resolves_on_path() {
        let executor = SubprocessExecutor::new(ExecutorConfig::new("sh", vec![]));
        let resolved = executor.resolve_binary().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn describe_failure_includes_stderr_tail() {
        let msg = describe_failure(Some(2), "line1\nline2\n");
        assert!(msg.contains("code 2"));
        assert!(msg.contains("line2"));
        assert_eq!(describe_failure(None, ""), "assistant was killed by a signal");
    }

    #[test]
    fn executor_starts_idle() {
        let executor = SubprocessExecutor::new(ExecutorConfig::claude("claude", None));
        assert!(!executor.is_running());
        executor.kill();
        assert!(!executor.is_running());
    }
}
