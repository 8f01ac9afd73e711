//! A single invocation of the external coding-agent CLI.
//!
//! The runner spawns the agent binary with stream-json output, parses each
//! stdout line for token/cost/file-change events, and enforces a wall-clock
//! timeout and an output-size cap.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::stream::{
    is_write_tool, progress_snippet, tool_file_path, ContentBlock, StreamEvent,
};
use crate::errors::ConductorError;

/// Default per-invocation wall clock: 30 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Grace period between terminate and hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Runs exceeding this much accumulated output are terminated.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;
/// Length of assistant-text progress snippets.
const PROGRESS_SNIPPET_LEN: usize = 100;

/// Callback invoked with short progress snippets as the agent streams.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything needed for one agent invocation.
#[derive(Clone)]
pub struct AgentInvocation {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub timeout: Duration,
    pub on_progress: Option<ProgressFn>,
}

impl AgentInvocation {
    pub fn new(working_dir: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            prompt: prompt.into(),
            model: None,
            max_turns: None,
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            on_progress: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_turns(mut self, max_turns: Option<u32>) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.disallowed_tools = tools;
        self
    }

    pub fn with_progress(mut self, f: ProgressFn) -> Self {
        self.on_progress = Some(f);
        self
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// `true` iff the process exited zero and was not killed.
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub stderr: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub files_modified: Vec<String>,
    pub duration: Duration,
    pub timed_out: bool,
    pub output_truncated: bool,
}

/// Seam for components that invoke the agent, mockable in tests.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentOutput>;
}

/// Spawns the real agent CLI.
pub struct AgentRunner {
    agent_cmd: String,
}

impl AgentRunner {
    pub fn new(agent_cmd: impl Into<String>) -> Self {
        Self {
            agent_cmd: agent_cmd.into(),
        }
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Command {
        let mut cmd = Command::new(&self.agent_cmd);
        cmd.args([
            "--print",
            "--output-format",
            "stream-json",
            "--dangerously-skip-permissions",
        ]);
        if let Some(model) = &invocation.model {
            cmd.args(["--model", model]);
        }
        if let Some(max_turns) = invocation.max_turns {
            cmd.args(["--max-turns", &max_turns.to_string()]);
        }
        if let Some(system_prompt) = &invocation.system_prompt {
            cmd.args(["--system-prompt", system_prompt]);
        }
        if !invocation.allowed_tools.is_empty() {
            cmd.args(["--allowedTools", &invocation.allowed_tools.join(",")]);
        }
        if !invocation.disallowed_tools.is_empty() {
            cmd.args(["--disallowedTools", &invocation.disallowed_tools.join(",")]);
        }
        cmd.arg(&invocation.prompt);
        cmd.current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentInvoker for AgentRunner {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        let start = std::time::Instant::now();
        let mut cmd = self.build_command(&invocation);
        let mut child = cmd.spawn().map_err(ConductorError::SpawnFailed)?;

        let stdout = child.stdout.take().context("Failed to take agent stdout")?;
        let stderr = child.stderr.take().context("Failed to take agent stderr")?;

        // Drain stderr concurrently so the child cannot block on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::Instant::now() + invocation.timeout;

        let mut output = String::new();
        let mut files_modified: Vec<String> = Vec::new();
        let mut input_tokens: i64 = 0;
        let mut output_tokens: i64 = 0;
        let mut total_cost: f64 = 0.0;
        let mut timed_out = false;
        let mut output_truncated = false;

        loop {
            let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Err(_) => {
                    timed_out = true;
                    break;
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Agent stdout read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Result {
                    result,
                    usage,
                    total_cost_usd,
                    ..
                }) => {
                    if let Some(usage) = usage {
                        input_tokens = input_tokens.max(usage.total_input());
                        output_tokens = output_tokens.max(usage.output_tokens);
                    }
                    if let Some(cost) = total_cost_usd {
                        total_cost = total_cost.max(cost);
                    }
                    if let Some(text) = result {
                        output.push_str(&text);
                        output.push('\n');
                    }
                }
                Ok(StreamEvent::Usage {
                    input_tokens: di,
                    output_tokens: doy,
                    cost_usd,
                }) => {
                    input_tokens += di;
                    output_tokens += doy;
                    total_cost += cost_usd;
                }
                Ok(StreamEvent::Assistant { message, .. }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                if let Some(on_progress) = &invocation.on_progress {
                                    let snippet = progress_snippet(&text, PROGRESS_SNIPPET_LEN);
                                    if !snippet.is_empty() {
                                        on_progress(&snippet);
                                    }
                                }
                                output.push_str(&text);
                                output.push('\n');
                            }
                            ContentBlock::ToolUse { name, input, .. } => {
                                if is_write_tool(&name) {
                                    if let Some(path) = tool_file_path(&input) {
                                        if !files_modified.contains(&path) {
                                            files_modified.push(path);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(StreamEvent::ToolUse { name, input }) => {
                    if is_write_tool(&name) {
                        if let Some(path) = tool_file_path(&input) {
                            if !files_modified.contains(&path) {
                                files_modified.push(path);
                            }
                        }
                    }
                }
                Ok(StreamEvent::ToolResult { tool_name, file }) => {
                    if is_write_tool(&tool_name) {
                        if let Some(file) = file {
                            if !files_modified.contains(&file.file_path) {
                                files_modified.push(file.file_path);
                            }
                        }
                    }
                }
                Ok(StreamEvent::User { tool_use_result }) => {
                    if let Some(result) = tool_use_result {
                        if let Some(file) = result.file {
                            if !files_modified.contains(&file.file_path) {
                                files_modified.push(file.file_path);
                            }
                        }
                    }
                }
                Ok(StreamEvent::System { .. }) => {}
                Err(_) => {
                    // Not stream-json; keep the raw line for diagnostics.
                    output.push_str(&line);
                    output.push('\n');
                }
            }

            if output.len() > MAX_OUTPUT_SIZE {
                output_truncated = true;
                break;
            }
        }

        let killed = timed_out || output_truncated;
        let status = if killed {
            let _ = child.start_kill();
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    let _ = child.kill().await;
                    child.wait().await.ok()
                }
            }
        } else {
            Some(child.wait().await.context("Failed to wait for agent process")?)
        };

        let stderr_output = stderr_task.await.unwrap_or_default();
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let duration = start.elapsed();

        if timed_out {
            tracing::warn!(
                timeout_secs = invocation.timeout.as_secs(),
                "Agent run killed after wall-clock timeout"
            );
        }

        Ok(AgentOutput {
            success: exit_code == 0 && !killed,
            exit_code,
            output,
            stderr: stderr_output,
            input_tokens,
            output_tokens,
            total_cost,
            files_modified,
            duration,
            timed_out,
            output_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(prompt: &str) -> AgentInvocation {
        AgentInvocation::new("/tmp", prompt)
    }

    #[test]
    fn command_carries_base_flags_and_prompt_last() {
        let runner = AgentRunner::new("claude");
        let inv = invocation("do the thing")
            .with_model(Some("claude-sonnet-4-5".into()))
            .with_max_turns(Some(12))
            .with_system_prompt("be brief")
            .with_disallowed_tools(vec!["WebSearch".into()]);
        let cmd = runner.build_command(&inv);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--print");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"--max-turns".to_string()));
        assert!(args.contains(&"--disallowedTools".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("do the thing"));
    }

    #[test]
    fn optional_flags_are_omitted() {
        let runner = AgentRunner::new("claude");
        let cmd = runner.build_command(&invocation("p"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
        assert!(!args.contains(&"--system-prompt".to_string()));
    }

    #[tokio::test]
    async fn runs_a_plain_process_and_captures_output() {
        // `echo` is not a stream-json speaker; its line lands as raw output.
        let runner = AgentRunner::new("echo");
        let out = runner.invoke(invocation("hello-agent")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("hello-agent"));
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let runner = AgentRunner::new("false");
        let out = runner.invoke(invocation("")).await.unwrap();
        assert!(!out.success);
        assert_ne!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = AgentRunner::new("definitely-not-a-real-binary-xyz");
        let err = runner.invoke(invocation("p")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConductorError>(),
            Some(ConductorError::SpawnFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_run() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-agent.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = AgentRunner::new(script.to_string_lossy());
        let inv = AgentInvocation::new(dir.path(), "p").with_timeout(Duration::from_millis(200));
        let out = runner.invoke(inv).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
    }
}
