//! Scripted agent invoker for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::runner::{AgentInvocation, AgentInvoker, AgentOutput};

/// Returns canned outputs in order and records every invocation. When the
/// script runs out, further invocations return an empty success.
#[derive(Default)]
pub struct MockInvoker {
    responses: Mutex<VecDeque<AgentOutput>>,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

/// The parts of an invocation worth asserting on.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub working_dir: std::path::PathBuf,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<AgentOutput>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, output: AgentOutput) {
        self.responses.lock().unwrap().push_back(output);
    }

    /// A success response whose output is the given text.
    pub fn text_response(text: &str) -> AgentOutput {
        AgentOutput {
            success: true,
            output: text.to_string(),
            input_tokens: 100,
            output_tokens: 40,
            total_cost: 0.001,
            ..Default::default()
        }
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        self.invocations.lock().unwrap().push(RecordedInvocation {
            prompt: invocation.prompt.clone(),
            system_prompt: invocation.system_prompt.clone(),
            model: invocation.model.clone(),
            working_dir: invocation.working_dir.clone(),
        });
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or(AgentOutput {
            success: true,
            ..Default::default()
        }))
    }
}
