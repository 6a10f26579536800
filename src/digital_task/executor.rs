// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The executor contract a digital task runs under. The agent itself is an
//! external collaborator (an LLM with tool access) represented here only as
//! a trait boundary; this module owns the MCP-only -> web/exec ->
//! tool-optional retry ladder described for the digital-task service.

use async_trait::async_trait;

/// Sentinel the agent returns when it had tools available but declined to
/// use any of them.
pub const NO_TOOL_USED: &str = "NO_TOOL_USED";
/// Sentinel (may appear as a substring of the agent's output) signaling the
/// MCP-only toolset could not satisfy the goal and a broader toolset is
/// required.
pub const MCP_FALLBACK_REQUIRED: &str = "MCP_FALLBACK_REQUIRED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsetTier {
    McpOnly,
    WebExec,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub goal: String,
    pub session_id: String,
    pub toolset: ToolsetTier,
    pub require_tool_use: bool,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub text: String,
    pub execution_path: Vec<String>,
    pub allowed_tools: Vec<String>,
}

/// The external LLM/tool-calling collaborator. Production wiring wraps
/// whatever agent runtime is configured; tests use a canned implementation.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn complete(&self, request: AgentRequest) -> anyhow::Result<AgentOutput>;
}

/// Absent by default; every call fails so the task ends up `failed` rather
/// than hanging until its timeout.
pub struct NullAgentClient;

#[async_trait]
impl AgentClient for NullAgentClient {
    async fn complete(&self, _request: AgentRequest) -> anyhow::Result<AgentOutput> {
        anyhow::bail!("no agent backend configured for digital tasks")
    }
}

fn needs_fallback(output: &AgentOutput) -> bool {
    output.text.trim().is_empty()
        || output.text.trim() == NO_TOOL_USED
        || output.text.contains(MCP_FALLBACK_REQUIRED)
}

/// Run the goal through the MCP-only -> web/exec -> tool-optional ladder.
///
/// 1. MCP-only tools with the MCP prompt.
/// 2. If that output is empty, `NO_TOOL_USED`, or mentions
///    `MCP_FALLBACK_REQUIRED`, retry with the web/exec toolset.
/// 3. If that also comes back `NO_TOOL_USED`, retry once more with
///    `require_tool_use=false`.
pub async fn run_ladder(
    agent: &dyn AgentClient,
    goal: &str,
    session_id: &str,
) -> anyhow::Result<AgentOutput> {
    let first = agent
        .complete(AgentRequest {
            goal: goal.to_owned(),
            session_id: session_id.to_owned(),
            toolset: ToolsetTier::McpOnly,
            require_tool_use: true,
        })
        .await?;
    if !needs_fallback(&first) {
        return Ok(first);
    }

    let second = agent
        .complete(AgentRequest {
            goal: goal.to_owned(),
            session_id: session_id.to_owned(),
            toolset: ToolsetTier::WebExec,
            require_tool_use: true,
        })
        .await?;
    if second.text.trim() != NO_TOOL_USED {
        return Ok(second);
    }

    agent
        .complete(AgentRequest {
            goal: goal.to_owned(),
            session_id: session_id.to_owned(),
            toolset: ToolsetTier::WebExec,
            require_tool_use: false,
        })
        .await
}

#[cfg(test)]
mod executor_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedAgent {
        responses: Mutex<Vec<AgentOutput>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for ScriptedAgent {
        async fn complete(&self, _request: AgentRequest) -> anyhow::Result<AgentOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.remove(0))
        }
    }

    fn output(text: &str) -> AgentOutput {
        AgentOutput { text: text.to_owned(), execution_path: vec![], allowed_tools: vec![] }
    }

    #[tokio::test]
    async fn mcp_only_success_short_circuits() {
        let agent = ScriptedAgent { responses: Mutex::new(vec![output("done")]), calls: AtomicUsize::new(0) };
        let out = run_ladder(&agent, "goal", "s1").await.unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_output_falls_back_to_web_exec() {
        let agent = ScriptedAgent {
            responses: Mutex::new(vec![output(""), output("found it via web search")]),
            calls: AtomicUsize::new(0),
        };
        let out = run_ladder(&agent, "goal", "s1").await.unwrap();
        assert_eq!(out.text, "found it via web search");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_tool_used_twice_retries_without_forcing_tool_use() {
        let agent = ScriptedAgent {
            responses: Mutex::new(vec![output(NO_TOOL_USED), output(NO_TOOL_USED), output("plain answer")]),
            calls: AtomicUsize::new(0),
        };
        let out = run_ladder(&agent, "goal", "s1").await.unwrap();
        assert_eq!(out.text, "plain answer");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn mcp_fallback_required_substring_triggers_web_exec() {
        let agent = ScriptedAgent {
            responses: Mutex::new(vec![
                output("need more: MCP_FALLBACK_REQUIRED"),
                output("resolved with broader tools"),
            ]),
            calls: AtomicUsize::new(0),
        };
        let out = run_ladder(&agent, "goal", "s1").await.unwrap();
        assert_eq!(out.text, "resolved with broader tools");
    }
}
