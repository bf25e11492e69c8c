//! Agent ReAct control loop (C8, spec.md §4.6).
//!
//! Grounded on the teacher's `llm::helpers::chat_loop_with_tools` — a
//! loop around `ChatLoopHandle::next()` that dispatches tool calls and
//! feeds results back — generalized here to add permission gating, the
//! mutation classifier (C6), meta-command interception, and the trace
//! journal. Where the teacher's loop drives itself to completion with
//! callbacks, this one parks at each permission decision and hands
//! control back to the caller (the same "park, hand back, resume"
//! pattern `GatewayChat::send` uses for tool calls one level down).
//!
//! Two control-flow modes share this state machine:
//! - native function calling, which drives `ChatSession::send` and reads
//!   `Part::FunctionCalls` back off the response;
//! - the Tool-Use Shim (C9, spec.md §4.7), for backends with no native
//!   function calling, which instead renders a fenced-JSON prompt via
//!   [`crate::shim::PromptTemplate`], parses a
//!   [`crate::shim::ReActResponse`] back out of plain text, and feeds
//!   tool output back in as an `Observation from <tool>:` block.

pub mod journal;

pub use journal::Journal;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::provider::gateway::{ChatSession, SendContent};
use crate::provider::{ChatResponse, FunctionCall, FunctionCallResult, Part, ProviderError};
use crate::safety::Mutation;
use crate::shim::{self, PromptTemplate};
use crate::tools::{ToolContext, ToolRegistry};

/// Commands intercepted before the LLM ever sees the user's turn
/// (spec.md §4.6). These never invoke a tool or consume an LLM call; the
/// agent can't render all of them on its own (e.g. `model`/`session`
/// need provider/session bookkeeping it doesn't own), so it reports
/// which one fired and leaves rendering to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaCommand {
    Reset,
    Clear,
    Exit,
    Model,
    Models,
    Tools,
    Version,
    Session,
    Sessions,
}

impl MetaCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "reset" => Some(Self::Reset),
            "clear" => Some(Self::Clear),
            "exit" | "quit" => Some(Self::Exit),
            "model" => Some(Self::Model),
            "models" => Some(Self::Models),
            "tools" => Some(Self::Tools),
            "version" => Some(Self::Version),
            "session" => Some(Self::Session),
            "sessions" => Some(Self::Sessions),
            _ => None,
        }
    }
}

/// A user's answer to a mutating-call prompt (spec.md §4.6's
/// `{yes, yes-and-remember, no}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    AllowAndRemember,
    Deny,
}

/// What the agent is asking its caller to decide.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub command: String,
}

/// What the caller should do next after feeding the agent a turn.
pub enum AgentStep {
    /// `[done]`: render this text and wait for the next user turn.
    FinalAnswer(String),
    /// A meta command was intercepted; the caller renders it.
    Meta(MetaCommand),
    /// `[awaiting-permission]`: ask the user, then call
    /// [`Agent::resolve_permission`].
    PermissionRequest(PermissionRequest),
    /// `[failed]`: the iteration cap was exceeded.
    Failed(String),
    /// `[exited]`: cancelled mid-turn.
    Exited,
}

struct PendingCall {
    call: FunctionCall,
    mutation: Mutation,
}

fn extract_function_calls(response: &ChatResponse) -> Vec<FunctionCall> {
    response
        .candidates
        .first()
        .map(|candidate| {
            candidate
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::FunctionCalls(calls) => Some(calls.clone()),
                    Part::Text(_) => None,
                })
                .flatten()
                .collect()
        })
        .unwrap_or_default()
}

fn describe_call(call: &FunctionCall) -> String {
    call.arguments
        .get("command")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| call.arguments.to_string())
}

/// One interactive session's worth of agent state. Not internally
/// parallel — a single `tokio` task owns one `Agent` (spec.md §5).
pub struct Agent {
    chat: Box<dyn ChatSession>,
    registry: ToolRegistry,
    ctx: ToolContext,
    journal: Arc<Journal>,
    max_iterations: usize,
    skip_permissions: bool,
    iteration: usize,
    cancel: CancellationToken,

    // Native function-calling mode state (§4.6).
    pending_round: Vec<PendingCall>,
    pending_index: usize,
    collected_results: Vec<FunctionCallResult>,

    // Tool-Use Shim mode state (C9, §4.7). `shim_template` is `Some` iff
    // the agent was built with shim mode enabled; its presence, not a
    // separate bool, is what `handle_input` branches on.
    shim_template: Option<PromptTemplate>,
    shim_query: Option<String>,
    shim_observations: Vec<String>,
    shim_pending: Option<PendingCall>,
}

impl Agent {
    pub fn new(
        chat: Box<dyn ChatSession>,
        registry: ToolRegistry,
        ctx: ToolContext,
        journal: Arc<Journal>,
        max_iterations: usize,
        skip_permissions: bool,
        cancel: CancellationToken,
    ) -> Self {
        chat.set_function_definitions(registry.function_definitions());
        Self {
            chat,
            registry,
            ctx,
            journal,
            max_iterations,
            skip_permissions,
            iteration: 0,
            cancel,
            pending_round: Vec::new(),
            pending_index: 0,
            collected_results: Vec::new(),
            shim_template: None,
            shim_query: None,
            shim_observations: Vec::new(),
            shim_pending: None,
        }
    }

    /// Switches the agent into Tool-Use Shim mode (spec.md §4.7): every
    /// turn renders `template` instead of relying on native function
    /// calling. Callers pick `template` via `PromptTemplate::default()`
    /// or `PromptTemplate::from_file` (spec.md §6
    /// `prompt-template-file-path`), optionally chained with
    /// `with_strict_json_directive_for` for dialects that need it.
    pub fn with_shim(mut self, template: PromptTemplate) -> Self {
        self.shim_template = Some(template);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.registry.tool_names()
    }

    /// `[idle] --user input--> [thinking]`. Intercepts meta commands
    /// first; everything else goes to the LLM, through whichever mode
    /// this agent was built with.
    pub async fn handle_input(&mut self, input: &str) -> Result<AgentStep, ProviderError> {
        if let Some(meta) = MetaCommand::parse(input) {
            if meta == MetaCommand::Reset || meta == MetaCommand::Clear {
                self.iteration = 0;
                self.shim_observations.clear();
            }
            return Ok(AgentStep::Meta(meta));
        }

        if self.shim_template.is_some() {
            self.shim_query = Some(input.to_string());
            return self.advance_shim().await;
        }

        self.advance(vec![SendContent::Text(input.to_string())]).await
    }

    /// Resolves a pending `[awaiting-permission]` state, from either mode.
    pub async fn resolve_permission(&mut self, decision: PermissionDecision) -> Result<AgentStep, ProviderError> {
        if self.shim_pending.is_some() {
            return self.resolve_shim_permission(decision).await;
        }

        if self.pending_index >= self.pending_round.len() {
            return Err(ProviderError::WireProtocol("no permission request is pending".to_string()));
        }
        match decision {
            PermissionDecision::Deny => {
                let call = &self.pending_round[self.pending_index].call;
                self.collected_results.push(FunctionCallResult::from_text(&call.id, &call.name, "user declined", true));
                self.pending_index += 1;
            }
            PermissionDecision::Allow => {
                self.execute_current().await;
                self.pending_index += 1;
            }
            PermissionDecision::AllowAndRemember => {
                self.skip_permissions = true;
                self.execute_current().await;
                self.pending_index += 1;
            }
        }

        match self.drive_pending_round().await? {
            Some(step) => Ok(step),
            None => {
                let results = std::mem::take(&mut self.collected_results);
                let contents = results.into_iter().map(SendContent::from).collect();
                self.advance(contents).await
            }
        }
    }

    /// Native function-calling turn loop. A single `async fn` owns the
    /// "call the LLM, dispatch any tool calls, call the LLM again"
    /// cycle so the LLM round trip never needs to call back into this
    /// function from another one — `drive_pending_round` below is a
    /// leaf helper, not a co-recursive partner.
    async fn advance(&mut self, mut contents: Vec<SendContent>) -> Result<AgentStep, ProviderError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(AgentStep::Exited);
            }
            self.journal.llm_request(json!({"contents": contents.len()}));
            let response = self.chat.send(contents).await;
            self.journal.llm_response(json!({"ok": response.is_ok()}));
            let response = response?;

            let calls = extract_function_calls(&response);
            if calls.is_empty() {
                return Ok(AgentStep::FinalAnswer(response.first_candidate_text()));
            }

            self.iteration += 1;
            if self.iteration > self.max_iterations {
                return Ok(AgentStep::Failed(format!(
                    "sorry, I couldn't finish this within {} iterations",
                    self.max_iterations
                )));
            }

            self.pending_round = calls
                .into_iter()
                .map(|call| {
                    let mutation = self
                        .registry
                        .get(&call.name)
                        .map(|tool| tool.classify_mutation(&call.arguments))
                        .unwrap_or(Mutation::Unknown);
                    PendingCall { call, mutation }
                })
                .collect();
            self.pending_index = 0;
            self.collected_results.clear();

            match self.drive_pending_round().await? {
                Some(step) => return Ok(step),
                None => {
                    let results = std::mem::take(&mut self.collected_results);
                    contents = results.into_iter().map(SendContent::from).collect();
                }
            }
        }
    }

    /// `[dispatch]`: walk the pending calls sequentially (spec.md §5:
    /// "dispatched sequentially, not in parallel"), stopping to ask
    /// permission for the first mutating one it meets. Returns
    /// `Some(step)` to pause (permission request or cancellation),
    /// `None` once every call in the round has been dispatched.
    async fn drive_pending_round(&mut self) -> Result<Option<AgentStep>, ProviderError> {
        while self.pending_index < self.pending_round.len() {
            if self.cancel.is_cancelled() {
                return Ok(Some(AgentStep::Exited));
            }

            let pending = &self.pending_round[self.pending_index];
            let call = pending.call.clone();
            let mutation = pending.mutation;

            if let Some(tool) = self.registry.get(&call.name) {
                if let Some(reason) = tool.is_interactive(&call.arguments) {
                    self.collected_results.push(FunctionCallResult::from_text(&call.id, &call.name, reason, true));
                    self.pending_index += 1;
                    continue;
                }
            }

            if mutation.is_mutating() && !self.skip_permissions {
                return Ok(Some(AgentStep::PermissionRequest(PermissionRequest {
                    tool_name: call.name.clone(),
                    command: describe_call(&call),
                })));
            }

            self.execute_current().await;
            self.pending_index += 1;
        }

        Ok(None)
    }

    async fn execute_current(&mut self) {
        let call = self.pending_round[self.pending_index].call.clone();
        crate::log(format!("agent: dispatching '{}'", call.name));
        let correlation_id = Uuid::new_v4().to_string();
        self.journal.tool_request(&correlation_id, json!({"name": call.name, "arguments": call.arguments}));

        let result = match self.registry.execute(&self.ctx, &call).await {
            Some(result) => result,
            None => FunctionCallResult::from_text(&call.id, &call.name, format!("tool '{}' is not registered", call.name), true),
        };

        self.journal.tool_response(&correlation_id, json!({"is_error": result.is_error, "result": result.result}));
        self.collected_results.push(result);
    }

    // ------------------------------------------------------------------
    // Tool-Use Shim mode (C9, spec.md §4.7)
    // ------------------------------------------------------------------

    fn push_shim_observation(&mut self, tool_name: &str, text: &str) {
        self.shim_observations.push(format!("Observation from {tool_name}: {text}"));
    }

    /// Renders the prompt, asks the LLM for a `ReActResponse`, and acts
    /// on it: a final answer stops the turn, an action dispatches a tool
    /// and loops back for another round, and a parse failure appends an
    /// observation describing the failure and retries the next
    /// iteration (spec.md §4.7 step 3), all bounded by the same
    /// iteration cap native mode uses.
    async fn advance_shim(&mut self) -> Result<AgentStep, ProviderError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(AgentStep::Exited);
            }

            let query = self.shim_query.clone().unwrap_or_default();
            let tool_names = self.registry.tool_names();
            let template = self
                .shim_template
                .as_ref()
                .expect("advance_shim is only reachable once with_shim has set a template")
                .clone();
            let prompt = template.render(&query, &self.shim_observations, &tool_names);

            self.journal.llm_request(json!({"shim_prompt_len": prompt.len()}));
            let response = self.chat.send(vec![SendContent::Text(prompt)]).await;
            self.journal.llm_response(json!({"ok": response.is_ok()}));
            let text = response?.first_candidate_text();

            let parsed = match shim::parse_react_response(&text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.iteration += 1;
                    if self.iteration > self.max_iterations {
                        return Ok(AgentStep::Failed(format!(
                            "sorry, I couldn't finish this within {} iterations",
                            self.max_iterations
                        )));
                    }
                    self.shim_observations.push(format!("parse error: {err}"));
                    continue;
                }
            };

            if let Some(answer) = parsed.answer {
                return Ok(AgentStep::FinalAnswer(answer));
            }

            let Some(action) = parsed.action else {
                self.iteration += 1;
                if self.iteration > self.max_iterations {
                    return Ok(AgentStep::Failed(format!(
                        "sorry, I couldn't finish this within {} iterations",
                        self.max_iterations
                    )));
                }
                self.shim_observations.push("parse error: response had neither action nor answer".to_string());
                continue;
            };

            self.iteration += 1;
            if self.iteration > self.max_iterations {
                return Ok(AgentStep::Failed(format!(
                    "sorry, I couldn't finish this within {} iterations",
                    self.max_iterations
                )));
            }

            let call = shim::synthesize_function_call(&action);
            let mutation = self
                .registry
                .get(&call.name)
                .map(|tool| tool.classify_mutation(&call.arguments))
                .unwrap_or(Mutation::Unknown);
            self.shim_pending = Some(PendingCall { call, mutation });

            match self.drive_shim_pending().await? {
                Some(step) => return Ok(step),
                None => continue,
            }
        }
    }

    /// Gates and, if allowed, runs the one synthesized call currently
    /// parked in `shim_pending`, pushing its result back as an
    /// `Observation from <tool>:` block (spec.md §4.7 step 5, §8
    /// scenario 5). Returns `Some(step)` to pause for permission,
    /// `None` once the action has been resolved one way or another and
    /// `advance_shim` should loop for the next round.
    async fn drive_shim_pending(&mut self) -> Result<Option<AgentStep>, ProviderError> {
        let pending = self.shim_pending.as_ref().expect("drive_shim_pending only called with a pending action");
        let call = pending.call.clone();
        let mutation = pending.mutation;

        if let Some(tool) = self.registry.get(&call.name) {
            if let Some(reason) = tool.is_interactive(&call.arguments) {
                self.shim_pending = None;
                self.push_shim_observation(&call.name, &reason);
                return Ok(None);
            }
        } else {
            self.shim_pending = None;
            self.push_shim_observation(&call.name, &format!("tool '{}' is not registered", call.name));
            return Ok(None);
        }

        if mutation.is_mutating() && !self.skip_permissions {
            return Ok(Some(AgentStep::PermissionRequest(PermissionRequest {
                tool_name: call.name.clone(),
                command: describe_call(&call),
            })));
        }

        self.execute_shim_pending().await;
        Ok(None)
    }

    async fn execute_shim_pending(&mut self) {
        let Some(pending) = self.shim_pending.take() else {
            return;
        };
        let call = pending.call;
        crate::log(format!("agent: dispatching '{}' via the tool-use shim", call.name));
        let correlation_id = Uuid::new_v4().to_string();
        self.journal.tool_request(&correlation_id, json!({"name": call.name, "arguments": call.arguments}));

        let result = match self.registry.execute(&self.ctx, &call).await {
            Some(result) => result,
            None => FunctionCallResult::from_text(&call.id, &call.name, format!("tool '{}' is not registered", call.name), true),
        };

        self.journal.tool_response(&correlation_id, json!({"is_error": result.is_error, "result": result.result}));
        let text = result.result_text();
        self.push_shim_observation(&call.name, &text);
    }

    async fn resolve_shim_permission(&mut self, decision: PermissionDecision) -> Result<AgentStep, ProviderError> {
        match decision {
            PermissionDecision::Deny => {
                let call = &self.shim_pending.as_ref().expect("resolve_shim_permission only called with a pending action").call;
                let tool_name = call.name.clone();
                self.shim_pending = None;
                self.push_shim_observation(&tool_name, "user declined");
            }
            PermissionDecision::Allow => {
                self.execute_shim_pending().await;
            }
            PermissionDecision::AllowAndRemember => {
                self.skip_permissions = true;
                self.execute_shim_pending().await;
            }
        }
        self.advance_shim().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::gateway::ChatSession;
    use crate::provider::{Candidate, FinishReason, FunctionDefinition, Message, StreamChunk, TokenUsage};
    use futures::Stream;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[test]
    fn meta_commands_are_recognized() {
        assert_eq!(MetaCommand::parse("reset"), Some(MetaCommand::Reset));
        assert_eq!(MetaCommand::parse("quit"), Some(MetaCommand::Exit));
        assert_eq!(MetaCommand::parse("exit"), Some(MetaCommand::Exit));
        assert_eq!(MetaCommand::parse("list pods"), None);
    }

    #[test]
    fn describe_call_prefers_command_argument() {
        let call = FunctionCall {
            id: "1".to_string(),
            name: "kubectl".to_string(),
            arguments: serde_json::json!({"command": "kubectl get pods"}),
        };
        assert_eq!(describe_call(&call), "kubectl get pods");
    }

    #[test]
    fn describe_call_falls_back_to_raw_arguments() {
        let call = FunctionCall {
            id: "1".to_string(),
            name: "scan_image_with_trivy".to_string(),
            arguments: serde_json::json!({"image": "nginx:1.25"}),
        };
        assert_eq!(describe_call(&call), r#"{"image":"nginx:1.25"}"#);
    }

    /// A `ChatSession` whose `send` pops the next response off a fixed
    /// script, in order. Good enough to drive the shim loop end to end
    /// without a real backend.
    struct ScriptedChat {
        responses: Mutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedChat {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatSession for ScriptedChat {
        async fn send(&self, _contents: Vec<SendContent>) -> Result<ChatResponse, ProviderError> {
            let text = self.responses.lock().unwrap().pop_front().unwrap_or_default();
            Ok(ChatResponse {
                candidates: vec![Candidate { parts: vec![Part::Text(text)] }],
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
            })
        }

        async fn send_streaming(
            &self,
            _contents: Vec<SendContent>,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
            unimplemented!("not exercised by these tests")
        }

        fn set_function_definitions(&self, _defs: Vec<FunctionDefinition>) {}

        fn is_retryable_error(&self, _err: &ProviderError) -> bool {
            false
        }

        fn history(&self) -> Vec<Message> {
            Vec::new()
        }
    }

    fn shim_agent(responses: Vec<&str>, max_iterations: usize) -> Agent {
        let registry = ToolRegistry::new().register_builtin();
        let ctx = ToolContext::new(std::env::temp_dir());
        let journal = Arc::new(Journal::discard());
        Agent::new(
            Box::new(ScriptedChat::new(responses)),
            registry,
            ctx,
            journal,
            max_iterations,
            false,
            CancellationToken::new(),
        )
        .with_shim(PromptTemplate::default())
    }

    #[tokio::test]
    async fn shim_runs_a_tool_then_returns_the_final_answer() {
        let mut agent = shim_agent(
            vec![
                "```json\n{\"thought\": \"need pods\", \"action\": {\"name\": \"bash\", \"input\": \"echo hi\"}}\n```",
                "```json\n{\"thought\": \"done\", \"answer\": \"ok\"}\n```",
            ],
            5,
        );

        let step = agent.handle_input("list pods").await.unwrap();
        match step {
            AgentStep::FinalAnswer(text) => assert_eq!(text, "ok"),
            _ => panic!("expected a final answer once the script runs out of actions"),
        }

        assert_eq!(agent.shim_observations.len(), 1);
        assert!(agent.shim_observations[0].starts_with("Observation from bash: "));
    }

    #[tokio::test]
    async fn shim_parse_failures_feed_back_as_observations_and_retry() {
        let mut agent = shim_agent(
            vec![
                "no fence at all",
                "```json\n{\"answer\": \"recovered\"}\n```",
            ],
            5,
        );

        let step = agent.handle_input("list pods").await.unwrap();
        match step {
            AgentStep::FinalAnswer(text) => assert_eq!(text, "recovered"),
            _ => panic!("expected the second, well-formed response to win"),
        }
        assert!(agent.shim_observations[0].starts_with("parse error:"));
    }

    #[tokio::test]
    async fn shim_mutating_action_pauses_for_permission() {
        let mut agent = shim_agent(
            vec!["```json\n{\"thought\": \"delete it\", \"action\": {\"name\": \"kubectl\", \"input\": \"kubectl delete pod foo\"}}\n```"],
            5,
        );

        let step = agent.handle_input("delete foo").await.unwrap();
        match step {
            AgentStep::PermissionRequest(req) => {
                assert_eq!(req.tool_name, "kubectl");
                assert_eq!(req.command, "kubectl delete pod foo");
            }
            _ => panic!("expected a mutating shim action to pause for permission"),
        }
        assert!(agent.shim_pending.is_some());
    }

    #[tokio::test]
    async fn shim_exceeding_iteration_cap_fails() {
        let responses = vec!["no fence at all"; 3];
        let mut agent = shim_agent(responses, 2);

        let step = agent.handle_input("list pods").await.unwrap();
        match step {
            AgentStep::Failed(text) => assert!(text.contains("2 iterations")),
            _ => panic!("expected the iteration cap to trip"),
        }
    }
}
