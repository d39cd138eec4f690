use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use moka::sync::Cache;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::caller::{Caller, Reducer, Source, SystemPromptOp, ToolResult};
use crate::error::BridgeError;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionMessage, ChatCompletionRequest, ChatCompletionResponse,
    InvokeResponse, Tool, ToolCall, ToolMessage, Usage, FINISH_REASON_TOOL_CALLS, ROLE_ASSISTANT,
    ROLE_SYSTEM,
};
use crate::provider::LlmProvider;
use crate::registry::Metadata;

/// Builds an unconnected outbound endpoint for a credential.
pub type SourceBuilder = Arc<dyn Fn(&str) -> Arc<dyn Source> + Send + Sync>;
/// Builds an unconnected inbound endpoint for a credential.
pub type ReducerBuilder = Arc<dyn Fn(&str) -> Box<dyn Reducer> + Send + Sync>;
/// Exchanges a credential for its metadata.
pub type MetadataExchanger = Arc<dyn Fn(&str) -> Result<Metadata> + Send + Sync>;

pub struct ServiceOptions {
    pub caller_cache_size: u64,
    /// `None` disables idle expiry.
    pub caller_cache_ttl: Option<Duration>,
    /// Deadline for awaiting worker replies in one dispatch.
    pub caller_call_timeout: Duration,
    pub source_builder: SourceBuilder,
    pub reducer_builder: ReducerBuilder,
    pub metadata_exchanger: MetadataExchanger,
}

/// One event on the way back to the client.
///
/// Streamed requests see `Chunk`/`ToolCalls`/`ToolResults` and a final
/// `Done`; non-streaming requests see a single `Completion`.
#[derive(Debug)]
pub enum ChatEvent {
    Chunk(ChatCompletionChunk),
    /// Informational: tool calls about to be dispatched.
    ToolCalls(Vec<ToolCall>),
    /// Informational: gathered results, before the follow-up call.
    ToolResults(Vec<ToolResult>),
    Completion(Box<ChatCompletionResponse>),
    Error(String),
    Done,
}

/// Channel-backed writer the orchestrator streams events into.
///
/// A failed send means the client is gone; the orchestrator sees it as
/// `Cancelled` and stops without a follow-up call. Time-to-first-token
/// is recorded when the first chunk is flushed.
pub struct EventWriter {
    tx: mpsc::Sender<ChatEvent>,
    started: Instant,
    ttft_recorded: AtomicBool,
}

impl EventWriter {
    pub fn new(tx: mpsc::Sender<ChatEvent>) -> Self {
        Self {
            tx,
            started: Instant::now(),
            ttft_recorded: AtomicBool::new(false),
        }
    }

    pub async fn write(&self, event: ChatEvent) -> Result<(), BridgeError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| BridgeError::Cancelled)
    }

    async fn write_chunk(&self, chunk: ChatCompletionChunk) -> Result<(), BridgeError> {
        if !self.ttft_recorded.swap(true, Ordering::Relaxed) {
            debug!(
                ttft_ms = self.started.elapsed().as_millis() as u64,
                "First token flushed to client"
            );
        }
        self.write(ChatEvent::Chunk(chunk)).await
    }
}

/// Generates a 16-byte opaque identifier (32 hex chars).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The service layer of the bridge.
///
/// Stateless per request: composes the provider, the tool registry
/// reached through caller metadata, and the caller's dispatch fabric
/// into the two-phase completion flow.
pub struct Service {
    provider: Arc<dyn LlmProvider>,
    callers: Cache<String, Arc<Caller>>,
    options: ServiceOptions,
}

impl Service {
    pub fn new(provider: Arc<dyn LlmProvider>, options: ServiceOptions) -> Arc<Self> {
        let mut builder = Cache::builder()
            .max_capacity(options.caller_cache_size)
            // The hook must stay non-blocking; Caller::close only aborts
            // a task and drops channel ends.
            .eviction_listener(|_credential, caller: Arc<Caller>, _cause| caller.close());
        if let Some(ttl) = options.caller_cache_ttl {
            builder = builder.time_to_live(ttl);
        }
        Arc::new(Self {
            provider,
            callers: builder.build(),
            options,
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Loads the credential's caller from the LRU, or builds and caches
    /// a fresh one. A cached-but-closed caller (TTL raced with lookup)
    /// is replaced.
    pub fn load_or_create_caller(&self, credential: &str) -> Result<Arc<Caller>> {
        if let Some(caller) = self.callers.get(credential) {
            if !caller.is_closed() {
                return Ok(caller);
            }
        }
        let metadata = (self.options.metadata_exchanger)(credential)?;
        let caller = Caller::new(
            (self.options.source_builder)(credential),
            (self.options.reducer_builder)(credential),
            metadata,
            self.options.caller_call_timeout,
        );
        self.callers
            .insert(credential.to_string(), Arc::clone(&caller));
        Ok(caller)
    }

    /// Runs the two-phase chat completion, writing results into
    /// `writer` as OpenAI-compatible events.
    ///
    /// Phase one calls the provider with the tenant's tools attached
    /// (unless the client brought its own, which short-circuits to pure
    /// pass-through). If the model elects to call tools, they are
    /// dispatched through the caller and a follow-up completion is
    /// issued with one `tool` message per result.
    pub async fn get_chat_completions(
        &self,
        mut req: ChatCompletionRequest,
        trans_id: &str,
        caller: &Caller,
        writer: &EventWriter,
    ) -> Result<()> {
        let md = caller.metadata().clone();
        let tools = md.tools();

        let has_req_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
        if !has_req_tools && !tools.is_empty() {
            req.tools = Some(tools.clone());
        }

        let (prompt, op) = caller.system_prompt();
        op_system_prompt(&mut req, &prompt, op);

        let req_messages = req.messages.clone();
        let mut first_usage = Usage::default();
        let tool_calls: Vec<ToolCall>;
        let assistant_message: ChatCompletionMessage;

        if req.stream {
            let mut stream = self
                .provider
                .get_chat_completions_stream(req.clone(), &md)
                .instrument(info_span!("first_call", trans_id))
                .await?;

            let mut is_function_call = false;
            // Keyed by stream index: the id only shows up in the first
            // fragment of a call while arguments trickle in piecewise.
            let mut partial_calls: BTreeMap<u32, ToolCall> = BTreeMap::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if has_req_tools {
                    writer.write_chunk(chunk).await?;
                    continue;
                }
                if let Some(usage) = &chunk.usage {
                    first_usage = *usage;
                }

                let has_tool_delta = chunk
                    .choices
                    .first()
                    .is_some_and(|c| !c.delta.tool_calls.is_empty());
                if has_tool_delta {
                    is_function_call = true;
                    for delta in &chunk.choices[0].delta.tool_calls {
                        let index = delta.index.unwrap_or(0);
                        let entry = partial_calls.entry(index).or_default();
                        if let Some(id) = &delta.id {
                            if entry.id.is_empty() {
                                entry.id = id.clone();
                            }
                        }
                        if let Some(kind) = &delta.kind {
                            if entry.kind.is_empty() {
                                entry.kind = kind.clone();
                            }
                        }
                        if let Some(f) = &delta.function {
                            if let Some(name) = &f.name {
                                if entry.function.name.is_empty() {
                                    entry.function.name = name.clone();
                                }
                            }
                            if let Some(args) = &f.arguments {
                                entry.function.arguments.push_str(args);
                            }
                        }
                    }
                } else if !is_function_call {
                    writer.write_chunk(chunk).await?;
                }
            }

            if has_req_tools || !is_function_call {
                return writer.write(ChatEvent::Done).await.map_err(Into::into);
            }

            tool_calls = partial_calls.into_values().collect();
            assistant_message = ChatCompletionMessage {
                role: ROLE_ASSISTANT.to_string(),
                tool_calls: Some(tool_calls.clone()),
                ..Default::default()
            };
        } else {
            let resp = self
                .provider
                .get_chat_completions(req.clone(), &md)
                .instrument(info_span!("first_call", trans_id))
                .await?;
            if let Some(usage) = &resp.usage {
                first_usage = *usage;
            }
            let choice = resp
                .choices
                .first()
                .ok_or_else(|| anyhow!("provider returned no choices"))?;

            if choice.finish_reason.as_deref() == Some(FINISH_REASON_TOOL_CALLS) && !has_req_tools
            {
                tool_calls = choice.message.tool_calls.clone().unwrap_or_default();
                assistant_message = choice.message.clone();
            } else {
                return writer
                    .write(ChatEvent::Completion(Box::new(resp)))
                    .await
                    .map_err(Into::into);
            }
        }

        // Restrict dispatch to tools the tenant actually hosts.
        let fn_calls = find_tools(&tools, &tool_calls);
        writer.write(ChatEvent::ToolCalls(fn_calls.clone())).await?;

        let req_id = new_id();
        let call_result = caller
            .call(trans_id, &req_id, &fn_calls)
            .instrument(info_span!("run_sfn", trans_id))
            .await?;
        writer
            .write(ChatEvent::ToolResults(call_result.clone()))
            .await?;

        // Follow-up request: original messages + the assistant message
        // carrying the tool calls + one tool message per result.
        req.tool_choice = None;
        req.messages = req_messages;
        req.messages.push(assistant_message);
        for result in &call_result {
            if result.timed_out {
                debug!(
                    trans_id,
                    tool_call_id = %result.tool_call_id,
                    "Passing synthetic empty result for timed-out tool call"
                );
            }
            req.messages.push(ChatCompletionMessage::tool(
                result.tool_call_id.clone(),
                result.content.clone(),
            ));
        }
        if !self.provider.keeps_tools_on_followup() {
            req.tools = None;
        }

        if req.stream {
            let mut stream = self
                .provider
                .get_chat_completions_stream(req, &md)
                .instrument(info_span!("second_call", trans_id))
                .await?;
            while let Some(chunk) = stream.next().await {
                let mut chunk = chunk?;
                if let Some(usage) = &mut chunk.usage {
                    usage.add(&first_usage);
                }
                writer.write_chunk(chunk).await?;
            }
            writer.write(ChatEvent::Done).await.map_err(Into::into)
        } else {
            let mut resp = self
                .provider
                .get_chat_completions(req, &md)
                .instrument(info_span!("second_call", trans_id))
                .await?;
            match &mut resp.usage {
                Some(usage) => usage.add(&first_usage),
                None => resp.usage = Some(first_usage),
            }
            writer
                .write(ChatEvent::Completion(Box::new(resp)))
                .await
                .map_err(Into::into)
        }
    }

    /// Non-streaming invoke path: one instruction in, one answer out,
    /// with the tool dialogue run in between when the model asks for it.
    pub async fn get_invoke(
        &self,
        user_instruction: &str,
        base_system_message: &str,
        trans_id: &str,
        caller: &Caller,
        include_call_stack: bool,
    ) -> Result<InvokeResponse> {
        let md = caller.metadata().clone();
        let tools = md.tools();

        let chain = ChainMessage::default();
        let messages = prepare_messages(base_system_message, user_instruction, &chain, &tools, true);
        let mut req = ChatCompletionRequest {
            messages,
            ..Default::default()
        };
        if !tools.is_empty() {
            req.tools = Some(tools.clone());
        }

        let resp = self
            .provider
            .get_chat_completions(req, &md)
            .instrument(info_span!("first_call", trans_id))
            .await?;
        let first_usage = resp.usage.unwrap_or_default();

        let res = convert_to_invoke_response(&resp, &tools);
        // Content-only responses are a normal termination here.
        if res.finish_reason != FINISH_REASON_TOOL_CALLS {
            return Ok(res);
        }

        let assistant_message = resp.choices[0].message.clone();
        let tool_calls = res.tool_calls.clone();
        debug!(trans_id, calls = tool_calls.len(), "Running tool calls for invoke");

        let req_id = new_id();
        let call_result = caller
            .call(trans_id, &req_id, &tool_calls)
            .instrument(info_span!("run_sfn", trans_id))
            .await?;

        let chain = ChainMessage {
            preceding_assistant_message: Some(assistant_message),
            tool_messages: call_result
                .iter()
                .map(|r| ToolMessage {
                    role: "tool".to_string(),
                    content: r.content.clone(),
                    tool_call_id: r.tool_call_id.clone(),
                })
                .collect(),
        };

        // Tool descriptions are not repeated in the follow-up prompt.
        let messages = prepare_messages(base_system_message, user_instruction, &chain, &tools, false);
        let req = ChatCompletionRequest {
            messages,
            ..Default::default()
        };
        let mut resp = self
            .provider
            .get_chat_completions(req, &md)
            .instrument(info_span!("second_call", trans_id))
            .await?;
        match &mut resp.usage {
            Some(usage) => usage.add(&first_usage),
            None => resp.usage = Some(first_usage),
        }

        let mut res = convert_to_invoke_response(&resp, &tools);
        if include_call_stack {
            res.tool_calls = tool_calls;
            res.tool_messages = chain.tool_messages;
        }
        Ok(res)
    }
}

/// Preceding dialogue exposed on the invoke path.
#[derive(Debug, Default)]
pub struct ChainMessage {
    pub preceding_assistant_message: Option<ChatCompletionMessage>,
    pub tool_messages: Vec<ToolMessage>,
}

/// Applies the caller's system-prompt operation to the request.
///
/// At most one system message survives; second and subsequent system
/// messages are dropped.
pub fn op_system_prompt(req: &mut ChatCompletionRequest, sys_prompt: &str, op: SystemPromptOp) {
    if op == SystemPromptOp::Disabled {
        return;
    }
    if op == SystemPromptOp::Overwrite && sys_prompt.is_empty() {
        return;
    }

    let mut system_count = 0;
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        if msg.role != ROLE_SYSTEM {
            messages.push(msg.clone());
            continue;
        }
        if system_count == 0 {
            let content = match op {
                SystemPromptOp::Prefix => format!("{sys_prompt}\n{}", msg.content),
                SystemPromptOp::Overwrite => sys_prompt.to_string(),
                SystemPromptOp::Disabled => unreachable!(),
            };
            messages.push(ChatCompletionMessage {
                role: ROLE_SYSTEM.to_string(),
                content,
                ..Default::default()
            });
        }
        system_count += 1;
    }

    if system_count == 0 && !sys_prompt.is_empty() {
        messages.insert(0, ChatCompletionMessage::system(sys_prompt));
    }
    req.messages = messages;
}

/// Keeps only the calls whose `(name, type)` matches a hosted tool.
fn find_tools(tools: &[Tool], tool_calls: &[ToolCall]) -> Vec<ToolCall> {
    tool_calls
        .iter()
        .filter(|call| {
            tools
                .iter()
                .any(|t| t.function.name == call.function.name && t.kind == call.kind)
        })
        .cloned()
        .collect()
}

fn convert_to_invoke_response(resp: &ChatCompletionResponse, tools: &[Tool]) -> InvokeResponse {
    let Some(choice) = resp.choices.first() else {
        warn!("Provider response carried no choices");
        return InvokeResponse::default();
    };
    let finish_reason = choice.finish_reason.clone().unwrap_or_default();
    let tool_calls = if finish_reason == FINISH_REASON_TOOL_CALLS {
        find_tools(tools, choice.message.tool_calls.as_deref().unwrap_or(&[]))
    } else {
        Vec::new()
    };
    InvokeResponse {
        content: choice.message.content.clone(),
        finish_reason,
        tool_calls,
        tool_messages: Vec::new(),
        usage: resp.usage.unwrap_or_default(),
    }
}

/// Builds the invoke-path message list: system prompt (optionally
/// listing tool descriptions), the preceding tool dialogue, then the
/// user instruction.
fn prepare_messages(
    base_system_message: &str,
    user_instruction: &str,
    chain: &ChainMessage,
    tools: &[Tool],
    with_tools: bool,
) -> Vec<ChatCompletionMessage> {
    let mut instructions = String::from("## Instructions\n");
    if with_tools {
        for tool in tools {
            instructions.push_str("- ");
            instructions.push_str(&tool.function.description);
            instructions.push('\n');
        }
        instructions.push('\n');
    }
    let system_prompt = format!("{base_system_message}\n\n{instructions}");

    let mut messages = vec![ChatCompletionMessage::system(system_prompt)];
    if let Some(assistant) = &chain.preceding_assistant_message {
        messages.push(assistant.clone());
        for tool in &chain.tool_messages {
            messages.push(ChatCompletionMessage::tool(
                tool.tool_call_id.clone(),
                tool.content.clone(),
            ));
        }
    }
    messages.push(ChatCompletionMessage::user(user_instruction));
    messages
}
