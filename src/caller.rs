use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{FunctionCallFrame, FunctionResultFrame};
use crate::error::BridgeError;
use crate::openai::ToolCall;
use crate::registry::Metadata;

/// Outbound half of a caller's worker-facing channel: writes function
/// call frames. Implementations serialize writes internally.
#[async_trait]
pub trait Source: Send + Sync {
    async fn write_call(&self, frame: FunctionCallFrame) -> Result<()>;
    /// Releases the endpoint. Must not block; slow transport teardown
    /// belongs on a worker task inside the implementation.
    fn close(&self);
}

/// Inbound half: yields function result frames until the transport
/// ends. Dropping the reducer releases its endpoint.
#[async_trait]
pub trait Reducer: Send {
    async fn next_result(&mut self) -> Option<FunctionResultFrame>;
}

/// How the caller's system prompt is applied to incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemPromptOp {
    #[default]
    Disabled,
    /// Prepend the prompt to the first system message.
    Prefix,
    /// Replace the first system message's content.
    Overwrite,
}

/// Result of one tool invocation, paired to its call by id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    /// Synthetic result minted because the worker missed the deadline.
    pub timed_out: bool,
}

impl ToolResult {
    fn synthetic(tool_call_id: &str, timed_out: bool) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: String::new(),
            timed_out,
        }
    }
}

struct Pending {
    tx: mpsc::Sender<FunctionResultFrame>,
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

/// Removes the pending entry on every exit path, including the request
/// future being dropped mid-await.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, Pending>>,
    req_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(self.req_id);
    }
}

/// Per-credential owner of one worker-facing channel pair.
///
/// The caller fans tool invocations out through its [`Source`], routes
/// replies arriving on its [`Reducer`] back to the awaiting dispatch by
/// `req_id`, and carries the tenant metadata and system-prompt slot.
/// Cached by credential; cache eviction calls [`Caller::close`].
pub struct Caller {
    source: Arc<dyn Source>,
    metadata: Metadata,
    call_timeout: Duration,
    pending: PendingTable,
    system_prompt: Mutex<(String, SystemPromptOp)>,
    reducer_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Caller {
    /// Wires both endpoints together and starts the reducer loop.
    pub fn new(
        source: Arc<dyn Source>,
        reducer: Box<dyn Reducer>,
        metadata: Metadata,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let reducer_task = tokio::spawn(reducer_loop(reducer, Arc::clone(&pending)));

        Arc::new(Self {
            source,
            metadata,
            call_timeout,
            pending,
            system_prompt: Mutex::new((String::new(), SystemPromptOp::Disabled)),
            reducer_task: Mutex::new(Some(reducer_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// The caller's authoritative metadata. Clone before use in a
    /// request; the cached copy must never be mutated.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>, op: SystemPromptOp) {
        *self.system_prompt.lock().unwrap() = (prompt.into(), op);
    }

    pub fn system_prompt(&self) -> (String, SystemPromptOp) {
        self.system_prompt.lock().unwrap().clone()
    }

    /// Dispatches `tool_calls` to their workers and gathers the replies.
    ///
    /// Every input call yields exactly one result, in input order:
    /// worker replies where they arrive in time, synthetic empty results
    /// for calls whose worker missed the `call_timeout` deadline or
    /// whose tool has no registered tag. Returns `CallerClosed` when the
    /// channel ends while a dispatch is pending.
    pub async fn call(
        &self,
        trans_id: &str,
        req_id: &str,
        tool_calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>, BridgeError> {
        if tool_calls.is_empty() {
            return Ok(Vec::new());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::CallerClosed);
        }

        let app_id = self.metadata.app_id().to_string();
        let tags: HashMap<String, u32> = self
            .metadata
            .tool_registry()
            .list(&app_id)
            .into_iter()
            .map(|(tag, def)| (def.name, tag))
            .collect();

        let (tx, mut rx) = mpsc::channel(tool_calls.len());
        self.pending
            .lock()
            .unwrap()
            .insert(req_id.to_string(), Pending { tx });
        let _guard = PendingGuard {
            pending: &self.pending,
            req_id,
        };

        // Calls without a registered tag cannot reach a worker; they
        // complete immediately with an empty result instead of burning
        // the deadline.
        let mut collected: HashMap<String, ToolResult> = HashMap::new();
        let mut waiting: HashSet<String> = HashSet::new();
        let metadata_bytes = self.metadata.to_frame_bytes();

        for tc in tool_calls {
            let Some(&tag) = tags.get(&tc.function.name) else {
                warn!(
                    trans_id,
                    name = %tc.function.name,
                    "No worker tag for tool call, returning empty result"
                );
                collected.insert(tc.id.clone(), ToolResult::synthetic(&tc.id, false));
                continue;
            };
            let frame = FunctionCallFrame {
                app_id: app_id.clone(),
                tag,
                req_id: req_id.to_string(),
                tool_call_id: tc.id.clone(),
                arguments: tc.function.arguments.clone().into_bytes(),
                metadata: metadata_bytes.clone(),
            };
            debug!(trans_id, req_id, tag, tool_call_id = %tc.id, "Dispatching tool call");
            self.source
                .write_call(frame)
                .await
                .map_err(|_| BridgeError::CallerClosed)?;
            waiting.insert(tc.id.clone());
        }

        let deadline = Instant::now() + self.call_timeout;
        while !waiting.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(frame)) => {
                    if waiting.remove(&frame.tool_call_id) {
                        collected.insert(
                            frame.tool_call_id.clone(),
                            ToolResult {
                                tool_call_id: frame.tool_call_id,
                                content: String::from_utf8_lossy(&frame.result).into_owned(),
                                timed_out: false,
                            },
                        );
                    } else {
                        debug!(
                            req_id,
                            tool_call_id = %frame.tool_call_id,
                            "Dropping duplicate or unexpected tool result"
                        );
                    }
                }
                Ok(None) => return Err(BridgeError::CallerClosed),
                Err(_) => break,
            }
        }

        if !waiting.is_empty() {
            warn!(
                trans_id,
                req_id,
                missing = waiting.len(),
                timeout_secs = self.call_timeout.as_secs(),
                "Tool dispatch deadline expired, filling synthetic results"
            );
        }

        // Results ordered like the input calls; gaps become synthetic
        // timed-out entries so the follow-up LLM call stays well-formed.
        Ok(tool_calls
            .iter()
            .map(|tc| {
                collected
                    .remove(&tc.id)
                    .unwrap_or_else(|| ToolResult::synthetic(&tc.id, true))
            })
            .collect())
    }

    /// Stops the reducer loop, fails all pending dispatches with
    /// `CallerClosed`, and releases both endpoints. Idempotent and
    /// non-blocking so it is safe inside a cache eviction hook.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reducer_task.lock().unwrap().take() {
            task.abort();
        }
        // Dropping the pending senders wakes every waiter with a closed
        // channel, which `call` reports as CallerClosed.
        self.pending.lock().unwrap().clear();
        self.source.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Routes result frames into the matching pending entry's channel.
///
/// Ends when the transport reports EOF; dispatches still pending at
/// that point resolve through their deadline, not through the EOF.
async fn reducer_loop(mut reducer: Box<dyn Reducer>, pending: PendingTable) {
    while let Some(frame) = reducer.next_result().await {
        let tx = pending
            .lock()
            .unwrap()
            .get(&frame.req_id)
            .map(|p| p.tx.clone());
        match tx {
            Some(tx) => {
                // Channels are sized to the expected call count, so a
                // failed send means the dispatch already finished.
                if let Err(e) = tx.try_send(frame) {
                    debug!("Dropping tool result for finished dispatch: {e}");
                }
            }
            None => {
                debug!(req_id = %frame.req_id, "Dropping result for unknown req_id");
            }
        }
    }
    debug!("Reducer loop ended (transport EOF or close)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{FunctionCall, FunctionDefinition, ToolCall};
    use crate::registry::ToolRegistry;
    use serde_json::json;

    /// Source half backed by an unbounded channel, so tests can observe
    /// every dispatched frame.
    struct ChannelSource {
        tx: mpsc::UnboundedSender<FunctionCallFrame>,
    }

    #[async_trait]
    impl Source for ChannelSource {
        async fn write_call(&self, frame: FunctionCallFrame) -> Result<()> {
            self.tx
                .send(frame)
                .map_err(|_| anyhow::anyhow!("source channel closed"))
        }
        fn close(&self) {}
    }

    struct ChannelReducer {
        rx: mpsc::Receiver<FunctionResultFrame>,
    }

    #[async_trait]
    impl Reducer for ChannelReducer {
        async fn next_result(&mut self) -> Option<FunctionResultFrame> {
            self.rx.recv().await
        }
    }

    struct TestHarness {
        caller: Arc<Caller>,
        calls_rx: mpsc::UnboundedReceiver<FunctionCallFrame>,
        results_tx: mpsc::Sender<FunctionResultFrame>,
    }

    fn harness(timeout: Duration) -> TestHarness {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(
            "app-1",
            0x10,
            FunctionDefinition {
                name: "get_weather".to_string(),
                description: "weather".to_string(),
                parameters: json!({"type":"object"}),
            },
        );
        registry.register(
            "app-1",
            0x11,
            FunctionDefinition {
                name: "get_news".to_string(),
                description: "news".to_string(),
                parameters: json!({"type":"object"}),
            },
        );

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::channel(16);
        let caller = Caller::new(
            Arc::new(ChannelSource { tx: calls_tx }),
            Box::new(ChannelReducer { rx: results_rx }),
            Metadata::new("app-1", registry),
            timeout,
        );
        TestHarness {
            caller,
            calls_rx,
            results_tx,
        }
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn result_frame(req_id: &str, tool_call_id: &str, content: &str) -> FunctionResultFrame {
        FunctionResultFrame {
            req_id: req_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            result: content.as_bytes().to_vec(),
            is_ok: true,
        }
    }

    #[tokio::test]
    async fn test_call_dispatches_frames_with_registered_tags() {
        let mut h = harness(Duration::from_secs(5));
        let calls = vec![
            tool_call("c1", "get_weather", r#"{"city":"Tokyo"}"#),
            tool_call("c2", "get_news", r#"{"topic":"rust"}"#),
        ];

        let caller = Arc::clone(&h.caller);
        let dispatch = tokio::spawn(async move { caller.call("t1", "r1", &calls).await });

        let f1 = h.calls_rx.recv().await.unwrap();
        assert_eq!(f1.tag, 0x10);
        assert_eq!(f1.tool_call_id, "c1");
        assert_eq!(f1.req_id, "r1");
        assert_eq!(f1.arguments, br#"{"city":"Tokyo"}"#);

        let f2 = h.calls_rx.recv().await.unwrap();
        assert_eq!(f2.tag, 0x11);
        assert_eq!(f2.tool_call_id, "c2");

        h.results_tx
            .send(result_frame("r1", "c1", "sunny"))
            .await
            .unwrap();
        h.results_tx
            .send(result_frame("r1", "c2", "headlines"))
            .await
            .unwrap();

        let results = dispatch.await.unwrap().unwrap();
        assert_eq!(results[0].content, "sunny");
        assert_eq!(results[1].content, "headlines");
    }

    #[tokio::test]
    async fn test_results_ordered_like_input_even_when_replies_reversed() {
        let h = harness(Duration::from_secs(5));
        let calls = vec![
            tool_call("c1", "get_weather", r#"{"city":"Tokyo"}"#),
            tool_call("c2", "get_weather", r#"{"city":"Paris"}"#),
        ];

        let caller = Arc::clone(&h.caller);
        let results_tx = h.results_tx.clone();
        let dispatch = tokio::spawn(async move { caller.call("t1", "r1", &calls).await });

        // Replies arrive in reverse order.
        results_tx
            .send(result_frame("r1", "c2", "rainy, 14C"))
            .await
            .unwrap();
        results_tx
            .send(result_frame("r1", "c1", "sunny, 22C"))
            .await
            .unwrap();

        let results = dispatch.await.unwrap().unwrap();
        assert_eq!(results[0].tool_call_id, "c1");
        assert_eq!(results[0].content, "sunny, 22C");
        assert_eq!(results[1].tool_call_id, "c2");
        assert_eq!(results[1].content, "rainy, 14C");
    }

    #[tokio::test]
    async fn test_deadline_fills_synthetic_results() {
        let h = harness(Duration::from_millis(200));
        let calls = vec![
            tool_call("c1", "get_weather", "{}"),
            tool_call("c2", "get_news", "{}"),
        ];

        let caller = Arc::clone(&h.caller);
        let results_tx = h.results_tx.clone();
        let dispatch = tokio::spawn(async move { caller.call("t1", "r1", &calls).await });

        // Only c1 replies; c2's worker is silent.
        results_tx
            .send(result_frame("r1", "c1", "sunny"))
            .await
            .unwrap();

        let results = dispatch.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "sunny");
        assert!(!results[0].timed_out);
        assert_eq!(results[1].content, "");
        assert!(results[1].timed_out);
    }

    #[tokio::test]
    async fn test_transport_eof_resolves_by_timeout_not_eof() {
        let h = harness(Duration::from_millis(50));
        // Ending the result channel ends the reducer loop before any
        // reply arrives.
        drop(h.results_tx);
        tokio::task::yield_now().await;

        let calls = vec![tool_call("c1", "get_weather", "{}")];
        let results = h.caller.call("t1", "r1", &calls).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].timed_out);
        assert_eq!(results[0].content, "");
    }

    #[tokio::test]
    async fn test_close_fails_pending_with_caller_closed() {
        let h = harness(Duration::from_secs(30));
        let calls = vec![tool_call("c1", "get_weather", "{}")];

        let caller = Arc::clone(&h.caller);
        let dispatch = tokio::spawn(async move { caller.call("t1", "r1", &calls).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.caller.close();

        let err = dispatch.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::CallerClosed));
    }

    #[tokio::test]
    async fn test_call_on_closed_caller_is_rejected() {
        let h = harness(Duration::from_secs(1));
        h.caller.close();
        assert!(h.caller.is_closed());

        let calls = vec![tool_call("c1", "get_weather", "{}")];
        let err = h.caller.call("t1", "r1", &calls).await.unwrap_err();
        assert!(matches!(err, BridgeError::CallerClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness(Duration::from_secs(1));
        h.caller.close();
        h.caller.close();
        assert!(h.caller.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_tool_name_yields_immediate_empty_result() {
        let h = harness(Duration::from_secs(5));
        let calls = vec![tool_call("c1", "not_registered", "{}")];

        let results = h.caller.call("t1", "r1", &calls).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "");
        assert!(!results[0].timed_out);
    }

    #[tokio::test]
    async fn test_empty_dispatch_returns_empty() {
        let h = harness(Duration::from_secs(5));
        let results = h.caller.call("t1", "r1", &[]).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_late_result_for_finished_req_is_dropped() {
        let h = harness(Duration::from_millis(150));
        let calls = vec![tool_call("c1", "get_weather", "{}")];

        // Dispatch times out with no reply.
        let results = h.caller.call("t1", "r1", &calls).await.unwrap();
        assert!(results[0].timed_out);

        // The straggler arrives afterwards; the loop drops it and the
        // caller keeps working.
        h.results_tx
            .send(result_frame("r1", "c1", "too late"))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let calls2 = vec![tool_call("c9", "get_weather", "{}")];
        let caller = Arc::clone(&h.caller);
        let results_tx = h.results_tx.clone();
        let dispatch = tokio::spawn(async move { caller.call("t1", "r2", &calls2).await });
        results_tx
            .send(result_frame("r2", "c9", "fresh"))
            .await
            .unwrap();
        let results2 = dispatch.await.unwrap().unwrap();
        assert_eq!(results2[0].content, "fresh");
    }

    #[tokio::test]
    async fn test_system_prompt_slot() {
        let h = harness(Duration::from_secs(1));
        assert_eq!(
            h.caller.system_prompt(),
            (String::new(), SystemPromptOp::Disabled)
        );

        h.caller
            .set_system_prompt("Be brief.", SystemPromptOp::Prefix);
        assert_eq!(
            h.caller.system_prompt(),
            ("Be brief.".to_string(), SystemPromptOp::Prefix)
        );

        h.caller
            .set_system_prompt("Override.", SystemPromptOp::Overwrite);
        let (prompt, op) = h.caller.system_prompt();
        assert_eq!(prompt, "Override.");
        assert_eq!(op, SystemPromptOp::Overwrite);
    }

    #[tokio::test]
    async fn test_metadata_rides_in_call_frame() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(
            "app-1",
            0x10,
            FunctionDefinition {
                name: "get_weather".to_string(),
                description: String::new(),
                parameters: json!({}),
            },
        );
        let mut md = Metadata::new("app-1", registry);
        md.set("tenant", "acme");

        let (calls_tx, mut calls_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::channel(4);
        let caller = Caller::new(
            Arc::new(ChannelSource { tx: calls_tx }),
            Box::new(ChannelReducer { rx: results_rx }),
            md,
            Duration::from_secs(5),
        );

        let calls = vec![tool_call("c1", "get_weather", "{}")];
        let dispatch = {
            let caller = Arc::clone(&caller);
            tokio::spawn(async move { caller.call("t1", "r1", &calls).await })
        };

        let frame = calls_rx.recv().await.unwrap();
        let md_value: serde_json::Value = serde_json::from_slice(&frame.metadata).unwrap();
        assert_eq!(md_value["tenant"], "acme");

        results_tx
            .send(result_frame("r1", "c1", "ok"))
            .await
            .unwrap();
        dispatch.await.unwrap().unwrap();
    }
}
