//! OpenAI-compatible HTTP front door.
//!
//! Two endpoints: `/v1/chat/completions` (streaming or JSON, by the
//! request's `stream` field) and `/v1/chat/completions/invoke` (the
//! non-streaming convenience path). Both extract a credential, load or
//! create the caller, mint a `trans_id`, and delegate to the service.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::BridgeError;
use crate::openai::{ChatCompletionRequest, InvokeRequest, InvokeResponse};
use crate::service::{new_id, ChatEvent, EventWriter, Service};

/// System prompt of the invoke path, which carries no client messages
/// of its own.
const INVOKE_SYSTEM_PROMPT: &str = "You are a very helpful assistant. \
    Your job is to choose the best possible action to solve the user question or task.";

/// Extracts the caller credential from request headers.
pub type CredentialExtractor = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

/// Default extractor: the bearer token rendered as `token:<value>`, or
/// the literal `"token"` when the header is absent.
pub fn default_credential_extractor() -> CredentialExtractor {
    Arc::new(|headers: &HeaderMap| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| format!("token:{token}"))
            .unwrap_or_else(|| "token".to_string())
    })
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<Service>,
    credential_extractor: CredentialExtractor,
}

pub fn router(service: Arc<Service>) -> Router {
    router_with_extractor(service, default_credential_extractor())
}

pub fn router_with_extractor(
    service: Arc<Service>,
    credential_extractor: CredentialExtractor,
) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/chat/completions/invoke", post(invoke))
        .with_state(AppState {
            service,
            credential_extractor,
        })
}

/// Binds the client-facing listener and serves the API.
pub async fn serve(service: Arc<Service>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Chat API listening on {addr}");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

/// JSON error body: `{"error":{"message","code"}}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "code": self.status.as_u16(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let credential = (state.credential_extractor)(&headers);
    let caller = state.service.load_or_create_caller(&credential)?;
    let trans_id = new_id();
    let span = info_span!("chat_completions", trans_id = %trans_id, stream = req.stream);

    let (tx, mut rx) = mpsc::channel(64);
    let writer = EventWriter::new(tx);

    if req.stream {
        // Events flow to the client as they are produced; errors after
        // the stream started can only terminate it.
        let service = Arc::clone(&state.service);
        tokio::spawn(
            async move {
                if let Err(e) = service
                    .get_chat_completions(req, &trans_id, &caller, &writer)
                    .await
                {
                    match e.downcast_ref::<BridgeError>() {
                        Some(BridgeError::Cancelled) => {
                            debug!("Client disconnected mid-stream");
                        }
                        _ => {
                            error!("Chat completion failed mid-stream: {e}");
                            let _ = writer.write(ChatEvent::Error(e.to_string())).await;
                        }
                    }
                }
            }
            .instrument(span),
        );
        let stream = ReceiverStream::new(rx).map(event_to_sse);
        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        state
            .service
            .get_chat_completions(req, &trans_id, &caller, &writer)
            .instrument(span)
            .await?;
        drop(writer);

        // The non-streaming flow ends with exactly one Completion.
        while let Some(event) = rx.recv().await {
            if let ChatEvent::Completion(resp) = event {
                return Ok(Json(*resp).into_response());
            }
        }
        Err(ApiError::internal("orchestrator produced no response"))
    }
}

async fn invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let credential = (state.credential_extractor)(&headers);
    let caller = state.service.load_or_create_caller(&credential)?;
    let trans_id = new_id();
    let span = info_span!("invoke", trans_id = %trans_id);

    let res = state
        .service
        .get_invoke(
            &req.prompt,
            INVOKE_SYSTEM_PROMPT,
            &trans_id,
            &caller,
            req.include_call_stack,
        )
        .instrument(span)
        .await?;
    Ok(Json(res))
}

fn event_to_sse(event: ChatEvent) -> Result<Event, Infallible> {
    let event = match event {
        ChatEvent::Chunk(chunk) => data_event(&chunk),
        ChatEvent::ToolCalls(calls) => data_event(&calls),
        ChatEvent::ToolResults(results) => data_event(&results),
        ChatEvent::Completion(resp) => data_event(&resp),
        ChatEvent::Error(message) => data_event(&json!({"error": {"message": message}})),
        ChatEvent::Done => Event::default().data("[DONE]"),
    };
    Ok(event)
}

fn data_event<T: serde::Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            error!("Failed to serialize SSE payload: {e}");
            Event::default().data("{}")
        }
    }
}
