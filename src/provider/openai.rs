use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, StreamOptions};
use crate::registry::Metadata;

use super::{ensure_success, sse_chunk_stream, ChatStream, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for the OpenAI chat-completion API, and for any server that
/// speaks the same dialect behind a different base URL.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, api_endpoint: Option<String>, model: Option<String>) -> Self {
        let base_url = api_endpoint
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    /// Builds the provider from `OPENAI_API_KEY`, `OPENAI_API_ENDPOINT`
    /// and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        Ok(Self::new(
            api_key,
            std::env::var("OPENAI_API_ENDPOINT").ok(),
            std::env::var("OPENAI_MODEL").ok(),
        ))
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Fills the configured default model when the client sent none.
    fn apply_model(&self, req: &mut ChatCompletionRequest) {
        if req.model.is_empty() {
            if let Some(model) = &self.model {
                req.model = model.clone();
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn get_chat_completions(
        &self,
        mut req: ChatCompletionRequest,
        _md: &Metadata,
    ) -> Result<ChatCompletionResponse> {
        self.apply_model(&mut req);
        req.stream = false;
        req.stream_options = None;

        debug!(model = %req.model, messages = req.messages.len(), "OpenAI chat completion");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("openai request failed")?;
        let response = ensure_success(response).await?;
        response
            .json::<ChatCompletionResponse>()
            .await
            .context("decoding openai response")
    }

    async fn get_chat_completions_stream(
        &self,
        mut req: ChatCompletionRequest,
        _md: &Metadata,
    ) -> Result<ChatStream> {
        self.apply_model(&mut req);
        req.stream = true;
        // Ask for the trailing usage chunk so the orchestrator can fold
        // first-call usage into what the client sees.
        req.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        debug!(model = %req.model, messages = req.messages.len(), "OpenAI chat completion stream");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("openai stream request failed")?;
        let response = ensure_success(response).await?;
        Ok(sse_chunk_stream(response))
    }
}
