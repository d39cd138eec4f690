use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, StreamOptions};
use crate::registry::Metadata;

use super::{ensure_success, sse_chunk_stream, ChatStream, LlmProvider};

const DEFAULT_API_VERSION: &str = "2024-02-01";

/// Client for Azure OpenAI deployments.
///
/// Same request and response shapes as the OpenAI provider; the
/// differences are the deployment-scoped URL, the `api-version` query
/// parameter, and the `api-key` header instead of bearer auth.
#[derive(Clone)]
pub struct AzureOpenAiProvider {
    client: Client,
    api_key: String,
    api_endpoint: String,
    deployment_id: String,
    api_version: String,
}

impl AzureOpenAiProvider {
    pub fn new(
        api_key: String,
        api_endpoint: String,
        deployment_id: String,
        api_version: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
            deployment_id,
            api_version: api_version
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        }
    }

    /// Builds the provider from `AZURE_OPENAI_API_KEY`,
    /// `AZURE_OPENAI_API_ENDPOINT`, `AZURE_OPENAI_DEPLOYMENT_ID` and
    /// `AZURE_OPENAI_API_VERSION`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("AZURE_OPENAI_API_KEY")
            .context("AZURE_OPENAI_API_KEY is not set")?;
        let api_endpoint = std::env::var("AZURE_OPENAI_API_ENDPOINT")
            .context("AZURE_OPENAI_API_ENDPOINT is not set")?;
        let deployment_id = std::env::var("AZURE_OPENAI_DEPLOYMENT_ID")
            .context("AZURE_OPENAI_DEPLOYMENT_ID is not set")?;
        Ok(Self::new(
            api_key,
            api_endpoint,
            deployment_id,
            std::env::var("AZURE_OPENAI_API_VERSION").ok(),
        ))
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.api_endpoint, self.deployment_id, self.api_version
        )
    }
}

#[async_trait]
impl LlmProvider for AzureOpenAiProvider {
    fn name(&self) -> &str {
        "azopenai"
    }

    async fn get_chat_completions(
        &self,
        mut req: ChatCompletionRequest,
        _md: &Metadata,
    ) -> Result<ChatCompletionResponse> {
        // The deployment pins the model; a client-supplied model name
        // would be rejected by some API versions.
        req.model = String::new();
        req.stream = false;
        req.stream_options = None;

        debug!(deployment = %self.deployment_id, "Azure OpenAI chat completion");

        let response = self
            .client
            .post(self.chat_url())
            .header("api-key", &self.api_key)
            .json(&req)
            .send()
            .await
            .context("azure openai request failed")?;
        let response = ensure_success(response).await?;
        response
            .json::<ChatCompletionResponse>()
            .await
            .context("decoding azure openai response")
    }

    async fn get_chat_completions_stream(
        &self,
        mut req: ChatCompletionRequest,
        _md: &Metadata,
    ) -> Result<ChatStream> {
        req.model = String::new();
        req.stream = true;
        req.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        debug!(deployment = %self.deployment_id, "Azure OpenAI chat completion stream");

        let response = self
            .client
            .post(self.chat_url())
            .header("api-key", &self.api_key)
            .json(&req)
            .send()
            .await
            .context("azure openai stream request failed")?;
        let response = ensure_success(response).await?;
        Ok(sse_chunk_stream(response))
    }
}
