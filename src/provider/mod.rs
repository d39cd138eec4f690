//! `LlmProvider` trait: abstraction over upstream LLM backends.
//!
//! Providers (OpenAI, Azure OpenAI, …) implement this trait so the
//! orchestrator can run the two-phase dialogue against any backend
//! selected by the `[provider] name` config field.

pub mod azure;
pub mod openai;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::config::ProviderConfig;
use crate::error::BridgeError;
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::registry::Metadata;

pub use azure::AzureOpenAiProvider;
pub use openai::OpenAiProvider;

/// Pull-based sequence of completion chunks; ends at end-of-stream.
pub type ChatStream = BoxStream<'static, Result<ChatCompletionChunk>>;

/// Abstraction over upstream LLM backends.
///
/// Both calls accept an OpenAI-shaped request; providers that speak a
/// different dialect translate behind this seam and normalize responses
/// back into the shared types.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name used in logs and config matching.
    fn name(&self) -> &str;

    /// Whether the follow-up call must keep the `tools` field
    /// populated. Anthropic-style APIs require it; everyone else needs
    /// it cleared.
    fn keeps_tools_on_followup(&self) -> bool {
        false
    }

    /// One blocking chat completion.
    async fn get_chat_completions(
        &self,
        req: ChatCompletionRequest,
        md: &Metadata,
    ) -> Result<ChatCompletionResponse>;

    /// One streaming chat completion.
    async fn get_chat_completions_stream(
        &self,
        req: ChatCompletionRequest,
        md: &Metadata,
    ) -> Result<ChatStream>;
}

/// Builds the provider selected by the config.
pub fn from_config(cfg: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    match cfg.name.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(
            cfg.api_key.clone(),
            cfg.api_endpoint.clone(),
            cfg.model.clone(),
        ))),
        "azopenai" => {
            if cfg.api_key.is_empty() || cfg.api_endpoint.is_none() {
                Ok(Arc::new(AzureOpenAiProvider::from_env()?))
            } else {
                Ok(Arc::new(AzureOpenAiProvider::new(
                    cfg.api_key.clone(),
                    cfg.api_endpoint.clone().unwrap_or_default(),
                    cfg.deployment_id.clone().unwrap_or_default(),
                    cfg.api_version.clone(),
                )))
            }
        }
        other => bail!("unknown LLM provider: {other}"),
    }
}

/// Maps a non-2xx provider response to `BridgeError::Provider`.
/// The body is the provider's own message; credentials never enter it.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(BridgeError::Provider {
        status: status.as_u16(),
        message,
    }
    .into())
}

/// Parses an SSE body into completion chunks.
///
/// Each `data:` line carries one JSON chunk; the stream ends at
/// `data: [DONE]` or upstream EOF. Chunks pass through undecoded
/// beyond deserialization; reassembly is the orchestrator's job.
pub(crate) fn sse_chunk_stream(response: reqwest::Response) -> ChatStream {
    let stream = try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut done = false;
        while !done {
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk.context("reading provider stream")?;
            let text = std::str::from_utf8(&chunk).context("provider stream is not UTF-8")?;
            buffer.push_str(text);

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    done = true;
                    break;
                }
                let parsed: ChatCompletionChunk = serde_json::from_str(data)
                    .with_context(|| format!("decoding provider chunk: {data}"))?;
                yield parsed;
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time verification that `LlmProvider` is object-safe.
    #[test]
    fn test_llm_provider_is_object_safe() {
        fn _assert_object_safe(_: &dyn LlmProvider) {}
    }

    #[test]
    fn test_from_config_openai() {
        let cfg = ProviderConfig {
            name: "openai".to_string(),
            api_key: "sk-test".to_string(),
            api_endpoint: None,
            model: Some("gpt-4o-mini".to_string()),
            api_version: None,
            deployment_id: None,
        };
        let provider = from_config(&cfg).unwrap();
        assert_eq!(provider.name(), "openai");
        assert!(!provider.keeps_tools_on_followup());
    }

    #[test]
    fn test_from_config_azure_explicit() {
        let cfg = ProviderConfig {
            name: "azopenai".to_string(),
            api_key: "key".to_string(),
            api_endpoint: Some("https://res.openai.azure.com".to_string()),
            model: None,
            api_version: Some("2024-02-01".to_string()),
            deployment_id: Some("gpt-4o".to_string()),
        };
        let provider = from_config(&cfg).unwrap();
        assert_eq!(provider.name(), "azopenai");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let cfg = ProviderConfig {
            name: "delphi".to_string(),
            api_key: String::new(),
            api_endpoint: None,
            model: None,
            api_version: None,
            deployment_id: None,
        };
        let err = from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("unknown LLM provider"));
    }
}
