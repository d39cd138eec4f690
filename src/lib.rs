//! LLM bridge: middleware between OpenAI-compatible chat clients, an
//! upstream LLM provider, and out-of-process tool workers.
//!
//! The bridge orchestrates the two-phase tool-calling dialogue: the
//! first completion produces tool calls, the caller fans them out to
//! workers over a framed transport, and the follow-up completion turns
//! the gathered results into the client's answer, streamed or not.

pub mod caller;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod service;
pub mod transport;
