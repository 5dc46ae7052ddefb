//! The external LLM boundary: a frozen, round-trip-safe configuration type
//! and the client contract the commit engine and operations call through.

pub mod client;
pub mod config;

pub use client::{ChatResponse, LlmClient, Usage};
pub use config::LLMConfig;
