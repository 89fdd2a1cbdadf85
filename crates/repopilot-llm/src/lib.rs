//! LLM provider abstraction and backend implementations.
//!
//! Every stage of the query pipeline talks to a model through [`LlmProvider`]:
//! the planner and verifier use one-shot `chat`, the generator uses
//! `chat_stream`, and both the indexer and the retriever use `embed`.

pub mod any;
pub mod error;
pub(crate) mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub(crate) mod sse;

pub use error::LlmError;
pub use provider::{ChatStream, LlmProvider, Message, Role};
