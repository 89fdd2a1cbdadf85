//! Cited, verified question answering over an indexed repository.
//!
//! A turn runs four stages in order: the [`agents::Planner`] rewrites the
//! question into sub-queries, the [`agents::Retriever`] searches the
//! repository index, the [`agents::Generator`] streams an answer with
//! citations, and the [`agents::Verifier`] grades it. The
//! [`pipeline::Orchestrator`] drives the stages and forwards
//! [`event::StreamEvent`]s to the caller as they happen.

pub mod agents;
pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;

pub use config::Config;
pub use error::AgentError;
pub use event::{RiskLevel, RiskVerdict, StreamEvent, TurnRecord};
pub use pipeline::{AskRequest, MemoryTurnSink, Orchestrator, TurnSink, TurnSummary};
