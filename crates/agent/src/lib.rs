//! Tool-augmented conversation engine for A-share stock questions.
//!
//! The engine runs a bounded loop: the configured provider adapter (`llm`)
//! either answers with final text or requests tool invocations, the tool
//! registry (`tools`) executes them against storage, and the results are fed
//! back on the next round.
//!
//! # Key Types
//!
//! - `AgentRuntime` - the conversation loop (see `runtime`)
//! - `LlmClient` - provider adapter trait for OpenAI, Anthropic and Ollama
//! - `ToolRegistry` - name to handler table, never fails a dispatch
//! - `SqlGuardPolicy` - read-only sandbox for the free-form SQL tool
//!
//! # Safety Principle
//!
//! The model only chooses which read-only query to run. Storage is never
//! mutated on its behalf, and every error is reported back to it as data.

pub mod conversation;
pub mod guardrails;
pub mod llm;
pub mod runtime;
pub mod tools;

pub use conversation::{ChatMessage, ChatReply, ChatRole, Message, ToolArguments, ToolInvocationRequest};
pub use guardrails::{SqlGuardDecision, SqlGuardPolicy};
pub use llm::{build_client, LlmClient, LlmError, NormalizedResponse};
pub use runtime::{AgentRuntime, ChatTurn, ITERATION_LIMIT_MESSAGE};
pub use tools::{ToolError, ToolRegistry, ToolResult};
