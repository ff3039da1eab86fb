pub mod error;
pub mod gemini;
pub mod openai_compat;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod tool_reassembly;

pub use error::{ProviderError, Result};
pub use provider::{chat_with_retry, ChatRequest, LlmProvider, RetryPolicy, ToolChoice, ToolDefinition, UnifiedResponse, Usage};
pub use registry::ProviderRegistry;
pub use stream::StreamEvent;
