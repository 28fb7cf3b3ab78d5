//! Chat-completion plumbing: the streaming client seam, fragment
//! aggregation, retry policy and the summarization adapter.

mod aggregator;
mod client;
mod error;
mod retry;
mod summarizer;

pub use aggregator::{AggregatedResponse, StreamAggregator};
pub use client::OpenAiCompatClient;
pub use error::LlmError;
pub use retry::{NETWORK_RETRY_BASE_MS, RetryPolicy};
pub use summarizer::{ChatSummarizer, Summarizer};

use devpilot_core::{CancellationToken, ChatRequest, StreamChunk};

/// Chunks of one streaming completion. The iterator ending is a normal
/// end-of-stream; an `Err` item is a transport failure and ends the stream.
pub type ChunkStream = Box<dyn Iterator<Item = Result<StreamChunk, LlmError>> + Send>;

pub trait ChatClient {
    /// Start a streaming chat completion with the declared tool schemas.
    ///
    /// Implementations poll `cancel` while reading and surface
    /// [`LlmError::Cancelled`] once it is set.
    fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError>;
}
