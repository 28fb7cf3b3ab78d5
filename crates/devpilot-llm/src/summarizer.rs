use crate::{ChatClient, RetryPolicy, StreamAggregator};
use anyhow::{Result, anyhow};
use devpilot_core::{CancellationToken, ChatMessage, ChatRequest, ToolChoice};

/// Produces a prose summary of a conversation excerpt.
pub trait Summarizer {
    fn summarize(&self, cancel: &CancellationToken, prompt: &str) -> Result<String>;
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "You condense agent conversation history. \
Keep file paths, findings, decisions and open questions. Reply with the summary only.";

/// Summarizer backed by a tool-less chat completion.
pub struct ChatSummarizer<'a> {
    client: &'a (dyn ChatClient + Send + Sync),
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl<'a> ChatSummarizer<'a> {
    pub fn new(
        client: &'a (dyn ChatClient + Send + Sync),
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Summarizer for ChatSummarizer<'_> {
    fn summarize(&self, cancel: &CancellationToken, prompt: &str) -> Result<String> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(SUMMARIZER_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            tools: Vec::new(),
            tool_choice: ToolChoice::none(),
            max_tokens: self.max_tokens,
            temperature: Some(0.0),
        };
        let response = self.retry.run(
            cancel,
            |_| {
                let stream = self.client.stream_chat(&req, cancel)?;
                StreamAggregator::new().consume(stream, None)
            },
            |_, _, _| {},
        )?;
        let summary = response.text().trim().to_string();
        if summary.is_empty() {
            return Err(anyhow!("summarizer returned an empty summary"));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkStream, LlmError};
    use devpilot_core::StreamChunk;
    use std::sync::Mutex;

    struct CannedClient {
        replies: Mutex<Vec<Vec<StreamChunk>>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ChatClient for CannedClient {
        fn stream_chat(
            &self,
            req: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChunkStream, LlmError> {
            self.seen.lock().expect("lock").push(req.clone());
            let chunks = self.replies.lock().expect("lock").remove(0);
            Ok(Box::new(chunks.into_iter().map(Ok)))
        }
    }

    fn canned(reply: Vec<StreamChunk>) -> CannedClient {
        CannedClient {
            replies: Mutex::new(vec![reply]),
            seen: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn summarizes_without_tools() {
        let client = canned(vec![
            StreamChunk::content("Read src/lib.rs; "),
            StreamChunk::content("found the parser bug."),
        ]);
        let summarizer = ChatSummarizer::new(&client, "summary-model", 512);
        let out = summarizer
            .summarize(&CancellationToken::new(), "history")
            .expect("summary");
        assert_eq!(out, "Read src/lib.rs; found the parser bug.");

        let seen = client.seen.lock().expect("lock");
        assert_eq!(seen[0].model, "summary-model");
        assert!(seen[0].tools.is_empty());
        assert_eq!(seen[0].tool_choice, ToolChoice::none());
    }

    #[test]
    fn empty_summary_is_an_error() {
        let client = canned(vec![StreamChunk::content("   ")]);
        let summarizer = ChatSummarizer::new(&client, "summary-model", 512);
        assert!(
            summarizer
                .summarize(&CancellationToken::new(), "history")
                .is_err()
        );
    }
}
