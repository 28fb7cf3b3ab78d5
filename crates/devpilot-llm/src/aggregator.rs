use crate::{ChunkStream, LlmError};
use devpilot_core::{
    ChatMessage, StreamCallback, StreamChunk, TokenUsage, ToolCall, ToolCallFragment,
};

/// Fragments with an index above this are dropped instead of growing the
/// accumulation array without bound.
const MAX_TOOL_CALL_INDEX: usize = 256;

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Merges streamed chunks into one assistant message.
///
/// Content concatenates in arrival order. Tool-call fragments merge by
/// index: non-empty `id`/`name` values overwrite, empty ones never erase,
/// and argument chunks always append. Usage keeps the last non-zero value
/// seen for each counter.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    content: String,
    calls: Vec<PendingToolCall>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

/// Outcome of a fully consumed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedResponse {
    pub message: ChatMessage,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

impl AggregatedResponse {
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.message.tool_calls()
    }

    pub fn text(&self) -> &str {
        self.message.text()
    }
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if let Some(text) = &chunk.content {
            self.content.push_str(text);
        }
        for fragment in &chunk.tool_calls {
            self.merge_fragment(fragment);
        }
        if let Some(usage) = &chunk.usage {
            self.merge_usage(usage);
        }
        if let Some(reason) = &chunk.finish_reason
            && !reason.trim().is_empty()
        {
            self.finish_reason = Some(reason.clone());
        }
    }

    pub fn merge_fragment(&mut self, fragment: &ToolCallFragment) {
        if fragment.index > MAX_TOOL_CALL_INDEX {
            return;
        }
        if self.calls.len() <= fragment.index {
            self.calls
                .resize_with(fragment.index + 1, PendingToolCall::default);
        }
        let entry = &mut self.calls[fragment.index];
        if let Some(id) = &fragment.id
            && !id.trim().is_empty()
        {
            entry.id = id.clone();
        }
        if let Some(name) = &fragment.name
            && !name.trim().is_empty()
        {
            entry.name = name.clone();
        }
        if let Some(chunk) = &fragment.args_chunk {
            entry.arguments.push_str(chunk);
        }
    }

    fn merge_usage(&mut self, usage: &TokenUsage) {
        if usage.prompt_tokens > 0 {
            self.usage.prompt_tokens = usage.prompt_tokens;
        }
        if usage.completion_tokens > 0 {
            self.usage.completion_tokens = usage.completion_tokens;
        }
        if usage.total_tokens > 0 {
            self.usage.total_tokens = usage.total_tokens;
        }
    }

    /// Drain `stream` to completion. A transport error discards everything
    /// accumulated so far.
    pub fn consume(
        mut self,
        stream: ChunkStream,
        on_chunk: Option<&StreamCallback>,
    ) -> Result<AggregatedResponse, LlmError> {
        for item in stream {
            let chunk = item?;
            if let Some(cb) = on_chunk {
                cb(&chunk);
            }
            self.push(&chunk);
        }
        Ok(self.finish())
    }

    pub fn finish(self) -> AggregatedResponse {
        let tool_calls = self
            .calls
            .into_iter()
            .enumerate()
            .filter(|(_, call)| !call.name.trim().is_empty())
            .map(|(index, call)| ToolCall {
                id: if call.id.trim().is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                },
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        let content = if self.content.is_empty() {
            None
        } else {
            Some(self.content)
        };
        AggregatedResponse {
            message: ChatMessage::Assistant {
                content,
                tool_calls,
            },
            usage: self.usage,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fragment(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamChunk {
        StreamChunk::fragment(ToolCallFragment {
            index,
            id: id.map(ToString::to_string),
            name: name.map(ToString::to_string),
            args_chunk: args.map(ToString::to_string),
        })
    }

    fn stream_of(items: Vec<Result<StreamChunk, LlmError>>) -> ChunkStream {
        Box::new(items.into_iter())
    }

    #[test]
    fn merges_args_chunks_for_one_index() {
        let mut agg = StreamAggregator::new();
        agg.push(&fragment(0, None, Some("read_file"), None));
        agg.push(&fragment(0, None, None, Some("{\"file_path\":")));
        agg.push(&fragment(0, None, None, Some("\"a.go\"}")));
        let out = agg.finish();
        assert_eq!(out.tool_calls().len(), 1);
        assert_eq!(out.tool_calls()[0].name, "read_file");
        assert_eq!(out.tool_calls()[0].arguments, "{\"file_path\":\"a.go\"}");
    }

    #[test]
    fn empty_later_fields_never_erase_earlier_values() {
        let mut agg = StreamAggregator::new();
        agg.push(&fragment(0, Some("call_abc"), Some("git_diff"), Some("{")));
        agg.push(&fragment(0, Some(""), Some(""), Some("}")));
        let out = agg.finish();
        let call = &out.tool_calls()[0];
        assert_eq!(call.id, "call_abc");
        assert_eq!(call.name, "git_diff");
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn fragments_merge_by_index_not_arrival_order() {
        let mut agg = StreamAggregator::new();
        agg.push(&fragment(1, Some("b"), Some("git_log"), Some("{\"max_count\":")));
        agg.push(&fragment(0, Some("a"), Some("git_status"), Some("{}")));
        agg.push(&fragment(1, None, None, Some("5}")));
        let out = agg.finish();
        let names: Vec<&str> = out.tool_calls().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["git_status", "git_log"]);
        assert_eq!(out.tool_calls()[1].arguments, "{\"max_count\":5}");
    }

    #[test]
    fn nameless_calls_are_dropped_and_missing_ids_synthesized() {
        let mut agg = StreamAggregator::new();
        agg.push(&fragment(0, None, None, Some("{}")));
        agg.push(&fragment(1, None, Some("list_directory"), Some("{}")));
        let out = agg.finish();
        assert_eq!(out.tool_calls().len(), 1);
        assert_eq!(out.tool_calls()[0].id, "call_1");
    }

    #[test]
    fn content_concatenates_and_usage_keeps_final_non_zero_totals() {
        let mut agg = StreamAggregator::new();
        agg.push(&StreamChunk::content("feat: "));
        agg.push(&StreamChunk::usage(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 1,
            total_tokens: 11,
        }));
        agg.push(&StreamChunk::content("add parser"));
        agg.push(&StreamChunk::usage(TokenUsage {
            prompt_tokens: 0,
            completion_tokens: 7,
            total_tokens: 17,
        }));
        let out = agg.finish();
        assert_eq!(out.text(), "feat: add parser");
        assert_eq!(
            out.usage,
            TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 7,
                total_tokens: 17,
            }
        );
        assert_eq!(out.finish_reason, "stop");
    }

    #[test]
    fn consume_surfaces_transport_error() {
        let stream = stream_of(vec![
            Ok(StreamChunk::content("partial")),
            Err(LlmError::Transport("connection reset".to_string())),
        ]);
        let err = StreamAggregator::new()
            .consume(stream, None)
            .expect_err("transport error");
        assert!(matches!(err, LlmError::Transport(_)));
    }

    #[test]
    fn consume_invokes_callback_per_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: StreamCallback = Arc::new(move |chunk: &StreamChunk| {
            if let Some(text) = &chunk.content {
                sink.lock().expect("lock").push(text.clone());
            }
        });
        let stream = stream_of(vec![
            Ok(StreamChunk::content("a")),
            Ok(StreamChunk::content("b")),
        ]);
        let out = StreamAggregator::new()
            .consume(stream, Some(&cb))
            .expect("consume");
        assert_eq!(out.text(), "ab");
        assert_eq!(*seen.lock().expect("lock"), vec!["a", "b"]);
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut agg = StreamAggregator::new();
        agg.push(&fragment(10_000, Some("x"), Some("read_file"), Some("{}")));
        assert!(agg.finish().tool_calls().is_empty());
    }
}
