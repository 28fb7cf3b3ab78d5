//! Pure `History -> History` transforms applied to the copy of the history
//! that is sent to the model. The canonical history is never touched.

use devpilot_core::ChatMessage;

pub type Transform = Box<dyn Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync>;

/// Ordered list of transforms; each receives the previous one's output.
#[derive(Default)]
pub struct TransformPipeline {
    steps: Vec<(&'static str, Transform)>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, name: &'static str, transform: Transform) -> Self {
        self.steps.push((name, transform));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    pub fn apply(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        self.steps
            .iter()
            .fold(history.to_vec(), |messages, (_, step)| step(messages))
    }
}

/// Insert `context` as a user message right after the system prompt and
/// original request. Empty context leaves the history alone.
pub fn inject_progress_context(context: String) -> Transform {
    Box::new(move |mut messages| {
        if context.trim().is_empty() {
            return messages;
        }
        let at = messages.len().min(2);
        messages.insert(
            at,
            ChatMessage::user(format!("[progress context]\n{context}")),
        );
        messages
    })
}

/// Cap every tool result at `max_chars` characters.
pub fn truncate_tool_results(max_chars: usize) -> Transform {
    Box::new(move |messages| {
        messages
            .into_iter()
            .map(|msg| match msg {
                ChatMessage::Tool {
                    tool_call_id,
                    content,
                } if content.chars().count() > max_chars => {
                    let kept: String = content.chars().take(max_chars).collect();
                    let dropped = content.chars().count() - max_chars;
                    ChatMessage::Tool {
                        tool_call_id,
                        content: format!("{kept}\n[tool output truncated: {dropped} chars omitted]"),
                    }
                }
                other => other,
            })
            .collect()
    })
}

/// Drop a message identical to the one right before it. Tool results are
/// kept because each answers a distinct call id.
pub fn drop_consecutive_duplicates() -> Transform {
    Box::new(|messages| {
        let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
        for msg in messages {
            if !msg.is_tool_result() && out.last() == Some(&msg) {
                continue;
            }
            out.push(msg);
        }
        out
    })
}
