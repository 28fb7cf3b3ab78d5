use crate::{ChatClient, ChunkStream, LlmError};
use chrono::{DateTime, NaiveDateTime, Utc};
use devpilot_core::{
    CancellationToken, ChatMessage, ChatRequest, LlmConfig, StreamChunk, TokenUsage,
    ToolCallFragment,
};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as _;
use std::io::{BufRead, BufReader};
use std::time::Duration;

/// Streaming client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }
}

impl ChatClient for OpenAiCompatClient {
    fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let api_key = self
            .resolve_api_key()
            .ok_or_else(|| LlmError::MissingApiKey(self.cfg.api_key_env.clone()))?;
        let resp = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&build_payload(req))
            .send()
            .map_err(|err| classify_transport(&err))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
            let body = resp.text().unwrap_or_default();
            return Err(classify_status(status, &body, retry_after, &self.cfg.api_key_env));
        }
        Ok(Box::new(SseStream::new(
            BufReader::new(resp),
            cancel.clone(),
        )))
    }
}

pub(crate) fn build_payload(req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if let Some(temperature) = req.temperature {
        payload["temperature"] = json!(temperature);
    }
    if !req.tools.is_empty() {
        payload["tools"] = json!(req.tools);
        payload["tool_choice"] = json!(req.tool_choice);
    }
    payload
}

fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect();
            }
            value
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<u64>,
    api_key_env: &str,
) -> LlmError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth {
            status: status.as_u16(),
            message: format!(
                "invalid or missing API key. Set {api_key_env} or configure llm.api_key in settings. Detail: {detail}"
            ),
        },
        _ => LlmError::Status {
            status: status.as_u16(),
            message: detail,
            retry_after,
        },
    }
}

fn classify_transport(err: &reqwest::Error) -> LlmError {
    let inner = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner.contains("dns")
        || inner.contains("resolve")
        || inner.contains("name or service not known")
        || inner.contains("no such host");
    let message = if err.is_timeout() {
        "request timed out; consider raising llm.timeout_seconds".to_string()
    } else if is_dns {
        "DNS resolution failed for the configured endpoint".to_string()
    } else if err.is_connect() {
        "connection refused by the configured endpoint".to_string()
    } else {
        format!("network error: {err}")
    };
    LlmError::Transport(message)
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Done,
    Chunk(StreamChunk),
}

/// Decode one `data:` line of an OpenAI streaming response. Lines that are
/// not valid JSON are skipped.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    let Some(data) = trimmed.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };

    let mut chunk = StreamChunk::default();
    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        chunk.usage = Some(TokenUsage {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_tokens: usage
                .get("total_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
    else {
        return SseLine::Chunk(chunk);
    };
    chunk.finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    if let Some(delta) = choice.get("delta") {
        chunk.content = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            chunk.tool_calls = calls
                .iter()
                .enumerate()
                .map(|(position, item)| {
                    let function = item.get("function");
                    ToolCallFragment {
                        index: item
                            .get("index")
                            .and_then(Value::as_u64)
                            .map_or(position, |i| i as usize),
                        id: item.get("id").and_then(Value::as_str).map(ToString::to_string),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        args_chunk: function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                    }
                })
                .collect();
        }
    }
    SseLine::Chunk(chunk)
}

/// Lazily reads SSE lines, yielding decoded chunks until `[DONE]` or EOF.
pub(crate) struct SseStream<R> {
    reader: R,
    cancel: CancellationToken,
    finished: bool,
}

impl<R: BufRead> SseStream<R> {
    pub(crate) fn new(reader: R, cancel: CancellationToken) -> Self {
        Self {
            reader,
            cancel,
            finished: false,
        }
    }
}

impl<R: BufRead> Iterator for SseStream<R> {
    type Item = Result<StreamChunk, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.finished {
            if self.cancel.is_cancelled() {
                self.finished = true;
                return Some(Err(LlmError::Cancelled));
            }
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => self.finished = true,
                Ok(_) => match parse_sse_line(&line) {
                    SseLine::Skip => {}
                    SseLine::Done => self.finished = true,
                    SseLine::Chunk(chunk) => return Some(Ok(chunk)),
                },
                Err(err) => {
                    self.finished = true;
                    return Some(Err(LlmError::Transport(format!("stream read error: {err}"))));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamAggregator;
    use devpilot_core::{ParamSpec, ToolCall, ToolChoice, ToolSchema};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            tools: Vec::new(),
            tool_choice: ToolChoice::auto(),
            max_tokens: 256,
            temperature: Some(0.2),
        }
    }

    fn test_config(endpoint: String) -> LlmConfig {
        LlmConfig {
            endpoint,
            api_key: Some("test-key".to_string()),
            api_key_env: "DEVPILOT_TEST_KEY_UNSET_9F2A".to_string(),
            timeout_seconds: 5,
            ..LlmConfig::default()
        }
    }

    /// Serve one canned HTTP response and return the raw request text.
    fn serve_once(status_line: &'static str, body: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 65536];
            let n = stream.read(&mut buf).expect("read request");
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            request
        });
        (format!("http://{addr}/v1/chat/completions"), handle)
    }

    #[test]
    fn parses_content_and_finish_reason() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#;
        let SseLine::Chunk(chunk) = parse_sse_line(line) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.content.as_deref(), Some("hel"));
        assert_eq!(chunk.finish_reason, None);
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
    }

    #[test]
    fn parses_tool_call_fragments_and_usage() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_9","function":{"name":"git_diff","arguments":"{\"sta"}}]}}],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        let SseLine::Chunk(chunk) = parse_sse_line(line) else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.tool_calls.len(), 1);
        let fragment = &chunk.tool_calls[0];
        assert_eq!(fragment.index, 1);
        assert_eq!(fragment.id.as_deref(), Some("call_9"));
        assert_eq!(fragment.name.as_deref(), Some("git_diff"));
        assert_eq!(fragment.args_chunk.as_deref(), Some("{\"sta"));
        assert_eq!(chunk.usage.map(|u| u.total_tokens), Some(15));
    }

    #[test]
    fn malformed_chunk_is_skipped() {
        assert_eq!(parse_sse_line("data: {not json"), SseLine::Skip);
    }

    #[test]
    fn sse_stream_stops_at_done_marker() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n\
                    data: [DONE]\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n";
        let chunks: Vec<_> = SseStream::new(body.as_bytes(), CancellationToken::new())
            .collect::<Result<_, _>>()
            .expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("a"));
    }

    #[test]
    fn sse_stream_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n";
        let mut stream = SseStream::new(body.as_bytes(), cancel);
        assert!(matches!(stream.next(), Some(Err(LlmError::Cancelled))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn payload_includes_tools_and_stream_options() {
        let mut req = request();
        req.tools = vec![
            ToolSchema {
                name: "read_file",
                description: "Read a file",
                parameters: vec![ParamSpec::required("path", "string", "Relative path")],
            }
            .to_definition(),
        ];
        req.tool_choice = ToolChoice::required();
        let payload = build_payload(&req);
        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["stream_options"]["include_usage"], json!(true));
        assert_eq!(payload["tool_choice"], json!("required"));
        assert_eq!(payload["tools"][0]["function"]["name"], json!("read_file"));
        assert_eq!(payload["messages"][1]["role"], json!("user"));
    }

    #[test]
    fn payload_omits_tool_choice_without_tools() {
        let payload = build_payload(&request());
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
    }

    #[test]
    fn assistant_tool_calls_use_openai_wire_shape() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "git_status".to_string(),
                arguments: "{}".to_string(),
            }],
        };
        let wire = message_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["type"], json!("function"));
        assert_eq!(wire["tool_calls"][0]["function"]["name"], json!("git_status"));
        assert!(wire["content"].is_null());
        let tool = message_to_wire(&ChatMessage::tool_result("call_1", "clean"));
        assert_eq!(tool["tool_call_id"], json!("call_1"));
    }

    #[test]
    fn status_classification_maps_auth_and_rate_limits() {
        let auth = classify_status(StatusCode::UNAUTHORIZED, "{}", None, "DEVPILOT_API_KEY");
        match auth {
            LlmError::Auth { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("DEVPILOT_API_KEY"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let limited = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"slow down"}}"#,
            Some(3),
            "DEVPILOT_API_KEY",
        );
        match limited {
            LlmError::Status {
                status,
                message,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
                assert_eq!(retry_after, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let seconds = reqwest::header::HeaderValue::from_static("5");
        assert_eq!(parse_retry_after_seconds(Some(&seconds)), Some(5));
        let past = reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after_seconds(Some(&past)), Some(0));
        assert_eq!(parse_retry_after_seconds(None), None);
    }

    #[test]
    fn missing_api_key_is_rejected_before_network_call() {
        let client = OpenAiCompatClient::new(LlmConfig {
            api_key: None,
            ..test_config("http://127.0.0.1:9/never".to_string())
        })
        .expect("client");
        let err = client
            .stream_chat(&request(), &CancellationToken::new())
            .err()
            .expect("missing key");
        assert!(matches!(err, LlmError::MissingApiKey(_)));
    }

    #[test]
    fn streams_and_aggregates_from_mock_server() {
        let body = [
            r#"data: {"choices":[{"delta":{"content":"Looking"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":"{\"path\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a.rs\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":20,"completion_tokens":5,"total_tokens":25}}"#,
            "data: [DONE]",
        ]
        .join("\n\n")
            + "\n";
        let (endpoint, server) = serve_once("200 OK", body);
        let client = OpenAiCompatClient::new(test_config(endpoint)).expect("client");
        let stream = client
            .stream_chat(&request(), &CancellationToken::new())
            .expect("stream");
        let out = StreamAggregator::new()
            .consume(stream, None)
            .expect("aggregate");

        assert_eq!(out.text(), "Looking");
        assert_eq!(out.tool_calls().len(), 1);
        assert_eq!(out.tool_calls()[0].arguments, "{\"path\":\"a.rs\"}");
        assert_eq!(out.finish_reason, "tool_calls");
        assert_eq!(out.usage.total_tokens, 25);

        let raw = server.join().expect("server");
        assert!(raw.contains("POST /v1/chat/completions"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer test-key"));
    }

    #[test]
    fn unauthorized_response_maps_to_auth_error() {
        let (endpoint, server) =
            serve_once("401 Unauthorized", r#"{"error":{"message":"bad key"}}"#.to_string());
        let client = OpenAiCompatClient::new(test_config(endpoint)).expect("client");
        let err = client
            .stream_chat(&request(), &CancellationToken::new())
            .err()
            .expect("auth error");
        assert!(matches!(err, LlmError::Auth { status: 401, .. }));
        assert!(!err.is_retryable());
        let _ = server.join();
    }
}
