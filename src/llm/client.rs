//! reqwest client for `<base_url>/chat/completions`.

use super::stream::{SseParser, StreamAccumulator};
use super::{AssistantReply, ChatBackend, LlmError};
use crate::conversation::{Message, ToolCall};
use crate::tools::ToolDefinition;
use crate::util::truncate;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub stream: bool,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    stream: bool,
    base_delay: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    /// A JSON string per the API, but some servers send the object itself.
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// `<base>/chat/completions`, whether or not `base` ends with a slash.
pub fn endpoint_url(base_url: &str) -> Result<Url, url::ParseError> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)?.join("chat/completions")
}

/// Map a non-success HTTP status and body to an error.
fn classify_status(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| truncate(body.trim(), 200));
    match status {
        401 | 403 => LlmError::Auth(message),
        429 | 500 | 502 | 503 | 504 => LlmError::Transient(format!("HTTP {status}: {message}")),
        _ => LlmError::Api { status, message },
    }
}

fn classify_reqwest(err: reqwest::Error) -> LlmError {
    if err.is_decode() {
        LlmError::Parse(err.to_string())
    } else {
        // Connect failures, timeouts and dropped connections.
        LlmError::Transient(err.to_string())
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
}

fn parse_response(body: &str) -> Result<AssistantReply, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Parse(format!("{e}: {}", truncate(body, 200))))?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| LlmError::Parse("response contained no choices".to_string()))?;

    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: match call.function.arguments {
                serde_json::Value::String(text) => text,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            },
        })
        .collect();

    Ok(AssistantReply::with_tool_calls(message.content, tool_calls))
}

impl OpenAiClient {
    pub fn new(settings: ClientSettings) -> Result<Self, LlmError> {
        let endpoint = endpoint_url(&settings.base_url).map_err(|e| LlmError::Api {
            status: 0,
            message: format!("invalid base URL '{}': {e}", settings.base_url),
        })?;
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            model: settings.model,
            api_key: settings.api_key.filter(|k| !k.trim().is_empty()),
            stream: settings.stream,
            base_delay: BASE_RETRY_DELAY,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    async fn send_once(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<AssistantReply, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            tools,
            tool_choice: (!tools.is_empty()).then_some("auto"),
            stream: self.stream,
        };

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        if self.stream {
            consume_stream(response).await
        } else {
            let text = response.text().await.map_err(classify_reqwest)?;
            parse_response(&text)
        }
    }

    async fn send_with_retry(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<AssistantReply, LlmError> {
        let mut attempt = 0;
        loop {
            debug!(endpoint = %self.endpoint, model = %self.model, attempt, "chat request");
            match self.send_once(messages, tools).await {
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let delay = retry_delay(self.base_delay, attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

async fn consume_stream(response: reqwest::Response) -> Result<AssistantReply, LlmError> {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();
    let mut accumulator = StreamAccumulator::default();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| LlmError::Transient(format!("stream read failed: {e}")))?;
        for payload in parser.push(&bytes) {
            if accumulator.apply(&payload)? {
                return Ok(accumulator.finish());
            }
        }
    }
    if let Some(payload) = parser.finish() {
        accumulator.apply(&payload)?;
    }
    Ok(accumulator.finish())
}

impl ChatBackend for OpenAiClient {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDefinition],
    ) -> impl Future<Output = Result<AssistantReply, LlmError>> + Send + 'a {
        self.send_with_retry(messages, tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::get_tool_definitions;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("http://localhost:1234/v1").unwrap().as_str(),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            endpoint_url("https://api.openai.com/v1/").unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert!(endpoint_url("not a url").is_err());
    }

    #[test]
    fn test_classify_status() {
        let body = r#"{"error": {"message": "Incorrect API key provided"}}"#;
        match classify_status(401, body) {
            LlmError::Auth(message) => assert_eq!(message, "Incorrect API key provided"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(classify_status(429, "slow down").is_transient());
        assert!(classify_status(503, "").is_transient());
        assert!(matches!(
            classify_status(400, "bad request"),
            LlmError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(base, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(base, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(4));
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function", "function": {"name": "read", "arguments": "{\"path\":\"a\"}"}},
                        {"id": "c2", "type": "function", "function": {"name": "ls", "arguments": {"path": "src"}}}
                    ]
                }
            }]
        }"#;
        let reply = parse_response(body).unwrap();
        assert_eq!(reply.content, None);
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].arguments, r#"{"path":"a"}"#);
        assert_eq!(reply.tool_calls[1].arguments, r#"{"path":"src"}"#);
    }

    #[test]
    fn test_parse_response_errors() {
        assert!(matches!(parse_response("<html>"), Err(LlmError::Parse(_))));
        assert!(matches!(
            parse_response(r#"{"choices": []}"#),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let tools = get_tool_definitions();
        let body = serde_json::to_value(ChatRequest {
            model: "m",
            messages: &messages,
            tools: &tools,
            tool_choice: Some("auto"),
            stream: false,
        })
        .unwrap();
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["tools"].as_array().unwrap().len(), 7);

        let body = serde_json::to_value(ChatRequest {
            model: "m",
            messages: &messages,
            tools: &[],
            tool_choice: None,
            stream: true,
        })
        .unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    /// Serve one canned HTTP response per connection, in order.
    async fn serve(responses: Vec<(u16, &'static str, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            for (status, content_type, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let head = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(body.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (format!("http://{addr}/v1"), hits)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn client(base_url: String, stream: bool) -> OpenAiClient {
        OpenAiClient::new(ClientSettings {
            base_url,
            model: "test-model".to_string(),
            api_key: Some("sk-test".to_string()),
            timeout: Duration::from_secs(10),
            stream,
        })
        .unwrap()
        .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_retries_transient_status_then_succeeds() {
        let ok = r#"{"choices":[{"message":{"role":"assistant","content":"done"}}]}"#;
        let (base, hits) = serve(vec![
            (503, "text/plain", "busy".to_string()),
            (429, "text/plain", "rate limited".to_string()),
            (200, "application/json", ok.to_string()),
        ])
        .await;

        let reply = client(base, false)
            .complete(&[Message::user("hi")], &[])
            .await
            .unwrap();
        assert_eq!(reply, AssistantReply::text("done"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_auth_errors() {
        let (base, hits) = serve(vec![(
            401,
            "application/json",
            r#"{"error":{"message":"bad key"}}"#.to_string(),
        )])
        .await;

        let err = client(base, false)
            .complete(&[Message::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let responses = (0..=MAX_RETRIES)
            .map(|_| (500, "text/plain", "boom".to_string()))
            .collect();
        let (base, hits) = serve(responses).await;

        let err = client(base, false)
            .complete(&[Message::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), MAX_RETRIES as usize + 1);
    }

    #[tokio::test]
    async fn test_streaming_response() {
        let body = [
            r#"data: {"choices":[{"delta":{"role":"assistant","content":"Reading"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"read","arguments":"{\"path\""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"a.txt\"}"}}]}}]}"#,
            "data: [DONE]",
        ]
        .join("\n\n")
            + "\n\n";
        let (base, _hits) = serve(vec![(200, "text/event-stream", body)]).await;

        let reply = client(base, true)
            .complete(&[Message::user("hi")], &get_tool_definitions())
            .await
            .unwrap();
        assert_eq!(reply.content.as_deref(), Some("Reading"));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].arguments, r#"{"path":"a.txt"}"#);
    }
}
