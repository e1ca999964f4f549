use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{
    FinishReason, Message, NormalizedRequest, NormalizedResponse, ProviderType, ResponseMetadata,
    Role, TokenUsage,
};
use crate::util::http;

use super::sse::SseBuffer;
use super::{
    error_from_response, resolve_base, token_count, truncated_stream, ChunkStream, ProviderAdapter,
    VendorChunk, VendorRequest, VendorResponse,
};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Native Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    api_base: String,
}

impl AnthropicAdapter {
    pub fn new(api_base: Option<String>) -> Self {
        let base = api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            api_base: base.trim_end_matches('/').to_string(),
        }
    }

    fn probe_url(&self, api_base: Option<&str>) -> String {
        format!("{}/v1/models", api_base.unwrap_or(&self.api_base).trim_end_matches('/'))
    }

    /// Normalize model name: strip "anthropic/" prefix.
    fn normalize_model(&self, model: &str) -> String {
        model
            .strip_prefix("anthropic/")
            .unwrap_or(model)
            .to_string()
    }

    /// Anthropic expects system text as a separate top-level field.
    fn convert_messages(&self, messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User => converted.push(json!({ "role": "user", "content": msg.content })),
                Role::Assistant => {
                    converted.push(json!({ "role": "assistant", "content": msg.content }))
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, converted)
    }

    fn post(&self, url: &str, credential: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        http::client()
            .post(url)
            .header("x-api-key", credential)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn is_available(&self, api_base: Option<&str>) -> bool {
        http::probe(&self.probe_url(api_base)).await
    }

    fn normalize_request(&self, request: &NormalizedRequest) -> Result<VendorRequest, ProviderError> {
        let model = self.normalize_model(&request.model);
        let (system, msgs) = self.convert_messages(&request.messages);
        if msgs.is_empty() {
            return Err(ProviderError::Other(
                "Anthropic requires at least one user or assistant message".to_string(),
            ));
        }

        let mut body = json!({
            "model": model,
            "messages": msgs,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if request.stream {
            body["stream"] = json!(true);
        }

        Ok(VendorRequest {
            model,
            body,
            stream: request.stream,
            api_base: None,
        })
    }

    async fn make_request(
        &self,
        request: &VendorRequest,
        credential: &str,
    ) -> Result<VendorResponse, ProviderError> {
        let url = format!("{}/v1/messages", resolve_base(request, &self.api_base));
        debug!("Anthropic request to {} with model {}", url, request.model);

        let response = self.post(&url, credential, &request.body).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: serde_json::Value = response.json().await?;
        Ok(VendorResponse { body })
    }

    async fn make_stream_request(
        &self,
        request: &VendorRequest,
        credential: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}/v1/messages", resolve_base(request, &self.api_base));
        let mut body = request.body.clone();
        body["stream"] = json!(true);
        debug!("Anthropic stream request to {} with model {}", url, request.model);

        let response = self.post(&url, credential, &body).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        Ok(chunk_stream(response.bytes_stream()))
    }

    fn normalize_response(
        &self,
        response: VendorResponse,
        request_id: &str,
        response_time_ms: u64,
    ) -> Result<NormalizedResponse, ProviderError> {
        let data = response.body;
        let blocks = data
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::Parse("No content in response".to_string()))?;

        let content: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();

        let usage = data
            .get("usage")
            .map(|u| {
                TokenUsage::new(token_count(u, "input_tokens"), token_count(u, "output_tokens"))
            })
            .unwrap_or_default();

        Ok(NormalizedResponse {
            id: data
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| request_id.to_string()),
            content,
            model: data
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            provider: ProviderType::Anthropic,
            usage,
            finish_reason: map_stop_reason(data.get("stop_reason").and_then(|v| v.as_str())),
            metadata: ResponseMetadata {
                request_id: request_id.to_string(),
                response_time_ms,
                cached: false,
                fallback_used: false,
                original_provider: None,
            },
        })
    }
}

/// Decode a Messages SSE body. The body must reach `message_stop` or carry a
/// stop reason, otherwise the stream fails as truncated.
fn chunk_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut sse = SseBuffer::new();
        let mut state = StreamState::default();
        let mut terminated = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Stream(e.to_string()))?;
            for data in sse.push(chunk.as_ref()) {
                match state.apply(&data)? {
                    Event::Delta(out) => {
                        yield out;
                    }
                    Event::Stop => {
                        terminated = true;
                        break 'read;
                    }
                    Event::None => {}
                }
            }
        }
        let last = state.finish(terminated)?;
        yield last;
    };

    Box::pin(stream)
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

enum Event {
    Delta(VendorChunk),
    Stop,
    None,
}

#[derive(Debug, Default)]
struct StreamState {
    content: String,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl StreamState {
    fn apply(&mut self, data: &str) -> Result<Event, ProviderError> {
        let parsed: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::Parse(format!("Invalid stream event: {e}")))?;

        match parsed.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                if let Some(u) = parsed.get("message").and_then(|m| m.get("usage")) {
                    self.usage.prompt_tokens = token_count(u, "input_tokens");
                }
                Ok(Event::None)
            }
            "content_block_delta" => {
                let text = parsed
                    .get("delta")
                    .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                if text.is_empty() {
                    return Ok(Event::None);
                }
                self.content.push_str(text);
                Ok(Event::Delta(VendorChunk::partial(self.content.clone(), text)))
            }
            "message_delta" => {
                if let Some(sr) = parsed
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    self.finish_reason = Some(map_stop_reason(Some(sr)));
                }
                if let Some(u) = parsed.get("usage") {
                    self.usage.completion_tokens = token_count(u, "output_tokens");
                }
                Ok(Event::None)
            }
            "message_stop" => Ok(Event::Stop),
            "error" => {
                let message = parsed
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown stream error");
                Err(ProviderError::Stream(message.to_string()))
            }
            _ => Ok(Event::None),
        }
    }

    fn finish(&mut self, terminated: bool) -> Result<VendorChunk, ProviderError> {
        let Some(finish_reason) = self.finish_reason.or(terminated.then_some(FinishReason::Stop))
        else {
            return Err(truncated_stream());
        };
        let usage = TokenUsage::new(self.usage.prompt_tokens, self.usage.completion_tokens);
        Ok(VendorChunk::finished(
            std::mem::take(&mut self.content),
            "",
            usage,
            finish_reason,
        ))
    }
}
