use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{
    FinishReason, NormalizedRequest, NormalizedResponse, ProviderType, ResponseMetadata, TokenUsage,
};
use crate::util::http;

use super::sse::SseBuffer;
use super::{
    error_from_response, resolve_base, token_count, truncated_stream, ChunkStream, ProviderAdapter,
    VendorChunk, VendorRequest, VendorResponse,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions adapter.
/// Also fits any OpenAI-compatible endpoint (vLLM, OpenRouter, ...) via `api_base`.
pub struct OpenAiCompatAdapter {
    api_base: String,
}

impl OpenAiCompatAdapter {
    pub fn new(api_base: Option<String>) -> Self {
        let base = api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            api_base: base.trim_end_matches('/').to_string(),
        }
    }

    fn probe_url(&self, api_base: Option<&str>) -> String {
        format!("{}/models", api_base.unwrap_or(&self.api_base).trim_end_matches('/'))
    }

    /// Strip the "openai/" routing prefix.
    fn normalize_model(&self, model: &str) -> String {
        model.strip_prefix("openai/").unwrap_or(model).to_string()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAi
    }

    async fn is_available(&self, api_base: Option<&str>) -> bool {
        http::probe(&self.probe_url(api_base)).await
    }

    fn normalize_request(&self, request: &NormalizedRequest) -> Result<VendorRequest, ProviderError> {
        let model = self.normalize_model(&request.model);
        let msgs: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = json!({
            "model": model,
            "messages": msgs,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !request.user_id.is_empty() {
            body["user"] = json!(request.user_id);
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
        let url = format!("{}/chat/completions", resolve_base(request, &self.api_base));
        debug!("OpenAI request to {} with model {}", url, request.model);

        let response = http::client()
            .post(&url)
            .bearer_auth(credential)
            .json(&request.body)
            .send()
            .await?;

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
        let url = format!("{}/chat/completions", resolve_base(request, &self.api_base));
        let mut body = request.body.clone();
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
        debug!("OpenAI stream request to {} with model {}", url, request.model);

        let response = http::client()
            .post(&url)
            .bearer_auth(credential)
            .json(&body)
            .send()
            .await?;

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
        let choice = data
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ProviderError::Parse("No choices in response".to_string()))?;

        let message = choice
            .get("message")
            .ok_or_else(|| ProviderError::Parse("No message in choice".to_string()))?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

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
            provider: ProviderType::OpenAi,
            usage: data.get("usage").map(parse_usage).unwrap_or_default(),
            finish_reason: map_finish_reason(choice.get("finish_reason").and_then(|v| v.as_str())),
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

/// Decode an SSE body into chunks. A body that stops before `[DONE]` and
/// without a finish reason fails as truncated.
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
                if data == "[DONE]" {
                    terminated = true;
                    break 'read;
                }
                if let Some(out) = state.apply(&data)? {
                    yield out;
                }
            }
        }
        if !terminated {
            match sse.finish() {
                Some(data) if data == "[DONE]" => terminated = true,
                Some(data) => {
                    if let Some(out) = state.apply(&data)? {
                        yield out;
                    }
                }
                None => {}
            }
        }
        let last = state.finish(terminated)?;
        yield last;
    };

    Box::pin(stream)
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_usage(u: &serde_json::Value) -> TokenUsage {
    let prompt = token_count(u, "prompt_tokens");
    let completion = token_count(u, "completion_tokens");
    match token_count(u, "total_tokens") {
        0 => TokenUsage::new(prompt, completion),
        total => TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        },
    }
}

/// Accumulates `chat.completion.chunk` events.
#[derive(Debug, Default)]
struct StreamState {
    content: String,
    usage: TokenUsage,
    finish_reason: Option<FinishReason>,
}

impl StreamState {
    fn apply(&mut self, data: &str) -> Result<Option<VendorChunk>, ProviderError> {
        let parsed: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::Parse(format!("Invalid stream chunk: {e}")))?;

        if let Some(err) = parsed.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown stream error");
            return Err(ProviderError::Stream(message.to_string()));
        }
        if let Some(u) = parsed.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(u);
        }

        let Some(choice) = parsed.get("choices").and_then(|c| c.get(0)) else {
            return Ok(None);
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(map_finish_reason(Some(reason)));
        }
        match choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            Some(delta) if !delta.is_empty() => {
                self.content.push_str(delta);
                Ok(Some(VendorChunk::partial(self.content.clone(), delta)))
            }
            _ => Ok(None),
        }
    }

    /// Terminal chunk. `terminated` is whether `[DONE]` arrived; a finish
    /// reason alone also counts as a complete answer.
    fn finish(&mut self, terminated: bool) -> Result<VendorChunk, ProviderError> {
        let Some(finish_reason) = self.finish_reason.or(terminated.then_some(FinishReason::Stop))
        else {
            return Err(truncated_stream());
        };
        Ok(VendorChunk::finished(
            std::mem::take(&mut self.content),
            "",
            self.usage,
            finish_reason,
        ))
    }
}
