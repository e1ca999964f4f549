use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{
    FinishReason, Message, NormalizedRequest, NormalizedResponse, ProviderType, ResponseMetadata,
    Role, TokenUsage,
};
use crate::util::http;

use super::{
    error_from_response, resolve_base, token_count, ChunkStream, ProviderAdapter, VendorRequest,
    VendorResponse,
};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini adapter. Unary only; streaming fails fast.
pub struct GeminiAdapter {
    api_base: String,
}

impl GeminiAdapter {
    pub fn new(api_base: Option<String>) -> Self {
        let base = api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            api_base: base.trim_end_matches('/').to_string(),
        }
    }

    fn probe_url(&self, api_base: Option<&str>) -> String {
        format!("{}/models", api_base.unwrap_or(&self.api_base).trim_end_matches('/'))
    }

    /// Normalize model name: strip "gemini/" or "google/" prefix.
    fn normalize_model(&self, model: &str) -> String {
        model
            .strip_prefix("gemini/")
            .or_else(|| model.strip_prefix("google/"))
            .unwrap_or(model)
            .to_string()
    }

    fn convert_messages(
        &self,
        messages: &[Message],
    ) -> (Option<serde_json::Value>, Vec<serde_json::Value>) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(json!({ "text": msg.content })),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": msg.content }]
                })),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": [{ "text": msg.content }]
                })),
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(json!({ "parts": system_parts }))
        };
        (system_instruction, contents)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    async fn is_available(&self, api_base: Option<&str>) -> bool {
        http::probe(&self.probe_url(api_base)).await
    }

    fn normalize_request(&self, request: &NormalizedRequest) -> Result<VendorRequest, ProviderError> {
        let model = self.normalize_model(&request.model);
        let (system_instruction, contents) = self.convert_messages(&request.messages);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        if let Some(system) = system_instruction {
            body["systemInstruction"] = system;
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
        let url = format!(
            "{}/models/{}:generateContent",
            resolve_base(request, &self.api_base),
            request.model
        );
        debug!("Gemini request with model {}", request.model);

        let response = http::client()
            .post(&url)
            .header("x-goog-api-key", credential)
            .header("Content-Type", "application/json")
            .json(&request.body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let mut body: serde_json::Value = response.json().await?;
        if body.get("modelVersion").is_none() {
            body["modelVersion"] = json!(request.model);
        }
        Ok(VendorResponse { body })
    }

    async fn make_stream_request(
        &self,
        _request: &VendorRequest,
        _credential: &str,
    ) -> Result<ChunkStream, ProviderError> {
        Err(ProviderError::NotImplemented {
            provider: ProviderType::Google,
            operation: "streaming",
        })
    }

    fn normalize_response(
        &self,
        response: VendorResponse,
        request_id: &str,
        response_time_ms: u64,
    ) -> Result<NormalizedResponse, ProviderError> {
        let data = response.body;
        let candidate = data
            .get("candidates")
            .and_then(|v| v.get(0))
            .ok_or_else(|| ProviderError::Parse("No candidates in response".to_string()))?;

        let finish_reason = match candidate.get("finishReason").and_then(|v| v.as_str()) {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Stop,
        };

        // Blocked candidates carry no parts.
        let content: String = candidate
            .get("content")
            .and_then(|v| v.get("parts"))
            .and_then(|v| v.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        if content.is_empty() && finish_reason != FinishReason::ContentFilter {
            return Err(ProviderError::Parse("No parts in response".to_string()));
        }

        let usage = data
            .get("usageMetadata")
            .map(|u| {
                TokenUsage::new(
                    token_count(u, "promptTokenCount"),
                    token_count(u, "candidatesTokenCount"),
                )
            })
            .unwrap_or_default();

        Ok(NormalizedResponse {
            id: data
                .get("responseId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| request_id.to_string()),
            content,
            model: data
                .get("modelVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            provider: ProviderType::Google,
            usage,
            finish_reason,
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
