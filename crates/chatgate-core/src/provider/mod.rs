pub mod anthropic;
pub mod gemini;
pub mod openai_compat;
pub mod sse;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ProviderError;
use crate::types::{FinishReason, NormalizedRequest, NormalizedResponse, ProviderType, TokenUsage};

/// Vendor-shaped request produced by [`ProviderAdapter::normalize_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRequest {
    /// Model id as the vendor expects it.
    pub model: String,
    pub body: serde_json::Value,
    pub stream: bool,
    /// Per-instance endpoint override.
    pub api_base: Option<String>,
}

/// Raw vendor response body.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorResponse {
    pub body: serde_json::Value,
}

/// One partial result from a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorChunk {
    pub content: String,
    pub delta: String,
    pub done: bool,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
}

impl VendorChunk {
    pub fn partial(content: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            delta: delta.into(),
            done: false,
            usage: None,
            finish_reason: None,
        }
    }

    pub fn finished(
        content: impl Into<String>,
        delta: impl Into<String>,
        usage: TokenUsage,
        finish_reason: FinishReason,
    ) -> Self {
        Self {
            content: content.into(),
            delta: delta.into(),
            done: true,
            usage: Some(usage),
            finish_reason: Some(finish_reason),
        }
    }
}

/// Lazy, finite sequence of chunks. Dropping it releases the underlying connection.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<VendorChunk, ProviderError>> + Send>>;

/// Capability contract every upstream vendor implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Cheap liveness probe against `api_base`, or the adapter's own endpoint
    /// when `None`. Never errors; any probe failure is `false`.
    async fn is_available(&self, api_base: Option<&str>) -> bool;

    fn normalize_request(&self, request: &NormalizedRequest) -> Result<VendorRequest, ProviderError>;

    async fn make_request(
        &self,
        request: &VendorRequest,
        credential: &str,
    ) -> Result<VendorResponse, ProviderError>;

    async fn make_stream_request(
        &self,
        request: &VendorRequest,
        credential: &str,
    ) -> Result<ChunkStream, ProviderError>;

    fn normalize_response(
        &self,
        response: VendorResponse,
        request_id: &str,
        response_time_ms: u64,
    ) -> Result<NormalizedResponse, ProviderError>;
}

/// Adapter lookup by provider type.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled adapters. `api_bases` overrides vendor endpoints.
    pub fn with_defaults(api_bases: &HashMap<ProviderType, String>) -> Self {
        let base = |pt: ProviderType| api_bases.get(&pt).cloned();
        let mut registry = Self::new();
        registry.register(Arc::new(openai_compat::OpenAiCompatAdapter::new(base(
            ProviderType::OpenAi,
        ))));
        registry.register(Arc::new(anthropic::AnthropicAdapter::new(base(
            ProviderType::Anthropic,
        ))));
        registry.register(Arc::new(gemini::GeminiAdapter::new(base(ProviderType::Google))));
        registry
    }

    /// Register an adapter, replacing any previous adapter for the same type.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
        self.adapters.insert(adapter.provider_type(), adapter);
        self
    }

    pub fn get(&self, provider_type: ProviderType) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider_type).cloned()
    }

    pub fn contains(&self, provider_type: ProviderType) -> bool {
        self.adapters.contains_key(&provider_type)
    }

    /// Registered provider types, sorted.
    pub fn provider_types(&self) -> Vec<ProviderType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort();
        types
    }
}

/// Map a non-success HTTP status and body to a typed error.
pub fn classify_status(status: u16, body: &str, retry_after: Option<u64>) -> ProviderError {
    let message = vendor_error_message(body);
    match status {
        401 | 403 => ProviderError::Unauthorized { status, message },
        429 => ProviderError::RateLimited {
            retry_after: retry_after.or_else(|| retry_after_from_body(body)),
            message,
        },
        _ => ProviderError::Api { status, message },
    }
}

/// Consume a failed response into a [`ProviderError`].
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body, retry_after)
}

/// Prefer the vendor's `error.message` field, falling back to the raw body.
fn vendor_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let msg = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .or_else(|| json.get("message").and_then(|m| m.as_str()));
        if let Some(msg) = msg {
            return msg.to_string();
        }
    }
    body.trim().to_string()
}

fn retry_after_from_body(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

/// Read a vendor token count, clamping values that do not fit in `u32`.
pub(crate) fn token_count(usage: &serde_json::Value, field: &str) -> u32 {
    usage
        .get(field)
        .and_then(|v| v.as_u64())
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

pub(crate) fn truncated_stream() -> ProviderError {
    ProviderError::Stream("stream ended before completion".to_string())
}

/// Trim a trailing slash so paths can be appended with `format!`.
pub(crate) fn resolve_base<'a>(request: &'a VendorRequest, default: &'a str) -> &'a str {
    request
        .api_base
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
}
