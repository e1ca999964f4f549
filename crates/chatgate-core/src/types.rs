use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::fallback::FallbackOverrides;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// Upstream vendor families known to the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    #[serde(alias = "gemini")]
    Google,
    Straico,
    Cohere,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::OpenAi,
        ProviderType::Anthropic,
        ProviderType::Google,
        ProviderType::Straico,
        ProviderType::Cohere,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Google => "google",
            ProviderType::Straico => "straico",
            ProviderType::Cohere => "cohere",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAi),
            "anthropic" => Ok(ProviderType::Anthropic),
            "google" | "gemini" => Ok(ProviderType::Google),
            "straico" => Ok(ProviderType::Straico),
            "cohere" => Ok(ProviderType::Cohere),
            other => Err(format!("unknown provider type: {other}")),
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Vendor-agnostic request handed to adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
    pub user_id: String,
    pub workspace_id: Option<String>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub response_time_ms: u64,
    pub cached: bool,
    pub fallback_used: bool,
    pub original_provider: Option<ProviderType>,
}

/// Vendor-agnostic completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResponse {
    pub id: String,
    pub content: String,
    pub model: String,
    pub provider: ProviderType,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub metadata: ResponseMetadata,
}

/// One element of a streamed completion as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingResponse {
    pub id: String,
    /// Everything generated so far.
    pub content: String,
    pub delta: String,
    pub done: bool,
    /// Present on the terminal element only.
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub provider: ProviderType,
}

/// Input to the facade entry points.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub provider_instance_id: String,
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub fallback: Option<FallbackOverrides>,
}

impl ChatParams {
    pub fn new(
        provider_instance_id: impl Into<String>,
        user_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            provider_instance_id: provider_instance_id.into(),
            user_id: user_id.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackOverrides) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// A caller's configured binding to one vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub id: String,
    pub user_id: String,
    pub provider_type: ProviderType,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    pub encrypted_credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

impl ProviderInstance {
    /// Build the request this instance would send, filling gaps from its defaults.
    pub fn build_request(
        &self,
        params: &ChatParams,
        model_override: Option<&str>,
        stream: bool,
    ) -> NormalizedRequest {
        NormalizedRequest {
            messages: params.messages.clone(),
            model: model_override
                .map(str::to_string)
                .unwrap_or_else(|| self.default_model.clone()),
            max_tokens: params.max_tokens.unwrap_or(self.default_max_tokens),
            temperature: params.temperature.unwrap_or(self.default_temperature),
            stream,
            user_id: params.user_id.clone(),
            workspace_id: params.workspace_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ProviderInstance {
        ProviderInstance {
            id: "inst-1".into(),
            user_id: "user-1".into(),
            provider_type: ProviderType::OpenAi,
            is_active: true,
            default_model: "gpt-4o-mini".into(),
            default_max_tokens: 512,
            default_temperature: 0.2,
            encrypted_credential: "sk-test".into(),
            api_base: None,
        }
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::System.to_string(), "system");
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_finish_reason_serde() {
        let json = serde_json::to_string(&FinishReason::ContentFilter).unwrap();
        assert_eq!(json, "\"content_filter\"");
        let fr: FinishReason = serde_json::from_str("\"length\"").unwrap();
        assert_eq!(fr, FinishReason::Length);
    }

    #[test]
    fn test_provider_type_parse_and_serde() {
        assert_eq!("OpenAI".parse::<ProviderType>().unwrap(), ProviderType::OpenAi);
        assert_eq!("gemini".parse::<ProviderType>().unwrap(), ProviderType::Google);
        assert!("mistral".parse::<ProviderType>().is_err());

        assert_eq!(serde_json::to_string(&ProviderType::OpenAi).unwrap(), "\"openai\"");
        let pt: ProviderType = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(pt, ProviderType::Google);
        for pt in ProviderType::ALL {
            assert_eq!(pt.as_str().parse::<ProviderType>().unwrap(), pt);
        }
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(TokenUsage::new(u32::MAX, 5).total_tokens, u32::MAX);
    }

    #[test]
    fn test_build_request_uses_defaults() {
        let params = ChatParams::new("inst-1", "user-1", vec![Message::user("hi")]);
        let req = instance().build_request(&params, None, false);
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.max_tokens, 512);
        assert_eq!(req.temperature, 0.2);
        assert!(!req.stream);
    }

    #[test]
    fn test_build_request_prefers_params() {
        let params = ChatParams::new("inst-1", "user-1", vec![Message::user("hi")])
            .with_max_tokens(100)
            .with_temperature(0.9)
            .with_workspace("ws-1");
        let req = instance().build_request(&params, Some("gpt-4"), true);
        assert_eq!(req.model, "gpt-4");
        assert_eq!(req.max_tokens, 100);
        assert_eq!(req.temperature, 0.9);
        assert!(req.stream);
        assert_eq!(req.workspace_id.as_deref(), Some("ws-1"));
    }

    #[test]
    fn test_instance_deserialize_defaults() {
        let json = r#"{
            "id": "a1",
            "userId": "u1",
            "providerType": "anthropic",
            "defaultModel": "claude-sonnet-4-5",
            "encryptedCredential": "blob"
        }"#;
        let inst: ProviderInstance = serde_json::from_str(json).unwrap();
        assert!(inst.is_active);
        assert_eq!(inst.provider_type, ProviderType::Anthropic);
        assert_eq!(inst.default_max_tokens, 4096);
        assert!(inst.api_base.is_none());
    }
}
