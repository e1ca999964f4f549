use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ProviderType;

/// One successful completion, attributed to the provider that served it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub provider_type: ProviderType,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration_ms: u64,
}

/// A stored event with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: UsageEvent,
}

/// Aggregated usage for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

/// Receives usage events. Recording must not fail the request.
pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _event: UsageEvent) {}
}

/// In-memory usage tracker (for local dev/testing).
#[derive(Debug, Default)]
pub struct InMemoryUsageTracker {
    records: std::sync::Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn summary(&self, user_id: &str) -> UsageSummary {
        let records = match self.records.lock() {
            Ok(r) => r,
            Err(_) => return UsageSummary::default(),
        };

        let mut summary = UsageSummary::default();
        for event in records.iter().map(|r| &r.event).filter(|e| e.user_id == user_id) {
            summary.requests += 1;
            summary.total_prompt_tokens += event.prompt_tokens as u64;
            summary.total_completion_tokens += event.completion_tokens as u64;
        }
        summary
    }
}

impl UsageSink for InMemoryUsageTracker {
    fn record(&self, event: UsageEvent) {
        let record = UsageRecord {
            recorded_at: Utc::now(),
            event,
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: &str, provider_type: ProviderType, prompt: u32, completion: u32) -> UsageEvent {
        UsageEvent {
            user_id: user.into(),
            workspace_id: None,
            provider_type,
            model: "m".into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            duration_ms: 5,
        }
    }

    #[test]
    fn test_in_memory_usage_tracker() {
        let tracker = InMemoryUsageTracker::new();
        tracker.record(event("user1", ProviderType::OpenAi, 1000, 500));
        tracker.record(event("user1", ProviderType::Anthropic, 2000, 1000));
        tracker.record(event("user2", ProviderType::OpenAi, 500, 200));

        let summary1 = tracker.summary("user1");
        assert_eq!(summary1.requests, 2);
        assert_eq!(summary1.total_prompt_tokens, 3000);
        assert_eq!(summary1.total_completion_tokens, 1500);

        assert_eq!(tracker.summary("user2").requests, 1);
        assert_eq!(tracker.summary("nobody"), UsageSummary::default());
        assert_eq!(tracker.events()[1].provider_type, ProviderType::Anthropic);
    }

    #[test]
    fn test_records_are_timestamped_in_order() {
        let tracker = InMemoryUsageTracker::new();
        tracker.record(event("u", ProviderType::OpenAi, 1, 1));
        tracker.record(event("u", ProviderType::OpenAi, 2, 2));
        let records = tracker.records();
        assert!(records[0].recorded_at <= records[1].recorded_at);

        let json = serde_json::to_value(&records[0]).unwrap();
        assert!(json.get("recordedAt").is_some());
        assert_eq!(json["userId"], "u");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let json = serde_json::to_value(event("u", ProviderType::Google, 1, 2)).unwrap();
        assert_eq!(json["providerType"], "google");
        assert_eq!(json["promptTokens"], 1);
        assert_eq!(json["durationMs"], 5);
    }
}
