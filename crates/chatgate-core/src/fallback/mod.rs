//! Fallback policy and the chain state machine.
//!
//! The orchestrator in [`orchestrator`] drives a [`ChainWalk`] through
//! `BuildChain → TryProvider(i) → (Success | NextProvider(i)) → … → Exhausted`.

pub mod orchestrator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ProviderType;

pub use orchestrator::{FallbackOrchestrator, ResponseStream};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fallback_order: Vec<ProviderType>,
    pub skip_providers: Vec<ProviderType>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay_ms: 1000,
            fallback_order: ProviderType::ALL.to_vec(),
            skip_providers: Vec::new(),
        }
    }
}

impl FallbackConfig {
    /// Apply per-request overrides on top of this config.
    pub fn merged(&self, overrides: Option<&FallbackOverrides>) -> FallbackConfig {
        match overrides {
            Some(o) => o.apply(self),
            None => self.clone(),
        }
    }

    /// Delay before the attempt that follows failed candidate `failed_index`.
    pub fn backoff(&self, failed_index: usize) -> Duration {
        backoff_delay(self.retry_delay_ms, failed_index)
    }
}

/// Partial [`FallbackConfig`] supplied per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_order: Option<Vec<ProviderType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_providers: Option<Vec<ProviderType>>,
}

impl FallbackOverrides {
    pub fn disabled() -> Self {
        Self {
            enabled: Some(false),
            ..Default::default()
        }
    }

    pub fn apply(&self, base: &FallbackConfig) -> FallbackConfig {
        FallbackConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            fallback_order: self
                .fallback_order
                .clone()
                .unwrap_or_else(|| base.fallback_order.clone()),
            skip_providers: self
                .skip_providers
                .clone()
                .unwrap_or_else(|| base.skip_providers.clone()),
        }
    }
}

/// Linear backoff: `retry_delay_ms * (failed_index + 1)`.
pub fn backoff_delay(retry_delay_ms: u64, failed_index: usize) -> Duration {
    Duration::from_millis(retry_delay_ms.saturating_mul(failed_index as u64 + 1))
}

/// Ordered candidates for one call: the primary, then the first `max_retries`
/// distinct non-primary entries of the configured order with skipped ones
/// removed. A skipped provider still uses up its retry slot, so the chain
/// never exceeds `max_retries + 1` candidates.
pub fn build_chain(primary: ProviderType, config: &FallbackConfig) -> Vec<ProviderType> {
    let mut chain = vec![primary];
    if !config.enabled {
        return chain;
    }

    let mut window: Vec<ProviderType> = Vec::new();
    for &candidate in &config.fallback_order {
        if window.len() == config.max_retries as usize {
            break;
        }
        if candidate != primary && !window.contains(&candidate) {
            window.push(candidate);
        }
    }
    chain.extend(
        window
            .into_iter()
            .filter(|candidate| !config.skip_providers.contains(candidate)),
    );
    chain
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    BuildChain,
    TryProvider(usize),
    /// Candidate `i` failed and another remains; waiting out the backoff.
    NextProvider(usize),
    Success(usize),
    Exhausted,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Exhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Built,
    Succeeded,
    Failed(String),
    BackoffElapsed,
}

/// Pure transition function. Events that do not apply to `state` leave it unchanged.
pub fn transition(state: ChainState, event: &ChainEvent, chain_len: usize) -> ChainState {
    match (state, event) {
        (ChainState::BuildChain, ChainEvent::Built) if chain_len > 0 => ChainState::TryProvider(0),
        (ChainState::BuildChain, ChainEvent::Built) => ChainState::Exhausted,
        (ChainState::TryProvider(i), ChainEvent::Succeeded) => ChainState::Success(i),
        (ChainState::TryProvider(i), ChainEvent::Failed(_)) if i + 1 < chain_len => {
            ChainState::NextProvider(i)
        }
        (ChainState::TryProvider(_), ChainEvent::Failed(_)) => ChainState::Exhausted,
        (ChainState::NextProvider(i), ChainEvent::BackoffElapsed) => ChainState::TryProvider(i + 1),
        (state, _) => state,
    }
}

/// One walk over a candidate chain, with the failure log needed for the
/// final error.
#[derive(Debug, Clone)]
pub struct ChainWalk {
    chain: Vec<ProviderType>,
    state: ChainState,
    failures: Vec<(ProviderType, String)>,
}

impl ChainWalk {
    pub fn new(primary: ProviderType, config: &FallbackConfig) -> Self {
        Self::from_chain(build_chain(primary, config))
    }

    pub fn from_chain(chain: Vec<ProviderType>) -> Self {
        Self {
            chain,
            state: ChainState::BuildChain,
            failures: Vec::new(),
        }
    }

    pub fn chain(&self) -> &[ProviderType] {
        &self.chain
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Candidate under test, when in `TryProvider`.
    pub fn current(&self) -> Option<(usize, ProviderType)> {
        match self.state {
            ChainState::TryProvider(i) => self.chain.get(i).map(|&pt| (i, pt)),
            _ => None,
        }
    }

    pub fn advance(&mut self, event: ChainEvent) -> ChainState {
        let next = transition(self.state, &event, self.chain.len());
        if let (ChainState::TryProvider(i), ChainEvent::Failed(reason)) = (self.state, event) {
            if next != self.state {
                self.failures.push((self.chain[i], reason));
            }
        }
        self.state = next;
        next
    }

    pub fn attempts(&self) -> usize {
        match self.state {
            ChainState::Success(i) => i + 1,
            _ => self.failures.len(),
        }
    }

    pub fn failures(&self) -> &[(ProviderType, String)] {
        &self.failures
    }

    pub fn last_error(&self) -> String {
        self.failures
            .last()
            .map(|(pt, reason)| format!("{pt}: {reason}"))
            .unwrap_or_else(|| "no provider candidates".to_string())
    }
}
