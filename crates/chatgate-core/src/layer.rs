//! The abstraction layer facade: one entry point for unary and streaming chat
//! completions across every registered provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::{CacheOptions, CacheStats, ResponseCache, DEFAULT_SWEEP_INTERVAL};
use crate::config::{Config, ProviderRegistry};
use crate::error::{ConfigError, Result};
use crate::fallback::{FallbackConfig, FallbackOrchestrator, ResponseStream};
use crate::provider::{AdapterRegistry, ProviderAdapter};
use crate::service::usage::{NoopUsageSink, UsageSink};
use crate::service::vault::CredentialDecryptor;
use crate::types::{ChatParams, NormalizedResponse, ProviderInstance};

pub struct AbstractionLayer {
    registry: Arc<dyn ProviderRegistry>,
    orchestrator: FallbackOrchestrator,
    cache: Arc<ResponseCache>,
    fallback: FallbackConfig,
    sweep_interval: Duration,
}

impl AbstractionLayer {
    pub fn builder() -> AbstractionLayerBuilder {
        AbstractionLayerBuilder::default()
    }

    /// Unary completion with caching and fallback.
    pub async fn chat_completion(&self, params: ChatParams) -> Result<NormalizedResponse> {
        let primary = self.resolve_primary(&params).await?;
        let config = self.fallback.merged(params.fallback.as_ref());
        self.orchestrator.execute(&primary, &params, &config).await
    }

    /// Streaming completion with fallback before the first chunk. Never cached.
    ///
    /// Dropping the returned stream releases the upstream connection.
    pub async fn chat_completion_stream(&self, params: ChatParams) -> Result<ResponseStream> {
        let primary = self.resolve_primary(&params).await?;
        let config = self.fallback.merged(params.fallback.as_ref());
        self.orchestrator.execute_stream(&primary, &params, &config).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Spawn the periodic expiry sweep. Requires a running tokio runtime.
    pub fn start_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.sweep_interval)
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        self.orchestrator.adapters()
    }

    pub fn fallback_config(&self) -> &FallbackConfig {
        &self.fallback
    }

    /// Primary-instance problems are configuration errors and skip the chain.
    async fn resolve_primary(&self, params: &ChatParams) -> Result<ProviderInstance> {
        if params.messages.is_empty() {
            return Err(ConfigError::Invalid("request has no messages".into()).into());
        }

        let instance = self
            .registry
            .get_instance(&params.provider_instance_id)
            .await
            .ok_or_else(|| ConfigError::InstanceNotFound(params.provider_instance_id.clone()))?;

        if !instance.is_active {
            return Err(ConfigError::InstanceInactive(instance.id).into());
        }
        if !self.adapters().contains(instance.provider_type) {
            return Err(ConfigError::NoAdapter(instance.provider_type).into());
        }
        Ok(instance)
    }
}

pub struct AbstractionLayerBuilder {
    registry: Option<Arc<dyn ProviderRegistry>>,
    decryptor: Option<Arc<dyn CredentialDecryptor>>,
    adapters: Option<AdapterRegistry>,
    usage: Arc<dyn UsageSink>,
    cache: Option<Arc<ResponseCache>>,
    cache_options: CacheOptions,
    cache_enabled: bool,
    cache_ttl: Option<Duration>,
    fallback: FallbackConfig,
    sweep_interval: Duration,
}

impl Default for AbstractionLayerBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            decryptor: None,
            adapters: None,
            usage: Arc::new(NoopUsageSink),
            cache: None,
            cache_options: CacheOptions::default(),
            cache_enabled: true,
            cache_ttl: None,
            fallback: FallbackConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl AbstractionLayerBuilder {
    /// Take registry contents, adapters, cache and fallback settings from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.registry = Some(Arc::new(config.registry()));
        self.adapters = Some(AdapterRegistry::with_defaults(&config.api_bases));
        self.cache_options = config.cache.options();
        self.cache_enabled = config.cache.enabled;
        self.sweep_interval = config.cache.sweep_interval();
        self.fallback = config.fallback.clone();
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Replace the adapter set. Defaults to the bundled adapters.
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Register one adapter on top of the current set.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters
            .get_or_insert_with(AdapterRegistry::new)
            .register(adapter);
        self
    }

    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    /// Share an existing cache instead of creating one.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = options;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// TTL for responses stored by this layer; defaults to the cache's own.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> std::result::Result<AbstractionLayer, ConfigError> {
        let registry = self
            .registry
            .ok_or_else(|| ConfigError::Invalid("no provider registry configured".into()))?;
        let decryptor = self
            .decryptor
            .ok_or_else(|| ConfigError::Invalid("no credential decryptor configured".into()))?;
        let adapters = self
            .adapters
            .unwrap_or_else(|| AdapterRegistry::with_defaults(&Default::default()));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::new(self.cache_options)));

        let mut orchestrator =
            FallbackOrchestrator::new(adapters, Arc::clone(&registry), decryptor, self.usage);
        if self.cache_enabled {
            orchestrator = orchestrator.with_cache(Arc::clone(&cache), self.cache_ttl);
        }

        Ok(AbstractionLayer {
            registry,
            orchestrator,
            cache,
            fallback: self.fallback,
            sweep_interval: self.sweep_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryProviderRegistry;
    use crate::error::GatewayError;
    use crate::service::vault::PlaintextDecryptor;
    use crate::types::{Message, ProviderType};

    fn instance(id: &str, provider_type: ProviderType, active: bool) -> ProviderInstance {
        ProviderInstance {
            id: id.into(),
            user_id: "u".into(),
            provider_type,
            is_active: active,
            default_model: "m".into(),
            default_max_tokens: 10,
            default_temperature: 0.1,
            encrypted_credential: "k".into(),
            api_base: None,
        }
    }

    fn layer() -> AbstractionLayer {
        let registry = InMemoryProviderRegistry::from_instances([
            instance("off", ProviderType::OpenAi, false),
            instance("cohere", ProviderType::Cohere, true),
        ]);
        AbstractionLayer::builder()
            .registry(Arc::new(registry))
            .decryptor(Arc::new(PlaintextDecryptor))
            .build()
            .unwrap()
    }

    fn params(instance: &str) -> ChatParams {
        ChatParams::new(instance, "u", vec![Message::user("hi")])
    }

    #[test]
    fn test_build_requires_registry_and_decryptor() {
        assert!(AbstractionLayer::builder().build().is_err());
        assert!(AbstractionLayer::builder()
            .registry(Arc::new(InMemoryProviderRegistry::new()))
            .build()
            .is_err());
    }

    #[test]
    fn test_defaults() {
        let layer = layer();
        assert_eq!(
            layer.adapters().provider_types(),
            vec![ProviderType::OpenAi, ProviderType::Anthropic, ProviderType::Google]
        );
        assert_eq!(layer.fallback_config(), &FallbackConfig::default());
        assert_eq!(layer.cache_stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_instance_fails_fast() {
        let err = layer().chat_completion(params("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_instance_fails_fast() {
        let err = layer().chat_completion(params("off")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::InstanceInactive(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_without_adapter_fails_fast() {
        let err = match layer().chat_completion_stream(params("cohere")).await {
            Err(e) => e,
            Ok(_) => panic!("expected a configuration error"),
        };
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::NoAdapter(ProviderType::Cohere))
        ));
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let p = ChatParams::new("cohere", "u", Vec::new());
        assert!(matches!(
            layer().chat_completion(p).await.unwrap_err(),
            GatewayError::Config(ConfigError::Invalid(_))
        ));
    }
}
