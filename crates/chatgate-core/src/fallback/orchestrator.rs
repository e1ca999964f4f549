use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::cache::ResponseCache;
use crate::config::ProviderRegistry;
use crate::error::{ConfigError, GatewayError, ProviderError, Result};
use crate::provider::{
    truncated_stream, AdapterRegistry, ChunkStream, ProviderAdapter, VendorChunk, VendorRequest,
};
use crate::service::usage::{UsageEvent, UsageSink};
use crate::service::vault::CredentialDecryptor;
use crate::types::{ChatParams, NormalizedResponse, ProviderInstance, ProviderType, StreamingResponse};

use super::{ChainEvent, ChainState, ChainWalk, FallbackConfig};

/// Caller-facing stream of completion chunks.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamingResponse>> + Send>>;

/// A chain candidate with everything resolved for the upstream call.
struct Candidate {
    provider_type: ProviderType,
    adapter: Arc<dyn ProviderAdapter>,
    instance: ProviderInstance,
    credential: String,
    vendor: VendorRequest,
}

/// Walks the fallback chain for one call.
#[derive(Clone)]
pub struct FallbackOrchestrator {
    adapters: AdapterRegistry,
    registry: Arc<dyn ProviderRegistry>,
    decryptor: Arc<dyn CredentialDecryptor>,
    usage: Arc<dyn UsageSink>,
    cache: Option<Arc<ResponseCache>>,
    cache_ttl: Option<Duration>,
}

impl FallbackOrchestrator {
    pub fn new(
        adapters: AdapterRegistry,
        registry: Arc<dyn ProviderRegistry>,
        decryptor: Arc<dyn CredentialDecryptor>,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            adapters,
            registry,
            decryptor,
            usage,
            cache: None,
            cache_ttl: None,
        }
    }

    /// Serve unary calls from and into `cache`.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>, ttl: Option<Duration>) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Unary completion over the chain. `primary` must already be validated.
    pub async fn execute(
        &self,
        primary: &ProviderInstance,
        params: &ChatParams,
        config: &FallbackConfig,
    ) -> Result<NormalizedResponse> {
        let request_id = crate::util::request_id();

        let cache_key = self.cache.as_ref().map(|cache| {
            let request = primary.build_request(params, params.model.as_deref(), false);
            let key = ResponseCache::generate_key(&request, &primary.id);
            (Arc::clone(cache), key)
        });
        if let Some((cache, key)) = &cache_key {
            if let Some(hit) = cache.get(key) {
                tracing::debug!("Cache hit for instance {} ({})", primary.id, request_id);
                return Ok(hit);
            }
        }

        let mut walk = ChainWalk::new(primary.provider_type, config);
        walk.advance(ChainEvent::Built);
        tracing::debug!("Fallback chain for {}: {:?}", request_id, walk.chain());

        loop {
            match walk.state() {
                ChainState::TryProvider(i) => {
                    let provider_type = walk.chain()[i];
                    match self.try_unary(i, provider_type, primary, params, &request_id).await {
                        Ok(mut response) => {
                            walk.advance(ChainEvent::Succeeded);
                            response.metadata.fallback_used = i > 0;
                            response.metadata.original_provider = Some(primary.provider_type);
                            if i > 0 {
                                tracing::info!(
                                    "Fallback provider {} succeeded for {} after {} failed attempt(s)",
                                    provider_type,
                                    request_id,
                                    i
                                );
                            }
                            if let Some((cache, key)) = &cache_key {
                                cache.put(key.clone(), response.clone(), self.cache_ttl);
                            }
                            return Ok(response);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Provider {} failed (attempt {}/{}): {}",
                                provider_type,
                                i + 1,
                                walk.chain().len(),
                                e
                            );
                            walk.advance(ChainEvent::Failed(e.to_string()));
                        }
                    }
                }
                ChainState::NextProvider(i) => {
                    let delay = config.backoff(i);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    walk.advance(ChainEvent::BackoffElapsed);
                }
                ChainState::Exhausted => return Err(exhausted(&walk)),
                ChainState::BuildChain | ChainState::Success(_) => {
                    return Err(GatewayError::Other(format!(
                        "fallback chain stalled in {:?}",
                        walk.state()
                    )));
                }
            }
        }
    }

    /// Streaming completion over the chain.
    ///
    /// The chain advances only until a candidate yields its first chunk. From
    /// then on the stream is committed to that candidate and any further error
    /// is handed to the consumer and ends the stream.
    pub async fn execute_stream(
        &self,
        primary: &ProviderInstance,
        params: &ChatParams,
        config: &FallbackConfig,
    ) -> Result<ResponseStream> {
        let request_id = crate::util::request_id();
        let mut walk = ChainWalk::new(primary.provider_type, config);
        walk.advance(ChainEvent::Built);

        loop {
            match walk.state() {
                ChainState::TryProvider(i) => {
                    let provider_type = walk.chain()[i];
                    match self.try_stream(i, provider_type, primary, params).await {
                        Ok((candidate, first, upstream, started)) => {
                            walk.advance(ChainEvent::Succeeded);
                            if i > 0 {
                                tracing::info!(
                                    "Fallback provider {} streaming for {} after {} failed attempt(s)",
                                    provider_type,
                                    request_id,
                                    i
                                );
                            }
                            return Ok(self.committed_stream(
                                candidate, params, request_id, first, upstream, started,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Provider {} failed before first chunk (attempt {}/{}): {}",
                                provider_type,
                                i + 1,
                                walk.chain().len(),
                                e
                            );
                            walk.advance(ChainEvent::Failed(e.to_string()));
                        }
                    }
                }
                ChainState::NextProvider(i) => {
                    let delay = config.backoff(i);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    walk.advance(ChainEvent::BackoffElapsed);
                }
                ChainState::Exhausted => return Err(exhausted(&walk)),
                ChainState::BuildChain | ChainState::Success(_) => {
                    return Err(GatewayError::Other(format!(
                        "fallback chain stalled in {:?}",
                        walk.state()
                    )));
                }
            }
        }
    }

    async fn prepare(
        &self,
        index: usize,
        provider_type: ProviderType,
        primary: &ProviderInstance,
        params: &ChatParams,
        stream: bool,
    ) -> Result<Candidate> {
        let adapter = self
            .adapters
            .get(provider_type)
            .ok_or(ConfigError::NoAdapter(provider_type))?;

        let instance = if index == 0 {
            primary.clone()
        } else {
            self.registry
                .find_active_instance(&params.user_id, provider_type)
                .await
                .ok_or_else(|| {
                    ConfigError::InstanceNotFound(format!(
                        "no active {provider_type} instance for user {}",
                        params.user_id
                    ))
                })?
        };

        if !adapter.is_available(instance.api_base.as_deref()).await {
            return Err(ProviderError::Other(format!(
                "{provider_type} is unavailable at instance {}",
                instance.id
            ))
            .into());
        }

        let credential = self
            .decryptor
            .decrypt(&instance.user_id, &instance.encrypted_credential)?;

        // Model ids are vendor specific, so fallbacks use their own default.
        let model = if index == 0 { params.model.as_deref() } else { None };
        let request = instance.build_request(params, model, stream);
        let mut vendor = adapter.normalize_request(&request)?;
        vendor.api_base = instance.api_base.clone();

        Ok(Candidate {
            provider_type,
            adapter,
            instance,
            credential,
            vendor,
        })
    }

    async fn try_unary(
        &self,
        index: usize,
        provider_type: ProviderType,
        primary: &ProviderInstance,
        params: &ChatParams,
        request_id: &str,
    ) -> Result<NormalizedResponse> {
        let candidate = self.prepare(index, provider_type, primary, params, false).await?;

        let started = Instant::now();
        let raw = candidate
            .adapter
            .make_request(&candidate.vendor, &candidate.credential)
            .await?;
        let elapsed = started.elapsed().as_millis() as u64;
        let response = candidate.adapter.normalize_response(raw, request_id, elapsed)?;

        self.usage.record(UsageEvent {
            user_id: params.user_id.clone(),
            workspace_id: params.workspace_id.clone(),
            provider_type: candidate.provider_type,
            model: response.model.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            duration_ms: elapsed,
        });
        tracing::debug!(
            "Instance {} served {} in {}ms",
            candidate.instance.id,
            request_id,
            elapsed
        );
        Ok(response)
    }

    /// Open a stream and wait for its first chunk.
    async fn try_stream(
        &self,
        index: usize,
        provider_type: ProviderType,
        primary: &ProviderInstance,
        params: &ChatParams,
    ) -> Result<(Candidate, VendorChunk, ChunkStream, Instant)> {
        let candidate = self.prepare(index, provider_type, primary, params, true).await?;

        let started = Instant::now();
        let mut upstream = candidate
            .adapter
            .make_stream_request(&candidate.vendor, &candidate.credential)
            .await?;

        match upstream.next().await {
            Some(Ok(first)) => Ok((candidate, first, upstream, started)),
            Some(Err(e)) => Err(e.into()),
            None => Err(ProviderError::Stream("stream ended before first chunk".into()).into()),
        }
    }

    fn committed_stream(
        &self,
        candidate: Candidate,
        params: &ChatParams,
        request_id: String,
        first: VendorChunk,
        mut upstream: ChunkStream,
        started: Instant,
    ) -> ResponseStream {
        let usage_sink = Arc::clone(&self.usage);
        let user_id = params.user_id.clone();
        let workspace_id = params.workspace_id.clone();
        let provider_type = candidate.provider_type;
        let model = candidate.vendor.model.clone();

        let stream = async_stream::stream! {
            let mut next = Some(first);
            while let Some(chunk) = next.take() {
                let done = chunk.done;
                if done {
                    let usage = chunk.usage.unwrap_or_default();
                    usage_sink.record(UsageEvent {
                        user_id: user_id.clone(),
                        workspace_id: workspace_id.clone(),
                        provider_type,
                        model: model.clone(),
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                yield Ok(to_streaming(&request_id, &model, provider_type, chunk));
                if done {
                    break;
                }

                match upstream.next().await {
                    Some(Ok(chunk)) => next = Some(chunk),
                    Some(Err(e)) => {
                        tracing::warn!(
                            "Provider {} failed mid-stream for {}: {}",
                            provider_type,
                            request_id,
                            e
                        );
                        yield Err(GatewayError::Provider(e));
                    }
                    None => {
                        tracing::warn!(
                            "Provider {} ended {} without a final chunk",
                            provider_type,
                            request_id
                        );
                        yield Err(GatewayError::Provider(truncated_stream()));
                    }
                }
            }
        };

        Box::pin(stream)
    }
}

fn to_streaming(
    request_id: &str,
    model: &str,
    provider: ProviderType,
    chunk: VendorChunk,
) -> StreamingResponse {
    StreamingResponse {
        id: request_id.to_string(),
        content: chunk.content,
        delta: chunk.delta,
        done: chunk.done,
        usage: if chunk.done {
            Some(chunk.usage.unwrap_or_default())
        } else {
            None
        },
        model: model.to_string(),
        provider,
    }
}

fn exhausted(walk: &ChainWalk) -> GatewayError {
    let err = GatewayError::Exhausted {
        attempts: walk.attempts(),
        last_error: walk.last_error(),
    };
    tracing::error!("{}", err);
    err
}
