//! Scripted adapters and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use chatgate_core::config::InMemoryProviderRegistry;
use chatgate_core::error::ProviderError;
use chatgate_core::provider::{
    AdapterRegistry, ChunkStream, ProviderAdapter, VendorChunk, VendorRequest, VendorResponse,
};
use chatgate_core::service::{InMemoryUsageTracker, PlaintextDecryptor};
use chatgate_core::types::{
    FinishReason, NormalizedRequest, NormalizedResponse, ProviderInstance, ProviderType,
    ResponseMetadata, TokenUsage,
};
use chatgate_core::AbstractionLayer;

/// Scripted outcome of one unary call.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    ErrorFinish(String),
    Fail(u16, String),
}

/// One scripted step of a streaming call.
#[derive(Debug, Clone)]
pub enum Step {
    Delta(String),
    Fail(String),
    /// Never resolves; used to hold a stream open.
    Hang,
    /// Ends the stream without a terminal chunk.
    End,
}

#[derive(Debug, Clone)]
pub enum StreamScript {
    OpenFails(u16, String),
    Steps(Vec<Step>),
}

/// Adapter whose behaviour is fixed up front, for driving the orchestrator.
pub struct ScriptedAdapter {
    provider_type: ProviderType,
    available: AtomicBool,
    /// When set, only probes of this base succeed.
    reachable_base: Mutex<Option<String>>,
    probes: Mutex<Vec<Option<String>>>,
    replies: Mutex<VecDeque<Reply>>,
    streams: Mutex<VecDeque<StreamScript>>,
    calls: AtomicUsize,
    stream_calls: AtomicUsize,
    requests: Mutex<Vec<NormalizedRequest>>,
    credentials: Mutex<Vec<String>>,
    /// Set when a stream produced by this adapter is dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    pub fn new(provider_type: ProviderType) -> Arc<Self> {
        Arc::new(Self {
            provider_type,
            available: AtomicBool::new(true),
            reachable_base: Mutex::new(None),
            probes: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn reply(&self, reply: Reply) -> &Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn text(&self, text: &str) -> &Self {
        self.reply(Reply::Text(text.to_string()))
    }

    pub fn fail(&self, status: u16, message: &str) -> &Self {
        self.reply(Reply::Fail(status, message.to_string()))
    }

    pub fn stream(&self, script: StreamScript) -> &Self {
        self.streams.lock().unwrap().push_back(script);
        self
    }

    pub fn deltas(&self, deltas: &[&str]) -> &Self {
        self.stream(StreamScript::Steps(
            deltas.iter().map(|d| Step::Delta(d.to_string())).collect(),
        ))
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reachable_only_at(&self, base: &str) {
        *self.reachable_base.lock().unwrap() = Some(base.to_string());
    }

    pub fn probes(&self) -> Vec<Option<String>> {
        self.probes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<NormalizedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn is_available(&self, api_base: Option<&str>) -> bool {
        self.probes.lock().unwrap().push(api_base.map(str::to_string));
        let reachable = match self.reachable_base.lock().unwrap().as_deref() {
            Some(base) => api_base == Some(base),
            None => true,
        };
        reachable && self.available.load(Ordering::SeqCst)
    }

    fn normalize_request(&self, request: &NormalizedRequest) -> Result<VendorRequest, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(VendorRequest {
            model: request.model.clone(),
            body: json!({ "messages": request.messages.len() }),
            stream: request.stream,
            api_base: None,
        })
    }

    async fn make_request(
        &self,
        request: &VendorRequest,
        credential: &str,
    ) -> Result<VendorResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().unwrap().push(credential.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Text(format!("hello from {}", self.provider_type)));

        match reply {
            Reply::Text(text) => Ok(VendorResponse {
                body: json!({ "content": text, "model": request.model, "finish": "stop" }),
            }),
            Reply::ErrorFinish(text) => Ok(VendorResponse {
                body: json!({ "content": text, "model": request.model, "finish": "error" }),
            }),
            Reply::Fail(status, message) => Err(ProviderError::Api { status, message }),
        }
    }

    async fn make_stream_request(
        &self,
        _request: &VendorRequest,
        _credential: &str,
    ) -> Result<ChunkStream, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StreamScript::Steps(vec![Step::Delta("ok".into())]));

        let steps = match script {
            StreamScript::OpenFails(status, message) => {
                return Err(ProviderError::Api { status, message })
            }
            StreamScript::Steps(steps) => steps,
        };

        let flag = DropFlag(Arc::clone(&self.stream_dropped));
        let stream = async_stream::try_stream! {
            let _flag = flag;
            let mut content = String::new();
            let mut ended = false;
            for step in steps {
                match step {
                    Step::Delta(delta) => {
                        content.push_str(&delta);
                        yield VendorChunk::partial(content.clone(), delta);
                    }
                    Step::Fail(message) => {
                        Err::<(), _>(ProviderError::Stream(message))?;
                    }
                    Step::Hang => {
                        futures::future::pending::<()>().await;
                    }
                    Step::End => {
                        ended = true;
                        break;
                    }
                }
            }
            if !ended {
                yield VendorChunk::finished(content, "", TokenUsage::new(2, 3), FinishReason::Stop);
            }
        };
        Ok(Box::pin(stream))
    }

    fn normalize_response(
        &self,
        response: VendorResponse,
        request_id: &str,
        response_time_ms: u64,
    ) -> Result<NormalizedResponse, ProviderError> {
        let body = response.body;
        let finish_reason = match body["finish"].as_str() {
            Some("error") => FinishReason::Error,
            _ => FinishReason::Stop,
        };
        Ok(NormalizedResponse {
            id: format!("{}-{}", self.provider_type, request_id),
            content: body["content"].as_str().unwrap_or_default().to_string(),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            provider: self.provider_type,
            usage: TokenUsage::new(7, 11),
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

pub fn instance(id: &str, provider_type: ProviderType, default_model: &str) -> ProviderInstance {
    ProviderInstance {
        id: id.into(),
        user_id: "user-1".into(),
        provider_type,
        is_active: true,
        default_model: default_model.into(),
        default_max_tokens: 256,
        default_temperature: 0.3,
        encrypted_credential: format!("key-{id}"),
        api_base: None,
    }
}

/// Layer with one instance per given adapter and a zero backoff.
pub struct Fixture {
    pub layer: AbstractionLayer,
    pub usage: Arc<InMemoryUsageTracker>,
}

pub fn fixture(adapters: &[Arc<ScriptedAdapter>]) -> Fixture {
    fixture_with(adapters, |b| b)
}

pub fn fixture_with(
    adapters: &[Arc<ScriptedAdapter>],
    customize: impl FnOnce(chatgate_core::AbstractionLayerBuilder) -> chatgate_core::AbstractionLayerBuilder,
) -> Fixture {
    let registry = InMemoryProviderRegistry::new();
    let mut registered = AdapterRegistry::new();
    for adapter in adapters {
        let pt = adapter.provider_type();
        registry.insert(instance(pt.as_str(), pt, &format!("{pt}-default")));
        registered.register(Arc::clone(adapter) as Arc<dyn ProviderAdapter>);
    }

    let usage = Arc::new(InMemoryUsageTracker::new());
    let builder = AbstractionLayer::builder()
        .registry(Arc::new(registry))
        .decryptor(Arc::new(PlaintextDecryptor))
        .adapters(registered)
        .usage_sink(Arc::clone(&usage) as Arc<dyn chatgate_core::service::UsageSink>)
        .fallback(chatgate_core::fallback::FallbackConfig {
            retry_delay_ms: 0,
            ..Default::default()
        });

    Fixture {
        layer: customize(builder).build().unwrap(),
        usage,
    }
}
