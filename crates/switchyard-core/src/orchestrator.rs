//! Drives one logical request across backends until it streams or the
//! attempt budget runs out.

use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, FallbackExhausted, FallbackUsed, ResilienceEvent};
use crate::config::{ResilienceConfig, ResilienceOverride};
use crate::equivalence::EquivalenceResolver;
use crate::error::ProviderError;
use crate::fallback::{classify, ErrorClass, FallbackPolicy};
use crate::health::{Admission, HealthTracker};
use crate::model::ModelRef;
use crate::normalize::{normalize, NormalizeOptions};
use crate::provider::{BackendPool, BackendRequest, CompletionStream, ModelRegistry};
use crate::stream::ResilientStream;
use crate::types::CompletionRequest;

/// One call into the orchestrator.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: String,
    pub model: ModelRef,
    pub request: CompletionRequest,
    pub options: NormalizeOptions,
    pub overrides: Option<ResilienceOverride>,
    pub cancel: CancellationToken,
}

impl StreamRequest {
    pub fn new(session_id: impl Into<String>, model: ModelRef, request: CompletionRequest) -> Self {
        Self {
            session_id: session_id.into(),
            model,
            request,
            options: NormalizeOptions::default(),
            overrides: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) health: Arc<HealthTracker>,
    pub(crate) policy: FallbackPolicy,
    pub(crate) registry: Arc<dyn ModelRegistry>,
    pub(crate) backends: BackendPool,
    pub(crate) bus: EventBus,
    config: RwLock<ResilienceConfig>,
}

/// State shared by every attempt of one logical request.
pub(crate) struct RequestContext {
    pub(crate) session_id: String,
    pub(crate) original: ModelRef,
    pub(crate) request: CompletionRequest,
    pub(crate) options: NormalizeOptions,
    /// Snapshot taken when the request started.
    pub(crate) config: ResilienceConfig,
    pub(crate) cancel: CancellationToken,
    trail: Mutex<Vec<String>>,
}

impl RequestContext {
    fn push_trail(&self, model: &ModelRef) -> usize {
        let mut trail = self.trail.lock().unwrap_or_else(|e| e.into_inner());
        trail.push(model.to_string());
        trail.len()
    }

    pub(crate) fn trail(&self) -> Vec<String> {
        self.trail.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Entry point of the resilience layer.
#[derive(Clone)]
pub struct StreamOrchestrator {
    inner: Arc<Inner>,
}

impl StreamOrchestrator {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        backends: BackendPool,
        health: Arc<HealthTracker>,
        bus: EventBus,
        config: ResilienceConfig,
    ) -> Self {
        let resolver = Arc::new(EquivalenceResolver::new(registry.clone()));
        Self {
            inner: Arc::new(Inner {
                health,
                policy: FallbackPolicy::new(resolver),
                registry,
                backends,
                bus,
                config: RwLock::new(config),
            }),
        }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.inner.health
    }

    pub fn resolver(&self) -> &Arc<EquivalenceResolver> {
        self.inner.policy.resolver()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> ResilienceConfig {
        self.inner.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the config for future requests. Requests already running
    /// keep the snapshot they started with.
    pub async fn update_config(&self, config: ResilienceConfig) {
        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        self.inner.health.update_config(config).await;
    }

    /// Start a streaming completion, falling back across backends as needed.
    ///
    /// Returns the last raw error when every attempt fails before streaming.
    pub async fn stream(&self, req: StreamRequest) -> Result<ResilientStream, ProviderError> {
        let mut config = self.config();
        if let Some(over) = &req.overrides {
            config = config.merge(over);
        }
        config.max_attempts = config.max_attempts.max(1);

        let mut options = req.options;
        options.session_id = req.session_id.clone();

        let ctx = Arc::new(RequestContext {
            session_id: req.session_id,
            original: req.model.clone(),
            request: req.request,
            options,
            config,
            cancel: req.cancel,
            trail: Mutex::new(Vec::new()),
        });

        let (model, stream) = if ctx.config.enabled {
            attempt_loop(self.inner.clone(), ctx.clone(), req.model, None).await?
        } else {
            ctx.push_trail(&req.model);
            let stream = dispatch(&self.inner, &ctx, &req.model).await?;
            (req.model, stream)
        };
        Ok(ResilientStream::new(self.inner.clone(), ctx, model, stream))
    }
}

/// Resolve, normalize and issue one backend call.
async fn dispatch(inner: &Inner, ctx: &RequestContext, model: &ModelRef) -> Result<CompletionStream, ProviderError> {
    let descriptor = inner
        .registry
        .get_model(&model.backend_id, &model.model_id)
        .await?;
    let backend = inner
        .backends
        .get(&model.backend_id)
        .ok_or_else(|| ProviderError::ModelNotFound(format!("No backend registered for {}", model.backend_id)))?;

    let normalized = normalize(&ctx.request, &descriptor, &ctx.options);
    let request = BackendRequest {
        model: descriptor,
        request: normalized,
        session_id: ctx.session_id.clone(),
    };

    debug!("Dispatching {} for session {}", model, ctx.session_id);
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ProviderError::Cancelled),
        res = backend.stream(request, ctx.cancel.clone()) => res,
    }
}

/// Half-open probe slot held by one attempt.
///
/// Recording an outcome frees the slot inside the tracker. If the attempt
/// is dropped before that (consumer went away mid-call), the slot is
/// handed back from `Drop`.
struct ProbeSlot {
    health: Arc<HealthTracker>,
    backend: Option<String>,
}

impl ProbeSlot {
    fn new(health: &Arc<HealthTracker>, backend: &str, admission: Admission) -> Self {
        Self {
            health: health.clone(),
            backend: (admission == Admission::Probe).then(|| backend.to_string()),
        }
    }

    /// Outcome recorded; the tracker already freed the slot.
    fn settle(mut self) {
        self.backend = None;
    }

    /// Give the slot back without recording an outcome.
    async fn release(mut self) {
        if let Some(backend) = &self.backend {
            self.health.release_probe(backend).await;
        }
        self.backend = None;
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let health = self.health.clone();
                rt.spawn(async move {
                    debug!("Returning abandoned probe slot for {}", backend);
                    health.release_probe(&backend).await;
                });
            }
            Err(_) => warn!("No runtime to return probe slot for {}", backend),
        }
    }
}

/// Try `start` and its fallbacks until one streams.
///
/// `pending` is the failure that led here when recovering from a broken
/// stream; it only feeds the fallback notification.
pub(crate) async fn attempt_loop(
    inner: Arc<Inner>,
    ctx: Arc<RequestContext>,
    start: ModelRef,
    pending: Option<ErrorClass>,
) -> Result<(ModelRef, CompletionStream), ProviderError> {
    let mut current = start;
    let mut reason = pending;

    let (class, err) = loop {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let attempt = ctx.push_trail(&current);

        let (class, err) = match inner.health.try_acquire(&current.backend_id).await {
            Admission::Blocked => {
                debug!("Circuit open for {}, skipping", current.backend_id);
                (
                    ErrorClass::CircuitOpen,
                    ProviderError::CircuitOpen(current.backend_id.clone()),
                )
            }
            admission => {
                let slot = ProbeSlot::new(&inner.health, &current.backend_id, admission);
                match dispatch(&inner, &ctx, &current).await {
                    Ok(stream) => {
                        inner.health.record_success(&current.backend_id).await;
                        slot.settle();
                        if current != ctx.original || reason.is_some() {
                            emit_used(&inner, &ctx, &current, reason, attempt);
                        }
                        return Ok((current, stream));
                    }
                    Err(ProviderError::Cancelled) => {
                        slot.release().await;
                        return Err(ProviderError::Cancelled);
                    }
                    Err(e) => {
                        inner.health.record_failure(&current.backend_id, &e.to_string()).await;
                        slot.settle();
                        (classify(&e), e)
                    }
                }
            }
        };

        warn!("Attempt {} on {} failed ({}): {}", attempt, current, class, err);
        let trail = ctx.trail();
        match inner.policy.resolve_class(&current, class, &trail, &ctx.config).await {
            Some(next) => {
                reason = Some(class);
                current = next;
            }
            None => break (class, err),
        }
    };

    if !class.is_fatal(&ctx.config) {
        emit_exhausted(&inner, &ctx, &err);
    }
    Err(err)
}

/// Handle an error from an established stream: record it and, when
/// allowed, reconnect to an equivalent model.
pub(crate) async fn recover(
    inner: Arc<Inner>,
    ctx: Arc<RequestContext>,
    current: ModelRef,
    err: ProviderError,
    class: ErrorClass,
) -> Result<(ModelRef, CompletionStream), ProviderError> {
    if class == ErrorClass::Cancelled || ctx.cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }
    if !ctx.config.enabled {
        return Err(err);
    }

    inner.health.record_failure(&current.backend_id, &err.to_string()).await;
    if class.is_fatal(&ctx.config) {
        return Err(err);
    }

    let trail = ctx.trail();
    match inner.policy.resolve_class(&current, class, &trail, &ctx.config).await {
        Some(next) => {
            info!("Stream from {} broke ({}), continuing on {}", current, err, next);
            attempt_loop(inner, ctx, next, Some(class)).await
        }
        None => {
            emit_exhausted(&inner, &ctx, &err);
            Err(err)
        }
    }
}

fn emit_used(inner: &Inner, ctx: &RequestContext, current: &ModelRef, reason: Option<ErrorClass>, attempt: usize) {
    if !ctx.config.notify_on_fallback {
        return;
    }
    inner.bus.publish(ResilienceEvent::FallbackUsed(FallbackUsed {
        session_id: ctx.session_id.clone(),
        original_backend: ctx.original.backend_id.clone(),
        original_model: ctx.original.model_id.clone(),
        fallback_backend: current.backend_id.clone(),
        fallback_model: current.model_id.clone(),
        reason: reason.unwrap_or(ErrorClass::Unknown).to_string(),
        attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
    }));
}

fn emit_exhausted(inner: &Inner, ctx: &RequestContext, err: &ProviderError) {
    let attempted = ctx.trail();
    warn!("All {} attempt(s) failed for session {}: {}", attempted.len(), ctx.session_id, err);
    inner.bus.publish(ResilienceEvent::FallbackExhausted(FallbackExhausted {
        session_id: ctx.session_id.clone(),
        original_backend: ctx.original.backend_id.clone(),
        original_model: ctx.original.model_id.clone(),
        attempted,
        last_error: err.to_string(),
    }));
}
