//! Multi-model residency manager.
//!
//! The router and reasoner models share one inference backend with limited
//! VRAM. Warming loads them sequentially in priority order; every request
//! forwards the model's cached keep-alive and explicit context-window size
//! so the backend neither evicts the model nor falls back to its small
//! default context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::metrics::CoreMetrics;
use crate::reasoner::{
    ChatToolOutcome, Completion, GenerationParams, OllamaClient, StreamConfig, StreamHandler,
    StreamStats,
};
use crate::session::Message;

/// Warmup request for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWarmConfig {
    /// Model name on the backend
    pub name: String,
    /// Keep-alive directive (e.g. "10m", "-1")
    pub keep_alive: String,
    /// Explicit context-window size
    pub context_window: u32,
    /// Higher priority loads first
    pub priority: i32,
}

/// Tracked state of one managed model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedModel {
    pub name: String,
    pub keep_alive: String,
    pub context_window: u32,
    pub is_loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub load_duration: Option<Duration>,
    pub warmup_error: Option<String>,
}

impl ManagedModel {
    fn from_config(config: &ModelWarmConfig) -> Self {
        Self {
            name: config.name.clone(),
            keep_alive: config.keep_alive.clone(),
            context_window: config.context_window,
            is_loaded: false,
            loaded_at: None,
            last_used: None,
            load_duration: None,
            warmup_error: None,
        }
    }
}

/// Keeps the router and reasoner models resident on a shared backend.
pub struct MultiModelManager {
    backend: Arc<OllamaClient>,
    models: RwLock<HashMap<String, ManagedModel>>,
    metrics: Arc<CoreMetrics>,
}

impl MultiModelManager {
    pub fn new(backend: Arc<OllamaClient>, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            backend,
            models: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Warm models sequentially in descending priority order.
    ///
    /// Sequential loading avoids VRAM contention between concurrent loads.
    /// Each model is pinged with a minimal request carrying its keep-alive
    /// and explicit context window. Individual warmup failures are recorded
    /// on the model and do not abort the remaining loads.
    pub async fn warm_models(
        &self,
        ctx: &CancellationToken,
        mut configs: Vec<ModelWarmConfig>,
    ) -> Result<()> {
        configs.sort_by(|a, b| b.priority.cmp(&a.priority));

        for config in configs {
            let mut managed = ManagedModel::from_config(&config);
            let params = GenerationParams::default()
                .with_keep_alive(config.keep_alive.clone())
                .with_context_window(config.context_window)
                .with_max_tokens(1);
            let ping = [Message::user("ping")];

            let start = Instant::now();
            let outcome = self
                .backend
                .chat_model(ctx, &config.name, &ping, &params)
                .await;
            let elapsed = start.elapsed();

            self.metrics
                .routing_warmup_duration
                .with_label_values(&[&config.name])
                .observe(elapsed.as_secs_f64());

            match outcome {
                Ok(_) => {
                    tracing::info!(model = %config.name, elapsed_ms = elapsed.as_millis() as u64, "model warmed");
                    managed.is_loaded = true;
                    managed.loaded_at = Some(Utc::now());
                    managed.load_duration = Some(elapsed);
                    self.metrics
                        .routing_warmup_total
                        .with_label_values(&[&config.name, "success"])
                        .inc();
                    self.metrics
                        .routing_init_total
                        .with_label_values(&[&config.name, "success", "warmup"])
                        .inc();
                }
                Err(err) => {
                    tracing::warn!(model = %config.name, error = %err, "model warmup failed");
                    managed.warmup_error = Some(err.to_string());
                    self.metrics
                        .routing_warmup_total
                        .with_label_values(&[&config.name, "error"])
                        .inc();
                    self.metrics
                        .routing_init_total
                        .with_label_values(&[&config.name, "error", err.code()])
                        .inc();
                    if err.is_cancellation() {
                        self.models.write().await.insert(config.name.clone(), managed);
                        return Err(err);
                    }
                }
            }

            self.models.write().await.insert(config.name.clone(), managed);
        }
        Ok(())
    }

    /// Merge the model's cached keep-alive and context window into request
    /// params, then stamp last-used.
    async fn prepared_params(&self, model: &str, params: &GenerationParams) -> GenerationParams {
        let mut params = params.clone();
        let models = self.models.read().await;
        if let Some(managed) = models.get(model) {
            if params.keep_alive.is_none() {
                params.keep_alive = Some(managed.keep_alive.clone());
            }
            if params.context_window.is_none() {
                params.context_window = Some(managed.context_window);
            }
        }
        params
    }

    async fn touch(&self, model: &str) {
        let mut models = self.models.write().await;
        if let Some(managed) = models.get_mut(model) {
            managed.last_used = Some(Utc::now());
            managed.is_loaded = true;
        }
    }

    /// One non-streamed request to a named model.
    pub async fn chat(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion> {
        let params = self.prepared_params(model, params).await;
        let completion = self.backend.chat_model(ctx, model, messages, &params).await?;
        self.touch(model).await;
        Ok(completion)
    }

    /// One non-streamed request with tool definitions.
    pub async fn chat_with_tools(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        tools: &[serde_json::Value],
    ) -> Result<ChatToolOutcome> {
        let params = self.prepared_params(model, params).await;
        let outcome = self
            .backend
            .chat_model_with_tools(ctx, model, messages, &params, tools)
            .await?;
        self.touch(model).await;
        Ok(outcome)
    }

    /// Streamed request to a named model.
    pub async fn stream(
        &self,
        ctx: &CancellationToken,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        config: &StreamConfig,
        handler: StreamHandler<'_>,
    ) -> Result<StreamStats> {
        let params = self.prepared_params(model, params).await;
        let stats = self
            .backend
            .stream_model(ctx, model, messages, &params, config, handler)
            .await?;
        self.touch(model).await;
        Ok(stats)
    }

    /// Force-unload a model by sending keep-alive 0.
    pub async fn unload_model(&self, ctx: &CancellationToken, model: &str) -> Result<()> {
        let params = GenerationParams::default()
            .with_keep_alive("0")
            .with_max_tokens(1);
        self.backend
            .chat_model(ctx, model, &[Message::user("ping")], &params)
            .await?;
        let mut models = self.models.write().await;
        if let Some(managed) = models.get_mut(model) {
            managed.is_loaded = false;
            managed.loaded_at = None;
        }
        Ok(())
    }

    /// Snapshot copy of all managed models.
    pub async fn get_loaded_models(&self) -> Vec<ManagedModel> {
        let models = self.models.read().await;
        let mut snapshot: Vec<ManagedModel> = models.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}
