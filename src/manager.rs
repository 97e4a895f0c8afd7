use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::GenerationConfig;
use crate::error::ChatError;
use crate::model::ModelLoader;
use crate::prompt::ChatMessage;
use crate::worker::{spawn_generation, SharedGenerator};

enum ModelState {
    Idle,
    Loading,
    Ready(SharedGenerator),
    Failed(String),
}

/// Point-in-time view of the model lifecycle, as reported by the health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub model_loaded: bool,
    pub model_loading: bool,
    pub model_error: Option<String>,
}

/// Owns the single model instance and its loading lifecycle.
#[derive(Clone)]
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    state: Arc<RwLock<ModelState>>,
    generation: Arc<GenerationConfig>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("loader", &"<dyn ModelLoader>")
            .field("generation", &self.generation)
            .finish()
    }
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>, generation: GenerationConfig) -> Self {
        Self {
            loader,
            state: Arc::new(RwLock::new(ModelState::Idle)),
            generation: Arc::new(generation),
        }
    }

    /// Starts loading the model on the blocking pool.
    ///
    /// The state is `Loading` by the time this returns. Returns `None` when a
    /// load is already running or the model is ready; a failed load may be
    /// retried.
    pub async fn start_loading(&self) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ModelState::Loading | ModelState::Ready(_)) {
                tracing::debug!("Model load already started, ignoring");
                return None;
            }
            *state = ModelState::Loading;
        }

        let loader = self.loader.clone();
        let state = self.state.clone();

        Some(tokio::spawn(async move {
            let started = Instant::now();
            tracing::info!("Loading model in the background...");

            let outcome = tokio::task::spawn_blocking(move || loader.load()).await;
            let next = match outcome {
                Ok(Ok(generator)) => {
                    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Model ready");
                    ModelState::Ready(Arc::new(Mutex::new(generator)))
                }
                Ok(Err(e)) => {
                    let message = format!("{:#}", e);
                    tracing::error!(error = %message, "Failed to load model");
                    ModelState::Failed(message)
                }
                Err(join_err) => {
                    let message = format!("Model loader panicked: {}", join_err);
                    tracing::error!(error = %message, "Failed to load model");
                    ModelState::Failed(message)
                }
            };

            *state.write().await = next;
        }))
    }

    pub async fn status(&self) -> ModelStatus {
        match &*self.state.read().await {
            ModelState::Idle => ModelStatus {
                model_loaded: false,
                model_loading: false,
                model_error: None,
            },
            ModelState::Loading => ModelStatus {
                model_loaded: false,
                model_loading: true,
                model_error: None,
            },
            ModelState::Ready(_) => ModelStatus {
                model_loaded: true,
                model_loading: false,
                model_error: None,
            },
            ModelState::Failed(e) => ModelStatus {
                model_loaded: false,
                model_loading: false,
                model_error: Some(e.clone()),
            },
        }
    }

    /// Streams the answer to `message` word by word.
    pub async fn stream_chat(
        &self,
        message: &str,
    ) -> std::result::Result<ReceiverStream<Result<String>>, ChatError> {
        let engine = match &*self.state.read().await {
            ModelState::Idle => return Err(ChatError::NotLoaded),
            ModelState::Loading => return Err(ChatError::Loading),
            ModelState::Failed(e) => return Err(ChatError::LoadFailed(e.clone())),
            ModelState::Ready(engine) => engine.clone(),
        };

        let messages = vec![
            ChatMessage::system(self.generation.system_prompt.as_str()),
            ChatMessage::user(message),
        ];
        Ok(spawn_generation(
            engine,
            messages,
            self.generation.sampling.clone(),
        ))
    }

    /// Collects the whole answer to `message`.
    pub async fn complete(&self, message: &str) -> Result<String> {
        use futures::StreamExt;

        let mut stream = self.stream_chat(message).await?;
        let mut response = String::new();

        while let Some(word) = stream.next().await {
            response.push_str(&word?);
        }

        Ok(response.trim_end().to_string())
    }
}
