use crate::error::ApiError;
use std::future::Future;
use std::sync::Arc;
use textsum_training::{PipelineResult, PredictionPipeline, TrainingQueue};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Lifecycle of the prediction model.
#[derive(Debug, Clone)]
pub enum ModelState {
    Uninitialized,
    Ready(Arc<PredictionPipeline>),
    Failed(String),
}

impl ModelState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    model: Arc<RwLock<ModelState>>,
    queue: Arc<TrainingQueue>,
    generation_permits: Arc<Semaphore>,
}

impl AppState {
    #[must_use]
    pub fn new(queue: Arc<TrainingQueue>, max_concurrent_predictions: usize) -> Self {
        Self {
            model: Arc::new(RwLock::new(ModelState::Uninitialized)),
            queue,
            generation_permits: Arc::new(Semaphore::new(max_concurrent_predictions.max(1))),
        }
    }

    pub async fn model_state(&self) -> ModelState {
        self.model.read().await.clone()
    }

    pub async fn set_model_state(&self, state: ModelState) {
        *self.model.write().await = state;
    }

    #[must_use]
    pub fn queue(&self) -> &TrainingQueue {
        &self.queue
    }

    /// Loads the model in the background; the state moves out of `Uninitialized` exactly once.
    pub fn spawn_model_loader<F>(&self, loader: F) -> JoinHandle<()>
    where
        F: Future<Output = PipelineResult<PredictionPipeline>> + Send + 'static,
    {
        let model = Arc::clone(&self.model);
        tokio::spawn(async move {
            info!("Loading prediction pipeline");
            let next = match loader.await {
                Ok(pipeline) => {
                    info!("Prediction pipeline loaded successfully");
                    ModelState::Ready(Arc::new(pipeline))
                }
                Err(e) => {
                    error!(error = %e, "Failed to load prediction pipeline");
                    ModelState::Failed(e.to_string())
                }
            };
            let mut state = model.write().await;
            if matches!(*state, ModelState::Uninitialized) {
                *state = next;
            }
        })
    }

    pub(crate) async fn ready_pipeline(&self) -> Result<Arc<PredictionPipeline>, ApiError> {
        match &*self.model.read().await {
            ModelState::Ready(pipeline) => Ok(Arc::clone(pipeline)),
            ModelState::Uninitialized => Err(ApiError::NotReady("Model is still loading".to_string())),
            ModelState::Failed(reason) => Err(ApiError::NotReady(format!("Model failed to load: {reason}"))),
        }
    }

    pub(crate) async fn generation_permit(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        Arc::clone(&self.generation_permits).acquire_owned().await.map_err(ApiError::internal)
    }
}
