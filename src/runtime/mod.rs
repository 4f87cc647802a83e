//! Loaded-model handles and the seam to the inference engine behind them.

pub mod gguf;
pub mod llama_cli;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{Result, VlmError};
use crate::models::ModelVariant;
use crate::preprocess::RgbTensor;
use log::{debug, error, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub use llama_cli::{LlamaCliLoader, LlamaCliOptions};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("generation cancelled")]
    Cancelled,

    #[error("out of memory")]
    OutOfMemory,

    #[error("{0}")]
    Internal(String),

    /// The engine can no longer be trusted; the handle owning it is poisoned.
    #[error("engine state corrupted: {0}")]
    Corrupted(String),

    #[error("{0}")]
    Load(String),
}

impl From<EngineError> for VlmError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => VlmError::Cancelled,
            EngineError::OutOfMemory => VlmError::OutOfMemory,
            EngineError::Internal(message) | EngineError::Corrupted(message) => {
                VlmError::InternalError(message)
            }
            EngineError::Load(reason) => VlmError::ModelLoadFailed(reason),
        }
    }
}

/// A loaded model+projector pair. Calls are blocking and never concurrent.
pub trait InferenceEngine: Send {
    /// Produces the complete response for `prompt`. Implementations must
    /// poll `cancel` and return [`EngineError::Cancelled`] soon after it is set.
    fn generate(
        &mut self,
        prompt: &str,
        image: Option<&RgbTensor>,
        cancel: &AtomicBool,
    ) -> Result<String, EngineError>;

    /// Drops any conversational state left over from a previous call.
    fn reset(&mut self);
}

/// Builds engines from files on disk.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        variant: &ModelVariant,
        weights: &Path,
        projector: Option<&Path>,
    ) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

type EngineSlot = Arc<Mutex<Option<Box<dyn InferenceEngine>>>>;

/// Owned handle to one loaded variant.
///
/// A second call arriving while one is in flight fails fast with
/// [`VlmError::Busy`]. Once the engine reports corruption or panics, every
/// later call fails with [`VlmError::HandlePoisoned`].
pub struct RuntimeHandle {
    variant: Arc<ModelVariant>,
    has_projector: bool,
    engine: EngineSlot,
    poisoned: Arc<AtomicBool>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        variant: Arc<ModelVariant>,
        engine: Box<dyn InferenceEngine>,
        has_projector: bool,
    ) -> Self {
        Self {
            variant,
            has_projector,
            engine: Arc::new(Mutex::new(Some(engine))),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn variant(&self) -> &Arc<ModelVariant> {
        &self.variant
    }

    pub fn has_projector(&self) -> bool {
        self.has_projector
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Runs one generation. The engine is reset first so no context from an
    /// earlier prompt leaks in. On timeout the engine is told to stop and the
    /// handle stays busy until it has.
    pub async fn generate(
        &self,
        prompt: &str,
        image: Option<RgbTensor>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        if self.is_poisoned() {
            return Err(VlmError::HandlePoisoned);
        }
        if let Some(image) = &image {
            if !self.has_projector {
                return Err(VlmError::ProjectorMissing(self.variant.id.clone()));
            }
            if !image.is_consistent() {
                return Err(VlmError::ImageProcessingError(format!(
                    "tensor holds {} bytes, expected {} for {}x{}",
                    image.data.len(),
                    image.size.rgb_len(),
                    image.size.width,
                    image.size.height
                )));
            }
        }

        let mut guard = self
            .engine
            .clone()
            .try_lock_owned()
            .map_err(|_| VlmError::Busy)?;
        if guard.is_none() {
            return Err(VlmError::ModelNotFound(format!(
                "{} has been unloaded",
                self.variant.id
            )));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = cancel.clone();
        let poisoned = self.poisoned.clone();
        let prompt = prompt.to_string();
        let model_id = self.variant.id.clone();
        debug!("Generating with {} ({} prompt bytes)", model_id, prompt.len());

        let task = tokio::task::spawn_blocking(move || {
            let Some(engine) = guard.as_mut() else {
                return Err(EngineError::Internal("engine released".to_string()));
            };
            engine.reset();
            let result = engine.generate(&prompt, image.as_ref(), &task_cancel);
            match &result {
                Err(EngineError::Corrupted(reason)) => {
                    error!("Engine for {} corrupted: {}", model_id, reason);
                    poisoned.store(true, Ordering::SeqCst);
                }
                Err(_) => engine.reset(),
                Ok(_) => {}
            }
            result
        });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Generation with {} exceeded {:?}, cancelling",
                        self.variant.id, limit
                    );
                    cancel.store(true, Ordering::SeqCst);
                    return Err(VlmError::InferenceTimeout(limit));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result.map_err(VlmError::from),
            Err(e) => {
                error!("Inference task for {} panicked: {}", self.variant.id, e);
                self.poisoned.store(true, Ordering::SeqCst);
                Err(VlmError::InternalError(format!("inference task failed: {}", e)))
            }
        }
    }

    /// Clears conversational state; waits for an in-flight call to finish.
    pub async fn reset(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(VlmError::HandlePoisoned);
        }
        let mut guard = self.engine.lock().await;
        match guard.as_mut() {
            Some(engine) => {
                engine.reset();
                Ok(())
            }
            None => Err(VlmError::ModelNotFound(format!(
                "{} has been unloaded",
                self.variant.id
            ))),
        }
    }

    /// Drops the engine once any in-flight call has returned. Later calls on
    /// this handle fail with `ModelNotFound`.
    pub(crate) async fn release(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            // engines may unmap gigabytes on drop
            let _ = tokio::task::spawn_blocking(move || drop(engine)).await;
        }
    }
}
