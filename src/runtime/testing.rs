//! In-memory engine and loader used by the crate's tests.

use super::{EngineError, InferenceEngine, ModelLoader};
use crate::models::ModelVariant;
use crate::preprocess::RgbTensor;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub enum Reply {
    Echo,
    Fixed(String),
    Script(Vec<Result<String, EngineError>>),
}

pub struct FakeEngine {
    reply: Reply,
    script: VecDeque<Result<String, EngineError>>,
    delay: Duration,
    pub resets: Arc<AtomicUsize>,
    pub cancelled: Arc<AtomicBool>,
    pub live: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    pub fn new(reply: Reply) -> Self {
        Self::counted(reply, Arc::new(AtomicUsize::new(0)))
    }

    pub fn counted(reply: Reply, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        let (reply, script) = match reply {
            Reply::Script(steps) => (Reply::Echo, steps.into_iter().collect()),
            other => (other, VecDeque::new()),
        };
        Self {
            reply,
            script,
            delay: Duration::ZERO,
            resets: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            live,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl InferenceEngine for FakeEngine {
    fn generate(
        &mut self,
        prompt: &str,
        image: Option<&RgbTensor>,
        cancel: &AtomicBool,
    ) -> Result<String, EngineError> {
        let started = Instant::now();
        while started.elapsed() < self.delay {
            if cancel.load(Ordering::SeqCst) {
                self.cancelled.store(true, Ordering::SeqCst);
                return Err(EngineError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.prompts.lock().unwrap().push(prompt.to_string());

        if let Some(step) = self.script.pop_front() {
            return step;
        }
        match &self.reply {
            Reply::Fixed(text) => Ok(text.clone()),
            _ => Ok(match image {
                Some(_) => format!("echo: {} [image]", prompt),
                None => format!("echo: {}", prompt),
            }),
        }
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Loader that hands out [`FakeEngine`]s and records what it was asked for.
pub struct FakeLoader {
    reply: String,
    fail_with: Option<String>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub loads: Arc<Mutex<Vec<(String, PathBuf, Option<PathBuf>)>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeLoader {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail_with: None,
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::replying("")
        }
    }
}

impl ModelLoader for FakeLoader {
    fn load(
        &self,
        variant: &ModelVariant,
        weights: &Path,
        projector: Option<&Path>,
    ) -> Result<Box<dyn InferenceEngine>, EngineError> {
        self.loads.lock().unwrap().push((
            variant.id.clone(),
            weights.to_path_buf(),
            projector.map(Path::to_path_buf),
        ));
        if let Some(reason) = &self.fail_with {
            return Err(EngineError::Load(reason.clone()));
        }

        let mut engine = FakeEngine::counted(Reply::Fixed(self.reply.clone()), self.live.clone());
        engine.prompts = self.prompts.clone();
        self.max_live
            .fetch_max(self.live.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(Box::new(engine))
    }
}
