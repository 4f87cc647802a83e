//! The entry point the app calls to turn a photo or a text into an exercise,
//! or to grade a learner's answer, using whichever model is loaded.

use crate::error::{Result, VlmError};
use crate::formatting::{format_prompt, instructions};
use crate::language::{ExerciseKind, Language};
use crate::models::{ModelRegistry, ModelVariant};
use crate::preprocess::{preprocess, RgbTensor};
use crate::response::{parse_exercise, parse_feedback, EvaluationFeedback, GeneratedExercise};
use crate::shared_inbox::SharedInbox;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnswerToEvaluate {
    pub user_answer: String,
    pub correct_answer: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub target_language: Language,
    pub native_language: Language,
    pub kind: ExerciseKind,
    /// Encoded image (PNG, JPEG, ...).
    #[serde(default, skip_serializing)]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub source_text: Option<String>,
    /// When set, the answer is graded instead of a new exercise being made.
    #[serde(default)]
    pub evaluation: Option<AnswerToEvaluate>,
}

impl GenerationRequest {
    pub fn new(target_language: Language, native_language: Language, kind: ExerciseKind) -> Self {
        Self {
            target_language,
            native_language,
            kind,
            image: None,
            source_text: None,
            evaluation: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Exercise(GeneratedExercise),
    Feedback(EvaluationFeedback),
}

pub struct GenerationService {
    registry: Arc<ModelRegistry>,
    timeout: Option<Duration>,
}

impl GenerationService {
    pub fn new(registry: Arc<ModelRegistry>, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let handle = self
            .registry
            .active_handle()
            .await
            .ok_or_else(|| VlmError::ModelNotFound("no model is loaded".to_string()))?;
        let variant = handle.variant().clone();

        if let Some(answer) = request.evaluation.as_ref() {
            if answer.correct_answer.trim().is_empty() {
                return Err(VlmError::InvalidRequest(
                    "correct answer must not be empty".to_string(),
                ));
            }
            let text = instructions::evaluation(
                request.kind,
                request.target_language,
                &answer.user_answer,
                &answer.correct_answer,
            );
            let prompt = format_prompt(variant.family, &text, false);
            debug!("Evaluating answer with {}", variant.id);
            let raw = handle.generate(&prompt, None, self.timeout).await?;
            return parse_feedback(&raw).map(GenerationOutcome::Feedback);
        }

        let image = match request.image {
            Some(bytes) => {
                // fail before paying for decode and resize
                if !handle.has_projector() {
                    return Err(VlmError::ProjectorMissing(variant.id.clone()));
                }
                Some(preprocess_blocking(bytes, &variant).await?)
            }
            None => None,
        };

        let source = request
            .source_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());
        let text = match source {
            Some(source) => instructions::source_text_exercise(
                request.kind,
                request.target_language,
                request.native_language,
                source,
                image.is_some(),
            ),
            None if image.is_some() => instructions::image_exercise(
                request.kind,
                request.target_language,
                request.native_language,
            ),
            None => instructions::text_exercise(
                request.kind,
                request.target_language,
                request.native_language,
            ),
        };
        let prompt = format_prompt(variant.family, &text, image.is_some());

        info!(
            "Generating {} exercise ({} -> {}) with {}{}",
            request.kind,
            request.target_language,
            request.native_language,
            variant.id,
            if image.is_some() { ", with image" } else { "" }
        );
        let raw = handle.generate(&prompt, image, self.timeout).await?;
        parse_exercise(&raw).map(GenerationOutcome::Exercise)
    }

    /// Builds one exercise per image waiting in `inbox`, using `template`
    /// for everything but the image. The inbox is left untouched unless a
    /// model is loaded.
    pub async fn generate_from_inbox(
        &self,
        inbox: &SharedInbox,
        template: &GenerationRequest,
    ) -> Result<Vec<(PathBuf, Result<GenerationOutcome>)>> {
        if self.registry.active_handle().await.is_none() {
            return Err(VlmError::ModelNotFound("no model is loaded".to_string()));
        }

        let images = inbox.drain().await?;
        let mut outcomes = Vec::with_capacity(images.len());
        for image in images {
            let mut request = template.clone();
            request.image = Some(image.bytes);
            request.evaluation = None;
            outcomes.push((image.path, self.generate(request).await));
        }
        Ok(outcomes)
    }
}

async fn preprocess_blocking(bytes: Vec<u8>, variant: &ModelVariant) -> Result<RgbTensor> {
    let size = variant.image_size;
    tokio::task::spawn_blocking(move || preprocess(&bytes, size))
        .await
        .map_err(|e| VlmError::ImageProcessingError(format!("preprocessing task failed: {}", e)))?
}
