//! Extraction of the JSON payload from conversational model output.

use crate::error::{Result, VlmError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A sentence exercise: the sentence, its translation, and a word-by-word
/// breakdown where `words[i]` translates to `translations[i]`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GeneratedExercise {
    pub sentence: String,
    pub translation: String,
    pub words: Vec<String>,
    pub translations: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFeedback {
    pub is_correct: bool,
    /// In `[0, 1]`.
    pub score: f64,
    pub feedback: String,
    pub suggestions: Option<Vec<String>>,
    pub grammar_errors: Option<Vec<String>>,
    pub vocabulary_errors: Option<Vec<String>>,
}

pub fn parse_exercise(raw: &str) -> Result<GeneratedExercise> {
    let object = payload(raw)?;
    let exercise = GeneratedExercise {
        sentence: string(&object, "sentence")?,
        translation: string(&object, "translation")?,
        words: string_list(&object, "words")?,
        translations: string_list(&object, "translations")?,
    };
    if exercise.words.len() != exercise.translations.len() {
        return Err(VlmError::InvalidExercise {
            words: exercise.words.len(),
            translations: exercise.translations.len(),
        });
    }
    Ok(exercise)
}

pub fn parse_feedback(raw: &str) -> Result<EvaluationFeedback> {
    let object = payload(raw)?;

    let score = object
        .get("score")
        .and_then(Value::as_f64)
        .filter(|score| (0.0..=1.0).contains(score))
        .ok_or_else(|| VlmError::SchemaMismatch("score".to_string()))?;

    Ok(EvaluationFeedback {
        is_correct: object
            .get("isCorrect")
            .and_then(Value::as_bool)
            .ok_or_else(|| VlmError::SchemaMismatch("isCorrect".to_string()))?,
        score,
        feedback: string(&object, "feedback")?,
        suggestions: optional_string_list(&object, "suggestions")?,
        grammar_errors: optional_string_list(&object, "grammarErrors")?,
        vocabulary_errors: optional_string_list(&object, "vocabularyErrors")?,
    })
}

/// The text from the first `{` through the last `}`.
fn json_span(raw: &str) -> Result<&str> {
    let start = raw
        .find('{')
        .ok_or_else(|| VlmError::MalformedResponse("no JSON object in response".to_string()))?;
    match raw.rfind('}') {
        Some(end) if end > start => Ok(&raw[start..=end]),
        _ => Err(VlmError::MalformedResponse(
            "JSON object in response is not closed".to_string(),
        )),
    }
}

fn payload(raw: &str) -> Result<Map<String, Value>> {
    let span = json_span(raw)?;
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(VlmError::MalformedResponse(
            "payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(VlmError::MalformedResponse(e.to_string())),
    }
}

fn mismatch(field: &str) -> VlmError {
    VlmError::SchemaMismatch(field.to_string())
}

fn string(object: &Map<String, Value>, field: &str) -> Result<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| mismatch(field))
}

fn string_list(object: &Map<String, Value>, field: &str) -> Result<Vec<String>> {
    let items = object
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| mismatch(field))?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(|| mismatch(field)))
        .collect()
}

fn optional_string_list(object: &Map<String, Value>, field: &str) -> Result<Option<Vec<String>>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => string_list(object, field).map(Some),
    }
}
