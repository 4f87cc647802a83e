//! On-device vision-language model core for Realingo: catalog, resumable
//! downloads, single-active-model lifecycle, image preprocessing, prompt
//! templating and parsing of the model's JSON answers.

pub mod error;
pub mod formatting;
pub mod generation;
pub mod language;
pub mod models;
pub mod preferences;
pub mod preprocess;
pub mod response;
pub mod runtime;
pub mod shared_inbox;

pub use error::{Result, VlmError};
pub use generation::{AnswerToEvaluate, GenerationOutcome, GenerationRequest, GenerationService};
pub use language::{ExerciseKind, Language};
pub use models::{Catalog, DownloadCoordinator, ModelRegistry, ModelState, ModelVariant};
pub use preferences::{Preferences, PreferencesManager};
pub use preprocess::{preprocess, RgbTensor};
pub use response::{parse_exercise, parse_feedback, EvaluationFeedback, GeneratedExercise};
pub use runtime::{InferenceEngine, ModelLoader, RuntimeHandle};
pub use shared_inbox::{SharedImage, SharedInbox};
