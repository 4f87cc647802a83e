use std::time::Duration;

/// Every failure the VLM core reports to its callers.
///
/// All variants are recoverable at the call site: the caller may retry, fall
/// back to the cloud backend, or surface the message to the user.
#[derive(thiserror::Error, Debug)]
pub enum VlmError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient storage: {required} bytes required, {available} bytes available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Projector missing for model: {0}")]
    ProjectorMissing(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("Runtime handle is busy")]
    Busy,

    #[error("Runtime handle is poisoned, reload the model")]
    HandlePoisoned,

    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("Out of memory during inference")]
    OutOfMemory,

    #[error("Inference error: {0}")]
    InternalError(String),

    #[error("Image processing error: {0}")]
    ImageProcessingError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Schema mismatch on field `{0}`")]
    SchemaMismatch(String),

    #[error("Invalid exercise: {words} words but {translations} translations")]
    InvalidExercise { words: usize, translations: usize },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for VlmError {
    fn from(err: reqwest::Error) -> Self {
        VlmError::NetworkError(err.to_string())
    }
}

pub type Result<T, E = VlmError> = std::result::Result<T, E>;
