use serde::{Deserialize, Serialize};

/// Chat-template family a variant belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Llava,
    Gemma3,
    HeronNvila,
}

/// Input tensor size a variant expects, in pixels.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    /// Length of an interleaved RGB buffer of this size.
    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// One downloadable file: the weights or the projector of a variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArtifactSpec {
    pub filename: String,
    pub url: Option<String>,
    pub size_bytes: u64,
    /// Expected SHA-256 in lowercase hex; verification is skipped when unset.
    pub sha256: Option<String>,
}

/// Immutable description of a supported model variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelVariant {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub family: ModelFamily,
    pub weights: ArtifactSpec,
    pub projector: Option<ArtifactSpec>,
    pub image_size: ImageSize,
    pub requires_vision_tower: bool,
}

/// Lifecycle phase of a single variant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    Absent,
    Downloading,
    Downloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Snapshot of a variant's state as published to observers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelState {
    pub model_id: String,
    pub phase: ModelPhase,
    pub is_weights_present: bool,
    pub is_projector_present: bool,
    pub is_loaded: bool,
    pub download_progress: f64,
    pub status: String,
}

impl ModelState {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            phase: ModelPhase::Absent,
            is_weights_present: false,
            is_projector_present: false,
            is_loaded: false,
            download_progress: 0.0,
            status: STATUS_NOT_DOWNLOADED.to_string(),
        }
    }
}

pub const STATUS_NOT_DOWNLOADED: &str = "Not downloaded";
pub const STATUS_DOWNLOADED: &str = "Downloaded";
pub const STATUS_DOWNLOADING_PROJECTOR: &str = "Downloading projector...";
pub const STATUS_PAUSED: &str = "Paused";
pub const STATUS_DOWNLOAD_COMPLETE: &str = "Download complete";
pub const STATUS_DOWNLOAD_CANCELLED: &str = "Download cancelled";
pub const STATUS_LOADING: &str = "Loading...";
pub const STATUS_LOADED: &str = "Loaded";

/// Human-readable progress line, e.g. `Downloading 42% (120.3MB / 2700.0MB)`.
pub fn downloading_status(progress: f64, written: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => format!(
            "Downloading {}% ({:.1}MB / {:.1}MB)",
            (progress * 100.0) as u32,
            written as f64 / 1_000_000.0,
            total as f64 / 1_000_000.0
        ),
        _ => "Downloading...".to_string(),
    }
}
