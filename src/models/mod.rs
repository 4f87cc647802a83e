pub mod catalog;
pub mod downloader;
pub mod registry;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_server;

pub use catalog::Catalog;
pub use downloader::{DownloadCoordinator, DownloadProgress, DownloadRequest, DownloadTicket};
pub use registry::ModelRegistry;
pub use storage::{DfSpaceProbe, FixedSpaceProbe, SpaceProbe};
pub use types::{ArtifactSpec, ImageSize, ModelFamily, ModelPhase, ModelState, ModelVariant};
