use super::catalog::Catalog;
use super::downloader::{part_path, DownloadCoordinator, DownloadProgress, DownloadRequest};
use super::types::{
    downloading_status, ArtifactSpec, ModelPhase, ModelState, ModelVariant, STATUS_DOWNLOADED,
    STATUS_DOWNLOADING_PROJECTOR, STATUS_DOWNLOAD_CANCELLED, STATUS_DOWNLOAD_COMPLETE,
    STATUS_LOADED, STATUS_LOADING, STATUS_NOT_DOWNLOADED, STATUS_PAUSED,
};
use crate::error::{Result, VlmError};
use crate::runtime::{ModelLoader, RuntimeHandle};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

const EVENT_CAPACITY: usize = 64;

/// Which file of a variant a transfer is fetching, and its share of the
/// variant's overall progress bar.
#[derive(Clone, Copy)]
struct Stage {
    projector: bool,
    offset: f64,
    share: f64,
}

/// Owns every variant's [`ModelState`] and the single active runtime handle.
///
/// Lock order is `active` then `states`; nothing takes them the other way
/// round.
pub struct ModelRegistry {
    catalog: Arc<Catalog>,
    models_dir: PathBuf,
    coordinator: Arc<DownloadCoordinator>,
    loader: Arc<dyn ModelLoader>,
    states: Arc<RwLock<HashMap<String, ModelState>>>,
    active: Mutex<Option<Arc<RuntimeHandle>>>,
    events: broadcast::Sender<ModelState>,
}

impl ModelRegistry {
    pub fn new(
        catalog: Arc<Catalog>,
        models_dir: PathBuf,
        coordinator: Arc<DownloadCoordinator>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)?;

        let states = catalog
            .iter()
            .map(|variant| (variant.id.clone(), ModelState::new(&variant.id)))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            catalog,
            models_dir,
            coordinator,
            loader,
            states: Arc::new(RwLock::new(states)),
            active: Mutex::new(None),
            events,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn weights_path(&self, variant: &ModelVariant) -> PathBuf {
        self.models_dir.join(&variant.weights.filename)
    }

    pub fn projector_path(&self, variant: &ModelVariant) -> Option<PathBuf> {
        variant
            .projector
            .as_ref()
            .map(|projector| self.models_dir.join(&projector.filename))
    }

    /// Every variant's state, in catalog order.
    pub async fn snapshot(&self) -> Vec<ModelState> {
        let states = self.states.read().await;
        self.catalog
            .iter()
            .filter_map(|variant| states.get(&variant.id).cloned())
            .collect()
    }

    pub async fn state(&self, id: &str) -> Option<ModelState> {
        self.states.read().await.get(id).cloned()
    }

    /// Receives every state change after it has been applied.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelState> {
        self.events.subscribe()
    }

    pub async fn active_handle(&self) -> Option<Arc<RuntimeHandle>> {
        self.active.lock().await.clone()
    }

    /// Rescans the models directory and recomputes every variant's state.
    /// Variants with a transfer or a lifecycle change in flight keep their
    /// phase; only their presence flags are updated.
    pub async fn refresh(&self) -> Result<()> {
        let mut active = self.active.lock().await;

        // a loaded model whose weights vanished cannot stay loaded
        if let Some(handle) = active.as_ref() {
            let path = self.weights_path(handle.variant());
            if !file_exists(&path).await {
                warn!(
                    "Weights of loaded model {} disappeared, unloading",
                    handle.variant().id
                );
                self.release_active(&mut active).await;
            }
        }
        let loaded_id = active.as_ref().map(|handle| handle.variant().id.clone());

        for variant in self.catalog.iter() {
            let (weights, projector) = self.presence(variant).await;
            let is_loaded = loaded_id.as_deref() == Some(variant.id.as_str());
            self.update_state(&variant.id, |state| {
                state.is_weights_present = weights;
                state.is_projector_present = projector;
                state.is_loaded = is_loaded;
                if matches!(state.phase, ModelPhase::Downloading | ModelPhase::Loading) {
                    return;
                }
                settle(state);
            })
            .await;
        }

        debug!("Refreshed {} model states", self.catalog.len());
        Ok(())
    }

    /// Fetches whatever the variant is missing: weights first, then the
    /// projector when the catalog publishes one.
    pub async fn download(&self, id: &str) -> Result<()> {
        let variant = self.variant(id)?;
        let (weights_present, projector_present) = self.presence(&variant).await;

        let mut stages: Vec<(&ArtifactSpec, bool)> = Vec::new();
        if !weights_present {
            if variant.weights.url.is_none() {
                return Err(VlmError::InvalidRequest(format!(
                    "{} has no download source",
                    variant.id
                )));
            }
            stages.push((&variant.weights, false));
        }
        if let Some(projector) = variant.projector.as_ref() {
            if !projector_present {
                if projector.url.is_some() {
                    stages.push((projector, true));
                } else {
                    warn!(
                        "{} has no published projector, place {} in {:?} manually",
                        variant.id, projector.filename, self.models_dir
                    );
                }
            }
        }

        if stages.is_empty() {
            info!("{} is already downloaded", variant.id);
            self.settle_from_disk(&variant, None).await;
            return Ok(());
        }

        // the whole variant has to fit before the first byte moves
        let required: u64 = stages.iter().map(|(artifact, _)| artifact.size_bytes).sum();
        if let Err(e) = self.coordinator.ensure_space(&self.models_dir, required).await {
            self.settle_from_disk(&variant, Some(format!("Download error: {}", e)))
                .await;
            return Err(e);
        }

        self.update_state(&variant.id, |state| {
            state.phase = ModelPhase::Downloading;
            state.download_progress = 0.0;
            state.status = downloading_status(0.0, 0, None);
        })
        .await;

        let mut offset = 0.0;
        for (artifact, is_projector) in stages {
            let share = if required > 0 {
                artifact.size_bytes as f64 / required as f64
            } else {
                1.0
            };
            let stage = Stage {
                projector: is_projector,
                offset,
                share,
            };
            if let Err(e) = self.fetch(&variant, artifact, stage).await {
                self.finish_failed_download(&variant, &e).await;
                return Err(e);
            }
            offset += share;
        }

        self.settle_from_disk(&variant, Some(STATUS_DOWNLOAD_COMPLETE.to_string()))
            .await;
        info!("Download complete for {}", variant.id);
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.variant(id)?;
        self.coordinator.pause(id).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.variant(id)?;
        self.coordinator.resume(id).await
    }

    /// Stops the variant's transfer. The pending `download` call resolves
    /// with [`VlmError::Cancelled`].
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.variant(id)?;
        if self.coordinator.cancel(id).await {
            Ok(())
        } else {
            Err(VlmError::InvalidRequest(format!(
                "no active download for {}",
                id
            )))
        }
    }

    /// Makes `id` the single loaded model, unloading whatever was loaded
    /// before. Returns the existing handle if `id` is already loaded and
    /// healthy.
    pub async fn load(&self, id: &str) -> Result<Arc<RuntimeHandle>> {
        let variant = self.variant(id)?;
        if self.coordinator.is_active(id).await {
            return Err(VlmError::InvalidRequest(format!(
                "{} is still downloading",
                id
            )));
        }

        let mut active = self.active.lock().await;

        let (weights_present, projector_present) = self.presence(&variant).await;
        if !weights_present {
            return Err(VlmError::ModelNotFound(format!(
                "{} weights are not downloaded",
                id
            )));
        }
        if variant.requires_vision_tower && !projector_present {
            return Err(VlmError::ProjectorMissing(id.to_string()));
        }

        if let Some(handle) = active.as_ref() {
            if handle.variant().id == variant.id && !handle.is_poisoned() {
                debug!("{} is already loaded", id);
                return Ok(handle.clone());
            }
        }
        self.release_active(&mut active).await;

        self.update_state(&variant.id, |state| {
            state.phase = ModelPhase::Loading;
            state.status = STATUS_LOADING.to_string();
        })
        .await;

        let weights = self.weights_path(&variant);
        let projector = self
            .projector_path(&variant)
            .filter(|_| projector_present);
        info!("Loading {} from {:?}", variant.id, weights);

        let loader = self.loader.clone();
        let task_variant = variant.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            loader.load(&task_variant, &weights, projector.as_deref())
        })
        .await;

        let engine = match loaded {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => return Err(self.fail_load(&variant, e.to_string()).await),
            Err(e) => return Err(self.fail_load(&variant, format!("loader panicked: {}", e)).await),
        };

        let handle = Arc::new(RuntimeHandle::new(variant.clone(), engine, projector_present));
        *active = Some(handle.clone());
        self.update_state(&variant.id, |state| {
            state.phase = ModelPhase::Loaded;
            state.is_loaded = true;
            state.status = STATUS_LOADED.to_string();
        })
        .await;
        info!("Loaded {}", variant.id);

        Ok(handle)
    }

    /// Releases the active handle, if any. Waits for an in-flight
    /// generation on it to return first.
    pub async fn unload(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.release_active(&mut active).await;
        Ok(())
    }

    /// Removes the variant's files, cancelling its download and unloading it
    /// first when needed. A projector still used by another downloaded
    /// variant stays on disk.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let variant = self.variant(id)?;
        if self.coordinator.cancel(id).await {
            info!("Cancelled download of {} before deleting it", id);
        }

        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|handle| handle.variant().id == variant.id)
        {
            self.release_active(&mut active).await;
        }

        let mut states = self.states.write().await;

        let weights = self.weights_path(&variant);
        remove_if_exists(&weights).await?;
        remove_if_exists(&part_path(&weights)).await?;

        let mut projector_kept = false;
        if let Some(projector) = self.projector_path(&variant) {
            let in_use = self.projector_in_use(&variant).await;
            if in_use {
                info!("Keeping {:?}, another downloaded model uses it", projector);
                projector_kept = file_exists(&projector).await;
            } else {
                remove_if_exists(&projector).await?;
            }
            remove_if_exists(&part_path(&projector)).await?;
        }

        if let Some(state) = states.get_mut(&variant.id) {
            *state = ModelState::new(&variant.id);
            state.is_projector_present = projector_kept;
            let _ = self.events.send(state.clone());
        }
        drop(states);

        self.sync_projector_sharers(&variant).await;
        info!("Deleted {}", variant.id);
        Ok(())
    }

    fn variant(&self, id: &str) -> Result<Arc<ModelVariant>> {
        self.catalog
            .get(id)
            .ok_or_else(|| VlmError::ModelNotFound(id.to_string()))
    }

    async fn presence(&self, variant: &ModelVariant) -> (bool, bool) {
        let weights = file_exists(&self.weights_path(variant)).await;
        let projector = match self.projector_path(variant) {
            Some(path) => file_exists(&path).await,
            None => false,
        };
        (weights, projector)
    }

    /// Re-reads the projector file on behalf of every other variant that
    /// shares it with `variant`.
    async fn sync_projector_sharers(&self, variant: &ModelVariant) {
        for other in self.catalog.projector_sharers(&variant.id) {
            let present = match self.projector_path(&other) {
                Some(path) => file_exists(&path).await,
                None => false,
            };
            self.update_state(&other.id, |state| {
                state.is_projector_present = present;
            })
            .await;
        }
    }

    async fn projector_in_use(&self, variant: &ModelVariant) -> bool {
        for other in self.catalog.projector_sharers(&variant.id) {
            if file_exists(&self.weights_path(&other)).await {
                return true;
            }
        }
        false
    }

    async fn fetch(&self, variant: &ModelVariant, artifact: &ArtifactSpec, stage: Stage) -> Result<()> {
        let url = artifact.url.clone().ok_or_else(|| {
            VlmError::InvalidRequest(format!("{} has no download source", artifact.filename))
        })?;
        if stage.projector {
            self.update_state(&variant.id, |state| {
                state.status = STATUS_DOWNLOADING_PROJECTOR.to_string();
            })
            .await;
        }

        let ticket = self
            .coordinator
            .start(DownloadRequest {
                variant_id: variant.id.clone(),
                url,
                destination: self.models_dir.join(&artifact.filename),
                required_bytes: artifact.size_bytes,
                sha256: artifact.sha256.clone(),
            })
            .await?;

        let mut progress = ticket.progress();
        let forward = async {
            while progress.changed().await.is_ok() {
                let update = *progress.borrow_and_update();
                self.record_progress(&variant.id, stage, update).await;
            }
        };
        let (result, ()) = tokio::join!(ticket.wait(), forward);
        result.map(|_| ())
    }

    async fn record_progress(&self, id: &str, stage: Stage, update: DownloadProgress) {
        let overall = (stage.offset + update.fraction * stage.share).clamp(0.0, 1.0);
        self.update_state(id, |state| {
            if state.phase != ModelPhase::Downloading {
                return;
            }
            state.download_progress = state.download_progress.max(overall);
            state.status = if update.paused {
                STATUS_PAUSED.to_string()
            } else if stage.projector {
                STATUS_DOWNLOADING_PROJECTOR.to_string()
            } else {
                downloading_status(update.fraction, update.written, update.total)
            };
        })
        .await;
    }

    async fn finish_failed_download(&self, variant: &ModelVariant, err: &VlmError) {
        // a newer download for the same variant now owns the state
        if matches!(err, VlmError::Cancelled) && self.coordinator.is_active(&variant.id).await {
            return;
        }
        let status = match err {
            VlmError::Cancelled => STATUS_DOWNLOAD_CANCELLED.to_string(),
            other => format!("Download error: {}", other),
        };
        self.settle_from_disk(variant, Some(status)).await;
    }

    /// Recomputes presence under the state lock and moves the variant to
    /// the steady phase the disk implies.
    async fn settle_from_disk(&self, variant: &ModelVariant, status: Option<String>) {
        {
            let mut states = self.states.write().await;
            let (weights, projector) = self.presence(variant).await;
            let Some(state) = states.get_mut(&variant.id) else {
                return;
            };
            state.is_weights_present = weights;
            state.is_projector_present = projector;
            if state.phase == ModelPhase::Downloading {
                state.phase = ModelPhase::Absent;
            }
            settle(state);
            if let Some(status) = status {
                state.status = status;
            }
            let _ = self.events.send(state.clone());
        }
        self.sync_projector_sharers(variant).await;
    }

    async fn fail_load(&self, variant: &ModelVariant, reason: String) -> VlmError {
        warn!("Failed to load {}: {}", variant.id, reason);
        self.update_state(&variant.id, |state| {
            state.phase = ModelPhase::Downloaded;
            state.is_loaded = false;
            state.status = format!("Load error: {}", reason);
        })
        .await;
        VlmError::ModelLoadFailed(reason)
    }

    async fn release_active(&self, active: &mut Option<Arc<RuntimeHandle>>) {
        let Some(handle) = active.take() else {
            return;
        };
        let id = handle.variant().id.clone();
        self.update_state(&id, |state| {
            state.phase = ModelPhase::Unloading;
        })
        .await;

        handle.release().await;

        let weights_present = file_exists(&self.weights_path(handle.variant())).await;
        self.update_state(&id, |state| {
            state.is_loaded = false;
            state.is_weights_present = weights_present;
            state.phase = ModelPhase::Downloaded;
            settle(state);
        })
        .await;
        info!("Unloaded {}", id);
    }

    async fn update_state<F>(&self, id: &str, apply: F)
    where
        F: FnOnce(&mut ModelState),
    {
        let snapshot = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                return;
            };
            let before = state.clone();
            apply(state);
            if *state == before {
                return;
            }
            state.clone()
        };
        // no subscribers is fine
        let _ = self.events.send(snapshot);
    }
}

/// Moves a state that is not mid-transition to the phase its flags imply.
fn settle(state: &mut ModelState) {
    if state.is_loaded && state.is_weights_present {
        state.phase = ModelPhase::Loaded;
        state.status = STATUS_LOADED.to_string();
    } else if state.is_weights_present {
        state.is_loaded = false;
        state.phase = ModelPhase::Downloaded;
        state.download_progress = 1.0;
        if !state.status.starts_with("Load error") {
            state.status = STATUS_DOWNLOADED.to_string();
        }
    } else {
        state.is_loaded = false;
        state.phase = ModelPhase::Absent;
        state.download_progress = 0.0;
        state.status = STATUS_NOT_DOWNLOADED.to_string();
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::storage::FixedSpaceProbe;
    use crate::models::test_server::{payload, serve};
    use crate::models::types::{ImageSize, ModelFamily};
    use crate::runtime::testing::FakeLoader;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn artifact(filename: &str, url: Option<&str>, size_bytes: u64) -> ArtifactSpec {
        ArtifactSpec {
            filename: filename.to_string(),
            url: url.map(str::to_string),
            size_bytes,
            sha256: None,
        }
    }

    fn variant(
        id: &str,
        weights: ArtifactSpec,
        projector: Option<ArtifactSpec>,
        requires_vision_tower: bool,
    ) -> ModelVariant {
        ModelVariant {
            id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            family: ModelFamily::Gemma3,
            weights,
            projector,
            image_size: ImageSize::square(8),
            requires_vision_tower,
        }
    }

    struct Fixture {
        dir: TempDir,
        registry: Arc<ModelRegistry>,
        loader: Arc<FakeLoader>,
    }

    impl Fixture {
        fn new(catalog: Catalog, available: u64) -> Self {
            Self::with_loader(catalog, available, FakeLoader::replying("ok"))
        }

        fn with_loader(catalog: Catalog, available: u64, loader: FakeLoader) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let loader = Arc::new(loader);
            let coordinator = Arc::new(DownloadCoordinator::new(Arc::new(FixedSpaceProbe(
                available,
            ))));
            let registry = ModelRegistry::new(
                Arc::new(catalog),
                dir.path().join("models"),
                coordinator,
                loader.clone(),
            )
            .unwrap();
            Self {
                dir,
                registry: Arc::new(registry),
                loader,
            }
        }

        fn place(&self, filename: &str) {
            std::fs::write(self.registry.models_dir().join(filename), b"model bytes").unwrap();
        }

        fn exists(&self, filename: &str) -> bool {
            self.registry.models_dir().join(filename).exists()
        }

        fn files(&self) -> Vec<String> {
            std::fs::read_dir(self.dir.path().join("models"))
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        }

        async fn loaded_count(&self) -> usize {
            self.registry
                .snapshot()
                .await
                .iter()
                .filter(|state| state.is_loaded)
                .count()
        }
    }

    fn offline_catalog() -> Catalog {
        Catalog::new(vec![
            variant(
                "vision",
                artifact("vision.gguf", Some("http://127.0.0.1:9/vision.gguf"), 100),
                Some(artifact("mmproj-shared.gguf", None, 50)),
                true,
            ),
            variant(
                "vision-q8",
                artifact("vision-q8.gguf", None, 200),
                Some(artifact("mmproj-shared.gguf", None, 50)),
                true,
            ),
            variant("text", artifact("text.gguf", None, 100), None, false),
        ])
    }

    #[tokio::test]
    async fn refresh_reflects_files_on_disk() {
        let fx = Fixture::new(Catalog::builtin(), u64::MAX);
        let gemma = fx.registry.catalog().get("gemma-3-4b-it-Q4_K_M").unwrap();
        fx.place(&gemma.weights.filename);
        fx.registry.refresh().await.unwrap();

        let state = fx.registry.state(&gemma.id).await.unwrap();
        assert_eq!(state.phase, ModelPhase::Downloaded);
        assert!(state.is_weights_present);
        assert!(!state.is_projector_present);
        assert_eq!(state.status, STATUS_DOWNLOADED);

        let absent = fx.registry.state("llava-v1.5-7b-Q4_K_M").await.unwrap();
        assert_eq!(absent.phase, ModelPhase::Absent);
        assert_eq!(absent.status, STATUS_NOT_DOWNLOADED);
        assert_eq!(fx.registry.snapshot().await.len(), 6);
    }

    #[tokio::test]
    async fn download_fetches_weights_then_projector() {
        let weights_body = payload(4096);
        let projector_body = payload(2048);
        let weights_url = serve(weights_body.clone(), 512, Duration::ZERO).await;
        let projector_url = serve(projector_body.clone(), 512, Duration::ZERO).await;
        let catalog = Catalog::new(vec![variant(
            "v",
            artifact("v.gguf", Some(&weights_url), 4096),
            Some(artifact("mmproj-v.gguf", Some(&projector_url), 2048)),
            true,
        )]);
        let fx = Fixture::new(catalog, u64::MAX);
        let mut events = fx.registry.subscribe();

        fx.registry.download("v").await.unwrap();

        assert_eq!(std::fs::read(fx.registry.models_dir().join("v.gguf")).unwrap(), weights_body);
        assert_eq!(
            std::fs::read(fx.registry.models_dir().join("mmproj-v.gguf")).unwrap(),
            projector_body
        );
        let state = fx.registry.state("v").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Downloaded);
        assert!(state.is_weights_present && state.is_projector_present);
        assert_eq!(state.download_progress, 1.0);
        assert_eq!(state.status, STATUS_DOWNLOAD_COMPLETE);

        let mut seen = Vec::new();
        while let Ok(state) = events.try_recv() {
            seen.push(state);
        }
        let downloading: Vec<f64> = seen
            .iter()
            .filter(|s| s.phase == ModelPhase::Downloading)
            .map(|s| s.download_progress)
            .collect();
        assert!(!downloading.is_empty());
        assert!(downloading.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().any(|s| s.status == STATUS_DOWNLOADING_PROJECTOR));

        // nothing left to fetch
        fx.registry.download("v").await.unwrap();
    }

    #[tokio::test]
    async fn insufficient_storage_fails_before_any_transfer() {
        let catalog = Catalog::new(vec![variant(
            "v",
            artifact("v.gguf", Some("http://127.0.0.1:9/v.gguf"), 1_500_000_000),
            Some(artifact(
                "mmproj-v.gguf",
                Some("http://127.0.0.1:9/mmproj-v.gguf"),
                500_000_000,
            )),
            true,
        )]);
        let fx = Fixture::new(catalog, 1_000_000_000);

        let err = fx.registry.download("v").await.unwrap_err();
        assert!(matches!(
            err,
            VlmError::InsufficientStorage {
                required: 2_000_000_000,
                available: 1_000_000_000
            }
        ));
        assert!(fx.files().is_empty());
        let state = fx.registry.state("v").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Absent);
        assert!(state.status.starts_with("Download error"));
    }

    #[tokio::test]
    async fn load_without_mandatory_projector_leaves_state_unchanged() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        fx.place("vision.gguf");
        fx.registry.refresh().await.unwrap();
        let before = fx.registry.snapshot().await;

        let err = fx.registry.load("vision").await.err().unwrap();
        assert!(matches!(err, VlmError::ProjectorMissing(_)));
        assert_eq!(fx.registry.snapshot().await, before);
        assert!(fx.loader.loads.lock().unwrap().is_empty());
        assert!(fx.registry.active_handle().await.is_none());
    }

    #[tokio::test]
    async fn load_without_weights_is_model_not_found() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        assert!(matches!(
            fx.registry.load("text").await,
            Err(VlmError::ModelNotFound(_))
        ));
        assert!(matches!(
            fx.registry.load("no-such-model").await,
            Err(VlmError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn at_most_one_model_is_ever_loaded() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        for file in ["vision.gguf", "vision-q8.gguf", "text.gguf", "mmproj-shared.gguf"] {
            fx.place(file);
        }
        fx.registry.refresh().await.unwrap();

        let steps = [
            "load:vision",
            "load:text",
            "load:vision-q8",
            "unload",
            "load:text",
            "delete:text",
            "load:vision",
            "load:vision",
            "delete:vision-q8",
            "load:vision",
            "unload",
            "unload",
        ];
        for step in steps {
            let _ = match step.split_once(':') {
                Some(("load", id)) => fx.registry.load(id).await.map(|_| ()),
                Some(("delete", id)) => fx.registry.delete(id).await,
                _ => fx.registry.unload().await,
            };
            assert!(fx.loaded_count().await <= 1, "after {step}");
            assert!(fx.loader.live.load(Ordering::SeqCst) <= 1, "after {step}");
        }
        assert_eq!(fx.loader.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(fx.loaded_count().await, 0);
    }

    #[tokio::test]
    async fn loading_again_returns_the_same_handle() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        fx.place("text.gguf");
        fx.registry.refresh().await.unwrap();

        let first = fx.registry.load("text").await.unwrap();
        let second = fx.registry.load("text").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.has_projector());
        assert_eq!(fx.loader.loads.lock().unwrap().len(), 1);

        let state = fx.registry.state("text").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Loaded);
        assert_eq!(state.status, STATUS_LOADED);
        assert_eq!(first.generate("hi", None, None).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn load_failure_leaves_no_model_active() {
        let fx = Fixture::with_loader(offline_catalog(), u64::MAX, FakeLoader::failing("bad magic"));
        fx.place("text.gguf");
        fx.registry.refresh().await.unwrap();

        let err = fx.registry.load("text").await.err().unwrap();
        assert!(matches!(err, VlmError::ModelLoadFailed(ref reason) if reason == "bad magic"));
        assert!(fx.registry.active_handle().await.is_none());
        let state = fx.registry.state("text").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Downloaded);
        assert!(!state.is_loaded);
        assert_eq!(state.status, "Load error: bad magic");
    }

    #[tokio::test]
    async fn delete_unloads_the_active_model() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        fx.place("text.gguf");
        fx.registry.refresh().await.unwrap();
        let handle = fx.registry.load("text").await.unwrap();

        fx.registry.delete("text").await.unwrap();

        assert!(!fx.exists("text.gguf"));
        assert!(fx.registry.active_handle().await.is_none());
        assert_eq!(fx.loader.live.load(Ordering::SeqCst), 0);
        assert!(matches!(
            handle.generate("x", None, None).await,
            Err(VlmError::ModelNotFound(_))
        ));
        assert_eq!(
            fx.registry.state("text").await.unwrap(),
            ModelState::new("text")
        );
    }

    #[tokio::test]
    async fn shared_projector_survives_until_last_user_is_deleted() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        for file in ["vision.gguf", "vision-q8.gguf", "mmproj-shared.gguf"] {
            fx.place(file);
        }
        fx.registry.refresh().await.unwrap();

        fx.registry.delete("vision").await.unwrap();
        assert!(fx.exists("mmproj-shared.gguf"));
        let deleted = fx.registry.state("vision").await.unwrap();
        assert!(!deleted.is_weights_present);
        assert!(deleted.is_projector_present);
        fx.registry.load("vision-q8").await.unwrap();

        fx.registry.delete("vision-q8").await.unwrap();
        assert!(!fx.exists("mmproj-shared.gguf"));
        assert!(fx.files().is_empty());
    }

    #[tokio::test]
    async fn removing_a_shared_projector_updates_every_sharer() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        for file in ["vision.gguf", "vision-q8.gguf", "mmproj-shared.gguf"] {
            fx.place(file);
        }
        fx.registry.refresh().await.unwrap();
        let mut events = fx.registry.subscribe();

        fx.registry.delete("vision").await.unwrap();
        fx.registry.delete("vision-q8").await.unwrap();

        assert!(!fx.exists("mmproj-shared.gguf"));
        for id in ["vision", "vision-q8"] {
            let state = fx.registry.state(id).await.unwrap();
            assert!(!state.is_projector_present, "{id}");
        }

        let mut seen = Vec::new();
        while let Ok(state) = events.try_recv() {
            seen.push(state);
        }
        let last_vision = seen.iter().rev().find(|s| s.model_id == "vision").unwrap();
        assert!(!last_vision.is_projector_present);
    }

    #[tokio::test]
    async fn downloaded_projector_is_visible_to_every_sharer() {
        let weights_url = serve(payload(1024), 256, Duration::ZERO).await;
        let projector_url = serve(payload(512), 256, Duration::ZERO).await;
        let catalog = Catalog::new(vec![
            variant(
                "a",
                artifact("a.gguf", Some(&weights_url), 1024),
                Some(artifact("mmproj-ab.gguf", Some(&projector_url), 512)),
                true,
            ),
            variant(
                "b",
                artifact("b.gguf", None, 1024),
                Some(artifact("mmproj-ab.gguf", Some(&projector_url), 512)),
                true,
            ),
        ]);
        let fx = Fixture::new(catalog, u64::MAX);
        fx.place("b.gguf");
        fx.registry.refresh().await.unwrap();
        assert!(!fx.registry.state("b").await.unwrap().is_projector_present);

        fx.registry.download("a").await.unwrap();

        assert!(fx.exists("mmproj-ab.gguf"));
        assert!(fx.registry.state("b").await.unwrap().is_projector_present);
        fx.registry.load("b").await.unwrap();
    }

    async fn wait_until_downloading(registry: &ModelRegistry, id: &str) {
        loop {
            let state = registry.state(id).await.unwrap();
            if state.phase == ModelPhase::Downloading && state.download_progress > 0.0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn slow_catalog(url: &str) -> Catalog {
        Catalog::new(vec![variant(
            "v",
            artifact("v.gguf", Some(url), 64 * 1024),
            None,
            false,
        )])
    }

    #[tokio::test]
    async fn cancel_resolves_download_with_cancelled() {
        let url = serve(payload(64 * 1024), 1024, Duration::from_millis(20)).await;
        let fx = Fixture::new(slow_catalog(&url), u64::MAX);

        let registry = fx.registry.clone();
        let download = tokio::spawn(async move { registry.download("v").await });
        wait_until_downloading(&fx.registry, "v").await;

        fx.registry.cancel("v").await.unwrap();
        assert!(matches!(download.await.unwrap(), Err(VlmError::Cancelled)));

        let state = fx.registry.state("v").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Absent);
        assert_eq!(state.status, STATUS_DOWNLOAD_CANCELLED);
        assert!(fx.files().is_empty());
        assert!(matches!(
            fx.registry.cancel("v").await,
            Err(VlmError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn delete_cancels_a_running_download() {
        let url = serve(payload(64 * 1024), 1024, Duration::from_millis(20)).await;
        let fx = Fixture::new(slow_catalog(&url), u64::MAX);

        let registry = fx.registry.clone();
        let download = tokio::spawn(async move { registry.download("v").await });
        wait_until_downloading(&fx.registry, "v").await;

        assert!(matches!(
            fx.registry.load("v").await,
            Err(VlmError::InvalidRequest(_))
        ));
        fx.registry.delete("v").await.unwrap();
        assert!(matches!(download.await.unwrap(), Err(VlmError::Cancelled)));

        assert!(fx.files().is_empty());
        let state = fx.registry.state("v").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Absent);
        assert!(!state.is_weights_present);
    }

    #[tokio::test]
    async fn refresh_unloads_a_model_whose_weights_vanished() {
        let fx = Fixture::new(offline_catalog(), u64::MAX);
        fx.place("text.gguf");
        fx.registry.refresh().await.unwrap();
        fx.registry.load("text").await.unwrap();

        std::fs::remove_file(fx.registry.models_dir().join("text.gguf")).unwrap();
        fx.registry.refresh().await.unwrap();

        assert!(fx.registry.active_handle().await.is_none());
        let state = fx.registry.state("text").await.unwrap();
        assert_eq!(state.phase, ModelPhase::Absent);
        assert!(!state.is_loaded);
    }
}
