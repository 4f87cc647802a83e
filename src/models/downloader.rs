use super::storage::SpaceProbe;
use crate::error::{Result, VlmError};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// How many times a dropped connection is resumed before the job fails.
const MAX_RESUME_ATTEMPTS: u32 = 3;

/// One file transfer for one variant.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub variant_id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Free space the destination volume must have before bytes flow.
    pub required_bytes: u64,
    pub sha256: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DownloadProgress {
    pub written: u64,
    pub total: Option<u64>,
    /// Never decreases within one job, even when the transfer restarts.
    pub fraction: f64,
    pub paused: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobControl {
    Run,
    Pause,
    Cancel,
}

struct JobEntry {
    id: u64,
    control: watch::Sender<JobControl>,
    task: JoinHandle<()>,
}

type JobTable = Arc<Mutex<HashMap<String, JobEntry>>>;

/// Runs at most one resumable download per variant.
pub struct DownloadCoordinator {
    client: Client,
    probe: Arc<dyn SpaceProbe>,
    jobs: JobTable,
    next_id: AtomicU64,
}

impl DownloadCoordinator {
    pub fn new(probe: Arc<dyn SpaceProbe>) -> Self {
        Self::with_client(Client::new(), probe)
    }

    pub fn with_client(client: Client, probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            client,
            probe,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Starts a transfer, cancelling (and waiting out) any job already
    /// running for the same variant.
    pub async fn start(&self, request: DownloadRequest) -> Result<DownloadTicket> {
        let url = parse_source_url(&request.url)?;
        let dir = destination_dir(&request.destination)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            VlmError::InvalidRequest(format!("cannot create directory {:?}: {}", dir, e))
        })?;

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(&request.variant_id) {
            info!("Replacing active download for {}", request.variant_id);
            stop_job(previous).await;
        }

        self.ensure_space(&dir, request.required_bytes).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = watch::channel(JobControl::Run);
        let (progress_tx, progress_rx) = watch::channel(DownloadProgress::default());
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let client = self.client.clone();
        let job = request.clone();
        let task = tokio::spawn(async move {
            let result = run_job(&client, url, &job, control_rx, &progress_tx).await;
            match &result {
                Ok(path) => info!("Download finished for {}: {:?}", job.variant_id, path),
                Err(VlmError::Cancelled) => info!("Download cancelled for {}", job.variant_id),
                Err(e) => error!("Download failed for {}: {}", job.variant_id, e),
            }
            if result.is_err() {
                discard_partial(&job.destination).await;
            }
            let _ = outcome_tx.send(result);
        });

        info!(
            "Started download {} for {} from {}",
            id, request.variant_id, request.url
        );
        jobs.insert(
            request.variant_id.clone(),
            JobEntry {
                id,
                control: control_tx,
                task,
            },
        );

        Ok(DownloadTicket {
            job_id: id,
            variant_id: request.variant_id,
            progress: progress_rx,
            outcome: outcome_rx,
            jobs: self.jobs.clone(),
        })
    }

    pub async fn pause(&self, variant_id: &str) -> Result<()> {
        self.signal(variant_id, JobControl::Pause).await
    }

    pub async fn resume(&self, variant_id: &str) -> Result<()> {
        self.signal(variant_id, JobControl::Run).await
    }

    /// Stops the variant's job and waits until it has cleaned up. Returns
    /// whether a running job was actually stopped.
    pub async fn cancel(&self, variant_id: &str) -> bool {
        let entry = self.jobs.lock().await.remove(variant_id);
        match entry {
            Some(entry) => {
                let was_running = !entry.task.is_finished();
                stop_job(entry).await;
                was_running
            }
            None => false,
        }
    }

    pub async fn is_active(&self, variant_id: &str) -> bool {
        self.jobs
            .lock()
            .await
            .get(variant_id)
            .is_some_and(|entry| !entry.task.is_finished())
    }

    /// Fails with `InsufficientStorage` when the volume holding `dir` has
    /// less than `required` bytes free. Unknown capacity passes.
    pub async fn ensure_space(&self, dir: &Path, required: u64) -> Result<()> {
        let probe = self.probe.clone();
        let target = dir.to_path_buf();
        let available = tokio::task::spawn_blocking(move || probe.available_bytes(&target))
            .await
            .map_err(io::Error::other)??;

        match available {
            Some(available) if available < required => {
                warn!(
                    "Insufficient disk space in {:?}: {} MB required, {} MB available",
                    dir,
                    required / 1_000_000,
                    available / 1_000_000
                );
                Err(VlmError::InsufficientStorage {
                    required,
                    available,
                })
            }
            Some(available) => {
                debug!(
                    "Disk space check passed: {} MB available, {} MB required",
                    available / 1_000_000,
                    required / 1_000_000
                );
                Ok(())
            }
            None => {
                warn!("Free space unknown for {:?}, skipping disk space check", dir);
                Ok(())
            }
        }
    }

    async fn signal(&self, variant_id: &str, control: JobControl) -> Result<()> {
        let jobs = self.jobs.lock().await;
        match jobs.get(variant_id) {
            Some(entry) if !entry.task.is_finished() => {
                debug!("Download {} for {} -> {:?}", entry.id, variant_id, control);
                entry.control.send_replace(control);
                Ok(())
            }
            _ => Err(VlmError::InvalidRequest(format!(
                "no active download for {}",
                variant_id
            ))),
        }
    }
}

/// Caller's view of a running job: a progress channel plus the final result.
pub struct DownloadTicket {
    job_id: u64,
    variant_id: String,
    progress: watch::Receiver<DownloadProgress>,
    outcome: oneshot::Receiver<Result<PathBuf>>,
    jobs: JobTable,
}

impl DownloadTicket {
    pub fn progress(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.clone()
    }

    pub async fn wait(self) -> Result<PathBuf> {
        self.wait_with_progress(|_| {}).await
    }

    /// Resolves with the job's terminal outcome, feeding every observed
    /// progress update to `on_progress` on the way.
    pub async fn wait_with_progress<F>(self, mut on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress),
    {
        let DownloadTicket {
            job_id,
            variant_id,
            mut progress,
            mut outcome,
            jobs,
        } = self;
        let mut last_seen = None;

        let result = loop {
            tokio::select! {
                result = &mut outcome => break result,
                changed = progress.changed() => {
                    if changed.is_err() {
                        break (&mut outcome).await;
                    }
                    let update = *progress.borrow_and_update();
                    last_seen = Some(update);
                    on_progress(update);
                }
            }
        };

        let latest = *progress.borrow();
        if last_seen != Some(latest) && latest != DownloadProgress::default() {
            on_progress(latest);
        }

        let mut jobs = jobs.lock().await;
        if jobs.get(&variant_id).is_some_and(|entry| entry.id == job_id) {
            jobs.remove(&variant_id);
        }

        result.unwrap_or_else(|_| Err(VlmError::NetworkError("download task aborted".to_string())))
    }
}

async fn stop_job(entry: JobEntry) {
    entry.control.send_replace(JobControl::Cancel);
    if let Err(e) = entry.task.await {
        warn!("Download task {} ended abnormally: {}", entry.id, e);
    }
}

async fn run_job(
    client: &Client,
    url: Url,
    request: &DownloadRequest,
    mut control: watch::Receiver<JobControl>,
    progress: &watch::Sender<DownloadProgress>,
) -> Result<PathBuf> {
    let part_path = part_path(&request.destination);
    let mut file = File::create(&part_path).await?;
    let mut written: u64 = 0;
    let mut total: Option<u64> = None;
    let mut reported = 0.0;
    let mut attempts = 0;

    'transfer: loop {
        let mut builder = client.get(url.clone());
        if written > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", written));
        }

        let response = tokio::select! {
            response = builder.send() => response,
            _ = wait_for_cancel(&mut control) => return Err(VlmError::Cancelled),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) if written > 0 && attempts < MAX_RESUME_ATTEMPTS => {
                attempts += 1;
                warn!("Reconnect failed for {} ({}), retrying", request.variant_id, e);
                continue 'transfer;
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(VlmError::NetworkError(format!("HTTP {} from {}", status, url)));
        }
        if written > 0 && status != StatusCode::PARTIAL_CONTENT {
            info!(
                "Server ignored range request, restarting {} from byte 0",
                request.variant_id
            );
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            written = 0;
        }
        total = response.content_length().map(|len| len + written).or(total);

        // a pause may have arrived while the request was in flight
        let state = *control.borrow();
        if state != JobControl::Run {
            pause_point(state, &mut control, progress, (written, total, reported), request).await?;
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(VlmError::Cancelled);
                    }
                    let state = *control.borrow_and_update();
                    pause_point(state, &mut control, progress, (written, total, reported), request).await?;
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    reported = publish(progress, written, total, reported, false);
                }
                Some(Err(e)) if attempts < MAX_RESUME_ATTEMPTS => {
                    attempts += 1;
                    warn!(
                        "Transfer interrupted for {} at {} bytes ({}), resuming",
                        request.variant_id, written, e
                    );
                    continue 'transfer;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break 'transfer,
            }
        }
    }

    if let Some(total) = total {
        if written < total {
            return Err(VlmError::NetworkError(format!(
                "transfer ended after {} of {} bytes",
                written, total
            )));
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = request.sha256.as_deref() {
        let actual = sha256_file(&part_path).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(VlmError::ChecksumMismatch(
                request.destination.display().to_string(),
            ));
        }
    }

    // rename replaces an existing file atomically, readers never see a partial model
    tokio::fs::rename(&part_path, &request.destination).await?;
    publish(progress, written, Some(written), 1.0, false);

    Ok(request.destination.clone())
}

/// Applies a control change at a chunk boundary: cancel fails the job,
/// pause blocks until resumed or cancelled.
async fn pause_point(
    state: JobControl,
    control: &mut watch::Receiver<JobControl>,
    progress: &watch::Sender<DownloadProgress>,
    (written, total, reported): (u64, Option<u64>, f64),
    request: &DownloadRequest,
) -> Result<()> {
    match state {
        JobControl::Run => Ok(()),
        JobControl::Cancel => Err(VlmError::Cancelled),
        JobControl::Pause => {
            debug!(
                "Download paused for {} at {} bytes",
                request.variant_id, written
            );
            publish(progress, written, total, reported, true);
            wait_while_paused(control).await?;
            debug!("Download resumed for {}", request.variant_id);
            publish(progress, written, total, reported, false);
            Ok(())
        }
    }
}

async fn wait_for_cancel(control: &mut watch::Receiver<JobControl>) {
    loop {
        if *control.borrow_and_update() == JobControl::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_while_paused(control: &mut watch::Receiver<JobControl>) -> Result<()> {
    loop {
        if control.changed().await.is_err() {
            return Err(VlmError::Cancelled);
        }
        match *control.borrow_and_update() {
            JobControl::Run => return Ok(()),
            JobControl::Cancel => return Err(VlmError::Cancelled),
            JobControl::Pause => {}
        }
    }
}

fn publish(
    progress: &watch::Sender<DownloadProgress>,
    written: u64,
    total: Option<u64>,
    reported: f64,
    paused: bool,
) -> f64 {
    let fraction = match total {
        Some(total) if total > 0 => (written as f64 / total as f64).min(1.0),
        _ => reported,
    };
    let fraction = fraction.max(reported);
    progress.send_replace(DownloadProgress {
        written,
        total,
        fraction,
        paused,
    });
    fraction
}

fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| VlmError::InvalidRequest(format!("invalid URL {:?}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(VlmError::InvalidRequest(format!(
            "unsupported URL scheme {:?}",
            scheme
        ))),
    }
}

fn destination_dir(destination: &Path) -> Result<PathBuf> {
    if destination.file_name().is_none() {
        return Err(VlmError::InvalidRequest(format!(
            "destination {:?} has no file name",
            destination
        )));
    }
    destination
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            VlmError::InvalidRequest(format!("destination {:?} has no directory", destination))
        })
}

/// Temporary sibling the transfer writes into, e.g. `model.gguf.part`.
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

async fn discard_partial(destination: &Path) {
    let part = part_path(destination);
    match tokio::fs::remove_file(&part).await {
        Ok(()) => debug!("Removed partial file {:?}", part),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial file {:?}: {}", part, e),
    }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
