use super::gguf;
use super::{EngineError, InferenceEngine, ModelLoader};
use crate::models::ModelVariant;
use crate::preprocess::RgbTensor;
use image::{ImageFormat, RgbImage};
use log::{debug, info};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const BINARY_NAME: &str = "llama-mtmd-cli";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct LlamaCliOptions {
    pub binary: PathBuf,
    pub max_tokens: u32,
    pub temperature: f32,
    pub gpu_layers: u32,
}

impl LlamaCliOptions {
    /// Uses `explicit` when given, otherwise searches the app bundle and
    /// development locations next to the executable, then `PATH`.
    pub fn locate(explicit: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        if let Some(path) = explicit {
            return if path.exists() {
                Ok(path)
            } else {
                Err(EngineError::Load(format!("{} not found at {:?}", BINARY_NAME, path)))
            };
        }

        let mut candidates = Vec::new();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            // app bundle, then dev resources
            candidates.push(exe_dir.join("../Resources").join(BINARY_NAME));
            candidates.push(exe_dir.join("../../resources").join(BINARY_NAME));
            candidates.push(exe_dir.join(BINARY_NAME));
        }
        if let Some(path_var) = std::env::var_os("PATH") {
            candidates.extend(std::env::split_paths(&path_var).map(|dir| dir.join(BINARY_NAME)));
        }

        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| {
                EngineError::Load(format!(
                    "{} binary not found. Tried:\n{}",
                    BINARY_NAME,
                    candidates
                        .iter()
                        .map(|p| format!("  - {:?}", p))
                        .collect::<Vec<_>>()
                        .join("\n")
                ))
            })
    }
}

/// Loads models for the llama.cpp multimodal command-line runner.
pub struct LlamaCliLoader {
    options: LlamaCliOptions,
}

impl LlamaCliLoader {
    pub fn new(options: LlamaCliOptions) -> Self {
        Self { options }
    }
}

impl ModelLoader for LlamaCliLoader {
    fn load(
        &self,
        variant: &ModelVariant,
        weights: &Path,
        projector: Option<&Path>,
    ) -> Result<Box<dyn InferenceEngine>, EngineError> {
        if !self.options.binary.is_file() {
            return Err(EngineError::Load(format!(
                "{} not found at {:?}",
                BINARY_NAME, self.options.binary
            )));
        }

        let header = gguf::read_header(weights)
            .map_err(|e| EngineError::Load(format!("weights {:?}: {}", weights, e)))?;
        if let Some(projector) = projector {
            gguf::read_header(projector)
                .map_err(|e| EngineError::Load(format!("projector {:?}: {}", projector, e)))?;
        }
        info!(
            "Prepared {} (GGUF v{}, {} tensors) for {:?}",
            variant.id, header.version, header.tensor_count, self.options.binary
        );

        let scratch = tempfile::Builder::new()
            .prefix("realingo-vlm-")
            .tempdir()
            .map_err(|e| EngineError::Load(format!("cannot create scratch dir: {}", e)))?;

        Ok(Box::new(LlamaCliEngine {
            options: self.options.clone(),
            weights: weights.to_path_buf(),
            projector: projector.map(Path::to_path_buf),
            scratch,
        }))
    }
}

struct LlamaCliEngine {
    options: LlamaCliOptions,
    weights: PathBuf,
    projector: Option<PathBuf>,
    scratch: TempDir,
}

impl LlamaCliEngine {
    fn write_image(&self, image: &RgbTensor) -> Result<PathBuf, EngineError> {
        let buffer = RgbImage::from_raw(image.size.width, image.size.height, image.data.clone())
            .ok_or_else(|| EngineError::Internal("tensor does not match its size".to_string()))?;
        let path = self.scratch.path().join("input.png");
        buffer
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| EngineError::Internal(format!("cannot write image: {}", e)))?;
        Ok(path)
    }

    fn run(&self, mut command: Command, cancel: &AtomicBool) -> Result<String, EngineError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::Internal(format!("failed to execute {:?}: {}", self.options.binary, e))
            })?;

        // drain both pipes so the child never blocks on a full buffer
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let status = loop {
            if cancel.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(EngineError::Internal(e.to_string())),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            if mentions_allocation_failure(&stderr) {
                return Err(EngineError::OutOfMemory);
            }
            return Err(EngineError::Internal(format!(
                "{} failed ({}): {}",
                BINARY_NAME,
                status,
                tail(&stderr, 5)
            )));
        }

        let cleaned = clean_output(&stdout);
        debug!("Generated {} characters", cleaned.len());
        Ok(cleaned)
    }
}

impl InferenceEngine for LlamaCliEngine {
    fn generate(
        &mut self,
        prompt: &str,
        image: Option<&RgbTensor>,
        cancel: &AtomicBool,
    ) -> Result<String, EngineError> {
        let mut command = Command::new(&self.options.binary);
        command.arg("-m").arg(&self.weights);

        if let Some(image) = image {
            let projector = self.projector.as_ref().ok_or_else(|| {
                EngineError::Internal("image given to a model without projector".to_string())
            })?;
            let image_path = self.write_image(image)?;
            command.arg("--mmproj").arg(projector);
            command.arg("--image").arg(image_path);
        }

        command
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(self.options.max_tokens.to_string())
            .arg("--temp")
            .arg(self.options.temperature.to_string())
            .arg("-ngl")
            .arg(self.options.gpu_layers.to_string())
            .arg("--no-display-prompt");

        debug!("Running {:?} with model {:?}", self.options.binary, self.weights);
        self.run(command, cancel)
    }

    fn reset(&mut self) {
        // each run is a fresh process; only the staged image can linger
        let _ = std::fs::remove_file(self.scratch.path().join("input.png"));
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).is_ok() {
            text = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    text
}

fn mentions_allocation_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ["out of memory", "failed to allocate", "cudamalloc failed", "bad_alloc"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Strips the runner's own log lines and surrounding whitespace.
fn clean_output(raw: &str) -> String {
    raw.trim()
        .lines()
        .filter(|line| {
            !["llama", "ggml", "clip", "mtmd", "main:", "encoding image", "image slice"]
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Catalog;

    #[test]
    fn clean_output_drops_runtime_logging() {
        let raw = "llama_model_loader: loaded meta data\nclip_model_load: model name\n\
                   {\"sentence\": \"Hei\"}\nggml_metal_free: deallocating\n";
        assert_eq!(clean_output(raw), "{\"sentence\": \"Hei\"}");
    }

    #[test]
    fn allocation_failures_are_recognised() {
        assert!(mentions_allocation_failure(
            "ggml_metal: failed to allocate buffer of size 123"
        ));
        assert!(!mentions_allocation_failure("error: invalid argument --foo"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\n\nc\nd\n", 2), "c\nd");
        assert_eq!(tail("", 3), "");
    }

    #[test]
    fn locate_reports_missing_explicit_binary() {
        let err = LlamaCliOptions::locate(Some(PathBuf::from("/nonexistent/llama"))).unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn loader_rejects_non_gguf_weights() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(BINARY_NAME);
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        let weights = dir.path().join("model.gguf");
        std::fs::write(&weights, b"<html>404</html>").unwrap();

        let loader = LlamaCliLoader::new(LlamaCliOptions {
            binary,
            max_tokens: 16,
            temperature: 0.7,
            gpu_layers: 0,
        });
        let variant = Catalog::builtin().get("gemma-3-4b-it-Q4_K_M").unwrap();
        let err = loader.load(&variant, &weights, None).err().unwrap();
        assert!(matches!(err, EngineError::Load(_)));

        std::fs::write(&weights, gguf::fake_header(1, 1)).unwrap();
        assert!(loader.load(&variant, &weights, None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn runs_the_binary_and_returns_stdout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(BINARY_NAME);
        std::fs::write(
            &binary,
            "#!/bin/sh\necho 'llama_init: ready'\necho '{\"ok\": true}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let weights = dir.path().join("model.gguf");
        std::fs::write(&weights, gguf::fake_header(1, 1)).unwrap();

        let loader = LlamaCliLoader::new(LlamaCliOptions {
            binary,
            max_tokens: 16,
            temperature: 0.7,
            gpu_layers: 0,
        });
        let variant = Catalog::builtin().get("gemma-3-4b-it-Q4_K_M").unwrap();
        let mut engine = loader.load(&variant, &weights, None).unwrap();
        let out = engine
            .generate("hi", None, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(out, "{\"ok\": true}");
    }
}
