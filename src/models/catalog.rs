use super::types::{ArtifactSpec, ImageSize, ModelFamily, ModelVariant};
use std::sync::Arc;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn gib(value: f64) -> u64 {
    (value * GIB) as u64
}

/// Static registry of the variants this build knows how to download and run.
///
/// Everything that used to be decided per model name (input size, template
/// family, space needed) is carried by the [`ModelVariant`] entries.
#[derive(Clone, Debug)]
pub struct Catalog {
    variants: Vec<Arc<ModelVariant>>,
}

impl Catalog {
    pub fn new(variants: Vec<ModelVariant>) -> Self {
        Self {
            variants: variants.into_iter().map(Arc::new).collect(),
        }
    }

    /// The catalog shipped with the app.
    pub fn builtin() -> Self {
        let llava_15_projector = ArtifactSpec {
            filename: "mmproj-llava-v1.5-7b-f16.gguf".to_string(),
            url: Some(
                "https://huggingface.co/mys/ggml_llava-v1.5-7b/resolve/main/mmproj-model-f16.gguf"
                    .to_string(),
            ),
            size_bytes: 624_434_336,
            sha256: None,
        };
        let gemma_projector = ArtifactSpec {
            filename: "mmproj-gemma-f16.gguf".to_string(),
            url: Some(
                "https://huggingface.co/ggml-org/gemma-3-4b-it-GGUF/resolve/main/mmproj-model-f16.gguf"
                    .to_string(),
            ),
            size_bytes: 851_251_104,
            sha256: None,
        };

        Self::new(vec![
            ModelVariant {
                id: "llava-v1.5-7b-Q4_K_M".to_string(),
                display_name: "LLaVA v1.5 7B (Q4_K_M, 3.8 GiB)".to_string(),
                description: "Standard quality general-purpose VLM".to_string(),
                family: ModelFamily::Llava,
                weights: ArtifactSpec {
                    filename: "ggml-model-q4_k.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/mys/ggml_llava-v1.5-7b/resolve/main/ggml-model-q4_k.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(3.8),
                    sha256: None,
                },
                projector: Some(llava_15_projector.clone()),
                image_size: ImageSize::square(336),
                requires_vision_tower: false,
            },
            ModelVariant {
                id: "llava-v1.5-7b-Q8_0".to_string(),
                display_name: "LLaVA v1.5 7B (Q8_0, 7.1 GiB)".to_string(),
                description: "High precision general-purpose VLM".to_string(),
                family: ModelFamily::Llava,
                weights: ArtifactSpec {
                    filename: "ggml-model-q8_0.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/mys/ggml_llava-v1.5-7b/resolve/main/ggml-model-q8_0.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(7.1),
                    sha256: None,
                },
                projector: Some(llava_15_projector),
                image_size: ImageSize::square(336),
                requires_vision_tower: false,
            },
            ModelVariant {
                id: "llava-v1.6-mistral-7b-Q4_K_M".to_string(),
                display_name: "LLaVA v1.6 Mistral 7B (Q4_K_M, 4.0 GiB)".to_string(),
                description: "Latest high-performance VLM".to_string(),
                family: ModelFamily::Llava,
                weights: ArtifactSpec {
                    filename: "llava-v1.6-mistral-7b.Q4_K_M.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/cjpais/llava-v1.6-mistral-7b-gguf/resolve/main/llava-v1.6-mistral-7b.Q4_K_M.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(4.0),
                    sha256: None,
                },
                projector: Some(ArtifactSpec {
                    filename: "mmproj-llava-v1.6-mistral-f16.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/cjpais/llava-v1.6-mistral-7b-gguf/resolve/main/mmproj-model-f16.gguf"
                            .to_string(),
                    ),
                    size_bytes: 624_434_336,
                    sha256: None,
                }),
                image_size: ImageSize::square(336),
                requires_vision_tower: false,
            },
            ModelVariant {
                id: "gemma-3-4b-it-Q4_K_M".to_string(),
                display_name: "Gemma 3 4B (Q4_K_M, 2.5 GiB)".to_string(),
                description: "Fast, memory-saving variant".to_string(),
                family: ModelFamily::Gemma3,
                weights: ArtifactSpec {
                    filename: "gemma-3-4b-it-Q4_K_M.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/ggml-org/gemma-3-4b-it-GGUF/resolve/main/gemma-3-4b-it-Q4_K_M.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(2.5),
                    sha256: None,
                },
                projector: Some(gemma_projector.clone()),
                image_size: ImageSize::square(336),
                requires_vision_tower: false,
            },
            ModelVariant {
                id: "gemma-3-4b-it-Q8_0".to_string(),
                display_name: "Gemma 3 4B (Q8_0, 4.2 GiB)".to_string(),
                description: "High precision variant".to_string(),
                family: ModelFamily::Gemma3,
                weights: ArtifactSpec {
                    filename: "gemma-3-4b-it-Q8_0.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/ggml-org/gemma-3-4b-it-GGUF/resolve/main/gemma-3-4b-it-Q8_0.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(4.2),
                    sha256: None,
                },
                projector: Some(gemma_projector),
                image_size: ImageSize::square(336),
                requires_vision_tower: false,
            },
            ModelVariant {
                id: "Heron-NVILA-Lite-2B".to_string(),
                display_name: "Heron NVILA Lite 2B (1.8 GiB)".to_string(),
                description: "Lightweight, Japanese-capable".to_string(),
                family: ModelFamily::HeronNvila,
                weights: ArtifactSpec {
                    filename: "heron-nvila-lite-2b.gguf".to_string(),
                    url: Some(
                        "https://huggingface.co/turing-motors/Heron-NVILA-Lite-2B/resolve/main/heron-nvila-lite-2b.gguf"
                            .to_string(),
                    ),
                    size_bytes: gib(1.8),
                    sha256: None,
                },
                // No converted projector is published; it has to be side-loaded.
                projector: Some(ArtifactSpec {
                    filename: "mmproj-heron-nvila.gguf".to_string(),
                    url: None,
                    size_bytes: 900_000_000,
                    sha256: None,
                }),
                image_size: ImageSize::square(448),
                requires_vision_tower: true,
            },
        ])
    }

    pub fn get(&self, id: &str) -> Option<Arc<ModelVariant>> {
        self.variants.iter().find(|v| v.id == id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelVariant>> {
        self.variants.iter()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Other variants that point at the same projector file as `id`.
    pub fn projector_sharers(&self, id: &str) -> Vec<Arc<ModelVariant>> {
        let Some(variant) = self.get(id) else {
            return Vec::new();
        };
        let Some(projector) = variant.projector.as_ref() else {
            return Vec::new();
        };
        self.variants
            .iter()
            .filter(|other| other.id != id)
            .filter(|other| {
                other
                    .projector
                    .as_ref()
                    .is_some_and(|p| p.filename == projector.filename)
            })
            .cloned()
            .collect()
    }
}
