use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use log::{info, warn};
use realingo_vlm::models::{DfSpaceProbe, ModelState};
use realingo_vlm::runtime::{LlamaCliLoader, LlamaCliOptions};
use realingo_vlm::{
    AnswerToEvaluate, Catalog, DownloadCoordinator, ExerciseKind, GenerationRequest,
    GenerationService, Language, ModelRegistry, PreferencesManager, SharedInbox,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Manage and run Realingo's on-device vision-language models.
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    List(ListArgs),
    Download(DownloadArgs),
    Delete(DeleteArgs),
    Load(LoadArgs),
    Generate(GenerateArgs),
    Evaluate(EvaluateArgs),
    Inbox(InboxArgs),
}

/// list catalog models with their download and load state
#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
struct ListArgs {}

/// download a model's weights and projector
#[derive(FromArgs)]
#[argh(subcommand, name = "download")]
struct DownloadArgs {
    /// model id from `list`
    #[argh(positional)]
    id: String,
}

/// delete a model's files
#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
struct DeleteArgs {
    /// model id from `list`
    #[argh(positional)]
    id: String,
}

/// load a model and make it the default for generation
#[derive(FromArgs)]
#[argh(subcommand, name = "load")]
struct LoadArgs {
    /// model id from `list`
    #[argh(positional)]
    id: String,
}

/// generate an exercise from an image and/or text
#[derive(FromArgs)]
#[argh(subcommand, name = "generate")]
struct GenerateArgs {
    /// language to learn, e.g. fi
    #[argh(option, default = "Language::Finnish")]
    target: Language,

    /// learner's native language, e.g. ja
    #[argh(option, default = "Language::Japanese")]
    native: Language,

    /// word_arrangement, fill_in_the_blank, speaking or writing
    #[argh(option, default = "ExerciseKind::WordArrangement")]
    kind: ExerciseKind,

    /// image to build the exercise around
    #[argh(option)]
    image: Option<PathBuf>,

    /// text to build the exercise around
    #[argh(option)]
    text: Option<String>,

    /// model id; defaults to the last loaded model
    #[argh(option)]
    model: Option<String>,
}

/// grade an answer against the expected one
#[derive(FromArgs)]
#[argh(subcommand, name = "evaluate")]
struct EvaluateArgs {
    /// language of the answer, e.g. fi
    #[argh(option, default = "Language::Finnish")]
    target: Language,

    /// exercise kind the answer belongs to
    #[argh(option, default = "ExerciseKind::Writing")]
    kind: ExerciseKind,

    /// the learner's answer
    #[argh(option)]
    answer: String,

    /// the correct answer
    #[argh(option)]
    expected: String,

    /// model id; defaults to the last loaded model
    #[argh(option)]
    model: Option<String>,
}

/// generate exercises for images shared from other apps
#[derive(FromArgs)]
#[argh(subcommand, name = "inbox")]
struct InboxArgs {
    /// language to learn, e.g. fi
    #[argh(option, default = "Language::Finnish")]
    target: Language,

    /// learner's native language, e.g. ja
    #[argh(option, default = "Language::Japanese")]
    native: Language,

    /// exercise kind to generate
    #[argh(option, default = "ExerciseKind::WordArrangement")]
    kind: ExerciseKind,

    /// model id; defaults to the last loaded model
    #[argh(option)]
    model: Option<String>,
}

struct App {
    preferences: PreferencesManager,
    registry: Arc<ModelRegistry>,
    generation: GenerationService,
}

impl App {
    async fn build() -> Result<Self> {
        let preferences = PreferencesManager::new().context("Failed to initialize preferences")?;
        let prefs = preferences.get_preferences().await;

        let binary = match LlamaCliOptions::locate(prefs.llama_binary.clone()) {
            Ok(binary) => binary,
            Err(e) => {
                // listing and downloading still work without the runner
                warn!("{}", e);
                PathBuf::from("llama-mtmd-cli")
            }
        };
        let loader = Arc::new(LlamaCliLoader::new(LlamaCliOptions {
            binary,
            max_tokens: prefs.max_tokens,
            temperature: prefs.temperature,
            gpu_layers: prefs.gpu_layers,
        }));

        let coordinator = Arc::new(DownloadCoordinator::new(Arc::new(DfSpaceProbe)));
        let registry = Arc::new(
            ModelRegistry::new(
                Arc::new(Catalog::builtin()),
                preferences.models_dir().await,
                coordinator,
                loader,
            )
            .context("Failed to initialize model registry")?,
        );
        registry.refresh().await?;

        let generation = GenerationService::new(registry.clone(), prefs.inference_timeout());
        Ok(Self {
            preferences,
            registry,
            generation,
        })
    }

    /// Loads `explicit` or the remembered model.
    async fn load_model(&self, explicit: Option<String>) -> Result<()> {
        let id = match explicit {
            Some(id) => id,
            None => self
                .preferences
                .get_preferences()
                .await
                .active_model
                .ok_or_else(|| anyhow!("No model selected; run `load <id>` or pass --model"))?,
        };
        self.registry.load(&id).await?;
        Ok(())
    }

    async fn download(&self, id: &str) -> Result<()> {
        let mut events = self.registry.subscribe();
        let watched = id.to_string();
        let printer = tokio::spawn(async move {
            let mut last = String::new();
            loop {
                match events.recv().await {
                    Ok(state) if state.model_id == watched && state.status != last => {
                        info!("{}: {}", watched, state.status);
                        last = state.status;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let download = self.registry.download(id);
        tokio::pin!(download);
        let result = tokio::select! {
            result = &mut download => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Cancelling download of {}", id);
                let _ = self.registry.cancel(id).await;
                download.await
            }
        };
        printer.abort();
        result?;
        Ok(())
    }
}

fn print_states(states: &[ModelState], catalog: &Catalog) {
    for state in states {
        let name = catalog
            .get(&state.model_id)
            .map(|variant| variant.display_name.clone())
            .unwrap_or_default();
        println!(
            "{:<32} {:<40} {}{}",
            state.model_id,
            name,
            state.status,
            if state.is_projector_present { " (+projector)" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli: Cli = argh::from_env();
    let app = App::build().await?;

    match cli.command {
        Command::List(_) => {
            print_states(&app.registry.snapshot().await, app.registry.catalog());
        }
        Command::Download(args) => {
            app.download(&args.id).await?;
        }
        Command::Delete(args) => {
            app.registry.delete(&args.id).await?;
            let prefs = app.preferences.get_preferences().await;
            if prefs.active_model.as_deref() == Some(args.id.as_str()) {
                app.preferences.set_active_model(None).await?;
            }
        }
        Command::Load(args) => {
            app.registry.load(&args.id).await?;
            app.preferences.set_active_model(Some(args.id.clone())).await?;
            info!("{} loaded and selected", args.id);
        }
        Command::Generate(args) => {
            app.load_model(args.model).await?;
            let mut request = GenerationRequest::new(args.target, args.native, args.kind);
            if let Some(path) = args.image {
                request.image = Some(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read image {:?}", path))?,
                );
            }
            request.source_text = args.text;
            let outcome = app.generation.generate(request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Evaluate(args) => {
            app.load_model(args.model).await?;
            let mut request = GenerationRequest::new(args.target, args.target, args.kind);
            request.evaluation = Some(AnswerToEvaluate {
                user_answer: args.answer,
                correct_answer: args.expected,
            });
            let outcome = app.generation.generate(request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Inbox(args) => {
            app.load_model(args.model).await?;
            let inbox = SharedInbox::new(app.preferences.shared_inbox_path().await);
            let template = GenerationRequest::new(args.target, args.native, args.kind);
            let outcomes = app.generation.generate_from_inbox(&inbox, &template).await?;
            if outcomes.is_empty() {
                info!("No shared images waiting");
            }
            for (path, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                    Err(e) => warn!("Could not generate from {:?}: {}", path, e),
                }
            }
        }
    }

    Ok(())
}
