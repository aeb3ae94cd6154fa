use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use narrative_config::AppConfig;
use narrative_llm::{OllamaClient, WritingMode};
use narrative_prompt::{BrainstormKind, ImageKind, SummaryKind};
use narrative_runtime::{ContinueRequest, SessionState, StoryRuntime, StreamFrame};

#[derive(Debug, Parser)]
#[command(
    name = "narrative",
    version,
    about = "Retrieval-grounded story continuation and consistency checking"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Continue a chapter and append the result to it.
    Continue {
        #[arg(long)]
        story: Uuid,
        #[arg(long)]
        chapter: Uuid,
        /// ai_lead, user_lead or co_author.
        #[arg(long, default_value = "co_author")]
        mode: String,
        /// Free-form direction for this continuation.
        #[arg(long)]
        direction: Option<String>,
        #[arg(long, default_value_t = 500)]
        words: u32,
        #[arg(long)]
        temperature: Option<f32>,
        /// Print fragments as they arrive.
        #[arg(long)]
        stream: bool,
        /// With --stream, emit Server-Sent Events framing instead of raw text.
        #[arg(long, requires = "stream")]
        sse: bool,
    },
    /// Rewrite a passage according to instructions.
    Rewrite {
        #[arg(long)]
        story: Uuid,
        #[command(flatten)]
        input: ContentArgs,
        #[arg(long)]
        instructions: String,
        #[arg(long, default_value = "co_author")]
        mode: String,
    },
    /// Write dialogue in a character's voice.
    Dialogue {
        #[arg(long)]
        character: Uuid,
        /// Other characters present in the scene.
        #[arg(long = "with")]
        others: Vec<Uuid>,
        #[arg(long)]
        scene: String,
        #[arg(long)]
        situation: String,
        #[arg(long, default_value = "co_author")]
        mode: String,
    },
    Brainstorm {
        #[arg(long)]
        story: Uuid,
        /// plot, character, scene, dialogue, conflict or ending.
        #[arg(long, default_value = "plot")]
        kind: BrainstormKind,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        request: Option<String>,
    },
    Summarize {
        #[command(flatten)]
        input: ContentArgs,
        /// chapter, story or character.
        #[arg(long, default_value = "chapter")]
        kind: String,
    },
    /// "Previously on" recap of the story so far.
    Recap {
        #[arg(long)]
        story: Uuid,
    },
    /// Extract a structured story bible from the written chapters.
    Bible {
        #[arg(long)]
        story: Uuid,
    },
    /// Find world-building in new text that the story bible lacks.
    UpdateBible {
        #[arg(long)]
        story: Uuid,
        #[command(flatten)]
        input: ContentArgs,
    },
    /// Turn a description into a prompt for an image generation model.
    ImagePrompt {
        #[arg(long)]
        description: String,
        /// character, scene or cover.
        #[arg(long, default_value = "scene")]
        kind: ImageKind,
        #[arg(long)]
        style: Option<String>,
    },
    AnalyzeCharacter {
        #[arg(long)]
        character: Uuid,
        #[command(flatten)]
        input: ContentArgs,
    },
    /// Full consistency analysis of a passage.
    Check {
        #[arg(long)]
        story: Uuid,
        #[arg(long)]
        chapter: Option<Uuid>,
        #[command(flatten)]
        input: ContentArgs,
    },
    /// Fast consistency pass; prints an empty list when the backend is slow.
    QuickCheck {
        #[arg(long)]
        story: Uuid,
        #[command(flatten)]
        input: ContentArgs,
    },
    Stats {
        #[arg(long)]
        story: Uuid,
    },
    /// Embed every chapter, character and world rule of a story.
    Index {
        #[arg(long)]
        story: Uuid,
    },
    /// List models available on the generation backend.
    Models,
}

#[derive(Debug, Args)]
struct ContentArgs {
    /// Inline text.
    #[arg(long, conflicts_with = "file")]
    text: Option<String>,
    /// Read the text from a file.
    #[arg(long)]
    file: Option<PathBuf>,
}

impl ContentArgs {
    async fn read(&self) -> Result<String> {
        match (&self.text, &self.file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => Ok(tokio::fs::read_to_string(path).await?),
            (None, None) => bail!("pass --text or --file"),
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    // Logs go to stderr so streamed text on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = StoryRuntime::from_config(&config).await?;
    info!(model = runtime.model_name(), archive = %config.storage.archive_path, "runtime ready");

    let result = run(&runtime, &config, cli.command).await;
    // Re-indexing after a write runs in the background; let it land before
    // the process exits.
    runtime.drain().await;
    result
}

async fn run(runtime: &StoryRuntime, config: &AppConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Continue {
            story,
            chapter,
            mode,
            direction,
            words,
            temperature,
            stream,
            sse,
        } => {
            let request = ContinueRequest {
                user_direction: direction,
                word_target: words,
                temperature,
                ..ContinueRequest::new(story, chapter, WritingMode::from_label(&mode))
            };
            if stream {
                run_stream(runtime, &request, sse).await?;
            } else {
                print_json(&runtime.continue_chapter(&request).await?)?;
            }
        }
        Commands::Rewrite {
            story,
            input,
            instructions,
            mode,
        } => {
            let text = input.read().await?;
            let out = runtime
                .rewrite(story, &text, &instructions, WritingMode::from_label(&mode))
                .await?;
            println!("{}", out.content);
        }
        Commands::Dialogue {
            character,
            others,
            scene,
            situation,
            mode,
        } => {
            let out = runtime
                .dialogue(character, &others, &scene, &situation, WritingMode::from_label(&mode))
                .await?;
            println!("{}", out.content);
        }
        Commands::Brainstorm {
            story,
            kind,
            context,
            request,
        } => {
            let out = runtime
                .brainstorm(story, kind, context.as_deref(), request.as_deref())
                .await?;
            println!("{}", out.content);
        }
        Commands::Summarize { input, kind } => {
            let text = input.read().await?;
            let out = runtime.summarize(&text, SummaryKind::from_label(&kind)).await?;
            println!("{}", out.content);
        }
        Commands::Recap { story } => print_json(&runtime.recap(story).await?)?,
        Commands::Bible { story } => print_json(&runtime.extract_story_bible(story).await?)?,
        Commands::UpdateBible { story, input } => {
            let text = input.read().await?;
            print_json(&runtime.update_story_bible(story, &text).await?)?;
        }
        Commands::ImagePrompt {
            description,
            kind,
            style,
        } => print_json(&runtime.image_prompt(&description, kind, style.as_deref()).await?)?,
        Commands::AnalyzeCharacter { character, input } => {
            let text = input.read().await?;
            let out = runtime.analyze_character(character, &text).await?;
            println!("{}", out.content);
        }
        Commands::Check {
            story,
            chapter,
            input,
        } => {
            let text = input.read().await?;
            print_json(&runtime.check_consistency(story, &text, chapter).await?)?;
        }
        Commands::QuickCheck { story, input } => {
            let text = input.read().await?;
            print_json(&runtime.quick_check(story, &text).await?)?;
        }
        Commands::Stats { story } => print_json(&runtime.story_stats(story).await?)?,
        Commands::Index { story } => print_json(&runtime.index_story(story).await?)?,
        Commands::Models => {
            let client = OllamaClient::new(&config.llm)?;
            for model in client.list_models().await? {
                println!("{model}");
            }
        }
    }
    Ok(())
}

async fn run_stream(runtime: &StoryRuntime, request: &ContinueRequest, sse: bool) -> Result<()> {
    let mut handle = runtime.continue_chapter_stream(request).await?;
    let mut stdout = std::io::stdout();

    while let Some(frame) = handle.frames.recv().await {
        if sse {
            write!(stdout, "{}", frame.to_sse())?;
        } else {
            match &frame {
                StreamFrame::Token(text) => write!(stdout, "{text}")?,
                StreamFrame::Done => writeln!(stdout)?,
                StreamFrame::Error(message) => {
                    writeln!(stdout)?;
                    eprintln!("generation stopped: {message}");
                }
            }
        }
        stdout.flush()?;
        if frame.is_terminal() {
            break;
        }
    }

    let outcome = handle.outcome.await?;
    match outcome.state {
        SessionState::Persisted => eprintln!(
            "saved {} fragments; chapter is now {} words",
            outcome.fragments,
            outcome.word_count.unwrap_or_default()
        ),
        SessionState::NothingToPersist => eprintln!("nothing generated; chapter unchanged"),
        SessionState::PersistFailed => bail!(
            "generated text was not saved: {}",
            outcome.persist_error.unwrap_or_default()
        ),
        SessionState::Open | SessionState::Closing => {}
    }
    Ok(())
}
