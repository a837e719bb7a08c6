use clap::{Parser, Subcommand};
use facefind_core::config::{Backend, Config};
use facefind_core::store::EventIndex;
use facefind_core::{FaceFinder, ImageInput, MatchState, ResultKind};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "facefind")]
#[command(about = "Find yourself in event photos", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default search path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find event photos containing the face in a selfie
    Find {
        /// Event id
        event: String,
        /// Selfie file path or URL
        selfie: String,
        /// Override the minimum similarity
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Override the best-of list capacity
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Show the closest photos when nothing clears the threshold
        #[arg(long)]
        fallback: bool,
    },
    /// Manage the photo index of an event
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
    /// Check that the embedding provider is reachable
    Health,
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Add a photo, embedding it now unless --defer is given
    Add {
        event: String,
        /// Stable photo id, e.g. its storage path
        photo_id: String,
        /// Photo file path or URL
        image: String,
        /// Displayable URL (defaults to the image argument)
        #[arg(long)]
        url: Option<String>,
        /// Store without a descriptor; it is embedded during matching
        #[arg(long)]
        defer: bool,
    },
    /// List indexed photos, newest first
    List { event: String },
    /// Remove a photo from the index
    Remove { event: String, photo_id: String },
}

fn image_input(arg: &str) -> ImageInput {
    if arg.starts_with("http://") || arg.starts_with("https://") {
        ImageInput::Url(arg.to_string())
    } else {
        ImageInput::File(PathBuf::from(arg))
    }
}

/// Fold command-line overrides into the matching config and validate the result
fn apply_overrides(
    mut config: Config,
    threshold: Option<f32>,
    top_k: Option<usize>,
    fallback: bool,
) -> anyhow::Result<Config> {
    if let Some(threshold) = threshold {
        config.matching.threshold = threshold;
    }
    if let Some(top_k) = top_k {
        config.matching.top_k = top_k;
    }
    if fallback {
        config.matching.fallback_when_empty = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load_from_path(path)?;
            config.validate()?;
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Find {
            event,
            selfie,
            threshold,
            top_k,
            fallback,
        } => cmd_find(config, event, selfie, threshold, top_k, fallback).await,
        Commands::Index { command } => cmd_index(config, command).await,
        Commands::Health => cmd_health(config).await,
        Commands::Config { validate } => cmd_config(config, validate),
    }
}

async fn cmd_find(
    config: Config,
    event: String,
    selfie: String,
    threshold: Option<f32>,
    top_k: Option<usize>,
    fallback: bool,
) -> anyhow::Result<()> {
    let config = apply_overrides(config, threshold, top_k, fallback)?;
    let options = config.matching.to_match_config();
    log::debug!("Match options: {:?}", options);

    let mut finder = FaceFinder::new(config)?;
    println!("Searching event {} for {}", event, selfie);

    let start = Instant::now();
    let mut handle = finder.find_with(&event, image_input(&selfie), options)?;
    let canceller = handle.canceller();

    loop {
        tokio::select! {
            snapshot = handle.next() => match snapshot {
                Some(snapshot) => {
                    if snapshot.state == MatchState::Scanning {
                        print!(
                            "\r[{}/{}] {} matches so far",
                            snapshot.progress.done,
                            snapshot.progress.total,
                            snapshot.results.len()
                        );
                        std::io::stdout().flush()?;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !canceller.is_cancelled() => {
                println!("\nCancelling...");
                canceller.cancel();
            }
        }
    }
    println!();

    let outcome = handle.join().await?;

    match outcome.state {
        MatchState::Cancelled => println!("Search cancelled, showing results so far"),
        _ => println!("Search complete"),
    }

    if outcome.results.is_empty() {
        println!("No matching photos found");
    } else {
        if outcome.kind == ResultKind::Closest {
            println!("No confident match; closest photos:");
        }
        println!();
        println!("{:<8} {:<40} {}", "Score", "Photo", "URL");
        println!("{}", "-".repeat(80));
        for entry in &outcome.results {
            println!(
                "{:<8.3} {:<40} {}",
                entry.score, entry.candidate.id, entry.candidate.url
            );
        }
    }

    println!();
    println!(
        "Scanned {}/{} photos ({} without a usable face) in {:.2}s",
        outcome.progress.done,
        outcome.progress.total,
        outcome.unscored,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

async fn cmd_index(config: Config, command: IndexCommands) -> anyhow::Result<()> {
    match command {
        IndexCommands::Add {
            event,
            photo_id,
            image,
            url,
            defer,
        } => {
            let url = url.unwrap_or_else(|| image.clone());
            let record = if defer {
                EventIndex::new(&config.storage.index_path).add_photo(&event, &photo_id, &url, None)?
            } else {
                FaceFinder::new(config)?
                    .index_photo(&event, &photo_id, &url, &image_input(&image))
                    .await?
            };

            println!("✓ Photo indexed: {}", record.id);
            if !record.has_descriptor {
                println!("Descriptor deferred until first match");
            }
        }
        IndexCommands::List { event } => {
            let index = EventIndex::new(&config.storage.index_path);
            let photos = index.list_photos(&event)?;

            if photos.is_empty() {
                println!("No photos indexed for event: {}", event);
                return Ok(());
            }

            println!("Photos for {}:", event);
            println!();
            println!("{:<40} {:<10} {}", "Photo", "Embedded", "Uploaded At");
            println!("{}", "-".repeat(75));
            for photo in photos {
                let embedded = if photo.has_descriptor { "yes" } else { "deferred" };
                let uploaded_at = photo.uploaded_at.format("%Y-%m-%d %H:%M:%S");
                println!("{:<40} {:<10} {}", photo.id, embedded, uploaded_at);
            }
        }
        IndexCommands::Remove { event, photo_id } => {
            let index = EventIndex::new(&config.storage.index_path);
            index.remove_photo(&event, &photo_id)?;
            println!("✓ Photo removed: {}", photo_id);
        }
    }

    Ok(())
}

async fn cmd_health(config: Config) -> anyhow::Result<()> {
    let backend = config.provider.backend;
    let finder = FaceFinder::new(config)?;

    if finder.health().await? {
        println!("✓ Embedding provider ({:?}) is healthy", backend);
        Ok(())
    } else {
        anyhow::bail!("Embedding provider reported unhealthy")
    }
}

fn cmd_config(config: Config, validate: bool) -> anyhow::Result<()> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration:");
    println!();

    println!("[provider]");
    println!("  backend = {:?}", config.provider.backend);
    if config.provider.backend == Backend::Remote {
        println!("  url = {}", config.provider.url);
    }
    println!("  timeout = {}ms", config.provider.timeout_ms);
    println!();

    if config.provider.backend == Backend::Local {
        println!("[local]");
        println!("  detection_model = {:?}", config.local.detection_model);
        println!("  embedding_model = {:?}", config.local.embedding_model);
        println!("  confidence_threshold = {}", config.local.confidence_threshold);
        println!();
    }

    let m = &config.matching;
    println!("[matching]");
    println!("  batch_size = {}", m.batch_size);
    println!("  concurrency = {}", m.concurrency);
    println!("  pool_ceiling = {}", m.pool_ceiling);
    println!("  top_k = {}", m.top_k);
    println!("  threshold = {}", m.threshold);
    println!("  fallback_when_empty = {} (count {})", m.fallback_when_empty, m.fallback_count);
    println!("  timeout = {}ms", m.timeout_ms);
    println!();

    println!("[storage]");
    println!("  index_path = {:?}", config.storage.index_path);
    println!("  keep_faceless = {}", config.storage.keep_faceless);

    Ok(())
}
