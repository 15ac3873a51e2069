//! CLI entry point for the book recommendation core.
//!
//! Provides commands for ingesting texts, querying recommendations, and
//! maintaining the on-disk vector log and index.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use tracing::Level;

use folio::display::{create_results_table, create_stats_table, create_sync_table};
use folio::vector::{VectorError, parse_embedding_model};
use folio::{
    CoreError, Encoder, FastEmbedEncoder, ItemId, JsonlSource, MetadataSource, Query,
    RebuildOutcome, RecommendFilters, RecommendationCore, Settings, VectorDimension,
};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Book recommendations by embedding similarity
#[derive(Parser)]
#[command(
    name = "folio",
    version = env!("CARGO_PKG_VERSION"),
    about = "Book recommendations by embedding similarity",
    long_about = "Embed book texts, keep an approximate nearest-neighbour index in step with your catalog, and query it for similar books.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .folio directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Embed a book's text and index it")]
    Ingest {
        /// Item identifier from the catalog
        id: ItemId,

        /// Text to embed
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// Read the text to embed from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    #[command(about = "Remove a book from the index")]
    Delete {
        id: ItemId,
    },

    #[command(about = "Recommend books similar to a text or a stored book")]
    Recommend {
        /// Free-text query
        #[arg(required_unless_present = "item", conflicts_with = "item")]
        query: Option<String>,

        /// Recommend neighbours of this stored item instead
        #[arg(long)]
        item: Option<ItemId>,

        /// Number of results (defaults to recommend.default_k)
        #[arg(short)]
        k: Option<usize>,

        /// Item ids to leave out of the results
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<ItemId>,

        /// Drop results scoring below this
        #[arg(long)]
        min_score: Option<f32>,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Similarity of two texts (-1.0 to 1.0)")]
    Similarity {
        text_a: String,
        text_b: String,
    },

    #[command(about = "Show item states and index statistics")]
    Stats {
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Rebuild the index snapshot from the vector store")]
    Rebuild,

    #[command(about = "Rewrite the vector log without dead records")]
    Compact,

    #[command(about = "Apply changes from a JSON-lines change feed")]
    Sync {
        /// JSON-lines file of change records
        #[arg(long)]
        source: PathBuf,

        /// Cursor name (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
    },
}

impl Commands {
    fn needs_encoder(&self) -> bool {
        match self {
            Commands::Ingest { .. } | Commands::Similarity { .. } | Commands::Sync { .. } => true,
            Commands::Recommend { item, .. } => item.is_none(),
            _ => false,
        }
    }
}

/// Stand-in for commands that never embed text, so they start without
/// loading the model.
struct DetachedEncoder {
    model_name: String,
    dimension: VectorDimension,
}

impl Encoder for DetachedEncoder {
    fn encode_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Err(VectorError::EmbeddingFailed(format!(
            "model {} is not loaded for this command",
            self.model_name
        )))
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn load_encoder(settings: &Settings, needed: bool) -> Result<Arc<dyn Encoder>> {
    if needed {
        let encoder = FastEmbedEncoder::from_name(
            &settings.embedding.model,
            settings.embedding.cache_dir.clone(),
            settings.embedding.show_download_progress,
        )
        .with_context(|| format!("loading embedding model {}", settings.embedding.model))?;
        return Ok(Arc::new(encoder));
    }

    parse_embedding_model(&settings.embedding.model)?;
    Ok(Arc::new(DetachedEncoder {
        model_name: settings.embedding.model.clone(),
        dimension: VectorDimension::new(settings.index.dimension)?,
    }))
}

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            if let Err(warning) = Settings::check_init() {
                eprintln!("Warning: {warning}");
                eprintln!("Using default configuration for now.");
            }
            Settings::load().context("loading configuration")
        }
    }
}

fn report(error: &anyhow::Error) {
    eprintln!("Error: {error:#}");
    if let Some(core) = error.downcast_ref::<CoreError>() {
        for suggestion in core.recovery_suggestions() {
            eprintln!("  - {suggestion}");
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        report(&e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { force } = &cli.command {
        let path = Settings::init_config_file(*force).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("Edit {} to customize your settings.", path.display());
        return Ok(());
    }

    let settings = load_settings(&cli)?;
    init_tracing(cli.verbose || settings.debug);

    if let Commands::Config = &cli.command {
        println!("Current Configuration:");
        println!("{}", "=".repeat(50));
        println!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    let encoder = load_encoder(&settings, cli.command.needs_encoder())?;
    // Model loading and log replay block; keep them off the async workers.
    let core = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || RecommendationCore::open(&settings, encoder)).await??
    };

    let result = execute(&core, cli.command);
    core.shutdown();
    result
}

fn execute(core: &RecommendationCore, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } | Commands::Config => {
            // Already handled in run
        }

        Commands::Ingest { id, text, file } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("either --text or --file is required"),
            };
            let version = core.ingest(id, &text)?;
            println!("Indexed item {id} (version {version})");
        }

        Commands::Delete { id } => {
            if core.delete(id)? {
                println!("Deleted item {id}");
            } else {
                println!("Item {id} was not indexed");
            }
        }

        Commands::Recommend {
            query,
            item,
            k,
            exclude,
            min_score,
            json,
        } => {
            let k = k.unwrap_or_else(|| core.default_k());
            let mut filters = RecommendFilters::excluding(exclude);
            if let Some(min_score) = min_score {
                filters = filters.with_min_score(min_score);
            }

            let results = match (item, query.as_deref()) {
                (Some(item), _) => core.recommend_similar(item, k, &filters)?,
                (None, Some(text)) => core.recommend(Query::Text(text), k, &filters)?,
                (None, None) => bail!("either a query or --item is required"),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No recommendations above the score threshold");
            } else {
                println!("{}", create_results_table(&results));
            }
        }

        Commands::Similarity { text_a, text_b } => {
            let score = core.similarity(&text_a, &text_b)?;
            println!("{score}");
        }

        Commands::Stats { json } => {
            let stats = core.full_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", create_stats_table(&stats));
            }
        }

        Commands::Rebuild => match core.rebuild()? {
            RebuildOutcome::Published {
                generation,
                items,
                partitions,
                elapsed,
            } => println!(
                "Published generation {generation}: {items} items in {partitions} partitions ({elapsed:?})"
            ),
            RebuildOutcome::Coalesced => println!("A rebuild is already running"),
            RebuildOutcome::Abandoned => println!("Rebuild abandoned"),
        },

        Commands::Compact => {
            let before = core.store().log_records();
            if core.compact()? {
                println!(
                    "Compacted vector log: {before} -> {} records",
                    core.store().log_records()
                );
            } else {
                println!("Vector store is in memory; nothing to compact");
            }
        }

        Commands::Sync { source, name } => {
            let mut feed = JsonlSource::new(&source);
            if let Some(name) = name {
                feed = feed.with_name(name);
            }
            let report = core.sync_all(&feed)?;
            println!("{}", create_sync_table(feed.name(), &report));
        }
    }

    Ok(())
}
