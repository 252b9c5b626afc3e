use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use place_insight::{
    annotate_places, export_table, fetch_places, init_tracing, parse_place_ids, place_photos,
    remove_rows, render_map, resolve_photos, validate_keys, AggregatedTable, AppConfig, AppState,
    DEFAULT_INSTRUCTION,
};

const CLI_SESSION: &str = "cli";
const MAX_CELL_WIDTH: usize = 28;

#[derive(Debug, Parser)]
#[command(name = "place-insight")]
#[command(about = "Look up Google places, map them, export them, and annotate them with an LLM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the effective configuration without secrets
    Config,
    /// Check the configured API keys against the live services
    Validate,
    /// Resolve photo URLs for one place
    Photos {
        place_id: String,
        /// Download the photos into this directory
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Fetch, map, annotate and export a batch of places
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Place ids separated by commas or newlines
    #[arg(long, conflicts_with = "ids_file")]
    ids: Option<String>,
    /// File with place ids separated by commas or newlines
    #[arg(long)]
    ids_file: Option<PathBuf>,
    /// Zero-based table rows to drop before photos, annotation and export
    #[arg(long, value_delimiter = ',')]
    remove: Vec<usize>,
    /// Resolve photo URLs for every row
    #[arg(long)]
    photos: bool,
    /// Send every row to the LLM for annotation (implies --photos)
    #[arg(long)]
    annotate: bool,
    /// Instruction sent to the LLM
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    /// File holding the instruction sent to the LLM
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// CSV output path (defaults to EXPORT_FILE_NAME)
    #[arg(long)]
    export: Option<PathBuf>,
    /// Write an HTML map to this path
    #[arg(long)]
    map: Option<PathBuf>,
    /// Print a shareable Google Maps link for the located rows
    #[arg(long)]
    share_link: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let state = AppState::initialize(config).context("failed to initialize")?;

    let result = match cli.command {
        Commands::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&state.config().public_profile())?
            );
            Ok(())
        }
        Commands::Validate => validate(&state).await,
        Commands::Photos { place_id, download } => photos(&state, &place_id, download).await,
        Commands::Run(args) => run(&state, args).await,
    };
    state.shutdown();
    result
}

async fn validate(state: &AppState) -> anyhow::Result<()> {
    let report = validate_keys(state, CLI_SESSION).await?;
    if report.maps_valid {
        println!("Google Maps API key is valid.");
    } else {
        println!("Google Maps API key is invalid.");
    }
    match report.llm_valid {
        Some(true) => println!("OpenAI API key is valid."),
        Some(false) => println!("OpenAI API key is invalid."),
        None => println!("No OpenAI API key configured."),
    }
    if !report.maps_valid || report.llm_valid == Some(false) {
        bail!("one or more API keys are invalid");
    }
    Ok(())
}

async fn photos(
    state: &AppState,
    place_id: &str,
    download: Option<PathBuf>,
) -> anyhow::Result<()> {
    let summary = place_photos(state, place_id).await?;
    if summary.urls.is_empty() {
        println!("No photos available.");
        return Ok(());
    }
    for url in &summary.urls {
        println!("{url}");
    }
    if let Some(dir) = download {
        let saved = state
            .photo_resolver()?
            .download_all(&summary.urls, &dir)
            .await?;
        println!("Saved {} of {} photos to {}", saved.len(), summary.urls.len(), dir.display());
    }
    Ok(())
}

async fn run(state: &AppState, args: RunArgs) -> anyhow::Result<()> {
    let raw_ids = match (&args.ids, &args.ids_file) {
        (Some(ids), _) => ids.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("pass --ids or --ids-file"),
    };
    let place_ids = parse_place_ids(&raw_ids);
    if place_ids.is_empty() {
        bail!("no place ids found in the input");
    }
    let max = state.config().max_place_ids;
    if place_ids.len() > max {
        bail!(
            "{} place ids entered; at most {max} are allowed per batch",
            place_ids.len()
        );
    }

    let keys = validate_keys(state, CLI_SESSION).await?;
    if !keys.maps_valid {
        bail!("invalid Google Maps API key; set GOOGLE_MAPS_API_KEY and try again");
    }

    let fetched = fetch_places(state, CLI_SESSION, place_ids).await?;
    if !fetched.skipped.is_empty() {
        let ids: Vec<_> = fetched.skipped.iter().map(|s| s.place_id.as_str()).collect();
        eprintln!(
            "Fetched {} of {} places; skipped: {}",
            fetched.fetched,
            fetched.requested,
            ids.join(", ")
        );
    }
    let mut table = fetched.table;

    if !args.remove.is_empty() {
        let indices: BTreeSet<usize> = args.remove.iter().copied().collect();
        table = remove_rows(state, CLI_SESSION, &indices)?;
    }
    print_table(&table);

    let view = render_map(state, CLI_SESSION, args.map.as_deref())?;
    if let Some(path) = &args.map {
        println!("Map with {} markers written to {}", view.markers.len(), path.display());
    }
    if args.share_link {
        println!("{}", view.share_link()?);
    }

    if args.photos || args.annotate {
        for summary in resolve_photos(state, CLI_SESSION)? {
            if summary.urls.is_empty() {
                println!("{}: no photos available", summary.place_id);
            } else {
                println!("{}: {} photos", summary.place_id, summary.urls.len());
            }
        }
    }

    if args.annotate {
        if keys.llm_valid != Some(true) {
            bail!("annotation needs a valid OPENAI_API_KEY");
        }
        let instruction = match (&args.prompt, &args.prompt_file) {
            (Some(prompt), _) => prompt.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            (None, None) => DEFAULT_INSTRUCTION.to_string(),
        };
        let summary = annotate_places(state, CLI_SESSION, &instruction).await?;
        println!(
            "Annotated {} places ({} failed)",
            summary.annotated, summary.failed
        );
        print_table(&summary.table);
    }

    let export = export_table(state, CLI_SESSION, args.export.as_deref())?;
    println!(
        "Exported {} rows x {} columns to {}",
        export.rows,
        export.columns,
        export.path.display()
    );
    Ok(())
}

fn print_table(table: &AggregatedTable) {
    if table.is_empty() {
        println!("No places to show.");
        return;
    }
    let mut widths: Vec<usize> = table.columns().iter().map(|c| c.chars().count()).collect();
    for row in table.rows() {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count()).min(MAX_CELL_WIDTH);
        }
    }

    let render = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{:<width$}", truncate(cell, width)))
            .collect::<Vec<_>>()
            .join("  ")
    };
    println!("{:>3}  {}", "#", render(table.columns()));
    for (index, row) in table.rows().iter().enumerate() {
        println!("{index:>3}  {}", render(row));
    }
}

fn truncate(cell: &str, width: usize) -> String {
    let flat = cell.replace('\n', " ");
    if flat.chars().count() <= width {
        return flat;
    }
    let mut cut: String = flat.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
