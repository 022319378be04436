use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, ColorChoice, CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use osm_triage::config::{Config, ConfigError};
use osm_triage::export::{self, TagSet};
use osm_triage::query::{CoordinateError, QueryArea, parse_lat_lon};
use osm_triage::store::{ArtifactPaths, Partition, Provenance, ResultStore, TriageState};
use osm_triage::{ReviewError, ReviewSession, TriageEngine};
use serde_json::json;
use std::io::{self, BufRead, IsTerminal, Write, stdout};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "osm-triage",
    about = "Review detected map features and export the accepted ones as OsmChange",
    arg_required_else_help = true
)]
struct Cli {
    /// Disable color
    #[arg(long = "no-color", global = true)]
    no_color: bool,

    /// More logging (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: per-user config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Result directory (overrides configuration)
    #[arg(long, value_name = "DIR", global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run inference around a coordinate
    Run(RunArgs),
    /// List candidates
    List(ListArgs),
    /// Show one candidate's artifacts
    Show(ShowArgs),
    /// Keep pending candidates
    Keep(DecideArgs),
    /// Discard pending candidates
    Discard(DecideArgs),
    /// Decide on pending candidates one at a time
    Review,
    /// Write kept candidates to an OsmChange file
    Export(ExportArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// "latitude, longitude", as copied from a map
    #[arg(value_name = "LAT_LON", allow_hyphen_values = true)]
    lat_lon: String,

    /// Side of the search area in kilometers
    #[arg(long, value_name = "KM")]
    margin: Option<f64>,

    /// Detector batch size
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Ask the detector to keep full images
    #[arg(long)]
    save_full_images: bool,

    /// Output the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Which {
    Pending,
    Keep,
    Discard,
}

#[derive(Args, Clone)]
struct ListArgs {
    /// Which candidates to list
    #[arg(long, value_enum, default_value = "pending")]
    partition: Which,

    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone)]
struct ShowArgs {
    /// Candidate identifier
    id: String,
}

#[derive(Args, Clone)]
struct DecideArgs {
    /// Candidate identifiers
    #[arg(value_name = "ID", required = true)]
    ids: Vec<String>,
}

#[derive(Args, Clone)]
struct ExportArgs {
    /// Tag for every feature, key=value (repeatable; default from config)
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    tags: Vec<String>,

    /// Output file (default: <output-dir>/exported_results.osc)
    #[arg(short, long, value_name = "FILE", conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Write the document to stdout
    #[arg(long)]
    stdout: bool,
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// Write a default configuration file if none exists
    #[arg(long)]
    init: bool,
}

/// Failures caused by what the operator typed.
fn is_user_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<CoordinateError>().is_some()
            || matches!(
                cause.downcast_ref::<ReviewError>(),
                Some(ReviewError::InvalidTag { .. } | ReviewError::UnknownCandidate(_))
            )
    })
}

fn detect_color_choice() -> ColorChoice {
    // Scan args before clap so help/errors honor `--no-color`.
    let mut args = std::env::args_os();
    args.next();
    let mut flag = false;
    for arg in args {
        if arg == "--" {
            break;
        }
        if arg == "--no-color" {
            flag = true;
            break;
        }
    }
    if flag || std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty()) {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        config.inference.output_dir = dir.clone();
    }
    Ok(config)
}

fn run_inference(args: RunArgs, mut config: Config) -> Result<()> {
    let center = parse_lat_lon(&args.lat_lon)
        .with_context(|| format!("cannot parse coordinate '{}'", args.lat_lon))?;
    let margin = args.margin.unwrap_or(config.inference.margin_km);
    let area = QueryArea::new(center, margin)?;
    if let Some(n) = args.batch_size {
        config.inference.batch_size = n;
    }
    if args.save_full_images {
        config.inference.save_full_images = true;
    }

    let session = ReviewSession::from_config(&config);
    eprintln!("Downloading model and running inference, this can take a while...");
    let summary = session.run_inference(area)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Area: {}", area.map_link());
    println!(
        "Map tiles: {} {}",
        config.map.tile_provider(),
        config.redacted().map.tile_url_template()
    );
    println!(
        "Found {} features already in OpenStreetMap.",
        summary.existing.len()
    );
    if !summary.missed.is_empty() {
        println!(
            "The model missed {} existing features (shown for reference only).",
            summary.missed.len()
        );
    }
    if summary.has_new() {
        println!("Found {} new features to review:", summary.new.len());
        for id in &summary.new {
            println!("  {id}");
        }
        println!("Next: osm-triage review");
    } else {
        println!(
            "{}",
            "No new features found. Try a different location.".yellow()
        );
    }
    Ok(())
}

fn sorted_ids(store: &ResultStore, which: Which) -> Result<Vec<String>> {
    let ids = match which {
        Which::Pending => store.list_pending()?,
        Which::Keep => store.list_partition(Partition::Keep)?,
        Which::Discard => store.list_partition(Partition::Discard)?,
    };
    let mut ids: Vec<String> = ids.collect();
    ids.sort();
    Ok(ids)
}

fn run_list(args: ListArgs, config: &Config) -> Result<()> {
    let store = ResultStore::new(&config.inference.output_dir);
    let ids = sorted_ids(&store, args.partition)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&json!(ids))?);
    } else {
        for id in ids {
            println!("{id}");
        }
    }
    Ok(())
}

fn describe_candidate(store: &ResultStore, id: &str) -> Result<String> {
    let state = store.state(id)?;
    let provenance = store.provenance(id)?;
    let artifacts = match state {
        TriageState::Pending => store.load_artifacts(id)?,
        TriageState::Kept => store.load_from(Partition::Keep, id)?,
        TriageState::Discarded => store.load_from(Partition::Discard, id)?,
    };
    let ring = artifacts.geometry.ring();
    let mut out = String::new();
    out.push_str(&format!("{}: {}\n", "Candidate".bold(), id));
    out.push_str(&format!("  state = {state}\n"));
    out.push_str(&format!("  provenance = {provenance}\n"));
    out.push_str(&format!("  raw image = {}\n", artifacts.raw_image.display()));
    out.push_str(&format!(
        "  painted image = {}\n",
        artifacts.painted_image.display()
    ));
    out.push_str(&format!("  vertices = {}", ring.len()));
    if let Some(first) = ring.first() {
        out.push_str(&format!("\n  first vertex = {:.6}, {:.6}", first.lat, first.lon));
    }
    Ok(out)
}

fn run_show(args: ShowArgs, config: &Config) -> Result<()> {
    let store = ResultStore::new(&config.inference.output_dir);
    println!("{}", describe_candidate(&store, &args.id)?);
    Ok(())
}

fn report_decision(id: &str, partition: Partition, moved: &ArtifactPaths) {
    let dir = moved
        .geometry
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match partition {
        Partition::Keep => println!("{} {id} -> {dir}", "Kept".green()),
        Partition::Discard => println!("{} {id} -> {dir}", "Discarded".yellow()),
    }
}

fn run_decide(args: DecideArgs, partition: Partition, config: &Config) -> Result<()> {
    let engine = TriageEngine::new(ResultStore::new(&config.inference.output_dir));
    let mut failed = 0;
    for id in &args.ids {
        match engine.decide(id, partition) {
            Ok(moved) => report_decision(id, partition, &moved),
            Err(e) => {
                eprintln!("{} {e}", "Error:".red());
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} candidates were not moved", args.ids.len());
    }
    Ok(())
}

/// `None` for candidates the detector matched to existing map data.
fn review_description(store: &ResultStore, id: &str) -> Result<Option<String>> {
    if store.provenance(id)? == Provenance::Existing {
        return Ok(None);
    }
    describe_candidate(store, id).map(Some)
}

fn run_review(config: &Config) -> Result<()> {
    let store = ResultStore::new(&config.inference.output_dir);
    let engine = TriageEngine::new(store.clone());
    let queue = sorted_ids(&store, Which::Pending)?;
    if queue.is_empty() {
        println!("{}", "Nothing to review.".yellow());
        return Ok(());
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let (mut kept, mut discarded, mut unreadable) = (0, 0, 0);

    'queue: for id in &queue {
        // The directory may have changed since the queue was built.
        if store.state(id).ok() != Some(TriageState::Pending) {
            continue;
        }
        let description = match review_description(&store, id) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{} {e:#}", "Skipping:".red());
                unreadable += 1;
                continue;
            }
        };
        println!("{description}");

        loop {
            print!("[k]eep, [d]iscard, [s]kip, [q]uit? ");
            stdout().flush()?;
            let Some(line) = lines.next() else {
                println!();
                break 'queue;
            };
            let partition = match line?.trim() {
                "k" | "keep" => Partition::Keep,
                "d" | "discard" => Partition::Discard,
                "s" | "skip" => break,
                "q" | "quit" => break 'queue,
                _ => continue,
            };
            match engine.decide(id, partition) {
                Ok(moved) => {
                    report_decision(id, partition, &moved);
                    match partition {
                        Partition::Keep => kept += 1,
                        Partition::Discard => discarded += 1,
                    }
                }
                Err(e) => eprintln!("{} {e}", "Error:".red()),
            }
            break;
        }
    }

    let remaining = store.list_pending()?.count();
    println!("Kept {kept}, discarded {discarded}, {remaining} still pending.");
    if unreadable > 0 {
        println!("{unreadable} candidates could not be read; fix or discard them by id.");
    }
    if kept > 0 {
        println!("Next: osm-triage export");
    }
    Ok(())
}

fn run_export(args: ExportArgs, config: &Config) -> Result<()> {
    let tags = if args.tags.is_empty() {
        TagSet::from_map(&config.export.tags)?
    } else {
        TagSet::parse(&args.tags)?
    };
    let store = ResultStore::new(&config.inference.output_dir);
    let batch = export::collect_kept(&store, &tags)?;
    let document = export::export(&batch)
        .context("keep at least one candidate before exporting")?;

    if args.stdout {
        print!("{}", document.body);
        return Ok(());
    }
    let path = args
        .output
        .unwrap_or_else(|| config.inference.output_dir.join(&config.export.file_name));
    document.write_to(&path)?;
    println!(
        "Wrote {} features tagged {} to {} ({})",
        document.feature_count,
        tags,
        path.display(),
        document.mime_type()
    );
    Ok(())
}

fn run_config(args: ConfigArgs, cli_path: Option<PathBuf>, config: &Config) -> Result<()> {
    if args.init {
        let path = cli_path
            .or_else(Config::config_file_path)
            .ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            println!("{} already exists", path.display());
        } else {
            Config::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
        return Ok(());
    }
    print!("{}", config.redacted().to_toml()?);
    Ok(())
}

fn dispatch(cli: Cli) -> Result<()> {
    let Some(command) = cli.command.as_ref() else {
        return Ok(());
    };
    // `config --init` must work before a config file exists.
    if let Commands::Config(args) = command
        && args.init
    {
        return run_config(args.clone(), cli.config.clone(), &Config::default());
    }
    let config = load_config(&cli)?;
    match cli.command {
        Some(Commands::Run(args)) => run_inference(args, config),
        Some(Commands::List(args)) => run_list(args, &config),
        Some(Commands::Show(args)) => run_show(args, &config),
        Some(Commands::Keep(args)) => run_decide(args, Partition::Keep, &config),
        Some(Commands::Discard(args)) => run_decide(args, Partition::Discard, &config),
        Some(Commands::Review) => run_review(&config),
        Some(Commands::Export(args)) => run_export(args, &config),
        Some(Commands::Config(args)) => run_config(args, cli.config.clone(), &config),
        None => Ok(()),
    }
}

fn main() {
    let color = detect_color_choice();
    let matches = Cli::command().color(color).get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    if matches!(color, ColorChoice::Never) || !stdout().is_terminal() {
        colored::control::set_override(false);
    }
    init_logging(cli.verbose);

    if let Err(err) = dispatch(cli) {
        eprintln!("{} {err:#}", "Error:".red());
        std::process::exit(if is_user_error(&err) { 2 } else { 1 });
    }
}
