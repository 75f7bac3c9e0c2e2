use std::io::{self, Write};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use omicbank::cache::PersistedLayout;
use omicbank::config::ConfigLoader;
use omicbank::datasets;
use omicbank::error::OmicError;
use omicbank::fetch::HttpTransport;
use omicbank::loader::{DatasetSpec, LoadOptions, Workspace, load_dataset};

#[derive(Parser)]
#[command(name = "omicbank")]
#[command(about = "Reproducible multi-omic single-cell dataset manager")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a dataset and build its verified local form")]
    Fetch(FetchArgs),
    #[command(about = "Show the persisted form of a dataset")]
    Info(InfoArgs),
    #[command(about = "List known datasets")]
    List,
    #[command(about = "Clear downloaded archives and persisted datasets")]
    Clear,
}

#[derive(Args)]
struct FetchArgs {
    /// Dataset name from the built-in registry or the config file.
    dataset: String,

    /// Path to an omicbank.json with custom dataset definitions.
    #[arg(long)]
    config: Option<String>,

    /// Delete any persisted form and rebuild from the raw archives.
    #[arg(long = "override")]
    override_cache: bool,
}

#[derive(Args)]
struct InfoArgs {
    dataset: String,
}

#[derive(Serialize)]
struct FetchReport {
    dataset: String,
    cells: usize,
    layers: Vec<LayerReport>,
    path: String,
}

#[derive(Serialize)]
struct LayerReport {
    name: String,
    features: usize,
    sparsity: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch(args) => fetch(args),
        Commands::Info(args) => info(args),
        Commands::List => list(),
        Commands::Clear => clear(),
    }
}

fn resolve_spec(name: &str, config: Option<&str>) -> Result<DatasetSpec, OmicError> {
    if let Some(path) = config {
        let resolved = ConfigLoader::resolve(Some(path))?;
        if let Some(spec) = resolved.dataset(name) {
            return Ok(spec.clone());
        }
    }
    datasets::lookup(name)
}

fn fetch(args: FetchArgs) -> miette::Result<()> {
    let spec = resolve_spec(&args.dataset, args.config.as_deref()).into_diagnostic()?;
    let workspace = Workspace::new().into_diagnostic()?;
    let transport = HttpTransport::new().into_diagnostic()?;
    let options = LoadOptions {
        override_cache: args.override_cache,
    };
    let store = load_dataset(&transport, &workspace, &spec, &options).into_diagnostic()?;

    let mut layers = Vec::new();
    for name in store.layer_names().map(str::to_string).collect::<Vec<_>>() {
        layers.push(LayerReport {
            features: store.layer(&name).into_diagnostic()?.n_features(),
            sparsity: store.sparsity(&name).into_diagnostic()?,
            name,
        });
    }
    print_json(&FetchReport {
        dataset: spec.name.clone(),
        cells: store.n_samples(),
        layers,
        path: workspace.dataset_dir(&spec.name).to_string(),
    })
    .into_diagnostic()
}

fn info(args: InfoArgs) -> miette::Result<()> {
    let workspace = Workspace::new().into_diagnostic()?;
    let layout = PersistedLayout::new(workspace.dataset_dir(&args.dataset));
    if !layout.exists() {
        return Err(OmicError::UnknownDataset(format!(
            "{} (not fetched yet)",
            args.dataset
        )))
        .into_diagnostic();
    }
    let manifest = layout.verify().into_diagnostic()?;
    print_json(&manifest).into_diagnostic()
}

fn list() -> miette::Result<()> {
    print_json(&datasets::names()).into_diagnostic()
}

fn clear() -> miette::Result<()> {
    let workspace = Workspace::new().into_diagnostic()?;
    workspace.clear().into_diagnostic()
}

fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let mut stdout = io::stdout();
    stdout.write_all(json.as_bytes())?;
    stdout.write_all(b"\n")?;
    Ok(())
}
