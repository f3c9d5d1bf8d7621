//! Ops CLI for dataset bootstrap (§6). Not part of the lookup runtime's
//! public API — this is the tool an operator or deploy hook runs before
//! a [`cadis_runtime::CadisRuntime`] can be constructed for a country.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use cadis_runtime::bootstrap::{bootstrap_country_dataset, DEFAULT_REQUIRED_FILES};
use cadis_runtime::policy::load_runtime_policy;
use cadis_runtime::ENGINE_VERSION;

#[derive(Parser, Debug)]
#[command(name = "cadis-bootstrap", version, about, propagate_version = true)]
struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, verify, and cache one country's dataset.
    Bootstrap(BootstrapArgs),
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// ISO2 country code, e.g. JP, FR.
    #[arg(long, env = "CADIS_COUNTRY_ISO2")]
    country: String,

    /// Index-manifest URL routing countries to release manifests.
    #[arg(long, env = "CADIS_DATASET_MANIFEST_URL")]
    manifest_url: String,

    /// Dataset id as registered in the index manifest's country entry.
    /// Defaults to `<iso2-lowercase>.admin`.
    #[arg(long)]
    dataset_id: Option<String>,

    /// Pin to an exact dataset_version instead of resolving "latest".
    #[arg(long, env = "CADIS_DATASET_VERSION")]
    dataset_version: Option<String>,

    /// Always re-check the router for a newer release when not pinned.
    /// Also honors the `UPDATE_TO_LATEST` environment variable (any of
    /// "1"/"true"/"TRUE"), since clap's flag actions don't parse env values.
    #[arg(long)]
    update_to_latest: bool,

    /// Local cache root.
    #[arg(long, env = "CADIS_CACHE_DIR", default_value = "./cadis-cache")]
    cache_dir: PathBuf,

    /// Where to write the resulting bootstrap state as JSON. Prints to
    /// stdout when omitted.
    #[arg(long, env = "CADIS_BOOTSTRAP_STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Per-HTTP-call timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_sec: u64,
}

fn validate_dataset_dir(dir: &std::path::Path) -> anyhow::Result<()> {
    load_runtime_policy(dir)?;
    Ok(())
}

fn bootstrap(cli: &Cli, args: &BootstrapArgs) -> Result<()> {
    let country = args.country.trim().to_uppercase();
    let dataset_id = args
        .dataset_id
        .clone()
        .unwrap_or_else(|| format!("{}.admin", country.to_lowercase()));
    let update_to_latest = args.update_to_latest
        || matches!(std::env::var("UPDATE_TO_LATEST").ok().as_deref(), Some("1") | Some("true") | Some("TRUE"));

    if cli.verbose > 0 {
        eprintln!("[bootstrap] country={country} dataset_id={dataset_id}");
        eprintln!("[bootstrap] manifest_url={}", args.manifest_url);
        eprintln!("[bootstrap] cache_dir={}", args.cache_dir.display());
    }

    let state = bootstrap_country_dataset(
        &args.manifest_url,
        &country,
        &dataset_id,
        args.dataset_version.as_deref(),
        update_to_latest,
        ENGINE_VERSION,
        &validate_dataset_dir,
        &args.cache_dir,
        DEFAULT_REQUIRED_FILES,
        args.timeout_sec,
    )?;

    if cli.verbose > 0 {
        eprintln!(
            "[bootstrap] dataset_version={} used_cached_dataset={} dir={}",
            state.dataset_version,
            state.used_cached_dataset,
            state.dataset_dir.display()
        );
    }

    let state_json = serde_json::to_string_pretty(&state)?;
    match &args.state_path {
        Some(path) => std::fs::write(path, state_json)?,
        None => println!("{state_json}"),
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Bootstrap(args) => bootstrap(&cli, args),
    }
}
