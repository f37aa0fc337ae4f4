//! CLI for bulk-downloading datasets from a Shanoir server.
//!
//! Datasets are fetched one by one, checked against reference metadata,
//! anonymized, compressed and encrypted, with every outcome tracked in TSV
//! tables so an interrupted campaign resumes where it stopped. Companion
//! subcommands organize downloads as a BIDS tree, convert DICOM trees to
//! NIfTI, and drive remote execution batches.
mod backoff;
mod bids;
mod client;
mod config;
mod converter;
mod execution;
mod pipeline;
mod runner;
mod state;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::client::ShanoirClient;
use crate::config::{
    load_anonymization_fields, load_runtime_config, parse_input_file, sanitize_optional_string,
    EffectiveConfig, RuntimeConfigFile, VerifiedLedger, DEFAULT_CONFIG_PATH,
};
use crate::converter::ConverterTools;
use crate::execution::ExecutionOptions;
use crate::pipeline::PipelineConfig;
use crate::runner::MaintenanceWindow;
use crate::state::StateStore;

#[derive(Parser)]
#[command(name = "shanoir_download_cli")]
#[command(about = "Shanoir Bulk Dataset Downloader", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resumable download + anonymize + encrypt flow
    Download(DownloadArgs),
    /// Download a study and organize it as a BIDS tree
    Bids(BidsArgs),
    /// Convert a tree of downloaded DICOM archives to NIfTI
    Convert(ConvertArgs),
    /// Submit and track remote execution batches
    Executions(ExecutionArgs),
}

#[derive(Args, Clone)]
struct SharedArgs {
    /// The Shanoir domain to query.
    #[arg(short, long)]
    domain: Option<String>,

    /// Your Shanoir username.
    #[arg(short, long)]
    username: Option<String>,

    /// Shanoir password (falls back to the SHANOIR_PASSWORD environment variable).
    #[arg(short, long)]
    password: Option<String>,

    /// Request timeout in seconds.
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Accept invalid TLS certificates (self-signed test servers).
    #[arg(long)]
    accept_invalid_certs: bool,
}

#[derive(Args, Clone)]
struct DownloadArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// CSV/TSV/JSON file listing the dataset ids to download.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// SolR search text used instead of an input file.
    #[arg(long)]
    search_text: Option<String>,

    /// Directory that receives the raw/ and processed/ trees.
    #[arg(short, long, value_name = "DIR")]
    output_folder: Option<PathBuf>,

    /// GPG recipient the final archives are encrypted to.
    #[arg(long)]
    gpg_recipient: Option<String>,

    /// Download and verify only, without anonymizing.
    #[arg(long)]
    skip_anonymization: bool,

    /// Skip the GPG encryption step.
    #[arg(long)]
    skip_encryption: bool,

    /// Keep extracted and anonymized intermediate files.
    #[arg(long)]
    keep_intermediate_files: bool,

    /// Give up on a dataset after this many failed attempts.
    #[arg(long)]
    max_tries: Option<u32>,

    /// TSV table of DICOM fields to blank during anonymization.
    #[arg(long)]
    anonymization_fields: Option<PathBuf>,

    /// TSV of already-accepted metadata mismatches.
    #[arg(long)]
    verified_datasets: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct BidsArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// JSON project configuration (study name, subjects, data_to_bids).
    #[arg(short = 'j', long)]
    json_file: PathBuf,

    /// Download directory; a timestamped one is created when omitted.
    #[arg(short = 'o', long, value_name = "DIR")]
    download_dir: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct ConvertArgs {
    /// Root of the folder tree containing the downloaded DICOM archives.
    #[arg(short = 'i', long, value_name = "DIR")]
    dicoms: PathBuf,

    /// Path of the dcm2niix binary.
    #[arg(long)]
    dcm2niix: Option<String>,

    /// Path of the mcverter binary.
    #[arg(long)]
    mcverter: Option<String>,
}

#[derive(Args, Clone)]
struct ExecutionArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// JSON template of the execution to create for each batch.
    #[arg(short = 'e', long)]
    execution_json: PathBuf,

    /// JSON file of dataset-id batches.
    #[arg(long)]
    dataset_ids: PathBuf,

    /// Directory where the done/failed execution tables are kept.
    #[arg(short, long, value_name = "DIR")]
    output_folder: PathBuf,

    /// Delay between two submissions, in milliseconds.
    #[arg(long)]
    delay: Option<u64>,
}

/// Entrypoint that wires CLI args, the runtime config, the Shanoir session,
/// and the selected flow.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Commands::Download(cmd) => run_download(cmd, &cfg_path).await,
        Commands::Bids(cmd) => run_bids(cmd, &cfg_path).await,
        Commands::Convert(cmd) => run_convert(cmd, &cfg_path).await,
        Commands::Executions(cmd) => run_executions(cmd, &cfg_path).await,
    }
}

/// Merge CLI overrides with a parsed runtime config, falling back to crate
/// defaults. CLI flags take precedence, followed by the runtime file, and
/// finally `EffectiveConfig::defaults()`.
fn merge_config(cli: &SharedArgs, file: Option<RuntimeConfigFile>) -> EffectiveConfig {
    let mut cfg = EffectiveConfig::defaults();
    let f = file.unwrap_or_default();

    cfg.domain = cli.domain.clone().or(f.domain).unwrap_or(cfg.domain);
    cfg.username = cli.username.clone().or(f.username).unwrap_or(cfg.username);
    cfg.password = sanitize_optional_string(cli.password.clone())
        .or(sanitize_optional_string(f.password));
    cfg.timeout_secs = cli.timeout.or(f.timeout_secs).unwrap_or(cfg.timeout_secs);
    cfg.accept_invalid_certs = cli.accept_invalid_certs
        || f.accept_invalid_certs.unwrap_or(cfg.accept_invalid_certs);
    cfg.output_folder = f.output_folder.unwrap_or(cfg.output_folder);
    cfg.gpg_recipient = sanitize_optional_string(f.gpg_recipient).or(cfg.gpg_recipient);
    cfg.skip_anonymization = f.skip_anonymization.unwrap_or(cfg.skip_anonymization);
    cfg.skip_encryption = f.skip_encryption.unwrap_or(cfg.skip_encryption);
    cfg.keep_intermediate_files = f
        .keep_intermediate_files
        .unwrap_or(cfg.keep_intermediate_files);
    cfg.max_tries = f.max_tries.unwrap_or(cfg.max_tries);
    cfg.unrecoverable_reasons = f
        .unrecoverable_reasons
        .unwrap_or(cfg.unrecoverable_reasons);
    cfg.skip_columns = f.skip_columns.unwrap_or(cfg.skip_columns);
    cfg.shutdown_hour = f.shutdown_hour.unwrap_or(cfg.shutdown_hour);
    cfg.available_hour = f.available_hour.unwrap_or(cfg.available_hour);
    cfg.page_size = f.page_size.unwrap_or(cfg.page_size);
    cfg.sevenzip_path = f.sevenzip_path.unwrap_or(cfg.sevenzip_path);
    cfg.gpg_path = f.gpg_path.unwrap_or(cfg.gpg_path);
    cfg.dcm2niix_path = f.dcm2niix_path.unwrap_or(cfg.dcm2niix_path);
    cfg.mcverter_path = f.mcverter_path.unwrap_or(cfg.mcverter_path);
    cfg.anonymization_fields = f.anonymization_fields.or(cfg.anonymization_fields);
    cfg.verified_datasets = f.verified_datasets.or(cfg.verified_datasets);
    cfg.missing_datasets = f.missing_datasets.or(cfg.missing_datasets);
    cfg.downloaded_datasets = f.downloaded_datasets.or(cfg.downloaded_datasets);

    cfg
}

fn build_client(effective: &EffectiveConfig) -> Result<ShanoirClient> {
    if effective.username.is_empty() {
        bail!("Please provide your Shanoir username with --username or the config file");
    }
    let password = effective
        .password
        .clone()
        .or_else(|| std::env::var("SHANOIR_PASSWORD").ok())
        .context("Provide a password via --password, the config file, or SHANOIR_PASSWORD")?;
    ShanoirClient::new(
        &effective.domain,
        &effective.username,
        &password,
        Duration::from_secs(effective.timeout_secs),
        effective.accept_invalid_certs,
    )
}

async fn run_download(args: DownloadArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let mut effective = merge_config(&args.shared, runtime_file);
    effective.gpg_recipient = sanitize_optional_string(args.gpg_recipient.clone())
        .or(effective.gpg_recipient);
    effective.skip_anonymization |= args.skip_anonymization;
    effective.skip_encryption |= args.skip_encryption;
    effective.keep_intermediate_files |= args.keep_intermediate_files;
    effective.max_tries = args.max_tries.unwrap_or(effective.max_tries);
    effective.anonymization_fields = args
        .anonymization_fields
        .clone()
        .or(effective.anonymization_fields);
    effective.verified_datasets = args
        .verified_datasets
        .clone()
        .or(effective.verified_datasets);
    if let Some(output) = &args.output_folder {
        effective.output_folder = output.clone();
    }
    if effective.output_folder.as_os_str().is_empty() {
        bail!("Please provide an output folder with --output-folder or the config file");
    }
    effective.validate()?;

    let client = build_client(&effective)?;
    let items = match (&args.input, &args.search_text) {
        (Some(input), _) => parse_input_file(input, &effective.skip_columns)
            .context("Failed to parse the input file")?,
        (None, Some(search_text)) => client.search(search_text, effective.page_size).await?,
        (None, None) => bail!("Provide a dataset list with --input or a --search-text"),
    };
    println!("{} datasets to download.", items.len());

    let raw_folder = effective.output_folder.join("raw");
    let processed_folder = effective.output_folder.join("processed");
    fs::create_dir_all(&raw_folder)?;
    fs::create_dir_all(&processed_folder)?;

    let missing_path = effective
        .missing_datasets
        .clone()
        .unwrap_or_else(|| effective.output_folder.join("missing_datasets.tsv"));
    let downloaded_path = effective
        .downloaded_datasets
        .clone()
        .unwrap_or_else(|| effective.output_folder.join("downloaded_datasets.tsv"));
    let mut store = StateStore::load(&missing_path, &downloaded_path, &raw_folder)?;

    let anonymization_fields = match (&effective.anonymization_fields, effective.skip_anonymization)
    {
        (Some(path), false) => load_anonymization_fields(path)
            .context("Failed to load the anonymization field table")?,
        _ => Vec::new(),
    };
    let verified_ledger = match &effective.verified_datasets {
        Some(path) => Some(VerifiedLedger::load(path)?),
        None => None,
    };

    let pipeline = PipelineConfig {
        raw_folder: &raw_folder,
        processed_folder: &processed_folder,
        anonymization_fields: &anonymization_fields,
        verified_ledger: verified_ledger.as_ref(),
        gpg_recipient: effective.gpg_recipient.as_deref(),
        skip_anonymization: effective.skip_anonymization,
        skip_encryption: effective.skip_encryption,
        keep_intermediate_files: effective.keep_intermediate_files,
        sevenzip_path: &effective.sevenzip_path,
        gpg_path: &effective.gpg_path,
    };
    let window = MaintenanceWindow::new(effective.shutdown_hour, effective.available_hour);

    runner::run_downloads(
        &client,
        &items,
        &mut store,
        &pipeline,
        effective.max_tries,
        &effective.unrecoverable_reasons,
        Some(&window),
    )
    .await
}

async fn run_bids(args: BidsArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, runtime_file);
    let client = build_client(&effective)?;

    let bids_config = bids::load_bids_config(&args.json_file)?;
    let download_dir = args.download_dir.clone().unwrap_or_else(|| {
        let stamp = chrono::Local::now().format("%Y_%m_%d__%Hh%Mm%Ss");
        PathBuf::from(format!("shanoir_2_bids_download_{stamp}"))
    });
    fs::create_dir_all(&download_dir)?;
    println!(
        "Downloading study {} to {}...",
        bids_config.study_name,
        download_dir.display()
    );

    bids::download_study(&client, &bids_config, &download_dir, effective.page_size).await
}

async fn run_convert(args: ConvertArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let f = runtime_file.unwrap_or_default();
    let defaults = EffectiveConfig::defaults();
    let tools = ConverterTools {
        dcm2niix: args
            .dcm2niix
            .as_deref()
            .or(f.dcm2niix_path.as_deref())
            .unwrap_or(&defaults.dcm2niix_path),
        mcverter: args
            .mcverter
            .as_deref()
            .or(f.mcverter_path.as_deref())
            .unwrap_or(&defaults.mcverter_path),
    };
    converter::convert_tree(&args.dicoms, &tools).await
}

async fn run_executions(args: ExecutionArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, runtime_file);
    let client = build_client(&effective)?;

    let template: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(&args.execution_json)
            .with_context(|| format!("Failed to read {}", args.execution_json.display()))?,
    )
    .context("Failed to parse the execution template")?;
    let batches = execution::load_batches(&args.dataset_ids)?;
    println!("{} execution batches loaded.", batches.len());

    fs::create_dir_all(&args.output_folder)?;
    let mut store = StateStore::load(
        &args.output_folder.join("failed_executions.tsv"),
        &args.output_folder.join("done_executions.tsv"),
        &args.output_folder.join("raw"),
    )?;

    let options = ExecutionOptions {
        delay: Duration::from_millis(args.delay.unwrap_or(10_000)),
        backoff: Backoff::default(),
        max_polls: 60,
        max_tries: effective.max_tries,
        unrecoverable_reasons: Vec::new(),
    };
    execution::run_executions(&client, &template, &batches, &mut store, &options).await
}
