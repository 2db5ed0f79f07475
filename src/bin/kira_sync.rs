use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kira_sync::batch::{BatchRunner, TransferRequest, TransferStatus};
use kira_sync::config::{ConfigLoader, ResolvedConfig};
use kira_sync::download::FileDownloader;
use kira_sync::error::KiraError;
use kira_sync::progress::{LogProgressFactory, ProgressFactory};
use kira_sync::remote::RemoteObject;
use kira_sync::resources::{DownloadOptions, ResultFolder};
use kira_sync::session::Session;
use kira_sync::upload::HttpPartUploader;

#[derive(Parser)]
#[command(name = "kira-sync")]
#[command(about = "Upload and download result files against a sample data server")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload files into a result folder, creating missing resources")]
    Upload(UploadArgs),
    #[command(about = "Download one result file")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct Location {
    #[arg(long)]
    org: String,

    #[arg(long)]
    project: String,

    /// Omit for a project-level result folder.
    #[arg(long)]
    sample: Option<String>,

    #[arg(long)]
    module: String,

    #[arg(long)]
    replicate: Option<String>,
}

#[derive(Args)]
struct UploadArgs {
    #[command(flatten)]
    location: Location,

    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, default_value_t = 1)]
    part_threads: usize,

    #[arg(long)]
    chunk_size: Option<u64>,
}

#[derive(Args)]
struct DownloadArgs {
    #[command(flatten)]
    location: Location,

    #[arg(long)]
    field: String,

    #[arg(long)]
    output: PathBuf,

    /// Only fetch the first N bytes.
    #[arg(long)]
    head: Option<u64>,

    #[arg(long)]
    no_cache: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::Request { .. } if error.is_not_found() => 2,
        KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::UnknownProfile(_)
        | KiraError::InvalidConfig(_) => 2,
        KiraError::Request { .. }
        | KiraError::Http(_)
        | KiraError::PartUpload { .. }
        | KiraError::IncompleteUpload(_)
        | KiraError::Download(_)
        | KiraError::Ftp(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref(), cli.profile.as_deref())?;
    let session = Session::from_config(&config)?;

    match cli.command {
        Commands::Upload(args) => run_upload(args, &config, &session),
        Commands::Download(args) => run_download(args, &config, &session),
    }
}

fn result_folder(session: &Session, location: &Location) -> ResultFolder {
    let project = session.organization(&location.org).project(&location.project);
    match (&location.sample, &location.replicate) {
        (Some(sample), Some(replicate)) => project
            .sample(sample)
            .result_folder_replicate(&location.module, replicate),
        (Some(sample), None) => project.sample(sample).result_folder(&location.module),
        (None, _) => project.result_folder(&location.module),
    }
}

fn run_upload(args: UploadArgs, config: &ResolvedConfig, session: &Session) -> miette::Result<()> {
    let mut folder = result_folder(session, &args.location);
    folder.idempotent_upsert()?;

    let mut transfer = config.transfer.with_threads(args.part_threads);
    if let Some(chunk_size) = args.chunk_size {
        transfer = transfer.with_chunk_size(chunk_size);
    }
    let parts = HttpPartUploader::new(config.request_timeout)?;
    let downloader = FileDownloader::new(config.request_timeout)?;
    let progress = LogProgressFactory;
    let runner = BatchRunner::new(args.workers, transfer, &parts, &downloader, &progress);

    let requests = args
        .files
        .into_iter()
        .map(|source| {
            let name = source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| KiraError::Filesystem(format!("not a file: {}", source.display())))?;
            Ok(TransferRequest::Upload {
                file: folder.result_file(name),
                source,
            })
        })
        .collect::<Result<Vec<_>, KiraError>>()?;

    let mut first_error = None;
    for outcome in runner.run(requests)? {
        match outcome.result {
            Ok(TransferStatus::Uploaded(receipt)) => {
                info!(file = %outcome.label, parts = receipt.parts.len(), md5 = %receipt.md5_checksum, "uploaded");
            }
            Ok(_) => {}
            Err(err) => {
                eprintln!("{}: {err}", outcome.label);
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_download(args: DownloadArgs, config: &ResolvedConfig, session: &Session) -> miette::Result<()> {
    let folder = result_folder(session, &args.location);
    let mut file = folder.result_file(&args.field);
    file.fetch()?;

    let downloader = FileDownloader::new(config.request_timeout)?;
    let options = DownloadOptions {
        target: Some(args.output),
        use_cache: !args.no_cache,
        head: args.head,
    };
    let progress = LogProgressFactory;
    let tracker = progress.tracker(&file.local_filename());
    let path = file.download(&downloader, &options, tracker.as_ref())?;
    println!("{}", path.display());
    Ok(())
}
