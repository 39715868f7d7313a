use std::path::Path;
use std::process;

use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, fmt};

use choubo_app::actions::{self, ConfirmRequest};
use choubo_app::cli::{Cli, Commands, ConfirmArgs, IngestArgs, JobsArgs, RetryArgs, SeedAccountsArgs};
use choubo_app::config;
use choubo_app::context::{AppContext, build_app_context};
use choubo_app::error::AppError;
use choubo_app::model::{Account, CandidateLine};
use choubo_app::queue::{JobStatus, QueueName};
use choubo_app::worker;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command else {
        Cli::print_help();
        return Ok(());
    };

    let config = config::load()?;
    let ctx = build_app_context(config)?;

    match command {
        Commands::Worker(_) => worker::run(ctx).await?,
        Commands::Ingest(args) => run_ingest(&ctx, args).await?,
        Commands::Retry(args) => run_retry(&ctx, args)?,
        Commands::Confirm(args) => run_confirm(&ctx, args)?,
        Commands::Jobs(args) => run_jobs(&ctx, args)?,
        Commands::SeedAccounts(args) => run_seed_accounts(&ctx, args)?,
    }
    Ok(())
}

async fn run_ingest(ctx: &AppContext, args: IngestArgs) -> Result<(), AppError> {
    let bytes = std::fs::read(&args.file).map_err(|source| AppError::Io {
        path: args.file.clone(),
        source,
    })?;
    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| AppError::InvalidInput("input path has no file name".to_string()))?;
    let mime_type = args
        .mime_type
        .unwrap_or_else(|| infer_mime_type(&args.file).to_string());

    let document = actions::ingest_document(
        ctx,
        &args.tenant,
        &file_name,
        &mime_type,
        &bytes,
        args.parse,
    )
    .await?;
    println!(
        "ingested document {} ({}, status: {})",
        document.id,
        document.file_name,
        document.status.as_ref()
    );
    Ok(())
}

fn run_retry(ctx: &AppContext, args: RetryArgs) -> Result<(), AppError> {
    let job = actions::retry_document(ctx, &args.tenant, &args.document_id)?;
    println!("requeued document {} as job {}", args.document_id, job.job_id);
    Ok(())
}

fn run_confirm(ctx: &AppContext, args: ConfirmArgs) -> Result<(), AppError> {
    let final_lines: Option<Vec<CandidateLine>> = match &args.lines {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| AppError::Io {
                path: path.clone(),
                source,
            })?;
            Some(serde_json::from_str(&raw)?)
        }
        None => None,
    };

    let entry = actions::confirm_draft(
        ctx,
        &args.tenant,
        &args.draft_id,
        &args.user,
        ConfirmRequest {
            selected_index: args.index,
            final_lines,
            final_description: args.description,
            override_reason: args.reason,
        },
    )?;
    println!(
        "confirmed draft {} as entry {} ({} on {})",
        args.draft_id, entry.id, entry.total_amount, entry.entry_date
    );
    Ok(())
}

fn run_jobs(ctx: &AppContext, args: JobsArgs) -> Result<(), AppError> {
    for queue in [QueueName::Heavy, QueueName::Light] {
        let counts = ctx.queue.counts(queue)?;
        println!(
            "{}: pending={} active={} completed={} failed={}",
            queue.as_ref(),
            counts.pending,
            counts.active,
            counts.completed,
            counts.failed
        );
    }
    if args.failed {
        for job in ctx.queue.list_by_status(JobStatus::Failed, 100)? {
            println!(
                "failed {} (document {}, attempts {}): {}",
                job.job_id,
                job.document_id,
                job.attempt_count,
                job.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AccountSeed {
    code: String,
    name: String,
    category: String,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

fn run_seed_accounts(ctx: &AppContext, args: SeedAccountsArgs) -> Result<(), AppError> {
    let raw = std::fs::read_to_string(&args.file).map_err(|source| AppError::Io {
        path: args.file.clone(),
        source,
    })?;
    let seeds: Vec<AccountSeed> = serde_json::from_str(&raw)?;
    let count = seeds.len();
    for seed in seeds {
        ctx.store.upsert_account(&Account {
            tenant_id: args.tenant.clone(),
            code: seed.code,
            name: seed.name,
            category: seed.category,
            is_active: seed.is_active,
        })?;
    }
    println!("seeded {count} accounts for tenant {}", args.tenant);
    Ok(())
}

fn infer_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("csv") => "text/csv",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}
