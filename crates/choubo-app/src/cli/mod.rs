use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "choubo",
    version,
    author,
    about = "Choubo accounting document pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the queue workers until interrupted.
    Worker(WorkerArgs),
    /// Store a file as a new document, optionally queueing it for parsing.
    Ingest(IngestArgs),
    /// Re-queue a document that ended in the error state.
    Retry(RetryArgs),
    /// Confirm a journal draft into a ledger entry.
    Confirm(ConfirmArgs),
    /// Show queue depths and dead-lettered jobs.
    Jobs(JobsArgs),
    /// Seed a tenant's chart of accounts from a JSON file.
    SeedAccounts(SeedAccountsArgs),
}

#[derive(Debug, Args)]
pub struct WorkerArgs;

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Tenant the document belongs to.
    #[arg(long)]
    pub tenant: String,
    /// File to ingest.
    pub file: PathBuf,
    /// MIME type of the file (inferred from the extension when omitted).
    #[arg(long)]
    pub mime_type: Option<String>,
    /// Queue the document for parsing immediately.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub parse: bool,
}

#[derive(Debug, Args)]
pub struct RetryArgs {
    #[arg(long)]
    pub tenant: String,
    /// Document id to retry.
    pub document_id: String,
}

#[derive(Debug, Args)]
pub struct ConfirmArgs {
    #[arg(long)]
    pub tenant: String,
    /// Journal draft id to confirm.
    pub draft_id: String,
    /// Candidate to confirm (0-based).
    #[arg(long, default_value_t = 0)]
    pub index: usize,
    /// User recorded as the confirmer.
    #[arg(long)]
    pub user: String,
    /// JSON file with override lines replacing the selected candidate's.
    #[arg(long, value_name = "FILE")]
    pub lines: Option<PathBuf>,
    /// Replacement entry description.
    #[arg(long)]
    pub description: Option<String>,
    /// Reason recorded alongside an override.
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Also list dead-lettered jobs.
    #[arg(long, default_value_t = false)]
    pub failed: bool,
}

#[derive(Debug, Args)]
pub struct SeedAccountsArgs {
    #[arg(long)]
    pub tenant: String,
    /// JSON file: array of {code, name, category, is_active?}.
    pub file: PathBuf,
}
