use crate::domain::{Direction, MovementState, Source};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "conciliar")]
#[command(about = "Bank-to-ledger reconciliation matching", long_about = None)]
pub struct Cli {
    /// Override Conciliar home directory (config/data subdirs will be created inside it).
    #[arg(long, env = "CONCILIAR_HOME")]
    pub home: Option<PathBuf>,

    /// Log at debug level, ignoring CONCILIAR_LOG and the configured level.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Job(JobArgs),
    Movement(MovementArgs),
    Reconcile(ReconcileArgs),
    Match(MatchArgs),
    Group(GroupArgs),
    /// Rank counterpart candidates for one movement by description similarity.
    Suggest(SuggestArgs),
    Ws(WsArgs),
}

#[derive(Debug, Subcommand)]
pub enum JobCmd {
    Create {
        #[arg(long)]
        name: String,
        /// Bank account the job covers.
        #[arg(long)]
        account: Option<String>,
        /// Accounting period, e.g. 2024-11.
        #[arg(long)]
        period: Option<String>,
    },
    List,
    Show {
        id: i64,
    },
    /// Close the job even if movements are still pending.
    Finalize {
        id: i64,
    },
    Reopen {
        id: i64,
    },
}

#[derive(Debug, Args)]
pub struct JobArgs {
    #[command(subcommand)]
    pub cmd: JobCmd,
}

#[derive(Debug, Subcommand)]
pub enum MovementCmd {
    Add {
        #[arg(long)]
        job: i64,
        #[arg(long, value_enum)]
        source: Source,
        #[arg(long, value_enum)]
        direction: Direction,
        /// Date as it appears in the ledger (YYYY-MM-DD, DD/MM/YYYY, ...).
        #[arg(long)]
        date: String,
        /// Amount; the sign is dropped, direction carries it.
        #[arg(long, allow_hyphen_values = true)]
        value: String,
        #[arg(long, short = 'm')]
        description: Option<String>,
    },
    /// Load a JSON array of {date, description, value, source, direction} rows.
    Import {
        #[arg(long)]
        job: i64,
        file: PathBuf,
    },
    List {
        #[arg(long)]
        job: i64,
        #[arg(long, value_enum)]
        source: Option<Source>,
        #[arg(long, value_enum)]
        state: Option<MovementState>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Debug, Args)]
pub struct MovementArgs {
    #[command(subcommand)]
    pub cmd: MovementCmd,
}

#[derive(Debug, Subcommand)]
pub enum ReconcileCmd {
    /// Run the exact and approximate passes over every unreconciled movement.
    Run {
        job: i64,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Reconcile arbitrary bank and auxiliary movements together.
    Manual {
        job: i64,
        #[arg(long = "bank", num_args = 1..)]
        bank: Vec<i64>,
        #[arg(long = "aux", num_args = 1..)]
        aux: Vec<i64>,
    },
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[command(subcommand)]
    pub cmd: ReconcileCmd,
}

#[derive(Debug, Subcommand)]
pub enum MatchCmd {
    List { job: i64 },
    Delete { id: i64 },
}

#[derive(Debug, Args)]
pub struct MatchArgs {
    #[command(subcommand)]
    pub cmd: MatchCmd,
}

#[derive(Debug, Subcommand)]
pub enum GroupCmd {
    List { job: i64 },
    Delete { id: i64 },
}

#[derive(Debug, Args)]
pub struct GroupArgs {
    #[command(subcommand)]
    pub cmd: GroupCmd,
}

#[derive(Debug, Args)]
pub struct SuggestArgs {
    pub movement_id: i64,

    /// Defaults to `similarity_limit` from the config.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum WsCmd {
    Check,
    Add { name: String },
    Checkout { name: String },
}

#[derive(Debug, Args)]
pub struct WsArgs {
    #[command(subcommand)]
    pub cmd: WsCmd,
}
