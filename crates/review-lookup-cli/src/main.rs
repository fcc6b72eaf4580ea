use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use review_lookup_api::{load_catalog, ReviewLookupApi, SubmitReviewRequest};
use review_lookup_core::{IdentityObscurer, ReviewResponses, SearchParams, Submitter};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "review_lookup=warn";

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Review Lookup CLI")]
struct Cli {
    #[arg(long, env = "REVIEW_LOOKUP_DB", default_value = "./review_lookup.sqlite3")]
    db: PathBuf,

    /// Secret mixed into obscured review ids.
    #[arg(long, env = "REVIEW_LOOKUP_ID_SALT", hide_env_values = true)]
    id_salt: Option<String>,

    /// Catalog JSON to validate submissions against. Defaults to the bundled catalog.
    #[arg(long, env = "REVIEW_LOOKUP_CATALOG")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Review {
        #[command(subcommand)]
        command: ReviewCommand,
    },
    Search(SearchArgs),
    Tutors(TutorsArgs),
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Subjects,
    Questions,
    Colleges,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ReviewCommand {
    Add(ReviewAddArgs),
    List,
}

#[derive(Debug, Args)]
struct ReviewAddArgs {
    /// JSON file holding the review responses.
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    submitter: String,
    #[arg(long)]
    college: Option<String>,
    #[arg(long, default_value_t = false)]
    profile_incomplete: bool,
    #[arg(long)]
    submitted_at: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    tutor: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long = "paper")]
    papers: Vec<String>,
    #[arg(long = "college")]
    colleges: Vec<String>,
    /// Reference time for recency, RFC3339 UTC. Defaults to now.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
struct TutorsArgs {
    #[arg(long, default_value = "")]
    search: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let obscurer = match cli.id_salt {
        Some(salt) => IdentityObscurer::new(salt),
        None => {
            tracing::warn!("REVIEW_LOOKUP_ID_SALT is not set; obscured ids use an empty salt");
            IdentityObscurer::default()
        }
    };
    let catalog = load_catalog(cli.catalog.as_deref())?;
    let api = ReviewLookupApi::new(cli.db, obscurer, catalog);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Review { command } => run_review(command, &api),
        Command::Search(args) => run_search(args, &api),
        Command::Tutors(args) => {
            let tutors = api.tutors(&args.search)?;
            emit_json(serde_json::json!({ "tutors": tutors }))
        }
        Command::Catalog { command } => {
            let catalog = api.catalog();
            match command {
                CatalogCommand::Subjects => {
                    emit_json(serde_json::json!({ "subjects": catalog.subjects }))
                }
                CatalogCommand::Questions => {
                    emit_json(serde_json::json!({ "questions": catalog.questions }))
                }
                CatalogCommand::Colleges => {
                    emit_json(serde_json::json!({ "colleges": catalog.colleges }))
                }
            }
        }
    }
}

fn run_db(command: DbCommand, api: &ReviewLookupApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migration")?)
        }
    }
}

fn run_review(command: ReviewCommand, api: &ReviewLookupApi) -> Result<()> {
    match command {
        ReviewCommand::Add(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let responses: ReviewResponses = serde_json::from_str(&body)
                .with_context(|| format!("invalid review responses in {}", args.file.display()))?;
            let submitted_at = args.submitted_at.as_deref().map(parse_rfc3339).transpose()?;

            let result = api.submit_review(SubmitReviewRequest {
                submitter: Submitter {
                    user_id: args.submitter,
                    college: args.college,
                    profile_complete: !args.profile_incomplete,
                },
                responses,
                submitted_at,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize review")?)
        }
        ReviewCommand::List => {
            let reviews = api.list_reviews()?;
            emit_json(serde_json::json!({ "reviews": reviews }))
        }
    }
}

fn run_search(args: SearchArgs, api: &ReviewLookupApi) -> Result<()> {
    let now = args.now.as_deref().map(parse_rfc3339).transpose()?;
    let params = SearchParams {
        tutor: args.tutor,
        subject: args.subject,
        paper: Some(args.papers).filter(|papers| !papers.is_empty()),
        college: Some(args.colleges).filter(|colleges| !colleges.is_empty()),
    };
    let results = api.search(params, now)?;
    emit_json(serde_json::to_value(&results).context("failed to serialize search results")?)
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
