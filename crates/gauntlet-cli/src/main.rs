use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ulid::Ulid;

use gauntlet_agents::{build_eval_graph, EvalContext};
use gauntlet_archive::{RunArchive, SqliteRunArchive};
use gauntlet_domain::{EvalRecord, RunId};
use gauntlet_executor::{Executor, ExecutorConfig};
use gauntlet_provider::{HttpLlmConfig, LlmConfig};

#[derive(Debug, Parser)]
#[command(name = "gauntlet")]
#[command(about = "Runs startup briefs through a gated multi-agent evaluation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    Runs(RunsArgs),
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// LLM backend: "mock" or "http".
    #[arg(long, default_value = "mock")]
    llm: String,
    /// Chat-completions endpoint, required with --llm http.
    #[arg(long)]
    llm_url: Option<String>,
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,
    /// Environment variable holding the bearer token for --llm http.
    #[arg(long)]
    auth_bearer_env: Option<String>,
    /// JSON file with a pre-written brief; skips the generator.
    #[arg(long)]
    brief: Option<PathBuf>,
    /// Archive the finished run into this SQLite database.
    #[arg(long)]
    archive_db: Option<PathBuf>,
    /// Run the specialists one at a time instead of concurrently.
    #[arg(long, default_value_t = false)]
    sequential: bool,
}

#[derive(Debug, Args)]
struct RunsArgs {
    #[arg(long)]
    archive_db: PathBuf,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    archive_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Runs(args) => runs_command(&args),
        Commands::Show(args) => show_command(&args),
    }
}

fn run_command(args: &RunArgs) -> Result<()> {
    let llm_config = match args.llm.as_str() {
        "mock" => LlmConfig::Mock,
        "http" => {
            let url = args
                .llm_url
                .clone()
                .ok_or_else(|| anyhow!("--llm-url is required with --llm http"))?;
            let mut config = HttpLlmConfig::new(url, args.model.clone());
            config.auth_bearer_env = args.auth_bearer_env.clone();
            LlmConfig::HttpJson(config)
        }
        other => return Err(anyhow!("unknown llm backend: {other}")),
    };

    let ctx = EvalContext::new(llm_config.build());
    let graph = build_eval_graph(&ctx)?;

    let mut record = EvalRecord::new(RunId::new());
    if let Some(path) = &args.brief {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read brief file {}", path.display()))?;
        record.brief =
            Some(serde_json::from_str(&raw).context("brief file was not valid JSON")?);
    }

    let executor = Executor::new(ExecutorConfig {
        parallel: !args.sequential,
        ..ExecutorConfig::default()
    });
    let record = executor.invoke(&graph, record)?;

    let decision = record
        .final_decision
        .ok_or_else(|| anyhow!("run ended without a final decision"))?;

    if let Some(path) = &args.archive_db {
        let archive = SqliteRunArchive::open(path)?;
        archive.migrate()?;
        archive.persist(&record)?;
    }

    println!("run_id={} final_decision={}", record.run_id, decision.as_str());
    Ok(())
}

fn runs_command(args: &RunsArgs) -> Result<()> {
    let archive = SqliteRunArchive::open(&args.archive_db)?;
    for run in archive.list_runs()? {
        println!("{}", serde_json::to_string(&run)?);
    }
    Ok(())
}

fn show_command(args: &ShowArgs) -> Result<()> {
    let archive = SqliteRunArchive::open(&args.archive_db)?;
    let run_id = parse_run_id(&args.run_id)?;
    let run = archive
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("run_id {run_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}
