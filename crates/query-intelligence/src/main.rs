// query-intelligence/crates/query-intelligence/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand, ValueEnum};
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use tokio::io::{AsyncBufReadExt, BufReader};
#[cfg(feature = "cli")]
use query_intelligence::{
    config::Config, maintenance, metrics, query_engine::Question, telemetry, QueryOrchestrator,
};

#[cfg(feature = "cli")]
const SMOKE_QUESTIONS: &[&str] = &[
    "How many teachers are there?",
    "How many students are enrolled?",
    "List all departments",
    "Show me the subjects taught",
    "Hello, what can you do?",
    "How do I apply for leave?",
];

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "query-intelligence", version, about = "Ask questions about your institution's data")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Answer one question
    Ask {
        question: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        no_cache: bool,
        /// Print the full answer record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the knowledge index from the data source schema
    Index,
    /// Print usage statistics
    Stats {
        #[arg(long)]
        prometheus: bool,
    },
    /// Delete cached answers and/or chat history
    Clear {
        #[arg(long = "type", value_enum, default_value = "cache")]
        target: ClearTarget,
        /// Only delete records older than this many days
        #[arg(long)]
        days: Option<u32>,
    },
    /// Apply cache retention once and tidy the database
    Sweep,
    /// Run a fixed set of sample questions
    Smoke,
    /// Answer questions read from stdin, one per line, sweeping the cache in the background
    Chat {
        #[arg(long, default_value = "chat")]
        session: String,
    },
}

#[cfg(feature = "cli")]
#[derive(Clone, Copy, ValueEnum)]
enum ClearTarget {
    Cache,
    History,
    All,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    telemetry::init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    cfg.print_config();
    let orchestrator = QueryOrchestrator::from_config(&cfg).await?;

    match cli.command {
        Command::Ask {
            question,
            session,
            user,
            role,
            no_cache,
            json,
        } => {
            let mut question = Question::new(question);
            if let Some(session) = session {
                question = question.with_session(session);
            }
            if let Some(user) = user {
                question = question.with_requester(user, role.as_deref());
            }
            let answer = orchestrator.answer(question, !no_cache).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.answer);
                println!(
                    "\n[success={} cached={} tokens={} time={:.2}s]",
                    answer.success, answer.cached, answer.tokens_used, answer.response_time_seconds
                );
            }
        }
        Command::Index => {
            let count = orchestrator.reindex().await?;
            println!("Indexed {} knowledge documents", count);
        }
        Command::Stats { prometheus } => {
            if prometheus {
                print!("{}", metrics::render_metrics()?);
            } else {
                let db = orchestrator.database().clone();
                let stats = db.run_blocking(|db| db.get_stats()).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::Clear { target, days } => {
            let db = orchestrator.database().clone();
            let (cache, history) = db
                .run_blocking(move |db| {
                    let cache = match target {
                        ClearTarget::Cache | ClearTarget::All => db.clear_cache(days)?,
                        ClearTarget::History => 0,
                    };
                    let history = match target {
                        ClearTarget::History | ClearTarget::All => db.history.clear_history(days)?,
                        ClearTarget::Cache => 0,
                    };
                    Ok((cache, history))
                })
                .await?;
            println!("Removed {} cache entries and {} history records", cache, history);
        }
        Command::Sweep => {
            let purged = maintenance::sweep_once(orchestrator.database(), cfg.cache_retention_days).await?;
            println!("Removed {} stale cache entries", purged);
        }
        Command::Smoke => {
            let mut passed = 0;
            for question in SMOKE_QUESTIONS {
                let answer = orchestrator.answer_question(question, Some("smoke"), false).await;
                if answer.success {
                    passed += 1;
                }
                println!(
                    "[{}] {:.2}s  {}",
                    if answer.success { "ok" } else { "FAIL" },
                    answer.response_time_seconds,
                    question
                );
            }
            println!("{}/{} questions answered", passed, SMOKE_QUESTIONS.len());
        }
        Command::Chat { session } => {
            let sweep = maintenance::start_configured_sweep(orchestrator.database().clone(), &cfg);
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                let answer = orchestrator.answer_question(line, Some(&session), true).await;
                println!("{}\n", answer.answer);
            }
            if let Some(sweep) = sweep {
                sweep.abort();
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
