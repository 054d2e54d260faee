use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mend_core::{ClusterId, MendConfig, NewFailure};
use mend_queue::{FailedBatchLedger, FailureQueue};
use mend_registry::{render_report, MatchSource, ParseOutcome, PluginRegistry, PluginStore};
use mend_workflow::{HealingParser, InterceptError, RuleTestRunner, StagedModule};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("mend")
        .version(mend_core::VERSION)
        .about("Self-healing time parser pipeline")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .env("MEND_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("Pipeline configuration (TOML); defaults apply when absent"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log as JSON lines"),
        )
        .subcommand(
            Command::new("append")
                .about("Queue a failed input by hand")
                .arg(Arg::new("text").required(true)),
        )
        .subcommand(Command::new("status").about("Queue, registry and ledger summary"))
        .subcommand(
            Command::new("parse")
                .about("Parse an input with the installed plugins")
                .arg(Arg::new("text").required(true))
                .arg(
                    Arg::new("now")
                        .long("now")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Reference time (RFC 3339); defaults to the current time"),
                )
                .arg(
                    Arg::new("record")
                        .long("record")
                        .action(ArgAction::SetTrue)
                        .help("Queue the input if nothing recognizes it"),
                ),
        )
        .subcommand(Command::new("failed").about("List batches that exhausted their retries"))
        .subcommand(
            Command::new("check")
                .about("Compile a rule module and run its test suite")
                .arg(
                    Arg::new("module")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("tests")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("prune-tests").about("Delete test suites whose module is gone"),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<MendConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => MendConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(MendConfig::default()),
    }
}

fn arg<'a, T: Clone + Send + Sync + 'static>(args: &'a ArgMatches, name: &str) -> Result<&'a T> {
    args.get_one::<T>(name)
        .ok_or_else(|| anyhow!("missing argument <{name}>"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("append", args)) => {
            let queue = FailureQueue::open(&config.paths.queue)?;
            let record = queue.append(NewFailure::new(arg::<String>(args, "text")?.as_str()))?;
            println!("queued as {}", record.sequence_index);
        }
        Some(("status", _)) => status(&config)?,
        Some(("parse", args)) => {
            let text = arg::<String>(args, "text")?;
            let now = args.get_one::<DateTime<Utc>>("now").copied().unwrap_or_else(Utc::now);
            let store = PluginStore::open(&config.paths.plugins)?;
            let registry = Arc::new(PluginRegistry::open(&store)?);

            let result = if args.get_flag("record") {
                let queue = Arc::new(FailureQueue::open(&config.paths.queue)?);
                HealingParser::new(registry, queue).parse_at(text, now)
            } else {
                registry.parse_at(text, now).map_err(InterceptError::from)
            };
            match result {
                Ok(outcome) => println!("{}", describe(&outcome)),
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
        Some(("failed", _)) => {
            let ledger = FailedBatchLedger::open(&config.paths.ledger)?;
            for entry in ledger.entries()? {
                let clusters: Vec<&str> = entry.clusters.iter().map(ClusterId::as_str).collect();
                println!(
                    "{}  {}  retries={}  errors={}  clusters={}",
                    entry.timestamp.to_rfc3339(),
                    entry.batch_id,
                    entry.retry_count,
                    entry.error_count,
                    clusters.join(",")
                );
            }
        }
        Some(("check", args)) => {
            let passed = check(arg::<PathBuf>(args, "module")?, arg::<PathBuf>(args, "tests")?)?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Some(("prune-tests", _)) => {
            let store = PluginStore::open(&config.paths.plugins)?;
            let removed = store.prune_orphan_tests()?;
            info!("Removed {} orphaned test suites", removed.len());
            for path in removed {
                println!("removed {}", path.display());
            }
        }
        _ => {
            cli().print_help()?;
        }
    }
    Ok(())
}

fn status(config: &MendConfig) -> Result<()> {
    let queue = FailureQueue::open(&config.paths.queue)?;
    let snapshot = queue.snapshot()?;
    let ledger = FailedBatchLedger::open(&config.paths.ledger)?;
    let store = PluginStore::open(&config.paths.plugins)?;
    let registry = PluginRegistry::open(&store)?;

    let fence = snapshot
        .fence
        .map_or_else(|| "-".to_string(), |f| f.to_string());
    println!("queue:      {} records (fence {})", snapshot.len(), fence);
    println!(
        "threshold:  {} ({})",
        config.activation_threshold,
        if snapshot.len() >= config.activation_threshold {
            "due"
        } else {
            "waiting"
        }
    );
    println!("generation: {}", registry.generation());
    for summary in registry.summaries() {
        println!("  {:<24} {}", summary.cluster_id.as_str(), summary.description);
    }
    println!("ledger:     {} failed batches", ledger.len()?);
    Ok(())
}

fn describe(outcome: &ParseOutcome) -> String {
    let source = match &outcome.source {
        MatchSource::Plugin(id) => id.to_string(),
        MatchSource::Builtin => "builtin".to_string(),
    };
    format!(
        "{} (via {}, generation {})",
        outcome.value.to_rfc3339(),
        source,
        outcome.generation
    )
}

fn check(module_path: &Path, test_path: &Path) -> Result<bool> {
    let module_source = std::fs::read_to_string(module_path)
        .with_context(|| format!("reading {}", module_path.display()))?;
    let test_source = std::fs::read_to_string(test_path)
        .with_context(|| format!("reading {}", test_path.display()))?;
    let stem = module_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let module = StagedModule {
        cluster_id: ClusterId::sanitize(stem),
        module_path: module_path.to_path_buf(),
        test_path: test_path.to_path_buf(),
    };

    let results = RuleTestRunner::new().run_sources(&module, &module_source, &test_source);
    println!("{}", render_report(&module.cluster_id, &results));
    Ok(!results.is_empty() && results.iter().all(|r| r.passed))
}
