use anyhow::{bail, Context};
use clap::Parser;
use gridreduce::testing::{LocalGrid, LocalGridBuilder, SumReducer, WordCountMapper};
use gridreduce::EngineSettings;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Count words across documents spread over an in-process grid
#[derive(Parser)]
#[command(name = "gridreduce", version)]
#[command(about = "Distributed map/reduce word count over an in-process data grid", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of grid members
    #[arg(short, long, default_value_t = 3)]
    members: usize,

    /// Copies kept of every document, primary included
    #[arg(long, default_value_t = 1)]
    owners: usize,

    /// Reduce on the owners of the words instead of the invoking member
    #[arg(long)]
    distribute_reduce: bool,

    /// Use the intermediate store shared across tasks
    #[arg(long)]
    shared_store: bool,

    /// Also run the reducer as a per-member combiner
    #[arg(long)]
    combine: bool,

    /// Only count these documents
    #[arg(short, long, value_delimiter = ',')]
    keys: Vec<String>,

    /// Engine settings file (.toml, .yaml or .yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Timeout for each remote invocation, e.g. "5s"; 0 waits forever
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Inline document, may be repeated
    #[arg(short, long)]
    text: Vec<String>,

    /// Documents to read
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("gridreduce started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = match &cli.config {
        Some(path) => EngineSettings::load(path)?,
        None => {
            let mut settings = EngineSettings::default();
            settings.merge_env_vars()?;
            settings.validate()?;
            settings
        }
    };

    let mut documents = Vec::new();
    for path in &cli.files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push((path.display().to_string(), content));
    }
    for (index, text) in cli.text.iter().enumerate() {
        documents.push((format!("text-{}", index + 1), text.clone()));
    }
    if documents.is_empty() {
        bail!("no documents given, pass files or --text");
    }

    let grid: LocalGrid<WordCountMapper> = LocalGridBuilder::new()
        .members(cli.members)
        .num_owners(cli.owners)
        .cache_name("documents")
        .settings(settings)
        .build();
    for (key, text) in documents {
        grid.put(key, text)?;
    }

    let mut builder = grid
        .task::<SumReducer>(0)
        .mapped_with(WordCountMapper::lowercase())
        .reduced_with(SumReducer)
        .on_keys(cli.keys)
        .distribute_reduce_phase(cli.distribute_reduce)
        .use_intermediate_shared_store(cli.shared_store);
    if cli.combine {
        builder = builder.combined_with(SumReducer);
    }
    if let Some(timeout) = cli.timeout {
        builder = builder.timeout(timeout);
    }
    let task = builder.build()?;

    let counts = task
        .execute_collated(|reduced: HashMap<String, u64>| {
            let mut counts: Vec<(String, u64)> = reduced.into_iter().collect();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            counts
        })
        .await?;

    for (word, count) in counts {
        println!("{}\t{}", word, count);
    }
    Ok(())
}
