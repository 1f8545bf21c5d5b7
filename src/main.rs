use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use claude_limit_watch::{
    config::WatchConfig,
    models::{PredictionOutcome, PredictionResult, SessionBlock},
    services::{FileEventSource, Pipeline, PipelineState},
};
use colored::Colorize;
use log::debug;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "claude-limit-watch")]
#[command(about = "Predicts whether the current Claude session will hit its interaction limits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Subscription plan hint (pro, max5x, max20x)
    #[arg(short, long)]
    plan: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Show about information including version and build details
    #[arg(long)]
    about: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once and print the prediction (default)
    Predict,
    /// Show the current observed session block
    Status,
    /// Show observed session blocks
    History {
        /// Number of blocks to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Configure the watcher
    Config {
        /// Set the default plan hint
        #[arg(long)]
        plan: Option<String>,
        /// Set the idle gap that splits sessions, in seconds
        #[arg(long)]
        idle_gap: Option<i64>,
        /// Set the host refresh cadence, in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.about {
        show_about();
        return Ok(());
    }

    // Initialize logging
    if cli.verbose {
        // Log to file when verbose
        use std::fs::OpenOptions;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open("debug.log")?;

        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Debug)
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .init();
    } else {
        // Normal logging to stderr for info/warn/error
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Setup data directory
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claude-limit-watch");
    std::fs::create_dir_all(&data_dir)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("config.json"));
    let config = WatchConfig::load_or_create(&config_path)?;

    match cli.command {
        Some(Commands::Config { plan, idle_gap, interval }) => {
            configure(config, &config_path, plan, idle_gap, interval)
        }
        Some(Commands::Status) => {
            let pipeline = run_pipeline(&cli, config, &data_dir).await?;
            show_status(pipeline.current_block());
            Ok(())
        }
        Some(Commands::History { limit }) => {
            let pipeline = run_pipeline(&cli, config, &data_dir).await?;
            show_history(pipeline.blocks(), limit);
            Ok(())
        }
        Some(Commands::Predict) | None => {
            let mut last_report = None;
            let pipeline = run_pipeline_with(&cli, config, &data_dir, |report| {
                last_report = Some(report);
            })
            .await?;
            if let Some(report) = last_report {
                show_prediction(&report, pipeline.current_block());
            }
            Ok(())
        }
    }
}

async fn run_pipeline(cli: &Cli, config: WatchConfig, data_dir: &PathBuf) -> Result<Pipeline> {
    run_pipeline_with(cli, config, data_dir, |_| {}).await
}

/// Build the pipeline, restore persisted state, ingest the log once, save
/// state back, and hand the report to the caller.
async fn run_pipeline_with(
    cli: &Cli,
    config: WatchConfig,
    data_dir: &PathBuf,
    mut on_report: impl FnMut(PredictionResult),
) -> Result<Pipeline> {
    let plan = cli.plan.clone().unwrap_or_else(|| config.default_plan.clone());
    let mut pipeline = Pipeline::new(config, &plan)?;

    // Restore learner state; a corrupt snapshot degrades to priors.
    let state_path = data_dir.join("state.json");
    if state_path.exists() {
        match tokio::fs::read_to_string(&state_path).await {
            Ok(content) => match serde_json::from_str::<PipelineState>(&content) {
                Ok(state) => {
                    if pipeline.restore_state(state).is_err() {
                        log::warn!("Persisted state rejected; continuing from plan priors");
                    }
                }
                Err(e) => log::warn!("Could not parse {}: {e}", state_path.display()),
            },
            Err(e) => log::warn!("Could not read {}: {e}", state_path.display()),
        }
    }

    let source = FileEventSource::new()?;
    let records = source.collect_records().await?;
    debug!("Collected {} raw records", records.len());

    let report = pipeline.run(&records, Utc::now());
    for warning in &report.warnings {
        println!("{} {}", "⚠️".yellow(), warning);
    }
    on_report(report.prediction);

    let state = serde_json::to_string_pretty(&pipeline.state_snapshot())?;
    tokio::fs::write(&state_path, state).await?;

    Ok(pipeline)
}

fn show_prediction(result: &PredictionResult, current: Option<&SessionBlock>) {
    println!("{}", "🔮 Claude Limit Watch".bright_cyan().bold());
    println!();

    match &result.outcome {
        PredictionOutcome::InsufficientData => {
            println!("{}", "No interactions in the current session yet.".dimmed());
            println!("Start a conversation and run again for a projection.");
        }
        PredictionOutcome::Projection(p) => {
            use claude_limit_watch::models::Likelihood;
            let text = p.likelihood.to_string();
            let headline = match p.likelihood {
                Likelihood::VeryUnlikely => text.as_str().green().to_string(),
                Likelihood::Unlikely => text.clone(),
                Likelihood::Likely => text.as_str().yellow().bold().to_string(),
                Likelihood::VeryLikely => text.as_str().red().bold().to_string(),
            };
            println!("  {}", headline);
            println!(
                "  Remaining interactions: {} ({}-{})",
                p.remaining.point, p.remaining.low, p.remaining.high
            );
            println!("  Limiting factor: {} limit will be reached first", p.limiting_factor);
            println!(
                "  Time to limit: {:.1}h • Session time left: {:.1}h",
                p.time_to_limit_hours, p.session_remaining_hours
            );
        }
    }

    println!();
    println!(
        "  {} ({} sessions analyzed)",
        result.confidence, result.sessions_analyzed
    );
    if let Some(block) = current {
        println!(
            "  Session started: {}",
            humantime::format_rfc3339_seconds(block.start_time.into())
        );
    }
}

fn show_status(current: Option<&SessionBlock>) {
    match current {
        Some(block) => {
            println!("📊 Current Session Block:");
            println!("  Started: {}", humantime::format_rfc3339_seconds(block.start_time.into()));
            println!("  Window ends: {}", humantime::format_rfc3339_seconds(block.end_time.into()));
            println!("  Prompts: {}", block.user_prompts);
            println!("  Messages: {}", block.message_count());
            println!("  Size units: {}", block.total_size_units);
            if block.artifacts > 0 {
                println!("  Filtered rewrite artifacts: {}", block.artifacts);
            }
        }
        None => {
            println!("❌ No active session block");
        }
    }
}

fn show_history(blocks: &[SessionBlock], limit: usize) {
    if blocks.is_empty() {
        println!("📝 No session history found");
        return;
    }

    println!("📝 Session History ({} blocks):", blocks.len().min(limit));
    for block in blocks.iter().rev().take(limit) {
        let status = if block.is_open { "OPEN" } else { "CLOSED" };
        println!(
            "  {} • prompts={} messages={} size={} • {}",
            humantime::format_rfc3339_seconds(block.start_time.into()),
            block.user_prompts,
            block.message_count(),
            block.total_size_units,
            status
        );
    }
}

fn configure(
    mut config: WatchConfig,
    config_path: &std::path::Path,
    plan: Option<String>,
    idle_gap: Option<i64>,
    interval: Option<u64>,
) -> Result<()> {
    if let Some(plan_name) = plan {
        if config.plans.contains_key(&plan_name) {
            config.default_plan = plan_name.clone();
            println!("✅ Set default plan to: {plan_name}");
        } else {
            println!(
                "❌ Unknown plan: {plan_name}. Known plans: {}",
                config.plans.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }

    if let Some(gap) = idle_gap {
        if gap > 0 {
            config.idle_gap_seconds = gap;
            println!("✅ Set idle gap to: {gap} seconds");
        } else {
            println!("❌ Idle gap must be positive");
        }
    }

    if let Some(interval_val) = interval {
        config.update_interval_seconds = interval_val;
        println!("✅ Set update interval to: {interval_val} seconds");
    }

    config.save(config_path)?;
    Ok(())
}

/// Display about information including version and build details
fn show_about() {
    println!("{}", "🔮 Claude Limit Watch".bright_cyan().bold());
    println!();
    println!("{}", "📋 Version Information:".bright_yellow().bold());
    println!("  Version: {}", env!("CARGO_PKG_VERSION").bright_green());
    println!("  Built: {}", env!("CLAUDE_LIMIT_WATCH_BUILD_TIME"));
    println!();
    println!("{}", "💡 Usage:".bright_green().bold());
    println!("  claude-limit-watch --help");
    println!("  claude-limit-watch predict --plan pro");
    println!("  claude-limit-watch history --limit 20");
}
