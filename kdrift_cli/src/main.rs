use kdrift_core::campaign::{CampaignManager, CampaignStatus, StrategyRequest};
use kdrift_core::config::{DetectorSettings, KdriftConfig};
use kdrift_core::detector::scan_log;
use kdrift_core::engine::{CommandEngine, FuzzEngine};
use kdrift_core::minimizer::{MinimizeError, Minimizer};
use kdrift_core::oracle::CrashOracle;
use kdrift_core::patterns::VulnCategory;
use kdrift_core::reproducer::Reproducer;
use kdrift_core::strategy::{FuzzingTarget, StrategyConstraints, StrategyGenerator};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "kdrift.toml";
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `kdrift_core=debug`. `RUST_LOG` wins when set.
    #[clap(long, global = true, default_value = "info")]
    log: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the strategy generated for a target kind.
    Strategy {
        #[clap(long)]
        target: FuzzingTarget,
        /// Constraints as a JSON object.
        #[clap(long)]
        constraints: Option<String>,
    },
    /// Run one campaign to completion and print its report.
    Run {
        #[clap(short, long, value_parser)]
        config: Option<PathBuf>,
        #[clap(long)]
        target: FuzzingTarget,
        #[clap(long)]
        constraints: Option<String>,
        /// Overrides the strategy's maximum duration, in seconds.
        #[clap(long)]
        duration: Option<u64>,
        /// How long to wait for pending minimizations after the campaign ends.
        #[clap(long, default_value_t = 600)]
        minimize_wait: u64,
    },
    /// Detect crashes in a saved kernel log.
    Triage {
        log_file: PathBuf,
        #[clap(long)]
        max_frames: Option<usize>,
    },
    /// Minimize a reproducer against the configured replay command.
    Minimize {
        #[clap(long)]
        repro: PathBuf,
        #[clap(long)]
        category: VulnCategory,
        #[clap(short, long, value_parser)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;

    match cli.command {
        Command::Strategy {
            target,
            constraints,
        } => {
            let constraints = parse_constraints(constraints.as_deref())?;
            let strategy = StrategyGenerator::default().generate(target, &constraints)?;
            println!("{}", serde_json::to_string_pretty(&strategy)?);
        }
        Command::Run {
            config,
            target,
            constraints,
            duration,
            minimize_wait,
        } => {
            let config = load_config(config)?;
            let mut constraints = parse_constraints(constraints.as_deref())?;
            if duration.is_some() {
                constraints.duration_secs = duration;
            }
            run_campaign(
                &config,
                StrategyRequest {
                    target,
                    constraints,
                },
                Duration::from_secs(minimize_wait),
            )?;
        }
        Command::Triage {
            log_file,
            max_frames,
        } => {
            let log = std::fs::read_to_string(&log_file)
                .with_context(|| format!("failed to read {}", log_file.display()))?;
            let mut settings = DetectorSettings::default();
            if let Some(max_frames) = max_frames {
                settings.max_frames = max_frames;
            }
            let crashes = scan_log(&log, &settings);
            tracing::info!("{} distinct crash(es) in {}", crashes.len(), log_file.display());
            let summaries: Vec<_> = crashes.iter().map(|crash| crash.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Command::Minimize {
            repro,
            category,
            config,
        } => {
            let config = load_config(config)?;
            let text = std::fs::read_to_string(&repro)
                .with_context(|| format!("failed to read {}", repro.display()))?;
            minimize(&config, &Reproducer::from_program_text(&text), category)?;
        }
    }
    Ok(())
}

fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .with_context(|| format!("invalid log filter '{default_filter}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<KdriftConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            tracing::info!("Loading configuration from {}", config_path.display());
            KdriftConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG);
            if default_config_path.exists() {
                tracing::info!("Loading default configuration {DEFAULT_CONFIG}");
                KdriftConfig::load_from_file(&default_config_path)
            } else {
                tracing::info!("No {DEFAULT_CONFIG} found, using built-in defaults");
                Ok(KdriftConfig::default())
            }
        }
    }
}

fn parse_constraints(raw: Option<&str>) -> Result<StrategyConstraints, anyhow::Error> {
    match raw {
        Some(raw) => Ok(StrategyConstraints::from_json(raw)?),
        None => Ok(StrategyConstraints::default()),
    }
}

fn command_engine(config: &KdriftConfig) -> Result<CommandEngine, anyhow::Error> {
    let settings = config
        .engine
        .clone()
        .ok_or_else(|| anyhow!("an [engine] section is required for this command"))?;
    Ok(CommandEngine::new(settings, config.detector.clone()))
}

fn run_campaign(
    config: &KdriftConfig,
    request: StrategyRequest,
    minimize_wait: Duration,
) -> Result<(), anyhow::Error> {
    let engine: Arc<dyn FuzzEngine> = Arc::new(command_engine(config)?);
    let manager = CampaignManager::new(engine, config)?;
    let id = manager.start(&request)?;

    loop {
        let status = manager.wait_for_terminal(id, STATUS_INTERVAL)?;
        if status.is_terminal() {
            break;
        }
        let report = manager.status(id)?;
        tracing::info!(
            campaign = %id,
            executions = report.counters.executions,
            coverage = report.counters.coverage,
            crashes = report.crash_count,
            "Campaign running"
        );
    }

    let deadline = Instant::now() + minimize_wait;
    while manager.pending_minimizations(id)? > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(500));
    }
    let pending = manager.pending_minimizations(id)?;
    if pending > 0 {
        tracing::warn!(campaign = %id, pending, "Giving up on pending minimizations");
    }

    let report = manager.report(id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.campaign.status == CampaignStatus::Failed {
        return Err(anyhow!(
            "campaign {id} failed: {}",
            report.campaign.failure.unwrap_or_default()
        ));
    }
    Ok(())
}

fn minimize(
    config: &KdriftConfig,
    reproducer: &Reproducer,
    category: VulnCategory,
) -> Result<(), anyhow::Error> {
    let engine: Arc<dyn FuzzEngine> = Arc::new(command_engine(config)?);
    let crash = engine
        .replay(reproducer)?
        .crashes
        .into_iter()
        .find(|crash| crash.category == category)
        .ok_or_else(|| anyhow!("reproducer does not trigger a {category} crash"))?;
    tracing::info!(
        fingerprint = crash.fingerprint(),
        title = %crash.title,
        "Minimizing against the replayed crash"
    );
    let mut oracle = CrashOracle::for_crash(Arc::clone(&engine), &crash);
    let minimizer = Minimizer::new(config.minimizer.clone());
    match minimizer.minimize(reproducer, &mut oracle) {
        Ok(outcome) => {
            tracing::info!(
                from = reproducer.len(),
                to = outcome.reproducer.len(),
                oracle_calls = outcome.oracle_calls,
                timeouts = outcome.timeouts,
                budget_exhausted = outcome.budget_exhausted,
                "Minimization finished"
            );
            print!("{}", outcome.reproducer.to_program_text());
            Ok(())
        }
        Err(MinimizeError::MinimizationUnstable { fallback }) => {
            tracing::warn!(
                "Minimized reproducer did not re-verify, printing last verified candidate"
            );
            print!("{}", fallback.to_program_text());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
