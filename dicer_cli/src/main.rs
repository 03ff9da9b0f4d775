use dicer_core::classify::{Classifier, Outcome, Tally};
use dicer_core::config::DicerConfig;
use dicer_core::executor::{CommandExecutor, CommandExecutorConfig, Executor};
use dicer_core::helpers::HelperRegistry;
use dicer_core::item::{FieldItem, Item};
use dicer_core::manager::Statuses;
use dicer_core::provider::{DirectoryProvider, Provider, ProviderError};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Provider directory holding `oracles/*.yaml`. Repeatable.
    #[clap(short, long = "provider")]
    providers: Vec<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    /// Print generated items as JSON lines instead of running the target.
    #[clap(long)]
    dry_run: bool,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(short, long)]
    quiet: bool,
    /// Target argv, overriding `target.command`. `{field}` is replaced by item fields.
    #[clap(last = true)]
    command: Vec<String>,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => simplelog::LevelFilter::Warn,
        (false, 0) => simplelog::LevelFilter::Info,
        (false, 1) => simplelog::LevelFilter::Debug,
        (false, _) => simplelog::LevelFilter::Trace,
    };
    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<DicerConfig> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            DicerConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("dicer.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                DicerConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and 'dicer.toml' not found, using built-in defaults");
                DicerConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if cli.seed.is_some() {
        config.fuzzer.seed = cli.seed;
    }
    if !cli.providers.is_empty() {
        config.target.provider_dirs = cli.providers.clone();
    }
    if !cli.command.is_empty() {
        config.target.command = cli.command.clone();
    }
    Ok(config)
}

fn status_summary(statuses: &Statuses) -> String {
    statuses
        .iter()
        .map(|(name, status)| format!("{name}={status}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let config = load_config(&cli)?;
    debug!("Effective configuration: {config:#?}");

    if config.target.provider_dirs.is_empty() {
        anyhow::bail!("No provider directories given (use --provider or target.provider-dirs)");
    }
    let providers = config
        .target
        .provider_dirs
        .iter()
        .map(|dir| {
            DirectoryProvider::load(dir, HelperRegistry::with_builtins(), &config.generation)
                .with_context(|| format!("Failed to load provider {dir:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let seed = config.fuzzer.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default()
    });
    info!("Using seed {seed}");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let max_iterations = config.fuzzer.max_iterations;

    if cli.dry_run {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for _ in 0..max_iterations {
            let Some(provider) = providers.choose(&mut rng) else {
                break;
            };
            let (item, statuses) =
                provider.generate_with_retries(&mut rng, config.fuzzer.max_retries)?;
            let line = serde_json::json!({
                "provider": provider.name(),
                "item": item,
                "statuses": statuses
                    .iter()
                    .map(|(name, status)| (name.clone(), status.to_string()))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            });
            writeln!(out, "{line}")?;
        }
        return Ok(());
    }

    if config.target.command.is_empty() {
        anyhow::bail!("No target command configured (use target.command or `-- <argv>`)");
    }
    let mut executor = CommandExecutor::new(CommandExecutorConfig {
        command: config.target.command.clone(),
        timeout: config.target.timeout(),
        working_dir: config.target.working_dir.clone(),
    });
    let mut classifier = Classifier::new();
    let mut tally = Tally::default();

    info!(
        "Starting campaign for {max_iterations} iterations over {} providers...",
        providers.len()
    );
    let start_time = Instant::now();

    for i in 0..max_iterations {
        let Some(provider) = providers.choose(&mut rng) else {
            break;
        };
        let item: FieldItem =
            match provider.generate_with_retries(&mut rng, config.fuzzer.max_retries) {
                Ok((item, statuses)) => {
                    debug!("[{}] {}", provider.name(), status_summary(&statuses));
                    item
                }
                Err(e @ ProviderError::RetriesExhausted { .. }) => {
                    warn!("[{}] {e}", provider.name());
                    tally.record(Outcome::Skip);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

        let result = executor.execute_sync(&item);
        let classification = classifier.classify(&result, item.fail_patts());
        tally.record(classification.outcome);

        if classification.outcome.is_finding() {
            warn!(
                "[{}] {} for {}",
                provider.name(),
                classification.outcome,
                serde_json::to_string(&item)?
            );
            let stderr = result.output.stderr_lossy();
            if let Some(first_line) = stderr.lines().next() {
                warn!("  stderr: {first_line}");
            }
        } else {
            debug!(
                "[{}] {} in {:.2?}",
                provider.name(),
                classification.outcome,
                result.elapsed
            );
        }

        if !cli.quiet && i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                tally.total() as f32 / elapsed
            } else {
                0.0
            };
            print!(
                "\rIter: {}/{}, Findings: {}, Execs/sec: {:.2}   ",
                i,
                max_iterations,
                tally.findings(),
                exec_per_sec
            );
            std::io::stdout().flush()?;
        }
    }

    let elapsed_total = start_time.elapsed();
    println!("\nCampaign finished in {elapsed_total:.2?} (seed {seed}).");
    println!("{tally}");

    Ok(())
}
