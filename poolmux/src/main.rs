use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use poolmux::config::Config;
use poolmux::daemon::Daemon;
use poolmux::tracing::{self, prelude::*};

/// Mining work-source failover daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance name; `<instance>.toml` is the default configuration file
    #[arg(default_value = "default")]
    instance: String,

    /// Configuration file
    #[arg(short, long, env = "POOLMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Add the example/donation work sources to the tree
    #[arg(long)]
    add_example_work_sources: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<LevelFilter>,
}

/// Find the configuration: an explicit file, `<instance>.toml`, the
/// environment, or, failing all of those, the example tree.
fn load_config(args: &Args) -> anyhow::Result<(Config, bool)> {
    if let Some(path) = &args.config {
        let config = Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?;
        return Ok((config, false));
    }

    let instance_file = format!("{}.toml", args.instance);
    let instance_path = Path::new(&instance_file);
    if instance_path.exists() {
        let config = Config::load(instance_path)
            .with_context(|| format!("loading configuration {}", instance_file))?;
        return Ok((config, false));
    }

    if let Some(config) = Config::from_env().context("reading POOLMUX_POOL_* variables")? {
        return Ok((config, false));
    }

    Ok((Config::default(), true))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing::init_journald_or_stdout(args.log_level);

    let (mut config, unconfigured) = load_config(&args)?;
    if unconfigured {
        warn!(
            instance = %args.instance,
            "No configuration found; using the example work sources."
        );
    }
    if unconfigured || args.add_example_work_sources {
        config = config.with_example_sources();
    }

    let daemon = Daemon::new(args.instance, config);
    daemon.run().await
}
