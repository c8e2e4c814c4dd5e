use anyhow::Context;
use clap::Parser;
use ohlcv_harvester::config::{Config, DEFAULT_CONFIG_PATH};
use ohlcv_harvester::exchanges::ExchangeRegistry;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ohlcv-harvester", version, about = "Download OHLCV and trade data from crypto exchanges")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    ohlcv_harvester::logging::init(&config).context("initializing logging")?;

    let registry = ExchangeRegistry::with_defaults();
    let report = ohlcv_harvester::run(config, &registry)
        .await
        .context("download run failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
