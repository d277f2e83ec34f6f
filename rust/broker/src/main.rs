use std::path::PathBuf;

use clap::Parser;

use intelmux::config::Config;

#[derive(Debug, Parser)]
#[command(name = "intelmux", about = "Threat intelligence lookup broker")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "INTELMUX_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long, env = "INTELMUX_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log per-source counters once a minute.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    intelmux::telemetry::init_tracing();

    let args = Args::parse();
    let mut config = Config::from_file(&args.config)?;
    if let Some(addr) = args.listen_addr {
        config.service.listen_addr = addr;
    }
    if args.debug {
        config.service.debug = true;
    }

    intelmux::run(config).await
}
