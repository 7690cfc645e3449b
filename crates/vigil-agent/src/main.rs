mod agent;
mod api;
mod config;
mod debouncer;
mod inputs;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "vigil-agent", about = "Host monitoring agent", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/vigil/agent.toml")]
    config: PathBuf,

    /// Allow the agent to run as root.
    #[arg(long = "yes-run-as-root")]
    yes_run_as_root: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } == 0 && !args.yes_run_as_root {
        eprintln!("Error: trying to run the vigil agent as root without \"--yes-run-as-root\".");
        eprintln!("If the agent is installed using the standard method, start it with:");
        eprintln!("    systemctl start vigil-agent");
        eprintln!();
        std::process::exit(1);
    }

    let config = config::AgentConfig::load(&args.config)?;

    let default_directive = format!("vigil={}", config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(default_directive.parse()?),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigil agent starting");
    agent::run(config).await
}
