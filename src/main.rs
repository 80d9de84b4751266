#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use quotagate::server::bootstrap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quotagate", about = "Sliding-window rate limiter service")]
struct Cli {
    /// Path to limiter config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Admin API listen address (health/status/metrics); overrides config
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
        admin_listen: cli.admin_listen,
    }))
}
