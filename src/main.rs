#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use keyrelay_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keyrelay-gateway", about = "Unified API gateway for AI provider backends")]
struct Cli {
    /// Path to the gateway config file. Falls back to `TUNNEL_CONFIG`,
    /// then `AI_TUNNEL_CONFIG`, then `config.yaml` when unset.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
