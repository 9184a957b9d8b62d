use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use zeon_refiller::config::Config;
use zeon_refiller::observability::logging::{self, LogFormat};
use zeon_refiller::{supervisor, worker};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "zeon-refiller",
    version,
    about = "Keep a vSphere folder stocked with ready-to-hand-out login VMs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool refiller control plane until SIGINT/SIGTERM
    Run {
        /// Emit JSON logs instead of human-readable output
        #[arg(long)]
        json: bool,
    },
    /// Build one VM in an isolated process (spawned by the builder pool)
    #[command(hide = true)]
    Worker {
        /// Job id; its first 8 hex chars become the VM name suffix
        #[arg(long)]
        job_id: Uuid,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { json } => {
            logging::init(if json { LogFormat::Json } else { LogFormat::Human });
            let cfg = Config::from_env()?;
            tokio::runtime::Runtime::new()?.block_on(supervisor::run(cfg))
        }
        Commands::Worker { job_id } => {
            logging::init_worker();
            worker::runner::run_worker_process(job_id)
        }
    }
}
