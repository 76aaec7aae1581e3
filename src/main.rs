use anyhow::Result;

use dbguard::cli::{self, args::Cli};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    cli::init_logging(&cli.log_level);

    // Every command is a short-lived, sequential job
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(cli::run(cli))
}
