mod cli;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let filter = if args.global.verbose {
        EnvFilter::new("card_export=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("card_export=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    cli::run(args)
}
