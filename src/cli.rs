mod export;

use std::time;

use anyhow::bail;
use card_export::Profile;
use clap::{Parser, Subcommand};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "card-export",
    about = "Export BI tool cards to Avro files",
    version = env!("CARD_EXPORT_VERSION"),
    propagate_version = true
)]
pub(crate) struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Args)]
#[command(next_help_heading = "Global Options")]
pub(crate) struct GlobalArgs {
    /// Name of the profile to use
    #[arg(long, short = 'P', global = true)]
    pub profile: Option<String>,
    /// Timeout (in seconds) for API requests (-1 = no timeout)
    #[arg(long, global = true)]
    pub client_timeout: Option<i64>,
    /// Print verbose logs
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Print version.
    Version,
    /// Export a card to an Avro file
    Export(export::ExportArgs),
}

pub(crate) struct Cli {
    pub(crate) profile: Profile,
    pub(crate) timeout: Option<time::Duration>,
}

pub(crate) fn run(args: Args) -> anyhow::Result<()> {
    // Some commands don't require any config.
    if let Command::Version = args.command {
        println!("card-export {}", env!("CARD_EXPORT_VERSION"));
        return Ok(());
    }

    let profile = if let Some(name) = args.global.profile.as_deref() {
        Profile::from_env(name)
    } else {
        Profile::from_default_env()
    }?;

    let timeout = match args.global.client_timeout {
        Some(-1) | None => None,
        Some(v) if v > 0 => Some(time::Duration::from_secs(v as _)),
        Some(v) => bail!("Invalid timeout value: {v}"),
    };

    debug!(profile = %profile.name, command = ?args.command, "cli invocation");
    let cli = Cli { profile, timeout };

    match args.command {
        Command::Version => unreachable!(),
        Command::Export(args) => with_rt(export::handle(cli, args)),
    }
}

fn with_rt<T, F: Future<Output = anyhow::Result<T>>>(f: F) -> anyhow::Result<T> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(f)
}
