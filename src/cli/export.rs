use std::{
    collections::BTreeMap, io::Write as _, num::NonZeroUsize, path::PathBuf, sync::Arc,
};

use anyhow::{Context as _, bail};
use card_export::{ApiClient, ExportOptions, ExportPipeline, FileStore, default_agent};
use serde::Deserialize;
use tracing::info;

use crate::cli::Cli;

#[derive(Debug, clap::Args)]
pub(crate) struct ExportArgs {
    /// Path to the card config file (JSON)
    #[arg(short, long)]
    pub config: PathBuf,
    /// Reuse rows fetched by a previous run, if present
    #[arg(long)]
    pub use_cache: bool,
    /// Only export the first N rows
    #[arg(long)]
    pub max_rows: Option<NonZeroUsize>,
    /// Write output to this directory instead of the profile's work dir
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

/// A card config file.
#[derive(Debug, Deserialize)]
struct CardConfig {
    card_id: CardId,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
    #[serde(default)]
    schema_field_name_index: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CardId {
    Number(u64),
    String(String),
}

impl CardId {
    fn get(&self) -> anyhow::Result<u64> {
        match self {
            CardId::Number(id) => Ok(*id),
            CardId::String(s) => s
                .trim()
                .parse()
                .with_context(|| format!("Invalid card_id: {s:?}")),
        }
    }
}

impl CardConfig {
    fn read(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read(path)
            .with_context(|| format!("Failed to read card config {}", path.display()))?;
        serde_json::from_slice(&contents)
            .with_context(|| format!("Invalid card config {}", path.display()))
    }

    fn parameters(&self) -> anyhow::Result<Option<String>> {
        match &self.parameters {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::to_string(v)?)),
        }
    }
}

pub(crate) async fn handle(cli: Cli, args: ExportArgs) -> anyhow::Result<()> {
    let config = CardConfig::read(&args.config)?;
    let card_id = config.card_id.get()?;
    if card_id == 0 {
        bail!("card_id must be a positive integer");
    }

    let parameters = config.parameters()?;

    let mut profile = cli.profile;
    if let Some(dir) = args.work_dir {
        profile = profile.with_work_dir(dir);
    }

    let store = FileStore::new(&profile.cache_dir);
    let client = ApiClient::new(profile, default_agent(cli.timeout), store);
    let pipeline = ExportPipeline::new(Arc::new(client));

    let options = ExportOptions {
        use_cache: args.use_cache,
        max_rows: args.max_rows.map(NonZeroUsize::get),
        rename: config.schema_field_name_index,
    };

    info!(card_id, use_cache = options.use_cache, "exporting card");
    let artifact = pipeline
        .export(card_id, parameters.as_deref(), &options)
        .await?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &artifact)?;
    writeln!(&mut stdout)?;
    Ok(())
}
