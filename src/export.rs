//! The export workflow: schema inference, row fetch, and encoding.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    ApiClient, Error, ImportError, ImportResult, RecordSchema, WarehouseImporter,
    card::{Card, Row},
    encode::encode_rows,
    schema::{export_schema_name, infer_schema},
};

/// Options for a single export.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Read rows from the raw-row cache file if one exists.
    pub use_cache: bool,
    /// Only encode the first `max_rows` rows. `Some(0)` produces an empty
    /// file; the CLI only accepts positive values.
    pub max_rows: Option<usize>,
    /// Field names to use instead of the original column names, keyed by
    /// column name.
    pub rename: BTreeMap<String, String>,
}

/// The result of an export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportArtifact {
    /// The schema the rows were encoded with.
    pub schema: RecordSchema,
    /// Where the output file was written.
    pub output_path: PathBuf,
    /// The number of rows in the output file.
    pub row_count: u64,
}

impl ExportArtifact {
    /// Load the output file into a warehouse table named after the schema.
    pub fn import_into(
        &self,
        importer: &dyn WarehouseImporter,
    ) -> Result<ImportResult, ImportError> {
        info!(table = %self.schema.name, path = %self.output_path.display(), "importing");
        importer.import(&self.output_path, &self.schema.name)
    }
}

/// Exports cards into Avro files under a working directory.
#[derive(Debug)]
pub struct ExportPipeline {
    client: Arc<ApiClient>,
    work_dir: PathBuf,
    timezone: Tz,
}

impl ExportPipeline {
    /// Create a pipeline using the working directory and timezone of the
    /// client's profile.
    pub fn new(client: Arc<ApiClient>) -> Self {
        let work_dir = client.profile().work_dir.clone();
        let timezone = client.profile().timezone;
        Self {
            client,
            work_dir,
            timezone,
        }
    }

    /// Write files to a different directory.
    pub fn with_work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..self
        }
    }

    /// The directory output and cache files are written to.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The path of the inferred schema dump for a card.
    pub fn schema_path(&self, card_id: u64) -> PathBuf {
        self.work_dir.join(format!("{card_id}.schema.json"))
    }

    /// The path of the raw-row cache for a card.
    pub fn rows_path(&self, card_id: u64) -> PathBuf {
        self.work_dir.join(format!("{card_id}.json"))
    }

    /// Fetch a card's metadata and infer its schema. The schema keeps the
    /// card's own name, and is dumped to the working directory.
    pub async fn infer_schema(
        &self,
        card_id: u64,
        rename: &BTreeMap<String, String>,
    ) -> Result<RecordSchema, Error> {
        let card = self.get_card(card_id).await?;
        let schema = infer_schema(card_id, &card, rename)?;

        let path = self.schema_path(card_id);
        if let Err(e) = write_json(&path, &schema).await {
            warn!(path = %path.display(), "failed to write schema: {e}");
        }

        Ok(schema)
    }

    /// Fetch a card's rows, from the cache if allowed and present. Rows
    /// fetched from the API are written to the cache. An unreadable cache
    /// file is ignored and overwritten.
    pub async fn fetch_rows(
        &self,
        card_id: u64,
        parameters: Option<&str>,
        use_cache: bool,
    ) -> Result<Vec<Row>, Error> {
        let path = self.rows_path(card_id);
        if use_cache {
            match tokio::fs::read(&path).await {
                Ok(contents) => match serde_json::from_slice::<Vec<Row>>(&contents) {
                    Ok(rows) => {
                        let path = path.display();
                        info!(card_id, rows = rows.len(), %path, "using cached rows");
                        return Ok(rows);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "discarding unreadable cached rows: {e}");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "no cached rows");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let client = self.client.clone();
        let parameters = parameters.map(str::to_owned);
        let rows = tokio::task::spawn_blocking(move || {
            client.query_card(card_id, parameters.as_deref())
        })
        .await??;

        info!(card_id, rows = rows.len(), "fetched rows");
        write_json(&path, &rows).await?;
        Ok(rows)
    }

    /// Export a card to an Avro file.
    ///
    /// `parameters` is the card's parameter list, serialized as JSON.
    pub async fn export(
        &self,
        card_id: u64,
        parameters: Option<&str>,
        options: &ExportOptions,
    ) -> Result<ExportArtifact, Error> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut schema = self.infer_schema(card_id, &options.rename).await?;
        let mut rows = self
            .fetch_rows(card_id, parameters, options.use_cache)
            .await?;

        schema.name = export_schema_name(card_id, &schema.name);
        if let Some(max) = options.max_rows {
            rows.truncate(max);
        }

        let output_path = self.work_dir.join(format!("{}.avro", schema.name));
        info!(card_id, rows = rows.len(), path = %output_path.display(), "encoding");
        let row_count = encode_rows(&schema, rows, self.timezone, &output_path).await?;

        Ok(ExportArtifact {
            schema,
            output_path,
            row_count,
        })
    }

    async fn get_card(&self, card_id: u64) -> Result<Card, Error> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.get_card(card_id)).await?
    }
}

// Written under a temporary name and renamed, so an interrupted run never
// leaves a truncated file behind.
async fn write_json(path: &Path, value: &impl Serialize) -> Result<(), Error> {
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.partial", uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);

    let res = match tokio::fs::write(&tmp, json).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };

    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }

    Ok(res?)
}
