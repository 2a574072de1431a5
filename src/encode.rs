//! Transformation of raw rows into records, and encoding of the output file.
//!
//! Rows are transformed concurrently, but every record is written by a
//! single consumer that owns the Avro writer, so the output stream only ever
//! sees sequential appends.

use std::{
    collections::HashMap,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};

use apache_avro::{Writer, types::Value as AvroValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone as _};
use chrono_tz::Tz;
use futures::{StreamExt as _, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Error, FieldType, Primitive, RecordSchema, card::Row};

/// The maximum number of rows being transformed at once.
pub const MAX_IN_FLIGHT: usize = 100;

#[derive(Debug, Clone)]
struct FieldPlan {
    name: String,
    display_name: String,
    field_type: FieldType,
}

/// A precomputed mapping from raw rows onto a record schema.
#[derive(Debug, Clone)]
pub struct RowPlan {
    fields: Vec<FieldPlan>,
    by_display: HashMap<String, usize>,
    timezone: Tz,
}

impl RowPlan {
    /// Build the plan for a schema. Naive timestamps are read in `timezone`.
    ///
    /// If several fields share a display name, only the first receives the
    /// raw value.
    pub fn new(schema: &RecordSchema, timezone: Tz) -> Self {
        let fields: Vec<_> = schema
            .fields
            .iter()
            .map(|f| FieldPlan {
                name: f.name.clone(),
                display_name: f.doc.clone(),
                field_type: f.field_type,
            })
            .collect();

        let mut by_display = HashMap::with_capacity(fields.len());
        for (idx, field) in fields.iter().enumerate() {
            by_display.entry(field.display_name.clone()).or_insert(idx);
        }

        Self {
            fields,
            by_display,
            timezone,
        }
    }

    /// Re-key a raw row onto field names and coerce every value to its
    /// field's type. Fields are emitted in schema order.
    pub fn transform(&self, row: &Row) -> Result<AvroValue, Error> {
        let mut raw: Vec<Option<&Value>> = vec![None; self.fields.len()];
        for (key, value) in row {
            if let Some(&idx) = self.by_display.get(key) {
                raw[idx] = Some(value);
            }
        }

        let record = self
            .fields
            .iter()
            .zip(raw)
            .map(|(field, value)| Ok((field.name.clone(), self.coerce(field, value)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(AvroValue::Record(record))
    }

    fn coerce(&self, field: &FieldPlan, raw: Option<&Value>) -> Result<AvroValue, Error> {
        let raw = raw.filter(|v| !v.is_null());
        let FieldType {
            primitive,
            nullable,
        } = field.field_type;

        let value = match (primitive, raw) {
            (_, None) if nullable => return Ok(AvroValue::Union(0, Box::new(AvroValue::Null))),
            (Primitive::String, None) => AvroValue::String("null".to_owned()),
            (Primitive::Int, None) => AvroValue::Int(0),
            (_, None) => return Err(mismatch(field, &Value::Null)),
            (Primitive::String, Some(Value::String(s))) => AvroValue::String(s.clone()),
            (Primitive::String, Some(v)) => AvroValue::String(v.to_string()),
            (Primitive::TimestampMicros, Some(v)) => {
                let micros = parse_timestamp(v, self.timezone).ok_or_else(|| {
                    Error::InvalidTimestamp {
                        field: field.name.clone(),
                        value: v.to_string(),
                    }
                })?;
                AvroValue::TimestampMicros(micros)
            }
            (Primitive::Int, Some(v)) => as_long(v)
                .and_then(|n| i32::try_from(n).ok())
                .map(AvroValue::Int)
                .ok_or_else(|| mismatch(field, v))?,
            (Primitive::Long, Some(v)) => as_long(v)
                .map(AvroValue::Long)
                .ok_or_else(|| mismatch(field, v))?,
            (Primitive::Double, Some(v)) => v
                .as_f64()
                .map(AvroValue::Double)
                .ok_or_else(|| mismatch(field, v))?,
        };

        if nullable {
            Ok(AvroValue::Union(1, Box::new(value)))
        } else {
            Ok(value)
        }
    }
}

fn mismatch(field: &FieldPlan, value: &Value) -> Error {
    Error::ValueMismatch {
        field: field.name.clone(),
        expected: field.field_type.to_string(),
        value: value.to_string(),
    }
}

fn as_long(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }

    let f = v.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Read a raw timestamp as microseconds since the epoch.
///
/// Strings with an explicit offset keep it. Naive date-times and plain dates
/// are interpreted in `timezone`; at a DST transition the earlier instant
/// wins. Integers are epoch milliseconds.
pub fn parse_timestamp(value: &Value, timezone: Tz) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64()?.checked_mul(1000),
        Value::String(s) => parse_timestamp_str(s.trim(), timezone),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str, timezone: Tz) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_micros());
    }

    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)
        })?;

    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_micros())
}

/// Encode `rows` against `schema` into an Avro container file at `path`.
///
/// Field names are validated before anything is written.
/// The file is written under a temporary name and only moved into place once
/// every row has been encoded; on failure the partial file is removed.
/// Returns the number of records written.
pub async fn encode_rows(
    schema: &RecordSchema,
    rows: Vec<Row>,
    timezone: Tz,
    path: &Path,
) -> Result<u64, Error> {
    let avro_schema = schema.to_avro()?;
    let plan = Arc::new(RowPlan::new(schema, timezone));

    let partial = partial_path(path);
    let (tx, rx) = mpsc::channel(MAX_IN_FLIGHT);

    let writer = {
        let partial = partial.clone();
        tokio::task::spawn_blocking(move || write_records(&avro_schema, rx, &partial))
    };

    let produced = produce(plan, rows, tx).await;
    let written = writer.await.map_err(Error::from).and_then(|res| res);

    match (produced, written) {
        (Ok(()), Ok(count)) => {
            tokio::fs::rename(&partial, path).await?;
            debug!(path = %path.display(), rows = count, "wrote output file");
            Ok(count)
        }
        (Err(e), _) | (_, Err(e)) => {
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), "failed to remove partial output: {rm}");
                }
            }
            Err(e)
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", uuid::Uuid::new_v4()));
    path.with_file_name(name)
}

// Transforms run as separate tasks; their results are handed to the writer
// in completion order.
async fn produce(
    plan: Arc<RowPlan>,
    rows: Vec<Row>,
    tx: mpsc::Sender<AvroValue>,
) -> Result<(), Error> {
    let mut records = stream::iter(rows)
        .map(|row| {
            let plan = plan.clone();
            tokio::spawn(async move { plan.transform(&row) })
        })
        .buffer_unordered(MAX_IN_FLIGHT);

    while let Some(record) = records.next().await {
        let record = record??;
        if tx.send(record).await.is_err() {
            // The writer stopped early; its error is reported by the caller.
            break;
        }
    }

    Ok(())
}

fn write_records(
    schema: &apache_avro::Schema,
    mut rx: mpsc::Receiver<AvroValue>,
    path: &Path,
) -> Result<u64, Error> {
    let file = BufWriter::new(File::create(path)?);
    let mut writer = Writer::new(schema, file);

    let mut count = 0;
    while let Some(record) = rx.blocking_recv() {
        writer.append(record)?;
        count += 1;
    }

    writer
        .into_inner()?
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    Ok(count)
}
