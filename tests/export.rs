use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use apache_avro::types::Value as AvroValue;
use assert_matches::assert_matches;
use card_export::{
    ApiClient, CredentialStore as _, Error, ExportOptions, ExportPipeline, HttpTransport,
    ImportError, ImportResult, MemoryStore, Profile, SESSION_HEADER, SESSION_TTL,
    TransportError, WarehouseImporter, session_cache_key,
};
use chrono::TimeZone as _;
use chrono_tz::Tz;
use serde_json::json;

const ENDPOINT: &str = "http://localhost:3000/api/";
const TOKEN: &str = "1234-5678-9012-3456";

/// A stand-in for the BI tool. Only TOKEN is accepted as a session.
#[derive(Default)]
struct FakeBi {
    calls: Mutex<Vec<String>>,
}

impl FakeBi {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn card() -> serde_json::Value {
        json!({
            "name": "People (sample)",
            "result_metadata": [
                {"name": "ID", "display_name": "ID", "base_type": "type/BigInteger",
                 "fingerprint": {"global": {"distinct-count": 5, "nil%": 0.0}}},
                {"name": "NAME", "display_name": "Name", "base_type": "type/Text"},
                {"name": "CREATED_AT", "display_name": "Created At", "base_type": "type/DateTime",
                 "fingerprint": {"global": {"nil%": 0.2}}},
                {"name": "年齢", "display_name": "Age", "base_type": "type/Integer"},
                {"name": "SCORE", "display_name": "Score", "base_type": "type/Float",
                 "fingerprint": {"global": {"nil%": 0.4}}}
            ]
        })
    }

    fn rows() -> serde_json::Value {
        json!([
            {"ID": 1, "Name": "Hudson Borer", "Created At": "2017-10-07T10:34:35.462", "Age": 31, "Score": 0.5},
            {"ID": 2, "Name": "Domenica Williamson", "Created At": null, "Age": null, "Score": null},
            {"ID": 3, "Name": 42, "Created At": "2018-04-09T14:59:00+09:00", "Age": 40},
            {"ID": 4, "Name": null, "Created At": "2019-01-01", "Age": 22, "Score": 3},
            {"ID": 5, "Name": "Lina Heaney", "Created At": "2020-02-29 23:59:59", "Age": 19, "Score": 1.25}
        ])
    }
}

fn respond(status: u16, body: serde_json::Value) -> http::Response<Vec<u8>> {
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string().into_bytes())
        .unwrap()
}

impl HttpTransport for FakeBi {
    fn execute(
        &self,
        req: http::Request<String>,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        let path = req.uri().path().to_owned();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {path}", req.method()));

        if path == "/api/session" {
            return Ok(respond(200, json!({"id": TOKEN})));
        }

        if req.headers().get(SESSION_HEADER).is_none_or(|v| v != TOKEN) {
            return Ok(respond(401, json!("Unauthenticated")));
        }

        Ok(match path.as_str() {
            "/api/card/1" => respond(200, Self::card()),
            "/api/card/1/query/json" => respond(200, Self::rows()),
            _ => respond(404, json!("Not found.")),
        })
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    work_dir: PathBuf,
    bi: Arc<FakeBi>,
    store: Arc<MemoryStore>,
    pipeline: ExportPipeline,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("work");
    let profile = Profile::new("test@test.com", "secret", ENDPOINT)
        .unwrap()
        .with_work_dir(&work_dir)
        .with_timezone(Tz::Asia__Tokyo);

    let bi = Arc::new(FakeBi::default());
    let store = Arc::new(MemoryStore::new());
    let client = ApiClient::new(profile, bi.clone(), store.clone());

    Setup {
        _dir: dir,
        work_dir,
        bi,
        store,
        pipeline: ExportPipeline::new(Arc::new(client)),
    }
}

fn options() -> ExportOptions {
    ExportOptions {
        rename: BTreeMap::from([("年齢".to_owned(), "age".to_owned())]),
        ..Default::default()
    }
}

fn read_records(path: &Path) -> anyhow::Result<Vec<BTreeMap<String, AvroValue>>> {
    let reader = apache_avro::Reader::new(BufReader::new(File::open(path)?))?;
    let mut records = Vec::new();
    for value in reader {
        match value? {
            AvroValue::Record(fields) => records.push(fields.into_iter().collect()),
            other => anyhow::bail!("unexpected value {other:?}"),
        }
    }

    records.sort_by_key(|r: &BTreeMap<String, AvroValue>| match r["ID"] {
        AvroValue::Long(id) => id,
        _ => i64::MAX,
    });
    Ok(records)
}

fn null() -> AvroValue {
    AvroValue::Union(0, Box::new(AvroValue::Null))
}

fn some(v: AvroValue) -> AvroValue {
    AvroValue::Union(1, Box::new(v))
}

#[tokio::test(flavor = "multi_thread")]
async fn export_people() -> anyhow::Result<()> {
    let s = setup();
    let artifact = s.pipeline.export(1, None, &options()).await?;

    assert_eq!(artifact.row_count, 5);
    assert_eq!(artifact.schema.name, "export_card_1_Peoplesample");
    assert_eq!(
        artifact.output_path,
        s.work_dir.join("export_card_1_Peoplesample.avro")
    );
    assert!(s.work_dir.join("1.schema.json").exists());
    assert!(s.work_dir.join("1.json").exists());

    let records = read_records(&artifact.output_path)?;
    assert_eq!(records.len(), 5);

    let tokyo = Tz::Asia__Tokyo;
    let created = |r: &BTreeMap<String, AvroValue>| match &r["CREATED_AT"] {
        AvroValue::Union(1, v) => match **v {
            AvroValue::TimestampMicros(us) => tokyo
                .timestamp_micros(us)
                .single()
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
            _ => None,
        },
        _ => None,
    };

    assert_eq!(records[0]["NAME"], AvroValue::String("Hudson Borer".into()));
    assert_eq!(
        records[0]["CREATED_AT"],
        some(AvroValue::TimestampMicros(1_507_340_075_462_000))
    );
    assert_eq!(created(&records[0]).as_deref(), Some("2017-10-07T10:34:35.462"));
    assert_eq!(records[0]["age"], AvroValue::Int(31));
    assert_eq!(records[0]["SCORE"], some(AvroValue::Double(0.5)));

    assert_eq!(records[1]["CREATED_AT"], null());
    assert_eq!(records[1]["age"], AvroValue::Int(0));
    assert_eq!(records[1]["SCORE"], null());

    assert_eq!(records[2]["NAME"], AvroValue::String("42".into()));
    assert_eq!(created(&records[2]).as_deref(), Some("2018-04-09T14:59:00.000"));
    assert_eq!(records[2]["SCORE"], null());

    assert_eq!(records[3]["NAME"], AvroValue::String("null".into()));
    assert_eq!(created(&records[3]).as_deref(), Some("2019-01-01T00:00:00.000"));
    assert_eq!(records[3]["SCORE"], some(AvroValue::Double(3.0)));

    assert_eq!(created(&records[4]).as_deref(), Some("2020-02-29T23:59:59.000"));

    assert_eq!(
        s.bi.calls(),
        ["POST /api/session", "GET /api/card/1", "POST /api/card/1/query/json"]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_cached_session_is_refreshed() -> anyhow::Result<()> {
    let s = setup();
    s.store.set(
        &session_cache_key("test@test.com", ENDPOINT),
        "expired",
        SESSION_TTL,
    )?;

    let artifact = s.pipeline.export(1, None, &options()).await?;
    assert_eq!(artifact.row_count, 5);
    assert_eq!(
        s.bi.calls(),
        [
            "GET /api/card/1",
            "POST /api/session",
            "GET /api/card/1",
            "POST /api/card/1/query/json"
        ]
    );
    assert_eq!(
        s.store
            .get(&session_cache_key("test@test.com", ENDPOINT))?
            .as_deref(),
        Some(TOKEN)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_export_is_repeatable() -> anyhow::Result<()> {
    let s = setup();
    let options = ExportOptions {
        use_cache: true,
        ..options()
    };

    let first = s.pipeline.export(1, Some("[]"), &options).await?;
    let first_schema = std::fs::read(s.work_dir.join("1.schema.json"))?;

    let second = s.pipeline.export(1, Some("[]"), &options).await?;
    let second_schema = std::fs::read(s.work_dir.join("1.schema.json"))?;

    assert_eq!(first_schema, second_schema);
    assert_eq!(first.schema, second.schema);
    assert_eq!(first.row_count, second.row_count);
    assert_eq!(
        serde_json::to_string(&first.schema)?,
        serde_json::to_string(&second.schema)?
    );

    let queries = s
        .bi
        .calls()
        .iter()
        .filter(|c| c.ends_with("/query/json"))
        .count();
    assert_eq!(queries, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn max_rows_truncates() -> anyhow::Result<()> {
    let s = setup();
    let options = ExportOptions {
        max_rows: Some(2),
        ..options()
    };

    let artifact = s.pipeline.export(1, None, &options).await?;
    assert_eq!(artifact.row_count, 2);
    assert_eq!(read_records(&artifact.output_path)?.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unmapped_field_name_needs_rename() -> anyhow::Result<()> {
    let s = setup();
    let res = s.pipeline.export(1, None, &ExportOptions::default()).await;

    assert_matches!(res, Err(Error::InvalidFieldName { name }) if name == "年齢");
    let outputs = std::fs::read_dir(&s.work_dir)?
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "avro"))
        .count();
    assert_eq!(outputs, 0);
    Ok(())
}

#[derive(Default)]
struct RecordingImporter {
    loads: Mutex<Vec<(PathBuf, String)>>,
    fail: bool,
}

impl WarehouseImporter for RecordingImporter {
    fn import(&self, path: &Path, table_name: &str) -> Result<ImportResult, ImportError> {
        if self.fail {
            return Err(ImportError(vec!["Provided Schema does not match".into()]));
        }

        self.loads
            .lock()
            .unwrap()
            .push((path.to_owned(), table_name.to_owned()));
        Ok(ImportResult {
            table: format!("project.dataset.{table_name}"),
            job_id: "job_1".to_owned(),
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn hand_off_to_importer() -> anyhow::Result<()> {
    let s = setup();
    let artifact = s.pipeline.export(1, None, &options()).await?;

    let importer = RecordingImporter::default();
    let result = artifact.import_into(&importer)?;
    assert_eq!(result.table, "project.dataset.export_card_1_Peoplesample");
    assert_eq!(
        importer.loads.lock().unwrap().as_slice(),
        [(
            artifact.output_path.clone(),
            "export_card_1_Peoplesample".to_owned()
        )]
    );

    let failing = RecordingImporter {
        fail: true,
        ..Default::default()
    };
    assert_matches!(
        artifact.import_into(&failing),
        Err(ImportError(errors)) if errors.len() == 1
    );
    Ok(())
}
