#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cohort_merge_core::{
    encode_merged_csv, format_rfc3339, hash_bytes, load_dataset, now_utc, quote_identifier, Cell,
    ColumnSpec, ColumnType, DatasetVersion, MergedPatientDataset, PatientId, RelationalSink,
    TableName,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

const CATALOG_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CATALOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS patient_tables (
  patient_id TEXT PRIMARY KEY,
  table_name TEXT NOT NULL UNIQUE,
  row_count INTEGER NOT NULL CHECK (row_count >= 0),
  column_count INTEGER NOT NULL CHECK (column_count >= 1),
  content_sha256 TEXT NOT NULL,
  dataset_version INTEGER CHECK (dataset_version >= 1 OR dataset_version IS NULL),
  materialized_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patient_table_columns (
  table_name TEXT NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 0),
  column_name TEXT NOT NULL,
  column_type TEXT NOT NULL CHECK (column_type IN ('integer', 'real', 'date', 'text')),
  PRIMARY KEY (table_name, ordinal),
  FOREIGN KEY (table_name) REFERENCES patient_tables(table_name) ON DELETE CASCADE
);
";

/// One materialized patient table as recorded in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub patient_id: PatientId,
    pub table_name: TableName,
    pub row_count: usize,
    pub column_count: usize,
    pub content_sha256: String,
    pub dataset_version: Option<u32>,
    pub materialized_at: String,
}

pub struct SqlitePatientStore {
    conn: Connection,
}

impl SqlitePatientStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CATALOG_V1)
            .context("failed to apply table catalog schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CATALOG_MIGRATION_VERSION, now],
            )
            .context("failed to register table catalog migration")?;

        Ok(())
    }

    /// Liveness check for the destination store: the connection answers and
    /// the table catalog is readable.
    pub fn ping(&self) -> Result<()> {
        let value: i64 = self
            .conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("sqlite liveness check failed")?;
        if value != 1 {
            bail!("sqlite liveness check returned {value}");
        }
        self.conn
            .query_row("SELECT COUNT(*) FROM patient_tables", [], |row| row.get::<_, i64>(0))
            .context("patient table catalog is not readable")?;
        Ok(())
    }

    /// Replaces the patient's table and catalog entry in one transaction.
    /// On any error the transaction is rolled back and the previous table and
    /// catalog entry remain as they were.
    pub fn materialize(
        &mut self,
        dataset: &MergedPatientDataset,
        version: Option<&DatasetVersion>,
    ) -> Result<CatalogEntry> {
        let content_sha256 = match version {
            Some(version) => version.sha256.clone(),
            None => hash_bytes(&encode_merged_csv(dataset)?),
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start materialization transaction")?;

        let loaded = load_dataset(&mut SqliteSink::new(&tx), dataset)?;

        let entry = CatalogEntry {
            patient_id: dataset.patient_id.clone(),
            table_name: loaded.table_name,
            row_count: loaded.row_count,
            column_count: loaded.column_count,
            content_sha256,
            dataset_version: version.map(|version| version.version),
            materialized_at: format_rfc3339(now_utc())?,
        };

        tx.execute(
            "INSERT INTO patient_tables(
                patient_id, table_name, row_count, column_count, content_sha256,
                dataset_version, materialized_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(patient_id) DO UPDATE SET
                table_name = excluded.table_name,
                row_count = excluded.row_count,
                column_count = excluded.column_count,
                content_sha256 = excluded.content_sha256,
                dataset_version = excluded.dataset_version,
                materialized_at = excluded.materialized_at",
            params![
                entry.patient_id.as_str(),
                entry.table_name.as_str(),
                to_sql_count(entry.row_count)?,
                to_sql_count(entry.column_count)?,
                entry.content_sha256,
                entry.dataset_version.map(i64::from),
                entry.materialized_at,
            ],
        )
        .context("failed to upsert patient_tables row")?;

        tx.execute(
            "DELETE FROM patient_table_columns WHERE table_name = ?1",
            params![entry.table_name.as_str()],
        )
        .context("failed to clear catalog columns")?;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO patient_table_columns(table_name, ordinal, column_name, column_type)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare catalog column insert")?;
            for (ordinal, column) in dataset.schema.iter().enumerate() {
                insert
                    .execute(params![
                        entry.table_name.as_str(),
                        to_sql_count(ordinal)?,
                        column.name,
                        column.column_type.as_str(),
                    ])
                    .context("failed to insert catalog column")?;
            }
        }

        tx.commit()
            .context("failed to commit materialization transaction")?;

        tracing::info!(
            patient_id = %entry.patient_id,
            table = %entry.table_name,
            rows = entry.row_count,
            columns = entry.column_count,
            "materialized patient table"
        );
        Ok(entry)
    }

    pub fn list_tables(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT patient_id, table_name, row_count, column_count, content_sha256,
                        dataset_version, materialized_at
                 FROM patient_tables
                 ORDER BY patient_id ASC",
            )
            .context("failed to prepare catalog query")?;
        let rows = stmt
            .query_map([], parse_catalog_row)
            .context("failed to query catalog")?;
        collect_rows(rows)
    }

    pub fn catalog_entry(&self, patient_id: &PatientId) -> Result<Option<CatalogEntry>> {
        self.conn
            .query_row(
                "SELECT patient_id, table_name, row_count, column_count, content_sha256,
                        dataset_version, materialized_at
                 FROM patient_tables
                 WHERE patient_id = ?1",
                params![patient_id.as_str()],
                parse_catalog_row,
            )
            .optional()
            .context("failed to query catalog entry")
    }

    pub fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnSpec>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT column_name, column_type FROM patient_table_columns
                 WHERE table_name = ?1 ORDER BY ordinal ASC",
            )
            .context("failed to prepare catalog column query")?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| {
                let name: String = row.get(0)?;
                let raw_type: String = row.get(1)?;
                let column_type = ColumnType::parse(&raw_type).ok_or_else(|| {
                    to_sql_error(format!("unknown column type {raw_type}"))
                })?;
                Ok(ColumnSpec { name, column_type })
            })
            .context("failed to query catalog columns")?;
        collect_rows(rows)
    }

    pub fn table_row_count(&self, table: &TableName) -> Result<usize> {
        SqliteSink::new(&self.conn).row_count(table)
    }

    /// Sink over the store's connection, used by the query harness.
    #[must_use]
    pub fn sink(&self) -> SqliteSink<'_> {
        SqliteSink::new(&self.conn)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// [`RelationalSink`] over a borrowed connection or transaction.
pub struct SqliteSink<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSink<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn read_rows(&self, sql: &str) -> Result<Vec<Vec<Cell>>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare query: {sql}"))?;
        if !stmt.readonly() {
            bail!("only read-only statements may be run as queries");
        }
        let width = stmt.column_count();
        let mut rows = stmt.query([]).context("failed to execute query")?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next().context("failed to step query")? {
            let mut cells = Vec::with_capacity(width);
            for index in 0..width {
                cells.push(cell_from_sql(row.get_ref(index)?));
            }
            collected.push(cells);
        }
        Ok(collected)
    }
}

impl RelationalSink for SqliteSink<'_> {
    fn create_or_replace_table(&mut self, table: &TableName, schema: &[ColumnSpec]) -> Result<()> {
        if schema.is_empty() {
            bail!("table {table} needs at least one column");
        }
        let columns = schema
            .iter()
            .map(|column| {
                format!(
                    "{} {}",
                    quote_identifier(&column.name),
                    column.column_type.sql_type()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let quoted = quote_identifier(table.as_str());
        self.conn
            .execute_batch(&format!(
                "DROP TABLE IF EXISTS {quoted}; CREATE TABLE {quoted} ({columns});"
            ))
            .with_context(|| format!("failed to create table {table}"))?;
        Ok(())
    }

    fn bulk_insert(
        &mut self,
        table: &TableName,
        schema: &[ColumnSpec],
        rows: &[Vec<Cell>],
    ) -> Result<usize> {
        let columns = schema
            .iter()
            .map(|column| quote_identifier(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=schema.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                quote_identifier(table.as_str())
            ))
            .with_context(|| format!("failed to prepare insert into {table}"))?;

        for (row_index, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                bail!(
                    "row {row_index} has {} cells, table {table} has {} columns",
                    row.len(),
                    schema.len()
                );
            }
            let values = row
                .iter()
                .zip(schema)
                .map(|(cell, column)| sql_value(cell.as_deref(), column.column_type));
            stmt.execute(rusqlite::params_from_iter(values))
                .with_context(|| format!("failed to insert row {row_index} into {table}"))?;
        }
        Ok(rows.len())
    }

    fn row_count(&mut self, table: &TableName) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_identifier(table.as_str())),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count rows in {table}"))?;
        usize::try_from(count).map_err(|_| anyhow!("negative row count {count} for {table}"))
    }

    /// Runs a read-only query. A watchdog thread interrupts the connection
    /// once `timeout` elapses.
    fn query(&mut self, sql: &str, timeout: Duration) -> Result<Vec<Vec<Cell>>> {
        let handle = self.conn.get_interrupt_handle();
        let (done, finished) = mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if matches!(finished.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)) {
                handle.interrupt();
                true
            } else {
                false
            }
        });

        let outcome = self.read_rows(sql);
        drop(done);
        let interrupted = watchdog.join().unwrap_or(false);

        match outcome {
            Err(err) if interrupted => Err(err.context(format!(
                "query interrupted after {} ms timeout",
                timeout.as_millis()
            ))),
            other => other,
        }
    }
}

fn sql_value(cell: Option<&str>, column_type: ColumnType) -> Value {
    let Some(raw) = cell else {
        return Value::Null;
    };
    match column_type {
        ColumnType::Integer => raw
            .parse::<i64>()
            .map_or_else(|_| Value::Text(raw.to_string()), Value::Integer),
        ColumnType::Real => raw
            .parse::<f64>()
            .map_or_else(|_| Value::Text(raw.to_string()), Value::Real),
        ColumnType::Date | ColumnType::Text => Value::Text(raw.to_string()),
    }
}

fn cell_from_sql(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(hex::encode(bytes)),
    }
}

fn parse_catalog_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let raw_patient_id: String = row.get(0)?;
    let patient_id = PatientId::parse(&raw_patient_id).map_err(|err| to_sql_error(err.to_string()))?;
    let stored_table: String = row.get(1)?;
    let table_name = TableName::for_patient(&patient_id);
    if stored_table != table_name.as_str() {
        return Err(to_sql_error(format!(
            "catalog table {stored_table} does not belong to patient {patient_id}"
        )));
    }
    let row_count: i64 = row.get(2)?;
    let column_count: i64 = row.get(3)?;
    let dataset_version: Option<i64> = row.get(5)?;

    Ok(CatalogEntry {
        patient_id,
        table_name,
        row_count: usize::try_from(row_count).map_err(|err| to_sql_error(err.to_string()))?,
        column_count: usize::try_from(column_count).map_err(|err| to_sql_error(err.to_string()))?,
        content_sha256: row.get(4)?,
        dataset_version: dataset_version
            .map(u32::try_from)
            .transpose()
            .map_err(|err| to_sql_error(err.to_string()))?,
        materialized_at: row.get(6)?,
    })
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count {value} does not fit in sqlite INTEGER"))
}

fn to_sql_error(detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, detail)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use cohort_merge_core::{
        merge_patient, normalize, KeyColumns, MergeKeys, RawSourceFile, RowAlignment,
    };

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqlitePatientStore {
        let store = must(SqlitePatientStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn patient(id: &str) -> PatientId {
        match PatientId::parse(id) {
            Ok(value) => value,
            Err(err) => panic!("fixture id: {err}"),
        }
    }

    fn raw(category: &str, columns: &[&str], rows: &[&[&str]]) -> RawSourceFile {
        RawSourceFile::new(
            category,
            columns.iter().map(|column| (*column).to_string()).collect(),
            rows.iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| (!cell.is_empty()).then(|| (*cell).to_string()))
                        .collect()
                })
                .collect(),
        )
    }

    /// labs and meds for P1 joined on KEY: k1/k2 from labs, k3/k4 from meds.
    fn p1_dataset() -> MergedPatientDataset {
        let keys = KeyColumns::uniform("PATIENT").with_alignment_key("KEY");
        let labs = raw(
            "labs",
            &["PATIENT", "KEY", "VALUE"],
            &[&["P1", "k1", "7.5"], &["P1", "k2", "6.1"]],
        );
        let meds = raw(
            "meds",
            &["PATIENT", "KEY", "DOSE"],
            &[&["P1", "k3", "10"], &["P1", "k4", "20"]],
        );
        let files = vec![
            match normalize(&labs, &keys) {
                Ok(value) => value,
                Err(err) => panic!("normalize: {err}"),
            },
            match normalize(&meds, &keys) {
                Ok(value) => value,
                Err(err) => panic!("normalize: {err}"),
            },
        ];
        let merge_keys = MergeKeys {
            patient_key: "PATIENT".to_string(),
            alignment_key: Some("KEY".to_string()),
        };
        match merge_patient(&patient("P1"), files, &merge_keys) {
            Ok(value) => value,
            Err(err) => panic!("merge: {err}"),
        }
    }

    /// A published version lets `materialize` skip content hashing, so
    /// malformed rows reach the insert inside the transaction.
    fn published(dataset: &MergedPatientDataset) -> DatasetVersion {
        DatasetVersion {
            patient_id: dataset.patient_id.clone(),
            version: 1,
            sha256: "0".repeat(64),
            path: PathBuf::from("v000001.csv"),
            reused: false,
        }
    }

    #[test]
    fn materialized_row_count_matches_distinct_alignment_keys() {
        let mut store = fixture_store();
        let dataset = p1_dataset();
        assert_eq!(dataset.alignment, RowAlignment::Keyed);

        let entry = must(store.materialize(&dataset, None));
        assert_eq!(entry.row_count, 4);
        assert_eq!(must(store.table_row_count(&entry.table_name)), 4);
        assert_eq!(entry.table_name.as_str(), "patient_5031");

        let columns = must(store.table_columns(&entry.table_name));
        let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
        assert_eq!(names, vec!["PATIENT", "KEY", "labs_VALUE", "meds_DOSE"]);
        assert_eq!(columns[2].column_type, ColumnType::Real);

        let listed = must(store.list_tables());
        assert_eq!(listed, vec![entry]);
    }

    #[test]
    fn typed_columns_round_trip_through_queries() {
        let mut store = fixture_store();
        let entry = must(store.materialize(&p1_dataset(), None));
        let rows = must(store.sink().query(
            &format!(
                "SELECT SUM(meds_DOSE), typeof(labs_VALUE) FROM {} WHERE \"KEY\" = 'k1'",
                quote_identifier(entry.table_name.as_str())
            ),
            Duration::from_secs(5),
        ));
        assert_eq!(rows, vec![vec![None, Some("real".to_string())]]);
    }

    #[test]
    fn failed_materialization_rolls_back_and_keeps_prior_table() {
        let mut store = fixture_store();
        let good = p1_dataset();
        let mut previous = good.clone();
        previous.rows.truncate(3);
        let entry = must(store.materialize(&previous, None));
        assert_eq!(entry.row_count, 3);

        let mut broken = good;
        broken.rows[2].pop();
        let err = match store.materialize(&broken, Some(&published(&broken))) {
            Ok(_) => panic!("short row must fail materialization"),
            Err(err) => err,
        };
        let rendered = format!("{err:#}");
        assert!(rendered.contains("row 2 has 3 cells"), "{rendered}");
        assert!(rendered.contains("patient_5031"), "{rendered}");

        assert_eq!(must(store.table_row_count(&entry.table_name)), 3);
        let catalog = must(store.catalog_entry(&patient("P1")));
        assert_eq!(catalog.map(|entry| entry.row_count), Some(3));
    }

    #[test]
    fn failed_first_materialization_leaves_no_table() {
        let mut store = fixture_store();
        let mut broken = p1_dataset();
        broken.patient_id = patient("P2");
        broken.rows[1].clear();
        let err = match store.materialize(&broken, Some(&published(&broken))) {
            Ok(_) => panic!("empty row must fail materialization"),
            Err(err) => err,
        };
        let rendered = format!("{err:#}");
        assert!(rendered.contains("row 1 has 0 cells"), "{rendered}");
        assert!(must(store.list_tables()).is_empty());
        assert!(store
            .table_row_count(&TableName::for_patient(&patient("P2")))
            .is_err());
    }

    #[test]
    fn rematerialization_replaces_table_and_catalog_entry() {
        let mut store = fixture_store();
        let dataset = p1_dataset();
        let first = must(store.materialize(&dataset, None));
        let second = must(store.materialize(&dataset, None));
        assert_eq!(first.content_sha256, second.content_sha256);
        assert_eq!(must(store.table_row_count(&second.table_name)), 4);
        assert_eq!(must(store.list_tables()).len(), 1);
    }

    #[test]
    fn runaway_query_is_interrupted_by_timeout() {
        let store = fixture_store();
        let result = store.sink().query(
            "WITH RECURSIVE counter(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM counter)
             SELECT COUNT(*) FROM counter",
            Duration::from_millis(50),
        );
        let err = match result {
            Ok(_) => panic!("unbounded query must be interrupted"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("timeout"));
        must(store.ping());
    }

    #[test]
    fn write_statements_are_rejected_as_queries() {
        let mut store = fixture_store();
        let entry = must(store.materialize(&p1_dataset(), None));
        let result = store.sink().query(
            &format!("DELETE FROM {}", quote_identifier(entry.table_name.as_str())),
            Duration::from_secs(5),
        );
        assert!(result.is_err());
        assert_eq!(must(store.table_row_count(&entry.table_name)), 4);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_catalog() {
        let mut store = fixture_store();
        let entry = must(store.materialize(&p1_dataset(), None));
        must(store.migrate());
        assert_eq!(must(store.list_tables()), vec![entry]);

        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("count migrations: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn file_backed_store_records_dataset_version() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("tempdir: {err}"),
        };
        let dataset = p1_dataset();
        let version = DatasetVersion {
            patient_id: dataset.patient_id.clone(),
            version: 3,
            sha256: "abc".to_string(),
            path: dir.path().join("v000003.csv"),
            reused: false,
        };
        let mut store = must(SqlitePatientStore::open(&dir.path().join("tables.sqlite3")));
        must(store.migrate());
        let entry = must(store.materialize(&dataset, Some(&version)));
        assert_eq!(entry.dataset_version, Some(3));
        assert_eq!(entry.content_sha256, "abc");
        must(store.ping());
    }
}
