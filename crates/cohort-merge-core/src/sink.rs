use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Cell, ClinicalError, ColumnSpec, MergedPatientDataset, TableName};

/// Destination relational store for per-patient tables.
///
/// Implementations decide transaction scope; [`load_dataset`] only issues the
/// statements for one table.
pub trait RelationalSink {
    fn create_or_replace_table(
        &mut self,
        table: &TableName,
        schema: &[ColumnSpec],
    ) -> anyhow::Result<()>;

    /// Inserts `rows` and returns the number written.
    fn bulk_insert(
        &mut self,
        table: &TableName,
        schema: &[ColumnSpec],
        rows: &[Vec<Cell>],
    ) -> anyhow::Result<usize>;

    fn row_count(&mut self, table: &TableName) -> anyhow::Result<usize>;

    /// Runs a read query, giving up once `timeout` elapses.
    fn query(&mut self, sql: &str, timeout: Duration) -> anyhow::Result<Vec<Vec<Cell>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadedTable {
    pub table_name: TableName,
    pub row_count: usize,
    pub column_count: usize,
}

/// Creates (or replaces) the dataset's table and loads every row, then checks
/// the stored row count against the dataset.
///
/// # Errors
/// Returns [`ClinicalError::Materialization`] on any sink failure or count
/// mismatch. The caller owns rollback.
pub fn load_dataset<S>(sink: &mut S, dataset: &MergedPatientDataset) -> Result<LoadedTable, ClinicalError>
where
    S: RelationalSink + ?Sized,
{
    let table = dataset.table_name();
    let failure = |detail: String| ClinicalError::Materialization {
        patient_id: dataset.patient_id.to_string(),
        detail,
    };

    sink.create_or_replace_table(&table, &dataset.schema)
        .map_err(|err| failure(format!("create table {table}: {err:#}")))?;
    let inserted = sink
        .bulk_insert(&table, &dataset.schema, &dataset.rows)
        .map_err(|err| failure(format!("insert into {table}: {err:#}")))?;
    let stored = sink
        .row_count(&table)
        .map_err(|err| failure(format!("count {table}: {err:#}")))?;

    if inserted != dataset.row_count() || stored != dataset.row_count() {
        return Err(failure(format!(
            "table {table} holds {stored} rows after inserting {inserted}, expected {}",
            dataset.row_count()
        )));
    }

    Ok(LoadedTable {
        table_name: table,
        row_count: stored,
        column_count: dataset.schema.len(),
    })
}

/// Double-quotes an SQL identifier, doubling embedded quotes.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::*;

    /// In-memory sink that records tables and answers queries from a script.
    #[derive(Debug, Default)]
    pub(crate) struct MemorySink {
        pub tables: BTreeMap<String, Vec<Vec<Cell>>>,
        pub fail_insert_for: Option<String>,
        pub failing_sql: Vec<String>,
        pub empty_sql: Vec<String>,
        pub queries: Vec<String>,
    }

    impl RelationalSink for MemorySink {
        fn create_or_replace_table(
            &mut self,
            table: &TableName,
            _schema: &[ColumnSpec],
        ) -> anyhow::Result<()> {
            self.tables.insert(table.to_string(), Vec::new());
            Ok(())
        }

        fn bulk_insert(
            &mut self,
            table: &TableName,
            _schema: &[ColumnSpec],
            rows: &[Vec<Cell>],
        ) -> anyhow::Result<usize> {
            if self.fail_insert_for.as_deref() == Some(table.as_str()) {
                anyhow::bail!("disk full");
            }
            let stored = self.tables.entry(table.to_string()).or_default();
            stored.extend(rows.iter().cloned());
            Ok(rows.len())
        }

        fn row_count(&mut self, table: &TableName) -> anyhow::Result<usize> {
            self.tables
                .get(table.as_str())
                .map(Vec::len)
                .ok_or_else(|| anyhow::anyhow!("no such table: {table}"))
        }

        fn query(&mut self, sql: &str, _timeout: Duration) -> anyhow::Result<Vec<Vec<Cell>>> {
            self.queries.push(sql.to_string());
            if self.failing_sql.iter().any(|needle| sql.contains(needle)) {
                anyhow::bail!("no such column in {sql}");
            }
            if self.empty_sql.iter().any(|needle| sql.contains(needle)) {
                return Ok(Vec::new());
            }
            Ok(vec![vec![Some("1".to_string())]])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use crate::{ColumnType, PatientId, RowAlignment};

    fn dataset() -> MergedPatientDataset {
        let patient_id = match PatientId::parse("P1") {
            Ok(value) => value,
            Err(err) => panic!("fixture id: {err}"),
        };
        MergedPatientDataset {
            patient_id,
            categories: vec!["labs".to_string()],
            alignment: RowAlignment::Positional,
            schema: vec![ColumnSpec {
                name: "PATIENT".to_string(),
                column_type: ColumnType::Text,
            }],
            rows: vec![vec![Some("P1".to_string())], vec![Some("P1".to_string())]],
            conflicts: Vec::new(),
        }
    }

    #[test]
    fn load_dataset_verifies_row_count() {
        let mut sink = MemorySink::default();
        let loaded = match load_dataset(&mut sink, &dataset()) {
            Ok(value) => value,
            Err(err) => panic!("load failed: {err}"),
        };
        assert_eq!(loaded.row_count, 2);
        assert_eq!(loaded.column_count, 1);
        assert_eq!(loaded.table_name.as_str(), "patient_5031");
    }

    #[test]
    fn sink_failures_become_materialization_errors() {
        let mut sink = MemorySink {
            fail_insert_for: Some("patient_5031".to_string()),
            ..MemorySink::default()
        };
        let err = match load_dataset(&mut sink, &dataset()) {
            Ok(_) => panic!("expected failure"),
            Err(err) => err,
        };
        assert!(matches!(err, ClinicalError::Materialization { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("labs_VALUE"), "\"labs_VALUE\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
