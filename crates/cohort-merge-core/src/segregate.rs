use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Cell, ClinicalError, PatientId, RawSourceFile};

/// A category discovered under the input root: either `{category}.csv` or a
/// `{category}/` directory of CSV parts sharing one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySource {
    pub category: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryPartition {
    pub total_rows: usize,
    pub assigned_rows: usize,
    pub dropped_rows: usize,
}

#[derive(Debug)]
pub struct RejectedCategory {
    pub category: String,
    pub error: ClinicalError,
}

/// Per-patient row groups plus the bookkeeping needed to prove completeness.
#[derive(Debug, Default)]
pub struct Segregation {
    pub patients: BTreeMap<PatientId, BTreeMap<String, RawSourceFile>>,
    pub partitions: BTreeMap<String, CategoryPartition>,
    pub rejected: Vec<RejectedCategory>,
}

impl Segregation {
    #[must_use]
    pub fn dropped_rows(&self) -> usize {
        self.partitions
            .values()
            .map(|partition| partition.dropped_rows)
            .sum()
    }
}

/// Lists category sources under `root`, sorted by category name.
///
/// # Errors
/// Returns [`ClinicalError::Io`] when the root or a category directory cannot
/// be listed.
pub fn discover_sources(root: &Path) -> Result<Vec<CategorySource>, ClinicalError> {
    let mut sources = BTreeMap::new();
    for path in sorted_entries(root)? {
        if path.is_dir() {
            let files: Vec<PathBuf> = sorted_entries(&path)?
                .into_iter()
                .filter(|file| is_csv(file))
                .collect();
            if files.is_empty() {
                continue;
            }
            if let Some(category) = file_stem(&path) {
                sources
                    .entry(category)
                    .or_insert_with(Vec::new)
                    .extend(files);
            }
        } else if is_csv(&path) {
            if let Some(category) = file_stem(&path) {
                sources.entry(category).or_insert_with(Vec::new).push(path);
            }
        }
    }
    Ok(sources
        .into_iter()
        .map(|(category, files)| CategorySource { category, files })
        .collect())
}

/// Reads every CSV part of a category into one raw file.
///
/// # Errors
/// Returns [`ClinicalError::Csv`] or [`ClinicalError::Io`] when a part cannot
/// be read, and [`ClinicalError::Schema`] when parts disagree on the header.
pub fn read_category(source: &CategorySource) -> Result<RawSourceFile, ClinicalError> {
    let mut merged: Option<RawSourceFile> = None;
    for path in &source.files {
        let part = read_csv(&source.category, path)?;
        match merged.as_mut() {
            None => merged = Some(part),
            Some(existing) => {
                if existing.columns != part.columns {
                    return Err(ClinicalError::Schema {
                        category: source.category.clone(),
                        detail: format!("{} header differs from earlier parts", path.display()),
                    });
                }
                existing.rows.extend(part.rows);
            }
        }
    }
    merged.ok_or_else(|| ClinicalError::Schema {
        category: source.category.clone(),
        detail: "category has no CSV files".to_string(),
    })
}

/// Reads one CSV file with a header row. Fields are trimmed and empty fields
/// become nulls.
///
/// # Errors
/// Returns [`ClinicalError::Csv`] on unreadable or ragged input.
pub fn read_csv(category: &str, path: &Path) -> Result<RawSourceFile, ClinicalError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| ClinicalError::csv(path, err))?;

    let columns = reader
        .headers()
        .map_err(|err| ClinicalError::csv(path, err))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ClinicalError::csv(path, err))?;
        rows.push(
            record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect::<Vec<Cell>>(),
        );
    }

    Ok(RawSourceFile::new(category, columns, rows))
}

/// Partitions category files into per-patient groups.
///
/// `source_key` names the column carrying the patient identifier for a
/// category. A category without that column is rejected whole; a row with a
/// missing or malformed identifier is dropped and counted. Row order inside
/// each group follows the input, so the partition is stable.
pub fn segregate<F>(files: Vec<RawSourceFile>, source_key: F) -> Segregation
where
    F: Fn(&str) -> String,
{
    let mut segregation = Segregation::default();

    for file in files {
        let key_column = source_key(&file.category);
        let Some(key_index) = file.column_index(&key_column) else {
            tracing::warn!(
                category = %file.category,
                key_column = %key_column,
                "skipping category without patient key column"
            );
            segregation.rejected.push(RejectedCategory {
                category: file.category.clone(),
                error: ClinicalError::Schema {
                    category: file.category,
                    detail: format!("expected patient key column {key_column} is absent"),
                },
            });
            continue;
        };

        let RawSourceFile {
            category,
            columns,
            rows,
        } = file;
        let mut stats = CategoryPartition {
            total_rows: rows.len(),
            ..CategoryPartition::default()
        };

        for (row_index, row) in rows.into_iter().enumerate() {
            let raw_id = row.get(key_index).and_then(Option::as_deref).unwrap_or("");
            let patient_id = match PatientId::parse(raw_id) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(category = %category, row_index, error = %err, "dropping row");
                    stats.dropped_rows += 1;
                    continue;
                }
            };
            stats.assigned_rows += 1;
            segregation
                .patients
                .entry(patient_id)
                .or_default()
                .entry(category.clone())
                .or_insert_with(|| RawSourceFile::new(category.clone(), columns.clone(), Vec::new()))
                .rows
                .push(row);
        }

        if stats.dropped_rows > 0 {
            tracing::warn!(
                category = %category,
                dropped_rows = stats.dropped_rows,
                "rows without a usable patient identifier were dropped"
            );
        }
        segregation.partitions.insert(category, stats);
    }

    segregation
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ClinicalError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|err| ClinicalError::io(dir, err))? {
        entries.push(entry.map_err(|err| ClinicalError::io(dir, err))?.path());
    }
    entries.sort();
    Ok(entries)
}

fn is_csv(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(values: &[&str]) -> Vec<Cell> {
        values
            .iter()
            .map(|value| (!value.is_empty()).then(|| (*value).to_string()))
            .collect()
    }

    fn labs(rows: Vec<Vec<Cell>>) -> RawSourceFile {
        RawSourceFile::new(
            "labs",
            vec!["PATIENT".to_string(), "VALUE".to_string()],
            rows,
        )
    }

    fn patient_key(_: &str) -> String {
        "PATIENT".to_string()
    }

    #[test]
    fn rows_are_grouped_by_patient_and_bad_ids_are_dropped() {
        let file = labs(vec![
            row(&["p1", "1"]),
            row(&["p2", "2"]),
            row(&["", "3"]),
            row(&["p1", "4"]),
            row(&["../x", "5"]),
        ]);
        let segregation = segregate(vec![file], patient_key);

        assert_eq!(segregation.patients.len(), 2);
        let Ok(p1) = PatientId::parse("p1") else {
            panic!("fixture id must parse");
        };
        let p1_rows = &segregation.patients[&p1]["labs"].rows;
        assert_eq!(p1_rows, &vec![row(&["p1", "1"]), row(&["p1", "4"])]);

        let stats = segregation.partitions["labs"];
        assert_eq!(stats.total_rows, 5);
        assert_eq!(stats.assigned_rows, 3);
        assert_eq!(stats.dropped_rows, 2);
    }

    #[test]
    fn category_without_key_column_is_rejected_not_merged() {
        let file = RawSourceFile::new("devices", vec!["CODE".to_string()], vec![row(&["1"])]);
        let segregation = segregate(vec![file], patient_key);
        assert!(segregation.patients.is_empty());
        assert_eq!(segregation.rejected.len(), 1);
        assert!(matches!(
            segregation.rejected[0].error,
            ClinicalError::Schema { .. }
        ));
    }

    #[test]
    fn discovers_flat_files_and_category_directories() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("tempdir: {err}"),
        };
        let write = |path: PathBuf, body: &str| {
            if let Some(parent) = path.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    panic!("mkdir: {err}");
                }
            }
            if let Err(err) = std::fs::write(path, body) {
                panic!("write: {err}");
            }
        };
        write(dir.path().join("allergies.csv"), "PATIENT,CODE\np1,1\n");
        write(dir.path().join("notes.txt"), "ignored");
        write(dir.path().join("observations/part-1.csv"), "PATIENT,VALUE\np1, 7 \n");
        write(dir.path().join("observations/part-2.csv"), "PATIENT,VALUE\np2,\n");

        let sources = match discover_sources(dir.path()) {
            Ok(value) => value,
            Err(err) => panic!("discover: {err}"),
        };
        let categories: Vec<&str> = sources.iter().map(|s| s.category.as_str()).collect();
        assert_eq!(categories, vec!["allergies", "observations"]);

        let observations = match read_category(&sources[1]) {
            Ok(value) => value,
            Err(err) => panic!("read: {err}"),
        };
        assert_eq!(observations.rows, vec![row(&["p1", "7"]), row(&["p2", ""])]);
    }

    proptest! {
        #[test]
        fn prop_partition_is_complete_and_stable(ids in prop::collection::vec(prop::sample::select(vec!["p1", "p2", "p3", "", " ", "a/b"]), 0..60)) {
            let rows: Vec<Vec<Cell>> = ids
                .iter()
                .enumerate()
                .map(|(index, id)| row(&[*id, index.to_string().as_str()]))
                .collect();
            let first = segregate(vec![labs(rows.clone())], patient_key);
            let second = segregate(vec![labs(rows)], patient_key);

            let grouped: usize = first
                .patients
                .values()
                .map(|categories| categories.get("labs").map_or(0, |file| file.rows.len()))
                .sum();
            let stats = first.partitions.get("labs").copied().unwrap_or_default();
            prop_assert_eq!(grouped + stats.dropped_rows, ids.len());
            prop_assert_eq!(stats.total_rows, ids.len());
            prop_assert_eq!(&first.patients, &second.patients);
        }
    }
}
