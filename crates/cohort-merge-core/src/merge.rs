use std::collections::{BTreeMap, BTreeSet};

use crate::infer::infer_column_type;
use crate::{
    Cell, ClinicalError, ColumnSpec, ColumnType, MergeConflict, MergedPatientDataset,
    NormalizedSourceFile, PatientId, RowAlignment,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeKeys {
    pub patient_key: String,
    pub alignment_key: Option<String>,
}

/// Combines one patient's normalized category files into a single dataset.
///
/// Inputs are processed in category-name order, so the result does not
/// depend on the order they were supplied in. When the alignment key is
/// present in at least one category the files are full-outer-joined on it;
/// otherwise they are concatenated column-wise by row position and shorter
/// categories are padded with nulls.
///
/// # Errors
/// Returns [`ClinicalError::Merge`] when no category contributes to the patient.
pub fn merge_patient(
    patient_id: &PatientId,
    mut files: Vec<NormalizedSourceFile>,
    keys: &MergeKeys,
) -> Result<MergedPatientDataset, ClinicalError> {
    if files.is_empty() {
        return Err(ClinicalError::Merge {
            patient_id: patient_id.to_string(),
            detail: "patient has no contributing categories".to_string(),
        });
    }
    files.sort_by(|lhs, rhs| lhs.category.cmp(&rhs.category));

    let alignment_key = keys
        .alignment_key
        .as_deref()
        .filter(|key| files.iter().any(|file| file.column_index(key).is_some()));

    let layout = ColumnLayout::build(patient_id, &files, &keys.patient_key, alignment_key);

    let rows = match alignment_key {
        Some(key) => keyed_rows(patient_id, &files, &layout, key),
        None => positional_rows(patient_id, &files, &layout),
    };

    let schema = layout.schema(&files, &rows, patient_id);

    Ok(MergedPatientDataset {
        patient_id: patient_id.clone(),
        categories: files.iter().map(|file| file.category.clone()).collect(),
        alignment: if alignment_key.is_some() {
            RowAlignment::Keyed
        } else {
            RowAlignment::Positional
        },
        schema,
        rows,
        conflicts: layout.conflicts,
    })
}

struct ColumnLayout {
    // Shared leading columns: the patient key, then the alignment key if keyed.
    shared: Vec<String>,
    columns: Vec<(String, (usize, usize))>,
    conflicts: Vec<MergeConflict>,
}

impl ColumnLayout {
    fn build(
        patient_id: &PatientId,
        files: &[NormalizedSourceFile],
        patient_key: &str,
        alignment_key: Option<&str>,
    ) -> Self {
        let mut shared = vec![patient_key.to_string()];
        shared.extend(alignment_key.map(str::to_string));

        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        let mut columns = Vec::new();
        let mut conflicts = Vec::new();

        for (file_index, file) in files.iter().enumerate() {
            for (column_index, column) in file.schema.iter().enumerate() {
                if shared.contains(&column.name) {
                    continue;
                }
                let folded = column.name.to_ascii_lowercase();
                if let Some(owner) = owners.get(&folded) {
                    tracing::warn!(
                        patient_id = %patient_id,
                        column = %column.name,
                        kept_from = %owner,
                        dropped_from = %file.category,
                        "column name conflict during merge; first category wins"
                    );
                    conflicts.push(MergeConflict {
                        column: column.name.clone(),
                        kept_from: owner.clone(),
                        dropped_from: file.category.clone(),
                    });
                    continue;
                }
                owners.insert(folded, file.category.clone());
                columns.push((column.name.clone(), (file_index, column_index)));
            }
        }

        Self {
            shared,
            columns,
            conflicts,
        }
    }

    fn width(&self) -> usize {
        self.shared.len() + self.columns.len()
    }

    fn empty_row(&self, patient_id: &PatientId) -> Vec<Cell> {
        let mut row = vec![None; self.width()];
        row[0] = Some(patient_id.to_string());
        row
    }

    // Typed columns keep the type discovered at normalization. Shared key
    // columns are re-inferred from the merged values and drift is reported.
    fn schema(
        &self,
        files: &[NormalizedSourceFile],
        rows: &[Vec<Cell>],
        patient_id: &PatientId,
    ) -> Vec<ColumnSpec> {
        let mut schema = Vec::with_capacity(self.width());
        for (index, name) in self.shared.iter().enumerate() {
            let declared: BTreeSet<ColumnType> = files
                .iter()
                .filter_map(|file| file.column_index(name).map(|at| file.schema[at].column_type))
                .collect();
            let column_type = infer_column_type(rows.iter().map(|row| &row[index]));
            if declared.len() > 1 {
                tracing::warn!(
                    patient_id = %patient_id,
                    column = %name,
                    declared = ?declared,
                    merged = column_type.as_str(),
                    "schema drift on shared key column"
                );
            }
            schema.push(ColumnSpec {
                name: name.clone(),
                column_type,
            });
        }
        for (name, (file_index, column_index)) in &self.columns {
            schema.push(ColumnSpec {
                name: name.clone(),
                column_type: files[*file_index].schema[*column_index].column_type,
            });
        }
        schema
    }
}

fn positional_rows(
    patient_id: &PatientId,
    files: &[NormalizedSourceFile],
    layout: &ColumnLayout,
) -> Vec<Vec<Cell>> {
    let row_count = files.iter().map(|file| file.rows.len()).max().unwrap_or(0);
    let offset = layout.shared.len();

    (0..row_count)
        .map(|row_index| {
            let mut row = layout.empty_row(patient_id);
            for (position, (_, (file_index, column_index))) in layout.columns.iter().enumerate() {
                row[offset + position] = files[*file_index]
                    .rows
                    .get(row_index)
                    .and_then(|source| source[*column_index].clone());
            }
            row
        })
        .collect()
}

fn keyed_rows(
    patient_id: &PatientId,
    files: &[NormalizedSourceFile],
    layout: &ColumnLayout,
    alignment_key: &str,
) -> Vec<Vec<Cell>> {
    let offset = layout.shared.len();
    let mut keyed: BTreeMap<&str, Vec<Vec<usize>>> = BTreeMap::new();
    // (file index, row index) for rows that cannot take part in the join.
    let mut unkeyed: Vec<(usize, usize)> = Vec::new();
    let participating: Vec<Option<usize>> = files
        .iter()
        .map(|file| file.column_index(alignment_key))
        .collect();

    for (file_index, file) in files.iter().enumerate() {
        for (row_index, row) in file.rows.iter().enumerate() {
            let Some(key) = participating[file_index].and_then(|at| row[at].as_deref()) else {
                unkeyed.push((file_index, row_index));
                continue;
            };
            keyed
                .entry(key)
                .or_insert_with(|| vec![Vec::new(); files.len()])[file_index]
                .push(row_index);
        }
    }

    let fill = |row: &mut Vec<Cell>, picks: &[(usize, usize)]| {
        for (position, (_, (file_index, column_index))) in layout.columns.iter().enumerate() {
            if let Some((_, row_index)) = picks.iter().find(|(picked, _)| picked == file_index) {
                row[offset + position] = files[*file_index].rows[*row_index][*column_index].clone();
            }
        }
    };

    let mut rows = Vec::new();
    for (key, per_file) in &keyed {
        // A category with no row for this key contributes nulls, so only
        // categories with matches widen the product.
        let mut combinations: Vec<Vec<(usize, usize)>> = vec![Vec::new()];
        for (file_index, matches) in per_file.iter().enumerate() {
            if matches.is_empty() {
                continue;
            }
            combinations = combinations
                .into_iter()
                .flat_map(|prefix| {
                    matches.iter().map(move |row_index| {
                        let mut next = prefix.clone();
                        next.push((file_index, *row_index));
                        next
                    })
                })
                .collect();
        }
        for picks in combinations {
            let mut row = layout.empty_row(patient_id);
            row[1] = Some((*key).to_string());
            fill(&mut row, &picks);
            rows.push(row);
        }
    }

    for (file_index, row_index) in unkeyed {
        let mut row = layout.empty_row(patient_id);
        fill(&mut row, &[(file_index, row_index)]);
        rows.push(row);
    }

    rows
}
