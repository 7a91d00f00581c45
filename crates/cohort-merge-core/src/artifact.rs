use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::infer::infer_schema;
use crate::{hash_bytes, Cell, ClinicalError, MergedPatientDataset, PatientId, RowAlignment};

pub const MERGED_FILE_NAME: &str = "merged_patient_data.csv";

/// Renders a merged dataset as UTF-8 CSV with a header row; nulls are empty
/// fields.
///
/// # Errors
/// Returns [`ClinicalError::Csv`] if the writer rejects a record.
pub fn encode_merged_csv(dataset: &MergedPatientDataset) -> Result<Vec<u8>, ClinicalError> {
    let label = format!("<merged {}>", dataset.patient_id);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(dataset.column_names())
        .map_err(|err| ClinicalError::csv(&label, err))?;
    for row in &dataset.rows {
        writer
            .write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))
            .map_err(|err| ClinicalError::csv(&label, err))?;
    }
    writer
        .into_inner()
        .map_err(|err| ClinicalError::io(&label, err.into_error()))
}

/// Dataset facts the CSV cannot carry, stored next to each version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetManifest {
    pub categories: Vec<String>,
    pub alignment: RowAlignment,
}

impl DatasetManifest {
    #[must_use]
    pub fn of(dataset: &MergedPatientDataset) -> Self {
        Self {
            categories: dataset.categories.clone(),
            alignment: dataset.alignment,
        }
    }
}

/// Reads a previously published merged CSV back into a dataset. Column types
/// are inferred again from the values; categories and alignment come from the
/// version's manifest.
///
/// # Errors
/// Returns [`ClinicalError::Csv`] on malformed CSV.
pub fn decode_merged_csv(
    patient_id: &PatientId,
    bytes: &[u8],
    manifest: &DatasetManifest,
) -> Result<MergedPatientDataset, ClinicalError> {
    let label = format!("<merged {patient_id}>");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|err| ClinicalError::csv(&label, err))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ClinicalError::csv(&label, err))?;
        rows.push(
            record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect::<Vec<Cell>>(),
        );
    }

    Ok(MergedPatientDataset {
        patient_id: patient_id.clone(),
        categories: manifest.categories.clone(),
        alignment: manifest.alignment,
        schema: infer_schema(&columns, &rows),
        rows,
        conflicts: Vec::new(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetVersion {
    pub patient_id: PatientId,
    pub version: u32,
    pub sha256: String,
    pub path: PathBuf,
    /// True when publishing found identical content and kept the latest version.
    pub reused: bool,
}

/// Versioned on-disk store of merged datasets, one directory per patient.
///
/// ```text
/// {root}/patients/{patient_id}/merged_patient_data.csv   published version
/// {root}/patients/{patient_id}/versions/v000001.csv      history
/// {root}/patients/{patient_id}/versions/v000001.json     manifest
/// ```
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
    retain_versions: usize,
}

impl DatasetStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, retain_versions: usize) -> Self {
        Self {
            root: root.into(),
            retain_versions: retain_versions.max(1),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn patient_dir(&self, patient_id: &PatientId) -> PathBuf {
        self.root.join("patients").join(patient_id.as_str())
    }

    #[must_use]
    pub fn published_path(&self, patient_id: &PatientId) -> PathBuf {
        self.patient_dir(patient_id).join(MERGED_FILE_NAME)
    }

    fn versions_dir(&self, patient_id: &PatientId) -> PathBuf {
        self.patient_dir(patient_id).join("versions")
    }

    fn version_path(&self, patient_id: &PatientId, version: u32) -> PathBuf {
        self.versions_dir(patient_id).join(format!("v{version:06}.csv"))
    }

    fn manifest_path(&self, patient_id: &PatientId, version: u32) -> PathBuf {
        self.versions_dir(patient_id).join(format!("v{version:06}.json"))
    }

    fn write_manifest(
        &self,
        patient_id: &PatientId,
        version: u32,
        manifest: &DatasetManifest,
    ) -> Result<(), ClinicalError> {
        let path = self.manifest_path(patient_id, version);
        let bytes =
            serde_json::to_vec_pretty(manifest).map_err(|err| ClinicalError::io(&path, err.into()))?;
        if std::fs::read(&path).is_ok_and(|current| current == bytes) {
            return Ok(());
        }
        write_atomic(&path, &bytes)
    }

    /// Records `bytes` and its manifest as the next version and publishes the
    /// bytes atomically. Identical content to the latest version is not
    /// duplicated.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the version, manifest or published
    /// file cannot be written.
    pub fn publish(
        &self,
        patient_id: &PatientId,
        bytes: &[u8],
        manifest: &DatasetManifest,
    ) -> Result<DatasetVersion, ClinicalError> {
        let sha256 = hash_bytes(bytes);
        let latest = self.versions(patient_id)?.pop();

        let (version, path, reused) = match latest {
            Some(latest) if latest.sha256 == sha256 => (latest.version, latest.path, true),
            latest => {
                let next = latest.map_or(1, |value| value.version + 1);
                let path = self.version_path(patient_id, next);
                write_atomic(&path, bytes)?;
                (next, path, false)
            }
        };
        self.write_manifest(patient_id, version, manifest)?;

        let published = self.published_path(patient_id);
        let unchanged = std::fs::read(&published).is_ok_and(|current| current == bytes);
        if !unchanged {
            write_atomic(&published, bytes)?;
        }
        self.prune(patient_id)?;

        Ok(DatasetVersion {
            patient_id: patient_id.clone(),
            version,
            sha256,
            path,
            reused,
        })
    }

    /// Lists stored versions in ascending order.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the history cannot be read.
    pub fn versions(&self, patient_id: &PatientId) -> Result<Vec<DatasetVersion>, ClinicalError> {
        let dir = self.versions_dir(patient_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ClinicalError::io(&dir, err)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| ClinicalError::io(&dir, err))?.path();
            let Some(version) = parse_version_file(&path) else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|err| ClinicalError::io(&path, err))?;
            versions.push(DatasetVersion {
                patient_id: patient_id.clone(),
                version,
                sha256: hash_bytes(&bytes),
                path,
                reused: false,
            });
        }
        versions.sort_by_key(|version| version.version);
        Ok(versions)
    }

    /// Reads the published dataset bytes, if any.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] on read failures other than absence.
    pub fn current(&self, patient_id: &PatientId) -> Result<Option<Vec<u8>>, ClinicalError> {
        let path = self.published_path(patient_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ClinicalError::io(&path, err)),
        }
    }

    /// Reads one stored version.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the version does not exist.
    pub fn read_version(&self, patient_id: &PatientId, version: u32) -> Result<Vec<u8>, ClinicalError> {
        let path = self.version_path(patient_id, version);
        std::fs::read(&path).map_err(|err| ClinicalError::io(&path, err))
    }

    /// Reads the manifest recorded with one stored version.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the manifest is missing or malformed.
    pub fn read_manifest(
        &self,
        patient_id: &PatientId,
        version: u32,
    ) -> Result<DatasetManifest, ClinicalError> {
        let path = self.manifest_path(patient_id, version);
        let bytes = std::fs::read(&path).map_err(|err| ClinicalError::io(&path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| ClinicalError::io(&path, err.into()))
    }

    /// Republishes a stored version atomically. History is left untouched.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the version is missing or the
    /// published file cannot be replaced.
    pub fn rollback(
        &self,
        patient_id: &PatientId,
        version: u32,
    ) -> Result<DatasetVersion, ClinicalError> {
        let bytes = self.read_version(patient_id, version)?;
        write_atomic(&self.published_path(patient_id), &bytes)?;
        tracing::info!(patient_id = %patient_id, version, "rolled back published dataset");
        Ok(DatasetVersion {
            patient_id: patient_id.clone(),
            version,
            sha256: hash_bytes(&bytes),
            path: self.version_path(patient_id, version),
            reused: true,
        })
    }

    fn prune(&self, patient_id: &PatientId) -> Result<(), ClinicalError> {
        let versions = self.versions(patient_id)?;
        let excess = versions.len().saturating_sub(self.retain_versions);
        for stale in versions.into_iter().take(excess) {
            std::fs::remove_file(&stale.path).map_err(|err| ClinicalError::io(&stale.path, err))?;
            let manifest = self.manifest_path(patient_id, stale.version);
            match std::fs::remove_file(&manifest) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ClinicalError::io(&manifest, err)),
            }
            tracing::debug!(patient_id = %patient_id, version = stale.version, "pruned dataset version");
        }
        Ok(())
    }
}

fn parse_version_file(path: &Path) -> Option<u32> {
    if path.extension()? != "csv" {
        return None;
    }
    path.file_stem()?.to_str()?.strip_prefix('v')?.parse().ok()
}

/// Writes `bytes` to a temporary sibling and renames it over `path`, so
/// readers see either the old content or the new content.
///
/// # Errors
/// Returns [`ClinicalError::Io`] when any step fails; the target is untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ClinicalError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|err| ClinicalError::io(parent, err))?;

    let mut temp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| ClinicalError::io(parent, err))?;
    temp.write_all(bytes)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| ClinicalError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| ClinicalError::io(path, err.error))?;
    Ok(())
}

/// Remote object storage used to share merged datasets.
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns a URL for the object.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Upload`] on any storage failure.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ClinicalError>;
}

#[must_use]
pub fn upload_key(patient_id: &PatientId) -> String {
    format!("patient_{patient_id}/{MERGED_FILE_NAME}")
}

/// Filesystem-backed object store; objects land under `root/{key}`.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ClinicalError> {
        let path = self.root.join(key);
        write_atomic(&path, bytes).map_err(|err| ClinicalError::Upload {
            key: key.to_string(),
            detail: err.to_string(),
        })?;
        Ok(format!("file://{}", path.display()))
    }
}
