//! Staged-file storage: atomic id-keyed writes, the record codec, and
//! staged-input resolution for ingestion.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use catsweep_core::{CatalogId, Record};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsweep-storage";

/// File extension denoting one staged unit.
pub const STAGED_EXTENSION: &str = "json";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub id: CatalogId,
    pub path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
    /// The existing file already held byte-identical content; no write happened.
    pub unchanged: bool,
}

/// Durably persists fetched records as `<id>.json` files under one directory.
///
/// Writes are atomic (temp file + rename) and keyed by id, so re-staging the
/// same id overwrites in place and two distinct ids can never collide.
#[derive(Debug, Clone)]
pub struct StagingWriter {
    root: PathBuf,
}

impl StagingWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: CatalogId) -> PathBuf {
        self.root.join(format!("{id}.{STAGED_EXTENSION}"))
    }

    /// Serialize `record` and write it atomically to the id-keyed path,
    /// creating the staging directory if absent. Last writer wins; the
    /// scheduler guarantees at most one in-flight stage per id per pass.
    pub async fn stage(&self, id: CatalogId, record: &Record) -> anyhow::Result<StagedFile> {
        let bytes = serde_json::to_vec_pretty(record)
            .with_context(|| format!("serializing record for id {id}"))?;
        let content_hash = sha256_hex(&bytes);
        let path = self.path_for(id);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating staging directory {}", self.root.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking staged path {}", path.display()))?
        {
            let existing = fs::read(&path)
                .await
                .with_context(|| format!("reading staged file {}", path.display()))?;
            if sha256_hex(&existing) == content_hash {
                debug!(%id, path = %path.display(), "staged content unchanged");
                return Ok(StagedFile {
                    id,
                    path,
                    byte_size: bytes.len(),
                    content_hash,
                    unchanged: true,
                });
            }
        }

        let temp_path = self.root.join(format!(".{id}.{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp staged file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp staged file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp staged file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming staged file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StagedFile {
            id,
            path,
            byte_size: bytes.len(),
            content_hash,
            unchanged: false,
        })
    }
}

/// Load a staged file as a record sequence: a lone object becomes a
/// one-element sequence, an array of objects is taken as-is. Any other
/// shape is an error, never silently coerced.
pub async fn load_records(path: &Path) -> anyhow::Result<Vec<Record>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading staged file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing staged file {}", path.display()))?;

    match value {
        serde_json::Value::Object(record) => Ok(vec![record]),
        serde_json::Value::Array(entries) => entries
            .into_iter()
            .map(|entry| match entry {
                serde_json::Value::Object(record) => Ok(record),
                other => Err(anyhow::anyhow!(
                    "staged file {} holds a non-object array entry ({})",
                    path.display(),
                    type_name(&other)
                )),
            })
            .collect(),
        other => Err(anyhow::anyhow!(
            "staged file {} holds neither an object nor an array of objects ({})",
            path.display(),
            type_name(&other)
        )),
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("staged input {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("staged input {} lacks the .json extension", .0.display())]
    WrongExtension(PathBuf),
    #[error("staged input {} is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("reading staged directory {}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A staged-files location to ingest from: one file, an explicit list, or a
/// directory scanned for staged units.
#[derive(Debug, Clone)]
pub enum StagedSource {
    File(PathBuf),
    Files(Vec<PathBuf>),
    Dir(PathBuf),
}

impl StagedSource {
    /// Classify a single CLI-style path as either a directory scan or a
    /// single staged file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            StagedSource::Dir(path)
        } else {
            StagedSource::File(path)
        }
    }

    /// Resolve into an ordered, deduplicated list of staged-file paths.
    ///
    /// Explicit inputs (single file, list entries) are validated strictly;
    /// a directory scan silently skips anything that is not a staged unit.
    pub fn resolve(&self) -> Result<Vec<PathBuf>, ResolveError> {
        match self {
            StagedSource::File(path) => {
                validate_staged_file(path)?;
                Ok(vec![path.clone()])
            }
            StagedSource::Files(paths) => {
                let mut resolved = BTreeSet::new();
                for path in paths {
                    validate_staged_file(path)?;
                    resolved.insert(path.clone());
                }
                Ok(resolved.into_iter().collect())
            }
            StagedSource::Dir(dir) => {
                let entries = std::fs::read_dir(dir).map_err(|source| ResolveError::Directory {
                    path: dir.clone(),
                    source,
                })?;
                let mut resolved = BTreeSet::new();
                for entry in entries {
                    let entry = entry.map_err(|source| ResolveError::Directory {
                        path: dir.clone(),
                        source,
                    })?;
                    let path = entry.path();
                    if path.is_file() && has_staged_extension(&path) {
                        resolved.insert(path);
                    }
                }
                Ok(resolved.into_iter().collect())
            }
        }
    }
}

fn has_staged_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(STAGED_EXTENSION))
        .unwrap_or(false)
}

fn validate_staged_file(path: &Path) -> Result<(), ResolveError> {
    if !path.exists() {
        return Err(ResolveError::Missing(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ResolveError::NotAFile(path.to_path_buf()));
    }
    if !has_staged_extension(path) {
        return Err(ResolveError::WrongExtension(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn staging_writes_id_keyed_json() {
        let dir = tempdir().expect("tempdir");
        let writer = StagingWriter::new(dir.path());
        let rec = record(&[("name", json!("alpha")), ("open", json!(true))]);

        let staged = writer.stage(CatalogId(42), &rec).await.expect("stage");
        assert_eq!(staged.path, dir.path().join("42.json"));
        assert!(!staged.unchanged);

        let loaded = load_records(&staged.path).await.expect("load");
        assert_eq!(loaded, vec![rec]);
    }

    #[tokio::test]
    async fn restaging_identical_content_skips_the_write() {
        let dir = tempdir().expect("tempdir");
        let writer = StagingWriter::new(dir.path());
        let rec = record(&[("name", json!("alpha"))]);

        let first = writer.stage(CatalogId(7), &rec).await.expect("first");
        let second = writer.stage(CatalogId(7), &rec).await.expect("second");
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[tokio::test]
    async fn restaging_different_content_overwrites_by_id() {
        let dir = tempdir().expect("tempdir");
        let writer = StagingWriter::new(dir.path());

        writer
            .stage(CatalogId(7), &record(&[("v", json!(1))]))
            .await
            .expect("first");
        let staged = writer
            .stage(CatalogId(7), &record(&[("v", json!(2))]))
            .await
            .expect("second");
        assert!(!staged.unchanged);

        let loaded = load_records(&staged.path).await.expect("load");
        assert_eq!(loaded, vec![record(&[("v", json!(2))])]);

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").path())
            .collect();
        assert_eq!(files, vec![dir.path().join("7.json")]);
    }

    #[tokio::test]
    async fn codec_normalizes_object_and_array_shapes() {
        let dir = tempdir().expect("tempdir");

        let single = dir.path().join("one.json");
        std::fs::write(&single, r#"{"a": 1}"#).expect("write");
        assert_eq!(load_records(&single).await.expect("single").len(), 1);

        let many = dir.path().join("many.json");
        std::fs::write(&many, r#"[{"a": 1}, {"a": 2}, {"a": 3}]"#).expect("write");
        assert_eq!(load_records(&many).await.expect("many").len(), 3);

        let scalar = dir.path().join("scalar.json");
        std::fs::write(&scalar, "17").expect("write");
        assert!(load_records(&scalar).await.is_err());

        let mixed = dir.path().join("mixed.json");
        std::fs::write(&mixed, r#"[{"a": 1}, 5]"#).expect("write");
        assert!(load_records(&mixed).await.is_err());
    }

    #[test]
    fn directory_resolution_is_filtered_and_ordered() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("20.json"), "{}").expect("write");
        std::fs::write(dir.path().join("10.json"), "{}").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "x").expect("write");
        std::fs::create_dir(dir.path().join("sub.json")).expect("mkdir");

        let resolved = StagedSource::Dir(dir.path().to_path_buf())
            .resolve()
            .expect("resolve");
        assert_eq!(
            resolved,
            vec![dir.path().join("10.json"), dir.path().join("20.json")]
        );
    }

    #[test]
    fn explicit_list_is_validated_and_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, "{}").expect("write");
        std::fs::write(&b, "{}").expect("write");

        let resolved = StagedSource::Files(vec![b.clone(), a.clone(), b.clone()])
            .resolve()
            .expect("resolve");
        assert_eq!(resolved, vec![a.clone(), b.clone()]);

        let missing = StagedSource::Files(vec![a.clone(), dir.path().join("ghost.json")]);
        assert!(matches!(missing.resolve(), Err(ResolveError::Missing(_))));

        let txt = dir.path().join("c.txt");
        std::fs::write(&txt, "{}").expect("write");
        let wrong = StagedSource::Files(vec![txt]);
        assert!(matches!(
            wrong.resolve(),
            Err(ResolveError::WrongExtension(_))
        ));
    }

    #[test]
    fn single_file_input_must_be_a_staged_unit() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("solo.json");
        std::fs::write(&path, "{}").expect("write");

        assert_eq!(
            StagedSource::File(path.clone()).resolve().expect("resolve"),
            vec![path]
        );
        assert!(StagedSource::File(dir.path().join("absent.json"))
            .resolve()
            .is_err());
    }
}
