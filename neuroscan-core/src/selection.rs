//! Client-side "current scan" selection.
//!
//! A cache of which record the user is looking at. The object store stays the
//! source of truth; losing the selection only means re-picking from history.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ScanRecord;
use crate::timestamp::ScanTimestamp;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Selection state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Selection state at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImagePreview {
    /// The file the user just uploaded.
    LocalFile(PathBuf),
    /// The stored image URL of a history item.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSelection {
    pub current_timestamp: ScanTimestamp,
    pub current_image_preview: Option<ImagePreview>,
}

impl ClientSelection {
    /// Selection after a successful upload of `file`.
    pub fn uploaded(timestamp: ScanTimestamp, file: impl Into<PathBuf>) -> Self {
        Self {
            current_timestamp: timestamp,
            current_image_preview: Some(ImagePreview::LocalFile(file.into())),
        }
    }

    /// Selection after picking a history item.
    pub fn from_record(record: &ScanRecord) -> Self {
        Self {
            current_timestamp: record.timestamp.clone(),
            current_image_preview: Some(ImagePreview::Remote(record.image_url.clone())),
        }
    }
}

/// Narrow get/set/clear interface over wherever the selection lives.
pub trait SelectionStore: Send + Sync {
    /// Replace the previous selection in one step.
    fn set_current(&self, selection: ClientSelection) -> Result<(), SelectionError>;

    fn get_current(&self) -> Result<Option<ClientSelection>, SelectionError>;

    fn clear(&self) -> Result<(), SelectionError>;
}

#[derive(Default)]
pub struct InMemorySelectionStore {
    current: RwLock<Option<ClientSelection>>,
}

impl InMemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStore for InMemorySelectionStore {
    fn set_current(&self, selection: ClientSelection) -> Result<(), SelectionError> {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(selection);
        Ok(())
    }

    fn get_current(&self) -> Result<Option<ClientSelection>, SelectionError> {
        Ok(self.current.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn clear(&self) -> Result<(), SelectionError> {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}

/// JSON file on local disk, replaced via temp-file-and-rename so a reader
/// never observes a half-written selection.
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Build from a user-supplied path, expanding `~` and `$VARS`.
    pub fn from_user_path(raw: &str) -> Self {
        let expanded = shellexpand::full(raw)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        Self::new(expanded)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SelectionError {
        SelectionError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SelectionStore for FileSelectionStore {
    fn set_current(&self, selection: ClientSelection) -> Result<(), SelectionError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let body = serde_json::to_vec_pretty(&selection).map_err(|source| SelectionError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, body).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            self.io_err(e)
        })
    }

    fn get_current(&self) -> Result<Option<ClientSelection>, SelectionError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SelectionError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    fn clear(&self) -> Result<(), SelectionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanTags;

    fn ts(s: &str) -> ScanTimestamp {
        ScanTimestamp::parse(s).unwrap()
    }

    fn record(key: &str) -> ScanRecord {
        ScanRecord {
            timestamp: ts(key),
            image_url: format!("https://scans.s3.amazonaws.com/saved/{key}/mri_{key}.jpg"),
            analysis: serde_json::json!({}),
            summary: String::new(),
            tags: ScanTags {
                tumor_type: "none".into(),
                tumor_size: "N/A".into(),
            },
        }
    }

    fn exercise(store: &dyn SelectionStore) {
        assert_eq!(store.get_current().unwrap(), None);

        let picked = ClientSelection::from_record(&record("20240101_120000"));
        store.set_current(picked.clone()).unwrap();
        let read = store.get_current().unwrap().unwrap();
        assert_eq!(read.current_timestamp.as_str(), "20240101_120000");
        assert_eq!(
            read.current_image_preview,
            Some(ImagePreview::Remote(
                "https://scans.s3.amazonaws.com/saved/20240101_120000/mri_20240101_120000.jpg".into()
            ))
        );

        let uploaded = ClientSelection::uploaded(ts("20240301_080000"), "/tmp/brain2.jpg");
        store.set_current(uploaded.clone()).unwrap();
        assert_eq!(store.get_current().unwrap(), Some(uploaded));

        store.clear().unwrap();
        assert_eq!(store.get_current().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_in_memory_selection_round_trip() {
        exercise(&InMemorySelectionStore::new());
    }

    #[test]
    fn test_file_selection_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSelectionStore::new(dir.path().join("nested").join("selection.json"));
        exercise(&store);
    }

    #[test]
    fn test_file_selection_survives_reopen_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");

        FileSelectionStore::new(&path)
            .set_current(ClientSelection::from_record(&record("20240101_120000")))
            .unwrap();

        let reopened = FileSelectionStore::new(&path);
        let current = reopened.get_current().unwrap().unwrap();
        assert_eq!(current.current_timestamp.as_str(), "20240101_120000");

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileSelectionStore::new(&path).get_current().unwrap_err();
        assert!(matches!(err, SelectionError::Corrupt { .. }));
    }

    #[test]
    fn test_user_path_expands_variables() {
        std::env::set_var("NEUROSCAN_TEST_HOME_DIR", "/var/tmp/neuroscan");
        let store = FileSelectionStore::from_user_path("$NEUROSCAN_TEST_HOME_DIR/selection.json");
        assert_eq!(store.path(), Path::new("/var/tmp/neuroscan/selection.json"));
    }
}
