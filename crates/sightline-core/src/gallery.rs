//! Gallery of known identities and its durable JSON record.
//!
//! The record is a JSON object with two co-indexed arrays:
//!
//! ```json
//! { "encodings": [[0.1, ...], ...], "names": ["Known (1)", ...] }
//! ```

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery record: {0}")]
    Malformed(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A known identity: label plus embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

impl GalleryEntry {
    pub fn new(label: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            label: label.into(),
            embedding,
        }
    }
}

/// Ordered, index-addressed collection of known identities.
///
/// Each entry carries its label and embedding together, so removing an
/// index can never leave a label without its embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GalleryEntry> {
        self.entries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&GalleryEntry> {
        self.entries.get(index)
    }

    pub fn push(&mut self, entry: GalleryEntry) {
        self.entries.push(entry);
    }

    /// Remove the entry at `index`, shifting later entries down by one.
    /// Returns `None` (and leaves the gallery untouched) when out of range.
    pub fn remove(&mut self, index: usize) -> Option<GalleryEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    /// Label for the next enrolled identity: `"Known (N)"` where N is the
    /// gallery size after the append.
    pub fn next_label(&self) -> String {
        format!("Known ({})", self.entries.len() + 1)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    fn to_record(&self) -> GalleryRecord {
        GalleryRecord {
            encodings: self
                .entries
                .iter()
                .map(|e| e.embedding.values.clone())
                .collect(),
            names: self.entries.iter().map(|e| e.label.clone()).collect(),
        }
    }

    fn from_record(record: GalleryRecord) -> Result<Self, StoreError> {
        if record.encodings.len() != record.names.len() {
            return Err(StoreError::Malformed(format!(
                "{} encodings but {} names",
                record.encodings.len(),
                record.names.len()
            )));
        }
        if let Some(first) = record.encodings.first() {
            let dim = first.len();
            if let Some(bad) = record.encodings.iter().position(|e| e.len() != dim) {
                return Err(StoreError::Malformed(format!(
                    "encoding {bad} has {} values, expected {dim}",
                    record.encodings[bad].len()
                )));
            }
        }

        let entries = record
            .names
            .into_iter()
            .zip(record.encodings)
            .map(|(label, values)| GalleryEntry::new(label, Embedding::new(values)))
            .collect();
        Ok(Self { entries })
    }
}

impl Index<usize> for Gallery {
    type Output = GalleryEntry;

    fn index(&self, index: usize) -> &GalleryEntry {
        &self.entries[index]
    }
}

impl<'a> IntoIterator for &'a Gallery {
    type Item = &'a GalleryEntry;
    type IntoIter = std::slice::Iter<'a, GalleryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// On-disk shape of the gallery.
#[derive(Debug, Serialize, Deserialize)]
struct GalleryRecord {
    #[serde(default)]
    encodings: Vec<Vec<f32>>,
    #[serde(default)]
    names: Vec<String>,
}

/// Outcome of loading the durable record. Always paired with a usable gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    /// Record read successfully with this many entries.
    Loaded(usize),
    /// Record exists but holds no entries.
    Empty,
    /// No record on disk.
    NoData,
    /// Record could not be read or parsed; the gallery starts empty.
    Error(String),
}

impl LoadStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, LoadStatus::Error(_))
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStatus::Loaded(n) => write!(f, "Loaded {n} known faces. Ready to recognize."),
            LoadStatus::Empty => write!(f, "Face data file is empty. Please upload a photo."),
            LoadStatus::NoData => write!(f, "No face data found. Please upload a photo."),
            LoadStatus::Error(e) => write!(f, "Error loading face data: {e}"),
        }
    }
}

/// Load/save collaborator for the durable gallery record. Holds no state
/// beyond the record's path.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the durable record. Never fails: a missing or malformed record
    /// yields an empty gallery and a status describing why.
    pub fn load(&self) -> (Gallery, LoadStatus) {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "no gallery record");
            return (Gallery::new(), LoadStatus::NoData);
        }

        match self.read() {
            Ok(gallery) if gallery.is_empty() => (gallery, LoadStatus::Empty),
            Ok(gallery) => {
                tracing::info!(
                    path = %self.path.display(),
                    entries = gallery.len(),
                    "gallery loaded"
                );
                let n = gallery.len();
                (gallery, LoadStatus::Loaded(n))
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "gallery record unreadable; starting empty"
                );
                (Gallery::new(), LoadStatus::Error(e.to_string()))
            }
        }
    }

    fn read(&self) -> Result<Gallery, StoreError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let record: GalleryRecord = serde_json::from_str(&raw)?;
        Gallery::from_record(record)
    }

    /// Write the gallery to the durable record.
    ///
    /// The record is written to a sibling temp file and renamed into place,
    /// so a failed write never truncates the previous record. A gallery with
    /// a NaN or infinite value is refused before anything is written.
    pub fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let non_finite = gallery.iter().enumerate().find(|(_, e)| !e.embedding.is_finite());
        if let Some((i, entry)) = non_finite {
            return Err(StoreError::Malformed(format!(
                "entry {i} ({}) has a non-finite embedding value",
                entry.label
            )));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(&gallery.to_record())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::debug!(path = %self.path.display(), entries = gallery.len(), "gallery saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Gallery {
        let mut g = Gallery::new();
        g.push(GalleryEntry::new("Known (1)", Embedding::new(vec![0.1, -0.25, 3.5])));
        g.push(GalleryEntry::new("Known (2)", Embedding::new(vec![1e-7, 0.333_333_34, -2.0])));
        g.push(GalleryEntry::new("Known (3)", Embedding::new(vec![0.0, 0.0, 0.0])));
        g
    }

    #[test]
    fn test_load_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("known_faces.json"));
        let (gallery, status) = store.load();
        assert!(gallery.is_empty());
        assert_eq!(status, LoadStatus::NoData);
        assert_eq!(status.to_string(), "No face data found. Please upload a photo.");
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("known_faces.json"));
        let original = sample();

        store.save(&original).unwrap();
        let (loaded, status) = store.load();
        assert_eq!(status, LoadStatus::Loaded(3));
        store.save(&loaded).unwrap();
        let (reloaded, _) = store.load();

        assert_eq!(reloaded, original);
    }

    #[test]
    fn test_round_trip_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("known_faces.json"));
        store.save(&Gallery::new()).unwrap();
        let (loaded, status) = store.load();
        assert!(loaded.is_empty());
        assert_eq!(status, LoadStatus::Empty);
    }

    #[test]
    fn test_record_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("known_faces.json"));
        store.save(&sample()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["names"][0], "Known (1)");
        assert_eq!(value["encodings"].as_array().unwrap().len(), 3);
        assert_eq!(value["encodings"][0].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_load_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        std::fs::write(&path, "{ not json").unwrap();
        let (gallery, status) = GalleryStore::new(&path).load();
        assert!(gallery.is_empty());
        assert!(status.is_error());
    }

    #[test]
    fn test_load_mismatched_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        std::fs::write(&path, r#"{"encodings": [[1.0, 2.0]], "names": ["a", "b"]}"#).unwrap();
        let (gallery, status) = GalleryStore::new(&path).load();
        assert!(gallery.is_empty());
        assert!(status.is_error());
    }

    #[test]
    fn test_load_inconsistent_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        std::fs::write(&path, r#"{"encodings": [[1.0, 2.0], [1.0]], "names": ["a", "b"]}"#)
            .unwrap();
        let (_, status) = GalleryStore::new(&path).load();
        assert!(status.is_error());
    }

    #[test]
    fn test_load_missing_keys_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        std::fs::write(&path, "{}").unwrap();
        let (gallery, status) = GalleryStore::new(&path).load();
        assert!(gallery.is_empty());
        assert_eq!(status, LoadStatus::Empty);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("a/b/known_faces.json"));
        store.save(&sample()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the record file should be makes the rename fail.
        let path = dir.path().join("known_faces.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();
        let result = GalleryStore::new(&path).save(&sample());
        assert!(result.is_err());
    }

    #[test]
    fn test_save_rejects_non_finite_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("known_faces.json"));
        store.save(&sample()).unwrap();

        let mut bad = sample();
        bad.push(GalleryEntry::new("Known (4)", Embedding::new(vec![0.0, f32::NAN, 1.0])));
        let err = store.save(&bad).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
        assert!(err.to_string().contains("Known (4)"));

        // The previous record is untouched and still loads.
        let (loaded, status) = store.load();
        assert_eq!(status, LoadStatus::Loaded(3));
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_remove_shifts_entries() {
        let original = sample();
        let mut g = original.clone();
        let removed = g.remove(1).unwrap();
        assert_eq!(removed, original[1]);
        assert_eq!(g.len(), 2);
        assert_eq!(g[0], original[0]);
        assert_eq!(g[1], original[2]);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut g = sample();
        assert!(g.remove(3).is_none());
        assert_eq!(g, sample());
    }

    #[test]
    fn test_next_label() {
        assert_eq!(Gallery::new().next_label(), "Known (1)");
        assert_eq!(sample().next_label(), "Known (4)");
    }
}
