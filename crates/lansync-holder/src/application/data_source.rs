//! The dataset the holder shares.
//!
//! Records are opaque JSON values grouped by category id (`"steps"`,
//! `"heart_rate"`, ...).  The router only needs to list categories, check
//! that one exists, count it, and slice a page out of it.  How the records
//! are stored on the device is behind [`HealthDataSource`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lansync_core::api::CategoryCount;
use serde_json::Value;
use thiserror::Error;

/// Error type for data source operations.
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// The backing store could not be queried.
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// A file system I/O error occurred.
    #[error("I/O error reading dataset at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dataset file is not a JSON object of arrays.
    #[error("invalid dataset: {0}")]
    Parse(String),
}

/// Read access to the shared dataset.
#[cfg_attr(test, mockall::automock)]
pub trait HealthDataSource: Send + Sync {
    /// Every category with its record count, ordered by id.
    fn categories(&self) -> Result<Vec<CategoryCount>, DataSourceError>;

    /// Returns `true` if `category` exists.
    fn contains(&self, category: &str) -> bool;

    /// Number of records in `category`.
    fn total(&self, category: &str) -> Result<usize, DataSourceError>;

    /// Up to `limit` records of `category` starting at `offset`.  An offset
    /// past the end yields an empty page.
    fn page(&self, category: &str, offset: usize, limit: usize)
        -> Result<Vec<Value>, DataSourceError>;
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataSource {
    categories: BTreeMap<String, Vec<Value>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of [`InMemoryDataSource::insert`].
    pub fn with_category(mut self, id: impl Into<String>, records: Vec<Value>) -> Self {
        self.insert(id, records);
        self
    }

    /// Replaces the records of one category.
    pub fn insert(&mut self, id: impl Into<String>, records: Vec<Value>) {
        self.categories.insert(id.into(), records);
    }

    /// Parses `{"<category>": [record, ...], ...}`.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError::Parse`] if the text is not a JSON object
    /// whose values are arrays.
    pub fn from_json_str(json: &str) -> Result<Self, DataSourceError> {
        let categories: BTreeMap<String, Vec<Value>> =
            serde_json::from_str(json).map_err(|e| DataSourceError::Parse(e.to_string()))?;
        Ok(Self { categories })
    }

    /// Loads a dataset file in the [`InMemoryDataSource::from_json_str`]
    /// format.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError::Io`] if the file cannot be read, or
    /// [`DataSourceError::Parse`] if it is malformed.
    pub fn from_json_file(path: &Path) -> Result<Self, DataSourceError> {
        let text = std::fs::read_to_string(path).map_err(|source| DataSourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

impl HealthDataSource for InMemoryDataSource {
    fn categories(&self) -> Result<Vec<CategoryCount>, DataSourceError> {
        Ok(self
            .categories
            .iter()
            .map(|(id, records)| CategoryCount {
                id: id.clone(),
                count: records.len(),
            })
            .collect())
    }

    fn contains(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    fn total(&self, category: &str) -> Result<usize, DataSourceError> {
        self.categories
            .get(category)
            .map(Vec::len)
            .ok_or_else(|| DataSourceError::Unavailable(format!("unknown category {category}")))
    }

    fn page(
        &self,
        category: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, DataSourceError> {
        let records = self
            .categories
            .get(category)
            .ok_or_else(|| DataSourceError::Unavailable(format!("unknown category {category}")))?;
        Ok(records.iter().skip(offset).take(limit).cloned().collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
