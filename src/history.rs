//! Persistence of past extractions.
//!
//! [`HistoryStore`] is the seam for wherever a host application keeps its
//! extraction log. [`JsonFileHistory`] is the default: one JSON array in one
//! file, newest entry first.

use crate::error::TaxFormError;
use crate::output::{ExtractionOutput, UsageMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Entries returned by [`HistoryStore::list_entries`] when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One saved extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub form_types: Vec<String>,
    pub total_forms_extracted: usize,
    pub extracted_forms: Vec<Value>,
    #[serde(default)]
    pub usage: Option<UsageMetadata>,
}

/// Where extraction history is kept.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an entry and return it with its id and timestamp.
    async fn save_entry(
        &self,
        filename: &str,
        form_types: Vec<String>,
        extracted_forms: Vec<Value>,
        usage: Option<UsageMetadata>,
    ) -> Result<HistoryEntry, TaxFormError>;

    /// Up to `limit` entries, newest first.
    async fn list_entries(&self, limit: usize) -> Result<Vec<HistoryEntry>, TaxFormError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), TaxFormError>;
}

/// Save the records of `output` to `store`.
pub async fn record_output(
    store: &dyn HistoryStore,
    output: &ExtractionOutput,
) -> Result<HistoryEntry, TaxFormError> {
    let form_types = output.form_types().iter().map(ToString::to_string).collect();
    let forms = output
        .records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TaxFormError::Internal(format!("Failed to serialise records: {e}")))?;
    store
        .save_entry(&output.filename, form_types, forms, Some(output.usage.clone()))
        .await
}

// ── JSON file ────────────────────────────────────────────────────────────

/// History kept as a JSON array in a single file.
///
/// A missing file reads as empty history. Writes go to a sibling temporary
/// file first and are renamed into place.
#[derive(Debug)]
pub struct JsonFileHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, detail: impl Into<String>) -> TaxFormError {
        TaxFormError::History {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    async fn read_all(&self) -> Result<Vec<HistoryEntry>, TaxFormError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.error(e.to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| self.error(format!("malformed history: {e}")))
    }

    async fn write_all(&self, entries: &[HistoryEntry]) -> Result<(), TaxFormError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.error(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(entries).map_err(|e| self.error(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.error(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.error(e.to_string()))
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn save_entry(
        &self,
        filename: &str,
        form_types: Vec<String>,
        extracted_forms: Vec<Value>,
        usage: Option<UsageMetadata>,
    ) -> Result<HistoryEntry, TaxFormError> {
        let _guard = self.lock.lock().await;
        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            filename: filename.to_string(),
            form_types,
            total_forms_extracted: extracted_forms.len(),
            extracted_forms,
            usage,
        };

        let mut entries = self.read_all().await?;
        entries.insert(0, entry.clone());
        self.write_all(&entries).await?;
        info!(
            "Saved history entry {} ({} form(s)) to {}",
            entry.id,
            entry.total_forms_extracted,
            self.path.display()
        );
        Ok(entry)
    }

    async fn list_entries(&self, limit: usize) -> Result<Vec<HistoryEntry>, TaxFormError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        debug!("Read {} history entries", entries.len());
        Ok(entries)
    }

    async fn clear(&self) -> Result<(), TaxFormError> {
        let _guard = self.lock.lock().await;
        self.write_all(&[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistory::new(dir.path().join("history.json"));
        assert!(store.list_entries(DEFAULT_HISTORY_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_are_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistory::new(dir.path().join("nested").join("history.json"));

        let first = store
            .save_entry("a.pdf", vec!["W-2".into()], vec![json!({"box": 1})], None)
            .await
            .unwrap();
        let second = store
            .save_entry("b.pdf", vec!["K-1".into(), "K-3".into()], vec![json!({}), json!({})], None)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.total_forms_extracted, 2);

        let listed = store.list_entries(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].filename, "b.pdf");
        assert_eq!(listed[1].filename, "a.pdf");

        assert_eq!(store.list_entries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistory::new(dir.path().join("history.json"));
        store.save_entry("a.pdf", vec![], vec![], None).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.list_entries(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_a_history_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileHistory::new(&path).list_entries(50).await.unwrap_err();
        assert!(matches!(err, TaxFormError::History { .. }));
    }
}
