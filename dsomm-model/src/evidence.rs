//! Evidence recorded against activities.
//!
//! Entries are kept per activity uuid in insertion order. Merging loaded
//! data skips entries whose id is already present for the activity, while
//! [`EvidenceStore::add_evidence`] appends unconditionally.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::progress::{TeamName, Uuid};
use crate::storage::{StateStorage, StorageError};

/// Storage key for persisted evidence.
pub const EVIDENCE_STORAGE_KEY: &str = "evidence";

/// Activity uuid → evidence entries.
pub type EvidenceData = BTreeMap<Uuid, Vec<EvidenceEntry>>;

/// Error types for evidence operations.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid evidence YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// One piece of evidence for an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceEntry {
    pub id: String,
    #[serde(default)]
    pub teams: Vec<TeamName>,
    pub title: String,
    pub evidence_recorded: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl EvidenceEntry {
    /// New entry with a generated id.
    pub fn new(title: impl Into<String>, teams: Vec<TeamName>, evidence_recorded: NaiveDate) -> Self {
        Self {
            id: EvidenceStore::generate_id(),
            teams,
            title: title.into(),
            evidence_recorded,
            reviewer: None,
            description: String::new(),
            attachments: Vec::new(),
        }
    }
}

/// Link to material backing an evidence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub external_link: String,
}

/// Top level shape of a persisted evidence document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFile {
    #[serde(default)]
    pub evidence: EvidenceData,
}

impl EvidenceFile {
    /// Parse stored evidence; empty or null input is an empty file.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: Option<Self> = serde_yaml::from_str(yaml)?;
        Ok(file.unwrap_or_default())
    }
}

/// Evidence of all activities.
#[derive(Default)]
pub struct EvidenceStore {
    evidence: EvidenceData,
    storage: Option<Arc<dyn StateStorage>>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist through `storage` after every mutating call.
    pub fn with_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace all evidence.
    pub fn init_from_data(&mut self, data: EvidenceData) {
        self.evidence = data;
    }

    /// Merge loaded evidence, skipping entries whose id the activity
    /// already has.
    pub fn add_evidence_data(&mut self, data: EvidenceData) {
        for (uuid, entries) in data {
            let existing = self.evidence.entry(uuid).or_default();
            for entry in entries {
                if existing.iter().any(|e| e.id == entry.id) {
                    tracing::debug!(id = %entry.id, "Skipping duplicate evidence");
                    continue;
                }
                existing.push(entry);
            }
        }
        self.evidence.retain(|_, entries| !entries.is_empty());
    }

    /// Append an entry to an activity. Ids are not checked.
    pub fn add_evidence(&mut self, uuid: &str, entry: EvidenceEntry) -> Result<(), EvidenceError> {
        tracing::debug!(activity = uuid, id = %entry.id, "Adding evidence");
        self.evidence.entry(uuid.to_string()).or_default().push(entry);
        self.save_to_storage()
    }

    /// Entries of one activity in the order they were added; empty for unknown
    /// activities.
    pub fn get_evidence(&self, uuid: &str) -> &[EvidenceEntry] {
        self.evidence.get(uuid).map_or(&[][..], Vec::as_slice)
    }

    pub fn has_evidence(&self, uuid: &str) -> bool {
        !self.get_evidence(uuid).is_empty()
    }

    /// Replace the entry with `id`. Unknown activities or ids are logged and
    /// left alone.
    pub fn update_evidence(
        &mut self,
        uuid: &str,
        id: &str,
        entry: EvidenceEntry,
    ) -> Result<(), EvidenceError> {
        let Some(slot) = self
            .evidence
            .get_mut(uuid)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
        else {
            tracing::warn!(activity = uuid, id, "Cannot update missing evidence");
            return Ok(());
        };

        *slot = entry;
        self.save_to_storage()
    }

    /// Remove the entry with `id`, and the activity once it has none left.
    pub fn delete_evidence(&mut self, uuid: &str, id: &str) -> Result<(), EvidenceError> {
        let Some(entries) = self.evidence.get_mut(uuid) else {
            tracing::warn!(activity = uuid, id, "Cannot delete evidence of unknown activity");
            return Ok(());
        };
        let Some(position) = entries.iter().position(|e| e.id == id) else {
            tracing::warn!(activity = uuid, id, "Cannot delete missing evidence");
            return Ok(());
        };

        entries.remove(position);
        if entries.is_empty() {
            self.evidence.remove(uuid);
        }
        self.save_to_storage()
    }

    /// Replace `old_name` in the team list of every entry, then persist.
    pub fn rename_team(&mut self, old_name: &str, new_name: &str) -> Result<(), EvidenceError> {
        tracing::info!(from = old_name, to = new_name, "Renaming team in evidence store");

        for entries in self.evidence.values_mut() {
            for entry in entries.iter_mut() {
                for team in entry.teams.iter_mut().filter(|t| t.as_str() == old_name) {
                    *team = new_name.to_string();
                }
            }
        }
        self.save_to_storage()
    }

    /// Entries over all activities.
    pub fn get_total_evidence_count(&self) -> usize {
        self.evidence.values().map(Vec::len).sum()
    }

    /// Activities holding at least one entry, in uuid order.
    pub fn get_activity_uuids_with_evidence(&self) -> Vec<&str> {
        self.evidence
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(uuid, _)| uuid.as_str())
            .collect()
    }

    /// All entries keyed by activity uuid.
    pub fn get_evidence_data(&self) -> &EvidenceData {
        &self.evidence
    }

    /// Random id for a new entry.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Evidence as an `evidence:` document keyed by activity uuid.
    pub fn as_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        #[derive(Serialize)]
        struct Document<'a> {
            evidence: &'a EvidenceData,
        }
        serde_yaml::to_string(&Document {
            evidence: &self.evidence,
        })
    }

    /// Write the YAML form to storage; a no-op without storage.
    pub fn save_to_storage(&self) -> Result<(), EvidenceError> {
        if let Some(storage) = &self.storage {
            storage.set_item(EVIDENCE_STORAGE_KEY, &self.as_yaml_string()?)?;
        }
        Ok(())
    }

    /// Evidence previously written to storage.
    ///
    /// `None` without storage or when nothing has been stored yet. Stored text
    /// that does not parse is an [`EvidenceError::Yaml`] error.
    pub fn retrieve_stored_evidence(&self) -> Result<Option<EvidenceData>, EvidenceError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        match storage.get_item(EVIDENCE_STORAGE_KEY)? {
            Some(yaml) => Ok(Some(EvidenceFile::from_yaml(&yaml)?.evidence)),
            None => Ok(None),
        }
    }

    /// Remove the stored copy; the entries held in memory stay.
    pub fn delete_stored_evidence(&self) -> Result<(), StorageError> {
        tracing::info!("Deleting stored evidence");
        match &self.storage {
            Some(storage) => storage.remove_item(EVIDENCE_STORAGE_KEY),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const UUID: &str = "00000000-1111-1111-1111-000000000000";

    fn entry(id: &str, teams: &[&str]) -> EvidenceEntry {
        EvidenceEntry {
            id: id.to_string(),
            teams: teams.iter().map(|t| t.to_string()).collect(),
            title: format!("Evidence {}", id),
            evidence_recorded: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            reviewer: None,
            description: "Pipeline logs".to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_direct_add_does_not_dedupe() {
        let mut store = EvidenceStore::new();
        store.add_evidence(UUID, entry("e-1", &["A"])).unwrap();
        store.add_evidence(UUID, entry("e-1", &["A"])).unwrap();
        assert_eq!(store.get_evidence(UUID).len(), 2);
    }

    #[test]
    fn test_merge_drops_duplicate_ids() {
        let mut store = EvidenceStore::new();
        store.add_evidence(UUID, entry("e-1", &["A"])).unwrap();

        let mut data = EvidenceData::new();
        data.insert(UUID.to_string(), vec![entry("e-1", &["B"]), entry("e-2", &["B"])]);
        data.insert("other".to_string(), vec![]);
        store.add_evidence_data(data);

        let evidence = store.get_evidence(UUID);
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].teams, ["A"]);
        assert_eq!(evidence[1].id, "e-2");
        assert_eq!(store.get_activity_uuids_with_evidence(), [UUID]);
        assert_eq!(store.get_total_evidence_count(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let mut store = EvidenceStore::new();
        store.add_evidence(UUID, entry("e-1", &["A"])).unwrap();

        let mut changed = entry("e-1", &["A"]);
        changed.reviewer = Some("Security champion".to_string());
        store.update_evidence(UUID, "e-1", changed).unwrap();
        assert_eq!(
            store.get_evidence(UUID)[0].reviewer.as_deref(),
            Some("Security champion")
        );

        // Missing keys are ignored
        store.update_evidence(UUID, "e-9", entry("e-9", &[])).unwrap();
        store.delete_evidence("unknown", "e-1").unwrap();
        store.delete_evidence(UUID, "e-9").unwrap();
        assert_eq!(store.get_total_evidence_count(), 1);

        store.delete_evidence(UUID, "e-1").unwrap();
        assert!(!store.has_evidence(UUID));
        assert!(store.get_activity_uuids_with_evidence().is_empty());
    }

    #[test]
    fn test_rename_team() {
        let mut store = EvidenceStore::new();
        store.add_evidence(UUID, entry("e-1", &["A", "B"])).unwrap();
        store.rename_team("A", "Z").unwrap();
        assert_eq!(store.get_evidence(UUID)[0].teams, ["Z", "B"]);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let first = EvidenceStore::generate_id();
        assert_eq!(first.len(), 36);
        assert_ne!(first, EvidenceStore::generate_id());

        let entry = EvidenceEntry::new("Threat model", vec!["A".to_string()], NaiveDate::MIN);
        assert!(uuid::Uuid::parse_str(&entry.id).is_ok());
    }

    #[test]
    fn test_storage_roundtrip() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = EvidenceStore::new().with_storage(storage.clone());
        assert!(store.retrieve_stored_evidence().unwrap().is_none());

        let mut with_link = entry("e-1", &["A"]);
        with_link.attachments.push(Attachment {
            kind: "document".to_string(),
            external_link: "https://example.org/report.pdf".to_string(),
        });
        store.add_evidence(UUID, with_link.clone()).unwrap();

        let yaml = storage.get_item(EVIDENCE_STORAGE_KEY).unwrap().unwrap();
        assert!(yaml.contains("evidenceRecorded:"));
        assert!(yaml.contains("2024-02-01"));
        assert!(yaml.contains("externalLink:"));

        let stored = store.retrieve_stored_evidence().unwrap().unwrap();
        assert_eq!(stored[UUID], vec![with_link]);

        store.delete_stored_evidence().unwrap();
        assert!(store.retrieve_stored_evidence().unwrap().is_none());
    }
}
