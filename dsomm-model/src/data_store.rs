//! Everything loaded for one assessment.

use std::sync::Arc;

use crate::activity_store::ActivityStore;
use crate::evidence::{EvidenceStore, EVIDENCE_STORAGE_KEY};
use crate::meta::{MetaStore, META_STORAGE_KEY};
use crate::progress::Progress;
use crate::progress_store::{ProgressError, ProgressStore, PROGRESS_STORAGE_KEY};
use crate::storage::{StateStorage, StorageError};

/// Delete stored progress, evidence and team changes from `storage`.
///
/// Needs no loaded data, so stored state that no longer parses can be
/// cleared too.
pub fn clear_stored_state(storage: &dyn StateStorage) -> Result<(), StorageError> {
    for key in [PROGRESS_STORAGE_KEY, EVIDENCE_STORAGE_KEY, META_STORAGE_KEY] {
        tracing::info!(key, "Deleting stored state");
        storage.remove_item(key)?;
    }
    Ok(())
}

/// Meta data, activities, progress and evidence of one assessment.
pub struct DataStore {
    pub meta: Option<MetaStore>,
    pub activity_store: ActivityStore,
    pub progress_store: ProgressStore,
    pub evidence_store: EvidenceStore,
    storage: Arc<dyn StateStorage>,
}

impl DataStore {
    /// Empty stores sharing one `storage`.
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            meta: None,
            activity_store: ActivityStore::new(),
            progress_store: ProgressStore::new().with_storage(storage.clone()),
            evidence_store: EvidenceStore::new().with_storage(storage.clone()),
            storage,
        }
    }

    /// Delete everything the stores have written to storage.
    pub fn clear_stored_state(&self) -> Result<(), StorageError> {
        clear_stored_state(self.storage.as_ref())
    }

    pub fn add_activities(&mut self, activity_store: ActivityStore) {
        self.activity_store = activity_store;
    }

    pub fn add_progress_data(&mut self, progress: Progress) -> Result<(), ProgressError> {
        self.progress_store.add_progress_data(progress)
    }

    pub fn get_max_level(&self) -> Option<u32> {
        self.activity_store.get_max_level()
    }

    /// Label from `meta.yaml`, the key itself when no meta is loaded.
    pub fn get_meta_string(&self, key: &str, index: usize) -> String {
        match &self.meta {
            Some(meta) => meta.get_meta_string(key, index),
            None => key.to_string(),
        }
    }

    /// Rename a team in meta, progress and evidence.
    pub fn rename_team(&mut self, old_name: &str, new_name: &str) -> crate::Result<()> {
        if let Some(meta) = self.meta.as_mut() {
            let teams = meta
                .teams
                .iter()
                .map(|team| if team == old_name { new_name.to_string() } else { team.clone() })
                .collect();
            let mut groups = meta.team_groups.clone();
            for members in groups.values_mut() {
                for member in members.iter_mut().filter(|m| m.as_str() == old_name) {
                    *member = new_name.to_string();
                }
            }
            meta.update_teams_and_groups(teams, groups)?;
        }
        self.progress_store.rename_team(old_name, new_name)?;
        self.evidence_store.rename_team(old_name, new_name)?;
        Ok(())
    }
}
