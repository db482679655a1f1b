//! Load a complete [`DataStore`] starting from `meta.yaml`.
//!
//! Loading order:
//!
//! 1. `meta.yaml`, with `$ref` substitution, stored team overrides and
//!    the progress definition checked
//! 2. activity files, in the order `meta.yaml` lists them
//! 3. the team progress file
//! 4. progress and evidence previously saved to state storage

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Value;

use crate::activity_store::ActivityStore;
use crate::data_store::DataStore;
use crate::evidence::EvidenceError;
use crate::meta::{ActivityFileMeta, MetaError, MetaStore};
use crate::progress::TeamProgressFile;
use crate::progress_store::ProgressError;
use crate::storage::StateStorage;
use crate::yaml::{make_full_path, YamlError, YamlLoader};

/// Activity files ending like this only log their validation errors.
const HISTORIC_ACTIVITY_FILE: &str = "generated/generated.yaml";

/// Error types for loading and updating assessment data.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Yaml(#[from] YamlError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Activity or progress data is inconsistent
    #[error("{0}")]
    DataValidation(String),

    /// Activity file holds neither one data document nor a meta and a data
    /// document
    #[error("The activity file '{}' is expected to contain dimension and activities, with an optional meta document at the start.", .0.display())]
    InvalidActivityFile(PathBuf),

    /// Team progress file has the wrong shape
    #[error("Invalid team progress file '{}': {source}", .path.display())]
    InvalidProgressFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

pub type Result<T> = std::result::Result<T, LoadError>;

/// Loads assessment data from disk into a [`DataStore`].
pub struct DataLoader {
    yaml: YamlLoader,
    storage: Arc<dyn StateStorage>,
}

impl DataLoader {
    /// Loader whose stores persist through `storage`.
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            yaml: YamlLoader::new(),
            storage,
        }
    }

    /// Load `meta.yaml`, the activity files and team progress it names, then
    /// merge stored progress and evidence on top.
    ///
    /// Stored state that does not parse fails the load;
    /// [`clear_stored_state`](crate::clear_stored_state) removes it.
    pub fn load(&mut self, meta_path: &Path) -> Result<DataStore> {
        tracing::info!(meta = %meta_path.display(), "Loading assessment data");
        let mut data_store = DataStore::new(self.storage.clone());

        let mut meta = self.load_meta(meta_path)?;
        data_store
            .progress_store
            .init(meta.progress_definition.clone());

        let activity_store = self.load_activities(&mut meta)?;
        data_store.add_activities(activity_store);
        data_store
            .progress_store
            .set_activity_map(data_store.activity_store.activity_names_by_uuid());

        if let Some(path) = &meta.team_progress_file {
            let team_progress = self.load_team_progress(path)?;
            data_store.add_progress_data(team_progress.progress)?;
        }
        if let Some(stored) = data_store.progress_store.retrieve_stored_team_progress()? {
            tracing::info!(activities = stored.progress.len(), "Merging stored progress");
            data_store.add_progress_data(stored.progress)?;
        }
        if let Some(stored) = data_store.evidence_store.retrieve_stored_evidence()? {
            data_store.evidence_store.add_evidence_data(stored);
        }

        tracing::info!(
            activities = data_store.activity_store.len(),
            teams = meta.teams.len(),
            evidence = data_store.evidence_store.get_total_evidence_count(),
            "All YAML files loaded"
        );
        data_store.meta = Some(meta);
        Ok(data_store)
    }

    fn load_meta(&mut self, meta_path: &Path) -> Result<MetaStore> {
        let value = self.yaml.load_yaml_with_references_resolved(meta_path)?;
        let mut meta = MetaStore::from_value(value)?.with_storage(self.storage.clone());
        meta.load_teams_and_groups()?;

        if meta.activity_files.is_empty() {
            return Err(MetaError::Missing("activityFiles").into());
        }
        let Some(team_progress_file) = meta.team_progress_file.take() else {
            return Err(MetaError::Missing("teamProgressFile").into());
        };

        meta.validate_progress_definition()?;

        meta.team_progress_file = Some(resolve(&team_progress_file, meta_path)?);
        meta.activity_files = meta
            .activity_files
            .iter()
            .map(|file| resolve(file, meta_path))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(teams = %meta.teams.join(", "), "Loaded teams");
        Ok(meta)
    }

    /// Collected errors abort loading, unless a historic generated file
    /// has been part of the list.
    fn load_activities(&mut self, meta: &mut MetaStore) -> Result<ActivityStore> {
        let mut activity_store = ActivityStore::new();
        let mut errors = Vec::new();
        let mut using_historic_file = false;

        for path in &meta.activity_files {
            tracing::debug!(path = %path.display(), "Loading activity file");
            using_historic_file |= path.to_string_lossy().ends_with(HISTORIC_ACTIVITY_FILE);

            let (file_meta, data) = self.load_activity_file(path)?;
            activity_store.add_activity_file(&data, &mut errors);

            if let Some(file_meta) = file_meta {
                if file_meta.is_newer_than(meta.activity_meta.as_ref()) {
                    tracing::debug!(version = ?file_meta.get_dsomm_version(), "Using activity file meta");
                    meta.activity_meta = Some(file_meta);
                }
            }

            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!(path = %path.display(), "{}", error);
                }
                if !using_historic_file {
                    return Err(LoadError::DataValidation(format!(
                        "Data validation error after loading: {}\n\n----\n\n{}",
                        path.display(),
                        errors.join("\n\n")
                    )));
                }
            }
        }

        Ok(activity_store)
    }

    fn load_activity_file(&self, path: &Path) -> Result<(Option<ActivityFileMeta>, Value)> {
        let mut documents = self.yaml.load_yaml_documents(path)?;

        match documents.len() {
            1 => Ok((None, documents.remove(0))),
            2 if documents[0].get("meta").is_some() && !documents[1].is_null() => {
                let data = documents.remove(1);
                let meta = documents.remove(0)["meta"].clone();
                let file_meta = match meta {
                    Value::Null => ActivityFileMeta::default(),
                    meta => serde_yaml::from_value(meta).map_err(|source| YamlError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?,
                };
                Ok((Some(file_meta), data))
            }
            _ => Err(LoadError::InvalidActivityFile(path.to_path_buf())),
        }
    }

    fn load_team_progress(&self, path: &Path) -> Result<TeamProgressFile> {
        tracing::debug!(path = %path.display(), "Loading team progress");
        let value = self.yaml.load_yaml(path)?;
        if value.is_null() {
            return Ok(TeamProgressFile::default());
        }
        serde_yaml::from_value(value).map_err(|source| LoadError::InvalidProgressFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn resolve(file: &Path, meta_path: &Path) -> Result<PathBuf> {
    Ok(make_full_path(&file.to_string_lossy(), meta_path)?)
}
