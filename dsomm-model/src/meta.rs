//! Contents of `meta.yaml`: labels, progress stages, teams and the files
//! that make up the assessment data.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::progress::{validate_progress_definitions, ProgressDefinitions, TeamName};
use crate::storage::{StateStorage, StorageError};

/// Storage key for team overrides edited by the user.
pub const META_STORAGE_KEY: &str = "meta";

/// Language used when `lang` is missing or has no label table.
pub const DEFAULT_LANG: &str = "en";

pub type TeamGroups = BTreeMap<String, Vec<TeamName>>;

/// Error types for meta data.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// `meta.yaml` does not have the expected shape
    #[error("Invalid meta.yaml: {0}")]
    Invalid(#[from] serde_yaml::Error),

    /// Progress stages are misconfigured
    #[error(
        "Data validation error for progress definition in meta.yaml: \n\n- {}",
        .0.join("\n- ")
    )]
    InvalidProgressDefinition(Vec<String>),

    /// A required key is missing
    #[error("The meta.yaml has no '{0}' to be loaded")]
    Missing(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MetaFile {
    lang: Option<String>,
    strings: BTreeMap<String, BTreeMap<String, Value>>,
    progress_definition: ProgressDefinitions,
    teams: Vec<TeamName>,
    team_groups: TeamGroups,
    activity_files: Vec<String>,
    team_progress_file: Option<String>,
    allow_change_team_name_in_browser: bool,
}

impl Default for MetaFile {
    fn default() -> Self {
        Self {
            lang: None,
            strings: BTreeMap::new(),
            progress_definition: ProgressDefinitions::default(),
            teams: Vec::new(),
            team_groups: TeamGroups::default(),
            activity_files: Vec::new(),
            team_progress_file: None,
            allow_change_team_name_in_browser: true,
        }
    }
}

/// Teams and groups as persisted under [`META_STORAGE_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTeams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<Vec<TeamName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_groups: Option<TeamGroups>,
}

/// Meta document at the start of an activity file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFileMeta {
    #[serde(default, alias = "version", deserialize_with = "crate::activity::optional_scalar")]
    pub dsomm_version: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl ActivityFileMeta {
    pub fn get_dsomm_version(&self) -> Option<&str> {
        self.dsomm_version.as_deref()
    }

    /// Whether this file declares a later version than `other`.
    pub fn is_newer_than(&self, other: Option<&ActivityFileMeta>) -> bool {
        let Some(version) = self.get_dsomm_version() else {
            return false;
        };
        match other.and_then(ActivityFileMeta::get_dsomm_version) {
            None => true,
            Some(existing) => compare_versions(version, existing) == Ordering::Greater,
        }
    }
}

/// Compare dotted versions numerically where both parts are numbers,
/// textually otherwise. A leading `v` is ignored.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<String> {
        v.trim()
            .trim_start_matches(['v', 'V'])
            .split(['.', '-'])
            .map(str::to_string)
            .collect()
    };
    let (a, b) = (parts(a), parts(b));

    for (x, y) in a.iter().zip(&b) {
        let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Configuration loaded from `meta.yaml`.
pub struct MetaStore {
    pub lang: String,
    pub strings: BTreeMap<String, BTreeMap<String, Value>>,
    pub progress_definition: ProgressDefinitions,
    pub teams: Vec<TeamName>,
    pub team_groups: TeamGroups,
    /// Paths as written in `meta.yaml` until the loader resolves them
    pub activity_files: Vec<PathBuf>,
    pub team_progress_file: Option<PathBuf>,
    pub allow_change_team_name_in_browser: bool,
    /// Meta document of the activity file with the highest version
    pub activity_meta: Option<ActivityFileMeta>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl MetaStore {
    /// Read the parsed `meta.yaml` document.
    pub fn from_value(value: Value) -> Result<Self, MetaError> {
        let file: MetaFile = match value {
            Value::Null => MetaFile::default(),
            value => serde_yaml::from_value(value)?,
        };

        Ok(Self {
            lang: file.lang.unwrap_or_else(|| DEFAULT_LANG.to_string()),
            strings: file.strings,
            progress_definition: file.progress_definition,
            teams: file.teams,
            team_groups: file.team_groups,
            activity_files: file.activity_files.into_iter().map(PathBuf::from).collect(),
            team_progress_file: file.team_progress_file.map(PathBuf::from),
            allow_change_team_name_in_browser: file.allow_change_team_name_in_browser,
            activity_meta: None,
            storage: None,
        })
    }

    /// Persist team changes through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Fail with every problem of the progress definition at once.
    pub fn validate_progress_definition(&self) -> Result<(), MetaError> {
        let errors = validate_progress_definitions(&self.progress_definition);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MetaError::InvalidProgressDefinition(errors))
        }
    }

    /// Apply stored team overrides, then drop group members that are not
    /// teams.
    ///
    /// Stored overrides are only honoured while renaming teams is allowed.
    pub fn load_teams_and_groups(&mut self) -> Result<(), MetaError> {
        if self.allow_change_team_name_in_browser {
            if let Some(stored) = self.retrieve_stored_teams()? {
                if let Some(teams) = stored.teams {
                    tracing::info!(count = teams.len(), "Using stored teams");
                    self.teams = teams;
                }
                if let Some(groups) = stored.team_groups {
                    self.team_groups = groups;
                }
            }
        }
        self.filter_groups();
        Ok(())
    }

    /// Replace teams and groups and persist them.
    pub fn update_teams_and_groups(
        &mut self,
        teams: Vec<TeamName>,
        team_groups: TeamGroups,
    ) -> Result<(), MetaError> {
        self.teams = teams;
        self.team_groups = team_groups;
        self.filter_groups();
        self.save_to_storage()
    }

    pub fn save_to_storage(&self) -> Result<(), MetaError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let stored = StoredTeams {
            teams: Some(self.teams.clone()),
            team_groups: Some(self.team_groups.clone()),
        };
        storage.set_item(META_STORAGE_KEY, &serde_yaml::to_string(&stored)?)?;
        Ok(())
    }

    /// Teams and groups saved by an earlier run, if any.
    pub fn retrieve_stored_teams(&self) -> Result<Option<StoredTeams>, MetaError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        match storage.get_item(META_STORAGE_KEY)? {
            Some(yaml) if !yaml.trim().is_empty() => Ok(Some(serde_yaml::from_str(&yaml)?)),
            _ => Ok(None),
        }
    }

    pub fn delete_stored_teams(&self) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.remove_item(META_STORAGE_KEY),
            None => Ok(()),
        }
    }

    /// Teams of a group; every team for an unknown group.
    pub fn teams_in_group(&self, group: &str) -> &[TeamName] {
        self.team_groups.get(group).map_or(&self.teams[..], Vec::as_slice)
    }

    /// Label `key` in the configured language.
    ///
    /// List valued labels are indexed by `index`. Falls back to the default
    /// language, then to the key itself.
    pub fn get_meta_string(&self, key: &str, index: usize) -> String {
        [self.lang.as_str(), DEFAULT_LANG]
            .iter()
            .filter_map(|lang| self.strings.get(*lang)?.get(key))
            .find_map(|value| match value {
                Value::Sequence(items) => items.get(index).and_then(label_text),
                other => label_text(other),
            })
            .unwrap_or_else(|| key.to_string())
    }

    fn filter_groups(&mut self) {
        let teams = &self.teams;
        for (group, members) in self.team_groups.iter_mut() {
            let before = members.len();
            members.retain(|team| teams.contains(team));
            if members.len() != before {
                tracing::warn!(group = %group, dropped = before - members.len(), "Dropped unknown teams from group");
            }
        }
    }
}

fn label_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const META: &str = r#"
lang: de
strings:
  en:
    allTeamsGroupName: All
    knowledgeLabels: [Very low, Low, Medium, High, Very high]
  de:
    allTeamsGroupName: Alle
progressDefinition:
  Not started: { score: 0 }
  Started: { score: "30%" }
  Completed: { score: "100%" }
teams: [Team A, Team B]
teamGroups:
  Backend: [Team A, Team C]
activityFiles: [default/activities.yaml]
teamProgressFile: team-progress.yaml
"#;

    fn meta() -> MetaStore {
        MetaStore::from_value(serde_yaml::from_str(META).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_meta() {
        let meta = meta();
        assert_eq!(meta.lang, "de");
        assert_eq!(meta.progress_definition["Started"].score, 0.3);
        assert_eq!(meta.activity_files, [PathBuf::from("default/activities.yaml")]);
        assert!(meta.allow_change_team_name_in_browser);
        assert!(meta.validate_progress_definition().is_ok());
    }

    #[test]
    fn test_empty_meta_allows_team_changes() {
        let empty = MetaStore::from_value(Value::Null).unwrap();
        assert!(empty.allow_change_team_name_in_browser);
        assert_eq!(empty.lang, DEFAULT_LANG);

        let partial = MetaStore::from_value(serde_yaml::from_str("teams: [Team A]").unwrap()).unwrap();
        assert!(partial.allow_change_team_name_in_browser);

        let locked =
            MetaStore::from_value(serde_yaml::from_str("allowChangeTeamNameInBrowser: false").unwrap())
                .unwrap();
        assert!(!locked.allow_change_team_name_in_browser);
    }

    #[test]
    fn test_invalid_progress_definition() {
        let mut meta = meta();
        meta.progress_definition.remove("Completed");

        let err = meta.validate_progress_definition().unwrap_err();
        assert!(err.to_string().contains("\n- The progressDefinition must specify a name for 100% completed"));
    }

    #[test]
    fn test_meta_strings() {
        let meta = meta();
        assert_eq!(meta.get_meta_string("allTeamsGroupName", 0), "Alle");
        assert_eq!(meta.get_meta_string("knowledgeLabels", 2), "Medium");
        assert_eq!(meta.get_meta_string("knowledgeLabels", 9), "knowledgeLabels");
        assert_eq!(meta.get_meta_string("missing", 0), "missing");
    }

    #[test]
    fn test_groups_drop_unknown_teams() {
        let mut meta = meta();
        meta.load_teams_and_groups().unwrap();
        assert_eq!(meta.team_groups["Backend"], ["Team A"]);
        assert_eq!(meta.teams_in_group("Backend"), ["Team A"]);
        assert_eq!(meta.teams_in_group("Unknown").len(), 2);
    }

    #[test]
    fn test_stored_teams_override_file() {
        let storage = Arc::new(MemoryStorage::new());
        let mut meta = meta().with_storage(storage.clone());
        meta.update_teams_and_groups(
            vec!["Team C".to_string()],
            TeamGroups::from([("Backend".to_string(), vec!["Team C".to_string()])]),
        )
        .unwrap();

        let mut reloaded = self::meta().with_storage(storage.clone());
        reloaded.load_teams_and_groups().unwrap();
        assert_eq!(reloaded.teams, ["Team C"]);
        assert_eq!(reloaded.team_groups["Backend"], ["Team C"]);

        let mut locked = self::meta().with_storage(storage);
        locked.allow_change_team_name_in_browser = false;
        locked.load_teams_and_groups().unwrap();
        assert_eq!(locked.teams, ["Team A", "Team B"]);
    }

    #[test]
    fn test_activity_file_versions() {
        let old: ActivityFileMeta = serde_yaml::from_str("dsommVersion: 1.9.0").unwrap();
        let new: ActivityFileMeta = serde_yaml::from_str("version: 1.10.0\nreleased: 2024-05-01").unwrap();
        let none = ActivityFileMeta::default();

        assert!(new.is_newer_than(Some(&old)));
        assert!(!old.is_newer_than(Some(&new)));
        assert!(old.is_newer_than(None));
        assert!(old.is_newer_than(Some(&none)));
        assert!(!none.is_newer_than(None));
        assert!(new.other.contains_key("released"));
    }
}
