//! Loading assessment data from a meta.yaml tree on disk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsomm_model::meta::MetaError;
use dsomm_model::{DataLoader, FileStorage, LoadError, MemoryStorage, StateStorage, YamlError};
use tempfile::TempDir;

const BUILD_UUID: &str = "f6f7737f-25a9-4317-8de2-09bf59f29b5b";
const ARTIFACTS_UUID: &str = "82e499d5-9e2d-4d4e-8d74-5d4f9b3b9c2b";

const META: &str = r#"
lang: en
strings:
  en:
    $ref: labels.yaml#/en
progressDefinition:
  Not started: { score: 0, definition: Nothing done yet }
  Started: { score: "25%" }
  Implemented: { score: "75%" }
  Completed: { score: "100%" }
teams: [Team A, Team B]
teamGroups:
  Default: [Team A, Team B, Team X]
activityFiles:
  - default/activities.yaml
  - custom/overrides.yaml
teamProgressFile: team-progress.yaml
"#;

const LABELS: &str = r#"
en:
  allTeamsGroupName: All
  knowledgeLabels: [Very low, Low, Medium, High, Very high]
"#;

const ACTIVITIES: &str = r#"---
meta:
  dsommVersion: 1.2.0
---
Build and Deployment:
  Build:
    Defined build process:
      uuid: f6f7737f-25a9-4317-8de2-09bf59f29b5b
      level: 1
      description: The build is **documented**.
    Building and testing of artifacts in virtual environments:
      uuid: 82e499d5-9e2d-4d4e-8d74-5d4f9b3b9c2b
      level: 2
      dependsOn:
        - f6f7737f-25a9-4317-8de2-09bf59f29b5b
  Deployment:
    Defined deployment process:
      uuid: 74938a3f-1269-49b9-9d0f-c43a79a1985a
      level: 1
Culture and Organization:
  Education and Guidance:
    Security awareness training:
      uuid: 9d3a3c0e-3b6e-4f1b-9a3e-2c0b6f1d9e11
      level: 1
"#;

const OVERRIDES: &str = r#"
Build and Deployment:
  Deployment:
    ignore: true
  Build:
    Defined build process:
      level: 2
Culture and Organization:
  Education and Guidance:
    Security champions:
      uuid: 0b3c8f8e-1111-4a4a-9b9b-0123456789ab
      level: 3
"#;

const TEAM_PROGRESS: &str = r#"
progress:
  f6f7737f-25a9-4317-8de2-09bf59f29b5b:
    'Team A':
      'Started': 2024-01-10
      'Implemented': 2024-02-01
"#;

// ============================================================================
// Fixtures
// ============================================================================

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// A complete data tree; returns the path of meta.yaml.
fn data_tree(root: &Path) -> PathBuf {
    write(root, "yaml/meta.yaml", META);
    write(root, "yaml/labels.yaml", LABELS);
    write(root, "yaml/default/activities.yaml", ACTIVITIES);
    write(root, "yaml/custom/overrides.yaml", OVERRIDES);
    write(root, "yaml/team-progress.yaml", TEAM_PROGRESS);
    root.join("yaml/meta.yaml")
}

fn memory_loader() -> DataLoader {
    DataLoader::new(Arc::new(MemoryStorage::new()))
}

/// meta.yaml listing a single activity file.
fn single_file_meta(activity_file: &str) -> String {
    format!(
        r#"
progressDefinition:
  Not started: {{ score: 0 }}
  Completed: {{ score: 1 }}
teams: [Team A]
activityFiles: [{}]
teamProgressFile: team-progress.yaml
"#,
        activity_file
    )
}

const DUPLICATE_NAMES: &str = r#"
Build and Deployment:
  Build:
    Shared name:
      uuid: 11111111-1111-1111-1111-111111111111
      level: 1
  Deployment:
    Shared name:
      uuid: 22222222-2222-2222-2222-222222222222
      level: 1
"#;

// ============================================================================
// Successful loads
// ============================================================================

#[test]
fn test_load_complete_data() {
    let dir = TempDir::new().unwrap();
    let meta_path = data_tree(dir.path());

    let data = memory_loader().load(&meta_path).unwrap();
    let activities = &data.activity_store;

    // Deployment is ignored by the override file, Security champions added
    assert_eq!(activities.len(), 4);
    assert_eq!(data.get_max_level(), Some(3));
    assert!(!activities
        .get_all_dimension_names()
        .contains(&"Deployment".to_string()));

    let build = activities.get_activity_by_name("Defined build process").unwrap();
    assert_eq!(build.uuid, BUILD_UUID);
    assert_eq!(build.level, 2);
    assert!(build.description.render().contains("<strong>documented</strong>"));

    let artifacts = activities.get_activity_by_uuid(ARTIFACTS_UUID).unwrap();
    assert_eq!(artifacts.depends_on, ["Defined build process"]);

    let meta = data.meta.as_ref().unwrap();
    assert_eq!(meta.team_groups["Default"], ["Team A", "Team B"]);
    assert_eq!(
        meta.activity_meta.as_ref().unwrap().get_dsomm_version(),
        Some("1.2.0")
    );
    assert_eq!(
        meta.activity_files[1],
        dir.path().join("yaml/custom/overrides.yaml")
    );
    assert_eq!(data.get_meta_string("allTeamsGroupName", 0), "All");
    assert_eq!(data.get_meta_string("knowledgeLabels", 4), "Very high");

    let progress = &data.progress_store;
    assert_eq!(
        progress.get_team_progress_title(BUILD_UUID, "Team A"),
        Some("Implemented")
    );
    assert_eq!(progress.get_team_activity_progress_value(BUILD_UUID, "Team A", false), 0.75);
    assert_eq!(
        progress.get_team_progress_title(BUILD_UUID, "Team B"),
        Some("Not started")
    );
}

#[test]
fn test_stored_progress_survives_reload() {
    let dir = TempDir::new().unwrap();
    let meta_path = data_tree(dir.path());
    let storage = Arc::new(FileStorage::new(dir.path().join("state")));

    let mut data = DataLoader::new(storage.clone()).load(&meta_path).unwrap();
    data.progress_store
        .set_team_activity_progress_state(ARTIFACTS_UUID, "Team B", "Completed")
        .unwrap();

    let stored = storage.get_item("progress").unwrap().unwrap();
    assert!(stored.contains(&format!(
        "'{}':  # Building and testing of artifacts in virtual environments",
        ARTIFACTS_UUID
    )));

    let reloaded = DataLoader::new(storage).load(&meta_path).unwrap();
    let progress = &reloaded.progress_store;
    assert_eq!(
        progress.get_team_progress_title(ARTIFACTS_UUID, "Team B"),
        Some("Completed")
    );
    assert_eq!(
        progress.get_team_progress_title(BUILD_UUID, "Team A"),
        Some("Implemented")
    );
}

#[test]
fn test_generated_file_errors_are_only_logged() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "meta.yaml", &single_file_meta("generated/generated.yaml"));
    write(dir.path(), "generated/generated.yaml", DUPLICATE_NAMES);
    write(dir.path(), "team-progress.yaml", "");

    let data = memory_loader().load(&dir.path().join("meta.yaml")).unwrap();
    assert_eq!(data.activity_store.len(), 1);
}

// ============================================================================
// Rejected data
// ============================================================================

#[test]
fn test_duplicate_activities_abort_loading() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "meta.yaml", &single_file_meta("activities.yaml"));
    write(dir.path(), "activities.yaml", DUPLICATE_NAMES);
    write(dir.path(), "team-progress.yaml", "");

    let err = memory_loader()
        .load(&dir.path().join("meta.yaml"))
        .err()
        .unwrap();
    match err {
        LoadError::DataValidation(message) => {
            assert!(message.starts_with("Data validation error after loading:"));
            assert_eq!(message.matches("Duplicate activity name 'Shared name'").count(), 1);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_invalid_progress_definition() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "meta.yaml",
        r#"
progressDefinition:
  Started: { score: "150%" }
activityFiles: [activities.yaml]
teamProgressFile: team-progress.yaml
"#,
    );

    let err = memory_loader()
        .load(&dir.path().join("meta.yaml"))
        .err()
        .unwrap();
    match err {
        LoadError::Meta(MetaError::InvalidProgressDefinition(errors)) => {
            assert_eq!(errors.len(), 3);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_missing_activity_files() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "meta.yaml", "teamProgressFile: team-progress.yaml\n");

    let err = memory_loader()
        .load(&dir.path().join("meta.yaml"))
        .err()
        .unwrap();
    assert!(matches!(err, LoadError::Meta(MetaError::Missing("activityFiles"))));
    assert_eq!(err.to_string(), "The meta.yaml has no 'activityFiles' to be loaded");
}

#[test]
fn test_activity_file_outside_root() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "yaml/meta.yaml", &single_file_meta("../outside.yaml"));
    write(dir.path(), "outside.yaml", DUPLICATE_NAMES);

    let err = memory_loader()
        .load(&dir.path().join("yaml/meta.yaml"))
        .err()
        .unwrap();
    assert!(matches!(err, LoadError::Yaml(YamlError::PathOutsideRoot { .. })));
}

#[test]
fn test_activity_file_with_too_many_documents() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "meta.yaml", &single_file_meta("activities.yaml"));
    write(dir.path(), "activities.yaml", "---\na: {}\n---\nb: {}\n---\nc: {}\n");
    write(dir.path(), "team-progress.yaml", "");

    let err = memory_loader()
        .load(&dir.path().join("meta.yaml"))
        .err()
        .unwrap();
    assert!(matches!(err, LoadError::InvalidActivityFile(_)));
}
