//! Activity ingestion, merging and lookup.
//!
//! Activities are held in a single map keyed by uuid. The name index, the
//! category/dimension hierarchy and the per-dimension lists are derived from
//! it and rebuilt after every file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::activity::{Activity, ActivityPatch};
use crate::ignore::{IgnoreKind, IgnoreList};

/// Key marking a category, or a dimension, as ignored.
const IGNORE_KEY: &str = "ignore";

/// Borrowed category → dimension → activity name → activity view.
pub type Data<'a> = BTreeMap<&'a str, BTreeMap<&'a str, BTreeMap<&'a str, &'a Activity>>>;

fn uuid_pattern() -> &'static Regex {
    static UUID: OnceLock<Regex> = OnceLock::new();
    UUID.get_or_init(|| {
        Regex::new(r"(?i)[0-9a-f]{6,}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{6,}")
            .expect("uuid pattern is valid")
    })
}

/// In-memory store of every loaded activity.
#[derive(Debug, Default)]
pub struct ActivityStore {
    /// Activities by uuid
    activities: HashMap<String, Activity>,
    /// Uuids in load order
    order: Vec<String>,
    /// Name → uuid
    by_name: HashMap<String, String>,
    /// Category → dimension → name → uuid
    hierarchy: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    /// Dimension → uuids, in load order
    by_dimension: HashMap<String, Vec<String>>,
    dimension_names: Vec<String>,
    category_names: Vec<String>,
    max_level: Option<u32>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one parsed activity document.
    ///
    /// Conflicts are appended to `errors` and never abort the load: the
    /// offending entry is skipped and everything else is kept.
    pub fn add_activity_file(&mut self, data: &Value, errors: &mut Vec<String>) {
        let (patches, ignore_list) = prepare_activities(data, errors);
        let patches: Vec<ActivityPatch> = patches
            .into_iter()
            .filter(|p| !ignore_list.has_entry(&p.category, &p.dimension, p.uuid.as_deref(), &p.name))
            .collect();
        let incoming = patches.len();

        if self.activities.is_empty() {
            for patch in patches {
                self.add_first_load(patch, errors);
            }
        } else {
            self.remove_ignored_activities(&ignore_list);
            for patch in patches {
                self.merge_activity(patch, errors);
            }
        }

        self.replace_depends_on_uuids();
        self.rebuild_views();

        tracing::info!(
            incoming,
            total = self.order.len(),
            errors = errors.len(),
            "Activity file ingested"
        );
    }

    /// Number of activities.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Hierarchical view of all activities.
    pub fn get_data(&self) -> Data<'_> {
        self.hierarchy
            .iter()
            .map(|(category, dimensions)| {
                let dimensions: BTreeMap<&str, BTreeMap<&str, &Activity>> = dimensions
                    .iter()
                    .map(|(dimension, names)| {
                        let activities: BTreeMap<&str, &Activity> = names
                            .iter()
                            .filter_map(|(name, uuid)| {
                                self.activities.get(uuid).map(|a| (name.as_str(), a))
                            })
                            .collect();
                        (dimension.as_str(), activities)
                    })
                    .collect();
                (category.as_str(), dimensions)
            })
            .collect()
    }

    /// All activities, in load order.
    pub fn get_all_activities(&self) -> Vec<&Activity> {
        self.order
            .iter()
            .filter_map(|uuid| self.activities.get(uuid))
            .collect()
    }

    /// All activities at or below `max_level`; every activity when `None`.
    pub fn get_all_activities_up_to_level(&self, max_level: Option<u32>) -> Vec<&Activity> {
        match max_level {
            None => self.get_all_activities(),
            Some(max) => self
                .get_all_activities()
                .into_iter()
                .filter(|a| a.level <= max)
                .collect(),
        }
    }

    /// Category names in the order they were first seen.
    pub fn get_all_category_names(&self) -> &[String] {
        &self.category_names
    }

    /// Dimension names in the order they were first seen, across categories.
    pub fn get_all_dimension_names(&self) -> &[String] {
        &self.dimension_names
    }

    /// Look up by uuid, falling back to the name.
    pub fn get_activity(&self, uuid: &str, name: &str) -> Option<&Activity> {
        self.get_activity_by_uuid(uuid)
            .or_else(|| self.get_activity_by_name(name))
    }

    /// Activity names are unique across the store.
    pub fn get_activity_by_name(&self, name: &str) -> Option<&Activity> {
        self.by_name
            .get(name)
            .and_then(|uuid| self.activities.get(uuid))
    }

    /// Exact uuid match.
    pub fn get_activity_by_uuid(&self, uuid: &str) -> Option<&Activity> {
        self.activities.get(uuid)
    }

    /// Activities of one dimension at exactly `level`.
    pub fn get_activities(&self, dimension: &str, level: u32) -> Vec<&Activity> {
        self.by_dimension
            .get(dimension)
            .map(|uuids| {
                uuids
                    .iter()
                    .filter_map(|uuid| self.activities.get(uuid))
                    .filter(|a| a.level == level)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest level of any loaded activity, `None` while empty.
    pub fn get_max_level(&self) -> Option<u32> {
        self.max_level
    }

    /// Uuid → activity name, used to annotate persisted progress.
    pub fn activity_names_by_uuid(&self) -> HashMap<String, String> {
        self.activities
            .iter()
            .map(|(uuid, activity)| (uuid.clone(), activity.name.clone()))
            .collect()
    }

    fn add_first_load(&mut self, patch: ActivityPatch, errors: &mut Vec<String>) {
        let Some(uuid) = patch.uuid.clone() else {
            errors.push(missing_uuid_message(&patch));
            return;
        };

        let uuid_of_name = self.by_name.get(&patch.name).cloned();
        let name_of_uuid = self.activities.get(&uuid).map(|a| a.name.clone());

        match (uuid_of_name, name_of_uuid) {
            (Some(_), Some(_)) => errors.push(format!(
                "Duplicate activity '{}' ({}). Please remove one from your activity yaml files.",
                patch.name, uuid
            )),
            (Some(other_uuid), None) => errors.push(format!(
                "Duplicate activity name '{}' ({} and {}). Please remove or rename one of the activities.",
                patch.name, uuid, other_uuid
            )),
            (None, Some(other_name)) => errors.push(format!(
                "Duplicate activity uuid '{}' ('{}' and '{}').",
                uuid, patch.name, other_name
            )),
            (None, None) => self.insert(Activity::from_patch(patch)),
        }
    }

    /// Merge an entry from a later file into the loaded set.
    ///
    /// An entry with a uuid updates the activity with that uuid; one without
    /// a uuid updates the activity with the same name. Anything else is new.
    fn merge_activity(&mut self, patch: ActivityPatch, errors: &mut Vec<String>) {
        let target = match patch.uuid.clone() {
            None => match self.by_name.get(&patch.name) {
                Some(uuid) => uuid.clone(),
                None => {
                    errors.push(missing_uuid_message(&patch));
                    return;
                }
            },
            Some(uuid) if self.activities.contains_key(&uuid) => uuid,
            Some(uuid) => {
                if let Some(existing) = self.by_name.get(&patch.name) {
                    errors.push(format!(
                        "The activity '{}' exists with different uuids ({} and {})",
                        patch.name, uuid, existing
                    ));
                } else {
                    tracing::debug!(uuid = %uuid, name = %patch.name, "Adding activity");
                    self.insert(Activity::from_patch(patch));
                }
                return;
            }
        };

        self.update_activity(&target, patch, errors);
    }

    fn update_activity(&mut self, uuid: &str, patch: ActivityPatch, errors: &mut Vec<String>) {
        if let Some(owner) = self.by_name.get(&patch.name) {
            if owner != uuid {
                errors.push(format!(
                    "Duplicate activity name '{}' ({} and {}). Please remove or rename one of the activities.",
                    patch.name, uuid, owner
                ));
                return;
            }
        }

        let Some(activity) = self.activities.get_mut(uuid) else {
            return;
        };
        if activity.name != patch.name {
            tracing::debug!(uuid, from = %activity.name, to = %patch.name, "Renaming activity");
            self.by_name.remove(&activity.name);
            self.by_name.insert(patch.name.clone(), uuid.to_string());
        }
        activity.apply(patch);
    }

    fn insert(&mut self, activity: Activity) {
        self.by_name
            .insert(activity.name.clone(), activity.uuid.clone());
        self.order.push(activity.uuid.clone());
        self.activities.insert(activity.uuid.clone(), activity);
    }

    /// Drop already loaded activities matched by a later file's ignore markers.
    fn remove_ignored_activities(&mut self, ignore_list: &IgnoreList) {
        if ignore_list.is_empty() {
            return;
        }

        let removed: HashSet<String> = self
            .activities
            .values()
            .filter(|a| ignore_list.has_activity(a))
            .map(|a| a.uuid.clone())
            .collect();

        for uuid in &removed {
            if let Some(activity) = self.activities.remove(uuid) {
                tracing::debug!(uuid = %uuid, name = %activity.name, "Removing ignored activity");
                self.by_name.remove(&activity.name);
            }
        }
        self.order.retain(|uuid| !removed.contains(uuid));
    }

    /// Replace uuid references in `depends_on` with activity names.
    ///
    /// References that match no loaded activity are left untouched.
    fn replace_depends_on_uuids(&mut self) {
        let names = self.activity_names_by_uuid();
        let pattern = uuid_pattern();

        for activity in self.activities.values_mut() {
            for dependency in activity.depends_on.iter_mut() {
                if !pattern.is_match(dependency) {
                    continue;
                }
                if let Some(name) = names.get(dependency.as_str()) {
                    *dependency = name.clone();
                }
            }
        }
    }

    fn rebuild_views(&mut self) {
        self.hierarchy.clear();
        self.by_dimension.clear();
        self.dimension_names.clear();
        self.category_names.clear();
        self.max_level = None;

        for uuid in &self.order {
            let Some(activity) = self.activities.get(uuid) else {
                continue;
            };

            self.hierarchy
                .entry(activity.category.clone())
                .or_default()
                .entry(activity.dimension.clone())
                .or_default()
                .insert(activity.name.clone(), uuid.clone());

            if !self.category_names.contains(&activity.category) {
                self.category_names.push(activity.category.clone());
            }
            if !self.by_dimension.contains_key(&activity.dimension) {
                self.dimension_names.push(activity.dimension.clone());
            }
            self.by_dimension
                .entry(activity.dimension.clone())
                .or_default()
                .push(uuid.clone());

            self.max_level = Some(self.max_level.map_or(activity.level, |m| m.max(activity.level)));
        }
    }
}

fn missing_uuid_message(patch: &ActivityPatch) -> String {
    format!(
        "The activity '{}' ({} / {}) has no uuid and matches no existing activity.",
        patch.name, patch.category, patch.dimension
    )
}

/// Flatten a category → dimension → activity document into patches.
///
/// Ignore markers are collected instead of producing patches.
fn prepare_activities(data: &Value, errors: &mut Vec<String>) -> (Vec<ActivityPatch>, IgnoreList) {
    let mut patches = Vec::new();
    let mut ignore_list = IgnoreList::new();

    let Some(categories) = as_mapping(data, "The activity file", errors) else {
        return (patches, ignore_list);
    };

    for (category_key, category) in categories {
        let Some(category_name) = key_name(category_key, errors) else {
            continue;
        };
        let Some(dimensions) = as_mapping(category, &format!("Category '{}'", category_name), errors)
        else {
            continue;
        };

        for (dimension_key, dimension) in dimensions {
            let Some(dimension_name) = key_name(dimension_key, errors) else {
                continue;
            };
            if dimension_name == IGNORE_KEY {
                if marker_is_set(dimension) {
                    ignore_list.add(IgnoreKind::Category, category_name);
                }
                continue;
            }
            let Some(activities) =
                as_mapping(dimension, &format!("Dimension '{}'", dimension_name), errors)
            else {
                continue;
            };

            for (activity_key, entry) in activities {
                let Some(activity_name) = key_name(activity_key, errors) else {
                    continue;
                };
                if activity_name == IGNORE_KEY {
                    if marker_is_set(entry) {
                        ignore_list.add(IgnoreKind::Dimension, dimension_name);
                    }
                    continue;
                }

                let patch = match parse_patch(entry) {
                    Ok(patch) => patch.placed(category_name, dimension_name, activity_name),
                    Err(e) => {
                        errors.push(format!("Invalid activity '{}': {}", activity_name, e));
                        continue;
                    }
                };

                if patch.ignore {
                    match &patch.uuid {
                        Some(uuid) => ignore_list.add(IgnoreKind::Uuid, uuid.as_str()),
                        None => ignore_list.add(IgnoreKind::Name, activity_name),
                    }
                    continue;
                }

                patches.push(patch);
            }
        }
    }

    (patches, ignore_list)
}

fn parse_patch(entry: &Value) -> Result<ActivityPatch, serde_yaml::Error> {
    if entry.is_null() {
        return Ok(ActivityPatch::default());
    }
    serde_yaml::from_value(entry.clone())
}

fn as_mapping<'a>(value: &'a Value, what: &str, errors: &mut Vec<String>) -> Option<&'a Mapping> {
    match value {
        Value::Mapping(mapping) => Some(mapping),
        Value::Null => None,
        _ => {
            errors.push(format!("{} must be a mapping", what));
            None
        }
    }
}

fn key_name<'a>(key: &'a Value, errors: &mut Vec<String>) -> Option<&'a str> {
    match key.as_str() {
        Some(name) => Some(name),
        None => {
            errors.push(format!("Unsupported key {:?}, expected a name", key));
            None
        }
    }
}

/// An `ignore` key counts unless it is explicitly `false`.
fn marker_is_set(value: &Value) -> bool {
    value.as_bool() != Some(false)
}
