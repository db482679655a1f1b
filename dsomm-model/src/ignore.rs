//! Exclusion markers collected while reading an activity file.

use std::collections::{HashMap, HashSet};

use crate::activity::Activity;

/// What an ignore marker matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreKind {
    Category,
    Dimension,
    Uuid,
    Name,
}

impl IgnoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Dimension => "dimension",
            Self::Uuid => "uuid",
            Self::Name => "name",
        }
    }
}

/// Identifiers to drop, grouped by the activity field they match.
///
/// Dimensions are matched by bare name, so an ignored dimension removes
/// same-named dimensions in every category.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    entries: HashMap<IgnoreKind, HashSet<String>>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: IgnoreKind, id: impl Into<String>) {
        let id = id.into();
        tracing::debug!(kind = kind.as_str(), id = %id, "Ignore marker");
        self.entries.entry(kind).or_default().insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(HashSet::is_empty)
    }

    pub fn contains(&self, kind: IgnoreKind, id: &str) -> bool {
        self.entries
            .get(&kind)
            .map(|ids| ids.contains(id))
            .unwrap_or(false)
    }

    /// Whether any of the activity's fields is listed for its kind.
    pub fn has_activity(&self, activity: &Activity) -> bool {
        self.has_entry(
            &activity.category,
            &activity.dimension,
            Some(&activity.uuid),
            &activity.name,
        )
    }

    /// Same test for an entry that may not carry a uuid yet.
    pub fn has_entry(&self, category: &str, dimension: &str, uuid: Option<&str>, name: &str) -> bool {
        self.contains(IgnoreKind::Category, category)
            || self.contains(IgnoreKind::Dimension, dimension)
            || uuid.is_some_and(|uuid| self.contains(IgnoreKind::Uuid, uuid))
            || self.contains(IgnoreKind::Name, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPatch;

    fn activity(category: &str, dimension: &str, name: &str, uuid: &str) -> Activity {
        Activity::from_patch(
            ActivityPatch {
                uuid: Some(uuid.to_string()),
                ..Default::default()
            }
            .placed(category, dimension, name),
        )
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let list = IgnoreList::new();
        assert!(list.is_empty());
        assert!(!list.has_activity(&activity("C", "D", "A", "u-1")));
    }

    #[test]
    fn test_each_kind_matches_its_field() {
        let a = activity("Build", "Pipeline", "Signed artifacts", "u-1");

        for (kind, id) in [
            (IgnoreKind::Category, "Build"),
            (IgnoreKind::Dimension, "Pipeline"),
            (IgnoreKind::Uuid, "u-1"),
            (IgnoreKind::Name, "Signed artifacts"),
        ] {
            let mut list = IgnoreList::new();
            list.add(kind, id);
            assert!(!list.is_empty());
            assert!(list.has_activity(&a), "{} should match", kind.as_str());
        }
    }

    #[test]
    fn test_dimension_matches_across_categories() {
        let mut list = IgnoreList::new();
        list.add(IgnoreKind::Dimension, "Shared");

        assert!(list.has_activity(&activity("One", "Shared", "A", "u-1")));
        assert!(list.has_activity(&activity("Two", "Shared", "B", "u-2")));
        assert!(!list.has_activity(&activity("Two", "Other", "C", "u-3")));
    }

    #[test]
    fn test_kinds_do_not_cross_match() {
        let mut list = IgnoreList::new();
        list.add(IgnoreKind::Name, "u-1");
        assert!(!list.has_activity(&activity("C", "D", "A", "u-1")));
    }
}
