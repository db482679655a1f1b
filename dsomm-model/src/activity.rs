//! Activity records as loaded from activity YAML files.
//!
//! An activity file is parsed into [`ActivityPatch`] values, one per
//! activity entry. The first file to mention an activity creates the
//! [`Activity`]; later files update it field by field through
//! [`Activity::apply`], so only the fields an override actually names are
//! replaced.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::markdown::MarkdownText;

/// One maturity assessment item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Stable identifier
    pub uuid: String,
    /// Human readable key, unique across the loaded set
    pub name: String,
    pub category: String,
    pub dimension: String,
    /// Maturity tier
    pub level: u32,
    pub description: MarkdownText,
    pub risk: MarkdownText,
    pub measure: MarkdownText,
    pub implementation_guide: MarkdownText,
    pub comments: MarkdownText,
    pub assessment: MarkdownText,
    pub evidence: MarkdownText,
    pub tags: Vec<String>,
    /// Prerequisite activities, by uuid until resolved to names
    pub depends_on: Vec<String>,
    pub references: FrameworkReferences,
    pub implementation: Vec<Implementation>,
    pub difficulty_of_implementation: DifficultyOfImplementation,
    pub usefulness: u32,
    /// Free text evidence per team
    pub teams_evidence: BTreeMap<String, String>,
}

impl Activity {
    /// Create an activity from the first entry that mentions it.
    pub fn from_patch(patch: ActivityPatch) -> Self {
        let mut activity = Self {
            uuid: String::new(),
            name: String::new(),
            category: String::new(),
            dimension: String::new(),
            level: 0,
            description: MarkdownText::default(),
            risk: MarkdownText::default(),
            measure: MarkdownText::default(),
            implementation_guide: MarkdownText::default(),
            comments: MarkdownText::default(),
            assessment: MarkdownText::default(),
            evidence: MarkdownText::default(),
            tags: Vec::new(),
            depends_on: Vec::new(),
            references: FrameworkReferences::default(),
            implementation: Vec::new(),
            difficulty_of_implementation: DifficultyOfImplementation::default(),
            usefulness: 0,
            teams_evidence: BTreeMap::new(),
        };
        activity.apply(patch);
        activity
    }

    /// Overwrite every field the patch carries.
    ///
    /// Placement (category, dimension, name) always follows the patch since
    /// it comes from where the entry sits in its file.
    pub fn apply(&mut self, patch: ActivityPatch) {
        self.category = patch.category;
        self.dimension = patch.dimension;
        self.name = patch.name;

        if let Some(uuid) = patch.uuid {
            self.uuid = uuid;
        }
        if let Some(level) = patch.level {
            self.level = level;
        }
        if let Some(text) = patch.description {
            self.description = MarkdownText::new(text);
        }
        if let Some(text) = patch.risk {
            self.risk = MarkdownText::new(text);
        }
        if let Some(text) = patch.measure {
            self.measure = MarkdownText::new(text);
        }
        if let Some(text) = patch.implementation_guide {
            self.implementation_guide = MarkdownText::new(text);
        }
        if let Some(text) = patch.comments {
            self.comments = MarkdownText::new(text);
        }
        if let Some(text) = patch.assessment {
            self.assessment = MarkdownText::new(text);
        }
        if let Some(text) = patch.evidence {
            self.evidence = MarkdownText::new(text);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(depends_on) = patch.depends_on {
            self.depends_on = depends_on;
        }
        if let Some(references) = patch.references {
            self.references = references;
        }
        if let Some(implementation) = patch.implementation {
            self.implementation = implementation;
        }
        if let Some(difficulty) = patch.difficulty_of_implementation {
            self.difficulty_of_implementation = difficulty;
        }
        if let Some(usefulness) = patch.usefulness {
            self.usefulness = usefulness;
        }
        if let Some(teams_evidence) = patch.teams_evidence {
            self.teams_evidence = teams_evidence;
        }
    }
}

/// An activity entry exactly as one file states it.
///
/// Absent fields stay `None` and leave the existing value untouched when
/// the patch is applied to an activity loaded earlier.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
    /// Set from the entry's position in the file
    #[serde(skip)]
    pub category: String,
    #[serde(skip)]
    pub dimension: String,
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub ignore: bool,
    pub uuid: Option<String>,
    pub level: Option<u32>,
    pub description: Option<String>,
    pub risk: Option<String>,
    pub measure: Option<String>,
    pub implementation_guide: Option<String>,
    pub comments: Option<String>,
    pub assessment: Option<String>,
    pub evidence: Option<String>,
    #[serde(default, deserialize_with = "optional_string_list")]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "optional_string_list")]
    pub depends_on: Option<Vec<String>>,
    pub references: Option<FrameworkReferences>,
    pub implementation: Option<Vec<Implementation>>,
    pub difficulty_of_implementation: Option<DifficultyOfImplementation>,
    pub usefulness: Option<u32>,
    pub teams_evidence: Option<BTreeMap<String, String>>,
}

impl ActivityPatch {
    /// Stamp the entry with where it was found.
    pub fn placed(
        mut self,
        category: impl Into<String>,
        dimension: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.category = category.into();
        self.dimension = dimension.into();
        self.name = name.into();
        self
    }
}

/// Cross references into security frameworks.
///
/// The hyphenated ISO keys used by older activity files are accepted as
/// aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkReferences {
    #[serde(
        rename = "iso27001_2017",
        alias = "iso27001-2017",
        default,
        deserialize_with = "string_list"
    )]
    pub iso27001_2017: Vec<String>,
    #[serde(
        rename = "iso27001_2022",
        alias = "iso27001-2022",
        default,
        deserialize_with = "string_list"
    )]
    pub iso27001_2022: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub samm2: Vec<String>,
    #[serde(rename = "openCRE", default, deserialize_with = "string_list")]
    pub open_cre: Vec<String>,
}

/// A tool or practice that implements an activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string_list")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyOfImplementation {
    #[serde(default)]
    pub knowledge: u32,
    #[serde(default)]
    pub time: u32,
    #[serde(default)]
    pub resources: u32,
}

/// Accept a list of scalars, a single scalar or null as a list of strings.
///
/// Reference lists mix plain strings with values YAML reads as numbers
/// (`8.25`), which all need to end up as strings.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    scalars_to_strings(value).map_err(serde::de::Error::custom)
}

fn optional_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    string_list(deserializer).map(Some)
}

/// A scalar read as a string, null as `None`.
pub(crate) fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Null => Ok(None),
        value => scalar_to_string(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn scalars_to_strings(value: serde_yaml::Value) -> Result<Vec<String>, String> {
    use serde_yaml::Value;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(scalar_to_string)
            .collect(),
        other => scalar_to_string(other).map(|s| vec![s]),
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> Result<String, String> {
    use serde_yaml::Value;

    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected a string, found {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(yaml: &str) -> ActivityPatch {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_legacy_reference_keys_are_normalized() {
        let p = patch(
            r#"
uuid: 00000000-1111-1111-1111-000000000000
references:
  iso27001-2017:
    - 12.1.2
    - 8.25
  iso27001-2022: [5.37]
  samm2: [I-SB-2-A]
"#,
        );

        let references = p.references.unwrap();
        assert_eq!(references.iso27001_2017, vec!["12.1.2", "8.25"]);
        assert_eq!(references.iso27001_2022, vec!["5.37"]);
        assert_eq!(references.samm2, vec!["I-SB-2-A"]);
        assert!(references.open_cre.is_empty());
    }

    #[test]
    fn test_apply_keeps_absent_fields() {
        let mut activity = Activity::from_patch(
            patch("uuid: abc\nlevel: 1\ndescription: base\nrisk: base risk\n")
                .placed("Category", "Dimension", "Activity"),
        );

        activity.apply(
            patch("level: 3\ndescription: override\n").placed("Category", "Dimension", "Renamed"),
        );

        assert_eq!(activity.uuid, "abc");
        assert_eq!(activity.name, "Renamed");
        assert_eq!(activity.level, 3);
        assert_eq!(activity.description.as_str(), "override");
        assert_eq!(activity.risk.as_str(), "base risk");
    }

    #[test]
    fn test_ignore_flag_defaults_to_false() {
        assert!(!patch("level: 2").ignore);
        assert!(patch("ignore: true").ignore);
    }

    #[test]
    fn test_null_tags_become_empty_list() {
        let p = patch("tags: ~\ndependsOn: [a, b]");
        assert_eq!(p.tags, Some(Vec::new()));
        assert_eq!(p.depends_on, Some(vec!["a".to_string(), "b".to_string()]));
    }
}
