//! Progress value types.
//!
//! Progress is recorded per activity and team as the date each named stage
//! ("progress title") was reached. Stage names and their order come from the
//! `progressDefinition` section of `meta.yaml`.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type Uuid = String;
pub type TeamName = String;
pub type ProgressTitle = String;

/// Title → date the stage was reached.
pub type TeamProgress = BTreeMap<ProgressTitle, NaiveDate>;

/// Activity uuid → team → stage dates.
pub type Progress = BTreeMap<Uuid, BTreeMap<TeamName, TeamProgress>>;

/// Title → definition, as configured in `meta.yaml`.
pub type ProgressDefinitions = BTreeMap<ProgressTitle, ProgressDefinition>;

/// One configured progress stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressDefinition {
    /// Completion fraction, 0.0 for "not started" and 1.0 for "completed".
    ///
    /// Accepts plain numbers and percentage strings such as `"50%"`.
    #[serde(deserialize_with = "deserialize_score")]
    pub score: f64,
    /// What a team must have done to reach this stage
    #[serde(default)]
    pub definition: String,
}

impl ProgressDefinition {
    pub fn new(score: f64, definition: impl Into<String>) -> Self {
        Self {
            score,
            definition: definition.into(),
        }
    }
}

/// Check scores are fractions and that both ends of the scale are named.
///
/// Returns every problem found rather than stopping at the first.
pub fn validate_progress_definitions(definitions: &ProgressDefinitions) -> Vec<String> {
    let mut errors = Vec::new();

    for (title, definition) in definitions {
        if !(0.0..=1.0).contains(&definition.score) {
            errors.push(format!(
                "The progress value for '{}' must be between 0% and 100%",
                title
            ));
        }
    }

    let scores = || definitions.values().map(|d| d.score);
    if !scores().any(|s| s == 0.0) {
        errors.push("The progressDefinition must specify a name for 0% completed".to_string());
    }
    if !scores().any(|s| s == 1.0) {
        errors.push("The progressDefinition must specify a name for 100% completed".to_string());
    }

    errors
}

/// Progress of one team on one activity, as returned by aggregate queries.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamActivityProgress {
    /// `None` when the entry summarises several teams
    pub team: Option<TeamName>,
    pub activity_uuid: Uuid,
    pub progress: TeamProgress,
}

/// Top level shape of a team progress YAML document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TeamProgressFile {
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: Progress,
}

impl TeamProgressFile {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: Option<Self> = serde_yaml::from_str(yaml)?;
        Ok(file.unwrap_or_default())
    }
}

/// Parse a stored stage date.
///
/// Plain `YYYY-MM-DD` dates are expected, full RFC 3339 timestamps are
/// reduced to their UTC date.
pub fn parse_progress_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc).date_naive())
    })
}

/// Today's date in UTC.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScore {
    Number(f64),
    Text(String),
}

fn deserialize_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawScore::deserialize(deserializer)? {
        RawScore::Number(n) => Ok(n),
        RawScore::Text(text) => parse_score(&text).map_err(serde::de::Error::custom),
    }
}

/// `"50%"` → 0.5, `"0.5"` → 0.5.
fn parse_score(text: &str) -> Result<f64, String> {
    let trimmed = text.trim();
    let (number, percentage) = match trimmed.strip_suffix('%') {
        Some(number) => (number.trim(), true),
        None => (trimmed, false),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid progress score '{}'", text))?;

    Ok(if percentage { value / 100.0 } else { value })
}

type RawProgress =
    BTreeMap<Uuid, Option<BTreeMap<TeamName, Option<BTreeMap<ProgressTitle, serde_yaml::Value>>>>>;

fn deserialize_progress<'de, D>(deserializer: D) -> Result<Progress, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawProgress>::deserialize(deserializer)?.unwrap_or_default();
    let mut progress = Progress::new();

    for (uuid, teams) in raw {
        let mut team_map = BTreeMap::new();
        for (team, titles) in teams.unwrap_or_default() {
            let mut team_progress = TeamProgress::new();
            for (title, value) in titles.unwrap_or_default() {
                let date = match &value {
                    serde_yaml::Value::Null => continue,
                    serde_yaml::Value::String(s) => parse_progress_date(s),
                    _ => None,
                };
                let date = date.ok_or_else(|| {
                    <D::Error as serde::de::Error>::custom(format!(
                        "invalid date {:?} for '{}' / '{}' / '{}'",
                        value, uuid, team, title
                    ))
                })?;
                team_progress.insert(title, date);
            }
            team_map.insert(team, team_progress);
        }
        progress.insert(uuid, team_map);
    }

    Ok(progress)
}
