//! Team progress state machine.
//!
//! Each (activity, team) pair moves through the configured progress titles
//! in score order. Reaching a stage records the date it was reached. Moving
//! back clears the later stages but keeps their dates as a backup, so
//! moving forward again restores them instead of stamping today's date.
//!
//! ```text
//!   titles:     Not started   Started   Implemented   Completed
//!   reached:    -             01-05     02-10         -
//!   backup:     -             -         -             03-01
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;

use crate::progress::*;
use crate::storage::{StateStorage, StorageError};

/// Storage key for persisted progress.
pub const PROGRESS_STORAGE_KEY: &str = "progress";

/// Error types for progress operations.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// `init` has not been called with a progress definition
    #[error("Progress states are not initialized")]
    NotInitialized,

    /// The title is not part of the progress definition
    #[error("Unknown progress title: {0}")]
    UnknownTitle(String),

    /// Persisting progress failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stored progress could not be parsed
    #[error("Invalid progress YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Stage dates of one team on one activity, indexed by title position.
#[derive(Debug, Clone, Default, PartialEq)]
struct StageDates {
    /// Date each stage was reached
    reached: Vec<Option<NaiveDate>>,
    /// Dates cleared by moving back, kept until the stage is reached again
    backup: Vec<Option<NaiveDate>>,
}

impl StageDates {
    fn new(stages: usize) -> Self {
        Self {
            reached: vec![None; stages],
            backup: vec![None; stages],
        }
    }

    /// Highest stage with a date.
    fn current(&self) -> Option<usize> {
        self.reached.iter().rposition(Option::is_some)
    }

    fn current_backup(&self) -> Option<usize> {
        self.backup.iter().rposition(Option::is_some)
    }

    /// Move back from `current` to `target`.
    ///
    /// Returns the stages whose previous backup date was overwritten.
    fn regress(&mut self, target: usize, current: usize, today: NaiveDate) -> Vec<usize> {
        let mut overwritten = Vec::new();

        if self.reached[target].is_none() {
            self.reached[target] = Some(today);
        }

        for stage in target + 1..=current {
            if let Some(date) = self.reached[stage].take() {
                if self.backup[stage].is_some() {
                    overwritten.push(stage);
                }
                self.backup[stage] = Some(date);
            }
        }

        overwritten
    }

    /// Move forward from `current` to `target`.
    ///
    /// Stages are filled from the top down: a backed up date is restored and
    /// becomes the date for the stages below it that have no backup.
    fn advance(&mut self, current: usize, target: usize, today: NaiveDate) {
        let mut fill = today;
        for stage in (current + 1..=target).rev() {
            if let Some(date) = self.backup[stage].take() {
                fill = date;
            }
            self.reached[stage] = Some(fill);
        }
    }

    fn to_map(dates: &[Option<NaiveDate>], titles: &[ProgressTitle]) -> TeamProgress {
        titles
            .iter()
            .zip(dates)
            .filter_map(|(title, date)| date.map(|d| (title.clone(), d)))
            .collect()
    }
}

/// Progress of every team on every activity.
pub struct ProgressStore {
    definitions: ProgressDefinitions,
    /// Titles in ascending score order
    titles: Vec<ProgressTitle>,
    progress: BTreeMap<Uuid, BTreeMap<TeamName, StageDates>>,
    /// Activity names used to annotate the YAML output
    activity_names: HashMap<Uuid, String>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl ProgressStore {
    /// Create an uninitialised store without persistence.
    pub fn new() -> Self {
        Self {
            definitions: ProgressDefinitions::new(),
            titles: Vec::new(),
            progress: BTreeMap::new(),
            activity_names: HashMap::new(),
            storage: None,
        }
    }

    /// Persist through `storage` after every mutating call.
    pub fn with_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the progress stages, ordered by ascending score.
    ///
    /// Progress recorded before re-initialisation is kept for titles that
    /// still exist.
    pub fn init(&mut self, definitions: ProgressDefinitions) {
        let mut titles: Vec<ProgressTitle> = definitions.keys().cloned().collect();
        titles.sort_by(|a, b| {
            definitions[a]
                .score
                .partial_cmp(&definitions[b].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let previous = std::mem::take(&mut self.progress);
        let previous_titles = std::mem::replace(&mut self.titles, titles);
        self.definitions = definitions;

        for (uuid, teams) in previous {
            for (team, dates) in teams {
                let mut track = StageDates::new(self.titles.len());
                for (stage, title) in previous_titles.iter().enumerate() {
                    let Some(new_stage) = self.title_index(title) else {
                        continue;
                    };
                    track.reached[new_stage] = dates.reached[stage];
                    track.backup[new_stage] = dates.backup[stage];
                }
                self.progress.entry(uuid.clone()).or_default().insert(team, track);
            }
        }

        tracing::debug!(titles = ?self.titles, "Progress titles initialized");
    }

    pub fn is_initialized(&self) -> bool {
        !self.titles.is_empty()
    }

    /// Titles in ascending score order.
    pub fn titles(&self) -> &[ProgressTitle] {
        &self.titles
    }

    pub fn definitions(&self) -> &ProgressDefinitions {
        &self.definitions
    }

    /// Uuid → activity name, for comments in the YAML output.
    pub fn set_activity_map(&mut self, activity_names: HashMap<Uuid, String>) {
        self.activity_names = activity_names;
    }

    /// All recorded stage dates.
    pub fn get_progress_data(&self) -> Progress {
        self.progress
            .iter()
            .map(|(uuid, teams)| {
                let teams = teams
                    .iter()
                    .map(|(team, dates)| {
                        (team.clone(), StageDates::to_map(&dates.reached, &self.titles))
                    })
                    .filter(|(_, progress)| !progress.is_empty())
                    .collect::<BTreeMap<_, _>>();
                (uuid.clone(), teams)
            })
            .filter(|(_, teams)| !teams.is_empty())
            .collect()
    }

    /// Merge externally loaded progress into the store.
    ///
    /// Where both sides have a date for the same stage the earlier one is
    /// kept. Titles missing from the definition are skipped.
    pub fn add_progress_data(&mut self, new_progress: Progress) -> Result<(), ProgressError> {
        if !self.is_initialized() {
            return Err(ProgressError::NotInitialized);
        }

        for (uuid, teams) in new_progress {
            for (team, team_progress) in teams {
                for (title, date) in team_progress {
                    let Some(stage) = self.title_index(&title) else {
                        tracing::warn!(
                            activity = %uuid,
                            team = %team,
                            title = %title,
                            "Skipping progress for unknown title"
                        );
                        continue;
                    };
                    let track = self.track_mut(&uuid, &team);
                    if is_outdated(track.reached[stage], date) {
                        track.reached[stage] = Some(date);
                    }
                }
            }
        }
        Ok(())
    }

    /// Rename a team in recorded and backed up progress.
    pub fn rename_team(&mut self, old_name: &str, new_name: &str) -> Result<(), ProgressError> {
        tracing::info!(from = old_name, to = new_name, "Renaming team in progress store");

        for teams in self.progress.values_mut() {
            if let Some(dates) = teams.remove(old_name) {
                teams.insert(new_name.to_string(), dates);
            }
        }
        self.save_to_storage()?;
        Ok(())
    }

    /// Rename a progress title, keeping its position and definition.
    pub fn rename_progress_title(
        &mut self,
        old_title: &str,
        new_title: &str,
    ) -> Result<(), ProgressError> {
        let stage = self
            .title_index(old_title)
            .ok_or_else(|| ProgressError::UnknownTitle(old_title.to_string()))?;

        tracing::info!(from = old_title, to = new_title, "Renaming progress title");

        self.titles[stage] = new_title.to_string();
        if let Some(definition) = self.definitions.remove(old_title) {
            self.definitions.insert(new_title.to_string(), definition);
        }
        self.save_to_storage()?;
        Ok(())
    }

    /// Stage dates of a team, or the backed up dates when `backup` is set.
    pub fn get_team_progress(&self, uuid: &str, team: &str, backup: bool) -> Option<TeamProgress> {
        let dates = self.track(uuid, team)?;
        let source = if backup { &dates.backup } else { &dates.reached };
        Some(StageDates::to_map(source, &self.titles))
    }

    /// Current stage of a team; the first title when nothing is recorded.
    pub fn get_team_progress_title(&self, uuid: &str, team: &str) -> Option<&str> {
        self.get_team_activity_title(uuid, team, false)
    }

    /// Highest stage with a date, looking at backed up dates when `backup`
    /// is set. `None` only before `init`.
    pub fn get_team_activity_title(&self, uuid: &str, team: &str, backup: bool) -> Option<&str> {
        let first = self.titles.first()?;
        let stage = self.track(uuid, team).and_then(|dates| {
            if backup {
                dates.current_backup()
            } else {
                dates.current()
            }
        });
        Some(stage.map_or(first.as_str(), |s| self.titles[s].as_str()))
    }

    /// Score of the highest dated stage, 0.0 when nothing is recorded.
    pub fn get_team_activity_progress_value(&self, uuid: &str, team: &str, backup: bool) -> f64 {
        let stage = self.track(uuid, team).and_then(|dates| {
            if backup {
                dates.current_backup()
            } else {
                dates.current()
            }
        });
        stage
            .and_then(|s| self.definitions.get(&self.titles[s]))
            .map_or(0.0, |definition| definition.score)
    }

    /// Titles strictly between "not started" and "completed".
    pub fn get_in_progress_titles(&self) -> &[ProgressTitle] {
        if self.titles.len() < 2 {
            return &[];
        }
        &self.titles[1..self.titles.len() - 1]
    }

    /// Title with the highest score.
    pub fn get_completed_progress_title(&self) -> Option<&str> {
        self.titles.last().map(String::as_str)
    }

    /// Activities every listed team has completed.
    pub fn get_activities_completed_for_teams(&self, teams: &[TeamName]) -> Vec<TeamActivityProgress> {
        let Some(completed) = self.titles.len().checked_sub(1) else {
            return Vec::new();
        };
        if teams.is_empty() {
            return Vec::new();
        }

        self.progress
            .iter()
            .filter(|(_, by_team)| {
                teams.iter().all(|team| {
                    by_team
                        .get(team)
                        .is_some_and(|dates| dates.reached[completed].is_some())
                })
            })
            .filter_map(|(uuid, by_team)| {
                let last_team = teams.last()?;
                Some(TeamActivityProgress {
                    team: None,
                    activity_uuid: uuid.clone(),
                    progress: StageDates::to_map(&by_team.get(last_team)?.reached, &self.titles),
                })
            })
            .collect()
    }

    /// One entry per listed team that has reached the first stage after
    /// "not started".
    pub fn get_activities_started_for_teams(&self, teams: &[TeamName]) -> Vec<TeamActivityProgress> {
        self.collect_per_team(teams, |dates| dates.reached.get(1).is_some_and(Option::is_some))
    }

    /// Like [`Self::get_activities_started_for_teams`], excluding completed
    /// activities.
    pub fn get_activities_in_progress_for_teams(
        &self,
        teams: &[TeamName],
    ) -> Vec<TeamActivityProgress> {
        self.collect_per_team(teams, |dates| {
            let started = dates.reached.get(1).is_some_and(Option::is_some);
            let completed = dates.reached.last().is_some_and(Option::is_some);
            started && !completed
        })
    }

    /// Move a team to `title` on an activity, using today's UTC date for
    /// stages reached without a backed up date.
    pub fn set_team_activity_progress_state(
        &mut self,
        uuid: &str,
        team: &str,
        title: &str,
    ) -> Result<(), ProgressError> {
        self.set_team_activity_progress_state_on(uuid, team, title, today_utc())
    }

    /// [`Self::set_team_activity_progress_state`] with an explicit date for
    /// "today".
    pub fn set_team_activity_progress_state_on(
        &mut self,
        uuid: &str,
        team: &str,
        title: &str,
        today: NaiveDate,
    ) -> Result<(), ProgressError> {
        if !self.is_initialized() {
            return Err(ProgressError::NotInitialized);
        }
        let target = self
            .title_index(title)
            .ok_or_else(|| ProgressError::UnknownTitle(title.to_string()))?;

        let track = self.track_mut(uuid, team);
        let current = track.current().unwrap_or(0);

        if target < current {
            let overwritten = track.regress(target, current, today);
            tracing::debug!(activity = uuid, team, from = current, to = target, "Clearing progress");
            for stage in overwritten {
                tracing::warn!(
                    activity = uuid,
                    team,
                    title = %self.titles[stage],
                    "Overwriting backed up progress date"
                );
            }
        } else if target > current {
            track.advance(current, target, today);
            tracing::debug!(activity = uuid, team, from = current, to = target, "Setting progress");
        }

        self.save_to_storage()?;
        Ok(())
    }

    /// Progress in the persisted YAML layout.
    ///
    /// ```text
    /// progress:
    ///   '<uuid>':  # <activity name>
    ///     '<team>':
    ///       '<title>': YYYY-MM-DD
    /// ```
    ///
    /// Two spaces per level, keys single quoted with quotes doubled (double
    /// quoted with escapes when they hold line breaks), the first title never
    /// written, empty teams and activities left out.
    pub fn as_yaml_string(&self) -> String {
        let tab = "  ";
        let mut out = String::from("progress:\n");

        for (uuid, teams) in &self.progress {
            let mut activity_block = String::new();

            for (team, dates) in teams {
                let mut team_block = String::new();
                for (stage, date) in dates.reached.iter().enumerate().skip(1) {
                    if let Some(date) = date {
                        team_block.push_str(&format!(
                            "{tab}{tab}{tab}{}: {}\n",
                            quoted_key(&self.titles[stage]),
                            date.format("%Y-%m-%d")
                        ));
                    }
                }
                if !team_block.is_empty() {
                    activity_block.push_str(&format!("{tab}{tab}{}:\n", quoted_key(team)));
                    activity_block.push_str(&team_block);
                }
            }

            if !activity_block.is_empty() {
                let comment = self
                    .activity_names
                    .get(uuid)
                    .map(|name| format!("  # {}", name.replace(['\r', '\n'], " ")))
                    .unwrap_or_default();
                out.push_str(&format!("{tab}{}:{}\n", quoted_key(uuid), comment));
                out.push_str(&activity_block);
            }
        }

        out
    }

    /// Write the YAML form to storage; a no-op without storage.
    pub fn save_to_storage(&self) -> Result<(), StorageError> {
        if let Some(storage) = &self.storage {
            storage.set_item(PROGRESS_STORAGE_KEY, &self.as_yaml_string())?;
        }
        Ok(())
    }

    pub fn retrieve_stored_team_progress_yaml(&self) -> Result<Option<String>, StorageError> {
        match &self.storage {
            Some(storage) => storage.get_item(PROGRESS_STORAGE_KEY),
            None => Ok(None),
        }
    }

    /// Stored progress parsed as a team progress file.
    pub fn retrieve_stored_team_progress(&self) -> Result<Option<TeamProgressFile>, ProgressError> {
        match self.retrieve_stored_team_progress_yaml()? {
            Some(yaml) => Ok(Some(TeamProgressFile::from_yaml(&yaml)?)),
            None => Ok(None),
        }
    }

    pub fn delete_stored_team_progress(&self) -> Result<(), StorageError> {
        tracing::info!("Deleting stored team progress");
        match &self.storage {
            Some(storage) => storage.remove_item(PROGRESS_STORAGE_KEY),
            None => Ok(()),
        }
    }

    fn title_index(&self, title: &str) -> Option<usize> {
        self.titles.iter().position(|t| t == title)
    }

    fn track(&self, uuid: &str, team: &str) -> Option<&StageDates> {
        self.progress.get(uuid)?.get(team)
    }

    fn track_mut(&mut self, uuid: &str, team: &str) -> &mut StageDates {
        let stages = self.titles.len();
        self.progress
            .entry(uuid.to_string())
            .or_default()
            .entry(team.to_string())
            .or_insert_with(|| StageDates::new(stages))
    }

    fn collect_per_team(
        &self,
        teams: &[TeamName],
        include: impl Fn(&StageDates) -> bool,
    ) -> Vec<TeamActivityProgress> {
        let mut result = Vec::new();
        for (uuid, by_team) in &self.progress {
            for team in teams {
                if let Some(dates) = by_team.get(team).filter(|d| include(d)) {
                    result.push(TeamActivityProgress {
                        team: Some(team.clone()),
                        activity_uuid: uuid.clone(),
                        progress: StageDates::to_map(&dates.reached, &self.titles),
                    });
                }
            }
        }
        result
    }
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `incoming` should replace the stored date.
fn is_outdated(stored: Option<NaiveDate>, incoming: NaiveDate) -> bool {
    match stored {
        None => true,
        Some(stored) => incoming < stored,
    }
}

/// Quote a mapping key for the progress file.
///
/// Single quotes cannot carry line breaks, so keys holding control
/// characters become double-quoted scalars with escapes.
fn quoted_key(value: &str) -> String {
    if !value.chars().any(char::is_control) {
        return format!("'{}'", value.replace('\'', "''"));
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
