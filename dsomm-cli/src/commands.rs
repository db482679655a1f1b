//! Subcommands operating on loaded assessment data.

use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use clap::Subcommand;
use serde::Serialize;
use tracing::info;

use dsomm_model::{clear_stored_state, Activity, Attachment, DataStore, EvidenceEntry, StateStorage};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load all data and print a summary
    Validate,

    /// List activities
    Activities {
        /// Only activities up to this level
        #[arg(short, long)]
        level: Option<u32>,
        /// Only activities of this dimension
        #[arg(short, long)]
        dimension: Option<String>,
    },

    /// Show progress per team
    Progress {
        /// Restrict to the teams of a group
        #[arg(short, long)]
        group: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Move a team to a progress stage of an activity
    SetProgress {
        /// Activity uuid or name
        activity: String,
        team: String,
        /// Progress title from meta.yaml
        title: String,
    },

    /// Record evidence for an activity
    AddEvidence {
        /// Activity uuid or name
        activity: String,
        #[arg(long)]
        title: String,
        /// Teams the evidence applies to
        #[arg(short, long, required = true)]
        team: Vec<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        reviewer: Option<String>,
        /// Link to supporting material
        #[arg(long)]
        link: Option<String>,
        /// Date recorded (YYYY-MM-DD), today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Rename a team in teams, groups, progress and evidence
    RenameTeam { from: String, to: String },

    /// Print all progress in team progress file format
    Export,

    /// Delete locally stored progress, evidence and team changes
    Reset,
}

/// Progress of one team across all activities.
#[derive(Debug, Serialize)]
struct TeamSummary {
    team: String,
    started: usize,
    in_progress: usize,
    completed: usize,
    /// Mean progress score over all activities
    score: f64,
}

pub fn execute(data: &mut DataStore, command: Commands) -> anyhow::Result<String> {
    match command {
        Commands::Validate => Ok(validate(data)),
        Commands::Activities { level, dimension } => Ok(list_activities(data, level, dimension)),
        Commands::Progress { group, json } => {
            let summaries = summarize(data, group.as_deref());
            if json {
                Ok(serde_json::to_string_pretty(&summaries)?)
            } else {
                Ok(progress_table(&summaries))
            }
        }
        Commands::SetProgress {
            activity,
            team,
            title,
        } => {
            let (uuid, name) = find_activity(data, &activity)?;
            check_team(data, &team)?;
            data.progress_store
                .set_team_activity_progress_state(&uuid, &team, &title)?;
            info!(activity = %name, team = %team, title = %title, "Progress updated");
            Ok(format!("{}: {} is now '{}'", name, team, title))
        }
        Commands::AddEvidence {
            activity,
            title,
            team,
            description,
            reviewer,
            link,
            date,
        } => {
            let (uuid, name) = find_activity(data, &activity)?;
            for t in &team {
                check_team(data, t)?;
            }

            let mut entry = EvidenceEntry::new(title, team, date.unwrap_or_else(dsomm_model::today_utc));
            entry.description = description.unwrap_or_default();
            entry.reviewer = reviewer;
            if let Some(link) = link {
                entry.attachments.push(Attachment {
                    kind: "link".to_string(),
                    external_link: link,
                });
            }
            let id = entry.id.clone();
            data.evidence_store.add_evidence(&uuid, entry)?;
            Ok(format!("Added evidence {} to {}", id, name))
        }
        Commands::RenameTeam { from, to } => {
            check_team(data, &from)?;
            data.rename_team(&from, &to)?;
            Ok(format!("Renamed team '{}' to '{}'", from, to))
        }
        Commands::Export => Ok(data.progress_store.as_yaml_string()),
        Commands::Reset => {
            data.clear_stored_state()?;
            Ok(RESET_DONE.to_string())
        }
    }
}

const RESET_DONE: &str = "Stored progress, evidence and team changes deleted";

/// Clear stored state without loading any data first.
pub fn reset(storage: &dyn StateStorage) -> anyhow::Result<String> {
    clear_stored_state(storage).context("Failed to delete stored state")?;
    Ok(RESET_DONE.to_string())
}

fn validate(data: &DataStore) -> String {
    let activities = &data.activity_store;
    let mut out = format!(
        "{} activities in {} categories and {} dimensions",
        activities.len(),
        activities.get_all_category_names().len(),
        activities.get_all_dimension_names().len()
    );
    if let Some(level) = data.get_max_level() {
        out.push_str(&format!(", levels 1 to {}", level));
    }
    if let Some(version) = data
        .meta
        .as_ref()
        .and_then(|m| m.activity_meta.as_ref())
        .and_then(|m| m.get_dsomm_version())
    {
        out.push_str(&format!("\nDSOMM version {}", version));
    }
    out.push_str(&format!(
        "\n{} evidence entries for {} activities",
        data.evidence_store.get_total_evidence_count(),
        data.evidence_store.get_activity_uuids_with_evidence().len()
    ));
    out
}

fn list_activities(data: &DataStore, level: Option<u32>, dimension: Option<String>) -> String {
    let activities: Vec<&Activity> = data
        .activity_store
        .get_all_activities_up_to_level(level)
        .into_iter()
        .filter(|a| dimension.as_deref().map_or(true, |d| a.dimension == d))
        .collect();

    activities
        .iter()
        .map(|a| format!("{}  L{}  {} / {} / {}", a.uuid, a.level, a.category, a.dimension, a.name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize(data: &DataStore, group: Option<&str>) -> Vec<TeamSummary> {
    let teams: Vec<String> = match (&data.meta, group) {
        (Some(meta), Some(group)) => meta.teams_in_group(group).to_vec(),
        (Some(meta), None) => meta.teams.clone(),
        (None, _) => Vec::new(),
    };
    let activities = data.activity_store.get_all_activities();
    let progress = &data.progress_store;

    teams
        .into_iter()
        .map(|team| {
            let single = std::slice::from_ref(&team);
            let total: f64 = activities
                .iter()
                .map(|a| progress.get_team_activity_progress_value(&a.uuid, &team, false))
                .sum();
            TeamSummary {
                started: progress.get_activities_started_for_teams(single).len(),
                in_progress: progress.get_activities_in_progress_for_teams(single).len(),
                completed: progress.get_activities_completed_for_teams(single).len(),
                score: if activities.is_empty() {
                    0.0
                } else {
                    total / activities.len() as f64
                },
                team,
            }
        })
        .collect()
}

fn progress_table(summaries: &[TeamSummary]) -> String {
    let mut out = format!(
        "{:<24} {:>8} {:>12} {:>10} {:>7}",
        "Team", "Started", "In progress", "Completed", "Score"
    );
    for s in summaries {
        out.push_str(&format!(
            "\n{:<24} {:>8} {:>12} {:>10} {:>6.0}%",
            s.team,
            s.started,
            s.in_progress,
            s.completed,
            s.score * 100.0
        ));
    }
    out
}

/// Uuid and name of the activity with uuid or name `key`.
fn find_activity(data: &DataStore, key: &str) -> anyhow::Result<(String, String)> {
    data.activity_store
        .get_activity(key, key)
        .map(|a| (a.uuid.clone(), a.name.clone()))
        .ok_or_else(|| anyhow!("No activity with uuid or name '{}'", key))
}

fn check_team(data: &DataStore, team: &str) -> anyhow::Result<()> {
    let meta = data.meta.as_ref().context("meta.yaml is not loaded")?;
    if !meta.teams.iter().any(|t| t == team) {
        bail!("Unknown team '{}' (known: {})", team, meta.teams.join(", "));
    }
    Ok(())
}
