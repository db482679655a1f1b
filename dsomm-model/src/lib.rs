//! Data model for DevSecOps maturity self-assessments
//!
//! Activities are described in YAML as category → dimension → activity and
//! may be spread over several files, later files overriding or removing
//! entries of earlier ones. Teams record how far they got with each
//! activity, moving through configured progress stages, and may attach
//! evidence to an activity.
//!
//! # Key Components
//!
//! - [`ActivityStore`]: Ingests activity files, detects duplicate names and uuids
//! - [`ProgressStore`]: Per team stage dates with backup on regress
//! - [`EvidenceStore`]: Evidence entries per activity
//! - [`MetaStore`]: Labels, teams and progress stages from `meta.yaml`
//! - [`DataLoader`]: Loads everything above starting from `meta.yaml`
//! - [`StateStorage`]: Where user changes are persisted between sessions
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dsomm_model::{DataLoader, FileStorage};
//!
//! let storage = Arc::new(FileStorage::new(".dsomm"));
//! let mut data = DataLoader::new(storage).load("yaml/meta.yaml".as_ref())?;
//!
//! data.progress_store
//!     .set_team_activity_progress_state(&uuid, "Team A", "Implemented")?;
//! ```

pub mod activity;
pub mod activity_store;
pub mod data_store;
pub mod evidence;
pub mod ignore;
pub mod loader;
pub mod markdown;
pub mod meta;
pub mod progress;
pub mod progress_store;
pub mod storage;
pub mod yaml;

// Re-export main types
pub use activity::{Activity, ActivityPatch, FrameworkReferences};
pub use activity_store::{ActivityStore, Data};
pub use data_store::{clear_stored_state, DataStore};
pub use evidence::{Attachment, EvidenceEntry, EvidenceError, EvidenceStore};
pub use ignore::{IgnoreKind, IgnoreList};
pub use loader::{DataLoader, LoadError, Result};
pub use markdown::MarkdownText;
pub use meta::{ActivityFileMeta, MetaError, MetaStore};
pub use progress::*;
pub use progress_store::{ProgressError, ProgressStore};
pub use storage::{FileStorage, MemoryStorage, StateStorage, StorageError};
pub use yaml::{YamlError, YamlLoader};
