//! YAML file loading with `$ref` substitution.
//!
//! A mapping of the form `{ $ref: "<file>#/<y/path>" }` is replaced by the
//! value found at `y/path` inside `file`. The file part is resolved relative
//! to the referencing file and may not leave that file's folder; an empty
//! file part refers to the referencing document itself. Referenced files
//! are resolved recursively and cached for the lifetime of the loader.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Deepest nesting followed while substituting references.
pub const MAX_REFERENCE_DEPTH: usize = 1000;

/// Error types for YAML loading.
#[derive(Debug, thiserror::Error)]
pub enum YamlError {
    /// File could not be read
    #[error("Failed to read the '{path}' YAML file: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML
    #[error("Failed to parse the '{path}' YAML file: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A relative path resolves outside the folder of the referencing file
    #[error("The {path} is not allowed outside its root folder {}", .root.display())]
    PathOutsideRoot { path: String, root: PathBuf },

    /// A `$ref` names a key that does not exist
    #[error("Could not find the key '{key}' of '{y_path}' in {file}")]
    ReferenceNotFound {
        key: String,
        y_path: String,
        file: String,
    },

    /// Files reference each other in a cycle
    #[error("Circular reference to {}", .0.display())]
    CircularReference(PathBuf),

    /// A `$ref` inside a document leads back to a path still being resolved
    #[error("Circular reference to '#{y_path}' in {}", .file.display())]
    CircularSelfReference { y_path: String, file: PathBuf },

    /// Nesting exceeds [`MAX_REFERENCE_DEPTH`]
    #[error("Too deeply nested references in {}", .0.display())]
    TooDeeplyNested(PathBuf),
}

/// Loads YAML files and resolves references between them.
#[derive(Debug, Default)]
pub struct YamlLoader {
    /// Resolved documents by full path
    refs: HashMap<PathBuf, Value>,
    /// Files whose references are currently being resolved
    resolving: HashSet<PathBuf>,
    /// Same-document y-paths currently being resolved, per file
    resolving_paths: HashSet<(PathBuf, String)>,
}

impl YamlLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single document file.
    pub fn load_yaml(&self, path: &Path) -> Result<Value, YamlError> {
        let (text, started) = read(path)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value = serde_yaml::from_str(&text).map_err(|source| YamlError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log_loaded(path, started);
        Ok(value)
    }

    /// Parse every document of a multi-document file.
    pub fn load_yaml_documents(&self, path: &Path) -> Result<Vec<Value>, YamlError> {
        let (text, started) = read(path)?;
        let documents = serde_yaml::Deserializer::from_str(&text)
            .map(Value::deserialize)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| YamlError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        log_loaded(path, started);
        Ok(documents)
    }

    /// Parse a file and replace every `$ref` mapping in it.
    pub fn load_yaml_with_references_resolved(&mut self, path: &Path) -> Result<Value, YamlError> {
        let document = self.load_yaml(path)?;

        self.resolving.insert(path.to_path_buf());
        let resolved = self.substitute_refs(document.clone(), &document, path, 1);
        self.resolving.remove(path);

        resolved
    }

    fn substitute_refs(
        &mut self,
        value: Value,
        root: &Value,
        reference_path: &Path,
        depth: usize,
    ) -> Result<Value, YamlError> {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(YamlError::TooDeeplyNested(reference_path.to_path_buf()));
        }

        match value {
            Value::Mapping(mapping) => {
                if let Some(Value::String(reference)) = mapping.get("$ref") {
                    return self.fetch_ref(reference, root, reference_path, depth);
                }
                let mut resolved = Mapping::with_capacity(mapping.len());
                for (key, child) in mapping {
                    let child = self.substitute_refs(child, root, reference_path, depth + 1)?;
                    resolved.insert(key, child);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.substitute_refs(item, root, reference_path, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn fetch_ref(
        &mut self,
        reference: &str,
        root: &Value,
        reference_path: &Path,
        depth: usize,
    ) -> Result<Value, YamlError> {
        let (file, y_path) = parse_ref(reference);
        tracing::debug!(reference, from = %reference_path.display(), "Resolving reference");

        if file.is_empty() {
            let key = (reference_path.to_path_buf(), y_path.trim_matches('/').to_string());
            if !self.resolving_paths.insert(key.clone()) {
                return Err(YamlError::CircularSelfReference {
                    y_path: y_path.to_string(),
                    file: reference_path.to_path_buf(),
                });
            }
            let resolved = get_y_path(root, y_path, "yaml file")
                .cloned()
                .and_then(|target| self.substitute_refs(target, root, reference_path, depth + 1));
            self.resolving_paths.remove(&key);
            return resolved;
        }

        let full_path = make_full_path(file, reference_path)?;
        let document = self.load_ref(&full_path)?;
        Ok(get_y_path(&document, y_path, file)?.clone())
    }

    fn load_ref(&mut self, full_path: &Path) -> Result<Value, YamlError> {
        if let Some(document) = self.refs.get(full_path) {
            return Ok(document.clone());
        }
        if self.resolving.contains(full_path) {
            return Err(YamlError::CircularReference(full_path.to_path_buf()));
        }

        let document = self.load_yaml_with_references_resolved(full_path)?;
        self.refs.insert(full_path.to_path_buf(), document.clone());
        Ok(document)
    }
}

/// Resolve `relative_path` against the folder of `relative_to`.
///
/// The result has `.` and `..` removed and must stay inside that folder.
pub fn make_full_path(relative_path: &str, relative_to: &Path) -> Result<PathBuf, YamlError> {
    let base = relative_to.parent().unwrap_or_else(|| Path::new(""));
    let relative = normalize(Path::new(relative_path));

    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        tracing::warn!(path = relative_path, root = %base.display(), "Path escapes its root folder");
        return Err(YamlError::PathOutsideRoot {
            path: relative_path.to_string(),
            root: base.to_path_buf(),
        });
    }

    Ok(base.join(relative))
}

/// Split `file#/y/path` into its trimmed parts.
fn parse_ref(reference: &str) -> (&str, &str) {
    match reference.split_once('#') {
        Some((file, y_path)) => (file.trim(), y_path.trim()),
        None => (reference.trim(), ""),
    }
}

/// Follow a `/`-separated path of mapping keys or sequence indices.
fn get_y_path<'a>(value: &'a Value, y_path: &str, file: &str) -> Result<&'a Value, YamlError> {
    let y_path = y_path.strip_prefix('/').unwrap_or(y_path);
    if y_path.is_empty() {
        return Ok(value);
    }

    let mut current = value;
    for (depth, key) in y_path.split('/').enumerate() {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(YamlError::TooDeeplyNested(PathBuf::from(file)));
        }
        let next = match current {
            Value::Mapping(mapping) => mapping.get(key),
            Value::Sequence(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| YamlError::ReferenceNotFound {
            key: key.to_string(),
            y_path: y_path.to_string(),
            file: file.to_string(),
        })?;
    }
    Ok(current)
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    normalized.pop();
                } else {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn read(path: &Path) -> Result<(String, Instant), YamlError> {
    let started = Instant::now();
    tracing::debug!(path = %path.display(), "Fetching YAML");
    let text = std::fs::read_to_string(path).map_err(|source| YamlError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((text, started))
}

fn log_loaded(path: &Path, started: Instant) {
    tracing::debug!(
        path = %path.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded YAML"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_full_path() {
        let meta = Path::new("data/yaml/meta.yaml");
        assert_eq!(
            make_full_path("activities.yaml", meta).unwrap(),
            PathBuf::from("data/yaml/activities.yaml")
        );
        assert_eq!(
            make_full_path("./custom/../generated/generated.yaml", meta).unwrap(),
            PathBuf::from("data/yaml/generated/generated.yaml")
        );
        assert!(matches!(
            make_full_path("../secrets.yaml", meta),
            Err(YamlError::PathOutsideRoot { .. })
        ));
        assert!(matches!(
            make_full_path("/etc/passwd", meta),
            Err(YamlError::PathOutsideRoot { .. })
        ));
    }

    #[test]
    fn test_parse_ref() {
        assert_eq!(parse_ref("teams.yaml#/teams"), ("teams.yaml", "/teams"));
        assert_eq!(parse_ref(" #/strings/en "), ("", "/strings/en"));
        assert_eq!(parse_ref("labels.yaml"), ("labels.yaml", ""));
    }

    #[test]
    fn test_get_y_path() {
        let value: Value = serde_yaml::from_str("a:\n  b:\n    - x\n    - y\n").unwrap();
        assert_eq!(
            get_y_path(&value, "/a/b/1", "test").unwrap(),
            &Value::String("y".to_string())
        );
        assert_eq!(get_y_path(&value, "", "test").unwrap(), &value);

        let err = get_y_path(&value, "/a/c", "test").unwrap_err();
        assert!(err.to_string().contains("'c'"));
    }

    #[test]
    fn test_resolve_references() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("meta.yaml"),
            r##"
lang: en
teams:
  $ref: teams.yaml#/teams
defaults:
  $ref: "#/lang"
"##,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("teams.yaml"),
            "teams:\n  - Team A\n  - Team B\n",
        )
        .unwrap();

        let mut loader = YamlLoader::new();
        let meta = loader
            .load_yaml_with_references_resolved(&dir.path().join("meta.yaml"))
            .unwrap();

        assert_eq!(meta["teams"][1], Value::String("Team B".to_string()));
        assert_eq!(meta["defaults"], Value::String("en".to_string()));
    }

    #[test]
    fn test_circular_file_references() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "x:\n  $ref: b.yaml#/y\n").unwrap();
        std::fs::write(dir.path().join("b.yaml"), "y:\n  $ref: a.yaml#/x\n").unwrap();

        let mut loader = YamlLoader::new();
        let result = loader.load_yaml_with_references_resolved(&dir.path().join("a.yaml"));
        assert!(matches!(result, Err(YamlError::CircularReference(_))));
    }

    #[test]
    fn test_self_reference_loop_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("loop.yaml"), "x:\n  $ref: \"#/x\"\n").unwrap();

        let mut loader = YamlLoader::new();
        let result = loader.load_yaml_with_references_resolved(&dir.path().join("loop.yaml"));
        match result {
            Err(YamlError::CircularSelfReference { y_path, .. }) => assert_eq!(y_path, "/x"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_indirect_self_reference_loop_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("loop.yaml"),
            "a:\n  inner:\n    $ref: \"#/b\"\nb:\n  $ref: \"#/a\"\n",
        )
        .unwrap();

        let mut loader = YamlLoader::new();
        let result = loader.load_yaml_with_references_resolved(&dir.path().join("loop.yaml"));
        assert!(matches!(result, Err(YamlError::CircularSelfReference { .. })));
    }

    #[test]
    fn test_repeated_self_reference_is_not_a_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("shared.yaml"),
            "base: 1\nfirst:\n  $ref: \"#/base\"\nsecond:\n  $ref: \"#/first\"\n",
        )
        .unwrap();

        let mut loader = YamlLoader::new();
        let value = loader
            .load_yaml_with_references_resolved(&dir.path().join("shared.yaml"))
            .unwrap();
        assert_eq!(value["first"], Value::from(1));
        assert_eq!(value["second"], Value::from(1));
    }

    #[test]
    fn test_multiple_documents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("activities.yaml");
        std::fs::write(&path, "---\nmeta:\n  dsommVersion: 1.2.0\n---\nBuild: {}\n").unwrap();

        let documents = YamlLoader::new().load_yaml_documents(&path).unwrap();
        assert_eq!(documents.len(), 2);
        assert!(documents[0].get("meta").is_some());
    }

    #[test]
    fn test_missing_file() {
        let result = YamlLoader::new().load_yaml(Path::new("/nonexistent/meta.yaml"));
        assert!(matches!(result, Err(YamlError::Io { .. })));
    }
}
