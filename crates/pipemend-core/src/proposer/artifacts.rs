//! Artifact lookup: mapping units to the text files that define them.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

use crate::domain::execution::unit_name;

/// Source of artifact text for the proposer.
///
/// Artifact identifiers are paths relative to the project root, using `/`.
pub trait ArtifactSource: Send + Sync {
    /// Find the artifact defining a unit.
    fn locate(&self, unit_id: &str) -> Option<String>;

    fn exists(&self, artifact: &str) -> bool;

    fn read(&self, artifact: &str) -> std::io::Result<String>;
}

/// Default directories searched for unit definitions.
pub fn default_search_dirs() -> Vec<String> {
    ["models", "snapshots", "seeds", "macros", "tests"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Artifacts stored under a project directory.
#[derive(Debug, Clone)]
pub struct ProjectArtifacts {
    root: PathBuf,
    search_dirs: Vec<String>,
}

impl ProjectArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_dirs: default_search_dirs(),
        }
    }

    pub fn with_search_dirs(mut self, dirs: Vec<String>) -> Self {
        self.search_dirs = dirs;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an artifact id inside the root, refusing paths that escape it.
    pub fn resolve(&self, artifact: &str) -> Option<PathBuf> {
        let rel = Path::new(artifact);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }
        Some(self.root.join(rel))
    }

    fn to_artifact_id(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl ArtifactSource for ProjectArtifacts {
    fn locate(&self, unit_id: &str) -> Option<String> {
        let wanted = format!("{}.sql", unit_name(unit_id));
        for dir in &self.search_dirs {
            let base = self.root.join(dir);
            if !base.is_dir() {
                continue;
            }
            let found = WalkDir::new(&base)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == wanted);
            if let Some(entry) = found {
                return self.to_artifact_id(entry.path());
            }
        }
        None
    }

    fn exists(&self, artifact: &str) -> bool {
        self.resolve(artifact).is_some_and(|p| p.is_file())
    }

    fn read(&self, artifact: &str) -> std::io::Result<String> {
        let path = self.resolve(artifact).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("artifact path escapes project root: {artifact}"),
            )
        })?;
        std::fs::read_to_string(path)
    }
}

/// Relations an artifact reads from: `ref()`, `source()` and bare `from`/`join` targets.
pub fn referenced_relations(sql: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    let patterns = [
        (r#"ref\(\s*['"](\w+)['"]\s*\)"#, 1),
        (r#"source\(\s*['"]\w+['"]\s*,\s*['"](\w+)['"]\s*\)"#, 1),
        (r#"(?i)\b(?:from|join)\s+([A-Za-z_][\w."]*)"#, 1),
    ];
    for (pattern, group) in patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        for caps in re.captures_iter(sql) {
            if let Some(m) = caps.get(group) {
                let name = m.as_str().replace('"', "");
                if !name.is_empty() {
                    found.insert(name.to_lowercase());
                }
            }
        }
    }
    found.into_iter().collect()
}
