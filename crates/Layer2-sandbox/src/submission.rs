//! Submission definition and discovery

use arena_foundation::{Error, LanguageVariant, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier for a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    /// Generate a new random SubmissionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A participant's submission
///
/// Immutable once validation starts. `files` are relative to `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,

    /// Participant name (file stem or directory name)
    pub participant: String,

    pub language: LanguageVariant,

    /// Directory the files are resolved against
    pub root: PathBuf,

    /// Submitted files, relative to `root`, sorted
    pub files: Vec<PathBuf>,

    /// Position in discovery order
    pub arrival: usize,
}

impl Submission {
    pub fn new(
        participant: impl Into<String>,
        language: LanguageVariant,
        root: impl Into<PathBuf>,
        mut files: Vec<PathBuf>,
    ) -> Self {
        files.sort();
        Self {
            id: SubmissionId::new(),
            participant: participant.into(),
            language,
            root: root.into(),
            files,
            arrival: 0,
        }
    }

    /// Set arrival index
    pub fn with_arrival(mut self, arrival: usize) -> Self {
        self.arrival = arrival;
        self
    }

    /// Build a submission from a single file or a directory
    pub fn from_path(path: &Path, language: LanguageVariant) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path)
            .map_err(|_| Error::NotFound(path.display().to_string()))?;

        if meta.is_dir() {
            let participant = file_name(path);
            let files = collect_files(path)?;
            if files.is_empty() {
                return Err(Error::Submission(format!(
                    "{} contains no files",
                    path.display()
                )));
            }
            Ok(Self::new(participant, language, path, files))
        } else if meta.is_file() {
            let participant = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            Ok(Self::new(
                participant,
                language,
                root,
                vec![PathBuf::from(path.file_name().unwrap_or_default())],
            ))
        } else {
            Err(Error::Submission(format!(
                "{} is neither a file nor a directory",
                path.display()
            )))
        }
    }

    /// Absolute path of a submitted file
    pub fn path_of(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Absolute paths of all submitted files
    pub fn paths(&self) -> impl Iterator<Item = (PathBuf, &Path)> + '_ {
        self.files
            .iter()
            .map(move |rel| (self.root.join(rel), rel.as_path()))
    }

    /// Short label for logs and reports
    pub fn label(&self) -> String {
        format!("{}/{}", self.language.dir_name(), self.participant)
    }
}

/// Discover submissions under `submissions/<language>/`
///
/// Each source file directly under a language directory is one submission,
/// each subdirectory is one submission. Arrival order is language order,
/// then name order.
pub fn discover(root: &Path) -> Result<Vec<Submission>> {
    if !root.is_dir() {
        return Err(Error::NotFound(format!(
            "submissions directory {}",
            root.display()
        )));
    }

    let mut submissions = Vec::new();

    for language in LanguageVariant::ALL {
        let dir = root.join(language.dir_name());
        if !dir.is_dir() {
            continue;
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let submission = if meta.is_dir() {
                match Submission::from_path(&path, language) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping submission");
                        continue;
                    }
                }
            } else if meta.is_file() && language.is_source(&path) {
                Submission::from_path(&path, language)?
            } else {
                debug!(path = %path.display(), "Ignoring non-source entry");
                continue;
            };

            let arrival = submissions.len();
            submissions.push(submission.with_arrival(arrival));
        }
    }

    debug!(count = submissions.len(), root = %root.display(), "Discovered submissions");
    Ok(submissions)
}

/// Regular files below `dir`, relative, sorted. Symlinks are kept as entries
/// so the validator can see (and reject) them.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                files.push(rel.to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("python")).unwrap();
        fs::create_dir_all(root.join("go/zed")).unwrap();
        fs::write(root.join("python/bob.py"), "print(1)").unwrap();
        fs::write(root.join("python/alice.py"), "print(2)").unwrap();
        fs::write(root.join("python/README.md"), "notes").unwrap();
        fs::write(root.join("go/zed/main.go"), "package main").unwrap();

        let subs = discover(root).unwrap();
        let labels: Vec<String> = subs.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["python/alice", "python/bob", "go/zed"]);
        assert_eq!(
            subs.iter().map(|s| s.arrival).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(subs[2].files, vec![PathBuf::from("main.go")]);
    }

    #[test]
    fn test_directory_submission_collects_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("carol");
        fs::create_dir_all(sub.join("pkg")).unwrap();
        fs::write(sub.join("Solution.java"), "class Solution {}").unwrap();
        fs::write(sub.join("pkg/Util.java"), "class Util {}").unwrap();

        let submission = Submission::from_path(&sub, LanguageVariant::Java).unwrap();
        assert_eq!(submission.participant, "carol");
        assert_eq!(
            submission.files,
            vec![PathBuf::from("Solution.java"), PathBuf::from("pkg/Util.java")]
        );
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(&dir.path().join("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_id_display_is_short() {
        let id = SubmissionId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
