//! Security Validator - 제출물 정적 검증
//!
//! 읽기 전용, 부작용 없음. 통과한 제출물만 `ValidatedSubmission`이 되고,
//! 실행기는 `ValidatedSubmission`만 받는다.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::policy::SecurityPolicy;
use crate::submission::Submission;

// ============================================================================
// Violation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BlockedPattern,
    MissingEntryPoint,
    MultipleEntryPoints,
    Oversized,
    Permission,
    UnreadableFile,
}

/// 검증 위반 하나
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// 1-based
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub message: String,
}

impl Violation {
    fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: None,
            line: None,
            pattern: None,
            message: message.into(),
        }
    }

    fn in_file(mut self, file: &Path) -> Self {
        self.file = Some(file.to_path_buf());
        self
    }

    fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: {}", file.display(), line, self.message),
            (Some(file), None) => write!(f, "{}: {}", file.display(), self.message),
            _ => f.write_str(&self.message),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// 검증을 통과한 제출물 (이 crate 밖에서는 생성 불가)
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    submission: Submission,
    entry: PathBuf,
}

impl ValidatedSubmission {
    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    /// 엔트리 포인트 파일 (submission root 기준 상대 경로)
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn into_submission(self) -> Submission {
        self.submission
    }
}

#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Pass(ValidatedSubmission),
    Rejected(Vec<Violation>),
}

impl ValidationOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Pass(_) => &[],
            Self::Rejected(v) => v,
        }
    }
}

// ============================================================================
// Validator
// ============================================================================

/// 보안 검증기
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    policy: Arc<SecurityPolicy>,
}

impl SecurityValidator {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn validate(&self, submission: &Submission) -> ValidationOutcome {
        validate_with(submission, &self.policy)
    }
}

/// 제출물 하나를 정책으로 검증
pub fn validate_with(submission: &Submission, policy: &SecurityPolicy) -> ValidationOutcome {
    let language = submission.language;
    let mut violations = Vec::new();
    let mut total_bytes = 0u64;
    let mut entries: Vec<(PathBuf, usize)> = Vec::new();
    let mut saw_source = false;

    for (path, rel) in submission.paths() {
        // 1. 메타데이터 (심볼릭 링크는 따라가지 않음)
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                violations.push(
                    Violation::new(ViolationKind::UnreadableFile, format!("cannot stat: {}", e))
                        .in_file(rel),
                );
                continue;
            }
        };

        if meta.file_type().is_symlink() {
            violations.push(
                Violation::new(ViolationKind::Permission, "symbolic links are not allowed")
                    .in_file(rel),
            );
            continue;
        }

        // 2. 권한 비트
        if let Some(mode) = file_mode(&meta) {
            if mode & 0o7000 != 0 {
                violations.push(
                    Violation::new(
                        ViolationKind::Permission,
                        format!("special permission bits set (mode {:04o})", mode),
                    )
                    .in_file(rel),
                );
            } else if mode & !policy.max_file_mode != 0 {
                violations.push(
                    Violation::new(
                        ViolationKind::Permission,
                        format!(
                            "mode {:04o} exceeds allowed {:04o}",
                            mode, policy.max_file_mode
                        ),
                    )
                    .in_file(rel),
                );
            }
        }

        // 3. 크기
        let size = meta.len();
        total_bytes += size;
        if size > policy.max_file_bytes {
            violations.push(
                Violation::new(
                    ViolationKind::Oversized,
                    format!(
                        "file is {} bytes, limit is {} bytes",
                        size, policy.max_file_bytes
                    ),
                )
                .in_file(rel),
            );
            continue;
        }

        if !language.is_source(rel) {
            continue;
        }
        saw_source = true;

        // 4. 내용 스캔
        let text = match std::fs::read(&path).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => {
                violations.push(
                    Violation::new(ViolationKind::UnreadableFile, "file is not valid UTF-8")
                        .in_file(rel),
                );
                continue;
            }
            Err(e) => {
                violations.push(
                    Violation::new(ViolationKind::UnreadableFile, format!("cannot read: {}", e))
                        .in_file(rel),
                );
                continue;
            }
        };

        scan_text(&text, rel, submission, policy, &mut violations);

        let count = language.count_entry_points(&text);
        if count > 0 {
            entries.push((rel.to_path_buf(), count));
        }
    }

    // 5. 전체 크기
    if total_bytes > policy.max_submission_bytes {
        violations.push(Violation::new(
            ViolationKind::Oversized,
            format!(
                "submission is {} bytes, limit is {} bytes",
                total_bytes, policy.max_submission_bytes
            ),
        ));
    }

    // 6. 엔트리 포인트 (정확히 하나)
    let total_entries: usize = entries.iter().map(|(_, n)| n).sum();
    if !saw_source || total_entries == 0 {
        violations.push(Violation::new(
            ViolationKind::MissingEntryPoint,
            format!(
                "no {} entry point found (expected `{}`)",
                language.display_name(),
                language.entry_point_hint()
            ),
        ));
    } else if total_entries > 1 {
        let files: Vec<String> = entries
            .iter()
            .map(|(f, _)| f.display().to_string())
            .collect();
        violations.push(Violation::new(
            ViolationKind::MultipleEntryPoints,
            format!(
                "{} entry points found in {}",
                total_entries,
                files.join(", ")
            ),
        ));
    }

    if violations.is_empty() {
        // entries has exactly one element with count 1 here
        let entry = entries
            .into_iter()
            .next()
            .map(|(f, _)| f)
            .unwrap_or_default();
        debug!(
            submission = %submission.id,
            label = %submission.label(),
            entry = %entry.display(),
            "Submission passed validation"
        );
        ValidationOutcome::Pass(ValidatedSubmission {
            submission: submission.clone(),
            entry,
        })
    } else {
        warn!(
            submission = %submission.id,
            label = %submission.label(),
            violations = violations.len(),
            first = %violations[0],
            "Submission rejected by security policy"
        );
        ValidationOutcome::Rejected(violations)
    }
}

fn scan_text(
    text: &str,
    rel: &Path,
    submission: &Submission,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
) {
    let language = submission.language;
    let comment = language.comment_prefix();
    let active: Vec<_> = policy
        .patterns
        .iter()
        .filter(|p| p.applies_to(language, policy.level))
        .collect();

    for (idx, line) in text.lines().enumerate() {
        if line.trim_start().starts_with(comment) {
            continue;
        }
        for pattern in &active {
            if pattern.is_match(line) {
                let mut violation = Violation::new(
                    ViolationKind::BlockedPattern,
                    format!("blocked pattern '{}' ({})", pattern.name, pattern.category),
                )
                .in_file(rel)
                .at_line(idx + 1);
                violation.pattern = Some(pattern.name.clone());
                violations.push(violation);
            }
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}
