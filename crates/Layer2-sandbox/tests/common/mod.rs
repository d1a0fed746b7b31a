//! 통합 테스트 공용 픽스처

#![allow(dead_code)]

use arena_foundation::LanguageVariant;
use arena_sandbox::{SecurityPolicy, SecurityValidator, Submission, ValidatedSubmission, ValidationOutcome};
use std::path::{Path, PathBuf};

pub const RECORD: &str = "Abha=-23.0/18.0/59.2\n";

pub const PY_OK: &str = r#"import sys

def main():
    for line in sys.stdin:
        pass
    print("Abha=-23.0/18.0/59.2")

if __name__ == "__main__":
    main()
"#;

pub const PY_SPAWN: &str = r#"import subprocess

if __name__ == "__main__":
    subprocess.run(["ls"])
"#;

/// 임시 작업 공간: 데이터셋, 제출물 디렉토리, 컨텍스트 루트
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = Self { dir };
        std::fs::write(ws.dataset(), "Abha=-23.0\nAbha=59.2\nAbha=18.0\n").expect("dataset");
        ws
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn dataset(&self) -> PathBuf {
        self.root().join("measurements.txt")
    }

    pub fn work_root(&self) -> PathBuf {
        self.root().join("work")
    }

    pub fn submissions(&self) -> PathBuf {
        self.root().join("submissions")
    }

    /// `submissions/<lang>/<file>` 작성
    pub fn write(&self, language: LanguageVariant, file: &str, body: &str) -> PathBuf {
        let dir = self.submissions().join(language.dir_name());
        std::fs::create_dir_all(&dir).expect("language dir");
        let path = dir.join(file);
        std::fs::write(&path, body).expect("submission");
        path
    }

    pub fn python(&self, participant: &str, body: &str) -> Submission {
        let path = self.write(LanguageVariant::Python, &format!("{}.py", participant), body);
        Submission::from_path(&path, LanguageVariant::Python).expect("submission")
    }
}

pub fn validate(submission: &Submission) -> ValidationOutcome {
    SecurityValidator::new(SecurityPolicy::new().expect("policy")).validate(submission)
}

pub fn validated(submission: &Submission) -> ValidatedSubmission {
    match validate(submission) {
        ValidationOutcome::Pass(v) => v,
        ValidationOutcome::Rejected(v) => panic!("unexpected rejection: {:?}", v),
    }
}
