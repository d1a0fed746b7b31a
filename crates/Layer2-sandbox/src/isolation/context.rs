//! Execution Context - 격리 환경 인스턴스 하나
//!
//! ```text
//! <work_root>/<context-id>/
//! ├── data/measurements.txt   (read-only, dataset)
//! ├── src/                    (read-only copy of the submission)
//! ├── build/                  (compile output, read-only during run)
//! └── scratch/                (writable, size-capped)
//! ```
//!
//! 컨텍스트는 실행 하나가 독점하며 재사용하지 않는다. `destroy`를 거치지 않고
//! drop되면 작업 디렉토리를 지운다.

use arena_foundation::{LanguageVariant, ResourceLimits, Result, SandboxPolicy};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::security::ValidatedSubmission;
use crate::submission::SubmissionId;

/// 컨텍스트 안의 데이터셋 경로 (작업 디렉토리 기준)
pub const DATA_FILE: &str = "data/measurements.txt";

/// Unique identifier for an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// 실행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

/// 격리 환경에서 실행할 명령
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub phase: Phase,
    pub argv: Vec<String>,
}

impl CommandSpec {
    pub fn compile(argv: Vec<String>) -> Self {
        Self {
            phase: Phase::Compile,
            argv,
        }
    }

    pub fn run(argv: Vec<String>) -> Self {
        Self {
            phase: Phase::Run,
            argv,
        }
    }

    /// Run 단계만 stdin에 데이터셋을 연결
    pub fn stdin_dataset(&self) -> bool {
        self.phase == Phase::Run
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// 격리 환경 인스턴스
#[derive(Debug)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub submission: SubmissionId,
    pub language: LanguageVariant,
    pub work_dir: PathBuf,
    /// 호스트의 데이터셋 (절대 경로)
    pub dataset: PathBuf,
    /// 엔트리 포인트 (`src/...`)
    pub entry: String,
    /// 소스 파일들 (`src/...`)
    pub sources: Vec<String>,
    pub limits: ResourceLimits,
    pub policy: SandboxPolicy,
    /// Provider 전용: cgroup 이름 접두사 또는 컨테이너 라벨
    pub(crate) provider_tag: Option<String>,
    armed: bool,
}

impl ExecutionContext {
    /// 작업 디렉토리 준비 (소스 복사, 디렉토리 생성). 데이터셋 연결은 provider가 한다.
    pub(crate) fn prepare(
        work_root: &Path,
        submission: &ValidatedSubmission,
        dataset: &Path,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
    ) -> Result<Self> {
        let id = ContextId::new();
        let work_dir = work_root.join(format!("ctx-{}", id.0.simple()));
        let sub = submission.submission();

        let ctx = Self {
            id,
            submission: sub.id,
            language: sub.language,
            work_dir,
            dataset: dataset.to_path_buf(),
            entry: src_relative(submission.entry()),
            sources: sub.files.iter().map(|f| src_relative(f)).collect(),
            limits: limits.clone(),
            policy: policy.clone(),
            provider_tag: None,
            armed: true,
        };

        for dir in [ctx.src_dir(), ctx.build_dir(), ctx.scratch_dir(), ctx.data_dir()] {
            std::fs::create_dir_all(&dir)?;
        }

        for (from, rel) in sub.paths() {
            let to = ctx.src_dir().join(rel);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
            set_mode(&to, 0o444)?;
        }
        set_mode(&ctx.scratch_dir(), 0o700)?;

        debug!(
            context = %ctx.id,
            submission = %ctx.submission,
            dir = %ctx.work_dir.display(),
            "Prepared execution context"
        );

        Ok(ctx)
    }

    pub fn src_dir(&self) -> PathBuf {
        self.work_dir.join("src")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.work_dir.join("build")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }

    pub fn data_file(&self) -> PathBuf {
        self.work_dir.join(DATA_FILE)
    }

    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.language.compile_command(&self.sources)
    }

    pub fn run_command(&self) -> Vec<String> {
        self.language
            .run_command(&self.entry, self.limits.memory_mb())
    }

    /// 작업 디렉토리 삭제 (읽기 전용 파일 포함)
    pub(crate) fn wipe(&mut self) -> Result<()> {
        self.armed = false;
        if !self.work_dir.exists() {
            return Ok(());
        }
        make_writable(&self.work_dir);
        std::fs::remove_dir_all(&self.work_dir)?;
        debug!(context = %self.id, "Wiped execution context");
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.wipe() {
                warn!(context = %self.id, error = %e, "Failed to wipe context on drop");
            }
        }
    }
}

fn src_relative(path: &Path) -> String {
    Path::new("src").join(path).to_string_lossy().into_owned()
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// 삭제 전에 디렉토리 트리 권한 복구
fn make_writable(dir: &Path) {
    let _ = set_mode(dir, 0o755);
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => make_writable(&path),
                Ok(ft) if ft.is_file() => {
                    let _ = set_mode(&path, 0o644);
                }
                _ => {}
            }
        }
    }
}
