//! Isolation - 격리 프리미티브 추상화
//!
//! 실행기는 격리를 직접 구현하지 않고 `IsolationProvider`를 통해 구동한다.
//!
//! - `ProcessProvider`: 프로세스 그룹 + rlimit + cgroup v2 + network namespace
//! - `ContainerProvider`: docker CLI
//! - `ScriptedProvider`: 테스트용 (미리 정한 결과를 재생)

mod capture;
mod cgroup;
mod container;
mod context;
mod process;
mod scripted;

pub use capture::{drain, excerpt, Captured};
pub use container::ContainerProvider;
pub use context::{CommandSpec, ContextId, ExecutionContext, Phase, DATA_FILE};
pub use process::ProcessProvider;
pub use scripted::{ScriptedProvider, ScriptedRun, SubmissionScript};

use arena_foundation::{ResourceLimits, Result, SandboxPolicy};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::monitor::ResourceProbe;
use crate::security::ValidatedSubmission;

/// 프로세스 종료 형태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl ExitKind {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitKind::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitKind::Exited(code) => Some(*code),
            ExitKind::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitKind::Signaled(sig) => Some(*sig),
            ExitKind::Exited(_) => None,
        }
    }

    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Exited(code),
            (None, Some(sig)) => ExitKind::Signaled(sig),
            (None, None) => ExitKind::Exited(-1),
        }
    }

    #[cfg(not(unix))]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        ExitKind::Exited(status.code().unwrap_or(-1))
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {}", code),
            ExitKind::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// 종료 후 수집된 결과
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Captured,
    pub stderr: Captured,
    /// 격리 프리미티브가 메모리 상한으로 죽였는지
    pub memory_event: bool,
    /// 프리미티브가 기록한 최대 메모리 (있으면)
    pub peak_memory_bytes: Option<u64>,
}

/// 격리 환경에서 실행 중인 프로세스
#[async_trait]
pub trait SandboxProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// 리소스 모니터가 사용할 프로브
    fn probe(&self) -> Arc<dyn ResourceProbe>;

    /// 종료 대기 (취소 안전, 여러 번 호출 가능)
    async fn wait(&mut self) -> Result<ExitKind>;

    /// 프로세스 그룹 전체 강제 종료
    async fn kill_group(&mut self) -> Result<()>;

    /// 출력 수집 및 프리미티브 자원 정리
    async fn finish(self: Box<Self>) -> Result<ProcessOutput>;
}

/// 격리 프리미티브
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// 사용 가능 여부 확인 (불가하면 `IsolationUnavailable`)
    async fn check(&self) -> Result<()>;

    async fn create_context(
        &self,
        submission: &ValidatedSubmission,
        dataset: &Path,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionContext>;

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
    ) -> Result<Box<dyn SandboxProcess>>;

    /// 컨텍스트 정리 (모든 경로에서 호출)
    async fn destroy(&self, ctx: ExecutionContext) -> Result<()>;

    /// 중단된 실행이 남긴 프리미티브 자원 일괄 정리 (배치 중단 후)
    async fn sweep(&self) -> Result<()> {
        Ok(())
    }
}
