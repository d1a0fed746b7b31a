//! Termination classification
//!
//! 실행이 어떻게 끝났는지를 격리 프리미티브가 남긴 증거만으로 판정한다.
//! 우선순위: deadline > 메모리 kill > 관측 피크 초과 > 출력 상한 초과 > exit 0 > 그 외.

use arena_foundation::{format_bytes, ResourceLimits};
use serde::Serialize;
use std::time::Duration;

use crate::isolation::ExitKind;
use crate::state::SubmissionState;

/// 실행 종료 시점에 수집된 증거
#[derive(Debug, Clone, Default)]
pub struct TerminationEvidence {
    /// 벽시계 deadline에 걸려 실행기가 kill했는지
    pub deadline_hit: bool,
    /// 프로세스 종료 형태 (알 수 없으면 None)
    pub exit: Option<ExitKind>,
    /// 격리 프리미티브의 메모리 kill 보고
    pub memory_event: bool,
    /// 관측된 최대 메모리 (모니터/프리미티브 중 큰 값)
    pub observed_peak: u64,
    /// stdout이 캡처 상한을 넘었는지
    pub output_truncated: bool,
    pub stderr_excerpt: String,
}

/// 초과한 자원 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Output,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Output => write!(f, "output"),
        }
    }
}

/// 실행 결과 분류
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunOutcome {
    CompileFailed {
        diagnostic: String,
    },
    Completed {
        exit_code: i32,
    },
    TimedOut {
        #[serde(with = "secs")]
        limit: Duration,
    },
    ResourceExceeded {
        resource: ResourceKind,
        detail: String,
    },
    RuntimeError {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr_excerpt: String,
    },
}

/// 직렬화용 결과 종류 (페이로드 없음)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    CompileFailed,
    Completed,
    TimedOut,
    ResourceExceeded,
    RuntimeError,
}

impl RunOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RunOutcome::CompileFailed { .. } => OutcomeKind::CompileFailed,
            RunOutcome::Completed { .. } => OutcomeKind::Completed,
            RunOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
            RunOutcome::ResourceExceeded { .. } => OutcomeKind::ResourceExceeded,
            RunOutcome::RuntimeError { .. } => OutcomeKind::RuntimeError,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// 이 결과로 끝나는 상태
    pub fn state(&self) -> SubmissionState {
        match self {
            RunOutcome::CompileFailed { .. } => SubmissionState::CompileFailed,
            RunOutcome::Completed { .. } => SubmissionState::Completed,
            RunOutcome::TimedOut { .. } => SubmissionState::TimedOut,
            RunOutcome::ResourceExceeded { .. } => SubmissionState::ResourceExceeded,
            RunOutcome::RuntimeError { .. } => SubmissionState::RuntimeError,
        }
    }

    /// 보고서에 실을 진단 문자열 (성공이면 None)
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            RunOutcome::Completed { .. } => None,
            RunOutcome::CompileFailed { diagnostic } => Some(diagnostic.clone()),
            RunOutcome::TimedOut { limit } => {
                Some(format!("timed out after {}s", limit.as_secs_f64()))
            }
            RunOutcome::ResourceExceeded { resource, detail } => {
                Some(format!("{} limit exceeded: {}", resource, detail))
            }
            RunOutcome::RuntimeError {
                exit_code,
                signal,
                stderr_excerpt,
            } => {
                let status = match (exit_code, signal) {
                    (Some(code), _) => format!("exit code {}", code),
                    (None, Some(sig)) => format!("killed by signal {}", sig),
                    (None, None) => "abnormal termination".to_string(),
                };
                if stderr_excerpt.is_empty() {
                    Some(status)
                } else {
                    Some(format!("{}: {}", status, stderr_excerpt))
                }
            }
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutcomeKind::CompileFailed => "compile_failed",
            OutcomeKind::Completed => "completed",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::ResourceExceeded => "resource_exceeded",
            OutcomeKind::RuntimeError => "runtime_error",
        };
        write!(f, "{}", name)
    }
}

/// Run 단계 종료 분류
pub fn classify(evidence: &TerminationEvidence, limits: &ResourceLimits) -> RunOutcome {
    if evidence.deadline_hit {
        return RunOutcome::TimedOut {
            limit: limits.timeout,
        };
    }

    if evidence.memory_event {
        return RunOutcome::ResourceExceeded {
            resource: ResourceKind::Memory,
            detail: format!(
                "killed by memory controller (limit {})",
                format_bytes(limits.memory_bytes)
            ),
        };
    }

    // 프리미티브가 보고하지 못한 경우의 보조 증거
    if evidence.observed_peak > limits.memory_bytes {
        return RunOutcome::ResourceExceeded {
            resource: ResourceKind::Memory,
            detail: format!(
                "peak {} over limit {}",
                format_bytes(evidence.observed_peak),
                format_bytes(limits.memory_bytes)
            ),
        };
    }

    if evidence.output_truncated {
        return RunOutcome::ResourceExceeded {
            resource: ResourceKind::Output,
            detail: format!(
                "stdout over {}",
                format_bytes(limits.max_output_bytes as u64)
            ),
        };
    }

    match evidence.exit {
        Some(ExitKind::Exited(0)) => RunOutcome::Completed { exit_code: 0 },
        Some(exit) => RunOutcome::RuntimeError {
            exit_code: exit.code(),
            signal: exit.signal(),
            stderr_excerpt: evidence.stderr_excerpt.clone(),
        },
        None => RunOutcome::RuntimeError {
            exit_code: None,
            signal: None,
            stderr_excerpt: evidence.stderr_excerpt.clone(),
        },
    }
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
