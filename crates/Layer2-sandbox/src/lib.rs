//! # arena-sandbox
//!
//! 제출물 하나를 검증하고 격리 환경에서 실행하는 계층:
//! - Submission / State: 제출물 식별과 상태 머신
//! - Security: 정적 검증 (`ValidatedSubmission`만 실행기로 넘어간다)
//! - Isolation: 격리 프리미티브 (process, container, scripted)
//! - Monitor: 실행 중 리소스 샘플링
//! - Executor / Classify: compile/run 구동과 종료 분류
//! - Output: 출력 형식 준수율, 기대값 검증

pub mod classify;
pub mod executor;
pub mod isolation;
pub mod monitor;
pub mod output;
pub mod security;
pub mod state;
pub mod submission;

// ============================================================================
// Submission
// ============================================================================
pub use state::SubmissionState;
pub use submission::{discover, Submission, SubmissionId};

// ============================================================================
// Security (보안 검증)
// ============================================================================
pub use security::{
    validate_with, SecurityPolicy, SecurityValidator, ValidatedSubmission, ValidationOutcome,
    Violation, ViolationKind,
};

// ============================================================================
// Isolation (격리)
// ============================================================================
pub use isolation::{
    ContainerProvider, ExitKind, IsolationProvider, ProcessProvider, ScriptedProvider,
    ScriptedRun, SubmissionScript,
};

// ============================================================================
// Execution (실행)
// ============================================================================
pub use classify::{classify, OutcomeKind, ResourceKind, RunOutcome, TerminationEvidence};
pub use executor::{ExecutionReport, SandboxExecutor};
pub use monitor::{ResourceMonitor, UsageSummary};

// ============================================================================
// Output (출력 검증)
// ============================================================================
pub use output::{
    AccuracyReport, ComplianceReport, OutputRecord, OutputValidator, ReferenceStats,
};
