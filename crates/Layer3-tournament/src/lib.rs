//! # arena-tournament
//!
//! 제출물 배치 실행 계층:
//! - Orchestrator: 워커 풀로 검증 → 실행 → 출력 검증 구동
//! - Aggregate: 순위, 통계 (단일 reduction)
//! - Report: 불변 보고서, JSON 저장, 텍스트 요약

pub mod aggregate;
pub mod orchestrator;
pub mod report;

pub use aggregate::{aggregate, OutcomeCounts, ReportEntry, Standing, Statistics};
pub use orchestrator::{pool_size, BatchOrchestrator, IterationTiming, SubmissionResult};
pub use report::{RunMetadata, TournamentReport};
