//! Batch Orchestrator - 제출물 전체를 검증 → 실행 → 출력 검증 파이프라인으로 구동
//!
//! ## 동시성
//!
//! ```text
//! submissions ──▶ JoinSet ──┬─ [permit] validate → execute × N → check output ─┐
//!                           ├─ [permit] ...                                     ├─▶ Vec<SubmissionResult>
//!                           └─ [permit] ...                                     ┘   (arrival 순 정렬)
//! ```
//!
//! - `Semaphore` 하나가 동시에 살아 있는 실행 컨텍스트 수를 제한한다
//! - 각 워커는 자신의 결과를 소유하고 join handle로 돌려준다 (공유 카운터 없음)
//! - 제출물 하나의 패닉은 그 제출물의 engine fault로 기록된다
//! - 인프라 에러(`Error::is_fatal`)는 남은 워커를 모두 중단하고 배치를 실패시킨다

use arena_foundation::{
    Error, PolicyFile, ResourceLimits, Result, RunConfig, SandboxPolicy, SecurityLevel,
};
use arena_sandbox::{
    ComplianceReport, ExecutionReport, IsolationProvider, OutputValidator, ReferenceStats,
    ResourceMonitor, RunOutcome, SandboxExecutor, SecurityPolicy, SecurityValidator, Submission,
    SubmissionState, ValidatedSubmission, ValidationOutcome, Violation,
};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Results
// ============================================================================

/// 반복 실행 시간 통계
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationTiming {
    pub runs: usize,
    pub mean_secs: f64,
    pub best_secs: f64,
    pub worst_secs: f64,
    /// 표본 표준편차 (1회 실행이면 0)
    pub std_dev_secs: f64,
}

impl IterationTiming {
    pub fn from_durations(durations: &[Duration]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }

        let secs: Vec<f64> = durations.iter().map(Duration::as_secs_f64).collect();
        let n = secs.len() as f64;
        let mean = secs.iter().sum::<f64>() / n;
        let std_dev = if secs.len() > 1 {
            (secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Some(Self {
            runs: secs.len(),
            mean_secs: mean,
            best_secs: secs.iter().copied().fold(f64::INFINITY, f64::min),
            worst_secs: secs.iter().copied().fold(0.0, f64::max),
            std_dev_secs: std_dev,
        })
    }
}

/// 제출물 하나의 최종 기록
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub submission: Submission,
    pub state: SubmissionState,
    /// 마지막 반복의 실행 보고서
    pub report: Option<ExecutionReport>,
    pub violations: Vec<Violation>,
    pub compliance: Option<ComplianceReport>,
    /// 2회 이상 모두 완료된 경우만
    pub timing: Option<IterationTiming>,
    pub diagnostic: Option<String>,
}

impl SubmissionResult {
    fn new(submission: Submission, state: SubmissionState) -> Self {
        Self {
            submission,
            state,
            report: None,
            violations: Vec::new(),
            compliance: None,
            timing: None,
            diagnostic: None,
        }
    }

    fn rejected(submission: Submission, violations: Vec<Violation>) -> Self {
        let diagnostic = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            violations,
            diagnostic: Some(diagnostic),
            ..Self::new(submission, SubmissionState::Rejected)
        }
    }

    /// 파이프라인 내부 패닉이나 비치명적 엔진 에러
    pub fn engine_fault(submission: Submission, message: impl std::fmt::Display) -> Self {
        Self {
            diagnostic: Some(format!("engine fault: {}", message)),
            ..Self::new(submission, SubmissionState::RuntimeError)
        }
    }

    pub fn is_reported(&self) -> bool {
        self.state == SubmissionState::Reported
    }

    /// 순위에 쓰는 실행 시간 (반복 실행이면 평균)
    pub fn duration(&self) -> Option<Duration> {
        if let Some(timing) = &self.timing {
            return Some(Duration::from_secs_f64(timing.mean_secs));
        }
        self.report.as_ref().map(|r| r.duration)
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.report.as_ref().map(|r| &r.outcome)
    }
}

// ============================================================================
// Pool sizing
// ============================================================================

/// 워커 풀 크기: min(코어 / CPU 상한, 호스트 메모리 / 메모리 상한), 최소 1
pub fn pool_size(limits: &ResourceLimits, max_concurrency: Option<usize>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    compute_pool_size(cores, host_memory_bytes(), limits, max_concurrency)
}

fn compute_pool_size(
    cores: usize,
    host_memory: Option<u64>,
    limits: &ResourceLimits,
    max_concurrency: Option<usize>,
) -> usize {
    let by_cpu = if limits.cpu_cores > 0.0 {
        (cores as f64 / limits.cpu_cores).floor() as usize
    } else {
        cores
    };
    let by_memory = match host_memory {
        Some(total) if limits.memory_bytes > 0 => (total / limits.memory_bytes) as usize,
        _ => usize::MAX,
    };

    let size = by_cpu.min(by_memory).max(1);
    match max_concurrency {
        Some(max) => size.min(max.max(1)),
        None => size,
    }
}

/// `/proc/meminfo`의 MemTotal
fn host_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

// ============================================================================
// Orchestrator
// ============================================================================

/// 워커들이 공유하는 읽기 전용 파이프라인
struct Pipeline {
    validator: SecurityValidator,
    executor: SandboxExecutor,
    output: OutputValidator,
    limits: ResourceLimits,
    sandbox: SandboxPolicy,
    iterations: u32,
}

/// 배치 오케스트레이터
pub struct BatchOrchestrator {
    pipeline: Arc<Pipeline>,
    provider: Arc<dyn IsolationProvider>,
    dataset: PathBuf,
    level: SecurityLevel,
    pool_size: usize,
    verify_results: bool,
}

impl BatchOrchestrator {
    /// 실행 설정과 보안 정책으로 생성 (정책 컴파일 실패는 에러)
    pub fn new(
        provider: Arc<dyn IsolationProvider>,
        run: &RunConfig,
        policy: &PolicyFile,
    ) -> Result<Self> {
        let limits = run.limits(policy.scratch_bytes());
        let executor = SandboxExecutor::new(provider.clone(), run.data_file_path.clone())
            .with_monitor(ResourceMonitor::new(run.monitor_interval()));

        let pipeline = Pipeline {
            validator: SecurityValidator::new(SecurityPolicy::from_file(policy)?),
            executor,
            output: OutputValidator::new(run.output_threshold),
            sandbox: policy.sandbox(),
            iterations: run.iterations.max(1),
            limits: limits.clone(),
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            provider,
            dataset: run.data_file_path.clone(),
            level: policy.level(),
            pool_size: pool_size(&limits, run.max_concurrency),
            verify_results: run.verify_results,
        })
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.pipeline.limits
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.level
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    pub fn iterations(&self) -> u32 {
        self.pipeline.iterations
    }

    /// 배치 시작 전 인프라 확인 (데이터셋, 격리 프리미티브)
    pub async fn preflight(&self) -> Result<()> {
        if !tokio::fs::metadata(&self.dataset)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Err(Error::DatasetMissing(self.dataset.display().to_string()));
        }

        self.provider.check().await?;
        debug!(provider = self.provider.name(), "Isolation provider available");
        Ok(())
    }

    /// 배치 실행. 결과는 arrival 순서로 반환된다.
    #[instrument(skip_all, fields(submissions = submissions.len(), pool = self.pool_size))]
    pub async fn run(&self, submissions: Vec<Submission>) -> Result<Vec<SubmissionResult>> {
        self.preflight().await?;

        let reference = if self.verify_results {
            Some(Arc::new(self.load_reference().await?))
        } else {
            None
        };

        info!(
            submissions = submissions.len(),
            pool = self.pool_size,
            limits = %self.pipeline.limits.describe(),
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut workers: JoinSet<Result<SubmissionResult>> = JoinSet::new();

        for submission in submissions {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let reference = reference.clone();

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err(Error::Internal(format!("worker pool closed: {}", e))),
                };

                let fallback = submission.clone();
                let guarded = AssertUnwindSafe(pipeline.process(submission, reference.as_deref()))
                    .catch_unwind()
                    .await;

                match guarded {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) if e.is_fatal() => Err(e),
                    Ok(Err(e)) => {
                        warn!(participant = %fallback.participant, error = %e, "Engine error recorded");
                        Ok(SubmissionResult::engine_fault(fallback, e))
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(participant = %fallback.participant, panic = %message, "Pipeline panicked");
                        Ok(SubmissionResult::engine_fault(fallback, message))
                    }
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    error!(error = %e, "Infrastructure failure, aborting batch");
                    self.abort(&mut workers).await;
                    return Err(e);
                }
                Err(e) => {
                    self.abort(&mut workers).await;
                    return Err(Error::Internal(format!("worker failed: {}", e)));
                }
            }
        }

        results.sort_by_key(|r| r.submission.arrival);
        info!(
            total = results.len(),
            reported = results.iter().filter(|r| r.is_reported()).count(),
            "Batch finished"
        );
        Ok(results)
    }

    /// 남은 워커 중단. Drop 가드가 컨텍스트를 정리하고, 프리미티브 쪽 잔여물은 sweep으로 지운다.
    async fn abort(&self, workers: &mut JoinSet<Result<SubmissionResult>>) {
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        if let Err(e) = self.provider.sweep().await {
            warn!(provider = self.provider.name(), error = %e, "Sweep after abort failed");
        }
    }

    async fn load_reference(&self) -> Result<ReferenceStats> {
        let dataset = self.dataset.clone();
        let reference = tokio::task::spawn_blocking(move || ReferenceStats::from_path(&dataset))
            .await
            .map_err(|e| Error::Internal(format!("reference task failed: {}", e)))??;
        info!(
            stations = reference.station_count(),
            measurements = reference.measurements(),
            "Reference statistics ready"
        );
        Ok(reference)
    }
}

impl Pipeline {
    #[instrument(skip_all, fields(participant = %submission.participant, language = %submission.language))]
    async fn process(
        &self,
        submission: Submission,
        reference: Option<&ReferenceStats>,
    ) -> Result<SubmissionResult> {
        let state = SubmissionState::Pending.advance(SubmissionState::Validating)?;

        let validated = match self.validator.validate(&submission) {
            ValidationOutcome::Pass(validated) => validated,
            ValidationOutcome::Rejected(violations) => {
                state.advance(SubmissionState::Rejected)?;
                info!(violations = violations.len(), "Submission rejected");
                return Ok(SubmissionResult::rejected(submission, violations));
            }
        };

        let state = state.advance(SubmissionState::Compiling)?;
        let reports = self.execute_series(&validated).await?;
        let Some(report) = reports.last().cloned() else {
            return Err(Error::Internal("no execution report".into()));
        };
        let submission = validated.into_submission();

        let state = match &report.outcome {
            RunOutcome::CompileFailed { .. } => state.advance(SubmissionState::CompileFailed)?,
            outcome => state
                .advance(SubmissionState::Running)?
                .advance(outcome.state())?,
        };

        let mut result = SubmissionResult::new(submission, state);
        result.diagnostic = report.outcome.diagnostic();

        if state == SubmissionState::Completed {
            let compliance = match reference {
                Some(reference) => self.output.validate_against(&report.stdout, reference),
                None => self.output.validate(&report.stdout),
            };

            result.state = if compliance.passed {
                state.advance(SubmissionState::Reported)?
            } else {
                result.diagnostic = Some(format!(
                    "output compliance {:.1}% below threshold {:.1}%",
                    compliance.ratio * 100.0,
                    compliance.threshold * 100.0
                ));
                state.advance(SubmissionState::OutputInvalid)?
            };
            debug!(summary = %compliance.summary(), "Output checked");

            if reports.len() > 1 {
                let durations: Vec<Duration> = reports.iter().map(|r| r.duration).collect();
                result.timing = IterationTiming::from_durations(&durations);
            }
            result.compliance = Some(compliance);
        }

        info!(state = %result.state, "Submission finished");
        result.report = Some(report);
        Ok(result)
    }

    /// 최대 `iterations`회 실행, 완료되지 않은 첫 반복에서 중단
    async fn execute_series(&self, validated: &ValidatedSubmission) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::with_capacity(self.iterations as usize);

        for iteration in 1..=self.iterations {
            let report = self
                .executor
                .execute(validated, &self.limits, &self.sandbox)
                .await?;
            let completed = report.outcome.is_completed();
            debug!(
                iteration,
                outcome = %report.outcome.kind(),
                duration_ms = report.duration.as_millis() as u64,
                "Iteration finished"
            );
            reports.push(report);

            if !completed {
                break;
            }
        }

        Ok(reports)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_pool_size_bounded_by_cpu_and_memory() {
        let limits = ResourceLimits::default()
            .with_cpu_cores(1.0)
            .with_memory_bytes(2 * GB);

        assert_eq!(compute_pool_size(8, Some(64 * GB), &limits, None), 8);
        assert_eq!(compute_pool_size(8, Some(6 * GB), &limits, None), 3);
        assert_eq!(compute_pool_size(8, None, &limits, None), 8);
        assert_eq!(compute_pool_size(8, Some(64 * GB), &limits, Some(2)), 2);
    }

    #[test]
    fn test_pool_size_at_least_one() {
        let limits = ResourceLimits::default()
            .with_cpu_cores(4.0)
            .with_memory_bytes(32 * GB);

        assert_eq!(compute_pool_size(2, Some(8 * GB), &limits, None), 1);
        assert_eq!(compute_pool_size(2, Some(8 * GB), &limits, Some(0)), 1);
    }

    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16318412 kB\nMemFree:         1203456 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16318412 * 1024));
        assert_eq!(parse_mem_total("garbage"), None);
    }

    #[test]
    fn test_iteration_timing() {
        let timing = IterationTiming::from_durations(&[
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(6),
        ])
        .unwrap();

        assert_eq!(timing.runs, 3);
        assert_eq!(timing.mean_secs, 4.0);
        assert_eq!(timing.best_secs, 2.0);
        assert_eq!(timing.worst_secs, 6.0);
        assert_eq!(timing.std_dev_secs, 2.0);

        let single = IterationTiming::from_durations(&[Duration::from_secs(3)]).unwrap();
        assert_eq!(single.std_dev_secs, 0.0);
        assert!(IterationTiming::from_durations(&[]).is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");
    }
}
