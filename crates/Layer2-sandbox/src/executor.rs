//! Sandbox Executor - 격리 환경에서 compile/run 구동
//!
//! ## 흐름
//! 1. provider로 컨텍스트 생성
//! 2. Compile (컴파일 언어만, compile sub-deadline)
//! 3. Run (stdin = 데이터셋, 벽시계 deadline) + 리소스 모니터 동시 실행
//! 4. 증거 수집 후 `classify`
//! 5. 컨텍스트 정리 (panic 포함 모든 경로)

use arena_foundation::{Error, ResourceLimits, Result, SandboxPolicy};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{classify, RunOutcome, TerminationEvidence};
use crate::isolation::{CommandSpec, ContextId, ExecutionContext, ExitKind, IsolationProvider};
use crate::monitor::{ResourceMonitor, UsageSummary};
use crate::security::ValidatedSubmission;

/// kill 이후 종료를 기다리는 최대 시간
const KILL_GRACE: Duration = Duration::from_secs(5);
/// 보고서에 싣는 stderr 길이
const STDERR_EXCERPT: usize = 2048;

/// 실행 하나의 결과
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub context_id: ContextId,
    pub outcome: RunOutcome,
    /// Run 단계 벽시계 시간 (TimedOut이면 설정된 제한과 같음)
    #[serde(serialize_with = "secs")]
    pub duration: Duration,
    #[serde(serialize_with = "secs_opt")]
    pub compile_duration: Option<Duration>,
    pub peak_memory_bytes: u64,
    pub usage: UsageSummary,
    pub exit: Option<ExitKind>,
    #[serde(skip)]
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_excerpt: String,
}

impl ExecutionReport {
    fn compile_failed(context_id: ContextId, diagnostic: String, compile: Duration) -> Self {
        Self {
            context_id,
            outcome: RunOutcome::CompileFailed { diagnostic },
            duration: Duration::ZERO,
            compile_duration: Some(compile),
            peak_memory_bytes: 0,
            usage: UsageSummary::default(),
            exit: None,
            stdout: Vec::new(),
            stdout_truncated: false,
            stderr_excerpt: String::new(),
        }
    }
}

fn secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn secs_opt<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// 격리 실행기
pub struct SandboxExecutor {
    provider: Arc<dyn IsolationProvider>,
    dataset: PathBuf,
    monitor: ResourceMonitor,
}

impl SandboxExecutor {
    pub fn new(provider: Arc<dyn IsolationProvider>, dataset: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            dataset: dataset.into(),
            monitor: ResourceMonitor::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn provider(&self) -> &Arc<dyn IsolationProvider> {
        &self.provider
    }

    pub fn dataset(&self) -> &Path {
        &self.dataset
    }

    /// 검증된 제출물 하나 실행
    ///
    /// `Err`는 인프라 오류뿐이다. 제출물 자체의 실패는 `Ok` 보고서의 outcome으로 표현된다.
    #[instrument(
        skip_all,
        fields(
            participant = %submission.submission().participant,
            language = %submission.submission().language,
        )
    )]
    pub async fn execute(
        &self,
        submission: &ValidatedSubmission,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionReport> {
        let ctx = self
            .provider
            .create_context(submission, &self.dataset, limits, policy)
            .await?;
        let context_id = ctx.id;

        let driven = AssertUnwindSafe(self.drive(&ctx)).catch_unwind().await;

        if let Err(e) = self.provider.destroy(ctx).await {
            warn!(context = %context_id, error = %e, "Context teardown failed");
        }

        match driven {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn drive(&self, ctx: &ExecutionContext) -> Result<ExecutionReport> {
        let mut compile_duration = None;

        if let Some(argv) = ctx.compile_command() {
            let started = Instant::now();
            let compiled = self.compile(ctx, argv).await?;
            let elapsed = started.elapsed();
            compile_duration = Some(elapsed);

            if let Err(diagnostic) = compiled {
                info!(context = %ctx.id, %diagnostic, "Compilation failed");
                return Ok(ExecutionReport::compile_failed(ctx.id, diagnostic, elapsed));
            }
            debug!(context = %ctx.id, elapsed_ms = elapsed.as_millis() as u64, "Compiled");
        }

        self.run(ctx, compile_duration).await
    }

    /// Compile 단계. 안쪽 `Err(String)`은 컴파일 실패 진단
    async fn compile(
        &self,
        ctx: &ExecutionContext,
        argv: Vec<String>,
    ) -> Result<std::result::Result<(), String>> {
        let limit = ctx.limits.compile_timeout;
        let mut process = self.provider.spawn(ctx, &CommandSpec::compile(argv)).await?;

        let exit = tokio::select! {
            exit = process.wait() => Some(exit?),
            _ = sleep(limit) => None,
        };

        if exit.is_none() {
            process.kill_group().await?;
            let _ = timeout(KILL_GRACE, process.wait()).await;
        }
        let output = process.finish().await?;

        Ok(match exit {
            None => Err(format!(
                "compilation timed out after {}s",
                limit.as_secs()
            )),
            Some(_) if output.memory_event => Err("compiler exceeded memory limit".to_string()),
            Some(exit) if exit.is_success() => Ok(()),
            Some(exit) => {
                // javac/g++/go는 stderr, 일부 도구는 stdout에 진단을 쓴다
                let mut diagnostic = output.stderr.tail(STDERR_EXCERPT);
                if diagnostic.is_empty() {
                    diagnostic = output.stdout.tail(STDERR_EXCERPT);
                }
                if diagnostic.is_empty() {
                    diagnostic = format!("compiler failed with {}", exit);
                }
                Err(diagnostic)
            }
        })
    }

    /// Run 단계
    async fn run(
        &self,
        ctx: &ExecutionContext,
        compile_duration: Option<Duration>,
    ) -> Result<ExecutionReport> {
        let limits = &ctx.limits;
        let mut process = self
            .provider
            .spawn(ctx, &CommandSpec::run(ctx.run_command()))
            .await?;
        let started = Instant::now();

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(self.monitor.clone().run(process.probe(), cancel.clone()));

        let waited = tokio::select! {
            exit = process.wait() => Some(exit),
            _ = sleep(limits.timeout) => None,
        };
        let elapsed = started.elapsed();
        let deadline_hit = waited.is_none();

        // 종료와 같은 단계에서 모니터 취소. 남은 자식까지 그룹 단위로 정리한다.
        cancel.cancel();
        let killed = process.kill_group().await;

        let settled = async {
            let exit = match waited {
                Some(exit) => Some(exit?),
                None => {
                    warn!(
                        context = %ctx.id,
                        limit_secs = limits.timeout.as_secs(),
                        "Deadline reached, killed process group"
                    );
                    timeout(KILL_GRACE, process.wait()).await.ok().transpose()?
                }
            };
            killed?;
            let output = process.finish().await?;
            Ok::<_, Error>((exit, output))
        }
        .await;

        // 실패 경로에서도 모니터 태스크를 회수한 뒤 에러를 전파한다
        let usage = match monitor.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(context = %ctx.id, error = %e, "Monitor task failed");
                UsageSummary::default()
            }
        };
        let (exit, output) = settled?;

        let peak_memory_bytes = usage
            .peak_memory_bytes
            .max(output.peak_memory_bytes.unwrap_or(0));
        let evidence = TerminationEvidence {
            deadline_hit,
            exit,
            memory_event: output.memory_event,
            observed_peak: peak_memory_bytes,
            output_truncated: output.stdout.truncated,
            stderr_excerpt: output.stderr.tail(STDERR_EXCERPT),
        };
        let outcome = classify(&evidence, limits);
        let duration = if deadline_hit { limits.timeout } else { elapsed };

        info!(
            context = %ctx.id,
            outcome = %outcome.kind(),
            duration_ms = duration.as_millis() as u64,
            usage = %usage.summary_report(),
            "Run finished"
        );

        Ok(ExecutionReport {
            context_id: ctx.id,
            outcome,
            duration,
            compile_duration,
            peak_memory_bytes,
            usage,
            exit,
            stdout_truncated: output.stdout.truncated,
            stdout: output.stdout.bytes,
            stderr_excerpt: evidence.stderr_excerpt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{OutcomeKind, ResourceKind};
    use crate::isolation::{Phase, ScriptedProvider, ScriptedRun, SubmissionScript};
    use crate::security::{SecurityPolicy, SecurityValidator, ValidationOutcome};
    use crate::submission::Submission;
    use arena_foundation::LanguageVariant;

    const LINE: &str = "Abha=-23.0/18.0/59.2\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        dataset: PathBuf,
        work: PathBuf,
        src: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();
        let src = dir.path().join("submissions");
        std::fs::create_dir_all(&src).unwrap();
        Fixture {
            dataset,
            work: dir.path().join("work"),
            src,
            _dir: dir,
        }
    }

    fn validated(fx: &Fixture, name: &str, language: LanguageVariant) -> ValidatedSubmission {
        let (file, body) = match language {
            LanguageVariant::Java => (
                format!("{}.java", name),
                "public class Main {\n    public static void main(String[] args) {}\n}\n",
            ),
            _ => (
                format!("{}.py", name),
                "if __name__ == \"__main__\":\n    print('hi')\n",
            ),
        };
        let path = fx.src.join(file);
        std::fs::write(&path, body).unwrap();
        let sub = Submission::from_path(&path, language).unwrap();
        match SecurityValidator::new(SecurityPolicy::new().unwrap()).validate(&sub) {
            ValidationOutcome::Pass(v) => v,
            ValidationOutcome::Rejected(v) => panic!("rejected: {:?}", v),
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::default().with_timeout(Duration::from_secs(60))
    }

    async fn execute(
        provider: Arc<ScriptedProvider>,
        fx: &Fixture,
        sub: &ValidatedSubmission,
    ) -> ExecutionReport {
        SandboxExecutor::new(provider, &fx.dataset)
            .execute(sub, &limits(), &SandboxPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_captures_stdout_and_tears_down() {
        let fx = fixture();
        let provider = Arc::new(ScriptedProvider::new(&fx.work).script(
            "alice",
            SubmissionScript::run(ScriptedRun::prints(LINE.repeat(10))),
        ));

        let sub = validated(&fx, "alice", LanguageVariant::Python);
        let report = execute(provider.clone(), &fx, &sub).await;

        assert_eq!(report.outcome, RunOutcome::Completed { exit_code: 0 });
        assert_eq!(report.stdout, LINE.repeat(10).as_bytes());
        assert_eq!(report.compile_duration, None);
        assert_eq!(provider.contexts_created(), 1);
        assert_eq!(provider.contexts_destroyed(), 1);
        assert!(provider.work_dirs().iter().all(|d| !d.exists()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_exact_limit() {
        let fx = fixture();
        let provider = Arc::new(
            ScriptedProvider::new(&fx.work)
                .script("sleepy", SubmissionScript::run(ScriptedRun::hangs())),
        );

        let sub = validated(&fx, "sleepy", LanguageVariant::Python);
        let report = execute(provider.clone(), &fx, &sub).await;

        assert_eq!(report.outcome.kind(), OutcomeKind::TimedOut);
        assert_eq!(report.duration, Duration::from_secs(60));
        assert_eq!(report.exit, Some(ExitKind::Signaled(9)));
        assert!(report.usage.sample_count > 0);
        assert_eq!(provider.contexts_destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_kill_is_resource_exceeded() {
        let fx = fixture();
        let provider = Arc::new(
            ScriptedProvider::new(&fx.work)
                .script("hungry", SubmissionScript::run(ScriptedRun::oom())),
        );

        let sub = validated(&fx, "hungry", LanguageVariant::Python);
        let report = execute(provider, &fx, &sub).await;

        assert!(matches!(
            report.outcome,
            RunOutcome::ResourceExceeded {
                resource: ResourceKind::Memory,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_failure_skips_run() {
        let fx = fixture();
        let provider = Arc::new(ScriptedProvider::new(&fx.work).script(
            "broken",
            SubmissionScript::run(ScriptedRun::prints(LINE)).with_compile(
                ScriptedRun::exits(1).with_stderr("Main.java:2: error: ';' expected\n"),
            ),
        ));

        let sub = validated(&fx, "broken", LanguageVariant::Java);
        let report = execute(provider.clone(), &fx, &sub).await;

        assert_eq!(
            report.outcome,
            RunOutcome::CompileFailed {
                diagnostic: "Main.java:2: error: ';' expected".into()
            }
        );
        assert_eq!(
            provider.spawned(),
            vec![("broken".to_string(), Phase::Compile)]
        );
        assert_eq!(provider.contexts_destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_deadline() {
        let fx = fixture();
        let provider = Arc::new(ScriptedProvider::new(&fx.work).script(
            "slowbuild",
            SubmissionScript::run(ScriptedRun::prints(LINE)).with_compile(ScriptedRun::hangs()),
        ));

        let sub = validated(&fx, "slowbuild", LanguageVariant::Java);
        let report = execute(provider, &fx, &sub).await;

        assert_eq!(
            report.outcome,
            RunOutcome::CompileFailed {
                diagnostic: "compilation timed out after 120s".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_still_tears_down() {
        let fx = fixture();
        let provider = Arc::new(
            ScriptedProvider::new(&fx.work)
                .script("faulty", SubmissionScript::run(ScriptedRun::panics())),
        );

        let sub = validated(&fx, "faulty", LanguageVariant::Python);
        let executor = SandboxExecutor::new(provider.clone(), &fx.dataset);
        let result = AssertUnwindSafe(executor.execute(&sub, &limits(), &SandboxPolicy::default()))
            .catch_unwind()
            .await;

        assert!(result.is_err());
        assert_eq!(provider.contexts_destroyed(), 1);
        assert!(provider.work_dirs().iter().all(|d| !d.exists()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_failure_reaps_monitor_and_context() {
        let fx = fixture();
        let provider = Arc::new(
            ScriptedProvider::new(&fx.work)
                .script("flaky", SubmissionScript::run(ScriptedRun::io_error())),
        );

        let sub = validated(&fx, "flaky", LanguageVariant::Python);
        let err = SandboxExecutor::new(provider.clone(), &fx.dataset)
            .execute(&sub, &limits(), &SandboxPolicy::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(provider.live_probes(), 0);
        assert_eq!(provider.contexts_destroyed(), 1);
        assert!(provider.work_dirs().iter().all(|d| !d.exists()));
    }
}
