//! Scripted Provider - 미리 정한 결과를 재생하는 테스트용 provider
//!
//! 참가자 이름별로 compile/run 결과를 지정한다. 컨텍스트 디렉토리는 실제로
//! 만들고 지우므로 정리 경로도 함께 검증된다.
//!
//! ```rust,ignore
//! let provider = ScriptedProvider::new(tmp.path())
//!     .script("alice", SubmissionScript::run(ScriptedRun::prints("Abha=1.0/2.0/3.0\n")))
//!     .script("bob", SubmissionScript::run(ScriptedRun::hangs()));
//! ```

use arena_foundation::{Error, ResourceLimits, Result, SandboxPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::capture::drain;
use super::context::{CommandSpec, ExecutionContext, Phase};
use super::{ExitKind, IsolationProvider, ProcessOutput, SandboxProcess};
use crate::monitor::{FixedProbe, ResourceProbe};
use crate::security::ValidatedSubmission;

const SIGKILL: i32 = 9;

/// 단계 하나의 재생 결과
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit: ExitKind,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// 종료까지 걸리는 시간
    pub delay: Duration,
    /// kill될 때까지 끝나지 않음
    pub hang: bool,
    pub memory_event: bool,
    pub peak_memory: Option<u64>,
    /// spawn 시 panic (엔진 오류 재현)
    pub panic: bool,
    /// 종료 대기가 I/O 에러로 실패
    pub wait_error: bool,
    /// spawn 시 격리 프리미티브가 사라짐 (데몬 중단 등)
    pub isolation_lost: bool,
}

impl Default for ScriptedRun {
    fn default() -> Self {
        Self {
            exit: ExitKind::Exited(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay: Duration::from_millis(10),
            hang: false,
            memory_event: false,
            peak_memory: None,
            panic: false,
            wait_error: false,
            isolation_lost: false,
        }
    }
}

impl ScriptedRun {
    /// exit 0 + stdout
    pub fn prints(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn exits(code: i32) -> Self {
        Self {
            exit: ExitKind::Exited(code),
            ..Default::default()
        }
    }

    pub fn hangs() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// 메모리 상한에 걸려 SIGKILL
    pub fn oom() -> Self {
        Self {
            exit: ExitKind::Signaled(SIGKILL),
            memory_event: true,
            ..Default::default()
        }
    }

    pub fn panics() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    /// 호스트 쪽 I/O 실패 (파이프 유실 등)
    pub fn io_error() -> Self {
        Self {
            wait_error: true,
            ..Default::default()
        }
    }

    pub fn isolation_lost() -> Self {
        Self {
            isolation_lost: true,
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_peak_memory(mut self, bytes: u64) -> Self {
        self.peak_memory = Some(bytes);
        self
    }
}

/// 참가자 한 명의 시나리오
#[derive(Debug, Clone, Default)]
pub struct SubmissionScript {
    pub compile: Option<ScriptedRun>,
    pub run: ScriptedRun,
}

impl SubmissionScript {
    pub fn run(run: ScriptedRun) -> Self {
        Self { compile: None, run }
    }

    pub fn with_compile(mut self, compile: ScriptedRun) -> Self {
        self.compile = Some(compile);
        self
    }
}

/// 재생 provider
pub struct ScriptedProvider {
    work_root: PathBuf,
    scripts: HashMap<String, SubmissionScript>,
    fallback: SubmissionScript,
    available: bool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    spawned: Mutex<Vec<(String, Phase)>>,
    work_dirs: Mutex<Vec<PathBuf>>,
    probes: Mutex<Vec<Weak<dyn ResourceProbe>>>,
    sweeps: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            scripts: HashMap::new(),
            fallback: SubmissionScript::default(),
            available: true,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
            work_dirs: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
            sweeps: AtomicUsize::new(0),
        }
    }

    pub fn script(mut self, participant: impl Into<String>, script: SubmissionScript) -> Self {
        self.scripts.insert(participant.into(), script);
        self
    }

    /// 스크립트가 없는 참가자에게 쓸 시나리오
    pub fn fallback(mut self, script: SubmissionScript) -> Self {
        self.fallback = script;
        self
    }

    /// `check`가 `IsolationUnavailable`을 반환하도록
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn contexts_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// 동시에 살아 있던 컨텍스트 최대 수
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// (참가자, 단계) spawn 기록
    pub fn spawned(&self) -> Vec<(String, Phase)> {
        self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// 만들어진 모든 컨텍스트의 작업 디렉토리
    pub fn work_dirs(&self) -> Vec<PathBuf> {
        self.work_dirs.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn sweeps(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// 아직 누군가(모니터 등)가 붙잡고 있는 프로브 수
    pub fn live_probes(&self) -> usize {
        self.probes
            .lock()
            .map(|p| p.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or_default()
    }

    fn script_for(&self, participant: &str) -> &SubmissionScript {
        self.scripts.get(participant).unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl IsolationProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::IsolationUnavailable("scripted provider disabled".into()))
        }
    }

    async fn create_context(
        &self,
        submission: &ValidatedSubmission,
        dataset: &Path,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionContext> {
        if !dataset.is_file() {
            return Err(Error::DatasetMissing(dataset.display().to_string()));
        }

        let mut ctx = ExecutionContext::prepare(&self.work_root, submission, dataset, limits, policy)?;
        ctx.provider_tag = Some(submission.submission().participant.clone());

        self.created.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        if let Ok(mut dirs) = self.work_dirs.lock() {
            dirs.push(ctx.work_dir.clone());
        }
        Ok(ctx)
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
    ) -> Result<Box<dyn SandboxProcess>> {
        let participant = ctx.provider_tag.clone().unwrap_or_default();
        let script = self.script_for(&participant);
        let run = match command.phase {
            Phase::Compile => script.compile.clone().unwrap_or_default(),
            Phase::Run => script.run.clone(),
        };

        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push((participant.clone(), command.phase));
        }

        if run.panic {
            panic!("scripted engine fault for {}", participant);
        }
        if run.isolation_lost {
            return Err(Error::IsolationUnavailable(format!(
                "scripted isolation lost while spawning for {}",
                participant
            )));
        }

        let probe: Arc<dyn ResourceProbe> =
            Arc::new(FixedProbe::new(run.peak_memory.unwrap_or(1024 * 1024), 50.0));
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(Arc::downgrade(&probe));
        }

        Ok(Box::new(ScriptedProcess {
            probe,
            max_output: ctx.limits.max_output_bytes,
            run,
            kill: CancellationToken::new(),
            exit: None,
        }))
    }

    async fn destroy(&self, mut ctx: ExecutionContext) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        ctx.wipe()
    }

    async fn sweep(&self) -> Result<()> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedProcess {
    run: ScriptedRun,
    kill: CancellationToken,
    exit: Option<ExitKind>,
    max_output: usize,
    probe: Arc<dyn ResourceProbe>,
}

#[async_trait]
impl SandboxProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn probe(&self) -> Arc<dyn ResourceProbe> {
        self.probe.clone()
    }

    async fn wait(&mut self) -> Result<ExitKind> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if self.run.wait_error {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted wait failure",
            )));
        }

        let exit = if self.run.hang {
            self.kill.cancelled().await;
            ExitKind::Signaled(SIGKILL)
        } else {
            tokio::select! {
                _ = self.kill.cancelled() => ExitKind::Signaled(SIGKILL),
                _ = tokio::time::sleep(self.run.delay) => self.run.exit,
            }
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill_group(&mut self) -> Result<()> {
        self.kill.cancel();
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<ProcessOutput> {
        let mut this = *self;
        if this.exit.is_none() {
            this.kill.cancel();
            this.wait().await?;
        }

        // 끝까지 실행되지 못한 프로세스는 출력 일부만
        let cut_short = this.exit == Some(ExitKind::Signaled(SIGKILL))
            && this.run.exit != ExitKind::Signaled(SIGKILL);
        let stdout: &[u8] = if cut_short {
            &this.run.stdout[..this.run.stdout.len() / 2]
        } else {
            &this.run.stdout
        };

        Ok(ProcessOutput {
            stdout: drain(stdout, this.max_output).await?,
            stderr: drain(&this.run.stderr[..], this.max_output).await?,
            memory_event: this.run.memory_event,
            peak_memory_bytes: this.run.peak_memory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_pending;

    #[tokio::test(start_paused = true)]
    async fn test_hanging_process_ends_on_kill() {
        let mut proc = ScriptedProcess {
            run: ScriptedRun::hangs(),
            kill: CancellationToken::new(),
            exit: None,
            max_output: 1024,
            probe: Arc::new(FixedProbe::new(1, 0.0)),
        };
        let kill = proc.kill.clone();

        let mut wait = tokio_test::task::spawn(proc.wait());
        assert_pending!(wait.poll());

        kill.cancel();
        assert!(wait.is_woken());
        match wait.poll() {
            std::task::Poll::Ready(Ok(exit)) => assert_eq!(exit, ExitKind::Signaled(SIGKILL)),
            other => panic!("unexpected poll result: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_is_bounded() {
        let mut proc = Box::new(ScriptedProcess {
            run: ScriptedRun::prints(vec![b'x'; 100]),
            kill: CancellationToken::new(),
            exit: None,
            max_output: 10,
            probe: Arc::new(FixedProbe::new(1, 0.0)),
        });
        assert_eq!(proc.wait().await.unwrap(), ExitKind::Exited(0));

        let output = proc.finish().await.unwrap();
        assert_eq!(output.stdout.bytes.len(), 10);
        assert!(output.stdout.truncated);
        assert_eq!(output.stdout.total_bytes, 100);
    }

    #[test]
    fn test_script_lookup_falls_back() {
        let provider = ScriptedProvider::new("/tmp/arena-scripted")
            .script("alice", SubmissionScript::run(ScriptedRun::exits(3)))
            .fallback(SubmissionScript::run(ScriptedRun::prints("ok")));

        assert_eq!(provider.script_for("alice").run.exit, ExitKind::Exited(3));
        assert_eq!(provider.script_for("bob").run.stdout, b"ok");
    }
}
