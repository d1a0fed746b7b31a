//! Process Provider - 호스트 프로세스 기반 격리
//!
//! ## 적용 순서 (fork 이후, exec 이전)
//! 1. cgroup 가입 (`cgroup.procs`에 "0")
//! 2. `setsid()` - 새 세션/프로세스 그룹 (그룹 단위 kill)
//! 3. rlimit (NOFILE, CORE=0, FSIZE=scratch 크기, cgroup이 없으면 AS와 CPU 추가)
//! 4. `unshare(CLONE_NEWNET)` (root가 아니면 `CLONE_NEWUSER` 함께)
//! 5. capability bounding set 축소 (root일 때만)
//! 6. `PR_SET_NO_NEW_PRIVS`
//!
//! cgroup v2를 쓸 수 없으면 메모리 상한은 주소 공간/CPU rlimit과
//! RSS 감시(guard)로 대신한다. `strict_isolation` 정책이면 이 경우
//! 컨텍스트 생성을 거부한다.
//!
//! 파일시스템 뷰, PID 공간, uid는 호스트와 공유한다. 신뢰할 수 없는
//! 제출물은 [`ContainerProvider`](super::ContainerProvider)로 실행한다.

use arena_foundation::{Error, ResourceLimits, Result, SandboxPolicy};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{drain, Captured};
use super::cgroup::{self, Cgroup};
use super::context::{set_mode, CommandSpec, ExecutionContext, Phase};
use super::{ExitKind, IsolationProvider, ProcessOutput, SandboxProcess};
use crate::monitor::{CgroupProbe, ProcessGroupProbe, ResourceProbe};
use crate::security::ValidatedSubmission;

const GUARD_INTERVAL: Duration = Duration::from_millis(100);
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// 호스트에서 감지한 격리 기능
#[derive(Debug, Clone)]
struct HostCapabilities {
    cgroup_parent: Option<PathBuf>,
    net_namespace: bool,
    is_root: bool,
}

/// 프로세스 기반 격리 provider
pub struct ProcessProvider {
    work_root: PathBuf,
    cgroup_root: PathBuf,
    caps: OnceCell<HostCapabilities>,
}

impl ProcessProvider {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            caps: OnceCell::new(),
        }
    }

    /// cgroup v2 마운트 위치 변경
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    async fn caps(&self) -> &HostCapabilities {
        self.caps
            .get_or_init(|| async {
                let caps = HostCapabilities {
                    cgroup_parent: cgroup::prepare_parent(&self.cgroup_root),
                    net_namespace: probe_net_namespace().await,
                    is_root: is_root(),
                };
                info!(
                    cgroup = caps.cgroup_parent.is_some(),
                    net_namespace = caps.net_namespace,
                    root = caps.is_root,
                    "Process isolation capabilities detected"
                );
                caps
            })
            .await
    }
}

#[async_trait]
impl IsolationProvider for ProcessProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn check(&self) -> Result<()> {
        if !cfg!(unix) {
            return Err(Error::IsolationUnavailable(
                "process isolation requires a Unix host".into(),
            ));
        }
        std::fs::create_dir_all(&self.work_root)?;
        self.caps().await;
        warn!(
            work_root = %self.work_root.display(),
            "Process provider shares the host filesystem and user; run trusted submissions only"
        );
        Ok(())
    }

    async fn create_context(
        &self,
        submission: &ValidatedSubmission,
        dataset: &Path,
        limits: &ResourceLimits,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionContext> {
        let caps = self.caps().await.clone();

        if policy.strict_isolation {
            if caps.cgroup_parent.is_none() {
                return Err(Error::IsolationUnavailable(
                    "strict isolation requires a writable cgroup v2 hierarchy".into(),
                ));
            }
            if !policy.allow_network && !caps.net_namespace {
                return Err(Error::IsolationUnavailable(
                    "strict isolation requires network namespaces".into(),
                ));
            }
        }

        let dataset = std::fs::canonicalize(dataset)
            .map_err(|_| Error::DatasetMissing(dataset.display().to_string()))?;

        let mut ctx = ExecutionContext::prepare(&self.work_root, submission, &dataset, limits, policy)?;
        link_dataset(&dataset, &ctx.data_file())?;
        if caps.cgroup_parent.is_some() {
            ctx.provider_tag = Some(format!("ctx-{}", ctx.id.0.simple()));
        }
        Ok(ctx)
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
    ) -> Result<Box<dyn SandboxProcess>> {
        let caps = self.caps().await.clone();
        let program = resolve_program(ctx, command)?;
        let limits = &ctx.limits;

        // Run 단계에서는 빌드 산출물 읽기 전용
        match command.phase {
            Phase::Compile => set_mode(&ctx.build_dir(), 0o755)?,
            Phase::Run => set_mode(&ctx.build_dir(), 0o555)?,
        }

        let cgroup = match (&caps.cgroup_parent, &ctx.provider_tag) {
            (Some(parent), Some(tag)) => Some(Cgroup::create(
                parent,
                &format!("{}-{}", tag, command.phase.as_str()),
                limits,
            )?),
            _ => None,
        };

        let isolate_net = !ctx.policy.allow_network && caps.net_namespace;
        if !ctx.policy.allow_network && !caps.net_namespace {
            warn!(context = %ctx.id, "Network namespaces unavailable, network not isolated");
        }

        let stdin = if command.stdin_dataset() {
            Stdio::from(std::fs::File::open(ctx.data_file())?)
        } else {
            Stdio::null()
        };

        let mut cmd = Command::new(&program);
        cmd.args(&command.argv[1..])
            .current_dir(&ctx.work_dir)
            .env_clear()
            .envs(sandbox_env(ctx))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        {
            let budget = match command.phase {
                Phase::Compile => limits.compile_timeout,
                Phase::Run => limits.timeout,
            };
            let setup = preexec::ChildSetup::new(
                limits,
                &ctx.policy,
                budget,
                isolate_net,
                caps.is_root,
                cgroup.as_ref().map(|c| c.procs_file()),
            )?;
            // SAFETY: the closure only calls async-signal-safe libc functions and
            // touches data prepared before fork.
            unsafe {
                cmd.pre_exec(move || setup.apply());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::spawn(program.display().to_string(), e))?;

        let pid = child.id().ok_or_else(|| Error::Sandbox("child exited before pid".into()))?;
        let pgid = pid as i32;

        let max_output = limits.max_output_bytes;
        let stdout = child.stdout.take().map(|out| tokio::spawn(drain(out, max_output)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(drain(err, max_output)));

        let probe: Arc<dyn ResourceProbe> = match &cgroup {
            Some(cg) => Arc::new(CgroupProbe::new(cg.path())),
            None => Arc::new(ProcessGroupProbe::new(pgid)),
        };

        let guard_tripped = Arc::new(AtomicBool::new(false));
        let guard = if cgroup.is_none() {
            Some(spawn_memory_guard(pgid, limits.memory_bytes, guard_tripped.clone()))
        } else {
            None
        };

        debug!(
            context = %ctx.id,
            phase = command.phase.as_str(),
            pid,
            program = %program.display(),
            cgroup = cgroup.is_some(),
            "Spawned sandboxed process"
        );

        Ok(Box::new(LocalProcess {
            child,
            pgid,
            cgroup,
            exit: None,
            stdout,
            stderr,
            guard,
            guard_tripped,
            probe,
        }))
    }

    async fn destroy(&self, mut ctx: ExecutionContext) -> Result<()> {
        if let (Some(parent), Some(tag)) = (&self.caps().await.cgroup_parent, &ctx.provider_tag) {
            cgroup::remove_tagged(parent, tag).await;
        }
        let id = ctx.id;
        tokio::task::spawn_blocking(move || ctx.wipe())
            .await
            .map_err(|e| Error::Internal(format!("wipe task failed: {}", e)))??;
        debug!(context = %id, "Destroyed execution context");
        Ok(())
    }
}

// ============================================================================
// Running process
// ============================================================================

struct LocalProcess {
    child: Child,
    pgid: i32,
    cgroup: Option<Cgroup>,
    exit: Option<ExitKind>,
    stdout: Option<JoinHandle<std::io::Result<Captured>>>,
    stderr: Option<JoinHandle<std::io::Result<Captured>>>,
    guard: Option<(CancellationToken, JoinHandle<()>)>,
    guard_tripped: Arc<AtomicBool>,
    probe: Arc<dyn ResourceProbe>,
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pgid as u32)
    }

    fn probe(&self) -> Arc<dyn ResourceProbe> {
        self.probe.clone()
    }

    async fn wait(&mut self) -> Result<ExitKind> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = ExitKind::from_status(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill_group(&mut self) -> Result<()> {
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill();
        }
        kill_process_group(self.pgid);
        if self.exit.is_none() {
            let _ = self.child.start_kill();
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<ProcessOutput> {
        let mut this = *self;

        if this.exit.is_none() {
            this.kill_group().await?;
            this.wait().await?;
        }

        if let Some((token, handle)) = this.guard.take() {
            token.cancel();
            let _ = handle.await;
        }

        let stdout = join_capture(this.stdout.take(), "stdout").await;
        let stderr = join_capture(this.stderr.take(), "stderr").await;

        let (memory_event, peak_memory_bytes) = match &this.cgroup {
            Some(cg) => (cg.oom_kills() > 0, cg.peak_memory()),
            None => (this.guard_tripped.load(Ordering::SeqCst), None),
        };

        if let Some(cg) = this.cgroup.take() {
            cg.remove().await;
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            memory_event,
            peak_memory_bytes,
        })
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            kill_process_group(self.pgid);
        }
        if let Some((token, _)) = &self.guard {
            token.cancel();
        }
    }
}

async fn join_capture(
    handle: Option<JoinHandle<std::io::Result<Captured>>>,
    stream: &'static str,
) -> Captured {
    let Some(mut handle) = handle else {
        return Captured::default();
    };

    match tokio::time::timeout(CAPTURE_GRACE, &mut handle).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(stream, error = %e, "Output capture failed");
            Captured::default()
        }
        Ok(Err(e)) => {
            warn!(stream, error = %e, "Output capture task failed");
            Captured::default()
        }
        Err(_) => {
            warn!(stream, "Output pipe still open after kill, abandoning capture");
            handle.abort();
            Captured::default()
        }
    }
}

/// cgroup이 없을 때 메모리 상한 감시
fn spawn_memory_guard(
    pgid: i32,
    limit: u64,
    tripped: Arc<AtomicBool>,
) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let cancel = token.clone();
    let probe = ProcessGroupProbe::new(pgid);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GUARD_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Ok(usage) = probe.sample().await {
                if usage.memory_bytes > limit {
                    warn!(pgid, rss = usage.memory_bytes, limit, "Memory ceiling exceeded, killing group");
                    tripped.store(true, Ordering::SeqCst);
                    kill_process_group(pgid);
                    break;
                }
            }
        }
    });

    (token, handle)
}

// ============================================================================
// Helpers
// ============================================================================

/// `./build/solution` 같은 상대 경로는 작업 디렉토리 기준 절대 경로로
fn resolve_program(ctx: &ExecutionContext, command: &CommandSpec) -> Result<PathBuf> {
    let program = command.program();
    if program.is_empty() {
        return Err(Error::spawn("<empty>", "empty command line"));
    }
    if program.contains('/') {
        Ok(ctx.work_dir.join(program.trim_start_matches("./")))
    } else {
        Ok(PathBuf::from(program))
    }
}

fn sandbox_env(ctx: &ExecutionContext) -> Vec<(String, String)> {
    let scratch = ctx.scratch_dir().display().to_string();
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".into());
    vec![
        ("PATH".into(), path),
        ("HOME".into(), scratch.clone()),
        ("TMPDIR".into(), scratch.clone()),
        ("LANG".into(), "C.UTF-8".into()),
        ("ARENA_DATA_FILE".into(), ctx.data_file().display().to_string()),
        ("GOCACHE".into(), format!("{}/go-cache", scratch)),
        ("GOPATH".into(), format!("{}/go", scratch)),
        ("GOTOOLCHAIN".into(), "local".into()),
    ]
}

#[cfg(unix)]
fn link_dataset(dataset: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(dataset, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_dataset(dataset: &Path, target: &Path) -> Result<()> {
    std::fs::copy(dataset, target)?;
    set_mode(target, 0o444)
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, error = %err, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid never fails
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// 네트워크 namespace 생성 가능 여부를 실제 프로세스로 확인
#[cfg(target_os = "linux")]
async fn probe_net_namespace() -> bool {
    let flags = if is_root() {
        libc::CLONE_NEWNET
    } else {
        libc::CLONE_NEWUSER | libc::CLONE_NEWNET
    };

    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "exit 0"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: unshare is async-signal-safe
    unsafe {
        cmd.pre_exec(move || {
            if libc::unshare(flags) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    matches!(cmd.status().await, Ok(status) if status.success())
}

#[cfg(not(target_os = "linux"))]
async fn probe_net_namespace() -> bool {
    false
}

// ============================================================================
// Pre-exec setup
// ============================================================================

#[cfg(target_os = "linux")]
mod preexec {
    use super::*;
    use std::ffi::CString;
    use std::io;

    /// 가상 주소 예약(JVM, Go 런타임)을 감안한 AS 여유 배수
    const ADDRESS_SPACE_HEADROOM: u64 = 4;

    /// soft/hard 모두 같은 값으로
    macro_rules! set_rlimit {
        ($resource:expr, $value:expr) => {{
            let limit = libc::rlimit {
                rlim_cur: $value as libc::rlim_t,
                rlim_max: $value as libc::rlim_t,
            };
            if libc::setrlimit($resource, &limit) != 0 {
                return Err(io::Error::last_os_error());
            }
        }};
    }

    /// fork 이전에 준비된 자식 설정
    pub(super) struct ChildSetup {
        cgroup_procs: Option<CString>,
        nofile: u64,
        fsize: u64,
        address_space: Option<u64>,
        cpu_secs: Option<u64>,
        unshare_flags: i32,
        drop_caps: Vec<i32>,
        no_new_privs: bool,
    }

    impl ChildSetup {
        pub(super) fn new(
            limits: &ResourceLimits,
            policy: &SandboxPolicy,
            budget: Duration,
            isolate_net: bool,
            is_root: bool,
            cgroup_procs: Option<PathBuf>,
        ) -> Result<Self> {
            let cgroup_procs = cgroup_procs
                .map(|p| CString::new(p.display().to_string()))
                .transpose()
                .map_err(|e| Error::Sandbox(format!("invalid cgroup path: {}", e)))?;

            let unshare_flags = match (isolate_net, is_root) {
                (false, _) => 0,
                (true, true) => unshare_net_flags(false),
                (true, false) => unshare_net_flags(true),
            };

            // bounding set 축소는 CAP_SETPCAP이 있어야 가능
            let drop_caps = if policy.drop_all_capabilities && is_root {
                let keep: Vec<i32> = policy
                    .keep_capabilities
                    .iter()
                    .filter_map(|name| {
                        let cap = capability_number(name);
                        if cap.is_none() {
                            warn!(capability = %name, "Unknown capability in keep list");
                        }
                        cap
                    })
                    .collect();
                (0..=CAP_LAST_CAP).filter(|c| !keep.contains(c)).collect()
            } else {
                Vec::new()
            };

            // cgroup이 있으면 memory.max/cpu.max가 맡는다
            let (address_space, cpu_secs) = if cgroup_procs.is_none() {
                (
                    Some(limits.memory_bytes.saturating_mul(ADDRESS_SPACE_HEADROOM)),
                    Some(cpu_seconds(budget, limits.cpu_cores)),
                )
            } else {
                (None, None)
            };

            Ok(Self {
                cgroup_procs,
                nofile: limits.max_open_files as u64,
                fsize: limits.scratch_bytes,
                address_space,
                cpu_secs,
                unshare_flags,
                drop_caps,
                no_new_privs: policy.no_new_privileges,
            })
        }

        /// fork 이후 자식에서 실행 (할당 금지)
        pub(super) fn apply(&self) -> io::Result<()> {
            // SAFETY: only async-signal-safe libc calls on pre-built data
            unsafe {
                if let Some(path) = &self.cgroup_procs {
                    let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
                    if fd < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    let rc = libc::write(fd, b"0".as_ptr().cast(), 1);
                    libc::close(fd);
                    if rc != 1 {
                        return Err(io::Error::last_os_error());
                    }
                }

                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }

                set_rlimit!(libc::RLIMIT_NOFILE, self.nofile);
                set_rlimit!(libc::RLIMIT_CORE, 0u64);
                set_rlimit!(libc::RLIMIT_FSIZE, self.fsize);
                if let Some(bytes) = self.address_space {
                    set_rlimit!(libc::RLIMIT_AS, bytes);
                }
                if let Some(secs) = self.cpu_secs {
                    set_rlimit!(libc::RLIMIT_CPU, secs);
                }

                if self.unshare_flags != 0 && libc::unshare(self.unshare_flags) != 0 {
                    return Err(io::Error::last_os_error());
                }

                for cap in &self.drop_caps {
                    // 커널이 모르는 번호는 EINVAL, 무시
                    libc::prctl(libc::PR_CAPBSET_DROP, *cap as libc::c_ulong, 0, 0, 0);
                }

                if self.no_new_privs
                    && libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) != 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }
    }

    /// 제한 시간 동안 `cores`개 코어를 모두 쓴 CPU 시간 (올림, 1초 여유)
    fn cpu_seconds(budget: Duration, cores: f64) -> u64 {
        let secs = (budget.as_secs_f64() * cores.max(0.0)).ceil();
        if secs.is_finite() && secs < u64::MAX as f64 {
            (secs as u64).saturating_add(1)
        } else {
            libc::RLIM_INFINITY as u64
        }
    }

    fn unshare_net_flags(with_user: bool) -> i32 {
        if with_user {
            libc::CLONE_NEWUSER | libc::CLONE_NEWNET
        } else {
            libc::CLONE_NEWNET
        }
    }

    const CAP_LAST_CAP: i32 = 40;

    const CAPABILITIES: &[(&str, i32)] = &[
        ("CAP_CHOWN", 0),
        ("CAP_DAC_OVERRIDE", 1),
        ("CAP_DAC_READ_SEARCH", 2),
        ("CAP_FOWNER", 3),
        ("CAP_FSETID", 4),
        ("CAP_KILL", 5),
        ("CAP_SETGID", 6),
        ("CAP_SETUID", 7),
        ("CAP_SETPCAP", 8),
        ("CAP_LINUX_IMMUTABLE", 9),
        ("CAP_NET_BIND_SERVICE", 10),
        ("CAP_NET_BROADCAST", 11),
        ("CAP_NET_ADMIN", 12),
        ("CAP_NET_RAW", 13),
        ("CAP_IPC_LOCK", 14),
        ("CAP_IPC_OWNER", 15),
        ("CAP_SYS_MODULE", 16),
        ("CAP_SYS_RAWIO", 17),
        ("CAP_SYS_CHROOT", 18),
        ("CAP_SYS_PTRACE", 19),
        ("CAP_SYS_PACCT", 20),
        ("CAP_SYS_ADMIN", 21),
        ("CAP_SYS_BOOT", 22),
        ("CAP_SYS_NICE", 23),
        ("CAP_SYS_RESOURCE", 24),
        ("CAP_SYS_TIME", 25),
        ("CAP_SYS_TTY_CONFIG", 26),
        ("CAP_MKNOD", 27),
        ("CAP_LEASE", 28),
        ("CAP_AUDIT_WRITE", 29),
        ("CAP_AUDIT_CONTROL", 30),
        ("CAP_SETFCAP", 31),
        ("CAP_MAC_OVERRIDE", 32),
        ("CAP_MAC_ADMIN", 33),
        ("CAP_SYSLOG", 34),
        ("CAP_WAKE_ALARM", 35),
        ("CAP_BLOCK_SUSPEND", 36),
        ("CAP_AUDIT_READ", 37),
        ("CAP_PERFMON", 38),
        ("CAP_BPF", 39),
        ("CAP_CHECKPOINT_RESTORE", 40),
    ];

    /// "CAP_SETUID" 또는 "setuid" -> 번호
    pub(super) fn capability_number(name: &str) -> Option<i32> {
        let upper = name.trim().to_uppercase();
        let full = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };
        CAPABILITIES
            .iter()
            .find(|(n, _)| *n == full)
            .map(|(_, num)| *num)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_capability_number() {
            assert_eq!(capability_number("CAP_SETUID"), Some(7));
            assert_eq!(capability_number("net_raw"), Some(13));
            assert_eq!(capability_number("CAP_NOPE"), None);
        }

        #[test]
        fn test_child_setup_keeps_requested_caps() {
            let policy = SandboxPolicy::default().keep_capability("CAP_SETUID");
            let budget = Duration::from_secs(60);
            let setup =
                ChildSetup::new(&ResourceLimits::default(), &policy, budget, false, true, None)
                    .unwrap();
            assert!(!setup.drop_caps.contains(&7));
            assert!(setup.drop_caps.contains(&21));

            let unprivileged =
                ChildSetup::new(&ResourceLimits::default(), &policy, budget, false, false, None)
                    .unwrap();
            assert!(unprivileged.drop_caps.is_empty());
        }

        #[test]
        fn test_rlimits_stand_in_for_missing_cgroup() {
            let limits = ResourceLimits {
                memory_bytes: 512 * 1024 * 1024,
                cpu_cores: 1.5,
                ..ResourceLimits::default()
            };
            let policy = SandboxPolicy::default();
            let budget = Duration::from_millis(10_100);

            let setup = ChildSetup::new(&limits, &policy, budget, false, false, None).unwrap();
            assert_eq!(setup.address_space, Some(2 * 1024 * 1024 * 1024));
            // ceil(10.1 * 1.5) + 1
            assert_eq!(setup.cpu_secs, Some(17));
            assert_eq!(setup.fsize, limits.scratch_bytes);
            assert_eq!(setup.nofile, limits.max_open_files as u64);

            let with_cgroup = ChildSetup::new(
                &limits,
                &policy,
                budget,
                false,
                false,
                Some(PathBuf::from("/sys/fs/cgroup/arena/ctx/cgroup.procs")),
            )
            .unwrap();
            assert_eq!(with_cgroup.address_space, None);
            assert_eq!(with_cgroup.cpu_secs, None);
        }

        #[test]
        fn test_cpu_seconds_rounds_up() {
            assert_eq!(cpu_seconds(Duration::from_secs(300), 1.0), 301);
            assert_eq!(cpu_seconds(Duration::from_millis(500), 0.5), 2);
            assert_eq!(cpu_seconds(Duration::ZERO, 2.0), 1);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::security::{SecurityPolicy, SecurityValidator, ValidationOutcome};
    use crate::submission::Submission;
    use arena_foundation::LanguageVariant;

    fn validated(dir: &Path) -> ValidatedSubmission {
        let file = dir.join("solo.py");
        std::fs::write(&file, "if __name__ == \"__main__\":\n    pass\n").unwrap();
        let sub = Submission::from_path(&file, LanguageVariant::Python).unwrap();
        match SecurityValidator::new(SecurityPolicy::new().unwrap()).validate(&sub) {
            ValidationOutcome::Pass(v) => v,
            ValidationOutcome::Rejected(v) => panic!("rejected: {:?}", v),
        }
    }

    fn provider(root: &Path) -> ProcessProvider {
        // fake cgroup root: no controllers, so the provider runs without cgroups
        ProcessProvider::new(root.join("work")).with_cgroup_root(root.join("no-cgroup"))
    }

    fn permissive() -> SandboxPolicy {
        SandboxPolicy::default().with_network(true)
    }

    #[tokio::test]
    async fn test_context_layout_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();

        let provider = provider(dir.path());
        provider.check().await.unwrap();

        let sub = validated(dir.path());
        let ctx = provider
            .create_context(&sub, &dataset, &ResourceLimits::default(), &permissive())
            .await
            .unwrap();

        assert!(ctx.src_dir().join("solo.py").is_file());
        assert_eq!(std::fs::read_to_string(ctx.data_file()).unwrap(), "Abha=5.0\n");
        assert_eq!(ctx.entry, "src/solo.py");

        let work_dir = ctx.work_dir.clone();
        provider.destroy(ctx).await.unwrap();
        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        let sub = validated(dir.path());

        let err = provider
            .create_context(
                &sub,
                &dir.path().join("missing.txt"),
                &ResourceLimits::default(),
                &permissive(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatasetMissing(_)));
    }

    #[tokio::test]
    async fn test_strict_isolation_without_cgroup_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();

        let provider = provider(dir.path());
        let sub = validated(dir.path());
        let err = provider
            .create_context(&sub, &dataset, &ResourceLimits::default(), &SandboxPolicy::strict())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IsolationUnavailable(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_runs_under_memory_and_cpu_rlimits() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();

        let provider = provider(dir.path());
        let sub = validated(dir.path());
        let limits = ResourceLimits {
            memory_bytes: 256 * 1024 * 1024,
            cpu_cores: 1.0,
            timeout: Duration::from_secs(30),
            ..ResourceLimits::default()
        };
        let ctx = provider
            .create_context(&sub, &dataset, &limits, &permissive())
            .await
            .unwrap();

        let mut proc = provider
            .spawn(
                &ctx,
                &CommandSpec::run(vec!["sh".into(), "-c".into(), "ulimit -v; ulimit -t".into()]),
            )
            .await
            .unwrap();
        assert_eq!(proc.wait().await.unwrap(), ExitKind::Exited(0));
        let output = proc.finish().await.unwrap();
        let text = String::from_utf8_lossy(&output.stdout.bytes).to_string();
        let lines: Vec<&str> = text.lines().collect();
        // ulimit -v 단위는 KiB
        assert_eq!(lines, vec!["1048576", "31"]);

        provider.destroy(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_reads_dataset_from_stdin_and_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();

        let provider = provider(dir.path());
        let sub = validated(dir.path());
        let ctx = provider
            .create_context(&sub, &dataset, &ResourceLimits::default(), &permissive())
            .await
            .unwrap();

        // stdin echo
        let mut proc = provider
            .spawn(&ctx, &CommandSpec::run(vec!["cat".into()]))
            .await
            .unwrap();
        assert_eq!(proc.wait().await.unwrap(), ExitKind::Exited(0));
        let output = proc.finish().await.unwrap();
        assert_eq!(output.stdout.bytes, b"Abha=5.0\n");
        assert!(!output.memory_event);

        // background child in the same group must die with the group
        let mut proc = provider
            .spawn(
                &ctx,
                &CommandSpec::run(vec!["sh".into(), "-c".into(), "sleep 30 & sleep 30".into()]),
            )
            .await
            .unwrap();
        proc.kill_group().await.unwrap();
        assert_eq!(proc.wait().await.unwrap(), ExitKind::Signaled(libc::SIGKILL));
        let output = tokio::time::timeout(Duration::from_secs(10), proc.finish())
            .await
            .expect("finish must not hang on orphaned pipes")
            .unwrap();
        assert!(output.stdout.bytes.is_empty());

        provider.destroy(ctx).await.unwrap();
    }
}
