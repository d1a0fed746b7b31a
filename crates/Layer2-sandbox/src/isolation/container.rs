//! Container Provider - docker CLI 기반 격리
//!
//! 단계마다 컨테이너 하나를 `docker run`으로 띄운다. 컨테이너는 컨텍스트 라벨과
//! provider 인스턴스 라벨을 달고 생성된다.
//!
//! - 정상 경로: `finish`에서 OOM 여부를 inspect한 뒤 삭제 (`--rm`을 쓰면 inspect 불가)
//! - 워커가 중단된 경우: `ContainerProcess`의 Drop이 `rm -f`를 띄운다
//! - 배치 중단 시: `sweep`이 인스턴스 라벨로 남은 컨테이너를 모두 삭제한다
//!
//! ```text
//! /work/src                     (ro bind)
//! /work/build                   (rw during compile, ro during run)
//! /work/scratch                 (tmpfs, size-capped)
//! /work/data/measurements.txt   (ro bind)
//! ```

use arena_foundation::{Error, LanguageVariant, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture::{drain, Captured};
use super::context::{set_mode, CommandSpec, ExecutionContext, Phase, DATA_FILE};
use super::{ExitKind, IsolationProvider, ProcessOutput, SandboxProcess};
use crate::monitor::{DockerStatsProbe, ResourceProbe};
use crate::security::ValidatedSubmission;
use arena_foundation::{ResourceLimits, SandboxPolicy};

const CONTAINER_ROOT: &str = "/work";
const CONTEXT_LABEL: &str = "arena.context";
const RUN_LABEL: &str = "arena.run";
/// docker CLI 자체 오류 (컨테이너 시작 전 실패)
const DOCKER_RUN_FAILED: i32 = 125;

/// docker 기반 격리 provider
pub struct ContainerProvider {
    runtime: String,
    work_root: PathBuf,
    images: HashMap<LanguageVariant, String>,
    /// 이 provider가 만든 컨테이너 표식
    run_id: Uuid,
}

impl ContainerProvider {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime: "docker".to_string(),
            work_root: work_root.into(),
            images: HashMap::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// docker 호환 CLI (예: podman)
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// 언어별 이미지 지정
    pub fn with_image(mut self, language: LanguageVariant, image: impl Into<String>) -> Self {
        self.images.insert(language, image.into());
        self
    }

    pub fn image_for(&self, language: LanguageVariant) -> &str {
        self.images
            .get(&language)
            .map(String::as_str)
            .unwrap_or_else(|| language.default_image())
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::spawn(self.runtime.clone(), e))
    }

    /// 라벨 필터에 걸리는 컨테이너 강제 삭제. 삭제한 수를 반환한다.
    async fn remove_labelled(&self, label: &str) -> Result<usize> {
        let filter = format!("label={}", label);
        let output = self.docker(&["ps", "-aq", "--filter", &filter]).await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut args = vec!["rm", "-f"];
        args.extend(ids.iter().map(String::as_str));
        self.docker(&args).await?;
        Ok(ids.len())
    }
}

#[async_trait]
impl IsolationProvider for ContainerProvider {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn check(&self) -> Result<()> {
        let output = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| Error::IsolationUnavailable(format!("{} not found: {}", self.runtime, e)))?;

        if !output.status.success() {
            return Err(Error::IsolationUnavailable(format!(
                "{} daemon unreachable: {}",
                self.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        std::fs::create_dir_all(&self.work_root)?;
        info!(
            runtime = %self.runtime,
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Container runtime available"
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
        let dataset = std::fs::canonicalize(dataset)
            .map_err(|_| Error::DatasetMissing(dataset.display().to_string()))?;

        let mut ctx =
            ExecutionContext::prepare(&self.work_root, submission, &dataset, limits, policy)?;
        ctx.provider_tag = Some(ctx.id.0.to_string());
        Ok(ctx)
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
    ) -> Result<Box<dyn SandboxProcess>> {
        if command.argv.is_empty() {
            return Err(Error::spawn("<empty>", "empty command line"));
        }

        // 컨테이너 사용자가 build에 쓸 수 있어야 함
        if command.phase == Phase::Compile {
            set_mode(&ctx.build_dir(), 0o777)?;
        }

        let name = container_name(ctx, command.phase);
        let image = self.image_for(ctx.language);
        let args = build_run_args(ctx, command, &name, image, host_user(), self.run_id);

        let stdin = if command.stdin_dataset() {
            Stdio::from(std::fs::File::open(&ctx.dataset)?)
        } else {
            Stdio::null()
        };

        let mut child = Command::new(&self.runtime)
            .args(&args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::spawn(self.runtime.clone(), e))?;

        let max_output = ctx.limits.max_output_bytes;
        let stdout = child.stdout.take().map(|out| tokio::spawn(drain(out, max_output)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(drain(err, max_output)));

        debug!(
            context = %ctx.id,
            phase = command.phase.as_str(),
            container = %name,
            image,
            "Started container"
        );

        Ok(Box::new(ContainerProcess {
            runtime: self.runtime.clone(),
            probe: Arc::new(DockerStatsProbe::new(self.runtime.clone(), name.clone())),
            name,
            child,
            exit: None,
            stdout,
            stderr,
            removed: false,
        }))
    }

    async fn destroy(&self, mut ctx: ExecutionContext) -> Result<()> {
        if let Some(tag) = ctx.provider_tag.clone() {
            let label = format!("{}={}", CONTEXT_LABEL, tag);
            if let Err(e) = self.remove_labelled(&label).await {
                warn!(context = %ctx.id, error = %e, "Failed to remove containers");
            }
        }

        tokio::task::spawn_blocking(move || ctx.wipe())
            .await
            .map_err(|e| Error::Internal(format!("wipe task failed: {}", e)))?
    }

    async fn sweep(&self) -> Result<()> {
        let label = format!("{}={}", RUN_LABEL, self.run_id);
        let removed = self.remove_labelled(&label).await?;
        if removed > 0 {
            warn!(removed, runtime = %self.runtime, "Removed containers left by aborted executions");
        }
        Ok(())
    }
}

// ============================================================================
// docker run arguments
// ============================================================================

fn container_name(ctx: &ExecutionContext, phase: Phase) -> String {
    format!("arena-{}-{}", ctx.id.0.simple(), phase.as_str())
}

/// `docker run` 인자 (runtime 실행 파일 제외)
pub(crate) fn build_run_args(
    ctx: &ExecutionContext,
    command: &CommandSpec,
    name: &str,
    image: &str,
    user: Option<(u32, u32)>,
    run_id: Uuid,
) -> Vec<String> {
    let limits = &ctx.limits;
    let policy = &ctx.policy;
    let mut args: Vec<String> = vec!["run".into(), "--name".into(), name.into()];

    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    push("--label", format!("{}={}", RUN_LABEL, run_id));
    if let Some(tag) = &ctx.provider_tag {
        push("--label", format!("{}={}", CONTEXT_LABEL, tag));
    }

    // Network
    if !policy.allow_network {
        push("--network", "none".into());
    }

    // Capabilities
    if policy.drop_all_capabilities {
        push("--cap-drop", "ALL".into());
        for cap in &policy.keep_capabilities {
            push("--cap-add", cap.clone());
        }
    }

    // Hardening
    if policy.no_new_privileges {
        push("--security-opt", "no-new-privileges:true".into());
    }
    match (&policy.seccomp, &policy.seccomp_profile) {
        (true, Some(profile)) => push("--security-opt", format!("seccomp={}", profile.display())),
        (true, None) => {}
        (false, _) => push("--security-opt", "seccomp=unconfined".into()),
    }
    if policy.apparmor {
        let profile = policy.apparmor_profile.as_deref().unwrap_or("docker-default");
        push("--security-opt", format!("apparmor={}", profile));
    }
    if let Some((uid, gid)) = user {
        push("--user", format!("{}:{}", uid, gid));
    }

    // Resources
    push("--memory", limits.memory_bytes.to_string());
    push("--memory-swap", limits.memory_bytes.to_string());
    push("--cpus", format!("{}", limits.cpu_cores));
    push("--pids-limit", limits.max_processes.to_string());
    push("--ulimit", format!("nofile={0}:{0}", limits.max_open_files));
    push("--ulimit", "core=0".into());

    // Filesystem
    let exec = if policy.allow_exec_in_scratch { "exec" } else { "noexec" };
    let scratch_mb = (limits.scratch_bytes / (1024 * 1024)).max(1);
    push(
        "--tmpfs",
        format!(
            "{}/scratch:rw,{},nosuid,mode=1777,size={}m",
            CONTAINER_ROOT, exec, scratch_mb
        ),
    );
    push(
        "-v",
        format!("{}:{}/src:ro", ctx.src_dir().display(), CONTAINER_ROOT),
    );
    let build_mode = match command.phase {
        Phase::Compile => "rw",
        Phase::Run => "ro",
    };
    push(
        "-v",
        format!(
            "{}:{}/build:{}",
            ctx.build_dir().display(),
            CONTAINER_ROOT,
            build_mode
        ),
    );
    push(
        "-v",
        format!("{}:{}/{}:ro", ctx.dataset.display(), CONTAINER_ROOT, DATA_FILE),
    );
    push("-w", CONTAINER_ROOT.into());

    // Environment
    let scratch = format!("{}/scratch", CONTAINER_ROOT);
    for (key, value) in [
        ("HOME", scratch.clone()),
        ("TMPDIR", scratch.clone()),
        ("LANG", "C.UTF-8".to_string()),
        ("ARENA_DATA_FILE", format!("{}/{}", CONTAINER_ROOT, DATA_FILE)),
        ("GOCACHE", format!("{}/go-cache", scratch)),
        ("GOPATH", format!("{}/go", scratch)),
        ("GOTOOLCHAIN", "local".to_string()),
    ] {
        push("-e", format!("{}={}", key, value));
    }

    args.push("--read-only".into());
    if command.stdin_dataset() {
        args.push("-i".into());
    }

    args.push(image.to_string());
    args.extend(command.argv.iter().cloned());
    args
}

#[cfg(unix)]
fn host_user() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid never fail
    unsafe { Some((libc::getuid(), libc::getgid())) }
}

#[cfg(not(unix))]
fn host_user() -> Option<(u32, u32)> {
    None
}

/// 컨테이너 종료 코드 128+n은 시그널 n으로 본다
fn exit_from_code(code: i32) -> ExitKind {
    match code {
        129..=192 => ExitKind::Signaled(code - 128),
        _ => ExitKind::Exited(code),
    }
}

// ============================================================================
// Running container
// ============================================================================

struct ContainerProcess {
    runtime: String,
    name: String,
    child: Child,
    exit: Option<ExitKind>,
    stdout: Option<JoinHandle<std::io::Result<Captured>>>,
    stderr: Option<JoinHandle<std::io::Result<Captured>>>,
    probe: Arc<dyn ResourceProbe>,
    /// `finish`에서 삭제까지 끝났는지
    removed: bool,
}

impl ContainerProcess {
    async fn inspect(&self) -> Option<(bool, i32)> {
        let output = Command::new(&self.runtime)
            .args([
                "inspect",
                "--format",
                "{{.State.OOMKilled}}|{{.State.ExitCode}}",
                &self.name,
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }
}

/// "true|137"
fn parse_inspect(line: &str) -> Option<(bool, i32)> {
    let (oom, code) = line.trim().split_once('|')?;
    Some((oom.trim() == "true", code.trim().parse().ok()?))
}

#[async_trait]
impl SandboxProcess for ContainerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn probe(&self) -> Arc<dyn ResourceProbe> {
        self.probe.clone()
    }

    async fn wait(&mut self) -> Result<ExitKind> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = match ExitKind::from_status(status) {
            ExitKind::Exited(code) => exit_from_code(code),
            signaled => signaled,
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill_group(&mut self) -> Result<()> {
        let result = Command::new(&self.runtime)
            .args(["kill", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        if let Err(e) = result {
            debug!(container = %self.name, error = %e, "docker kill failed");
        }
        if self.exit.is_none() {
            let _ = self.child.start_kill();
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<ProcessOutput> {
        let mut this = *self;
        let cli_exit = this.wait().await?;

        let stdout = join_capture(this.stdout.take()).await;
        let stderr = join_capture(this.stderr.take()).await;

        let inspected = this.inspect().await;
        if inspected.is_none() && cli_exit == ExitKind::Exited(DOCKER_RUN_FAILED) {
            return Err(Error::spawn(
                this.runtime.clone(),
                format!(
                    "container {} failed to start: {}",
                    this.name,
                    stderr.tail(512)
                ),
            ));
        }

        let memory_event = inspected.map(|(oom, _)| oom).unwrap_or(false);
        let remove = Command::new(&this.runtime)
            .args(["rm", "-f", &this.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match remove {
            Ok(_) => this.removed = true,
            Err(e) => warn!(container = %this.name, error = %e, "Failed to remove container"),
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            memory_event,
            peak_memory_bytes: None,
        })
    }
}

impl Drop for ContainerProcess {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // CLI 클라이언트만 죽이면 컨테이너는 계속 돈다. 분리된 `rm -f`로 정리한다.
        debug!(container = %self.name, "Removing container of dropped execution");
        let spawned = std::process::Command::new(&self.runtime)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => reap_detached(child),
            Err(e) => warn!(container = %self.name, error = %e, "Failed to remove container"),
        }
    }
}

/// 분리된 자식이 좀비로 남지 않도록 별도 스레드에서 회수
fn reap_detached(mut child: std::process::Child) {
    let spawned = std::thread::Builder::new()
        .name("arena-reaper".into())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = spawned {
        debug!(error = %e, "Reaper thread unavailable");
    }
}

async fn join_capture(handle: Option<JoinHandle<std::io::Result<Captured>>>) -> Captured {
    let Some(handle) = handle else {
        return Captured::default();
    };
    match tokio::time::timeout(Duration::from_secs(5), handle).await {
        Ok(Ok(Ok(captured))) => captured,
        _ => Captured::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityPolicy, SecurityValidator, ValidationOutcome};
    use crate::submission::Submission;

    async fn context(dir: &Path, policy: SandboxPolicy) -> ExecutionContext {
        let file = dir.join("Main.java");
        std::fs::write(
            &file,
            "public class Main {\n    public static void main(String[] args) {}\n}\n",
        )
        .unwrap();
        let dataset = dir.join("measurements.txt");
        std::fs::write(&dataset, "Abha=5.0\n").unwrap();

        let sub = Submission::from_path(&file, LanguageVariant::Java).unwrap();
        let validated = match SecurityValidator::new(SecurityPolicy::new().unwrap()).validate(&sub) {
            ValidationOutcome::Pass(v) => v,
            ValidationOutcome::Rejected(v) => panic!("rejected: {:?}", v),
        };

        ContainerProvider::new(dir.join("work"))
            .create_context(&validated, &dataset, &ResourceLimits::default(), &policy)
            .await
            .unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_run_args_lock_down_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), SandboxPolicy::default().keep_capability("CAP_SETUID")).await;
        let run = CommandSpec::run(ctx.run_command());
        let args = build_run_args(
            &ctx,
            &run,
            "arena-x-run",
            "eclipse-temurin:21",
            Some((1000, 1000)),
            Uuid::nil(),
        );

        assert_eq!(args[0], "run");
        assert_eq!(value_after(&args, "--network"), ["none"]);
        assert_eq!(value_after(&args, "--cap-drop"), ["ALL"]);
        assert_eq!(value_after(&args, "--cap-add"), ["CAP_SETUID"]);
        assert!(value_after(&args, "--security-opt").contains(&"no-new-privileges:true"));
        assert_eq!(value_after(&args, "--user"), ["1000:1000"]);
        assert_eq!(value_after(&args, "--pids-limit"), ["64"]);
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"-i".to_string()));

        let tmpfs = value_after(&args, "--tmpfs");
        assert!(tmpfs[0].contains("noexec"));
        assert!(tmpfs[0].ends_with("size=64m"));

        let mounts = value_after(&args, "-v");
        assert!(mounts.iter().any(|m| m.ends_with("/work/build:ro")));
        assert!(mounts.iter().any(|m| m.ends_with("/work/data/measurements.txt:ro")));

        // image, then the command line
        let image_at = args.iter().position(|a| a == "eclipse-temurin:21").unwrap();
        assert_eq!(args[image_at + 1], "java");
    }

    #[tokio::test]
    async fn test_compile_args_allow_build_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = SandboxPolicy::default().with_network(true);
        policy.seccomp = false;
        let ctx = context(dir.path(), policy).await;
        let compile = CommandSpec::compile(ctx.compile_command().unwrap());
        let args = build_run_args(
            &ctx,
            &compile,
            "arena-x-compile",
            "eclipse-temurin:21",
            None,
            Uuid::nil(),
        );

        assert!(value_after(&args, "--network").is_empty());
        assert!(value_after(&args, "-v").iter().any(|m| m.ends_with("/work/build:rw")));
        assert!(value_after(&args, "--security-opt").contains(&"seccomp=unconfined"));
        assert!(!args.contains(&"-i".to_string()));
        let labels = value_after(&args, "--label");
        assert_eq!(labels[0], format!("arena.run={}", Uuid::nil()));
        assert!(labels[1].starts_with("arena.context="));
    }

    #[test]
    fn test_exit_and_inspect_parsing() {
        assert_eq!(exit_from_code(0), ExitKind::Exited(0));
        assert_eq!(exit_from_code(137), ExitKind::Signaled(9));
        assert_eq!(exit_from_code(1), ExitKind::Exited(1));
        assert_eq!(parse_inspect("true|137\n"), Some((true, 137)));
        assert_eq!(parse_inspect("false|0"), Some((false, 0)));
        assert_eq!(parse_inspect("garbage"), None);
    }

    #[test]
    fn test_image_override() {
        let provider = ContainerProvider::new("/tmp/arena")
            .with_image(LanguageVariant::Python, "pypy:3.10");
        assert_eq!(provider.image_for(LanguageVariant::Python), "pypy:3.10");
        assert_eq!(provider.image_for(LanguageVariant::Go), "golang:1.22");
    }

    /// 호출 인자를 기록하는 가짜 런타임. `ps`에는 `ps_output`을 출력한다.
    #[cfg(unix)]
    fn fake_runtime(dir: &Path, ps_output: &str) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("runtime.log");
        let runtime = dir.join("fake-docker");
        std::fs::write(
            &runtime,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\nif [ \"$1\" = ps ]; then printf '{}'; fi\n",
                log.display(),
                ps_output
            ),
        )
        .unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
        (runtime, log)
    }

    #[cfg(unix)]
    async fn wait_for_log(log: &Path, needle: &str) -> String {
        for _ in 0..50 {
            if let Ok(calls) = std::fs::read_to_string(log) {
                if calls.contains(needle) {
                    return calls;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("runtime was never called with '{}'", needle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_process_removes_its_container() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, log) = fake_runtime(dir.path(), "");

        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let process = ContainerProcess {
            runtime: runtime.display().to_string(),
            name: "arena-dropped-run".into(),
            child,
            exit: None,
            stdout: None,
            stderr: None,
            probe: Arc::new(crate::monitor::FixedProbe::new(1, 0.0)),
            removed: false,
        };
        drop(process);

        wait_for_log(&log, "rm -f arena-dropped-run").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sweep_removes_only_this_providers_containers() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, log) = fake_runtime(dir.path(), "c0ffee\\nbeef\\n");
        let provider = ContainerProvider::new(dir.path().join("work"))
            .with_runtime(runtime.display().to_string());

        provider.sweep().await.unwrap();

        let calls = wait_for_log(&log, "rm -f").await;
        assert!(calls.contains(&format!("ps -aq --filter label=arena.run={}", provider.run_id)));
        assert!(calls.contains("rm -f c0ffee beef"));
    }
}
