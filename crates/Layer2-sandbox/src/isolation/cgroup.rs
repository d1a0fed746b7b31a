//! cgroup v2 helpers
//!
//! 실행 단계마다 `<root>/arena/<context>-<phase>` 하나를 만든다.
//! OOM 판정은 `memory.events`의 `oom_kill` 카운터로 한다.

use arena_foundation::{Error, ResourceLimits, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const CONTROLLERS: &str = "+memory +pids +cpu";

/// arena 전용 부모 cgroup 준비. 실패하면 None (cgroup 없이 동작)
pub(crate) fn prepare_parent(root: &Path) -> Option<PathBuf> {
    let controllers = std::fs::read_to_string(root.join("cgroup.controllers")).ok()?;
    if !controllers.contains("memory") || !controllers.contains("pids") {
        debug!(root = %root.display(), "cgroup v2 memory/pids controllers unavailable");
        return None;
    }

    let parent = root.join("arena");
    if let Err(e) = std::fs::create_dir_all(&parent) {
        debug!(error = %e, "Cannot create arena cgroup");
        return None;
    }

    // 루트에 이미 켜져 있을 수 있으므로 실패는 무시
    let _ = std::fs::write(root.join("cgroup.subtree_control"), CONTROLLERS);
    if let Err(e) = std::fs::write(parent.join("cgroup.subtree_control"), CONTROLLERS) {
        debug!(error = %e, "Cannot enable controllers for arena cgroup");
        return None;
    }

    Some(parent)
}

/// 실행 단계 하나의 cgroup
///
/// `remove`를 거치지 못하고 버려지면(워커 중단 등) Drop에서 kill 후 제거한다.
#[derive(Debug)]
pub(crate) struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// 생성 및 제한 적용
    pub(crate) fn create(parent: &Path, name: &str, limits: &ResourceLimits) -> Result<Self> {
        let path = parent.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::Sandbox(format!("create cgroup {}: {}", path.display(), e)))?;
        let cgroup = Self { path };

        cgroup.write("memory.max", &limits.memory_bytes.to_string())?;
        cgroup.write("pids.max", &limits.max_processes.to_string())?;

        // swap 컨트롤러가 없거나 cpu 컨트롤러가 꺼져 있을 수 있음
        if let Err(e) = cgroup.write("memory.swap.max", "0") {
            debug!(error = %e, "memory.swap.max not applied");
        }
        if let Err(e) = cgroup.write("memory.oom.group", "1") {
            debug!(error = %e, "memory.oom.group not applied");
        }
        if let Err(e) = cgroup.write("cpu.max", &limits.cpu_max()) {
            warn!(error = %e, "cpu.max not applied, CPU ceiling not enforced");
        }

        Ok(cgroup)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        std::fs::write(self.path.join(file), value)
            .map_err(|e| Error::Sandbox(format!("write {}={}: {}", file, value, e)))
    }

    /// cgroup 안의 모든 프로세스 종료 (kernel 5.14+)
    pub(crate) fn kill(&self) -> bool {
        let file = self.path.join("cgroup.kill");
        file.exists() && std::fs::write(file, "1").is_ok()
    }

    /// 메모리 컨트롤러에 의한 kill 횟수
    pub(crate) fn oom_kills(&self) -> u64 {
        std::fs::read_to_string(self.path.join("memory.events"))
            .map(|content| parse_memory_events(&content))
            .unwrap_or(0)
    }

    /// 최대 메모리 (kernel 5.19+)
    pub(crate) fn peak_memory(&self) -> Option<u64> {
        std::fs::read_to_string(self.path.join("memory.peak"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// 빈 cgroup 제거. 프로세스가 빠져나갈 때까지 잠시 재시도한다.
    pub(crate) async fn remove(&self) {
        for _ in 0..20 {
            match tokio::fs::remove_dir(&self.path).await {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(_) => {
                    self.kill();
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
        warn!(path = %self.path.display(), "Failed to remove cgroup");
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        self.kill();
        if std::fs::remove_dir(&self.path).is_ok() {
            debug!(path = %self.path.display(), "Removed abandoned cgroup");
            return;
        }

        // 프로세스가 아직 빠져나가는 중이면 별도 스레드에서 재시도
        let path = self.path.clone();
        let spawned = std::thread::Builder::new()
            .name("arena-cgroup-reaper".into())
            .spawn(move || {
                for _ in 0..20 {
                    std::thread::sleep(Duration::from_millis(25));
                    match std::fs::remove_dir(&path) {
                        Ok(()) => return,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                        Err(_) => {}
                    }
                }
                warn!(path = %path.display(), "Failed to remove abandoned cgroup");
            });
        if let Err(e) = spawned {
            warn!(path = %self.path.display(), error = %e, "Cgroup reaper unavailable");
        }
    }
}

/// `memory.events`에서 oom_kill 카운터
pub(crate) fn parse_memory_events(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .filter(|(key, _)| *key == "oom_kill")
        .filter_map(|(_, value)| value.trim().parse::<u64>().ok())
        .sum()
}

/// 컨텍스트에 남은 cgroup 정리 (`<tag>-*`)
pub(crate) async fn remove_tagged(parent: &Path, tag: &str) {
    let Ok(entries) = std::fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(tag) {
            Cgroup { path: entry.path() }.remove().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_events() {
        let content = "low 0\nhigh 0\nmax 12\noom 2\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(parse_memory_events(content), 1);
        assert_eq!(parse_memory_events("oom 0\n"), 0);
    }

    #[test]
    fn test_prepare_parent_without_cgroupfs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(prepare_parent(dir.path()).is_none());
    }

    #[test]
    fn test_create_writes_limits() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ResourceLimits::default()
            .with_memory_bytes(512 * 1024 * 1024)
            .with_max_processes(32);

        let cgroup = Cgroup::create(dir.path(), "ctx-run", &limits).unwrap();
        let read = |f: &str| std::fs::read_to_string(cgroup.path().join(f)).unwrap();
        assert_eq!(read("memory.max"), "536870912");
        assert_eq!(read("pids.max"), "32");
        assert_eq!(read("cpu.max"), "100000 100000");
        assert_eq!(cgroup.oom_kills(), 0);
        assert_eq!(cgroup.peak_memory(), None);
    }

    #[test]
    fn test_abandoned_cgroup_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx-run");
        std::fs::create_dir(&path).unwrap();

        drop(Cgroup { path: path.clone() });
        assert!(!path.exists());
    }

    #[test]
    fn test_kill_without_interface_file_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx-compile");
        std::fs::create_dir(&path).unwrap();

        let cgroup = Cgroup { path: path.clone() };
        assert!(!cgroup.kill());
        assert!(!path.join("cgroup.kill").exists());
    }
}
