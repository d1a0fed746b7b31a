//! Resource probes
//!
//! - `ProcessGroupProbe`: `/proc/<pid>/{stat,io}` 합산 (프로세스 그룹 전체)
//! - `CgroupProbe`: cgroup v2 `memory.current`, `cpu.stat`, `io.stat`
//! - `DockerStatsProbe`: `docker stats --no-stream`
//! - `FixedProbe`: 고정 값 (테스트, scripted provider)

use arena_foundation::{parse_memory_string, Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// 프로브가 읽은 원시 사용량
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    /// 누적 CPU 시간 (있으면 모니터가 델타로 사용률 계산)
    pub cpu_time: Option<Duration>,
    /// 프로브가 직접 계산한 사용률
    pub cpu_percent: Option<f64>,
    pub memory_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sample(&self) -> Result<ResourceUsage>;
}

// ============================================================================
// Process group (/proc)
// ============================================================================

/// 프로세스 그룹 전체의 사용량 합산
#[derive(Debug, Clone)]
pub struct ProcessGroupProbe {
    pgid: i32,
}

impl ProcessGroupProbe {
    pub fn new(pgid: i32) -> Self {
        Self { pgid }
    }
}

#[async_trait]
impl ResourceProbe for ProcessGroupProbe {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn sample(&self) -> Result<ResourceUsage> {
        let pgid = self.pgid;
        tokio::task::spawn_blocking(move || read_process_group(Path::new("/proc"), pgid))
            .await
            .map_err(|e| Error::Internal(format!("probe task failed: {}", e)))?
    }
}

/// `/proc/<pid>/stat` 한 줄에서 (pgrp, utime+stime ticks, rss pages) 추출
///
/// comm 필드에 공백/괄호가 들어갈 수 있으므로 마지막 ')' 이후를 파싱한다.
pub(crate) fn parse_stat(line: &str) -> Option<(i32, u64, u64, char)> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] = state (3), [2] = pgrp (5), [11] = utime (14), [12] = stime (15), [21] = rss (24)
    let state = fields.first()?.chars().next()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss: u64 = fields.get(21)?.parse().ok()?;
    Some((pgrp, utime + stime, rss, state))
}

fn parse_proc_io(content: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write = v.trim().parse().unwrap_or(0);
        }
    }
    (read, write)
}

pub(crate) fn read_process_group(proc_root: &Path, pgid: i32) -> Result<ResourceUsage> {
    let ticks_per_sec = clock_ticks();
    let page_size = page_size();

    let mut usage = ResourceUsage::default();
    let mut total_ticks = 0u64;
    let mut members = 0usize;

    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };

        // 프로세스가 그 사이 종료될 수 있음
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((pgrp, ticks, rss_pages, state)) = parse_stat(&stat) else {
            continue;
        };
        if pgrp != pgid || state == 'Z' {
            continue;
        }

        members += 1;
        total_ticks += ticks;
        usage.memory_bytes += rss_pages * page_size;

        if let Ok(io) = std::fs::read_to_string(proc_root.join(pid).join("io")) {
            let (r, w) = parse_proc_io(&io);
            usage.io_read_bytes += r;
            usage.io_write_bytes += w;
        }
    }

    if members == 0 {
        return Err(Error::NotFound(format!("no live processes in group {}", pgid)));
    }

    usage.cpu_time = Some(Duration::from_secs_f64(
        total_ticks as f64 / ticks_per_sec as f64,
    ));
    Ok(usage)
}

#[cfg(unix)]
fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

#[cfg(unix)]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn clock_ticks() -> u64 {
    100
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

// ============================================================================
// cgroup v2
// ============================================================================

/// cgroup v2 디렉토리 기반 프로브
#[derive(Debug, Clone)]
pub struct CgroupProbe {
    path: PathBuf,
}

impl CgroupProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResourceProbe for CgroupProbe {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    async fn sample(&self) -> Result<ResourceUsage> {
        let memory = tokio::fs::read_to_string(self.path.join("memory.current")).await?;
        let cpu = tokio::fs::read_to_string(self.path.join("cpu.stat")).await?;
        let io = tokio::fs::read_to_string(self.path.join("io.stat"))
            .await
            .unwrap_or_default();

        let (io_read_bytes, io_write_bytes) = parse_io_stat(&io);
        Ok(ResourceUsage {
            cpu_time: parse_cpu_stat(&cpu).map(Duration::from_micros),
            cpu_percent: None,
            memory_bytes: memory.trim().parse().unwrap_or(0),
            io_read_bytes,
            io_write_bytes,
        })
    }
}

fn parse_cpu_stat(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse().ok())
}

fn parse_io_stat(content: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for field in content.split_whitespace() {
        if let Some(v) = field.strip_prefix("rbytes=") {
            read += v.parse::<u64>().unwrap_or(0);
        } else if let Some(v) = field.strip_prefix("wbytes=") {
            write += v.parse::<u64>().unwrap_or(0);
        }
    }
    (read, write)
}

// ============================================================================
// docker stats
// ============================================================================

/// `<runtime> stats` 기반 프로브 (docker, podman)
#[derive(Debug, Clone)]
pub struct DockerStatsProbe {
    runtime: String,
    container: String,
}

impl DockerStatsProbe {
    pub fn new(runtime: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            container: container.into(),
        }
    }
}

#[async_trait]
impl ResourceProbe for DockerStatsProbe {
    fn name(&self) -> &'static str {
        "docker-stats"
    }

    async fn sample(&self) -> Result<ResourceUsage> {
        let output = Command::new(&self.runtime)
            .args([
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}}|{{.MemUsage}}|{{.BlockIO}}",
                &self.container,
            ])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Sandbox(format!(
                "{} stats failed: {}",
                self.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_docker_stats(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| Error::Sandbox("unparseable docker stats output".into()))
    }
}

/// "12.50%|100MiB / 2GiB|1.2MB / 0B"
pub(crate) fn parse_docker_stats(line: &str) -> Option<ResourceUsage> {
    let mut parts = line.trim().split('|');
    let cpu = parts.next()?.trim().trim_end_matches('%').parse::<f64>().ok()?;
    let mem = parts.next()?.split('/').next()?;
    let memory_bytes = docker_size(mem)?;

    let (io_read_bytes, io_write_bytes) = parts
        .next()
        .and_then(|io| {
            let mut rw = io.split('/');
            Some((docker_size(rw.next()?)?, docker_size(rw.next()?)?))
        })
        .unwrap_or((0, 0));

    Some(ResourceUsage {
        cpu_time: None,
        cpu_percent: Some(cpu),
        memory_bytes,
        io_read_bytes,
        io_write_bytes,
    })
}

fn docker_size(s: &str) -> Option<u64> {
    parse_memory_string(&s.trim().replace("iB", "B"))
}

// ============================================================================
// Fixed
// ============================================================================

/// 항상 같은 값을 돌려주는 프로브
#[derive(Debug, Clone)]
pub struct FixedProbe {
    memory_bytes: u64,
    cpu_percent: f64,
}

impl FixedProbe {
    pub fn new(memory_bytes: u64, cpu_percent: f64) -> Self {
        Self {
            memory_bytes,
            cpu_percent,
        }
    }
}

#[async_trait]
impl ResourceProbe for FixedProbe {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn sample(&self) -> Result<ResourceUsage> {
        Ok(ResourceUsage {
            cpu_percent: Some(self.cpu_percent),
            memory_bytes: self.memory_bytes,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const STAT: &str = "4242 (python3 (x)) S 4200 4242 4242 0 -1 4194304 1200 0 0 0 150 50 0 0 20 0 1 0 12345 123456789 2560 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let (pgrp, ticks, rss, state) = parse_stat(STAT).unwrap();
        assert_eq!(pgrp, 4242);
        assert_eq!(ticks, 200);
        assert_eq!(rss, 2560);
        assert_eq!(state, 'S');
    }

    #[test]
    fn test_read_process_group_from_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        for (pid, pgrp) in [("4242", 4242), ("4243", 4242), ("999", 1)] {
            fs::create_dir_all(root.join(pid)).unwrap();
            let stat = format!(
                "{} (solution) R 1 {} {} 0 -1 4194304 1200 0 0 0 150 50 0 0 20 0 1 0 12345 123456789 2560 0",
                pid, pgrp, pgrp
            );
            fs::write(root.join(pid).join("stat"), stat).unwrap();
        }
        fs::write(
            root.join("4242/io"),
            "rchar: 1\nread_bytes: 4096\nwrite_bytes: 512\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("self")).unwrap();

        let usage = read_process_group(root, 4242).unwrap();
        assert_eq!(usage.memory_bytes, 2 * 2560 * page_size());
        assert_eq!(usage.io_read_bytes, 4096);
        assert_eq!(usage.io_write_bytes, 512);
        assert!(usage.cpu_time.is_some());

        assert!(read_process_group(root, 7).is_err());
    }

    #[test]
    fn test_parse_cgroup_files() {
        assert_eq!(
            parse_cpu_stat("usage_usec 1500000\nuser_usec 1000000\n"),
            Some(1_500_000)
        );
        assert_eq!(
            parse_io_stat("8:0 rbytes=100 wbytes=20 rios=1\n8:16 rbytes=5 wbytes=0\n"),
            (105, 20)
        );
    }

    #[test]
    fn test_parse_docker_stats() {
        let usage = parse_docker_stats("12.50%|100MiB / 2GiB|1.5MB / 0B\n").unwrap();
        assert_eq!(usage.cpu_percent, Some(12.5));
        assert_eq!(usage.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(usage.io_read_bytes, (1.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(usage.io_write_bytes, 0);
        assert!(parse_docker_stats("--").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stats_probe_uses_configured_runtime() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let runtime = dir.path().join("podman");
        fs::write(
            &runtime,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\necho '12.50%|100MiB / 2GiB|1.2MB / 0B'\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&runtime, fs::Permissions::from_mode(0o755)).unwrap();

        let probe = DockerStatsProbe::new(runtime.display().to_string(), "arena-abc-run");
        let usage = probe.sample().await.unwrap();

        assert_eq!(usage.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(usage.cpu_percent, Some(12.5));
        let calls = fs::read_to_string(&log).unwrap();
        assert!(calls.starts_with("stats --no-stream"));
        assert!(calls.trim_end().ends_with("arena-abc-run"));
    }
}
