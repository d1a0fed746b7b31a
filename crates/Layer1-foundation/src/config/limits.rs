//! Resource Limits - 실행 단위 리소스 상한
//!
//! 실행 컨텍스트 하나에 적용되는 하드 제한. 실행 설정(`RunConfig`)과
//! 보안 정책의 scratch 크기로부터 만들어진다.

use serde::Serialize;
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// 실행당 리소스 제한
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    /// Run 단계 wall-clock 제한
    #[serde(serialize_with = "as_secs")]
    pub timeout: Duration,
    /// 메모리 상한 (bytes)
    pub memory_bytes: u64,
    /// CPU 코어 상한 (fractional)
    pub cpu_cores: f64,
    /// 프로세스 수 상한
    pub max_processes: u32,
    /// 열린 파일 수 상한
    pub max_open_files: u32,
    /// Compile 단계 제한
    #[serde(serialize_with = "as_secs")]
    pub compile_timeout: Duration,
    /// scratch 영역 크기 (bytes)
    pub scratch_bytes: u64,
    /// stdout/stderr 캡처 상한 (bytes, 스트림별)
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            memory_bytes: 2 * GB,
            cpu_cores: 1.0,
            max_processes: 64,
            max_open_files: 256,
            compile_timeout: Duration::from_secs(120),
            scratch_bytes: 64 * MB,
            max_output_bytes: 4 * MB as usize,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_cpu_cores(mut self, cores: f64) -> Self {
        self.cpu_cores = cores;
        self
    }

    pub fn with_max_processes(mut self, max: u32) -> Self {
        self.max_processes = max;
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn with_scratch_bytes(mut self, bytes: u64) -> Self {
        self.scratch_bytes = bytes;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// 메모리 상한 (MiB)
    pub fn memory_mb(&self) -> u64 {
        (self.memory_bytes / MB).max(1)
    }

    /// cgroup `cpu.max` 값 ("quota period")
    pub fn cpu_max(&self) -> String {
        const PERIOD: u64 = 100_000;
        let quota = ((self.cpu_cores * PERIOD as f64) as u64).max(1_000);
        format!("{} {}", quota, PERIOD)
    }

    /// 사람이 읽을 수 있는 요약
    pub fn describe(&self) -> String {
        format!(
            "timeout {}s, memory {}, cpus {:.2}, pids {}, files {}",
            self.timeout.as_secs(),
            format_bytes(self.memory_bytes),
            self.cpu_cores,
            self.max_processes,
            self.max_open_files
        )
    }
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// 바이트를 사람이 읽을 수 있는 형식으로
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 메모리 문자열 파싱 (예: "512m", "2g", "1.5GB")
pub fn parse_memory_string(s: &str) -> Option<u64> {
    let s = s.trim().to_lowercase();

    if s.is_empty() {
        return None;
    }

    let (num_str, unit) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), GB)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), MB)
    } else if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), KB)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1)
    } else {
        // 숫자만 있으면 바이트로 간주
        (s.as_str(), 1)
    };

    let n = num_str.trim().parse::<f64>().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some((n * unit as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(2 * GB), "2.00 GB");
    }

    #[test]
    fn test_parse_memory_string() {
        assert_eq!(parse_memory_string("512m"), Some(512 * MB));
        assert_eq!(parse_memory_string("2g"), Some(2 * GB));
        assert_eq!(parse_memory_string("1.5GB"), Some(1536 * MB));
        assert_eq!(parse_memory_string("4096"), Some(4096));
        assert_eq!(parse_memory_string(""), None);
        assert_eq!(parse_memory_string("-1g"), None);
        assert_eq!(parse_memory_string("lots"), None);
    }

    #[test]
    fn test_cpu_max() {
        let limits = ResourceLimits::default().with_cpu_cores(1.5);
        assert_eq!(limits.cpu_max(), "150000 100000");
        let tiny = ResourceLimits::default().with_cpu_cores(0.0);
        assert_eq!(tiny.cpu_max(), "1000 100000");
    }

    #[test]
    fn test_memory_mb_floor() {
        let limits = ResourceLimits::default().with_memory_bytes(1000);
        assert_eq!(limits.memory_mb(), 1);
    }
}
