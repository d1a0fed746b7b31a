//! Run Config - 토너먼트 실행 설정 (`tournament.toml`)
//!
//! 파일이 없거나 파싱에 실패하면 경고 후 기본값을 사용한다.
//! 개별 값이 잘못된 경우(0 이하, NaN 등)는 해당 필드만 기본값으로 되돌린다.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::ResourceLimits;
use crate::Result;

/// 실행 설정 파일명
pub const RUN_CONFIG_FILE: &str = "tournament.toml";

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

// 상한: 넘는 값은 잘못된 설정으로 보고 기본값으로 되돌린다
const MAX_TIME_LIMIT_MINUTES: f64 = 24.0 * 60.0;
const MAX_MEMORY_LIMIT_GB: f64 = 1024.0;
const MAX_CPU_CORES: f64 = 1024.0;
const MAX_COMPILE_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const MAX_OUTPUT_KB: u64 = 1024 * 1024;
const MAX_MONITOR_INTERVAL_MS: u64 = 60_000;

/// 토너먼트 실행 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// 제출물당 실행 시간 제한 (분)
    pub time_limit_minutes: f64,
    /// 메모리 제한 (GB)
    pub memory_limit_gb: f64,
    /// 입력 데이터셋 경로
    pub data_file_path: PathBuf,
    /// CPU 코어 상한
    pub cpu_cores: f64,
    /// 프로세스 수 상한
    pub max_processes: u32,
    /// 열린 파일 수 상한
    pub max_open_files: u32,
    /// 컴파일 제한 시간 (초)
    pub compile_timeout_secs: u64,
    /// 출력 적합성 통과 기준 (0.0 ~ 1.0)
    pub output_threshold: f64,
    /// 캡처할 최대 출력 (KB)
    pub max_output_kb: u64,
    /// 동시 실행 상한 (없으면 호스트 용량으로 계산)
    pub max_concurrency: Option<usize>,
    /// 리소스 샘플링 주기 (ms)
    pub monitor_interval_ms: u64,
    /// 제출물당 반복 실행 횟수
    pub iterations: u32,
    /// 데이터셋 기준 결과와 정확도 비교
    pub verify_results: bool,
    /// 실행 컨텍스트 루트
    pub work_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            time_limit_minutes: 5.0,
            memory_limit_gb: 2.0,
            data_file_path: PathBuf::from("data/measurements.txt"),
            cpu_cores: 1.0,
            max_processes: 64,
            max_open_files: 256,
            compile_timeout_secs: 120,
            output_threshold: 0.80,
            max_output_kb: 4096,
            max_concurrency: None,
            monitor_interval_ms: 250,
            iterations: 1,
            verify_results: false,
            work_dir: None,
        }
    }
}

impl RunConfig {
    /// 파일에서 로드. 실패하지 않는다.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Run config unavailable, using defaults");
                return Self::default();
            }
        };

        match Self::parse(&content) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded run config");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed run config, using defaults");
                Self::default()
            }
        }
    }

    /// TOML 문자열 파싱 + 필드별 검증
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: RunConfig = toml::from_str(content)?;
        config.sanitize();
        Ok(config)
    }

    /// 잘못된 값을 기본값으로 교체
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if !within(self.time_limit_minutes, MAX_TIME_LIMIT_MINUTES) {
            warn!(value = self.time_limit_minutes, "Invalid time_limit_minutes, using default");
            self.time_limit_minutes = defaults.time_limit_minutes;
        }
        if !within(self.memory_limit_gb, MAX_MEMORY_LIMIT_GB) {
            warn!(value = self.memory_limit_gb, "Invalid memory_limit_gb, using default");
            self.memory_limit_gb = defaults.memory_limit_gb;
        }
        if self.data_file_path.as_os_str().is_empty() {
            warn!("Empty data_file_path, using default");
            self.data_file_path = defaults.data_file_path;
        }
        if !within(self.cpu_cores, MAX_CPU_CORES) {
            warn!(value = self.cpu_cores, "Invalid cpu_cores, using default");
            self.cpu_cores = defaults.cpu_cores;
        }
        if self.max_processes == 0 {
            warn!("Invalid max_processes, using default");
            self.max_processes = defaults.max_processes;
        }
        if self.max_open_files == 0 {
            warn!("Invalid max_open_files, using default");
            self.max_open_files = defaults.max_open_files;
        }
        if !(1..=MAX_COMPILE_TIMEOUT_SECS).contains(&self.compile_timeout_secs) {
            warn!(value = self.compile_timeout_secs, "Invalid compile_timeout_secs, using default");
            self.compile_timeout_secs = defaults.compile_timeout_secs;
        }
        if !(self.output_threshold.is_finite() && (0.0..=1.0).contains(&self.output_threshold)) {
            warn!(value = self.output_threshold, "Invalid output_threshold, using default");
            self.output_threshold = defaults.output_threshold;
        }
        if !(1..=MAX_OUTPUT_KB).contains(&self.max_output_kb) {
            warn!(value = self.max_output_kb, "Invalid max_output_kb, using default");
            self.max_output_kb = defaults.max_output_kb;
        }
        if self.max_concurrency == Some(0) {
            warn!("Invalid max_concurrency, ignoring");
            self.max_concurrency = None;
        }
        if !(1..=MAX_MONITOR_INTERVAL_MS).contains(&self.monitor_interval_ms) {
            warn!(value = self.monitor_interval_ms, "Invalid monitor_interval_ms, using default");
            self.monitor_interval_ms = defaults.monitor_interval_ms;
        }
        if self.iterations == 0 {
            warn!("Invalid iterations, using default");
            self.iterations = defaults.iterations;
        }
    }

    pub fn with_time_limit_minutes(mut self, minutes: f64) -> Self {
        self.time_limit_minutes = minutes;
        self
    }

    pub fn with_memory_limit_gb(mut self, gb: f64) -> Self {
        self.memory_limit_gb = gb;
        self
    }

    pub fn with_data_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_file_path = path.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// 변환할 수 없는 값(sanitize 이전의 builder 값 등)은 기본값
    pub fn time_limit(&self) -> Duration {
        Duration::try_from_secs_f64(self.time_limit_minutes * 60.0)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(5 * 60))
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        (self.memory_limit_gb * GB) as u64
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// 실행 컨텍스트 루트 (기본: 시스템 임시 디렉토리/arena)
    pub fn work_root(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("arena"))
    }

    /// 실행당 리소스 제한 생성 (scratch 크기는 보안 정책에서)
    pub fn limits(&self, scratch_bytes: u64) -> ResourceLimits {
        ResourceLimits {
            timeout: self.time_limit(),
            memory_bytes: self.memory_limit_bytes(),
            cpu_cores: self.cpu_cores,
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            compile_timeout: Duration::from_secs(self.compile_timeout_secs),
            scratch_bytes,
            max_output_bytes: self
                .max_output_kb
                .checked_mul(1024)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .unwrap_or(usize::MAX),
        }
    }
}

fn within(value: f64, max: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= max
}
