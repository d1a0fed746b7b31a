//! Tournament Report - 배치 하나의 최종 보고서
//!
//! 결과 집계 후 한 번 생성되며 이후 변경되지 않는다 (필드 비공개, 읽기 접근자만).

use arena_foundation::{format_bytes, Result, SecurityLevel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::aggregate::{aggregate, ReportEntry, Statistics};
use crate::orchestrator::{BatchOrchestrator, SubmissionResult};

const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];

/// 실행 메타데이터
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub time_limit_secs: f64,
    pub compile_limit_secs: f64,
    pub memory_limit_bytes: u64,
    pub cpu_cores: f64,
    pub security_level: SecurityLevel,
    pub isolation_provider: String,
    pub dataset: PathBuf,
    pub pool_size: usize,
    pub iterations: u32,
}

impl RunMetadata {
    /// 오케스트레이터 설정으로부터 (종료 시각은 `finish`에서)
    pub fn start(orchestrator: &BatchOrchestrator) -> Self {
        let limits = orchestrator.limits();
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            time_limit_secs: limits.timeout.as_secs_f64(),
            compile_limit_secs: limits.compile_timeout.as_secs_f64(),
            memory_limit_bytes: limits.memory_bytes,
            cpu_cores: limits.cpu_cores,
            security_level: orchestrator.security_level(),
            isolation_provider: orchestrator.provider_name().to_string(),
            dataset: orchestrator.dataset().to_path_buf(),
            pool_size: orchestrator.pool_size(),
            iterations: orchestrator.iterations(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    /// 짧은 실행 ID (8자)
    pub fn short_id(&self) -> String {
        self.run_id.to_string()[..8].to_string()
    }
}

/// 토너먼트 보고서
#[derive(Debug, Clone, Serialize)]
pub struct TournamentReport {
    metadata: RunMetadata,
    entries: Vec<ReportEntry>,
    statistics: Statistics,
}

impl TournamentReport {
    /// 결과 목록에서 보고서 생성 (순위, 통계 계산 포함)
    pub fn build(metadata: RunMetadata, results: &[SubmissionResult]) -> Self {
        let (entries, statistics) = aggregate(results);
        Self {
            metadata,
            entries,
            statistics,
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// 순위가 매겨진 항목만
    pub fn ranked(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.rank.is_some())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON 파일로 저장 (상위 디렉토리 생성)
    pub async fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_json()?).await?;
        info!(path = %path.display(), entries = self.entries.len(), "Report written");
        Ok(())
    }

    /// 사람이 읽는 요약
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let meta = &self.metadata;
        let stats = &self.statistics;

        let _ = writeln!(out, "Arena run {} ({})", meta.short_id(), meta.isolation_provider);
        let _ = writeln!(
            out,
            "Limits: {:.0}s, {}, {} CPU, security {}",
            meta.time_limit_secs,
            format_bytes(meta.memory_limit_bytes),
            meta.cpu_cores,
            meta.security_level
        );
        let _ = writeln!(out);

        if self.ranked().next().is_none() {
            let _ = writeln!(out, "No successful submissions");
        } else {
            let _ = writeln!(out, "Ranking");
            for entry in self.ranked() {
                let rank = entry.rank.unwrap_or_default();
                let marker = MEDALS.get(rank - 1).copied().unwrap_or("  ");
                let _ = write!(
                    out,
                    "  {} {:>2}. {:<20} {:<7} {:>9}",
                    marker,
                    rank,
                    entry.participant,
                    entry.language.dir_name(),
                    format_secs(entry.duration_secs)
                );
                if let Some(timing) = &entry.timing {
                    let _ = write!(out, " ± {:.3}s", timing.std_dev_secs);
                }
                if let Some(bytes) = entry.peak_memory_bytes.filter(|b| *b > 0) {
                    let _ = write!(out, "  {}", format_bytes(bytes));
                }
                let _ = writeln!(out);
            }
        }

        let failures: Vec<_> = self.entries.iter().filter(|e| e.rank.is_none()).collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Not ranked");
            for entry in failures {
                let _ = writeln!(
                    out,
                    "  {} {:<20} {:<7} {}",
                    entry.state.symbol(),
                    entry.participant,
                    entry.language.dir_name(),
                    entry.diagnostic.as_deref().unwrap_or(entry.state.display_name())
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Total {}, reported {}, failed {} ({:.0}% success)",
            stats.total,
            stats.counts.reported,
            stats.counts.failed(),
            stats.success_rate() * 100.0
        );
        if let (Some(fastest), Some(slowest)) = (&stats.fastest, &stats.slowest) {
            let _ = writeln!(
                out,
                "Fastest {} ({:.3}s), slowest {} ({:.3}s), average {}",
                fastest.participant,
                fastest.duration_secs,
                slowest.participant,
                slowest.duration_secs,
                format_secs(stats.average_duration_secs)
            );
        }
        out
    }
}

fn format_secs(secs: Option<f64>) -> String {
    match secs {
        Some(s) => format!("{:.3}s", s),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::IterationTiming;
    use arena_foundation::LanguageVariant;
    use arena_sandbox::{Submission, SubmissionState};
    use std::time::Duration;

    fn metadata() -> RunMetadata {
        let now = Utc::now();
        RunMetadata {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            time_limit_secs: 300.0,
            compile_limit_secs: 120.0,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_cores: 1.0,
            security_level: SecurityLevel::High,
            isolation_provider: "scripted".into(),
            dataset: PathBuf::from("data/measurements.txt"),
            pool_size: 2,
            iterations: 1,
        }
    }

    fn result(name: &str, arrival: usize, state: SubmissionState, secs: Option<u64>) -> SubmissionResult {
        let submission = Submission::new(
            name,
            LanguageVariant::Go,
            PathBuf::from("/tmp").join(name),
            vec![PathBuf::from("main.go")],
        )
        .with_arrival(arrival);
        let mut result = SubmissionResult::engine_fault(submission, "exit code 1: panic");
        result.state = state;
        result.timing = secs.and_then(|s| IterationTiming::from_durations(&[Duration::from_secs(s)]));
        result
    }

    #[test]
    fn test_summary_contains_medals_and_failures() {
        let report = TournamentReport::build(
            metadata(),
            &[
                result("gopher", 0, SubmissionState::Reported, Some(12)),
                result("crab", 1, SubmissionState::Reported, Some(8)),
                result("oops", 2, SubmissionState::RuntimeError, None),
            ],
        );

        let summary = report.summary();
        assert!(summary.contains("🥇"));
        assert!(summary.contains("🥈"));
        assert!(!summary.contains("🥉"));
        assert!(summary.contains("crab"));
        assert!(summary.contains("engine fault: exit code 1: panic"));
        assert!(summary.contains("Total 3, reported 2, failed 1"));

        let first = report.ranked().next().unwrap();
        assert_eq!(first.participant, "crab");
    }

    #[test]
    fn test_json_shape() {
        let report = TournamentReport::build(
            metadata(),
            &[result("gopher", 0, SubmissionState::Reported, Some(12))],
        );

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["metadata"]["security_level"], "high");
        assert_eq!(value["metadata"]["pool_size"], 2);
        assert_eq!(value["entries"][0]["rank"], 1);
        assert_eq!(value["entries"][0]["state"], "reported");
        assert_eq!(value["statistics"]["counts"]["reported"], 1);
    }

    #[tokio::test]
    async fn test_write_json_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");

        let report = TournamentReport::build(metadata(), &[]);
        report.write_json(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"entries\": []"));
    }
}
