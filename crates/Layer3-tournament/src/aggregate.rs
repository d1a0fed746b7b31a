//! Result Aggregator - 결과 순위와 통계
//!
//! 워커 풀이 모두 끝난 뒤 불변 결과 목록을 한 번의 reduction으로 집계한다.
//! - `Reported` 결과: 실행 시간 오름차순, 동률이면 arrival 순서
//! - 나머지: arrival 순서로 뒤에 붙는다 (순위 없음)

use arena_foundation::LanguageVariant;
use arena_sandbox::{OutcomeKind, SubmissionState};
use serde::Serialize;
use std::cmp::Ordering;

use crate::orchestrator::{IterationTiming, SubmissionResult};

/// 보고서 항목 하나
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    /// 1부터 시작, `Reported`가 아니면 없음
    pub rank: Option<usize>,
    pub participant: String,
    pub language: LanguageVariant,
    pub arrival: usize,
    pub state: SubmissionState,
    pub outcome: Option<OutcomeKind>,
    pub duration_secs: Option<f64>,
    pub compile_secs: Option<f64>,
    pub peak_memory_bytes: Option<u64>,
    pub average_cpu_percent: Option<f64>,
    pub exit_code: Option<i32>,
    pub compliance_ratio: Option<f64>,
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<IterationTiming>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub diagnostic: Option<String>,
}

impl ReportEntry {
    fn from_result(result: &SubmissionResult) -> Self {
        let report = result.report.as_ref();
        Self {
            rank: None,
            participant: result.submission.participant.clone(),
            language: result.submission.language,
            arrival: result.submission.arrival,
            state: result.state,
            outcome: report.map(|r| r.outcome.kind()),
            duration_secs: result.duration().map(|d| d.as_secs_f64()),
            compile_secs: report
                .and_then(|r| r.compile_duration)
                .map(|d| d.as_secs_f64()),
            peak_memory_bytes: report.map(|r| r.peak_memory_bytes),
            average_cpu_percent: report
                .filter(|r| r.usage.sample_count > 0)
                .map(|r| r.usage.average_cpu_percent),
            exit_code: report.and_then(|r| r.exit).and_then(|e| e.code()),
            compliance_ratio: result.compliance.as_ref().map(|c| c.ratio),
            accuracy: result
                .compliance
                .as_ref()
                .and_then(|c| c.accuracy.as_ref())
                .map(|a| a.accuracy),
            timing: result.timing.clone(),
            warnings: result
                .compliance
                .as_ref()
                .map(|c| c.warnings.clone())
                .unwrap_or_default(),
            diagnostic: result.diagnostic.clone(),
        }
    }
}

/// 최종 상태별 개수
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub reported: usize,
    pub output_invalid: usize,
    pub runtime_error: usize,
    pub resource_exceeded: usize,
    pub timed_out: usize,
    pub compile_failed: usize,
    pub rejected: usize,
}

impl OutcomeCounts {
    fn count(&mut self, state: SubmissionState) {
        match state {
            SubmissionState::Reported => self.reported += 1,
            SubmissionState::OutputInvalid => self.output_invalid += 1,
            SubmissionState::RuntimeError => self.runtime_error += 1,
            SubmissionState::ResourceExceeded => self.resource_exceeded += 1,
            SubmissionState::TimedOut => self.timed_out += 1,
            SubmissionState::CompileFailed => self.compile_failed += 1,
            SubmissionState::Rejected => self.rejected += 1,
            // 비종료 상태는 집계 대상이 아님
            _ => {}
        }
    }

    pub fn failed(&self) -> usize {
        self.output_invalid
            + self.runtime_error
            + self.resource_exceeded
            + self.timed_out
            + self.compile_failed
            + self.rejected
    }
}

/// 특정 참가자의 기록
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub participant: String,
    pub language: LanguageVariant,
    pub duration_secs: f64,
}

/// 전체 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub counts: OutcomeCounts,
    pub fastest: Option<Standing>,
    pub slowest: Option<Standing>,
    pub average_duration_secs: Option<f64>,
}

impl Statistics {
    /// 성공률 (0.0 ~ 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.counts.reported as f64 / self.total as f64
        }
    }
}

/// reduction 누산기
#[derive(Default)]
struct Accumulator {
    total: usize,
    counts: OutcomeCounts,
    fastest: Option<Standing>,
    slowest: Option<Standing>,
    duration_sum: f64,
}

impl Accumulator {
    fn push(mut self, entry: &ReportEntry) -> Self {
        self.total += 1;
        self.counts.count(entry.state);

        if entry.state == SubmissionState::Reported {
            if let Some(secs) = entry.duration_secs {
                self.duration_sum += secs;
                let standing = Standing {
                    participant: entry.participant.clone(),
                    language: entry.language,
                    duration_secs: secs,
                };
                // 동률이면 먼저 도착한 쪽이 fastest, 나중 쪽이 slowest
                if self.fastest.as_ref().map_or(true, |f| secs < f.duration_secs) {
                    self.fastest = Some(standing.clone());
                }
                if self.slowest.as_ref().map_or(true, |s| secs >= s.duration_secs) {
                    self.slowest = Some(standing);
                }
            }
        }
        self
    }

    fn finish(self) -> Statistics {
        let average = (self.counts.reported > 0)
            .then(|| self.duration_sum / self.counts.reported as f64);
        Statistics {
            total: self.total,
            counts: self.counts,
            fastest: self.fastest,
            slowest: self.slowest,
            average_duration_secs: average,
        }
    }
}

/// 결과 순위 매기기 + 통계 계산
pub fn aggregate(results: &[SubmissionResult]) -> (Vec<ReportEntry>, Statistics) {
    let mut entries: Vec<ReportEntry> = results.iter().map(ReportEntry::from_result).collect();
    entries.sort_by_key(|e| e.arrival);

    let statistics = entries
        .iter()
        .fold(Accumulator::default(), Accumulator::push)
        .finish();

    let (mut ranked, rest): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| e.state == SubmissionState::Reported);

    ranked.sort_by(|a, b| {
        let by_time = match (a.duration_secs, b.duration_secs) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time.then(a.arrival.cmp(&b.arrival))
    });
    for (i, entry) in ranked.iter_mut().enumerate() {
        entry.rank = Some(i + 1);
    }

    ranked.extend(rest);
    (ranked, statistics)
}
