//! Output Validator - 출력 형식 준수율 검사
//!
//! 레코드 문법: `<key>=<min>/<mean>/<max>` (각 값은 소수점 한 자리, 음수 허용).
//! 준수율 = 문법에 맞는 줄 / 전체 줄. 마지막 개행은 줄을 추가하지 않으며
//! 빈 출력의 준수율은 0.0이다.
//!
//! `ReferenceStats`는 데이터셋에서 기대값을 계산한다. 정확도 검증은 참고용이며
//! 결과 판정에 영향을 주지 않는다.

use arena_foundation::{Error, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

/// 기본 통과 기준
pub const DEFAULT_THRESHOLD: f64 = 0.80;
/// 기대값과의 허용 오차 (min/mean/max 공통)
pub const TOLERANCE: f64 = 0.1;
/// 보고서에 싣는 경고 최대 개수
const MAX_WARNINGS: usize = 20;
/// 상식적인 온도 범위
const PLAUSIBLE_RANGE: std::ops::RangeInclusive<f64> = -100.0..=100.0;

fn record_regex() -> &'static Regex {
    static RECORD: OnceLock<Regex> = OnceLock::new();
    RECORD.get_or_init(|| {
        Regex::new(r"^([^=\n]+)=(-?\d+\.\d)/(-?\d+\.\d)/(-?\d+\.\d)$")
            .expect("static record pattern")
    })
}

/// 출력 레코드 한 줄
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub key: String,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl OutputRecord {
    /// 문법에 맞으면 파싱
    pub fn parse(line: &str) -> Option<Self> {
        let caps = record_regex().captures(line)?;
        Some(Self {
            key: caps[1].to_string(),
            min: caps[2].parse().ok()?,
            mean: caps[3].parse().ok()?,
            max: caps[4].parse().ok()?,
        })
    }
}

impl std::fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:.1}/{:.1}/{:.1}", self.key, self.min, self.mean, self.max)
    }
}

/// 정확도 검증 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyReport {
    /// 허용 오차 안에서 일치
    pub matched: usize,
    /// 키는 있으나 값이 다름
    pub mismatched: usize,
    /// 기대값에 있으나 출력에 없음
    pub missing: usize,
    /// 출력에 있으나 데이터셋에 없음
    pub extra: usize,
    /// matched / 기대 키 수
    pub accuracy: f64,
}

/// 준수율 보고서
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub total_lines: usize,
    pub valid_lines: usize,
    pub ratio: f64,
    pub threshold: f64,
    pub passed: bool,
    pub warnings: Vec<String>,
    pub suppressed_warnings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<AccuracyReport>,
    #[serde(skip)]
    pub records: Vec<OutputRecord>,
}

impl ComplianceReport {
    pub fn summary(&self) -> String {
        format!(
            "{}/{} valid lines ({:.1}%, threshold {:.0}%)",
            self.valid_lines,
            self.total_lines,
            self.ratio * 100.0,
            self.threshold * 100.0
        )
    }

    fn warn(&mut self, message: String) {
        if self.warnings.len() < MAX_WARNINGS {
            self.warnings.push(message);
        } else {
            self.suppressed_warnings += 1;
        }
    }
}

/// 출력 검증기
#[derive(Debug, Clone)]
pub struct OutputValidator {
    threshold: f64,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl OutputValidator {
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_THRESHOLD
        };
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 문법 준수율 계산
    pub fn validate(&self, output: &[u8]) -> ComplianceReport {
        let text = String::from_utf8_lossy(output);
        let body = text.strip_suffix('\n').unwrap_or(&text);

        let mut report = ComplianceReport {
            total_lines: 0,
            valid_lines: 0,
            ratio: 0.0,
            threshold: self.threshold,
            passed: false,
            warnings: Vec::new(),
            suppressed_warnings: 0,
            accuracy: None,
            records: Vec::new(),
        };

        if !text.is_empty() {
            for line in body.split('\n') {
                report.total_lines += 1;
                let line = line.strip_suffix('\r').unwrap_or(line);
                if let Some(record) = OutputRecord::parse(line) {
                    report.valid_lines += 1;
                    report.records.push(record);
                }
            }
        }

        if report.total_lines > 0 {
            report.ratio = report.valid_lines as f64 / report.total_lines as f64;
        }
        report.passed = report.total_lines > 0 && report.ratio >= self.threshold;

        collect_warnings(&mut report);
        report
    }

    /// 문법 검사 + 기대값 비교
    pub fn validate_against(&self, output: &[u8], reference: &ReferenceStats) -> ComplianceReport {
        let mut report = self.validate(output);
        report.accuracy = Some(reference.verify(&report.records));
        report
    }
}

fn collect_warnings(report: &mut ComplianceReport) {
    let records = std::mem::take(&mut report.records);
    let mut seen = HashSet::new();
    let mut previous: Option<&str> = None;
    let mut out_of_order = 0usize;

    for record in &records {
        if !seen.insert(record.key.as_str()) {
            report.warn(format!("duplicate key '{}'", record.key));
        }
        if !(record.min <= record.mean && record.mean <= record.max) {
            report.warn(format!(
                "'{}': expected min <= mean <= max, got {:.1}/{:.1}/{:.1}",
                record.key, record.min, record.mean, record.max
            ));
        }
        if [record.min, record.mean, record.max]
            .iter()
            .any(|v| !PLAUSIBLE_RANGE.contains(v))
        {
            report.warn(format!("'{}': temperature outside plausible range", record.key));
        }
        if let Some(prev) = previous {
            if prev > record.key.as_str() {
                out_of_order += 1;
            }
        }
        previous = Some(record.key.as_str());
    }

    if out_of_order > 0 {
        report.warn(format!(
            "keys not in alphabetical order ({} inversions)",
            out_of_order
        ));
    }
    report.records = records;
}

// ============================================================================
// Reference statistics
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }
}

/// 데이터셋에서 계산한 기대 통계
#[derive(Debug, Clone, Default)]
pub struct ReferenceStats {
    stations: BTreeMap<String, Accumulator>,
    measurements: u64,
    malformed: u64,
}

impl ReferenceStats {
    /// `station=temperature` 줄 단위 스트리밍 파싱. 잘못된 줄은 세고 건너뛴다.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut stats = Self::default();
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed = trimmed
                .split_once('=')
                .and_then(|(station, temp)| Some((station, temp.trim().parse::<f64>().ok()?)))
                .filter(|(_, temp)| temp.is_finite());

            match parsed {
                Some((station, temp)) => {
                    stats.measurements += 1;
                    match stats.stations.get_mut(station) {
                        Some(acc) => acc.add(temp),
                        None => {
                            stats.stations.insert(station.to_string(), Accumulator::new(temp));
                        }
                    }
                }
                None => stats.malformed += 1,
            }
        }

        Ok(stats)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| Error::DatasetMissing(path.display().to_string()))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn measurements(&self) -> u64 {
        self.measurements
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn get(&self, key: &str) -> Option<OutputRecord> {
        self.stations.get(key).map(|acc| to_record(key, acc))
    }

    /// 키 알파벳 순 기대 레코드
    pub fn to_records(&self) -> Vec<OutputRecord> {
        self.stations
            .iter()
            .map(|(key, acc)| to_record(key, acc))
            .collect()
    }

    /// 출력 레코드를 기대값과 비교
    pub fn verify(&self, records: &[OutputRecord]) -> AccuracyReport {
        let mut report = AccuracyReport::default();
        let mut seen = HashSet::new();

        for record in records {
            if !seen.insert(record.key.as_str()) {
                continue;
            }
            match self.get(&record.key) {
                Some(expected) if within_tolerance(record, &expected) => report.matched += 1,
                Some(_) => report.mismatched += 1,
                None => report.extra += 1,
            }
        }

        report.missing = self
            .stations
            .keys()
            .filter(|key| !seen.contains(key.as_str()))
            .count();
        if !self.stations.is_empty() {
            report.accuracy = report.matched as f64 / self.stations.len() as f64;
        }
        report
    }
}

fn to_record(key: &str, acc: &Accumulator) -> OutputRecord {
    OutputRecord {
        key: key.to_string(),
        min: acc.min,
        mean: acc.sum / acc.count as f64,
        max: acc.max,
    }
}

fn within_tolerance(actual: &OutputRecord, expected: &OutputRecord) -> bool {
    // 한 자리 반올림 오차 허용
    let close = |a: f64, b: f64| (a - b).abs() <= TOLERANCE + 1e-9;
    close(actual.min, expected.min) && close(actual.mean, expected.mean) && close(actual.max, expected.max)
}
