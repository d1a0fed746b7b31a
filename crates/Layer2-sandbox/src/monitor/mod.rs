//! Resource Monitor - 실행 중 CPU/메모리/I/O 샘플링
//!
//! Run 단계와 동시에 돌며, 실행기가 Run 단계 종료 시 취소하는 것과 같은
//! `CancellationToken`으로 멈춘다. 샘플링 실패는 로깅만 하고 실행을 막지 않는다.
//!
//! ## 사용 예시
//! ```rust,ignore
//! let cancel = CancellationToken::new();
//! let monitor = ResourceMonitor::new(Duration::from_millis(250));
//! let handle = tokio::spawn(monitor.run(process.probe(), cancel.clone()));
//! // ... process exits or deadline fires ...
//! cancel.cancel();
//! let summary = handle.await?;
//! ```

mod probe;

pub use probe::{
    CgroupProbe, DockerStatsProbe, FixedProbe, ProcessGroupProbe, ResourceProbe, ResourceUsage,
};

use arena_foundation::format_bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 리소스 샘플 하나
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    /// 모니터 시작 이후 경과 시간
    pub elapsed: Duration,
    /// CPU 사용률 (멀티코어 시 100% 초과 가능)
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
}

/// 스트림 이벤트
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Sample(ResourceSample),
    Failed { elapsed: Duration, reason: String },
}

/// 샘플 요약
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub peak_memory_bytes: u64,
    pub average_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub sample_count: usize,
    pub failed_samples: usize,
}

impl UsageSummary {
    /// 샘플 기록 (피크 및 누적 평균 갱신)
    pub fn record(&mut self, sample: &ResourceSample) {
        let n = self.sample_count as f64;
        self.average_cpu_percent = (self.average_cpu_percent * n + sample.cpu_percent) / (n + 1.0);
        self.sample_count += 1;

        self.peak_memory_bytes = self.peak_memory_bytes.max(sample.memory_bytes);
        self.peak_cpu_percent = self.peak_cpu_percent.max(sample.cpu_percent);
        self.io_read_bytes = self.io_read_bytes.max(sample.io_read_bytes);
        self.io_write_bytes = self.io_write_bytes.max(sample.io_write_bytes);
    }

    pub fn record_failure(&mut self) {
        self.failed_samples += 1;
    }

    pub fn summary_report(&self) -> String {
        format!(
            "Peak Mem {}, Avg CPU {:.1}%, Peak CPU {:.1}%, Samples {} ({} failed)",
            format_bytes(self.peak_memory_bytes),
            self.average_cpu_percent,
            self.peak_cpu_percent,
            self.sample_count,
            self.failed_samples
        )
    }
}

/// 리소스 모니터
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    interval: Duration,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl ResourceMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 취소될 때까지 주기적으로 샘플링하는 스트림
    pub fn observe(
        &self,
        probe: Arc<dyn ResourceProbe>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = MonitorEvent> + Send + 'static {
        let interval = self.interval;

        async_stream::stream! {
            let start = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_cpu: Option<(Instant, Duration)> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Instant::now();
                match probe.sample().await {
                    Ok(usage) => {
                        let cpu_percent = match (usage.cpu_percent, usage.cpu_time) {
                            (Some(percent), _) => percent,
                            (None, Some(cpu)) => {
                                let percent = last_cpu
                                    .map(|(at, prev)| cpu_delta_percent(prev, cpu, now - at))
                                    .unwrap_or(0.0);
                                last_cpu = Some((now, cpu));
                                percent
                            }
                            (None, None) => 0.0,
                        };

                        yield MonitorEvent::Sample(ResourceSample {
                            elapsed: now - start,
                            cpu_percent,
                            memory_bytes: usage.memory_bytes,
                            io_read_bytes: usage.io_read_bytes,
                            io_write_bytes: usage.io_write_bytes,
                        });
                    }
                    Err(e) => {
                        debug!(probe = probe.name(), error = %e, "Resource sample failed");
                        yield MonitorEvent::Failed {
                            elapsed: now - start,
                            reason: e.to_string(),
                        };
                    }
                }
            }
        }
    }

    /// 스트림을 요약으로 축약
    pub async fn summarize<S>(stream: S) -> UsageSummary
    where
        S: Stream<Item = MonitorEvent>,
    {
        stream
            .fold(UsageSummary::default(), |mut summary, event| async move {
                match event {
                    MonitorEvent::Sample(sample) => summary.record(&sample),
                    MonitorEvent::Failed { .. } => summary.record_failure(),
                }
                summary
            })
            .await
    }

    /// observe + summarize
    pub async fn run(self, probe: Arc<dyn ResourceProbe>, cancel: CancellationToken) -> UsageSummary {
        let name = probe.name();
        let summary = Self::summarize(self.observe(probe, cancel)).await;

        if summary.sample_count == 0 && summary.failed_samples > 0 {
            warn!(
                probe = name,
                failed = summary.failed_samples,
                "No resource samples collected"
            );
        }
        summary
    }
}

fn cpu_delta_percent(prev: Duration, current: Duration, wall: Duration) -> f64 {
    let wall = wall.as_secs_f64();
    if wall <= 0.0 {
        return 0.0;
    }
    let cpu = current.saturating_sub(prev).as_secs_f64();
    cpu / wall * 100.0
}
