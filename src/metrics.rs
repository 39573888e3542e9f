use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Number of recent latencies kept for percentile estimates.
pub const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct MetricsState {
    request_count: u64,
    error_count: u64,
    latencies: VecDeque<f64>,
}

/// Request counters plus a sliding window of latencies, shared by every
/// request handler.
#[derive(Debug)]
pub struct MetricsRecorder {
    started: Instant,
    state: Mutex<MetricsState>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub requests_per_second: f64,
    pub latency_ms: LatencyPercentiles,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn record(&self, latency_ms: f64, is_error: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.request_count += 1;
        if is_error {
            state.error_count += 1;
        }
        state.latencies.push_back(latency_ms);
        while state.latencies.len() > LATENCY_WINDOW {
            state.latencies.pop_front();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let (request_count, error_count, mut latencies) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                state.request_count,
                state.error_count,
                state.latencies.iter().copied().collect::<Vec<_>>(),
            )
        };
        let uptime = self.started.elapsed().as_secs_f64();

        MetricsSummary {
            uptime_seconds: uptime,
            total_requests: request_count,
            error_count,
            error_rate: ratio(error_count as f64, request_count as f64),
            requests_per_second: ratio(request_count as f64, uptime),
            latency_ms: percentiles(&mut latencies),
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Rank-based estimate: sorts the samples and takes index `floor(n * p)`.
pub fn percentiles(latencies: &mut [f64]) -> LatencyPercentiles {
    if latencies.is_empty() {
        return LatencyPercentiles::default();
    }
    latencies.sort_by(f64::total_cmp);

    let at = |p: f64| {
        let idx = ((latencies.len() as f64 * p).floor() as usize).min(latencies.len() - 1);
        Some(latencies[idx])
    };
    LatencyPercentiles {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_floor_rank() {
        let recorder = MetricsRecorder::new();
        // Recorded out of order to exercise the sort.
        for i in (1..=100).rev() {
            recorder.record(f64::from(i * 10), false);
        }

        let latency = recorder.summary().latency_ms;
        assert_eq!(latency.p50, Some(510.0));
        assert_eq!(latency.p95, Some(960.0));
        assert_eq!(latency.p99, Some(1000.0));
    }

    #[test]
    fn single_sample_fills_every_percentile() {
        let stats = percentiles(&mut [42.0]);
        assert_eq!(stats.p50, Some(42.0));
        assert_eq!(stats.p99, Some(42.0));
    }

    #[test]
    fn window_evicts_oldest_latencies() {
        let recorder = MetricsRecorder::new();
        for i in 0..(LATENCY_WINDOW + 500) {
            recorder.record(i as f64, false);
        }

        let summary = recorder.summary();
        assert_eq!(summary.total_requests, (LATENCY_WINDOW + 500) as u64);
        // Only 500..1500 remain, so the median is 500 + 500.
        assert_eq!(summary.latency_ms.p50, Some(1000.0));
    }

    #[test]
    fn empty_recorder_has_no_rates_or_percentiles() {
        let summary = MetricsRecorder::new().summary();
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.latency_ms, LatencyPercentiles::default());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["latency_ms"], serde_json::json!({}));
    }

    #[test]
    fn errors_count_towards_rate() {
        let recorder = MetricsRecorder::new();
        recorder.record(5.0, true);
        recorder.record(7.0, false);
        recorder.record(9.0, false);
        recorder.record(11.0, true);

        let summary = recorder.summary();
        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.error_rate, 0.5);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let recorder = std::sync::Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        recorder.record(1.0, false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.summary().total_requests, 800);
    }
}
