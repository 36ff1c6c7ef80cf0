//! Metrics collection and Prometheus exporter for mirror arrays
//!
//! # Prometheus Metrics
//!
//! ## Array Metrics
//! - `mirrorio_array_read_ops_total` / `mirrorio_array_write_ops_total`
//! - `mirrorio_array_read_bytes_total` / `mirrorio_array_write_bytes_total`
//! - `mirrorio_array_read_latency_seconds` / `mirrorio_array_write_latency_seconds`
//! - `mirrorio_array_read_retries_total` - Reads redirected after a replica error
//! - `mirrorio_array_corrected_sectors_total` - Sectors rewritten after a read error
//! - `mirrorio_array_unrecoverable_reads_total` - Reads failed on every replica
//! - `mirrorio_array_degraded_writes_total` - Writes that missed a replica
//! - `mirrorio_array_behind_writes_total` / `mirrorio_array_early_acks_total`
//! - `mirrorio_array_ordered_retries_total` - Writes resubmitted without ordering
//! - `mirrorio_array_replicas_failed_total`
//! - `mirrorio_array_resync_sectors_total` / `mirrorio_array_resync_skipped_sectors_total`
//! - `mirrorio_array_resync_mismatch_sectors_total`
//!
//! ## Replica Metrics
//! - `mirrorio_replica_state` - 0=faulty, 1=rebuilding, 2=in sync
//! - `mirrorio_replica_corrected_errors_total`

use crate::array::ArrayStatus;

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram buckets; bucket `i` counts samples below `16us << i` and the
/// last one everything slower
const LATENCY_BUCKETS: usize = 20;

/// Lock-free latency histogram with power-of-two bucket bounds
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let idx = (u64::BITS - (latency_us >> 4).leading_zeros()) as usize;
        self.buckets[idx.min(LATENCY_BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all samples in microseconds
    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Cumulative counts per upper bound in microseconds; `None` is +Inf
    pub fn cumulative_buckets(&self) -> Vec<(Option<u64>, u64)> {
        let mut cumulative = 0;
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| {
                cumulative += bucket.load(Ordering::Relaxed);
                let bound = (i + 1 < LATENCY_BUCKETS).then(|| 16u64 << i);
                (bound, cumulative)
            })
            .collect()
    }
}

/// Per-array counters, updated lock-free from the I/O paths
#[derive(Debug, Default)]
pub struct ArrayMetrics {
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) read_bytes: AtomicU64,
    pub(crate) write_bytes: AtomicU64,
    pub(crate) read_retries: AtomicU64,
    pub(crate) corrected_sectors: AtomicU64,
    pub(crate) unrecoverable_reads: AtomicU64,
    pub(crate) degraded_writes: AtomicU64,
    pub(crate) behind_writes: AtomicU64,
    pub(crate) early_acks: AtomicU64,
    pub(crate) ordered_retries: AtomicU64,
    pub(crate) replicas_failed: AtomicU64,
    pub(crate) resync_sectors: AtomicU64,
    pub(crate) resync_skipped: AtomicU64,
    pub(crate) mismatch_sectors: AtomicU64,
    pub(crate) read_latency: LatencyHistogram,
    pub(crate) write_latency: LatencyHistogram,
}

impl ArrayMetrics {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            reads: load(&self.reads),
            writes: load(&self.writes),
            read_bytes: load(&self.read_bytes),
            write_bytes: load(&self.write_bytes),
            read_retries: load(&self.read_retries),
            corrected_sectors: load(&self.corrected_sectors),
            unrecoverable_reads: load(&self.unrecoverable_reads),
            degraded_writes: load(&self.degraded_writes),
            behind_writes: load(&self.behind_writes),
            early_acks: load(&self.early_acks),
            ordered_retries: load(&self.ordered_retries),
            replicas_failed: load(&self.replicas_failed),
            resync_sectors: load(&self.resync_sectors),
            resync_skipped: load(&self.resync_skipped),
            mismatch_sectors: load(&self.mismatch_sectors),
        }
    }
}

/// Point-in-time copy of the array counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_retries: u64,
    pub corrected_sectors: u64,
    pub unrecoverable_reads: u64,
    pub degraded_writes: u64,
    pub behind_writes: u64,
    pub early_acks: u64,
    pub ordered_retries: u64,
    pub replicas_failed: u64,
    pub resync_sectors: u64,
    pub resync_skipped: u64,
    pub mismatch_sectors: u64,
}

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "mirrorio")
    prefix: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export one array's metrics in Prometheus text format
    pub fn export(&self, metrics: &ArrayMetrics, status: &ArrayStatus) -> String {
        let mut output = String::with_capacity(8 * 1024);
        let snapshot = metrics.snapshot();
        let labels = [("array", status.name.as_str())];

        let counters: [(&str, &str, u64); 15] = [
            ("array_read_ops_total", "Total client reads", snapshot.reads),
            ("array_write_ops_total", "Total client writes", snapshot.writes),
            ("array_read_bytes_total", "Total bytes read", snapshot.read_bytes),
            ("array_write_bytes_total", "Total bytes written", snapshot.write_bytes),
            (
                "array_read_retries_total",
                "Reads redirected after a replica error",
                snapshot.read_retries,
            ),
            (
                "array_corrected_sectors_total",
                "Sectors rewritten after a read error",
                snapshot.corrected_sectors,
            ),
            (
                "array_unrecoverable_reads_total",
                "Reads that failed on every replica",
                snapshot.unrecoverable_reads,
            ),
            (
                "array_degraded_writes_total",
                "Writes that did not reach every replica",
                snapshot.degraded_writes,
            ),
            (
                "array_behind_writes_total",
                "Writes issued with write-behind to write-mostly replicas",
                snapshot.behind_writes,
            ),
            (
                "array_early_acks_total",
                "Writes acknowledged before write-behind completed",
                snapshot.early_acks,
            ),
            (
                "array_ordered_retries_total",
                "Writes resubmitted without the ordering primitive",
                snapshot.ordered_retries,
            ),
            (
                "array_replicas_failed_total",
                "Replicas marked faulty",
                snapshot.replicas_failed,
            ),
            (
                "array_resync_sectors_total",
                "Sectors processed by resync",
                snapshot.resync_sectors,
            ),
            (
                "array_resync_skipped_sectors_total",
                "Sectors skipped by resync as already in sync",
                snapshot.resync_skipped,
            ),
            (
                "array_resync_mismatch_sectors_total",
                "Sectors found to differ between replicas",
                snapshot.mismatch_sectors,
            ),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            self.write_metric_with_labels(&mut output, name, value as f64, &labels);
        }

        self.write_help(&mut output, "array_size_bytes", "Usable array size in bytes");
        self.write_type(&mut output, "array_size_bytes", "gauge");
        self.write_metric_with_labels(
            &mut output,
            "array_size_bytes",
            mirrorio_common::sectors_to_bytes(status.size_sectors) as f64,
            &labels,
        );

        self.write_help(&mut output, "array_working_replicas", "In-sync replicas");
        self.write_type(&mut output, "array_working_replicas", "gauge");
        self.write_metric_with_labels(
            &mut output,
            "array_working_replicas",
            status.working as f64,
            &labels,
        );

        if !status.replicas.is_empty() {
            self.write_help(
                &mut output,
                "replica_state",
                "Replica state (0=faulty, 1=rebuilding, 2=in sync)",
            );
            self.write_type(&mut output, "replica_state", "gauge");
            for replica in &status.replicas {
                let slot = replica.slot.to_string();
                self.write_metric_with_labels(
                    &mut output,
                    "replica_state",
                    replica.state.as_value(),
                    &[
                        ("array", status.name.as_str()),
                        ("slot", &slot),
                        ("name", &replica.name),
                    ],
                );
            }

            self.write_help(
                &mut output,
                "replica_corrected_errors_total",
                "Sectors corrected on this replica",
            );
            self.write_type(&mut output, "replica_corrected_errors_total", "counter");
            for replica in &status.replicas {
                let slot = replica.slot.to_string();
                self.write_metric_with_labels(
                    &mut output,
                    "replica_corrected_errors_total",
                    replica.corrected_errors as f64,
                    &[("array", status.name.as_str()), ("slot", &slot)],
                );
            }
        }

        for (name, help, histogram) in [
            (
                "array_read_latency_seconds",
                "Client read latency",
                &metrics.read_latency,
            ),
            (
                "array_write_latency_seconds",
                "Client write latency",
                &metrics.write_latency,
            ),
        ] {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "histogram");
            export_histogram_prometheus(&mut output, &self.prefix, name, &labels, histogram);
        }

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            format_labels(labels),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("mirrorio")
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Export latency histogram in Prometheus histogram format
pub fn export_histogram_prometheus(
    output: &mut String,
    prefix: &str,
    name: &str,
    labels: &[(&str, &str)],
    histogram: &LatencyHistogram,
) {
    let base_labels = format_labels(labels);
    let sep = if base_labels.is_empty() { "" } else { "," };

    for (bound_us, cumulative) in histogram.cumulative_buckets() {
        let le = bound_us.map_or_else(|| "+Inf".to_string(), |us| (us as f64 / 1_000_000.0).to_string());
        let _ = writeln!(
            output,
            "{prefix}_{name}_bucket{{{base_labels}{sep}le=\"{le}\"}} {cumulative}"
        );
    }

    let sum_secs = histogram.sum_us() as f64 / 1_000_000.0;
    let _ = writeln!(output, "{prefix}_{name}_sum{{{base_labels}}} {sum_secs}");
    let _ = writeln!(
        output,
        "{prefix}_{name}_count{{{base_labels}}} {}",
        histogram.count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ReplicaState, ReplicaStatus};

    #[test]
    fn test_histogram_buckets() {
        let histogram = LatencyHistogram::default();
        histogram.record(0);
        histogram.record(15);
        histogram.record(16);
        histogram.record(3_000);
        histogram.record(u64::MAX >> 8);

        let buckets = histogram.cumulative_buckets();
        assert_eq!(buckets.len(), 20);
        assert_eq!(buckets[0], (Some(16), 2));
        assert_eq!(buckets[1], (Some(32), 3));
        assert_eq!(buckets[8], (Some(4_096), 4));
        assert_eq!(buckets[18], (Some(16 << 18), 4));
        assert_eq!(buckets[19], (None, 5));
        assert_eq!(histogram.count(), 5);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = ArrayMetrics::default();
        ArrayMetrics::inc(&metrics.reads);
        ArrayMetrics::add(&metrics.read_bytes, 4096);
        ArrayMetrics::inc(&metrics.replicas_failed);
        metrics.read_latency.record(120);

        let status = ArrayStatus {
            name: "md0".to_string(),
            raid_disks: 2,
            working: 1,
            size_sectors: 2048,
            resync: None,
            replicas: vec![ReplicaStatus {
                slot: 0,
                name: "a.img".to_string(),
                state: ReplicaState::InSync,
                write_mostly: false,
                pending: 0,
                read_errors: 0,
                corrected_errors: 8,
            }],
        };

        let output = PrometheusExporter::default().export(&metrics, &status);
        assert!(output.contains("# TYPE mirrorio_array_read_ops_total counter"));
        assert!(output.contains("mirrorio_array_read_ops_total{array=\"md0\"} 1"));
        assert!(output.contains("mirrorio_array_read_bytes_total{array=\"md0\"} 4096"));
        assert!(output.contains("mirrorio_array_size_bytes{array=\"md0\"} 1048576"));
        assert!(output.contains("mirrorio_replica_state{array=\"md0\",slot=\"0\",name=\"a.img\"} 2"));
        assert!(output.contains("mirrorio_replica_corrected_errors_total{array=\"md0\",slot=\"0\"} 8"));
        assert!(output.contains("mirrorio_array_read_latency_seconds_bucket{array=\"md0\",le=\"0.000064\"} 0"));
        assert!(output.contains("mirrorio_array_read_latency_seconds_bucket{array=\"md0\",le=\"0.000128\"} 1"));
        assert!(output.contains("mirrorio_array_read_latency_seconds_bucket{array=\"md0\",le=\"+Inf\"} 1"));
        assert!(output.contains("mirrorio_array_read_latency_seconds_count{array=\"md0\"} 1"));
    }
}
