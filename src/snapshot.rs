use std::fmt::Write as _;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

pub const PV_USED_BYTES: &str = "local_storage_pv_used_bytes";
pub const PV_CAPACITY_BYTES: &str = "local_storage_pv_capacity_bytes";
pub const DISK_CAPACITY_BYTES: &str = "local_storage_mounted_disk_capacity_bytes";
pub const DISK_USED_BYTES: &str = "local_storage_mounted_disk_used_bytes";
pub const DISK_AVAILABLE_BYTES: &str = "local_storage_mounted_disk_available_bytes";

const COLLECT_DEGRADED: &str = "local_storage_collect_degraded";
const COLLECT_TIMESTAMP: &str = "local_storage_last_collect_timestamp_seconds";

/// Metric families in output order. All gauges.
const FAMILIES: &[(&str, &str)] = &[
    (PV_USED_BYTES, "Bytes used by the local storage volume"),
    (PV_CAPACITY_BYTES, "Declared capacity of the local storage volume"),
    (DISK_CAPACITY_BYTES, "Capacity of the filesystem backing a storage path"),
    (DISK_USED_BYTES, "Bytes used on the filesystem backing a storage path"),
    (DISK_AVAILABLE_BYTES, "Bytes available on the filesystem backing a storage path"),
];

/// One fully-resolved data point. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

/// The complete output of one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub samples: Vec<MetricSample>,
    /// None until the first cycle completes; scrapes before that render an
    /// empty body.
    pub collected_at: Option<DateTime<Utc>>,
    /// Set when a cycle failed systemically and stale samples are being served.
    pub degraded: bool,
    pub node: String,
}

/// The single shared slot between the refresh task and the HTTP handlers.
/// Publishing is one atomic pointer swap; readers are lock-free and keep
/// whatever complete snapshot they loaded.
pub struct SnapshotSlot {
    inner: ArcSwap<MetricsSnapshot>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        SnapshotSlot {
            inner: ArcSwap::from_pointee(MetricsSnapshot::default()),
        }
    }

    pub fn publish(&self, snapshot: MetricsSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }

    pub fn current(&self) -> Arc<MetricsSnapshot> {
        self.inner.load_full()
    }
}

impl Default for SnapshotSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a snapshot to Prometheus text exposition format: one HELP/TYPE
/// pair per family, labels in the order the sample carries them.
pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    for (family, help) in FAMILIES {
        let mut emitted_header = false;
        for sample in snapshot.samples.iter().filter(|s| s.name == *family) {
            if !emitted_header {
                let _ = writeln!(out, "# HELP {} {}", family, help);
                let _ = writeln!(out, "# TYPE {} gauge", family);
                emitted_header = true;
            }
            let _ = writeln!(out, "{}{} {}", family, format_labels(&sample.labels), sample.value);
        }
    }

    // Exporter self-health, present once a first cycle has run.
    if let Some(at) = snapshot.collected_at {
        let node = format_labels(&[("node".to_string(), snapshot.node.clone())]);
        let _ = writeln!(out, "# HELP {} Whether the last collection cycle failed and stale samples are served", COLLECT_DEGRADED);
        let _ = writeln!(out, "# TYPE {} gauge", COLLECT_DEGRADED);
        let _ = writeln!(out, "{}{} {}", COLLECT_DEGRADED, node, u8::from(snapshot.degraded));
        let _ = writeln!(out, "# HELP {} Wall-clock completion time of the last collection cycle", COLLECT_TIMESTAMP);
        let _ = writeln!(out, "# TYPE {} gauge", COLLECT_TIMESTAMP);
        let _ = writeln!(out, "{}{} {}", COLLECT_TIMESTAMP, node, at.timestamp_millis() as f64 / 1000.0);
    }

    out
}

fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    format!("{{{}}}", body.join(","))
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
