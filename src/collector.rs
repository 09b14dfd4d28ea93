use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use tokio::task;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discover::{discover_volumes, VolumeDirectory};
use crate::labels::assemble_labels;
use crate::resolve::{MetadataResolver, ResolveSkip};
use crate::snapshot::{
    MetricSample, MetricsSnapshot, SnapshotSlot, DISK_AVAILABLE_BYTES, DISK_CAPACITY_BYTES,
    DISK_USED_BYTES, PV_CAPACITY_BYTES, PV_USED_BYTES,
};
use crate::usage::{self, UsageOutcome};

/// Upper bound on one volume walk so a single stuck directory cannot stall
/// the rest of the cycle.
const WALK_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on the cheap per-root filesystem calls (readdir, statvfs).
/// An unresponsive mount at a root otherwise hangs the cycle forever.
const FS_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a blocking filesystem operation on the blocking pool under a bounded
/// timeout. The runtime worker is never pinned; a timed-out operation is
/// abandoned and its result discarded.
async fn bounded_blocking<T, F>(limit: Duration, op: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match timeout(limit, task::spawn_blocking(op)).await {
        Err(_) => bail!("filesystem operation timed out after {:?}", limit),
        Ok(Err(join_err)) => bail!("blocking task failed: {}", join_err),
        Ok(Ok(value)) => Ok(value),
    }
}

/// Runs the discovery -> resolve -> compute pipeline on a fixed interval and
/// publishes each completed snapshot. The HTTP side only ever reads the slot.
pub struct Collector {
    config: Config,
    resolver: Arc<dyn MetadataResolver>,
    slot: Arc<SnapshotSlot>,
}

/// Why one volume directory was left out of this cycle.
enum VolumeSkip {
    Resolve(ResolveSkip),
    Vanished,
    Walk(String),
}

struct CycleOutcome {
    samples: Vec<MetricSample>,
    /// Samples attributed to volumes (excludes mounted-disk gauges).
    volume_samples: usize,
    candidates: usize,
    api_failures: usize,
}

impl Collector {
    pub fn new(
        config: Config,
        resolver: Arc<dyn MetadataResolver>,
        slot: Arc<SnapshotSlot>,
    ) -> Self {
        Collector {
            config,
            resolver,
            slot,
        }
    }

    pub async fn run(self) {
        if self.config.node_excluded() {
            info!(
                "node {} is in EXCLUDE_NODES; publishing an empty snapshot and idling",
                self.config.node_name
            );
            self.slot.publish(MetricsSnapshot {
                samples: Vec::new(),
                collected_at: Some(Utc::now()),
                degraded: false,
                node: self.config.node_name.clone(),
            });
            return;
        }

        let mut ticker = interval(self.config.update_interval);
        // A cycle outlasting the interval coalesces ticks instead of queueing
        // a second in-flight cycle.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_good: Vec<MetricSample> = Vec::new();
        loop {
            ticker.tick().await;
            let cycle = self.run_cycle().await;
            let snapshot = self.build_snapshot(cycle, &mut last_good);
            debug!(
                "publishing snapshot with {} samples (degraded={})",
                snapshot.samples.len(),
                snapshot.degraded
            );
            self.slot.publish(snapshot);
        }
    }

    /// One full pass over every configured root. A failing root contributes
    /// nothing but never blocks the others.
    async fn run_cycle(&self) -> CycleOutcome {
        let mut samples = Vec::new();
        let mut volume_samples = 0;
        let mut candidates = 0;
        let mut api_failures = 0;

        for root in &self.config.roots {
            let discover_root = root.clone();
            let volumes = match bounded_blocking(FS_TIMEOUT, move || {
                discover_volumes(&discover_root)
            })
            .await
            {
                Ok(Ok(v)) => v,
                Ok(Err(err)) | Err(err) => {
                    warn!("discovery failed for {:?}: {:#}", root.host_path, err);
                    continue;
                }
            };

            for volume in volumes {
                candidates += 1;
                match self.collect_volume(&volume).await {
                    Ok(mut volume_set) => {
                        volume_samples += volume_set.len();
                        samples.append(&mut volume_set);
                    }
                    Err(VolumeSkip::Resolve(skip)) => {
                        if skip.is_api_failure() {
                            api_failures += 1;
                            warn!("skipping volume {}: {}", volume.volume_id, skip);
                        } else {
                            debug!("skipping volume {}: {}", volume.volume_id, skip);
                        }
                    }
                    Err(VolumeSkip::Vanished) => {
                        debug!("volume {} vanished before the walk", volume.volume_id);
                    }
                    Err(VolumeSkip::Walk(reason)) => {
                        warn!("usage walk for {} abandoned: {}", volume.volume_id, reason);
                    }
                }
            }

            let mount_path = root.host_path.clone();
            match bounded_blocking(FS_TIMEOUT, move || usage::mount_stats(&mount_path)).await {
                Ok(Ok(stats)) => {
                    let labels = vec![
                        ("node".to_string(), self.config.node_name.clone()),
                        (
                            "storage_path".to_string(),
                            root.host_path.display().to_string(),
                        ),
                    ];
                    for (name, value) in [
                        (DISK_CAPACITY_BYTES, stats.capacity_bytes),
                        (DISK_USED_BYTES, stats.used_bytes),
                        (DISK_AVAILABLE_BYTES, stats.available_bytes),
                    ] {
                        samples.push(MetricSample {
                            name,
                            value: value as f64,
                            labels: labels.clone(),
                        });
                    }
                }
                Ok(Err(err)) | Err(err) => {
                    warn!("statvfs failed for {:?}: {:#}", root.host_path, err)
                }
            }
        }

        CycleOutcome {
            samples,
            volume_samples,
            candidates,
            api_failures,
        }
    }

    async fn collect_volume(
        &self,
        volume: &VolumeDirectory,
    ) -> Result<Vec<MetricSample>, VolumeSkip> {
        let identity = self
            .resolver
            .resolve(&volume.volume_id)
            .await
            .map_err(VolumeSkip::Resolve)?;

        if identity.storage_class != volume.storage_class {
            debug!(
                "volume {} declares storage class {:?} but lives under the {:?} root",
                volume.volume_id, identity.storage_class, volume.storage_class
            );
        }

        let path = volume.path.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let walk_cancel = cancel.clone();
        let walk =
            bounded_blocking(WALK_TIMEOUT, move || {
                usage::directory_usage(&path, &walk_cancel)
            })
            .await;
        let outcome = match walk {
            Ok(outcome) => outcome,
            Err(err) => {
                // Tell the abandoned walk to stop so a permanently stuck
                // volume cannot accumulate blocking-pool threads.
                cancel.store(true, Ordering::Relaxed);
                return Err(VolumeSkip::Walk(err.to_string()));
            }
        };

        let used_bytes = match outcome {
            UsageOutcome::Bytes(b) => b,
            UsageOutcome::Vanished => return Err(VolumeSkip::Vanished),
        };

        let core = [
            ("node", self.config.node_name.as_str()),
            ("namespace", identity.namespace.as_str()),
            ("pvc", identity.pvc_name.as_str()),
            ("pv", identity.pv_name.as_str()),
            ("storageclass", identity.storage_class.as_str()),
        ];
        let labels = assemble_labels(
            &core,
            &identity.labels,
            &self.config.pvc_label_keys,
            self.config.include_pvc_labels_blob,
        );

        let mut samples = vec![MetricSample {
            name: PV_USED_BYTES,
            value: used_bytes as f64,
            labels: labels.clone(),
        }];
        if let Some(capacity) = identity.capacity_bytes {
            samples.push(MetricSample {
                name: PV_CAPACITY_BYTES,
                value: capacity as f64,
                labels,
            });
        }

        Ok(samples)
    }

    /// A cycle that produced no volume samples while the API was failing is
    /// systemic: the previous cycle's samples are kept so one outage does not
    /// look like every volume being deleted.
    fn build_snapshot(
        &self,
        cycle: CycleOutcome,
        last_good: &mut Vec<MetricSample>,
    ) -> MetricsSnapshot {
        let systemic =
            cycle.candidates > 0 && cycle.volume_samples == 0 && cycle.api_failures > 0;

        let samples = if systemic {
            warn!(
                "collection cycle failed systemically ({} API failures); retaining {} stale samples",
                cycle.api_failures,
                last_good.len()
            );
            last_good.clone()
        } else {
            *last_good = cycle.samples.clone();
            cycle.samples
        };

        MetricsSnapshot {
            samples,
            collected_at: Some(Utc::now()),
            degraded: systemic,
            node: self.config.node_name.clone(),
        }
    }
}
