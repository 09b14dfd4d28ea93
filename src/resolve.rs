use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{Api, Client};
use tokio::time::timeout;

/// Cluster metadata for one volume directory, fetched fresh each cycle.
/// PVC bindings change over time; nothing here is cached across cycles.
#[derive(Debug, Clone)]
pub struct PvcIdentity {
    pub namespace: String,
    pub pvc_name: String,
    pub pv_name: String,
    pub storage_class: String,
    /// Declared PV capacity, when `spec.capacity["storage"]` parses.
    pub capacity_bytes: Option<u64>,
    pub labels: BTreeMap<String, String>,
}

/// Why a volume directory is left out of the snapshot. Per-item, never fatal.
#[derive(Debug)]
pub enum ResolveSkip {
    /// No PV with the directory's name; orphaned directories are dropped.
    PvNotFound,
    /// PV exists but carries no claimRef (unbound).
    NoClaimRef,
    StorageClassNotConfigured(String),
    PvcNotFound { namespace: String, name: String },
    Api(String),
    Timeout,
}

impl ResolveSkip {
    /// API-level failures hint at a systemic problem (cluster unreachable);
    /// the scheduler uses this to decide whether to keep the old snapshot.
    pub fn is_api_failure(&self) -> bool {
        matches!(self, ResolveSkip::Api(_) | ResolveSkip::Timeout)
    }
}

impl fmt::Display for ResolveSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveSkip::PvNotFound => write!(f, "no PV with this name"),
            ResolveSkip::NoClaimRef => write!(f, "PV has no claimRef"),
            ResolveSkip::StorageClassNotConfigured(sc) => {
                write!(f, "storage class {:?} not configured", sc)
            }
            ResolveSkip::PvcNotFound { namespace, name } => {
                write!(f, "PVC {}/{} not found", namespace, name)
            }
            ResolveSkip::Api(err) => write!(f, "API error: {}", err),
            ResolveSkip::Timeout => write!(f, "API call timed out"),
        }
    }
}

/// Maps a volume identifier to its owning PVC. Trait seam so the collection
/// pipeline can be exercised without a cluster.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, volume_id: &str) -> Result<PvcIdentity, ResolveSkip>;
}

/// Production resolver backed by the Kubernetes API. Read-only: gets on
/// PersistentVolume and PersistentVolumeClaim, nothing else.
pub struct KubeResolver {
    client: Client,
    storage_class_names: HashSet<String>,
    api_timeout: Duration,
}

impl KubeResolver {
    pub fn new(client: Client, storage_class_names: &[String], api_timeout: Duration) -> Self {
        KubeResolver {
            client,
            storage_class_names: storage_class_names.iter().cloned().collect(),
            api_timeout,
        }
    }
}

#[async_trait]
impl MetadataResolver for KubeResolver {
    async fn resolve(&self, volume_id: &str) -> Result<PvcIdentity, ResolveSkip> {
        // Host-path provisioners name the directory after the PV.
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let pv = match timeout(self.api_timeout, pvs.get(volume_id)).await {
            Err(_) => return Err(ResolveSkip::Timeout),
            Ok(Err(kube::Error::Api(ae))) if ae.code == 404 => {
                return Err(ResolveSkip::PvNotFound)
            }
            Ok(Err(err)) => return Err(ResolveSkip::Api(err.to_string())),
            Ok(Ok(pv)) => pv,
        };

        let spec = pv.spec.ok_or(ResolveSkip::NoClaimRef)?;

        // Defense in depth: the path layout may be shared between classes.
        let storage_class = spec.storage_class_name.unwrap_or_default();
        if !self.storage_class_names.contains(&storage_class) {
            return Err(ResolveSkip::StorageClassNotConfigured(storage_class));
        }

        let claim = spec.claim_ref.ok_or(ResolveSkip::NoClaimRef)?;
        let (namespace, pvc_name) = match (claim.namespace, claim.name) {
            (Some(ns), Some(name)) => (ns, name),
            _ => return Err(ResolveSkip::NoClaimRef),
        };

        let capacity_bytes = spec
            .capacity
            .as_ref()
            .and_then(|c| c.get("storage"))
            .and_then(|q| parse_quantity(&q.0));

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &namespace);
        let pvc = match timeout(self.api_timeout, pvcs.get(&pvc_name)).await {
            Err(_) => return Err(ResolveSkip::Timeout),
            Ok(Err(kube::Error::Api(ae))) if ae.code == 404 => {
                return Err(ResolveSkip::PvcNotFound {
                    namespace,
                    name: pvc_name,
                })
            }
            Ok(Err(err)) => return Err(ResolveSkip::Api(err.to_string())),
            Ok(Ok(pvc)) => pvc,
        };

        Ok(PvcIdentity {
            namespace,
            pvc_name,
            pv_name: volume_id.to_string(),
            storage_class,
            capacity_bytes,
            labels: pvc.metadata.labels.unwrap_or_default(),
        })
    }
}

/// Parse a Kubernetes storage quantity (`10Gi`, `512M`, plain bytes) into
/// bytes. Unknown suffixes yield None.
pub fn parse_quantity(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let mult: u64 = match unit {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };

    value.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_binary_suffixes() {
        assert_eq!(parse_quantity("10Gi"), Some(10 * (1 << 30)));
        assert_eq!(parse_quantity("512Mi"), Some(512 * (1 << 20)));
        assert_eq!(parse_quantity("1Ki"), Some(1024));
    }

    #[test]
    fn quantity_decimal_suffixes() {
        assert_eq!(parse_quantity("1k"), Some(1_000));
        assert_eq!(parse_quantity("5G"), Some(5_000_000_000));
    }

    #[test]
    fn quantity_plain_bytes() {
        assert_eq!(parse_quantity("2048"), Some(2048));
        assert_eq!(parse_quantity("0"), Some(0));
    }

    #[test]
    fn quantity_garbage_is_none() {
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("10x"), None);
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("10Gib"), None);
    }

    #[test]
    fn api_failures_are_systemic() {
        assert!(ResolveSkip::Api("boom".into()).is_api_failure());
        assert!(ResolveSkip::Timeout.is_api_failure());
        assert!(!ResolveSkip::PvNotFound.is_api_failure());
    }
}
