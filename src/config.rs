use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::Level;

/// One storage class and the host path its volumes live under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    pub storage_class: String,
    pub host_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_class_names: Vec<String>,
    pub roots: Vec<StorageRoot>,
    pub metrics_port: u16,
    pub update_interval: Duration,
    pub log_level: Level,
    pub exclude_nodes: Vec<String>,
    pub pvc_label_keys: Vec<String>,
    pub include_pvc_labels_blob: bool,
    pub node_name: String,
}

impl Config {
    /// Read configuration from the environment. Any invalid value is fatal.
    pub fn from_env() -> anyhow::Result<Config> {
        let storage_class_names = split_list(&env_or_default("STORAGE_CLASS_NAMES", ""));
        if storage_class_names.is_empty() {
            bail!("STORAGE_CLASS_NAMES must contain at least one storage class name");
        }

        let storage_paths: Vec<PathBuf> = split_list(&env_or_default("STORAGE_PATHS", ""))
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if storage_paths.is_empty() {
            bail!("STORAGE_PATHS must contain at least one path");
        }
        for path in &storage_paths {
            if !path.is_absolute() {
                bail!("storage path {:?} is not absolute", path);
            }
        }

        let roots = pair_roots(&storage_class_names, &storage_paths)?;

        let metrics_port: u16 = match std::env::var("METRICS_PORT") {
            Ok(raw) => {
                let port: u32 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("METRICS_PORT {:?} is not a number", raw))?;
                if port == 0 || port > u16::MAX as u32 {
                    bail!("METRICS_PORT must be in 1-65535, got {}", port);
                }
                port as u16
            }
            Err(_) => 9100,
        };

        let update_interval = match std::env::var("UPDATE_INTERVAL") {
            Ok(raw) => parse_interval(&raw)?,
            Err(_) => Duration::from_secs(30),
        };
        if update_interval.is_zero() {
            bail!("UPDATE_INTERVAL must be greater than zero");
        }

        let log_level = parse_log_level(&env_or_default("LOG_LEVEL", "info"))?;
        let exclude_nodes = split_list(&env_or_default("EXCLUDE_NODES", ""));
        let pvc_label_keys = split_list(&env_or_default("PVC_LABEL_KEYS", ""));
        let include_pvc_labels_blob = env_or_default("PVC_LABELS_BLOB", "false")
            .trim()
            .eq_ignore_ascii_case("true");

        let node_name = match std::env::var("NODE_NAME") {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => hostname::get()
                .context("could not determine node hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(Config {
            storage_class_names,
            roots,
            metrics_port,
            update_interval,
            log_level,
            exclude_nodes,
            pvc_label_keys,
            include_pvc_labels_blob,
            node_name,
        })
    }

    pub fn node_excluded(&self) -> bool {
        self.exclude_nodes.iter().any(|n| n == &self.node_name)
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Pair storage classes with paths: equal lengths zip one-to-one, a single
/// class applies to every path, anything else is a configuration error.
fn pair_roots(classes: &[String], paths: &[PathBuf]) -> anyhow::Result<Vec<StorageRoot>> {
    if classes.len() == paths.len() {
        return Ok(classes
            .iter()
            .zip(paths)
            .map(|(class, path)| StorageRoot {
                storage_class: class.clone(),
                host_path: path.clone(),
            })
            .collect());
    }

    if classes.len() == 1 {
        return Ok(paths
            .iter()
            .map(|path| StorageRoot {
                storage_class: classes[0].clone(),
                host_path: path.clone(),
            })
            .collect());
    }

    bail!(
        "STORAGE_CLASS_NAMES ({}) and STORAGE_PATHS ({}) lengths do not match",
        classes.len(),
        paths.len()
    )
}

/// Parse a duration with an optional ms/s/m/h suffix; a bare number is seconds.
pub fn parse_interval(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty interval");
    }

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid interval {:?}", raw))?;

    let scaled = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .with_context(|| format!("interval {:?} overflows", raw))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => scaled(60),
        "h" => scaled(3600),
        other => bail!("invalid interval suffix {:?} in {:?}", other, raw),
    }
}

fn parse_log_level(raw: &str) -> anyhow::Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        other => bail!("invalid LOG_LEVEL {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_suffixes() {
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn bare_interval_is_seconds() {
        assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn bad_intervals_rejected() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("10d").is_err());
        assert!(parse_interval("fast").is_err());
    }

    #[test]
    fn huge_interval_is_an_error_not_a_panic() {
        assert!(parse_interval("9999999999999999999h").is_err());
        assert!(parse_interval("9999999999999999999m").is_err());
    }

    #[test]
    fn roots_zip_when_lengths_match() {
        let classes = vec!["a".to_string(), "b".to_string()];
        let paths = vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")];
        let roots = pair_roots(&classes, &paths).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].storage_class, "a");
        assert_eq!(roots[0].host_path, PathBuf::from("/data/a"));
        assert_eq!(roots[1].storage_class, "b");
    }

    #[test]
    fn single_class_applies_to_all_paths() {
        let classes = vec!["openebs-hostpath".to_string()];
        let paths = vec![PathBuf::from("/data"), PathBuf::from("/mnt/ssd")];
        let roots = pair_roots(&classes, &paths).unwrap();
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|r| r.storage_class == "openebs-hostpath"));
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let classes = vec!["a".to_string(), "b".to_string()];
        let paths = vec![PathBuf::from("/data")];
        assert!(pair_roots(&classes, &paths).is_err());
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert!(parse_log_level("loud").is_err());
    }
}
