use std::collections::{BTreeMap, HashSet};

/// Rewrite a PVC label key into a legal Prometheus label name: every
/// character outside `[a-zA-Z0-9_]` becomes `_`. Label names cannot start
/// with a digit, so a leading digit gets a `_` prefix.
pub fn sanitize_label_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 1);
    for c in key.chars() {
        if c == '_' || c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Build the ordered label set for one sample: fixed core labels first, then
/// promoted PVC labels in lexical order of their original key, then the
/// optional `pvc_labels` JSON blob of everything not promoted.
///
/// Collision policy: a sanitized key that is already taken (by a core label
/// or an earlier promoted label) is dropped. Since PVC labels are visited in
/// lexical order of the original key, the first occurrence wins and the
/// outcome is stable across runs. Prometheus cannot carry duplicate label
/// names in one sample.
pub fn assemble_labels(
    core: &[(&str, &str)],
    pvc_labels: &BTreeMap<String, String>,
    promote: &[String],
    include_blob: bool,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = core
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut taken: HashSet<String> = out.iter().map(|(k, _)| k.clone()).collect();

    let promote: HashSet<&str> = promote.iter().map(|s| s.as_str()).collect();
    let mut remaining: BTreeMap<&str, &str> = BTreeMap::new();

    // BTreeMap iteration gives lexical order of the original key.
    for (key, value) in pvc_labels {
        if !promote.contains(key.as_str()) {
            remaining.insert(key, value);
            continue;
        }
        let name = sanitize_label_key(key);
        if taken.insert(name.clone()) {
            out.push((name, value.clone()));
        }
    }

    if include_blob {
        let blob = serde_json::to_string(&remaining).unwrap_or_else(|_| "{}".to_string());
        out.push(("pvc_labels".to_string(), blob));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sanitize_replaces_dots_and_slashes() {
        assert_eq!(
            sanitize_label_key("app.kubernetes.io/name"),
            "app_kubernetes_io_name"
        );
        assert_eq!(sanitize_label_key("team"), "team");
        assert_eq!(sanitize_label_key("0tier"), "_0tier");
    }

    #[test]
    fn promoted_labels_follow_core_in_lexical_order() {
        let pvc = labels(&[("zone", "eu"), ("app", "demo")]);
        let out = assemble_labels(
            &[("namespace", "ns1"), ("pvc", "claim-a")],
            &pvc,
            &["zone".to_string(), "app".to_string()],
            false,
        );
        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["namespace", "pvc", "app", "zone"]);
    }

    #[test]
    fn collision_first_lexical_original_key_wins() {
        // Both sanitize to app_x; "app.x" sorts before "app/x".
        let pvc = labels(&[("app/x", "loser"), ("app.x", "winner")]);
        let promote = vec!["app.x".to_string(), "app/x".to_string()];
        let out = assemble_labels(&[], &pvc, &promote, false);
        assert_eq!(out, vec![("app_x".to_string(), "winner".to_string())]);

        // Stable on repeat runs.
        let again = assemble_labels(&[], &pvc, &promote, false);
        assert_eq!(out, again);
    }

    #[test]
    fn promoted_label_cannot_shadow_core() {
        let pvc = labels(&[("namespace", "spoofed")]);
        let out = assemble_labels(
            &[("namespace", "ns1")],
            &pvc,
            &["namespace".to_string()],
            false,
        );
        assert_eq!(out, vec![("namespace".to_string(), "ns1".to_string())]);
    }

    #[test]
    fn unpromoted_labels_go_to_blob() {
        let pvc = labels(&[("app", "demo"), ("team", "storage")]);
        let out = assemble_labels(&[], &pvc, &["app".to_string()], true);
        assert_eq!(out[0], ("app".to_string(), "demo".to_string()));
        assert_eq!(out[1].0, "pvc_labels");
        assert_eq!(out[1].1, r#"{"team":"storage"}"#);
    }

    #[test]
    fn blob_is_empty_object_when_nothing_remains() {
        let pvc = labels(&[("app", "demo")]);
        let out = assemble_labels(&[], &pvc, &["app".to_string()], true);
        assert_eq!(out[1].1, "{}");
    }
}
