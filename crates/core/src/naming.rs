//! Deterministic names for child objects and in-cluster addresses.

/// `override_ns` when set and non-empty, otherwise `default_ns`.
pub fn compute_namespace(default_ns: &str, override_ns: Option<&str>) -> String {
    match override_ns {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => default_ns.to_string(),
    }
}

/// In-cluster DNS name of the Service `name` in `namespace`.
pub fn compute_fqdn(name: &str, namespace: &str) -> String {
    [name, namespace, "svc", "cluster", "local"].join(".")
}

/// `<owner>-<suffix>`, the naming scheme for auxiliary children.
pub fn child_name(owner: &str, suffix: &str) -> String {
    format!("{}-{}", owner, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_override_wins_when_non_empty() {
        assert_eq!(compute_namespace("a", None), "a");
        assert_eq!(compute_namespace("a", Some("")), "a");
        assert_eq!(compute_namespace("a", Some("b")), "b");
    }

    #[test]
    fn fqdn_and_child_names() {
        assert_eq!(compute_fqdn("hs", "matrix"), "hs.matrix.svc.cluster.local");
        assert_eq!(child_name("hs", "pgsql"), "hs-pgsql");
    }
}
