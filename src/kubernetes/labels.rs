use std::collections::BTreeMap;

use uuid::Uuid;

use crate::spec::ContainerSpec;

/// Workload selector label.
pub(crate) const APP_LABEL: &str = "app";
/// Uniquely selects the one pod backing a container handle.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "Easycontainers";
pub(crate) const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub(crate) const EPHEMERAL_LABEL: &str = "app.kubernetes.io/ephemeral";
pub(crate) const TIMESTAMP_LABEL: &str = "app.kubernetes.io/timestamp";
pub(crate) const PARENT_DEPLOYMENT_LABEL: &str = "app.kubernetes.io/parent-deployment";
pub(crate) const INSIDE_CLUSTER_LABEL: &str = "app.kubernetes.io/inside-cluster";

/// Whether this process runs inside a pod, from the service environment
/// the kubelet injects.
pub(crate) fn in_cluster() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        && std::env::var_os("KUBERNETES_SERVICE_PORT").is_some()
}

/// The owning deployment of this process, derived from the pod hostname
/// `<deployment>-<replicaset-hash>-<pod-hash>`.
pub(crate) fn parent_deployment() -> Option<String> {
    let hostname = std::env::var("HOSTNAME").ok()?;
    let mut segments: Vec<&str> = hostname.split('-').collect();
    if segments.len() < 3 {
        return None;
    }
    segments.truncate(segments.len() - 2);
    Some(segments.join("-"))
}

/// A label-safe name of the host process, for `part-of`.
fn part_of() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .map(|stem| sanitize_label_value(&stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "easycontainers".to_owned())
}

fn sanitize_label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(63);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

/// The label set applied to every object this crate creates: the selector
/// label, the identity contract, and the caller's labels.
pub(crate) fn default_labels(spec: &ContainerSpec, instance_id: Uuid) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.insert(APP_LABEL.to_owned(), spec.name.to_string());
    labels.insert(INSTANCE_LABEL.to_owned(), instance_id.to_string());
    labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());
    labels.insert(PART_OF_LABEL.to_owned(), part_of());
    labels.insert(EPHEMERAL_LABEL.to_owned(), spec.ephemeral.to_string());
    labels.insert(
        TIMESTAMP_LABEL.to_owned(),
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
    );
    if in_cluster() {
        labels.insert(INSIDE_CLUSTER_LABEL.to_owned(), "true".to_owned());
        if let Some(parent) = parent_deployment() {
            labels.insert(PARENT_DEPLOYMENT_LABEL.to_owned(), parent);
        }
    }
    labels
}

/// The selector string matching exactly the pod of one handle.
pub(crate) fn instance_selector(instance_id: Uuid) -> String {
    format!("{INSTANCE_LABEL}={instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ContainerSpec, Platform};

    fn spec() -> ContainerSpec {
        ContainerSpec::builder()
            .platform(Platform::Kubernetes)
            .name("api")
            .unwrap()
            .image("busybox")
            .unwrap()
            .label("team", "platform")
            .ephemeral(true)
            .build()
            .unwrap()
    }

    #[test]
    fn carries_the_label_contract() {
        let id = Uuid::new_v4();
        let labels = default_labels(&spec(), id);
        assert_eq!(labels[APP_LABEL], "api");
        assert_eq!(labels[INSTANCE_LABEL], id.to_string());
        assert_eq!(labels[MANAGED_BY_LABEL], "Easycontainers");
        assert_eq!(labels[EPHEMERAL_LABEL], "true");
        assert!(labels.contains_key(TIMESTAMP_LABEL));
        assert!(labels.contains_key(PART_OF_LABEL));
        // caller labels survive
        assert_eq!(labels["team"], "platform");
    }

    #[test]
    fn selector_targets_the_instance() {
        let id = Uuid::new_v4();
        assert_eq!(
            instance_selector(id),
            format!("app.kubernetes.io/instance={id}")
        );
    }

    #[test]
    fn sanitizes_part_of_values() {
        assert_eq!(sanitize_label_value("My App!"), "my-app");
        assert_eq!(sanitize_label_value("ok-name"), "ok-name");
    }
}
