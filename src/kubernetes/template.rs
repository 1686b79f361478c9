use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container as K8sContainer, ContainerPort,
            EmptyDirVolumeSource, EnvVar, ExecAction, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec,
            TCPSocketAction, Volume as K8sVolume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};

use crate::{
    error::{Error, Result},
    kubernetes::labels::APP_LABEL,
    spec::{ContainerFile, ContainerSpec},
};

/// The node port range the API server accepts by default. Mappings
/// outside it are warned about but passed through, the cluster may be
/// configured differently.
const NODE_PORT_RANGE: std::ops::RangeInclusive<u16> = 30000..=32767;

pub(crate) fn object_meta(
    spec: &ContainerSpec,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(spec.name.to_string()),
        namespace: Some(spec.namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn selector(spec: &ContainerSpec) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            APP_LABEL.to_owned(),
            spec.name.to_string(),
        )])),
        ..Default::default()
    }
}

/// One pod, one container: the shared template both workload kinds wrap.
pub(crate) fn pod_template(
    spec: &ContainerSpec,
    labels: &BTreeMap<String, String>,
    service_mode: bool,
) -> Result<PodTemplateSpec> {
    let (volumes, mounts) = volumes_and_mounts(spec)?;

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let ports: Vec<ContainerPort> = spec
        .exposed_ports
        .iter()
        .map(|(symbol, port)| ContainerPort {
            name: (symbol.len() <= 15).then(|| symbol.clone()),
            container_port: i32::from(*port),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        })
        .collect();

    let (liveness, readiness) = if service_mode {
        let (l, r) = probes(spec);
        (Some(l), Some(r))
    } else {
        (None, None)
    };

    let container = K8sContainer {
        name: spec.name.to_string(),
        image: Some(spec.image.to_string()),
        command: spec.command.clone().map(|command| vec![command]),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: resource_requirements(spec),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        liveness_probe: liveness,
        readiness_probe: readiness,
        ..Default::default()
    };

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            restart_policy: Some(if service_mode { "Always" } else { "Never" }.to_owned()),
            ..Default::default()
        }),
    })
}

/// TCP checks against the first exposed port; without ports the probes
/// degrade to trivially succeeding exec commands.
pub(crate) fn probes(spec: &ContainerSpec) -> (Probe, Probe) {
    match spec.exposed_ports.values().next() {
        Some(&port) => {
            let tcp = |initial_delay| Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(i32::from(port)),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(initial_delay),
                period_seconds: Some(5),
                ..Default::default()
            };
            (tcp(10), tcp(5))
        }
        None => {
            let echo = |word: &str| Probe {
                exec: Some(ExecAction {
                    command: Some(vec!["echo".to_owned(), word.to_owned()]),
                }),
                ..Default::default()
            };
            (echo("alive"), echo("ready"))
        }
    }
}

/// Volume materialization: `<name>-pvc` claims for persistent volumes,
/// memory `emptyDir`s for memory-backed ones, ConfigMap-backed single
/// files mounted with `subPath` so the surrounding directory is not
/// shadowed.
pub(crate) fn volumes_and_mounts(
    spec: &ContainerSpec,
) -> Result<(Vec<K8sVolume>, Vec<VolumeMount>)> {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    for volume in &spec.volumes {
        let source = if volume.memory_backed {
            K8sVolume {
                name: volume.name.clone(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_owned()),
                    size_limit: volume.memory.map(|size| Quantity(size.to_quantity())),
                }),
                ..Default::default()
            }
        } else {
            K8sVolume {
                name: volume.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: format!("{}-pvc", volume.name),
                    ..Default::default()
                }),
                ..Default::default()
            }
        };
        volumes.push(source);
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_dir.to_string(),
            ..Default::default()
        });
    }

    for file in &spec.container_files {
        let volume_name = config_map_name(spec, file);
        volumes.push(K8sVolume {
            name: volume_name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: volume_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: file.mount_path.to_string(),
            sub_path: Some(file.name.clone()),
            ..Default::default()
        });
    }

    Ok((volumes, mounts))
}

pub(crate) fn resource_requirements(spec: &ContainerSpec) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = spec.cpu_request {
        requests.insert("cpu".to_owned(), Quantity(cpu.to_quantity()));
    }
    if let Some(memory) = spec.memory_request {
        requests.insert("memory".to_owned(), Quantity(memory.to_quantity()));
    }
    let mut limits = BTreeMap::new();
    if let Some(cpu) = spec.cpu_limit {
        limits.insert("cpu".to_owned(), Quantity(cpu.to_quantity()));
    }
    if let Some(memory) = spec.memory_limit {
        limits.insert("memory".to_owned(), Quantity(memory.to_quantity()));
    }
    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

/// The name of the ConfigMap materializing one container file.
pub(crate) fn config_map_name(spec: &ContainerSpec, file: &ContainerFile) -> String {
    let sanitized: String = file
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", spec.name, sanitized.trim_matches('-'))
}

/// One ConfigMap per container file, key = file name.
pub(crate) fn config_maps(
    spec: &ContainerSpec,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<ConfigMap>> {
    let mut maps = Vec::new();
    for file in &spec.container_files {
        let content = match (&file.content, &file.host_file) {
            (Some(content), _) => content.clone(),
            (None, Some(host_file)) => std::fs::read_to_string(host_file)?,
            (None, None) => unreachable!("validated at build time"),
        };
        maps.push(ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name(spec, file)),
                namespace: Some(spec.namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(file.name.clone(), content)])),
            ..Default::default()
        });
    }
    Ok(maps)
}

/// A `replicas=1` Deployment around the pod template.
pub(crate) fn deployment(
    spec: &ContainerSpec,
    labels: &BTreeMap<String, String>,
) -> Result<Deployment> {
    Ok(Deployment {
        metadata: object_meta(spec, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: selector(spec),
            template: pod_template(spec, labels, true)?,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// A one-shot Job: no retries, one completion, never restarted in place.
pub(crate) fn job(spec: &ContainerSpec, labels: &BTreeMap<String, String>) -> Result<Job> {
    Ok(Job {
        metadata: object_meta(spec, labels),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            completions: Some(1),
            template: pod_template(spec, labels, false)?,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The Service in front of a Deployment: `ClusterIP` inside the cluster,
/// `NodePort` outside, with the spec's host-side mapping used as the node
/// port.
pub(crate) fn service(
    spec: &ContainerSpec,
    labels: &BTreeMap<String, String>,
    node_port: bool,
) -> Result<Service> {
    let ports: Vec<ServicePort> = spec
        .exposed_ports
        .iter()
        .map(|(symbol, &port)| {
            let mapped_node_port = node_port
                .then(|| spec.port_mappings.get(&port).copied())
                .flatten();
            if let Some(mapped) = mapped_node_port {
                if !NODE_PORT_RANGE.contains(&mapped) {
                    tracing::warn!(
                        port = mapped,
                        "node port outside the default {}-{} range",
                        NODE_PORT_RANGE.start(),
                        NODE_PORT_RANGE.end()
                    );
                }
            }
            ServicePort {
                name: Some(symbol.clone()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                node_port: mapped_node_port.map(i32::from),
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            }
        })
        .collect();
    if ports.is_empty() {
        return Err(Error::validation(
            "exposed port",
            "a service needs at least one exposed port",
        ));
    }

    Ok(Service {
        metadata: object_meta(spec, labels),
        spec: Some(ServiceSpec {
            type_: Some(if node_port { "NodePort" } else { "ClusterIP" }.to_owned()),
            selector: Some(BTreeMap::from([(
                APP_LABEL.to_owned(),
                spec.name.to_string(),
            )])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kubernetes::labels,
        spec::{ContainerFile, ExecutionMode, Platform, Volume},
        values::{MemorySize, RemotePath},
    };

    fn base() -> crate::spec::ContainerSpecBuilder {
        ContainerSpec::builder()
            .platform(Platform::Kubernetes)
            .name("api")
            .unwrap()
            .namespace("test")
            .unwrap()
            .image("nginx:latest")
            .unwrap()
    }

    fn labels_of(spec: &ContainerSpec) -> BTreeMap<String, String> {
        labels::default_labels(spec, uuid::Uuid::new_v4())
    }

    #[test]
    fn deployment_shape() {
        let spec = base().exposed_port("http", 80).unwrap().build().unwrap();
        let labels = labels_of(&spec);
        let deployment = deployment(&spec, &labels).unwrap();

        let ds = deployment.spec.unwrap();
        assert_eq!(ds.replicas, Some(1));
        assert_eq!(
            ds.selector.match_labels.unwrap()[APP_LABEL],
            "api".to_owned()
        );
        let pod = ds.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Always"));
        assert_eq!(pod.containers.len(), 1);
        assert!(pod.containers[0].liveness_probe.is_some());
    }

    #[test]
    fn job_shape() {
        let spec = base()
            .mode(ExecutionMode::Task)
            .command("sh")
            .unwrap()
            .args(["-c", "echo hi; exit 7"])
            .build()
            .unwrap();
        let labels = labels_of(&spec);
        let job = job(&spec, &labels).unwrap();

        let js = job.spec.unwrap();
        assert_eq!(js.backoff_limit, Some(0));
        assert_eq!(js.completions, Some(1));
        let pod = js.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.command.as_ref().unwrap(), &vec!["sh".to_owned()]);
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["-c".to_owned(), "echo hi; exit 7".to_owned()]
        );
        assert!(container.liveness_probe.is_none());
    }

    #[test]
    fn tcp_probes_target_first_exposed_port() {
        let spec = base().exposed_port("http", 8080).unwrap().build().unwrap();
        let (liveness, readiness) = probes(&spec);
        assert_eq!(
            liveness.tcp_socket.unwrap().port,
            IntOrString::Int(8080)
        );
        assert_eq!(liveness.initial_delay_seconds, Some(10));
        assert_eq!(readiness.initial_delay_seconds, Some(5));
        assert_eq!(readiness.period_seconds, Some(5));
    }

    #[test]
    fn probes_without_ports_degrade_to_exec() {
        let spec = base().build().unwrap();
        let (liveness, readiness) = probes(&spec);
        assert_eq!(
            liveness.exec.unwrap().command.unwrap(),
            vec!["echo".to_owned(), "alive".to_owned()]
        );
        assert_eq!(
            readiness.exec.unwrap().command.unwrap(),
            vec!["echo".to_owned(), "ready".to_owned()]
        );
    }

    #[test]
    fn memory_volume_becomes_memory_empty_dir() {
        let spec = base()
            .volume(Volume::memory(
                "scratch",
                RemotePath::new("/scratch").unwrap(),
                MemorySize::parse("64Mi").unwrap(),
            ))
            .build()
            .unwrap();
        let (volumes, mounts) = volumes_and_mounts(&spec).unwrap();
        let empty_dir = volumes[0].empty_dir.as_ref().unwrap();
        assert_eq!(empty_dir.medium.as_deref(), Some("Memory"));
        assert_eq!(
            empty_dir.size_limit.as_ref().unwrap().0,
            (64u64 << 20).to_string()
        );
        assert_eq!(mounts[0].mount_path, "/scratch");
    }

    #[test]
    fn persistent_volume_resolves_pvc_name() {
        let spec = base()
            .volume(Volume::named("data", RemotePath::new("/data").unwrap()))
            .build()
            .unwrap();
        let (volumes, _) = volumes_and_mounts(&spec).unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "data-pvc"
        );
    }

    #[test]
    fn container_file_mounts_via_sub_path() {
        let spec = base()
            .container_file(ContainerFile::inline(
                "app.conf",
                RemotePath::new("/etc/app/app.conf").unwrap(),
                "key=value\n",
            ))
            .build()
            .unwrap();
        let (volumes, mounts) = volumes_and_mounts(&spec).unwrap();
        assert!(volumes[0].config_map.is_some());
        assert_eq!(mounts[0].mount_path, "/etc/app/app.conf");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("app.conf"));

        let labels = labels_of(&spec);
        let maps = config_maps(&spec, &labels).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].data.as_ref().unwrap()["app.conf"], "key=value\n");
    }

    #[test]
    fn resources_copied_to_requirements() {
        let spec = base()
            .cpu_request(crate::values::CpuMillis::parse("250m").unwrap())
            .memory_limit(MemorySize::parse("512Mi").unwrap())
            .build()
            .unwrap();
        let resources = resource_requirements(&spec).unwrap();
        assert_eq!(resources.requests.unwrap()["cpu"].0, "250m");
        assert_eq!(
            resources.limits.unwrap()["memory"].0,
            (512u64 << 20).to_string()
        );
        assert!(resource_requirements(&base().build().unwrap()).is_none());
    }

    #[test]
    fn node_port_service_uses_mapped_ports() {
        let spec = base()
            .exposed_port("http", 80)
            .unwrap()
            .port_mapping(80, 30080)
            .unwrap()
            .build()
            .unwrap();
        let labels = labels_of(&spec);

        let outside = service(&spec, &labels, true).unwrap();
        let sspec = outside.spec.unwrap();
        assert_eq!(sspec.type_.as_deref(), Some("NodePort"));
        assert_eq!(sspec.ports.as_ref().unwrap()[0].node_port, Some(30080));

        let inside = service(&spec, &labels, false).unwrap();
        let sspec = inside.spec.unwrap();
        assert_eq!(sspec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(sspec.ports.as_ref().unwrap()[0].node_port, None);
    }

    #[test]
    fn service_requires_a_port() {
        let spec = base().build().unwrap();
        let labels = labels_of(&spec);
        assert!(service(&spec, &labels, false).is_err());
    }
}
