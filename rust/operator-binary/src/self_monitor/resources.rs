//! The objects that make up the self-monitor, derived deterministically from its [`Config`].

use std::collections::BTreeMap;

use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort,
                EmptyDirVolumeSource, HTTPGetAction, PodSecurityContext, PodSpec, PodTemplateSpec,
                Probe, ResourceRequirements, SeccompProfile, SecurityContext, Service,
                ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
            },
            networking::v1::{
                IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
                NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
            },
            rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
        },
        apimachinery::pkg::{
            api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
        },
    },
    kube::api::ObjectMeta,
};

use super::Config;
use crate::config_checksum::CHECKSUM_CONFIG_ANNOTATION;

pub const PROMETHEUS_CONFIG_FILE: &str = "prometheus.yml";
pub const ALERT_RULES_FILE: &str = "alerting_rules.yml";
pub const CONFIG_PATH: &str = "/etc/prometheus/";
pub const STORAGE_PATH: &str = "/prometheus/";

const CONTAINER_NAME: &str = "self-monitor";
const CONFIG_VOLUME: &str = "prometheus-config-volume";
const STORAGE_VOLUME: &str = "prometheus-storage-volume";
const RETENTION_TIME: &str = "2h";
const RETENTION_SIZE: &str = "80MB";
const STORAGE_SIZE_LIMIT: &str = "100Mi";
const RUN_AS_USER: i64 = 10001;
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 300;
const CONFIG_FILE_MODE: i32 = 0o644;

const LABEL_NAME: &str = "app.kubernetes.io/name";
const ISTIO_INJECT: &str = "sidecar.istio.io/inject";

/// Matches the self-monitor's pods.
pub fn selector_labels(config: &Config) -> BTreeMap<String, String> {
    [(LABEL_NAME.to_string(), config.base_name.clone())].into()
}

fn labels(config: &Config) -> BTreeMap<String, String> {
    let mut labels = selector_labels(config);
    labels.extend(
        [
            ("app.kubernetes.io/managed-by", "telemetry-manager"),
            ("app.kubernetes.io/part-of", "telemetry"),
            ("app.kubernetes.io/component", "monitor"),
            ("kyma-project.io/module", "telemetry"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    labels
}

fn metadata(config: &Config) -> ObjectMeta {
    ObjectMeta {
        name: Some(config.base_name.clone()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels(config)),
        ..ObjectMeta::default()
    }
}

fn strings<const N: usize>(values: [&str; N]) -> Option<Vec<String>> {
    Some(values.map(str::to_string).to_vec())
}

pub fn service_account(config: &Config) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(config),
        ..ServiceAccount::default()
    }
}

pub fn role(config: &Config) -> Role {
    Role {
        metadata: metadata(config),
        rules: Some(vec![PolicyRule {
            api_groups: strings([""]),
            resources: strings(["services", "endpoints", "pods"]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..PolicyRule::default()
        }]),
    }
}

pub fn role_binding(config: &Config) -> RoleBinding {
    RoleBinding {
        metadata: metadata(config),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: config.base_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: config.base_name.clone(),
            namespace: Some(config.namespace.clone()),
            ..Subject::default()
        }]),
    }
}

fn any_address() -> Option<Vec<NetworkPolicyPeer>> {
    Some(
        ["0.0.0.0/0", "::/0"]
            .map(|cidr| NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: cidr.to_string(),
                    except: None,
                }),
                ..NetworkPolicyPeer::default()
            })
            .to_vec(),
    )
}

/// Prometheus is reachable on its port from anywhere, and may scrape anything.
pub fn network_policy(config: &Config) -> NetworkPolicy {
    NetworkPolicy {
        metadata: metadata(config),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(config)),
                ..LabelSelector::default()
            },
            policy_types: strings(["Ingress", "Egress"]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: any_address(),
                ports: Some(vec![NetworkPolicyPort {
                    protocol: Some("TCP".to_string()),
                    port: Some(IntOrString::Int(config.port.into())),
                    end_port: None,
                }]),
            }]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: any_address(),
                ports: None,
            }]),
        }),
        ..NetworkPolicy::default()
    }
}

pub fn config_map(config: &Config, prometheus_config: &str, alert_rules: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(config),
        data: Some(
            [
                (PROMETHEUS_CONFIG_FILE.to_string(), prometheus_config.to_string()),
                (ALERT_RULES_FILE.to_string(), alert_rules.to_string()),
            ]
            .into(),
        ),
        ..ConfigMap::default()
    }
}

fn probe(config: &Config, path: &str, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(config.port.into()),
            ..HTTPGetAction::default()
        }),
        failure_threshold: Some(failure_threshold),
        period_seconds: Some(5),
        timeout_seconds: Some(3),
        success_threshold: Some(1),
        ..Probe::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> Option<BTreeMap<String, Quantity>> {
    Some(
        [
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]
        .into(),
    )
}

fn container(config: &Config) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        args: Some(vec![
            format!("--storage.tsdb.retention.time={RETENTION_TIME}"),
            format!("--storage.tsdb.retention.size={RETENTION_SIZE}"),
            format!("--config.file={CONFIG_PATH}{PROMETHEUS_CONFIG_FILE}"),
            format!("--storage.tsdb.path={STORAGE_PATH}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("http-web".to_string()),
            container_port: config.port.into(),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        liveness_probe: Some(probe(config, "/-/healthy", 5)),
        readiness_probe: Some(probe(config, "/-/ready", 3)),
        resources: Some(ResourceRequirements {
            requests: quantities("100m", "50Mi"),
            limits: quantities("200m", "180Mi"),
            ..ResourceRequirements::default()
        }),
        security_context: Some(SecurityContext {
            run_as_user: Some(RUN_AS_USER),
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            capabilities: Some(Capabilities {
                drop: strings(["ALL"]),
                add: None,
            }),
            seccomp_profile: Some(runtime_default_seccomp()),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_PATH.to_string(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: STORAGE_VOLUME.to_string(),
                mount_path: STORAGE_PATH.to_string(),
                ..VolumeMount::default()
            },
        ]),
        ..Container::default()
    }
}

fn runtime_default_seccomp() -> SeccompProfile {
    SeccompProfile {
        type_: "RuntimeDefault".to_string(),
        localhost_profile: None,
    }
}

/// `config_checksum` is stamped onto the pod template, so that any change to it rolls the pods.
pub fn deployment(config: &Config, config_checksum: &str) -> Deployment {
    let mut pod_labels = labels(config);
    pod_labels.insert(ISTIO_INJECT.to_string(), "false".to_string());
    let pod_annotations = [
        (CHECKSUM_CONFIG_ANNOTATION.to_string(), config_checksum.to_string()),
        (ISTIO_INJECT.to_string(), "false".to_string()),
    ]
    .into();

    Deployment {
        metadata: metadata(config),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(config)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(config)],
                    service_account_name: Some(config.base_name.clone()),
                    priority_class_name: config.priority_class_name.clone(),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(RUN_AS_USER),
                        run_as_non_root: Some(true),
                        seccomp_profile: Some(runtime_default_seccomp()),
                        ..PodSecurityContext::default()
                    }),
                    volumes: Some(vec![
                        Volume {
                            name: CONFIG_VOLUME.to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(config.base_name.clone()),
                                default_mode: Some(CONFIG_FILE_MODE),
                                ..ConfigMapVolumeSource::default()
                            }),
                            ..Volume::default()
                        },
                        Volume {
                            name: STORAGE_VOLUME.to_string(),
                            empty_dir: Some(EmptyDirVolumeSource {
                                size_limit: Some(Quantity(STORAGE_SIZE_LIMIT.to_string())),
                                medium: None,
                            }),
                            ..Volume::default()
                        },
                    ]),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

pub fn service(config: &Config) -> Service {
    Service {
        metadata: metadata(config),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(config)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: config.port.into(),
                target_port: Some(IntOrString::Int(config.port.into())),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}
