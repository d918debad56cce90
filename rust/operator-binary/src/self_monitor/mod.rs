//! The embedded Prometheus that watches the telemetry data plane.

use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Service, ServiceAccount},
    networking::v1::NetworkPolicy,
    rbac::v1::{Role, RoleBinding},
};
use telemetry_operator_utils::reference::NamespacedName;
use tracing::info;

use crate::{
    cluster::{self, ClusterClient, Object},
    config_checksum,
    error::{ClassifyError, FailureKind},
};

pub mod alerts;
pub mod flow_health;
pub mod resources;
pub mod rules;
pub mod webhook;

pub const DEFAULT_PORT: u16 = 9090;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply self-monitor {kind}"))]
    ApplyResource {
        source: cluster::Error,
        kind: String,
    },

    #[snafu(display("failed to delete self-monitor {kind}"))]
    DeleteResource {
        source: cluster::Error,
        kind: String,
    },

    #[snafu(display("failed to render self-monitor alerting rules"))]
    RenderRules { source: rules::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::ApplyResource { source, .. } => source.failure_kind(),
            Error::DeleteResource { source, .. } => source.failure_kind(),
            Error::RenderRules { source } => source.failure_kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Name shared by all self-monitor objects.
    pub base_name: String,
    pub namespace: String,
    pub image: String,
    pub priority_class_name: Option<String>,
    /// Prometheus' HTTP port, on both the pod and the service.
    pub port: u16,
}

impl Config {
    pub fn service(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.base_name)
    }

    /// Where the self-monitor's HTTP API is reachable from inside the cluster.
    pub fn base_url(&self) -> String {
        format!("http://{}.{}:{}", self.base_name, self.namespace, self.port)
    }
}

async fn apply_one<K: Object>(cluster: &impl ClusterClient, obj: &K) -> Result<()> {
    cluster::apply(cluster, obj)
        .await
        .with_context(|_| ApplyResourceSnafu {
            kind: K::kind(&()),
        })?;
    Ok(())
}

/// Creates or updates every self-monitor object, in dependency order.
pub async fn apply(
    cluster: &impl ClusterClient,
    config: &Config,
    prometheus_config: &str,
    alert_rules: &str,
) -> Result<()> {
    apply_one(cluster, &resources::service_account(config)).await?;
    apply_one(cluster, &resources::role(config)).await?;
    apply_one(cluster, &resources::role_binding(config)).await?;
    apply_one(cluster, &resources::network_policy(config)).await?;

    let config_map = resources::config_map(config, prometheus_config, alert_rules);
    apply_one(cluster, &config_map).await?;
    let checksum = config_checksum::calculate(&[&config_map], &[]);
    apply_one(cluster, &resources::deployment(config, &checksum)).await?;

    apply_one(cluster, &resources::service(config)).await?;
    info!(
        self_monitor = %config.service(),
        config.checksum = %checksum,
        "Applied self-monitor"
    );
    Ok(())
}

/// Like [`apply`], with the alerting rules from [`rules::make_rules`].
pub async fn apply_with_default_rules(
    cluster: &impl ClusterClient,
    config: &Config,
    prometheus_config: &str,
) -> Result<()> {
    let alert_rules = rules::make_rules().to_yaml().context(RenderRulesSnafu)?;
    apply(cluster, config, prometheus_config, &alert_rules).await
}

async fn delete_one<K: Object>(cluster: &impl ClusterClient, config: &Config) -> Result<()> {
    cluster::delete_ignore_not_found::<K>(cluster, Some(&config.namespace), &config.base_name)
        .await
        .with_context(|_| DeleteResourceSnafu { kind: K::kind(&()) })
}

/// Deletes every self-monitor object. Objects that are already gone are skipped.
pub async fn remove(cluster: &impl ClusterClient, config: &Config) -> Result<()> {
    delete_one::<Deployment>(cluster, config).await?;
    delete_one::<ConfigMap>(cluster, config).await?;
    delete_one::<NetworkPolicy>(cluster, config).await?;
    delete_one::<RoleBinding>(cluster, config).await?;
    delete_one::<Role>(cluster, config).await?;
    delete_one::<ServiceAccount>(cluster, config).await?;
    delete_one::<Service>(cluster, config).await?;
    info!(self_monitor = %config.service(), "Removed self-monitor");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{cluster::fake::FakeCluster, config_checksum::CHECKSUM_CONFIG_ANNOTATION};

    pub(crate) fn test_config() -> Config {
        Config {
            base_name: "telemetry-self-monitor".to_string(),
            namespace: "kyma-system".to_string(),
            image: "prom/prometheus:v2.53.0".to_string(),
            priority_class_name: Some("telemetry-priority-class".to_string()),
            port: DEFAULT_PORT,
        }
    }

    fn checksum(cluster: &FakeCluster) -> String {
        let deployment: Deployment = cluster
            .get_typed(Some("kyma-system"), "telemetry-self-monitor")
            .unwrap();
        deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap()[CHECKSUM_CONFIG_ANNOTATION]
            .clone()
    }

    #[tokio::test]
    async fn apply_creates_objects_in_order() {
        let cluster = FakeCluster::default();
        apply(&cluster, &test_config(), "scrape_configs: []", "groups: []")
            .await
            .unwrap();
        assert_eq!(
            cluster.log(),
            vec![
                "patch ServiceAccount/telemetry-self-monitor",
                "patch Role/telemetry-self-monitor",
                "patch RoleBinding/telemetry-self-monitor",
                "patch NetworkPolicy/telemetry-self-monitor",
                "patch ConfigMap/telemetry-self-monitor",
                "patch Deployment/telemetry-self-monitor",
                "patch Service/telemetry-self-monitor",
            ]
        );
    }

    #[tokio::test]
    async fn config_change_rolls_pods() {
        let cluster = FakeCluster::default();
        let config = test_config();
        apply(&cluster, &config, "A", "rules").await.unwrap();
        let first = checksum(&cluster);
        apply(&cluster, &config, "A", "rules").await.unwrap();
        assert_eq!(checksum(&cluster), first);
        apply(&cluster, &config, "B", "rules").await.unwrap();
        assert_ne!(checksum(&cluster), first);
    }

    #[tokio::test]
    async fn apply_stops_at_first_failure() {
        let cluster = FakeCluster::default();
        cluster.fail("patch", "RoleBinding", 403);
        let err = apply(&cluster, &test_config(), "A", "rules")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to apply self-monitor RoleBinding");
        assert_eq!(cluster.log().len(), 2);
    }

    #[tokio::test]
    async fn remove_deletes_everything_and_tolerates_missing_objects() {
        let cluster = FakeCluster::default();
        let config = test_config();
        apply(&cluster, &config, "A", "rules").await.unwrap();
        remove(&cluster, &config).await.unwrap();
        for kind in [
            "ServiceAccount",
            "Role",
            "RoleBinding",
            "NetworkPolicy",
            "ConfigMap",
            "Deployment",
            "Service",
        ] {
            assert_eq!(cluster.count(kind), 0, "{kind}");
        }
        // Nothing left, so the second run only sees NotFound
        remove(&cluster, &config).await.unwrap();
    }

    #[tokio::test]
    async fn remove_surfaces_other_errors() {
        let cluster = FakeCluster::default();
        cluster.fail("delete", "Role", 500);
        let err = remove(&cluster, &test_config()).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::TransportFailure);
    }

    #[tokio::test]
    async fn default_rules_are_mounted() {
        let cluster = FakeCluster::default();
        apply_with_default_rules(&cluster, &test_config(), "A")
            .await
            .unwrap();
        let config_map: ConfigMap = cluster
            .get_typed(Some("kyma-system"), "telemetry-self-monitor")
            .unwrap();
        let data = config_map.data.unwrap();
        assert_eq!(data[resources::PROMETHEUS_CONFIG_FILE], "A");
        assert_eq!(
            data[resources::ALERT_RULES_FILE],
            rules::make_rules().to_yaml().unwrap()
        );
        assert!(data[resources::ALERT_RULES_FILE].contains("LogFluentBitNoLogsDelivered"));
    }

    #[test]
    fn alert_endpoint_follows_service() {
        assert_eq!(
            test_config().base_url(),
            "http://telemetry-self-monitor.kyma-system:9090"
        );
    }
}
