//! The cluster objects that carry the webhook CA bundle.

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::admissionregistration::v1::{
            MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
            ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
        },
        apiextensions_apiserver::pkg::apis::apiextensions::v1::{
            CustomResourceConversion, CustomResourceDefinition,
            ServiceReference as CrdServiceReference, WebhookClientConfig as CrdWebhookClientConfig,
            WebhookConversion,
        },
        ByteString,
    },
    kube::api::ObjectMeta,
};
use tracing::{debug, info};

use super::Config;
use crate::{
    cluster::{self, ClusterClient},
    error::{ClassifyError, FailureKind},
};

pub const WEBHOOK_SERVICE_PORT: i32 = 443;
pub const CONVERSION_PATH: &str = "/convert";
const TIMEOUT_SECONDS: i32 = 15;

/// A resource that the validating webhook guards.
struct ValidatedResource {
    plural: &'static str,
    path: &'static str,
}

const VALIDATED_RESOURCES: [ValidatedResource; 2] = [
    ValidatedResource {
        plural: "logpipelines",
        path: "/validate-logpipeline",
    },
    ValidatedResource {
        plural: "logparsers",
        path: "/validate-logparser",
    },
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create or update validating webhook configuration {name:?}"))]
    UpdateValidatingWebhook { source: cluster::Error, name: String },

    #[snafu(display("failed to patch mutating webhook configuration {name:?}"))]
    PatchMutatingWebhook { source: cluster::Error, name: String },

    #[snafu(display("failed to get CRD {name:?}"))]
    GetCrd { source: cluster::Error, name: String },

    #[snafu(display("CRD {name:?} does not exist"))]
    CrdNotFound { name: String },

    #[snafu(display("failed to patch conversion webhook configuration of CRD {name:?}"))]
    PatchConversionWebhook { source: cluster::Error, name: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::UpdateValidatingWebhook { source, .. } => source.failure_kind(),
            Error::PatchMutatingWebhook { source, .. } => source.failure_kind(),
            Error::GetCrd { source, .. } => source.failure_kind(),
            Error::CrdNotFound { .. } => FailureKind::NotFound,
            Error::PatchConversionWebhook { source, .. } => source.failure_kind(),
        }
    }
}

fn labels() -> BTreeMap<String, String> {
    [
        ("control-plane", "telemetry-manager"),
        ("app.kubernetes.io/instance", "telemetry"),
        ("app.kubernetes.io/name", "manager"),
        ("kyma-project.io/component", "controller"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// The canonical validating webhook configuration, one webhook per validated resource.
pub fn validating_webhook_configuration(
    config: &Config,
    ca_bundle: &[u8],
) -> ValidatingWebhookConfiguration {
    let api_group = config.api_group();
    let webhooks = VALIDATED_RESOURCES
        .iter()
        .map(|resource| ValidatingWebhook {
            name: format!("validation.{}.{api_group}", resource.plural),
            admission_review_versions: vec!["v1beta1".to_string(), "v1".to_string()],
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: config.service.name.clone(),
                    namespace: config.service.namespace.clone(),
                    path: Some(resource.path.to_string()),
                    port: Some(WEBHOOK_SERVICE_PORT),
                }),
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                url: None,
            },
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Exact".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(TIMEOUT_SECONDS),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                api_groups: Some(vec![api_group.clone()]),
                api_versions: Some(vec!["v1alpha1".to_string()]),
                resources: Some(vec![resource.plural.to_string()]),
                scope: Some("*".to_string()),
            }]),
            ..ValidatingWebhook::default()
        })
        .collect();
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.validating_webhook_name.clone()),
            labels: Some(labels()),
            ..ObjectMeta::default()
        },
        webhooks: Some(webhooks),
    }
}

/// Points the pipeline CRD's conversion at the webhook service.
pub fn conversion(config: &Config, ca_bundle: &[u8]) -> CustomResourceConversion {
    CustomResourceConversion {
        strategy: "Webhook".to_string(),
        webhook: Some(WebhookConversion {
            conversion_review_versions: vec!["v1".to_string()],
            client_config: Some(CrdWebhookClientConfig {
                service: Some(CrdServiceReference {
                    name: config.service.name.clone(),
                    namespace: config.service.namespace.clone(),
                    path: Some(CONVERSION_PATH.to_string()),
                    port: Some(WEBHOOK_SERVICE_PORT),
                }),
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                url: None,
            }),
        }),
    }
}

pub async fn ensure_validating_webhook(
    cluster: &impl ClusterClient,
    config: &Config,
    ca_bundle: &[u8],
) -> Result<()> {
    cluster::create_or_replace(cluster, validating_webhook_configuration(config, ca_bundle))
        .await
        .with_context(|_| UpdateValidatingWebhookSnafu {
            name: &config.validating_webhook_name,
        })?;
    Ok(())
}

/// Only the CA bundles are touched, the rest of the configuration is owned by the deployment manifests.
pub async fn patch_mutating_webhook(
    cluster: &impl ClusterClient,
    config: &Config,
    ca_bundle: &[u8],
) -> Result<()> {
    let name = &config.mutating_webhook_name;
    let Some(original) = cluster::get_opt::<MutatingWebhookConfiguration>(cluster, None, name)
        .await
        .with_context(|_| PatchMutatingWebhookSnafu { name })?
    else {
        info!(
            mutating_webhook = %name,
            "Mutating webhook configuration does not exist, not injecting CA bundle"
        );
        return Ok(());
    };
    let mut modified = original.clone();
    for webhook in modified.webhooks.iter_mut().flatten() {
        webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
    }
    let patched = cluster::merge_patch_from(cluster, &original, &modified)
        .await
        .with_context(|_| PatchMutatingWebhookSnafu { name })?;
    debug!(
        mutating_webhook = %name,
        changed = patched.is_some(),
        "Injected CA bundle into mutating webhook configuration"
    );
    Ok(())
}

pub async fn patch_conversion_webhook(
    cluster: &impl ClusterClient,
    config: &Config,
    ca_bundle: &[u8],
) -> Result<()> {
    let name = &config.pipeline_crd_name;
    let original = cluster::get_opt::<CustomResourceDefinition>(cluster, None, name)
        .await
        .with_context(|_| GetCrdSnafu { name })?
        .context(CrdNotFoundSnafu { name })?;
    let mut modified = original.clone();
    modified.spec.conversion = Some(conversion(config, ca_bundle));
    cluster::merge_patch_from(cluster, &original, &modified)
        .await
        .with_context(|_| PatchConversionWebhookSnafu { name })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook_cert::tests::test_config;

    #[test]
    fn validating_webhook_matches_fixture() {
        let expected: ValidatingWebhookConfiguration = serde_yaml::from_str(
            r#"
apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: telemetry-validating-webhook.kyma-project.io
  labels:
    control-plane: telemetry-manager
    app.kubernetes.io/instance: telemetry
    app.kubernetes.io/name: manager
    kyma-project.io/component: controller
webhooks:
- name: validation.logpipelines.telemetry.kyma-project.io
  admissionReviewVersions: [v1beta1, v1]
  clientConfig:
    caBundle: Y2E=
    service:
      name: telemetry-manager-webhook
      namespace: kyma-system
      path: /validate-logpipeline
      port: 443
  failurePolicy: Fail
  matchPolicy: Exact
  sideEffects: None
  timeoutSeconds: 15
  rules:
  - apiGroups: [telemetry.kyma-project.io]
    apiVersions: [v1alpha1]
    operations: [CREATE, UPDATE]
    resources: [logpipelines]
    scope: "*"
- name: validation.logparsers.telemetry.kyma-project.io
  admissionReviewVersions: [v1beta1, v1]
  clientConfig:
    caBundle: Y2E=
    service:
      name: telemetry-manager-webhook
      namespace: kyma-system
      path: /validate-logparser
      port: 443
  failurePolicy: Fail
  matchPolicy: Exact
  sideEffects: None
  timeoutSeconds: 15
  rules:
  - apiGroups: [telemetry.kyma-project.io]
    apiVersions: [v1alpha1]
    operations: [CREATE, UPDATE]
    resources: [logparsers]
    scope: "*"
"#,
        )
        .unwrap();
        let config = test_config("/unused".into());
        assert_eq!(validating_webhook_configuration(&config, b"ca"), expected);
    }

    #[test]
    fn conversion_points_at_webhook_service() {
        let config = test_config("/unused".into());
        let conversion = conversion(&config, b"ca");
        assert_eq!(conversion.strategy, "Webhook");
        let webhook = conversion.webhook.unwrap();
        assert_eq!(webhook.conversion_review_versions, vec!["v1"]);
        let client_config = webhook.client_config.unwrap();
        assert_eq!(client_config.ca_bundle, Some(ByteString(b"ca".to_vec())));
        let service = client_config.service.unwrap();
        assert_eq!(
            (
                service.name.as_str(),
                service.namespace.as_str(),
                service.path.as_deref(),
                service.port
            ),
            ("telemetry-manager-webhook", "kyma-system", Some("/convert"), Some(443))
        );
    }
}
