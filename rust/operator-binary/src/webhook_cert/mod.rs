//! Self-managed PKI for the admission and conversion webhooks.
//!
//! The CA lives in a secret, the serving certificate in the operator's cert directory, and the CA bundle is
//! injected into every webhook configuration that needs to trust it.

use std::{path::PathBuf, sync::Arc};

use snafu::{ResultExt, Snafu};
use telemetry_operator_utils::reference::NamespacedName;
use tracing::info;

use self::{
    ca::{CaCertProvider, CaSecretStore},
    crypto::{ExpiryChecker, RsaCaGenerator, RsaServerCertGenerator, ServerCertRequest, X509ChainChecker},
    server::ServerCertProvider,
    storage::FsServerCertStorage,
};
use crate::{
    clock::Clock,
    cluster::ClusterClient,
    error::{ClassifyError, FailureKind},
};

pub mod ca;
pub mod configs;
pub mod crypto;
pub mod server;
pub mod storage;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to provide ca cert"))]
    ProvideCaCert { source: ca::Error },

    #[snafu(display("failed to provide server cert"))]
    ProvideServerCert { source: server::Error },

    #[snafu(display("failed to update webhook configurations"))]
    UpdateWebhookConfigs { source: configs::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::ProvideCaCert { source } => source.failure_kind(),
            Error::ProvideServerCert { source } => source.failure_kind(),
            Error::UpdateWebhookConfigs { source } => source.failure_kind(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the webhook server reads `tls.crt` and `tls.key` from.
    pub cert_dir: PathBuf,
    pub service: NamespacedName,
    pub ca_secret: NamespacedName,
    pub validating_webhook_name: String,
    pub mutating_webhook_name: String,
    pub pipeline_crd_name: String,
    /// Validated resources live in the API group `telemetry.<api_domain>`.
    pub api_domain: String,
    pub rsa_key_size: u32,
}

impl Config {
    pub fn api_group(&self) -> String {
        format!("telemetry.{}", self.api_domain)
    }

    /// The DNS host and alternative names that the serving certificate must cover.
    pub fn service_dns_names(&self) -> (String, Vec<String>) {
        let NamespacedName { namespace, name } = &self.service;
        let host = format!("{name}.{namespace}.svc");
        let alt_names = vec![
            name.clone(),
            format!("{name}.{namespace}"),
            format!("{host}.cluster.local"),
        ];
        (host, alt_names)
    }
}

pub struct WebhookCertReconciler<C, S> {
    cluster: C,
    config: Config,
    ca_provider: CaCertProvider<S>,
    server_provider: ServerCertProvider<FsServerCertStorage>,
}

impl<C: ClusterClient, S: CaSecretStore> WebhookCertReconciler<C, S> {
    pub fn new(cluster: C, ca_store: S, clock: Arc<dyn Clock>, config: Config) -> Self {
        let ca_provider = CaCertProvider {
            store: ca_store,
            generator: Arc::new(RsaCaGenerator {
                clock: clock.clone(),
                key_size: config.rsa_key_size,
            }),
            expiry_checker: Arc::new(ExpiryChecker {
                clock: clock.clone(),
                time_left: ca::CA_ROTATION_WINDOW,
            }),
            key_size: config.rsa_key_size,
        };
        let server_provider = ServerCertProvider {
            storage: FsServerCertStorage::new(&config.cert_dir),
            generator: Arc::new(RsaServerCertGenerator {
                clock: clock.clone(),
                key_size: config.rsa_key_size,
            }),
            ca_expiry_checker: Arc::new(ExpiryChecker {
                clock: clock.clone(),
                time_left: server::CA_EXPIRY_WINDOW,
            }),
            expiry_checker: Arc::new(ExpiryChecker {
                clock,
                time_left: server::CA_EXPIRY_WINDOW,
            }),
            chain_checker: Arc::new(X509ChainChecker),
        };
        Self {
            cluster,
            config,
            ca_provider,
            server_provider,
        }
    }

    /// Makes sure that a valid CA and serving certificate exist, and that all webhook configurations trust the CA.
    ///
    /// Running it twice in a row without anything expiring in between leaves the cluster and the cert directory
    /// untouched the second time.
    pub async fn ensure_certificate(&self) -> Result<()> {
        let ca = self
            .ca_provider
            .provide_cert()
            .await
            .context(ProvideCaCertSnafu)?;

        let (host, alt_names) = self.config.service_dns_names();
        self.server_provider
            .provide_cert(&ServerCertRequest {
                host: &host,
                alt_names: &alt_names,
                ca: &ca,
            })
            .await
            .context(ProvideServerCertSnafu)?;

        let ca_bundle = &ca.cert_pem;
        configs::ensure_validating_webhook(&self.cluster, &self.config, ca_bundle)
            .await
            .context(UpdateWebhookConfigsSnafu)?;
        configs::patch_mutating_webhook(&self.cluster, &self.config, ca_bundle)
            .await
            .context(UpdateWebhookConfigsSnafu)?;
        configs::patch_conversion_webhook(&self.cluster, &self.config, ca_bundle)
            .await
            .context(UpdateWebhookConfigsSnafu)?;

        info!(
            service = %self.config.service,
            cert_dir = %self.config.cert_dir.display(),
            "Webhook certificates are up to date"
        );
        Ok(())
    }
}
