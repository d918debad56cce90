use std::{path::PathBuf, sync::Arc};

use clap::{crate_description, crate_version, Parser};
use const_format::concatcp;
use stackable_operator::{logging::TracingTarget, time::Duration};
use telemetry_operator::{
    clock::SystemClock,
    cluster::KubeClusterClient,
    error::{ClassifyError, FailureKind},
    utils::error_full_message,
    webhook_cert::{self, ca::KubeCaSecretStore, crypto::DEFAULT_RSA_KEY_SIZE, WebhookCertReconciler},
};
use telemetry_operator_utils::reference::NamespacedName;
use tokio::signal::unix::{signal, SignalKind};

pub const APP_NAME: &str = "telemetry";
pub const OPERATOR_NAME: &str = concatcp!(APP_NAME, ".kyma-project.io");

/// How long to wait before retrying after a recoverable failure.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the operator
    Run(TelemetryOperatorRun),
}

#[derive(clap::Args)]
struct TelemetryOperatorRun {
    /// Directory that the webhook server loads its certificate from
    #[arg(long, env, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    cert_dir: PathBuf,
    /// Namespace of the webhook service and the CA secret
    #[arg(long, env, default_value = "kyma-system")]
    operator_namespace: String,
    #[arg(long, env, default_value = "telemetry-manager-webhook")]
    webhook_service_name: String,
    #[arg(long, env, default_value = "telemetry-webhook-cert")]
    ca_secret_name: String,
    #[arg(long, env, default_value = "telemetry-validating-webhook.kyma-project.io")]
    validating_webhook_name: String,
    #[arg(long, env, default_value = "telemetry-mutating-webhook.kyma-project.io")]
    mutating_webhook_name: String,
    /// The CRD whose conversion webhook is served by the operator
    #[arg(long, env, default_value = "logpipelines.telemetry.kyma-project.io")]
    pipeline_crd_name: String,
    #[arg(long, env, default_value = "kyma-project.io")]
    api_domain: String,
    #[arg(long, env, default_value_t = DEFAULT_RSA_KEY_SIZE)]
    rsa_key_size: u32,
    /// How often certificates are checked for expiry and drift
    #[arg(long, env, default_value = "1h")]
    cert_check_interval: Duration,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(TelemetryOperatorRun {
            cert_dir,
            operator_namespace,
            webhook_service_name,
            ca_secret_name,
            validating_webhook_name,
            mutating_webhook_name,
            pipeline_crd_name,
            api_domain,
            rsa_key_size,
            cert_check_interval,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "TELEMETRY_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;

            let config = webhook_cert::Config {
                cert_dir,
                service: NamespacedName::new(&operator_namespace, webhook_service_name),
                ca_secret: NamespacedName::new(&operator_namespace, ca_secret_name),
                validating_webhook_name,
                mutating_webhook_name,
                pipeline_crd_name,
                api_domain,
                rsa_key_size,
            };
            let reconciler = WebhookCertReconciler::new(
                KubeClusterClient::new(&client, OPERATOR_NAME),
                KubeCaSecretStore::new(&client, config.ca_secret.clone()),
                Arc::new(SystemClock),
                config,
            );

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut delay = std::time::Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        delay = match reconciler.ensure_certificate().await {
                            Ok(()) => *cert_check_interval,
                            Err(err) if err.failure_kind() == FailureKind::Fatal => return Err(err.into()),
                            Err(err) => {
                                tracing::warn!(
                                    error = %error_full_message(&err),
                                    failure_kind = %err.failure_kind(),
                                    retry_in = ?RETRY_DELAY,
                                    "Failed to ensure webhook certificates"
                                );
                                RETRY_DELAY
                            }
                        };
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, shutting down");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
