//! An Alertmanager-compatible endpoint that the self-monitor's Prometheus sends its alerts to.
//!
//! Every pipeline that an incoming alert concerns is sent to the subscriber for its signal type, usually the
//! pipeline's reconciler, so that its flow health is re-evaluated without waiting for the next resync.

use std::{collections::BTreeMap, future::Future, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{api::ApiResource, core::GroupVersionKind};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use super::rules::{matches_pipeline_rule, SignalType, RULES_ANY};
use crate::{
    cluster::{self, ClusterClient},
    error::{ClassifyError, FailureKind},
    utils::error_full_message,
};

/// Where Prometheus' Alertmanager client posts alerts.
pub const ALERTS_PATH: &str = "/api/v2/alerts";
pub const PIPELINE_API_VERSION: &str = "v1alpha1";
const CONTENT_SECURITY_POLICY: &str = "default-src 'self'";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind alert webhook to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("alert webhook server failed"))]
    Serve { source: std::io::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Bind { .. } => FailureKind::Fatal,
            Error::Serve { .. } => FailureKind::Fatal,
        }
    }
}

/// The part of an Alertmanager alert that is needed to attribute it.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedAlert {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait PipelineLister: Send + Sync {
    async fn pipeline_names(&self, signal: SignalType) -> Result<Vec<String>, cluster::Error>;
}

/// The pipeline custom resource for `signal`, for example `LogPipeline` in `telemetry.kyma-project.io`.
pub fn pipeline_resource(api_group: &str, signal: SignalType) -> ApiResource {
    let kind = format!("{signal}Pipeline");
    let plural = format!("{}s", kind.to_lowercase());
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(api_group, PIPELINE_API_VERSION, &kind),
        &plural,
    )
}

/// Lists the cluster-scoped pipeline resources of the telemetry API group.
pub struct ClusterPipelineLister<C> {
    cluster: C,
    api_group: String,
}

impl<C> ClusterPipelineLister<C> {
    pub fn new(cluster: C, api_group: impl Into<String>) -> Self {
        Self {
            cluster,
            api_group: api_group.into(),
        }
    }
}

#[async_trait]
impl<C: ClusterClient> PipelineLister for ClusterPipelineLister<C> {
    async fn pipeline_names(&self, signal: SignalType) -> Result<Vec<String>, cluster::Error> {
        cluster::list_names(
            &self.cluster,
            &pipeline_resource(&self.api_group, signal),
            None,
        )
        .await
    }
}

pub struct AlertWebhook<L> {
    lister: L,
    subscribers: Vec<(SignalType, mpsc::Sender<String>)>,
}

impl<L: PipelineLister + 'static> AlertWebhook<L> {
    pub fn new(lister: L) -> Self {
        Self {
            lister,
            subscribers: Vec::new(),
        }
    }

    /// Names of `signal` pipelines that alerts concern are sent to `subscriber`.
    pub fn with_subscriber(mut self, signal: SignalType, subscriber: mpsc::Sender<String>) -> Self {
        self.subscribers.push((signal, subscriber));
        self
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route(ALERTS_PATH, any(handle_alerts::<L>))
            .with_state(Arc::new(self))
    }

    /// Serves until `shutdown` completes.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!(%address, path = ALERTS_PATH, "Serving self-monitor alert webhook");
        }
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown)
            .await
            .context(ServeSnafu)
    }

    /// Sends every affected pipeline once to its subscriber.
    ///
    /// Listing failures only skip the affected signal type, the next alert notification retries.
    async fn notify(&self, alerts: &[PostedAlert]) {
        for (signal, subscriber) in &self.subscribers {
            let pipelines = match self.lister.pipeline_names(*signal).await {
                Ok(pipelines) => pipelines,
                Err(err) => {
                    warn!(
                        error = %error_full_message(&err),
                        %signal,
                        "Failed to list pipelines for alert notification"
                    );
                    continue;
                }
            };
            let affected = pipelines
                .into_iter()
                .filter(|pipeline| {
                    alerts.iter().any(|alert| {
                        matches_pipeline_rule(&alert.labels, RULES_ANY, pipeline, *signal)
                    })
                })
                .collect::<Vec<_>>();
            debug!(%signal, pipelines = ?affected, "Notifying subscriber about alerts");
            for pipeline in affected {
                if subscriber.send(pipeline).await.is_err() {
                    warn!(%signal, "Alert subscriber has gone away");
                    break;
                }
            }
        }
    }
}

pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .context(BindSnafu { address })
}

async fn handle_alerts<L: PipelineLister + 'static>(
    State(webhook): State<Arc<AlertWebhook<L>>>,
    method: Method,
    body: Bytes,
) -> Response {
    let status = if method != Method::POST {
        info!(%method, "Rejecting alert webhook call with invalid method");
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        match serde_json::from_slice::<Vec<PostedAlert>>(&body) {
            Ok(alerts) => {
                debug!(alerts = alerts.len(), "Received alerts from self-monitor");
                webhook.notify(&alerts).await;
                StatusCode::OK
            }
            Err(err) => {
                warn!(error = %err, "Failed to decode alerts from self-monitor");
                StatusCode::BAD_REQUEST
            }
        }
    };
    (
        status,
        [(header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY)],
    )
        .into_response()
}
