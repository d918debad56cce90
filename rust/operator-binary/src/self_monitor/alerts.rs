//! Reduces the self-monitor's firing alerts into the single alert that a pipeline's health is derived from.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use super::{rules::LABEL_ALERT_NAME, Config};
use crate::{
    error::{ClassifyError, FailureKind},
    utils::error_full_message,
};

pub const ALERTS_PATH: &str = "/api/v1/alerts";
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub const SEVERITY_CRITICAL: &str = "critical";
const STATE_FIRING: &str = "firing";
const LABEL_SEVERITY: &str = "severity";
const LABEL_EXPORTER: &str = "exporter";
const LABEL_RECEIVER: &str = "receiver";

const EXPORTER_ALERTS: [&str; 3] = ["ExporterDropsMetric", "ExporterDropsSpans", "ExporterDropsLogs"];
const RECEIVER_ALERTS: [&str; 3] = ["ReceiverDropsMetric", "ReceiverDropsSpans", "ReceiverDropsLogs"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build HTTP client"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("failed to query alerts from {url:?}"))]
    QueryAlerts { source: reqwest::Error, url: String },

    #[snafu(display("failed to decode alerts from {url:?}"))]
    DecodeAlerts { source: reqwest::Error, url: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::BuildClient { .. } => FailureKind::Fatal,
            Error::QueryAlerts { .. } | Error::DecodeAlerts { .. } => FailureKind::TransportFailure,
        }
    }
}

/// The alert that currently determines a pipeline's health.
///
/// The default (all fields empty) means that nothing is firing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alert {
    pub name: String,
    pub severity: String,
    /// The collector pipeline component that the alert was raised for, if known.
    pub pipeline_info: String,
}

impl Alert {
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    /// Stands in for "the alerts could not be queried".
    pub fn unknown() -> Self {
        Self {
            name: Self::UNKNOWN_NAME.to_string(),
            ..Self::default()
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == Self::UNKNOWN_NAME
    }

    pub fn is_firing(&self) -> bool {
        !self.name.is_empty() && !self.is_unknown()
    }
}

/// One entry of Prometheus' `/api/v1/alerts` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrometheusAlert {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub state: String,
}

impl PrometheusAlert {
    pub fn is_firing(&self) -> bool {
        self.state == STATE_FIRING
    }

    fn label(&self, key: &str) -> &str {
        self.labels.get(key).map_or("", String::as_str)
    }

    fn name(&self) -> &str {
        self.label(LABEL_ALERT_NAME)
    }

    fn severity(&self) -> &str {
        self.label(LABEL_SEVERITY)
    }

    fn pipeline_info(&self) -> &str {
        let name = self.name();
        if EXPORTER_ALERTS.contains(&name) {
            self.label(LABEL_EXPORTER)
        } else if RECEIVER_ALERTS.contains(&name) {
            self.label(LABEL_RECEIVER)
        } else {
            ""
        }
    }
}

#[derive(Deserialize)]
struct AlertsResponse {
    data: AlertsData,
}

#[derive(Deserialize)]
struct AlertsData {
    #[serde(default)]
    alerts: Vec<PrometheusAlert>,
}

#[async_trait]
pub trait AlertGetter: Send + Sync {
    async fn alerts(&self) -> Result<Vec<PrometheusAlert>>;
}

pub struct PrometheusAlertGetter {
    client: reqwest::Client,
    url: String,
}

impl PrometheusAlertGetter {
    /// `base_url` is the self-monitor's service, for example `http://telemetry-self-monitor.kyma-system:9090`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(QUERY_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self {
            client,
            url: format!("{}{ALERTS_PATH}", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AlertGetter for PrometheusAlertGetter {
    async fn alerts(&self) -> Result<Vec<PrometheusAlert>> {
        let url = &self.url;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(QueryAlertsSnafu { url })?;
        let body: AlertsResponse = response
            .json()
            .await
            .context(DecodeAlertsSnafu { url })?;
        Ok(body.data.alerts)
    }
}

pub struct AlertReducer<G> {
    getter: G,
}

impl AlertReducer<PrometheusAlertGetter> {
    /// Queries the self-monitor that `config` deploys.
    pub fn for_self_monitor(config: &Config) -> Result<Self> {
        PrometheusAlertGetter::new(&config.base_url()).map(Self::new)
    }
}

impl<G: AlertGetter> AlertReducer<G> {
    pub fn new(getter: G) -> Self {
        Self { getter }
    }

    /// Picks the alert that should be surfaced next, given the one that is surfaced now.
    ///
    /// A critical `current` alert is kept for as long as it fires, otherwise critical alerts take precedence over
    /// all others.
    pub async fn query(&self, current: &Alert) -> Result<Alert> {
        let alerts = self.getter.alerts().await?;
        let firing = alerts
            .iter()
            .filter(|alert| alert.is_firing())
            .collect::<Vec<_>>();

        let next = if current.severity == SEVERITY_CRITICAL
            && firing.iter().any(|alert| alert.name() == current.name)
        {
            current.clone()
        } else if let Some(critical) = firing
            .iter()
            .find(|alert| alert.severity() == SEVERITY_CRITICAL)
        {
            Alert {
                name: critical.name().to_string(),
                severity: critical.severity().to_string(),
                pipeline_info: String::new(),
            }
        } else if let Some(first) = firing.first() {
            // Any firing alert is as good as any other here
            Alert {
                name: first.name().to_string(),
                severity: first.severity().to_string(),
                pipeline_info: first.pipeline_info().to_string(),
            }
        } else {
            Alert::default()
        };
        debug!(
            alerts.total = alerts.len(),
            alerts.firing = firing.len(),
            alert.name = %next.name,
            alert.severity = %next.severity,
            "Queried self-monitor alerts"
        );
        Ok(next)
    }

    /// Like [`Self::query`], but maps query failures to [`Alert::unknown`].
    pub async fn observe(&self, current: &Alert) -> Alert {
        match self.query(current).await {
            Ok(alert) => alert,
            Err(err) => {
                warn!(error = %error_full_message(&err), "Failed to query self-monitor alerts");
                Alert::unknown()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Canned response, `None` simulates an unreachable self-monitor.
    pub(crate) struct StaticAlerts(pub Option<Vec<PrometheusAlert>>);

    #[async_trait]
    impl AlertGetter for StaticAlerts {
        async fn alerts(&self) -> Result<Vec<PrometheusAlert>> {
            match &self.0 {
                Some(alerts) => Ok(alerts.clone()),
                None => {
                    // Port 1 is never listening
                    PrometheusAlertGetter::new("http://127.0.0.1:1")?.alerts().await
                }
            }
        }
    }

    pub(crate) fn alert(
        name: &str,
        severity: &str,
        state: &str,
        extra: &[(&str, &str)],
    ) -> PrometheusAlert {
        let mut labels: BTreeMap<String, String> = [
            (LABEL_ALERT_NAME.to_string(), name.to_string()),
            (LABEL_SEVERITY.to_string(), severity.to_string()),
        ]
        .into();
        labels.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        PrometheusAlert {
            labels,
            state: state.to_string(),
        }
    }

    fn current(name: &str, severity: &str) -> Alert {
        Alert {
            name: name.to_string(),
            severity: severity.to_string(),
            pipeline_info: "otlp/cls".to_string(),
        }
    }

    async fn reduce(alerts: Vec<PrometheusAlert>, current: &Alert) -> Alert {
        AlertReducer::new(StaticAlerts(Some(alerts)))
            .query(current)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn nothing_firing_clears_the_alert() {
        let pending = alert("ExporterDropsLogs", "critical", "pending", &[]);
        assert_eq!(reduce(vec![], &current("X", "critical")).await, Alert::default());
        assert_eq!(
            reduce(vec![pending], &current("ExporterDropsLogs", "critical")).await,
            Alert::default()
        );
    }

    #[tokio::test]
    async fn critical_alert_is_sticky_while_firing() {
        let sticky = current("GatewayAllDataDropped", "critical");
        let alerts = vec![
            alert("OtherCritical", "critical", "firing", &[]),
            alert("GatewayAllDataDropped", "critical", "firing", &[]),
        ];
        assert_eq!(reduce(alerts, &sticky).await, sticky);
    }

    #[tokio::test]
    async fn cleared_critical_alert_is_reevaluated() {
        let alerts = vec![alert("ExporterDropsSpans", "warning", "firing", &[("exporter", "otlp/b")])];
        assert_eq!(
            reduce(alerts, &current("GatewayAllDataDropped", "critical")).await,
            Alert {
                name: "ExporterDropsSpans".to_string(),
                severity: "warning".to_string(),
                pipeline_info: "otlp/b".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn critical_takes_precedence_over_warning() {
        let alerts = vec![
            alert("ExporterDropsLogs", "warning", "firing", &[("exporter", "otlp/a")]),
            alert("ExporterDropsMetric", "critical", "firing", &[("exporter", "otlp/b")]),
        ];
        assert_eq!(
            reduce(alerts, &current("ExporterDropsLogs", "warning")).await,
            Alert {
                name: "ExporterDropsMetric".to_string(),
                severity: "critical".to_string(),
                pipeline_info: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn pipeline_info_comes_from_exporter_or_receiver() {
        let receiver = vec![alert(
            "ReceiverDropsMetric",
            "warning",
            "firing",
            &[("receiver", "otlp"), ("exporter", "ignored")],
        )];
        assert_eq!(reduce(receiver, &Alert::default()).await.pipeline_info, "otlp");

        let other = vec![alert("GatewayThrottling", "info", "firing", &[("exporter", "otlp/a")])];
        assert_eq!(reduce(other, &Alert::default()).await.pipeline_info, "");

        let missing_label = vec![alert("ExporterDropsLogs", "warning", "firing", &[])];
        assert_eq!(reduce(missing_label, &Alert::default()).await.pipeline_info, "");
    }

    #[tokio::test]
    async fn unreachable_self_monitor_is_a_transport_failure() {
        let reducer = AlertReducer::new(StaticAlerts(None));
        let err = reducer.query(&Alert::default()).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::TransportFailure);
        assert_eq!(reducer.observe(&Alert::default()).await, Alert::unknown());
        assert!(Alert::unknown().is_unknown());
        assert!(!Alert::unknown().is_firing());
    }

    #[test]
    fn self_monitor_reducer_targets_its_service() {
        let reducer =
            AlertReducer::for_self_monitor(&crate::self_monitor::tests::test_config()).unwrap();
        assert_eq!(
            reducer.getter.url,
            "http://telemetry-self-monitor.kyma-system:9090/api/v1/alerts"
        );
    }

    #[tokio::test]
    async fn parses_prometheus_alerts_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0; 4096];
            let read = stream.read(&mut request).await.unwrap();
            let request = String::from_utf8_lossy(&request[..read]).to_string();
            let body = r#"{"status":"success","data":{"alerts":[{"labels":{"alertname":"ExporterDropsLogs","severity":"critical","exporter":"otlp/cls"},"annotations":{},"state":"firing","activeAt":"2024-01-01T00:00:00Z","value":"1e+00"}]}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            request
        });

        let getter = PrometheusAlertGetter::new(&format!("http://{addr}/")).unwrap();
        let alerts = getter.alerts().await.unwrap();
        assert_eq!(
            alerts,
            vec![alert(
                "ExporterDropsLogs",
                "critical",
                "firing",
                &[("exporter", "otlp/cls")]
            )]
        );
        assert!(server.await.unwrap().starts_with("GET /api/v1/alerts "));
    }
}
