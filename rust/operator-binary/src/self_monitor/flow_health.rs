//! Per-pipeline verdicts over the alerts raised by the rules in [`super::rules`].

use snafu::{ResultExt, Snafu};
use tracing::debug;

use super::{
    alerts::{self, AlertGetter, PrometheusAlertGetter},
    rules::{
        matches_pipeline_rule, SignalType, RULE_AGENT_ALL_DATA_DROPPED, RULE_AGENT_SOME_DATA_DROPPED,
        RULE_FLUENT_BIT_ALL_DATA_DROPPED, RULE_FLUENT_BIT_BUFFER_IN_USE,
        RULE_FLUENT_BIT_NO_LOGS_DELIVERED, RULE_FLUENT_BIT_SOME_DATA_DROPPED,
        RULE_GATEWAY_ALL_DATA_DROPPED, RULE_GATEWAY_QUEUE_ALMOST_FULL, RULE_GATEWAY_SOME_DATA_DROPPED,
        RULE_GATEWAY_THROTTLING,
    },
    Config,
};
use crate::error::{ClassifyError, FailureKind};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to retrieve self-monitor alerts"))]
    RetrieveAlerts { source: alerts::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::RetrieveAlerts { source } => source.failure_kind(),
        }
    }
}

/// The component that moves a pipeline's data, each has its own set of rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTarget {
    Gateway(SignalType),
    Agent(SignalType),
    /// Always carries logs.
    FluentBit,
}

impl FlowTarget {
    fn signal(self) -> SignalType {
        match self {
            FlowTarget::Gateway(signal) | FlowTarget::Agent(signal) => signal,
            FlowTarget::FluentBit => SignalType::Log,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowHealth {
    pub all_data_dropped: bool,
    pub some_data_dropped: bool,
    /// The exporter queue (or Fluent Bit's filesystem buffer) is filling up.
    pub queue_almost_full: bool,
    pub throttling: bool,
    pub no_logs_delivered: bool,
    /// None of the above.
    pub healthy: bool,
}

impl FlowHealth {
    fn with_healthy(mut self) -> Self {
        self.healthy = !(self.all_data_dropped
            || self.some_data_dropped
            || self.queue_almost_full
            || self.throttling
            || self.no_logs_delivered);
        self
    }
}

pub struct FlowHealthChecker<G> {
    getter: G,
    target: FlowTarget,
}

impl FlowHealthChecker<PrometheusAlertGetter> {
    /// Checks against the self-monitor that `config` deploys.
    pub fn for_self_monitor(config: &Config, target: FlowTarget) -> Result<Self> {
        let getter = PrometheusAlertGetter::new(&config.base_url()).context(RetrieveAlertsSnafu)?;
        Ok(Self::new(getter, target))
    }
}

impl<G: AlertGetter> FlowHealthChecker<G> {
    pub fn new(getter: G, target: FlowTarget) -> Self {
        Self { getter, target }
    }

    /// Only firing alerts count. Alerts without a pipeline label count for every pipeline.
    pub async fn check(&self, pipeline_name: &str) -> Result<FlowHealth> {
        let alerts = self.getter.alerts().await.context(RetrieveAlertsSnafu)?;
        let firing = alerts
            .iter()
            .filter(|alert| alert.is_firing())
            .collect::<Vec<_>>();
        let signal = self.target.signal();
        let fires = |rule: &str| {
            firing
                .iter()
                .any(|alert| matches_pipeline_rule(&alert.labels, rule, pipeline_name, signal))
        };

        let health = match self.target {
            FlowTarget::Gateway(_) => FlowHealth {
                all_data_dropped: fires(RULE_GATEWAY_ALL_DATA_DROPPED),
                some_data_dropped: fires(RULE_GATEWAY_SOME_DATA_DROPPED),
                queue_almost_full: fires(RULE_GATEWAY_QUEUE_ALMOST_FULL),
                throttling: fires(RULE_GATEWAY_THROTTLING),
                ..FlowHealth::default()
            },
            FlowTarget::Agent(_) => FlowHealth {
                all_data_dropped: fires(RULE_AGENT_ALL_DATA_DROPPED),
                some_data_dropped: fires(RULE_AGENT_SOME_DATA_DROPPED),
                ..FlowHealth::default()
            },
            FlowTarget::FluentBit => FlowHealth {
                all_data_dropped: fires(RULE_FLUENT_BIT_ALL_DATA_DROPPED),
                some_data_dropped: fires(RULE_FLUENT_BIT_SOME_DATA_DROPPED),
                queue_almost_full: fires(RULE_FLUENT_BIT_BUFFER_IN_USE),
                no_logs_delivered: fires(RULE_FLUENT_BIT_NO_LOGS_DELIVERED),
                ..FlowHealth::default()
            },
        }
        .with_healthy();
        debug!(
            pipeline = pipeline_name,
            target = ?self.target,
            alerts.firing = firing.len(),
            ?health,
            "Checked telemetry flow health"
        );
        Ok(health)
    }
}
