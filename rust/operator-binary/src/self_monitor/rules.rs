//! The self-monitor's alerting rules, and attributing the alerts they raise to pipelines.
//!
//! Every rule name is prefixed with the [`SignalType`] of the pipelines it watches, and rules that concern a
//! single pipeline carry its name in the [`LABEL_PIPELINE_NAME`] label.

use std::collections::BTreeMap;

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use strum::{Display, IntoStaticStr};

use crate::error::{ClassifyError, FailureKind};

pub const LABEL_ALERT_NAME: &str = "alertname";
pub const LABEL_PIPELINE_NAME: &str = "pipeline_name";
const LABEL_SERVICE: &str = "service";
const LABEL_EXPORTER: &str = "exporter";
const LABEL_RECEIVER: &str = "receiver";
/// Fluent Bit names its outputs after the pipeline.
const LABEL_FLUENT_BIT_OUTPUT: &str = "name";

/// Matches every rule of a signal type.
pub const RULES_ANY: &str = "any";

pub const RULE_GATEWAY_ALL_DATA_DROPPED: &str = "GatewayAllDataDropped";
pub const RULE_GATEWAY_SOME_DATA_DROPPED: &str = "GatewaySomeDataDropped";
pub const RULE_GATEWAY_QUEUE_ALMOST_FULL: &str = "GatewayQueueAlmostFull";
pub const RULE_GATEWAY_THROTTLING: &str = "GatewayThrottling";

pub const RULE_AGENT_ALL_DATA_DROPPED: &str = "AgentAllDataDropped";
pub const RULE_AGENT_SOME_DATA_DROPPED: &str = "AgentSomeDataDropped";

pub const RULE_FLUENT_BIT_ALL_DATA_DROPPED: &str = "FluentBitAllDataDropped";
pub const RULE_FLUENT_BIT_SOME_DATA_DROPPED: &str = "FluentBitSomeDataDropped";
pub const RULE_FLUENT_BIT_BUFFER_IN_USE: &str = "FluentBitBufferInUse";
pub const RULE_FLUENT_BIT_NO_LOGS_DELIVERED: &str = "FluentBitNoLogsDelivered";

pub const DEFAULT_RULE_GROUP: &str = "default";

const METRIC_GATEWAY_SERVICE: &str = "telemetry-metric-gateway-metrics";
const METRIC_AGENT_SERVICE: &str = "telemetry-metric-agent-metrics";
const TRACE_GATEWAY_SERVICE: &str = "telemetry-trace-collector-metrics";
const LOG_GATEWAY_SERVICE: &str = "telemetry-log-gateway-metrics";
const LOG_AGENT_SERVICE: &str = "telemetry-log-agent-metrics";
const FLUENT_BIT_SERVICE: &str = "telemetry-fluent-bit-metrics";
const FLUENT_BIT_EXPORTER_SERVICE: &str = "telemetry-fluent-bit-exporter-metrics";

const RATE_WINDOW: &str = "5m";
const PENDING_FOR: &str = "1m";
/// Share of the exporter's sending queue above which it counts as almost full.
const QUEUE_ALMOST_FULL_RATIO: f64 = 0.8;
/// Fluent Bit's filesystem buffer usage in bytes above which it is considered in use.
const FLUENT_BIT_BUFFER_IN_USE_BYTES: u64 = 300_000_000;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to render alerting rules"))]
    RenderRules { source: serde_yaml::Error },
}

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::RenderRules { .. } => FailureKind::Fatal,
        }
    }
}

/// The kind of telemetry a pipeline carries. Alert rule names are prefixed with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum SignalType {
    Metric,
    Trace,
    Log,
}

impl SignalType {
    pub fn rule_name(self, unprefixed: &str) -> String {
        format!("{self}{unprefixed}")
    }

    /// Suffix of the collector metrics that count this signal's items.
    fn data_type(self) -> &'static str {
        match self {
            SignalType::Metric => "metric_points_total",
            SignalType::Trace => "spans_total",
            SignalType::Log => "log_records_total",
        }
    }
}

/// Contents of a Prometheus rule file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleGroups {
    pub groups: Vec<RuleGroup>,
}

/// Rules that are evaluated together, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub alert: String,
    pub expr: String,
    #[serde(rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Rule {
    fn new(alert: String, expr: String) -> Self {
        Self {
            alert,
            expr,
            for_: Some(PENDING_FOR.to_string()),
            labels: BTreeMap::new(),
        }
    }
}

impl RuleGroups {
    /// Renders the rules as the contents of `alerting_rules.yml`.
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).context(RenderRulesSnafu)
    }
}

/// The rules that the self-monitor evaluates for all OTel Collector gateways and agents, and for Fluent Bit.
pub fn make_rules() -> RuleGroups {
    let mut rules = Vec::new();

    let metric_gateway = CollectorRuleBuilder::new(SignalType::Metric, METRIC_GATEWAY_SERVICE);
    rules.extend(metric_gateway.gateway_rules());
    let metric_agent = CollectorRuleBuilder::new(SignalType::Metric, METRIC_AGENT_SERVICE);
    rules.extend(metric_agent.agent_rules());

    let trace_gateway = CollectorRuleBuilder::new(SignalType::Trace, TRACE_GATEWAY_SERVICE);
    rules.extend(trace_gateway.gateway_rules());

    let log_gateway = CollectorRuleBuilder::new(SignalType::Log, LOG_GATEWAY_SERVICE);
    rules.extend(log_gateway.gateway_rules());
    let log_agent = CollectorRuleBuilder::new(SignalType::Log, LOG_AGENT_SERVICE);
    rules.extend(log_agent.agent_rules());

    rules.extend(fluent_bit_rules());

    RuleGroups {
        groups: vec![RuleGroup {
            name: DEFAULT_RULE_GROUP.to_string(),
            rules,
        }],
    }
}

/// Rules over the self-observability metrics of one OTel Collector deployment.
struct CollectorRuleBuilder {
    signal: SignalType,
    service: &'static str,
}

impl CollectorRuleBuilder {
    fn new(signal: SignalType, service: &'static str) -> Self {
        Self { signal, service }
    }

    fn gateway_rules(&self) -> Vec<Rule> {
        vec![
            self.all_data_dropped(RULE_GATEWAY_ALL_DATA_DROPPED),
            self.some_data_dropped(RULE_GATEWAY_SOME_DATA_DROPPED),
            self.queue_almost_full(),
            self.throttling(),
        ]
    }

    fn agent_rules(&self) -> Vec<Rule> {
        vec![
            self.all_data_dropped(RULE_AGENT_ALL_DATA_DROPPED),
            self.some_data_dropped(RULE_AGENT_SOME_DATA_DROPPED),
        ]
    }

    fn selector(&self) -> String {
        format!("{{{LABEL_SERVICE}=\"{}\"}}", self.service)
    }

    /// Per-pipeline rate of an exporter counter, the pipeline name is taken from the exporter ID `<type>/<name>`.
    fn exporter_rate(&self, counter: &str) -> String {
        format!(
            "sum by ({LABEL_PIPELINE_NAME}) (label_replace(rate(otelcol_exporter_{counter}_{data_type}{selector}[{RATE_WINDOW}]), \"{LABEL_PIPELINE_NAME}\", \"$1\", \"{LABEL_EXPORTER}\", \"[^/]+/(.+)\"))",
            data_type = self.signal.data_type(),
            selector = self.selector(),
        )
    }

    fn failed(&self) -> String {
        format!(
            "({} > 0 or {} > 0)",
            self.exporter_rate("send_failed"),
            self.exporter_rate("enqueue_failed")
        )
    }

    fn all_data_dropped(&self, rule: &str) -> Rule {
        let expr = format!("{} unless ({} > 0)", self.failed(), self.exporter_rate("sent"));
        Rule::new(self.signal.rule_name(rule), expr)
    }

    fn some_data_dropped(&self, rule: &str) -> Rule {
        let expr = format!("{} and ({} > 0)", self.failed(), self.exporter_rate("sent"));
        Rule::new(self.signal.rule_name(rule), expr)
    }

    fn queue_almost_full(&self) -> Rule {
        let selector = self.selector();
        let expr = format!(
            "max by ({LABEL_PIPELINE_NAME}) (label_replace(otelcol_exporter_queue_size{selector} / otelcol_exporter_queue_capacity{selector}, \"{LABEL_PIPELINE_NAME}\", \"$1\", \"{LABEL_EXPORTER}\", \"[^/]+/(.+)\")) > {QUEUE_ALMOST_FULL_RATIO}"
        );
        Rule::new(self.signal.rule_name(RULE_GATEWAY_QUEUE_ALMOST_FULL), expr)
    }

    /// Refusals happen before routing, so they are not attributed to a pipeline.
    fn throttling(&self) -> Rule {
        let expr = format!(
            "sum by ({LABEL_RECEIVER}) (rate(otelcol_receiver_refused_{data_type}{selector}[{RATE_WINDOW}])) > 0",
            data_type = self.signal.data_type(),
            selector = self.selector(),
        );
        Rule::new(self.signal.rule_name(RULE_GATEWAY_THROTTLING), expr)
    }
}

fn fluent_bit_rate(counter: &str) -> String {
    format!(
        "sum by ({LABEL_PIPELINE_NAME}) (label_replace(rate(fluentbit_output_{counter}{{{LABEL_SERVICE}=\"{FLUENT_BIT_SERVICE}\"}}[{RATE_WINDOW}]), \"{LABEL_PIPELINE_NAME}\", \"$1\", \"{LABEL_FLUENT_BIT_OUTPUT}\", \"(.+)\"))"
    )
}

fn fluent_bit_rules() -> Vec<Rule> {
    let log = SignalType::Log;
    let sent = fluent_bit_rate("proc_bytes_total");
    let dropped = fluent_bit_rate("dropped_records_total");
    vec![
        Rule::new(
            log.rule_name(RULE_FLUENT_BIT_ALL_DATA_DROPPED),
            format!("({dropped} > 0) unless ({sent} > 0)"),
        ),
        Rule::new(
            log.rule_name(RULE_FLUENT_BIT_SOME_DATA_DROPPED),
            format!("({dropped} > 0) and ({sent} > 0)"),
        ),
        Rule::new(
            log.rule_name(RULE_FLUENT_BIT_BUFFER_IN_USE),
            format!(
                "telemetry_fsbuffer_usage_bytes{{{LABEL_SERVICE}=\"{FLUENT_BIT_EXPORTER_SERVICE}\"}} > {FLUENT_BIT_BUFFER_IN_USE_BYTES}"
            ),
        ),
        Rule::new(
            log.rule_name(RULE_FLUENT_BIT_NO_LOGS_DELIVERED),
            format!("{sent} == 0"),
        ),
    ]
}

/// Whether the alert with `labels` was raised by `rule` (or by any rule, see [`RULES_ANY`]) for the pipeline
/// `pipeline_name` of type `signal`.
///
/// Alerts that aren't attributed to a specific pipeline concern all pipelines of their signal type.
pub fn matches_pipeline_rule(
    labels: &BTreeMap<String, String>,
    rule: &str,
    pipeline_name: &str,
    signal: SignalType,
) -> bool {
    let Some(alert_name) = labels.get(LABEL_ALERT_NAME) else {
        return false;
    };
    let prefix: &'static str = signal.into();
    let Some(unprefixed) = alert_name.strip_prefix(prefix) else {
        return false;
    };
    if rule != RULES_ANY && unprefixed != rule {
        return false;
    }
    labels
        .get(LABEL_PIPELINE_NAME)
        .map_or(true, |pipeline| pipeline == pipeline_name)
}
