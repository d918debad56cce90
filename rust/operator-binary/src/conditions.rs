//! Status conditions that pipelines report about admission and telemetry flow health.

use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use strum::{Display, IntoStaticStr};

use crate::{
    error::{ClassifyError, FailureKind},
    resource_lock,
    self_monitor::flow_health::{self, FlowHealth},
};

pub const TYPE_CONFIGURATION_GENERATED: &str = "ConfigurationGenerated";
pub const TYPE_FLOW_HEALTHY: &str = "TelemetryFlowHealthy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Reason {
    ConfigurationGenerated,
    MaxPipelinesExceeded,
    ValidationFailed,
    ConfigurationNotGenerated,
    FlowHealthy,
    AllDataDropped,
    SomeDataDropped,
    BufferFillingUp,
    Throttling,
    NoLogsDelivered,
    ProbingFailed,
}

impl Reason {
    fn message(self) -> &'static str {
        match self {
            Reason::ConfigurationGenerated => "Pipeline configuration was generated successfully",
            Reason::MaxPipelinesExceeded => "Maximum pipeline count limit exceeded",
            Reason::ValidationFailed => {
                "Pipeline validation failed due to an error from the Kubernetes API server"
            }
            Reason::ConfigurationNotGenerated => {
                "No pipeline instance deployed because the configuration could not be generated"
            }
            Reason::FlowHealthy => "No problems detected in the telemetry flow",
            Reason::AllDataDropped => "Backend is not reachable or rejecting data. All data is dropped",
            Reason::SomeDataDropped => "Backend is reachable, but rejecting data. Some data is dropped",
            Reason::BufferFillingUp => {
                "Buffer nearing capacity. Incoming data rate exceeds export rate"
            }
            Reason::Throttling => "Gateway is unable to receive data at current rate",
            Reason::NoLogsDelivered => "Backend is not reachable or rejecting logs. No logs are delivered",
            Reason::ProbingFailed => {
                "Could not determine the health of the telemetry flow because the self monitor probing failed"
            }
        }
    }
}

fn condition(
    type_: &str,
    status: ConditionStatus,
    reason: Reason,
    message: String,
    observed_generation: Option<i64>,
    now: &Time,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation,
        last_transition_time: now.clone(),
    }
}

/// Upper-cases the first character, so that error messages read like condition messages.
fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Whether the pipeline was admitted by the pipeline-count lock.
pub fn admission_condition(
    admission: &Result<(), resource_lock::Error>,
    observed_generation: Option<i64>,
    now: &Time,
) -> Condition {
    let (status, reason, message) = match admission {
        Ok(()) => (
            ConditionStatus::True,
            Reason::ConfigurationGenerated,
            Reason::ConfigurationGenerated.message().to_string(),
        ),
        Err(err) if err.failure_kind() == FailureKind::LockInUse => (
            ConditionStatus::False,
            Reason::MaxPipelinesExceeded,
            capitalize(&err.to_string()),
        ),
        Err(_) => (
            ConditionStatus::False,
            Reason::ValidationFailed,
            Reason::ValidationFailed.message().to_string(),
        ),
    };
    condition(
        TYPE_CONFIGURATION_GENERATED,
        status,
        reason,
        message,
        observed_generation,
        now,
    )
}

/// The most severe problem wins, data loss before backpressure.
fn flow_reason(health: &FlowHealth) -> Reason {
    if health.all_data_dropped {
        Reason::AllDataDropped
    } else if health.some_data_dropped {
        Reason::SomeDataDropped
    } else if health.no_logs_delivered {
        Reason::NoLogsDelivered
    } else if health.queue_almost_full {
        Reason::BufferFillingUp
    } else if health.throttling {
        Reason::Throttling
    } else {
        Reason::FlowHealthy
    }
}

/// Health of the telemetry flow, as reported by the self-monitor's alerts for the pipeline.
pub fn flow_healthy_condition(
    configuration_generated: bool,
    health: &Result<FlowHealth, flow_health::Error>,
    observed_generation: Option<i64>,
    now: &Time,
) -> Condition {
    let (status, reason) = match health {
        _ if !configuration_generated => (ConditionStatus::False, Reason::ConfigurationNotGenerated),
        Err(_) => (ConditionStatus::Unknown, Reason::ProbingFailed),
        Ok(health) if health.healthy => (ConditionStatus::True, Reason::FlowHealthy),
        Ok(health) => (ConditionStatus::False, flow_reason(health)),
    };
    condition(
        TYPE_FLOW_HEALTHY,
        status,
        reason,
        reason.message().to_string(),
        observed_generation,
        now,
    )
}

/// Inserts `new`, or replaces the condition of the same type.
///
/// The transition time of the existing condition is kept when its status did not change.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            let last_transition_time = if existing.status == new.status {
                existing.last_transition_time.clone()
            } else {
                new.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}
