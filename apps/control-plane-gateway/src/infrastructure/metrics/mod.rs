//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Token gate**: admitted and rejected RPCs by class / reason
//! - **Listeners**: lifecycle state per listener
//! - **Enrollment**: node tokens issued and revoked
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::auth::{AuthRejection, MethodClass};
use crate::domain::lifecycle::ServerState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_rpc_admitted_total",
        "RPCs admitted by the token gate"
    );
    describe_counter!(
        "gateway_rpc_rejected_total",
        "RPCs rejected by the token gate before reaching a handler"
    );
    describe_gauge!(
        "gateway_listener_state",
        "Listener lifecycle state (0=created 1=starting 2=serving 3=draining 4=stopped)"
    );
    describe_counter!(
        "gateway_node_enrollments_total",
        "Node tokens issued through enrollment"
    );
    describe_counter!(
        "gateway_node_unregistrations_total",
        "Node tokens revoked through unregistration"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an RPC admitted by the token gate.
pub fn record_rpc_admitted(class: MethodClass) {
    counter!(
        "gateway_rpc_admitted_total",
        "class" => class.as_str()
    )
    .increment(1);
}

/// Record an RPC rejected by the token gate.
pub fn record_rpc_rejected(rejection: AuthRejection) {
    counter!(
        "gateway_rpc_rejected_total",
        "reason" => rejection.reason()
    )
    .increment(1);
}

/// Publish a listener's lifecycle state.
pub fn set_listener_state(listener: &'static str, state: ServerState) {
    gauge!(
        "gateway_listener_state",
        "listener" => listener
    )
    .set(f64::from(state.ordinal()));
}

/// Record a node token issued.
pub fn record_enrollment() {
    counter!("gateway_node_enrollments_total").increment(1);
}

/// Record a node token revoked.
pub fn record_unregistration() {
    counter!("gateway_node_unregistrations_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::auth::CredentialKind;

    #[test]
    fn init_is_idempotent_and_renders_gate_counters() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();

        record_rpc_rejected(AuthRejection::MissingToken(CredentialKind::Node));
        record_rpc_admitted(MethodClass::Enrollment);
        set_listener_state("peer", ServerState::Serving);

        let rendered = second.render();
        assert!(rendered.contains("gateway_rpc_rejected_total"));
        assert!(rendered.contains("reason=\"missing_node_token\""));
        assert!(first.render().contains("gateway_listener_state"));
        assert!(get_metrics_handle().is_some());
    }
}
