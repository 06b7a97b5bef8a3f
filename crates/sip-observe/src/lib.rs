// warble-rs - The Warble SIP User Agent
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability hooks for SIP signaling.
//!
//! Provides a pluggable metrics sink for the user-agent core: request
//! submissions, received finals, session state transitions, and
//! registration outcomes.
//!
//! # Example
//! ```
//! use sip_observe::{set_signaling_metrics, TracingSignalingMetrics};
//! use std::sync::Arc;
//! set_signaling_metrics(Arc::new(TracingSignalingMetrics));
//! // Events automatically emitted via tracing
//! ```

use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Metrics sink used by the user-agent core to emit signaling events.
///
/// Implementations should treat `method` and `state` as low-cardinality
/// identifiers; `call_id` is per-dialog and belongs in logs, not in
/// aggregated metrics labels.
pub trait SignalingMetrics: Send + Sync + 'static {
    fn on_request_sent(&self, method: &str);
    fn on_final_response(&self, method: &str, code: u16);
    fn on_session_state(&self, call_id: &str, state: &str);
    fn on_register_outcome(&self, code: u16);
}

#[derive(Debug, Default)]
struct NoopSignalingMetrics;

impl SignalingMetrics for NoopSignalingMetrics {
    fn on_request_sent(&self, _method: &str) {}
    fn on_final_response(&self, _method: &str, _code: u16) {}
    fn on_session_state(&self, _call_id: &str, _state: &str) {}
    fn on_register_outcome(&self, _code: u16) {}
}

static SIGNALING_METRICS: OnceCell<Arc<dyn SignalingMetrics>> = OnceCell::new();
static NOOP_SIGNALING_METRICS: NoopSignalingMetrics = NoopSignalingMetrics;

/// Installs the global signaling metrics implementation.
///
/// Returns `true` if the metrics sink was installed, or `false` if it
/// was already configured.
pub fn set_signaling_metrics(metrics: Arc<dyn SignalingMetrics>) -> bool {
    SIGNALING_METRICS.set(metrics).is_ok()
}

/// Returns the currently configured signaling metrics sink.
pub fn signaling_metrics() -> &'static dyn SignalingMetrics {
    SIGNALING_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_SIGNALING_METRICS)
}

/// Simple metrics implementation that logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingSignalingMetrics;

impl SignalingMetrics for TracingSignalingMetrics {
    fn on_request_sent(&self, method: &str) {
        tracing::debug!(method, "request sent");
    }

    fn on_final_response(&self, method: &str, code: u16) {
        tracing::debug!(method, code, "final response");
    }

    fn on_session_state(&self, call_id: &str, state: &str) {
        tracing::debug!(call_id, state, "session state");
    }

    fn on_register_outcome(&self, code: u16) {
        tracing::debug!(code, "register outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sink_is_noop() {
        signaling_metrics().on_request_sent("INVITE");
        signaling_metrics().on_session_state("abc", "Confirmed");
    }
}
