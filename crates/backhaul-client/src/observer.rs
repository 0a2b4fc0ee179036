//! Dispatch observation
//!
//! The dispatcher reports every state transition and final outcome to a
//! [`DispatchObserver`] supplied at construction. [`TracingObserver`] logs
//! them; tests plug in their own to assert on outcomes.

use crate::dispatcher::{ConnectionInfo, ConnectionState, Outcome, Rejection};
use tracing::{debug, error, info, warn};

pub trait DispatchObserver: Send + Sync + 'static {
    fn on_transition(&self, _info: &ConnectionInfo, _from: ConnectionState, _to: ConnectionState) {}

    fn on_outcome(&self, info: &ConnectionInfo, outcome: &Outcome);
}

/// Logs transitions at debug level and outcomes by severity
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DispatchObserver for TracingObserver {
    fn on_transition(&self, info: &ConnectionInfo, from: ConnectionState, to: ConnectionState) {
        debug!(
            stream_id = info.stream_id,
            forwarded_by = %info.forwarded_by,
            "Stream {:?} -> {:?}",
            from,
            to
        );
    }

    fn on_outcome(&self, info: &ConnectionInfo, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { protocol, stats } => info!(
                stream_id = info.stream_id,
                forwarded_by = %info.forwarded_by,
                %protocol,
                to_backend = stats.to_backend,
                to_remote = stats.to_remote,
                "Stream completed"
            ),
            Outcome::Rejected(Rejection::Malformed(reason)) => warn!(
                stream_id = info.stream_id,
                forwarded_by = %info.forwarded_by,
                "Rejected malformed stream: {}",
                reason
            ),
            Outcome::Rejected(rejection) => warn!(
                stream_id = info.stream_id,
                forwarded_by = %info.forwarded_by,
                "Rejected stream: {}",
                rejection
            ),
            Outcome::Failed { protocol, error } => error!(
                stream_id = info.stream_id,
                forwarded_by = %info.forwarded_by,
                protocol = ?protocol,
                "Relay failed: {}",
                error
            ),
        }
    }
}
