use pve_core::{ProposalId, ValidationResult, ValidationStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Summary of one completed run, sent fire-and-forget.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationEvent {
    pub proposal_id: ProposalId,
    pub status: ValidationStatus,
    pub issues: usize,
    pub blocking_issues: usize,
    pub execution_time_ms: u64,
    pub snapshot_version: u64,
    pub incomplete: bool,
}

impl ValidationEvent {
    pub fn from_result(result: &ValidationResult) -> Self {
        Self {
            proposal_id: result.proposal_id.clone(),
            status: result.status,
            issues: result.issues.len(),
            blocking_issues: result.issues.iter().filter(|i| i.severity.blocks()).count(),
            execution_time_ms: result.execution_time_ms,
            snapshot_version: result.snapshot_version,
            incomplete: result.incomplete,
        }
    }
}

/// Must return without waiting on the consumer.
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: ValidationEvent);
}

/// Writes events to the tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn emit(&self, event: ValidationEvent) {
        info!(
            proposal_id = %event.proposal_id,
            status = %event.status,
            issues = event.issues,
            blocking = event.blocking_issues,
            elapsed_ms = event.execution_time_ms,
            incomplete = event.incomplete,
            "validation completed"
        );
    }
}

/// Forwards events to a bounded channel; a full or closed channel drops the
/// event.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<ValidationEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ValidationEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ValidationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AnalyticsSink for ChannelSink {
    fn emit(&self, event: ValidationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "dropping analytics event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> ValidationEvent {
        ValidationEvent {
            proposal_id: "p-1".into(),
            status: ValidationStatus::Valid,
            issues: n,
            blocking_issues: 0,
            execution_time_ms: 1,
            snapshot_version: 1,
            incomplete: false,
        }
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::channel(1);
        sink.emit(event(1));
        sink.emit(event(2));
        assert_eq!(rx.recv().await.unwrap().issues, 1);
        assert!(rx.try_recv().is_err());
    }
}
