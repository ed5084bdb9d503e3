use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, Uri};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Decision posted by the external controller for a parked flow. Changes
/// replace the corresponding fields wholesale; drops install a synthetic 502
/// and skip upstream dispatch.
#[derive(Debug)]
pub enum InterceptDecision {
    ChangeRequest {
        method: String,
        url: Uri,
        headers: HeaderMap,
        body: Option<Bytes>,
    },
    ChangeResponse {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    DropRequest,
    DropResponse,
}

/// Per-flow rendezvous between the engine and an external controller,
/// indexed by flow UUID. Registration and resolution race safely: resolving
/// an unknown flow is reported to the caller instead of being dropped
/// silently.
#[derive(Debug, Default)]
pub struct InterceptHub {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<InterceptDecision>>>,
}

impl InterceptHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flows currently parked and awaiting a decision.
    pub fn pending_flows(&self) -> Vec<Uuid> {
        self.pending
            .lock()
            .expect("intercept hub lock")
            .keys()
            .copied()
            .collect()
    }

    /// Post a decision for a parked flow. Returns false when no flow with
    /// this id is waiting.
    pub fn resolve(&self, flow_id: Uuid, decision: InterceptDecision) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("intercept hub lock")
            .remove(&flow_id);
        match sender {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub(crate) fn register(&self, flow_id: Uuid) -> oneshot::Receiver<InterceptDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("intercept hub lock")
            .insert(flow_id, tx);
        rx
    }

    /// Unblock a parked flow with a canceled state (sender dropped).
    pub(crate) fn cancel(&self, flow_id: Uuid) {
        self.pending
            .lock()
            .expect("intercept hub lock")
            .remove(&flow_id);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{InterceptDecision, InterceptHub};

    #[tokio::test]
    async fn registered_flow_receives_the_posted_decision() {
        let hub = InterceptHub::new();
        let flow_id = Uuid::new_v4();
        let rx = hub.register(flow_id);
        assert_eq!(hub.pending_flows(), vec![flow_id]);

        assert!(hub.resolve(flow_id, InterceptDecision::DropRequest));
        match rx.await {
            Ok(InterceptDecision::DropRequest) => {}
            other => panic!("unexpected decision: {other:?}"),
        }
        assert!(hub.pending_flows().is_empty());
    }

    #[test]
    fn resolving_an_unknown_flow_reports_failure() {
        let hub = InterceptHub::new();
        assert!(!hub.resolve(Uuid::new_v4(), InterceptDecision::DropRequest));
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_receiver_with_an_error() {
        let hub = InterceptHub::new();
        let flow_id = Uuid::new_v4();
        let rx = hub.register(flow_id);
        hub.cancel(flow_id);
        assert!(rx.await.is_err());
    }
}
