pub mod binding;
pub mod error;
pub mod json_schema;
pub mod path;
pub mod protocol;
pub mod render;
pub mod schema;
pub mod session;
pub mod stream;
pub mod update;
pub mod validate;

use crate::protocol::{ack_envelope, event_envelope, ready_envelope, rejected_envelope};
use crate::session::{ClientNegotiator, Negotiation, ServerResponse};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;

pub use crate::error::{FcpError, FcpResult};
pub use crate::protocol::{
    CLIENT_TO_SERVER_CAP, ClientEnvelope, SERVER_TO_CLIENT_CAP, ServerEnvelope,
};
pub use crate::schema::{
    Binding, CatalogAdditions, CatalogReference, DynamicUiPacket, EventPayload, Layout, LayoutNode,
    LayoutUpdate, StateUpdate, UnknownCatalogError, WidgetCatalog,
};
pub use crate::update::{Snapshot, UnappliedItem};
pub use serde_json;

pub const OUTBOUND_QUEUE_CAP_ENV: &str = "FCP_OUTBOUND_QUEUE_CAP";
pub const INBOUND_QUEUE_CAP_ENV: &str = "FCP_INBOUND_QUEUE_CAP";
pub const DEFAULT_SID: &str = "S1";
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
pub const DEFAULT_INBOUND_QUEUE_CAP: usize = 64;

/// A decoded server frame, or the reason it could not be decoded.
pub type Inbound = Result<ServerEnvelope, FcpError>;

/// Producer half of the ordered update queue.
pub type UpdateSender = SyncSender<Inbound>;

/// Bounded queue feeding [`ClientModel::drain`]. Any number of producers may
/// decode concurrently; the single consumer applies in arrival order.
pub fn update_queue(capacity: usize) -> (UpdateSender, Receiver<Inbound>) {
    mpsc::sync_channel(capacity.max(1))
}

#[derive(Debug)]
pub enum Outcome {
    /// A packet or update was applied and acknowledged.
    Applied {
        rev: u64,
        changed_nodes: BTreeSet<String>,
        unapplied: Vec<UnappliedItem>,
    },
    /// The message was valid on the wire but could not be applied. The
    /// snapshot and revision are unchanged.
    Rejected { rev: u64, error: FcpError },
    /// The model was reset and a `ready` was requested.
    Resync { reason: String },
    /// The server reported an error.
    ServerError { code: String, message: String },
    /// The server does not know our catalog.
    UnknownCatalog(UnknownCatalogError),
    /// The frame did not decode and was dropped.
    Discarded(FcpError),
}

/// What the consumer produced for one inbound message.
#[derive(Debug)]
pub struct Handled {
    pub outcome: Outcome,
    pub reply: Option<ClientEnvelope>,
}

/// Client-side session state: the snapshot plus revision bookkeeping.
#[derive(Debug, Clone)]
pub struct ClientModel {
    sid: String,
    catalog: WidgetCatalog,
    negotiator: Option<ClientNegotiator>,
    snapshot: Option<Snapshot>,
    last_rev: Option<u64>,
    last_ack: Option<u64>,
    next_event_id: u64,
    resync_pending: bool,
}

impl ClientModel {
    pub fn new(sid: impl Into<String>, catalog: WidgetCatalog) -> Self {
        Self {
            sid: sid.into(),
            catalog,
            negotiator: None,
            snapshot: None,
            last_rev: None,
            last_ack: None,
            next_event_id: 1,
            resync_pending: false,
        }
    }

    /// Negotiate the catalog by reference before falling back to sending it in full.
    pub fn with_reference(
        mut self,
        reference: CatalogReference,
        additions: Option<CatalogAdditions>,
    ) -> Self {
        let mut negotiator = ClientNegotiator::new(reference, self.catalog.clone());
        if let Some(additions) = additions {
            negotiator = negotiator.with_additions(additions);
        }
        self.catalog = negotiator.effective_catalog();
        self.negotiator = Some(negotiator);
        self
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn catalog(&self) -> &WidgetCatalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn last_rev(&self) -> Option<u64> {
        self.last_rev
    }

    pub fn last_ack(&self) -> Option<u64> {
        self.last_ack
    }

    pub fn ready(&self) -> ClientEnvelope {
        ready_envelope(self.sid.clone())
    }

    /// Wrap a user event for sending, attaching catalog negotiation fields
    /// while the session is not yet active.
    pub fn event(&mut self, payload: EventPayload) -> ClientEnvelope {
        let payload = match &mut self.negotiator {
            Some(negotiator) => negotiator.prepare(payload),
            None => payload,
        };
        let id = self.next_event_id;
        self.next_event_id += 1;
        event_envelope(self.sid.clone(), id, payload)
    }

    pub fn validate_packet_rev(&self, rev: u64) -> Result<(), String> {
        match self.last_rev {
            Some(last_rev) if rev == last_rev.wrapping_add(1) => Ok(()),
            Some(last_rev) => Err(format!(
                "packet revision mismatch: rev={rev}, expected={}",
                last_rev.wrapping_add(1)
            )),
            None => Ok(()),
        }
    }

    pub fn validate_update_rev(&self, rev: u64) -> Result<(), String> {
        match self.last_rev {
            Some(last_rev) if rev == last_rev.wrapping_add(1) => Ok(()),
            Some(last_rev) => Err(format!(
                "update revision mismatch: rev={rev}, expected={}",
                last_rev.wrapping_add(1)
            )),
            None => Err(format!(
                "update received before initial packet: rev={rev}, expected initial packet"
            )),
        }
    }

    fn mark_applied_rev(&mut self, rev: u64) {
        self.last_rev = Some(rev);
        self.last_ack = Some(self.last_ack.map_or(rev, |ack| ack.max(rev)));
        self.resync_pending = false;
    }

    pub fn reset_for_resync(&mut self) {
        self.snapshot = None;
        self.last_rev = None;
        self.last_ack = None;
    }

    #[tracing::instrument(skip_all, fields(sid = %self.sid, last_rev = ?self.last_rev))]
    pub fn handle(&mut self, inbound: Inbound) -> Handled {
        let envelope = match inbound {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "discarding undecodable frame");
                return self.handled(Outcome::Discarded(err), None);
            }
        };

        if envelope.sid() != self.sid {
            let reason = format!("sid mismatch: got '{}', expected '{}'", envelope.sid(), self.sid);
            return self.resync(reason);
        }

        match envelope {
            ServerEnvelope::Packet { rev, packet, .. } => {
                if let Err(reason) = self.validate_packet_rev(rev) {
                    return self.resync(format!("invalid packet revision: {reason}"));
                }
                let response = ServerResponse::Packet(packet.clone());
                match Snapshot::from_packet(packet, &self.catalog) {
                    Ok(snapshot) => {
                        let changed_nodes =
                            snapshot.layout.nodes().map(|node| node.id.clone()).collect();
                        self.snapshot = Some(snapshot);
                        self.negotiate(&response);
                        self.applied(rev, changed_nodes, Vec::new())
                    }
                    Err(err) => self.rejected(rev, err.into()),
                }
            }
            ServerEnvelope::StateUpdate { rev, update, .. } => {
                if let Err(reason) = self.validate_update_rev(rev) {
                    return self.resync(format!("invalid update revision: {reason}"));
                }
                let Some(snapshot) = self.snapshot.as_mut() else {
                    return self.resync("state update without a snapshot".to_string());
                };
                match snapshot.apply_state_update(&update, &self.catalog) {
                    Ok(delta) => self.applied(rev, delta.changed_nodes, delta.unapplied),
                    Err(err) => self.rejected(rev, err.into()),
                }
            }
            ServerEnvelope::LayoutUpdate { rev, update, .. } => {
                if let Err(reason) = self.validate_update_rev(rev) {
                    return self.resync(format!("invalid update revision: {reason}"));
                }
                let Some(snapshot) = self.snapshot.as_mut() else {
                    return self.resync("layout update without a snapshot".to_string());
                };
                match snapshot.apply_layout_update(&update, &self.catalog) {
                    Ok(delta) => self.applied(rev, delta.changed_nodes, Vec::new()),
                    Err(err) => self.rejected(rev, err.into()),
                }
            }
            ServerEnvelope::UnknownCatalog { error, .. } => {
                let retry = match self.negotiate(&ServerResponse::UnknownCatalog(error.clone())) {
                    Some(Negotiation::Retry(payload)) => {
                        let id = self.next_event_id;
                        self.next_event_id += 1;
                        Some(event_envelope(self.sid.clone(), id, payload))
                    }
                    _ => None,
                };
                self.handled(Outcome::UnknownCatalog(error), retry)
            }
            ServerEnvelope::Error { rev, code, message, .. } => {
                tracing::warn!(?rev, %code, %message, "server error");
                if should_resync_for_error(&code) {
                    return self.resync(format!("server requested resync via error code '{code}'"));
                }
                self.handled(Outcome::ServerError { code, message }, None)
            }
        }
    }

    /// Apply every queued message in arrival order until all producers hang up.
    /// Replies go to `outbound`; each result is also handed to `on_handled`.
    pub fn drain<F>(
        &mut self,
        inbound: &Receiver<Inbound>,
        outbound: &SyncSender<ClientEnvelope>,
        mut on_handled: F,
    ) -> usize
    where
        F: FnMut(&ClientModel, &Outcome),
    {
        let mut processed = 0;
        for message in inbound.iter() {
            let handled = self.handle(message);
            if let Some(reply) = handled.reply {
                enqueue_control_envelope(outbound.clone(), reply);
            }
            on_handled(self, &handled.outcome);
            processed += 1;
        }
        processed
    }

    fn negotiate(&mut self, response: &ServerResponse) -> Option<Negotiation> {
        let negotiator = self.negotiator.as_mut()?;
        match negotiator.on_response(response) {
            Ok(step) => Some(step),
            Err(err) => {
                tracing::debug!(error = %err, "negotiation ignored server response");
                None
            }
        }
    }

    fn handled(&self, outcome: Outcome, reply: Option<ClientEnvelope>) -> Handled {
        Handled { outcome, reply }
    }

    fn applied(
        &mut self,
        rev: u64,
        changed_nodes: BTreeSet<String>,
        unapplied: Vec<UnappliedItem>,
    ) -> Handled {
        self.mark_applied_rev(rev);
        tracing::debug!(rev, changed = changed_nodes.len(), "applied");
        let reply = ack_envelope(self.sid.clone(), rev);
        self.handled(
            Outcome::Applied {
                rev,
                changed_nodes,
                unapplied,
            },
            Some(reply),
        )
    }

    fn rejected(&mut self, rev: u64, error: FcpError) -> Handled {
        tracing::warn!(rev, code = error.code(), error = %error, "rejected; snapshot unchanged");
        let reply = rejected_envelope(self.sid.clone(), rev, &error);
        self.handled(Outcome::Rejected { rev, error }, Some(reply))
    }

    fn resync(&mut self, reason: String) -> Handled {
        self.reset_for_resync();
        if self.resync_pending {
            tracing::debug!(%reason, "resync already pending");
            return self.handled(Outcome::Resync { reason }, None);
        }
        self.resync_pending = true;
        tracing::warn!(%reason, "requesting resync");
        let reply = self.ready();
        self.handled(Outcome::Resync { reason }, Some(reply))
    }
}

/// Queue a user event without blocking. When the queue is full the event is
/// dropped and counted.
pub fn send_event(
    tx: &SyncSender<ClientEnvelope>,
    envelope: ClientEnvelope,
    dropped_event_count: &AtomicU64,
    queue_capacity: usize,
) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(_envelope)) => {
            let dropped = dropped_event_count.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped.is_power_of_two() {
                tracing::warn!(
                    queue_capacity,
                    dropped,
                    "outbound event queue full; dropping event"
                );
            }
        }
        Err(TrySendError::Disconnected(_envelope)) => {
            tracing::warn!("failed to queue event: writer disconnected");
        }
    }
}

/// Acks, rejections and resync requests must not be lost; when the queue is
/// full they are handed to a helper thread that blocks on send.
fn enqueue_control_envelope(tx: SyncSender<ClientEnvelope>, envelope: ClientEnvelope) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(envelope)) => {
            tracing::warn!("outbound queue full; waiting to enqueue control envelope");
            thread::spawn(move || {
                if tx.send(envelope).is_err() {
                    tracing::warn!("failed to enqueue control envelope");
                }
            });
        }
        Err(TrySendError::Disconnected(_envelope)) => {
            tracing::warn!("failed to enqueue control envelope: writer disconnected");
        }
    }
}

pub fn should_resync_for_error(code: &str) -> bool {
    matches!(
        code,
        "decode_error" | "frame_too_large" | "invalid_envelope" | "resync_required" | "rev_mismatch"
    )
}

/// Positive integer from `var`, or `default` when unset or invalid.
pub fn parse_queue_capacity(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> WidgetCatalog {
        serde_json::from_value(json!({
            "catalogVersion": "1.0.0",
            "items": {"Text": {"properties": {
                "type": "object",
                "properties": {"data": {"type": "string"}}
            }}}
        }))
        .expect("catalog")
    }

    fn packet_envelope(rev: u64) -> Inbound {
        Ok(serde_json::from_value(json!({
            "t": "packet", "sid": "S1", "rev": rev,
            "packet": {
                "formatVersion": "1.0.0",
                "layout": {"root": "t", "nodes": [
                    {"id": "t", "type": "Text", "bindings": {"data": {"path": "msg"}}}
                ]},
                "state": {"msg": "hello", "items": []}
            }
        }))
        .expect("packet"))
    }

    fn state_envelope(rev: u64, ops: serde_json::Value) -> Inbound {
        Ok(serde_json::from_value(json!({
            "t": "stateUpdate", "sid": "S1", "rev": rev, "update": {"operations": ops}
        }))
        .expect("state update"))
    }

    #[test]
    fn packet_then_update_is_acked() {
        let mut model = ClientModel::new("S1", catalog());
        let handled = model.handle(packet_envelope(5));
        assert!(matches!(handled.outcome, Outcome::Applied { rev: 5, .. }));
        assert_eq!(handled.reply, Some(ack_envelope("S1".into(), 5)));

        let handled = model.handle(state_envelope(
            6,
            json!([{"op": "patch", "patchOp": "replace", "path": "/msg", "value": "bye"}]),
        ));
        let Outcome::Applied { changed_nodes, .. } = handled.outcome else {
            panic!("expected applied, got {:?}", handled.outcome);
        };
        assert!(changed_nodes.contains("t"));
        assert_eq!(model.last_rev(), Some(6));
        assert_eq!(model.last_ack(), Some(6));
        assert_eq!(model.snapshot().expect("snapshot").state["msg"], "bye");
    }

    #[test]
    fn update_before_packet_requests_resync() {
        let mut model = ClientModel::new("S1", catalog());
        let handled = model.handle(state_envelope(1, json!([])));
        assert!(matches!(handled.outcome, Outcome::Resync { .. }));
        assert_eq!(handled.reply, Some(model.ready()));

        let again = model.handle(state_envelope(2, json!([])));
        assert!(matches!(again.outcome, Outcome::Resync { .. }));
        assert!(again.reply.is_none(), "resync is requested once");
    }

    #[test]
    fn revision_gap_resets_model() {
        let mut model = ClientModel::new("S1", catalog());
        model.handle(packet_envelope(1));
        let handled = model.handle(state_envelope(3, json!([])));
        assert!(matches!(handled.outcome, Outcome::Resync { .. }));
        assert!(model.snapshot().is_none());
        assert_eq!(model.last_rev(), None);

        let handled = model.handle(packet_envelope(9));
        assert!(matches!(handled.outcome, Outcome::Applied { rev: 9, .. }));
    }

    #[test]
    fn failed_update_is_rejected_and_state_kept() {
        let mut model = ClientModel::new("S1", catalog());
        model.handle(packet_envelope(1));
        let handled = model.handle(state_envelope(
            2,
            json!([
                {"op": "listAppend", "path": "/items", "items": [1]},
                {"op": "patch", "patchOp": "replace", "path": "/missing/x", "value": 1}
            ]),
        ));
        assert!(matches!(handled.outcome, Outcome::Rejected { rev: 2, .. }));
        match handled.reply {
            Some(ClientEnvelope::Rejected { op_index, code, .. }) => {
                assert_eq!(op_index, Some(1));
                assert_eq!(code, "update_rejected");
            }
            other => panic!("expected rejected, got {other:?}"),
        }
        assert_eq!(model.last_rev(), Some(1));
        assert_eq!(model.snapshot().expect("snapshot").state["items"], json!([]));

        let handled = model.handle(state_envelope(2, json!([])));
        assert!(matches!(handled.outcome, Outcome::Applied { rev: 2, .. }));
    }

    #[test]
    fn malformed_frames_are_discarded() {
        let mut model = ClientModel::new("S1", catalog());
        model.handle(packet_envelope(1));
        let bad = protocol::decode_server_envelope(b"{\"t\":\"packet\"");
        let handled = model.handle(bad);
        assert!(matches!(handled.outcome, Outcome::Discarded(FcpError::MalformedPayload(_))));
        assert!(handled.reply.is_none());
        assert_eq!(model.last_rev(), Some(1));
        assert!(model.snapshot().is_some());
    }

    #[test]
    fn sid_mismatch_requests_resync() {
        let mut model = ClientModel::new("S2", catalog());
        let handled = model.handle(packet_envelope(1));
        assert!(matches!(handled.outcome, Outcome::Resync { .. }));
    }

    #[test]
    fn unknown_catalog_triggers_retry_event() {
        let mut model = ClientModel::new("S1", catalog())
            .with_reference(CatalogReference::new("shop", "1"), None);
        let first = model.event(EventPayload::new("app", "start", "t0"));
        let ClientEnvelope::Event { payload, id: 1, .. } = first else {
            panic!("expected event");
        };
        assert!(payload.full_catalog.is_none());

        let handled = model.handle(Ok(ServerEnvelope::UnknownCatalog {
            sid: "S1".into(),
            error: UnknownCatalogError::new(Some(CatalogReference::new("shop", "1"))),
        }));
        match handled.reply {
            Some(ClientEnvelope::Event { id, payload, .. }) => {
                assert_eq!(id, 2);
                assert_eq!(payload.full_catalog, Some(catalog()));
            }
            other => panic!("expected retry event, got {other:?}"),
        }
    }

    #[test]
    fn resync_error_codes_are_explicit() {
        assert!(should_resync_for_error("rev_mismatch"));
        assert!(should_resync_for_error("resync_required"));
        assert!(!should_resync_for_error("unknown_catalog"));

        let mut model = ClientModel::new("S1", catalog());
        let handled = model.handle(Ok(ServerEnvelope::Error {
            sid: "S1".into(),
            rev: None,
            code: "generation_failed".into(),
            message: "m".into(),
        }));
        assert!(matches!(handled.outcome, Outcome::ServerError { .. }));
    }

    #[test]
    fn drain_applies_in_arrival_order() {
        let (in_tx, in_rx) = update_queue(4);
        let (out_tx, out_rx) = mpsc::sync_channel(8);

        let producer = thread::spawn(move || {
            in_tx.send(packet_envelope(1)).expect("send");
            for rev in 2..=4 {
                let ops = json!([{"op": "listAppend", "path": "/items", "items": [rev]}]);
                in_tx.send(state_envelope(rev, ops)).expect("send");
            }
        });

        let mut model = ClientModel::new("S1", catalog());
        let mut revs = Vec::new();
        let processed = model.drain(&in_rx, &out_tx, |_, outcome| {
            if let Outcome::Applied { rev, .. } = outcome {
                revs.push(*rev);
            }
        });
        producer.join().expect("producer");

        assert_eq!(processed, 4);
        assert_eq!(revs, vec![1, 2, 3, 4]);
        assert_eq!(model.snapshot().expect("snapshot").state["items"], json!([2, 3, 4]));
        assert_eq!(out_rx.try_iter().count(), 4);
    }

    #[test]
    fn send_event_drops_when_queue_is_full() {
        let (tx, rx) = mpsc::sync_channel(1);
        let dropped = AtomicU64::new(0);
        tx.send(ready_envelope("S1".to_string())).expect("seed queue");

        let mut model = ClientModel::new("S1", catalog());
        send_event(&tx, model.event(EventPayload::new("t", "tap", "t0")), &dropped, 1);

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert!(matches!(rx.try_recv(), Ok(ClientEnvelope::Ready { .. })));
    }

    #[test]
    fn queue_capacity_ignores_invalid_values() {
        assert_eq!(parse_queue_capacity("FCP_TEST_UNSET_QUEUE_CAP", 7), 7);
    }
}
