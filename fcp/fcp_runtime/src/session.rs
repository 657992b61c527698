//! Catalog negotiation.
//!
//! Both sides walk `NoSession -> AwaitingCatalogAck -> Active`. The server
//! holds no state beyond [`ServerSession`], which is serializable so a
//! stateless deployment can cache it per session id.

use crate::error::{FcpError, FcpResult};
use crate::schema::{
    CatalogAdditions, CatalogReference, DynamicUiPacket, EventPayload, LayoutUpdate, StateUpdate,
    UnknownCatalogError, WidgetCatalog,
};
use crate::update::Snapshot;
use crate::validate;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    NoSession,
    AwaitingCatalogAck,
    Active,
}

/// Any message the server may send in reply to an event.
///
/// Encoded with a `t` discriminator using the envelope names. Decoding
/// honours `t` when present; otherwise the variant is inferred from the
/// shape, and an update's kind from its operation tags. An untagged update
/// with no operations is ambiguous and rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", rename_all = "camelCase")]
pub enum ServerResponse {
    Packet(DynamicUiPacket),
    UnknownCatalog(UnknownCatalogError),
    StateUpdate(StateUpdate),
    LayoutUpdate(LayoutUpdate),
}

const RESPONSE_KINDS: &[&str] = &["packet", "unknownCatalog", "stateUpdate", "layoutUpdate"];
const STATE_OPS: &[&str] = &["patch", "listAppend", "listRemove", "listUpdate"];
const LAYOUT_OPS: &[&str] = &["add", "remove", "replace"];

impl<'de> Deserialize<'de> for ServerResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = Value::deserialize(deserializer)?;
        let explicit = value.as_object_mut().and_then(|map| map.remove("t"));
        let tag = match explicit {
            Some(Value::String(tag)) => tag,
            Some(other) => {
                return Err(D::Error::custom(format!("'t' must be a string, got {other}")));
            }
            None => infer_kind(&value).map_err(D::Error::custom)?.to_string(),
        };
        let decoded = match tag.as_str() {
            "packet" => serde_json::from_value(value).map(Self::Packet),
            "unknownCatalog" => serde_json::from_value(value).map(Self::UnknownCatalog),
            "stateUpdate" => serde_json::from_value(value).map(Self::StateUpdate),
            "layoutUpdate" => serde_json::from_value(value).map(Self::LayoutUpdate),
            other => return Err(D::Error::unknown_variant(other, RESPONSE_KINDS)),
        };
        decoded.map_err(D::Error::custom)
    }
}

fn infer_kind(value: &Value) -> Result<&'static str, String> {
    if value.get("layout").is_some() {
        return Ok("packet");
    }
    if value.get("error").is_some() {
        return Ok("unknownCatalog");
    }
    let Some(ops) = value.get("operations").and_then(Value::as_array) else {
        return Err("expected a packet, an update or an UnknownCatalog error".to_string());
    };
    let tags: Vec<&str> = ops
        .iter()
        .map(|op| op.get("op").and_then(Value::as_str).unwrap_or_default())
        .collect();
    if tags.is_empty() {
        return Err("update without operations needs a 't' discriminator".to_string());
    }
    if tags.iter().all(|tag| STATE_OPS.contains(tag)) {
        Ok("stateUpdate")
    } else if tags.iter().all(|tag| LAYOUT_OPS.contains(tag)) {
        Ok("layoutUpdate")
    } else {
        Err(format!("operations {tags:?} mix state and layout ops"))
    }
}

/// Catalogs the server can resolve by reference.
#[derive(Debug, Clone, Default)]
pub struct CatalogRegistry {
    catalogs: HashMap<String, WidgetCatalog>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reference: &CatalogReference, catalog: WidgetCatalog) {
        tracing::info!(%reference, "catalog registered");
        self.catalogs.insert(reference.key(), catalog);
    }

    pub fn get(&self, reference: &CatalogReference) -> Option<&WidgetCatalog> {
        self.catalogs.get(&reference.key())
    }

    pub fn contains(&self, reference: &CatalogReference) -> bool {
        self.catalogs.contains_key(&reference.key())
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

/// The UI-producing collaborator (an LLM flow in practice).
pub trait UiGenerator {
    fn initial_packet(
        &mut self,
        catalog: &WidgetCatalog,
        event: &EventPayload,
    ) -> FcpResult<DynamicUiPacket>;

    fn respond(
        &mut self,
        catalog: &WidgetCatalog,
        event: &EventPayload,
    ) -> FcpResult<ServerResponse>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSession {
    phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<CatalogReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    catalog: Option<WidgetCatalog>,
    /// The UI as of the last response sent, used to dry-run the next one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    view: Option<DynamicUiPacket>,
}

impl ServerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn catalog(&self) -> Option<&WidgetCatalog> {
        self.catalog.as_ref()
    }

    #[tracing::instrument(
        skip_all,
        fields(phase = ?self.phase, source = %event.source_node_id, event = %event.event_name)
    )]
    pub fn handle_event<G: UiGenerator>(
        &mut self,
        registry: &mut CatalogRegistry,
        generator: &mut G,
        event: &EventPayload,
    ) -> FcpResult<ServerResponse> {
        if self.phase == SessionPhase::Active {
            return self.respond(generator, event);
        }

        let mut candidate = match (&event.full_catalog, &event.catalog_reference) {
            (Some(full), reference) => {
                if let Some(reference) = reference.as_ref().or(self.reference.as_ref()) {
                    registry.register(reference, full.clone());
                }
                full.clone()
            }
            (None, Some(reference)) => {
                self.phase = SessionPhase::AwaitingCatalogAck;
                self.reference = Some(reference.clone());
                match registry.get(reference) {
                    Some(known) => known.clone(),
                    None => {
                        tracing::info!(%reference, "catalog reference not recognised");
                        return Ok(ServerResponse::UnknownCatalog(UnknownCatalogError::new(Some(
                            reference.clone(),
                        ))));
                    }
                }
            }
            (None, None) if self.phase == SessionPhase::AwaitingCatalogAck => {
                return Ok(ServerResponse::UnknownCatalog(UnknownCatalogError::new(
                    self.reference.clone(),
                )));
            }
            (None, None) => {
                return Err(FcpError::protocol(
                    "first event must carry catalogReference or fullCatalog",
                ));
            }
        };
        if let Some(additions) = &event.catalog_additions {
            candidate.extend(additions);
        }

        // Nothing is committed until the first packet exists and validates.
        let packet = generator.initial_packet(&candidate, event)?;
        validate::validate_packet(&packet, &candidate)?;
        self.activate(candidate, event.catalog_reference.clone(), packet.clone());
        Ok(ServerResponse::Packet(packet))
    }

    fn respond<G: UiGenerator>(
        &mut self,
        generator: &mut G,
        event: &EventPayload,
    ) -> FcpResult<ServerResponse> {
        let mut catalog = self
            .catalog
            .clone()
            .ok_or_else(|| FcpError::protocol("active session without a catalog"))?;
        if let Some(additions) = &event.catalog_additions {
            catalog.extend(additions);
        }
        let view = self
            .view
            .as_ref()
            .ok_or_else(|| FcpError::protocol("active session without a current view"))?;

        let response = generator.respond(&catalog, event)?;
        let next = dry_run(view, &catalog, &response)?;
        self.catalog = Some(catalog);
        self.view = Some(next);
        Ok(response)
    }

    fn activate(
        &mut self,
        catalog: WidgetCatalog,
        reference: Option<CatalogReference>,
        packet: DynamicUiPacket,
    ) {
        if reference.is_some() {
            self.reference = reference;
        }
        self.catalog = Some(catalog);
        self.view = Some(packet);
        self.phase = SessionPhase::Active;
        tracing::info!(reference = ?self.reference, "session active");
    }
}

/// Apply `response` to a copy of `view`, returning the UI the client will
/// hold once it accepts the response.
fn dry_run(
    view: &DynamicUiPacket,
    catalog: &WidgetCatalog,
    response: &ServerResponse,
) -> FcpResult<DynamicUiPacket> {
    match response {
        ServerResponse::Packet(packet) => {
            validate::validate_packet(packet, catalog)?;
            Ok(packet.clone())
        }
        ServerResponse::StateUpdate(update) => {
            let mut snapshot = Snapshot::new(view.layout.clone(), view.state.clone());
            snapshot.apply_state_update(update, catalog)?;
            Ok(snapshot.to_packet())
        }
        ServerResponse::LayoutUpdate(update) => {
            let mut snapshot = Snapshot::new(view.layout.clone(), view.state.clone());
            snapshot.apply_layout_update(update, catalog)?;
            Ok(snapshot.to_packet())
        }
        ServerResponse::UnknownCatalog(_) => Err(FcpError::protocol(
            "generator answered an active session with UnknownCatalog",
        )),
    }
}

/// What the client should do after a server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// Resend this event; it now carries the full catalog.
    Retry(EventPayload),
    /// The initial packet arrived; the session is active.
    Established,
    /// An update for an already active session.
    Update,
}

#[derive(Debug, Clone)]
pub struct ClientNegotiator {
    phase: SessionPhase,
    reference: CatalogReference,
    catalog: WidgetCatalog,
    additions: Option<CatalogAdditions>,
    pending: Option<EventPayload>,
}

impl ClientNegotiator {
    pub fn new(reference: CatalogReference, catalog: WidgetCatalog) -> Self {
        Self {
            phase: SessionPhase::NoSession,
            reference,
            catalog,
            additions: None,
            pending: None,
        }
    }

    pub fn with_additions(mut self, additions: CatalogAdditions) -> Self {
        self.additions = Some(additions).filter(|a| !a.is_empty());
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The catalog the session renders against: the base catalog plus additions.
    pub fn effective_catalog(&self) -> WidgetCatalog {
        let mut catalog = self.catalog.clone();
        if let Some(additions) = &self.additions {
            catalog.extend(additions);
        }
        catalog
    }

    /// Decorate an outgoing event with whatever the current phase requires.
    pub fn prepare(&mut self, mut event: EventPayload) -> EventPayload {
        if self.phase != SessionPhase::Active {
            event.catalog_reference = Some(self.reference.clone());
            event.catalog_additions = self.additions.clone();
            self.phase = SessionPhase::AwaitingCatalogAck;
            self.pending = Some(event.clone());
        }
        event
    }

    pub fn on_response(&mut self, response: &ServerResponse) -> FcpResult<Negotiation> {
        match (self.phase, response) {
            (SessionPhase::AwaitingCatalogAck, ServerResponse::UnknownCatalog(err)) => {
                tracing::info!(
                    message = %err.message,
                    "server lacks catalog; retrying with full catalog"
                );
                let mut retry = self
                    .pending
                    .clone()
                    .ok_or_else(|| FcpError::protocol("unknown catalog without a pending event"))?;
                retry.full_catalog = Some(self.catalog.clone());
                self.pending = Some(retry.clone());
                Ok(Negotiation::Retry(retry))
            }
            (SessionPhase::AwaitingCatalogAck, ServerResponse::Packet(_)) => {
                self.phase = SessionPhase::Active;
                self.pending = None;
                Ok(Negotiation::Established)
            }
            (SessionPhase::Active, ServerResponse::Packet(_)) => Ok(Negotiation::Established),
            (
                SessionPhase::Active,
                ServerResponse::StateUpdate(_) | ServerResponse::LayoutUpdate(_),
            ) => Ok(Negotiation::Update),
            (SessionPhase::Active, ServerResponse::UnknownCatalog(err)) => {
                Err(FcpError::UnknownCatalog(err.clone()))
            }
            (phase, _) => Err(FcpError::protocol(format!(
                "unexpected server response in phase {phase:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Layout, LayoutNode};
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

    struct Echo;

    impl UiGenerator for Echo {
        fn initial_packet(
            &mut self,
            _catalog: &WidgetCatalog,
            event: &EventPayload,
        ) -> FcpResult<DynamicUiPacket> {
            let layout = Layout::new(
                "t",
                vec![LayoutNode::new("t", "Text").with_property("data", json!(event.event_name))],
            )
            .map_err(|err| FcpError::protocol(err.to_string()))?;
            Ok(DynamicUiPacket::new(layout, json!({})))
        }

        fn respond(
            &mut self,
            _catalog: &WidgetCatalog,
            _event: &EventPayload,
        ) -> FcpResult<ServerResponse> {
            Ok(ServerResponse::StateUpdate(StateUpdate::default()))
        }
    }

    fn reference() -> CatalogReference {
        CatalogReference::new("shop", "1.0.0")
    }

    #[test]
    fn known_reference_activates_immediately() {
        let mut registry = CatalogRegistry::new();
        registry.register(&reference(), catalog());
        let mut session = ServerSession::new();

        let mut event = EventPayload::new("app", "start", "t0");
        event.catalog_reference = Some(reference());
        let response = session
            .handle_event(&mut registry, &mut Echo, &event)
            .expect("handle");
        assert!(matches!(response, ServerResponse::Packet(_)));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn unknown_reference_waits_for_full_catalog() {
        let mut registry = CatalogRegistry::new();
        let mut session = ServerSession::new();
        let mut event = EventPayload::new("app", "start", "t0");
        event.catalog_reference = Some(reference());

        let response = session.handle_event(&mut registry, &mut Echo, &event).expect("handle");
        assert!(matches!(
            &response,
            ServerResponse::UnknownCatalog(err) if err.error == "UnknownCatalog"
        ));
        assert_eq!(session.phase(), SessionPhase::AwaitingCatalogAck);

        event.full_catalog = Some(catalog());
        let response = session.handle_event(&mut registry, &mut Echo, &event).expect("retry");
        assert!(matches!(response, ServerResponse::Packet(_)));
        assert_eq!(session.phase(), SessionPhase::Active);
        assert!(registry.contains(&reference()));
    }

    #[test]
    fn first_event_without_catalog_is_a_protocol_error() {
        let mut session = ServerSession::new();
        let event = EventPayload::new("app", "start", "t0");
        let err = session
            .handle_event(&mut CatalogRegistry::new(), &mut Echo, &event)
            .expect_err("no catalog");
        assert!(matches!(err, FcpError::Protocol(_)));
        assert_eq!(session.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn active_session_forwards_events_and_merges_additions() {
        let mut registry = CatalogRegistry::new();
        registry.register(&reference(), catalog());
        let mut session = ServerSession::new();
        let mut first = EventPayload::new("app", "start", "t0");
        first.catalog_reference = Some(reference());
        session.handle_event(&mut registry, &mut Echo, &first).expect("start");

        let mut next = EventPayload::new("t", "tap", "t1");
        next.catalog_additions = Some(
            serde_json::from_value(json!({"items": {"Badge": {"properties": {"type": "object"}}}}))
                .expect("additions"),
        );
        let response = session.handle_event(&mut registry, &mut Echo, &next).expect("next");
        assert!(matches!(response, ServerResponse::StateUpdate(_)));
        assert!(session.catalog().expect("catalog").widget("Badge").is_some());
        assert!(registry.get(&reference()).expect("registered").widget("Badge").is_none());
    }

    #[test]
    fn invalid_generated_packet_is_rejected() {
        struct Broken;
        impl UiGenerator for Broken {
            fn initial_packet(
                &mut self,
                _: &WidgetCatalog,
                _: &EventPayload,
            ) -> FcpResult<DynamicUiPacket> {
                let layout = Layout::new("x", vec![LayoutNode::new("x", "Marquee")])
                    .map_err(|err| FcpError::protocol(err.to_string()))?;
                Ok(DynamicUiPacket::new(layout, json!({})))
            }
            fn respond(
                &mut self,
                _: &WidgetCatalog,
                _: &EventPayload,
            ) -> FcpResult<ServerResponse> {
                unreachable!("not active")
            }
        }

        let mut event = EventPayload::new("app", "start", "t0");
        event.full_catalog = Some(catalog());
        let err = ServerSession::new()
            .handle_event(&mut CatalogRegistry::new(), &mut Broken, &event)
            .expect_err("invalid packet");
        assert!(matches!(err, FcpError::Validation(_)));
    }

    /// Fails the first `initial_packet` call, then behaves like `Echo`.
    struct FlakyStart {
        failed: bool,
    }

    impl UiGenerator for FlakyStart {
        fn initial_packet(
            &mut self,
            catalog: &WidgetCatalog,
            event: &EventPayload,
        ) -> FcpResult<DynamicUiPacket> {
            if !self.failed {
                self.failed = true;
                return Err(FcpError::protocol("generator unavailable"));
            }
            Echo.initial_packet(catalog, event)
        }

        fn respond(
            &mut self,
            catalog: &WidgetCatalog,
            event: &EventPayload,
        ) -> FcpResult<ServerResponse> {
            Echo.respond(catalog, event)
        }
    }

    #[test]
    fn failed_first_packet_leaves_session_inactive() {
        let mut registry = CatalogRegistry::new();
        let mut session = ServerSession::new();
        let mut generator = FlakyStart { failed: false };
        let mut event = EventPayload::new("app", "start", "t0");
        event.full_catalog = Some(catalog());

        session
            .handle_event(&mut registry, &mut generator, &event)
            .expect_err("generator failure");
        assert_ne!(session.phase(), SessionPhase::Active);
        assert!(session.catalog().is_none());

        let response = session
            .handle_event(&mut registry, &mut generator, &event)
            .expect("retry");
        assert!(matches!(response, ServerResponse::Packet(_)));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn active_responses_are_checked_against_the_current_view() {
        struct Sloppy(ServerResponse);
        impl UiGenerator for Sloppy {
            fn initial_packet(
                &mut self,
                catalog: &WidgetCatalog,
                event: &EventPayload,
            ) -> FcpResult<DynamicUiPacket> {
                Echo.initial_packet(catalog, event)
            }
            fn respond(
                &mut self,
                _: &WidgetCatalog,
                _: &EventPayload,
            ) -> FcpResult<ServerResponse> {
                Ok(self.0.clone())
            }
        }

        let marquee: LayoutUpdate = serde_json::from_value(json!({
            "operations": [{"op": "add", "nodes": [{"id": "m", "type": "Marquee"}]}]
        }))
        .expect("layout update");
        let mut registry = CatalogRegistry::new();
        let mut session = ServerSession::new();
        let mut generator = Sloppy(ServerResponse::LayoutUpdate(marquee));
        let mut first = EventPayload::new("app", "start", "t0");
        first.full_catalog = Some(catalog());
        session.handle_event(&mut registry, &mut generator, &first).expect("start");
        let cached = session.clone();

        let tap = EventPayload::new("t", "tap", "t1");
        let err = session
            .handle_event(&mut registry, &mut generator, &tap)
            .expect_err("unknown widget");
        assert!(matches!(err, FcpError::Update(_)));
        assert_eq!(session, cached);

        let bad_path: StateUpdate = serde_json::from_value(json!({
            "operations": [{"op": "patch", "patchOp": "replace", "path": "/missing/x", "value": 1}]
        }))
        .expect("state update");
        generator.0 = ServerResponse::StateUpdate(bad_path);
        let err = session
            .handle_event(&mut registry, &mut generator, &tap)
            .expect_err("missing path");
        assert_eq!(err.code(), "update_rejected");

        generator.0 = ServerResponse::UnknownCatalog(UnknownCatalogError::new(None));
        let err = session
            .handle_event(&mut registry, &mut generator, &tap)
            .expect_err("unknown catalog while active");
        assert!(matches!(err, FcpError::Protocol(_)));
    }

    #[test]
    fn accepted_updates_advance_the_view() {
        /// Adds `/n` once, then only ever replaces it.
        struct Counter(u32);
        impl UiGenerator for Counter {
            fn initial_packet(
                &mut self,
                catalog: &WidgetCatalog,
                event: &EventPayload,
            ) -> FcpResult<DynamicUiPacket> {
                Echo.initial_packet(catalog, event)
            }
            fn respond(
                &mut self,
                _: &WidgetCatalog,
                _: &EventPayload,
            ) -> FcpResult<ServerResponse> {
                self.0 += 1;
                let kind = if self.0 == 1 { "add" } else { "replace" };
                let update = serde_json::from_value(json!({
                    "operations": [{"op": "patch", "patchOp": kind, "path": "/n", "value": self.0}]
                }))?;
                Ok(ServerResponse::StateUpdate(update))
            }
        }

        let mut registry = CatalogRegistry::new();
        let mut session = ServerSession::new();
        let mut counter = Counter(0);
        let mut first = EventPayload::new("app", "start", "t0");
        first.full_catalog = Some(catalog());
        session.handle_event(&mut registry, &mut counter, &first).expect("start");

        let tap = EventPayload::new("t", "tap", "t1");
        session.handle_event(&mut registry, &mut counter, &tap).expect("add");
        session.handle_event(&mut registry, &mut counter, &tap).expect("replace after add");
        assert_eq!(session.view.as_ref().map(|view| &view.state), Some(&json!({"n": 2})));
    }

    #[test]
    fn client_retries_with_full_catalog() {
        let mut client = ClientNegotiator::new(reference(), catalog());
        let first = client.prepare(EventPayload::new("app", "start", "t0"));
        assert_eq!(first.catalog_reference, Some(reference()));
        assert!(first.full_catalog.is_none());
        assert_eq!(client.phase(), SessionPhase::AwaitingCatalogAck);

        let unknown = ServerResponse::UnknownCatalog(UnknownCatalogError::new(Some(reference())));
        let Negotiation::Retry(retry) = client.on_response(&unknown).expect("retry")
        else {
            panic!("expected retry");
        };
        assert_eq!(retry.full_catalog, Some(catalog()));
        assert_eq!(retry.event_name, "start");

        let packet = DynamicUiPacket::new(Layout::new("t", vec![]).expect("layout"), json!({}));
        assert_eq!(
            client.on_response(&ServerResponse::Packet(packet)).expect("packet"),
            Negotiation::Established
        );
        assert_eq!(client.phase(), SessionPhase::Active);

        let later = client.prepare(EventPayload::new("t", "tap", "t1"));
        assert!(later.catalog_reference.is_none());
    }

    #[test]
    fn updates_before_activation_are_rejected() {
        let mut client = ClientNegotiator::new(reference(), catalog());
        let err = client
            .on_response(&ServerResponse::StateUpdate(StateUpdate::default()))
            .expect_err("not active");
        assert!(matches!(err, FcpError::Protocol(_)));
    }

    #[test]
    fn responses_infer_their_kind_from_shape() {
        let unknown: ServerResponse =
            serde_json::from_value(json!({"error": "UnknownCatalog", "message": "m"}))
                .expect("unknown");
        assert!(matches!(unknown, ServerResponse::UnknownCatalog(_)));

        let layout: ServerResponse = serde_json::from_value(json!({
            "operations": [{"op": "remove", "nodeIds": ["a"]}]
        }))
        .expect("layout update");
        assert!(matches!(layout, ServerResponse::LayoutUpdate(_)));

        let state: ServerResponse = serde_json::from_value(json!({
            "operations": [{"op": "listAppend", "path": "/xs", "items": []}]
        }))
        .expect("state update");
        assert!(matches!(state, ServerResponse::StateUpdate(_)));
    }

    #[test]
    fn ambiguous_untagged_updates_are_rejected() {
        assert!(serde_json::from_value::<ServerResponse>(json!({"operations": []})).is_err());
        assert!(
            serde_json::from_value::<ServerResponse>(json!({
                "operations": [
                    {"op": "remove", "nodeIds": ["a"]},
                    {"op": "listAppend", "path": "/xs", "items": []}
                ]
            }))
            .is_err()
        );

        let empty_layout: ServerResponse =
            serde_json::from_value(json!({"t": "layoutUpdate", "operations": []})).expect("tagged");
        assert_eq!(empty_layout, ServerResponse::LayoutUpdate(LayoutUpdate::default()));
    }

    #[test]
    fn every_response_kind_survives_encoding() {
        let layout = Layout::new("t", vec![]).expect("layout");
        let packet = DynamicUiPacket::new(layout, json!({"a": 1}));
        let responses = [
            ServerResponse::Packet(packet),
            ServerResponse::UnknownCatalog(UnknownCatalogError::new(Some(reference()))),
            ServerResponse::StateUpdate(StateUpdate::default()),
            ServerResponse::LayoutUpdate(LayoutUpdate::default()),
        ];
        for (response, tag) in responses.iter().zip(RESPONSE_KINDS) {
            let value = serde_json::to_value(response).expect("encode");
            assert_eq!(value["t"], *tag);
            let decoded: ServerResponse = serde_json::from_value(value).expect("decode");
            assert_eq!(&decoded, response);
        }
    }

    #[test]
    fn server_session_round_trips_for_external_caching() {
        let mut registry = CatalogRegistry::new();
        let mut session = ServerSession::new();
        let mut event = EventPayload::new("app", "start", "t0");
        event.catalog_reference = Some(reference());
        event.full_catalog = Some(catalog());
        session.handle_event(&mut registry, &mut Echo, &event).expect("start");

        let cached = serde_json::to_string(&session).expect("encode");
        let restored: ServerSession = serde_json::from_str(&cached).expect("decode");
        assert_eq!(restored, session);
        assert_eq!(restored.phase(), SessionPhase::Active);
    }
}
