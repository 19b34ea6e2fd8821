// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue binding registry for the discovery server.
//!
//! Tracks which transports (`host:port`) consume (input) and produce
//! (output) each named queue, hands out ports to peers that ask for one, and
//! remembers which transport each session registered so it can be unbound
//! when the session goes away.
//!
//! The registry itself is not synchronized; the server keeps it behind a
//! single lock so every read-then-write sequence here runs atomically.

use super::protocol::{DiscoveryMessage, DiscoveryState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Canonical `"<host>:<port>"` identity of one peer endpoint.
pub type TransportId = String;

/// Case-sensitive queue name.
pub type QueueName = String;

/// First port handed out when peers ask for auto-assignment.
pub const DEFAULT_FIRST_PORT: u16 = 6000;

/// Opaque identity of one accepted connection (its remote address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for SessionId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of a queue a binding is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    /// Consumers reading from the queue.
    Input,
    /// Producers writing to the queue.
    Output,
}

/// Queue name -> set of bound transports.
///
/// A queue is present only while at least one transport is bound to it.
/// Serializes as a JSON object of sorted arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BindingTable {
    queues: BTreeMap<QueueName, BTreeSet<TransportId>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `transport` to `queue`. Returns false if it was already bound.
    pub fn bind(&mut self, queue: &str, transport: &str) -> bool {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .insert(transport.to_string())
    }

    /// Remove `transport` from every queue, dropping queues left empty.
    ///
    /// Returns the number of bindings removed.
    pub fn unbind_transport(&mut self, transport: &str) -> usize {
        let mut removed = 0;
        self.queues.retain(|_, bound| {
            if bound.remove(transport) {
                removed += 1;
            }
            !bound.is_empty()
        });
        removed
    }

    /// Transports bound to `queue`.
    pub fn get(&self, queue: &str) -> Option<&BTreeSet<TransportId>> {
        self.queues.get(queue)
    }

    pub fn contains_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    pub fn is_bound(&self, queue: &str, transport: &str) -> bool {
        self.queues
            .get(queue)
            .is_some_and(|bound| bound.contains(transport))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QueueName, &BTreeSet<TransportId>)> {
        self.queues.iter()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// JSON object `{"queue": ["host:port", ...], ...}`, keys sorted.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Registry of queue bindings, sessions and allocated ports.
#[derive(Debug)]
pub struct QueueRegistry {
    /// Consumer bindings
    inputs: BindingTable,

    /// Producer bindings
    outputs: BindingTable,

    /// Session -> transport it last registered
    sessions: HashMap<SessionId, TransportId>,

    /// Ports handed out or claimed; never released
    used_ports: HashSet<u16>,

    /// Auto-assignment cursor (u32 so it can step past 65535)
    next_port: u32,
}

impl QueueRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_first_port(DEFAULT_FIRST_PORT)
    }

    /// Create a registry whose auto-assigned ports start at `first_port`.
    pub fn with_first_port(first_port: u16) -> Self {
        Self {
            inputs: BindingTable::new(),
            outputs: BindingTable::new(),
            sessions: HashMap::new(),
            used_ports: HashSet::new(),
            next_port: u32::from(first_port),
        }
    }

    /// Apply one request and build its response.
    pub fn process(
        &mut self,
        session: &SessionId,
        msg: &DiscoveryMessage,
    ) -> Result<DiscoveryMessage, ProcessingFault> {
        match msg.state {
            DiscoveryState::Connect => Ok(DiscoveryMessage::new(
                DiscoveryState::Connect,
                0,
                msg.host.clone(),
                None,
            )),
            DiscoveryState::Register => {
                let port = self.register(session, &msg.host, msg.port)?;
                Ok(DiscoveryMessage::new(
                    DiscoveryState::Register,
                    port,
                    msg.host.clone(),
                    None,
                ))
            }
            DiscoveryState::GetInputQs => self.bind_and_snapshot(msg, QueueDirection::Input),
            DiscoveryState::GetOutputQs => self.bind_and_snapshot(msg, QueueDirection::Output),
            DiscoveryState::Error | DiscoveryState::Unknown(_) => {
                Err(ProcessingFault::UnknownState(msg.state.as_u8()))
            }
        }
    }

    /// Like [`process`](Self::process), but every fault becomes the wire-level
    /// `Error` response.
    pub fn respond(&mut self, session: &SessionId, msg: &DiscoveryMessage) -> DiscoveryMessage {
        self.process(session, msg)
            .unwrap_or_else(|_| DiscoveryMessage::error(msg.host.clone()))
    }

    /// Record `host:port` for `session`, picking a port when `requested` is 0.
    ///
    /// Explicit ports are accepted as-is, even if already in use.
    pub fn register(
        &mut self,
        session: &SessionId,
        host: &str,
        requested: u16,
    ) -> Result<u16, ProcessingFault> {
        let port = if requested == 0 {
            self.allocate_port()?
        } else {
            requested
        };
        self.used_ports.insert(port);

        let transport = format!("{}:{}", host, port);
        debug!("Session {} registered as {}", session, transport);
        self.sessions.insert(session.clone(), transport);
        Ok(port)
    }

    /// Lowest unused port at or above the cursor.
    fn allocate_port(&mut self) -> Result<u16, ProcessingFault> {
        loop {
            let candidate =
                u16::try_from(self.next_port).map_err(|_| ProcessingFault::PortsExhausted)?;
            if !self.used_ports.contains(&candidate) {
                return Ok(candidate);
            }
            self.next_port += 1;
        }
    }

    fn bind_and_snapshot(
        &mut self,
        msg: &DiscoveryMessage,
        direction: QueueDirection,
    ) -> Result<DiscoveryMessage, ProcessingFault> {
        if let Some(list) = msg.payload_str() {
            let queues = parse_queue_list(list)?;
            self.bind_queues(direction, &msg.transport_id(), &queues);
        }

        let payload = self.table(direction).to_json()?;
        Ok(DiscoveryMessage::new(
            msg.state,
            msg.port,
            msg.host.clone(),
            Some(payload),
        ))
    }

    /// Bind `transport` to each of `queues` on the given side.
    pub fn bind_queues<S: AsRef<str>>(
        &mut self,
        direction: QueueDirection,
        transport: &str,
        queues: &[S],
    ) {
        let table = match direction {
            QueueDirection::Input => &mut self.inputs,
            QueueDirection::Output => &mut self.outputs,
        };
        for queue in queues {
            table.bind(queue.as_ref(), transport);
        }
    }

    /// Drop everything bound by `session`. Unknown sessions are a no-op.
    ///
    /// Returns the transport that was unbound, if any.
    pub fn disconnect(&mut self, session: &SessionId) -> Option<TransportId> {
        let transport = self.sessions.remove(session)?;
        let removed =
            self.inputs.unbind_transport(&transport) + self.outputs.unbind_transport(&transport);
        debug!(
            "Session {} disconnected, removed {} bindings of {}",
            session, removed, transport
        );
        Some(transport)
    }

    pub fn table(&self, direction: QueueDirection) -> &BindingTable {
        match direction {
            QueueDirection::Input => &self.inputs,
            QueueDirection::Output => &self.outputs,
        }
    }

    pub fn input_queues(&self) -> &BindingTable {
        &self.inputs
    }

    pub fn output_queues(&self) -> &BindingTable {
        &self.outputs
    }

    /// Transport registered by `session`, if any.
    pub fn transport_for(&self, session: &SessionId) -> Option<&TransportId> {
        self.sessions.get(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current auto-assignment cursor.
    pub fn next_port(&self) -> u32 {
        self.next_port
    }

    pub fn is_port_used(&self, port: u16) -> bool {
        self.used_ports.contains(&port)
    }

    /// Save bindings to durable storage. Not implemented: state lives only
    /// for the life of the process.
    pub fn persist(&self) {
        debug!(
            "Persistence not supported, dropping {} input / {} output queues",
            self.inputs.queue_count(),
            self.outputs.queue_count()
        );
    }

    /// Load bindings from durable storage. Not implemented.
    pub fn restore(&mut self) {
        debug!("Persistence not supported, starting with an empty registry");
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a comma-separated queue list. Empty names reject the whole list.
fn parse_queue_list(list: &str) -> Result<Vec<&str>, ProcessingFault> {
    let queues: Vec<&str> = list.split(',').collect();
    if queues.iter().any(|q| q.is_empty()) {
        return Err(ProcessingFault::EmptyQueueName);
    }
    Ok(queues)
}

/// Failure to turn a request into a response. The session answers with an
/// `Error` message and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingFault {
    #[error("Unrecognized state tag {0}")]
    UnknownState(u8),

    #[error("Queue list contains an empty queue name")]
    EmptyQueueName,

    #[error("No free port left to assign")]
    PortsExhausted,

    #[error("Failed to encode binding table: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::protocol::BAD_MESSAGE_BODY;

    fn session(n: u16) -> SessionId {
        SessionId::from(SocketAddr::from(([127, 0, 0, 1], 50000 + n)))
    }

    #[test]
    fn test_registry_new() {
        let reg = QueueRegistry::new();
        assert_eq!(reg.session_count(), 0);
        assert!(reg.input_queues().is_empty());
        assert!(reg.output_queues().is_empty());
        assert_eq!(reg.next_port(), 6000);
    }

    #[test]
    fn test_connect_is_stateless() {
        let mut reg = QueueRegistry::new();
        let reply = reg
            .process(
                &session(1),
                &DiscoveryMessage::new(DiscoveryState::Connect, 1234, "h1", Some("x".into())),
            )
            .unwrap();

        assert_eq!(reply, DiscoveryMessage::connect("h1"));
        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.next_port(), 6000);
    }

    #[test]
    fn test_register_assigns_sequential_ports() {
        let mut reg = QueueRegistry::new();

        let r1 = reg
            .process(&session(1), &DiscoveryMessage::register("h1", 0))
            .unwrap();
        let r2 = reg
            .process(&session(2), &DiscoveryMessage::register("h2", 0))
            .unwrap();

        assert_eq!(r1.port, 6000);
        assert_eq!(r1.host, "h1");
        assert_eq!(r1.payload, None);
        assert_eq!(r2.port, 6001);
        assert_eq!(reg.transport_for(&session(1)).unwrap(), "h1:6000");
        assert_eq!(reg.transport_for(&session(2)).unwrap(), "h2:6001");
    }

    #[test]
    fn test_register_explicit_port_skipped_by_allocator() {
        let mut reg = QueueRegistry::new();
        reg.register(&session(1), "h1", 6000).unwrap();
        reg.register(&session(2), "h2", 6001).unwrap();

        assert_eq!(reg.register(&session(3), "h3", 0).unwrap(), 6002);
    }

    #[test]
    fn test_register_explicit_port_not_checked_for_conflict() {
        let mut reg = QueueRegistry::new();
        assert_eq!(reg.register(&session(1), "h1", 7000).unwrap(), 7000);
        assert_eq!(reg.register(&session(2), "h2", 7000).unwrap(), 7000);
        assert_eq!(reg.session_count(), 2);
    }

    #[test]
    fn test_register_ports_exhausted() {
        let mut reg = QueueRegistry::with_first_port(u16::MAX);
        assert_eq!(reg.register(&session(1), "h1", 0).unwrap(), u16::MAX);
        assert!(matches!(
            reg.register(&session(2), "h2", 0),
            Err(ProcessingFault::PortsExhausted)
        ));
    }

    #[test]
    fn test_reregister_replaces_session_transport() {
        let mut reg = QueueRegistry::new();
        reg.register(&session(1), "h1", 7000).unwrap();
        reg.register(&session(1), "h1", 7001).unwrap();
        assert_eq!(reg.transport_for(&session(1)).unwrap(), "h1:7001");
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn test_get_input_qs_binds_and_returns_table() {
        let mut reg = QueueRegistry::new();
        let reply = reg
            .process(
                &session(1),
                &DiscoveryMessage::get_input_qs("h1", 6000, &["orders", "fills"]),
            )
            .unwrap();

        assert_eq!(reply.state, DiscoveryState::GetInputQs);
        assert_eq!(reply.port, 6000);
        assert_eq!(
            reply.payload.as_deref(),
            Some(r#"{"fills":["h1:6000"],"orders":["h1:6000"]}"#)
        );
        assert!(reg.output_queues().is_empty());
    }

    #[test]
    fn test_get_output_qs_without_payload_is_poll() {
        let mut reg = QueueRegistry::new();
        reg.bind_queues(QueueDirection::Output, "h2:7000", &["orders"]);

        let reply = reg
            .process(&session(1), &DiscoveryMessage::get_output_qs("h9", 1, &[]))
            .unwrap();

        assert_eq!(reply.payload.as_deref(), Some(r#"{"orders":["h2:7000"]}"#));
        assert_eq!(reg.output_queues().queue_count(), 1);
    }

    #[test]
    fn test_empty_tables_serialize_as_empty_object() {
        let mut reg = QueueRegistry::new();
        let reply = reg
            .process(&session(1), &DiscoveryMessage::get_input_qs("h", 1, &[]))
            .unwrap();
        assert_eq!(reply.payload.as_deref(), Some("{}"));
    }

    #[test]
    fn test_bind_uses_message_transport_not_session() {
        let mut reg = QueueRegistry::new();
        reg.register(&session(1), "h1", 6000).unwrap();
        reg.process(
            &session(1),
            &DiscoveryMessage::get_input_qs("other", 9000, &["orders"]),
        )
        .unwrap();

        assert!(reg.input_queues().is_bound("orders", "other:9000"));
        assert!(!reg.input_queues().is_bound("orders", "h1:6000"));
    }

    #[test]
    fn test_binding_is_idempotent() {
        let mut reg = QueueRegistry::new();
        let msg = DiscoveryMessage::get_input_qs("h1", 6000, &["orders"]);
        reg.process(&session(1), &msg).unwrap();
        reg.process(&session(1), &msg).unwrap();

        let bound = reg.input_queues().get("orders").unwrap();
        assert_eq!(bound.len(), 1);
        assert!(bound.contains("h1:6000"));
    }

    #[test]
    fn test_queue_names_are_case_sensitive() {
        let mut reg = QueueRegistry::new();
        reg.bind_queues(QueueDirection::Input, "h1:1", &["Orders", "orders"]);
        assert_eq!(reg.input_queues().queue_count(), 2);
    }

    #[test]
    fn test_empty_queue_name_rejected() {
        let mut reg = QueueRegistry::new();
        let msg = DiscoveryMessage::new(
            DiscoveryState::GetInputQs,
            6000,
            "h1",
            Some("orders,,fills".into()),
        );

        assert!(matches!(
            reg.process(&session(1), &msg),
            Err(ProcessingFault::EmptyQueueName)
        ));
        assert!(reg.input_queues().is_empty());

        let reply = reg.respond(&session(1), &msg);
        assert_eq!(reply.state, DiscoveryState::Error);
    }

    #[test]
    fn test_unknown_state_yields_error_response() {
        let mut reg = QueueRegistry::new();
        let msg = DiscoveryMessage::new(DiscoveryState::Unknown(123), 5, "h1", None);

        assert!(matches!(
            reg.process(&session(1), &msg),
            Err(ProcessingFault::UnknownState(123))
        ));

        let reply = reg.respond(&session(1), &msg);
        assert_eq!(reply.state, DiscoveryState::Error);
        assert_eq!(reply.port, 0);
        assert_eq!(reply.host, "h1");
        assert_eq!(reply.payload.as_deref(), Some(BAD_MESSAGE_BODY));
    }

    #[test]
    fn test_error_state_as_request_rejected() {
        let mut reg = QueueRegistry::new();
        let reply = reg.respond(&session(1), &DiscoveryMessage::error("h1"));
        assert_eq!(reply.state, DiscoveryState::Error);
    }

    #[test]
    fn test_disconnect_removes_bindings_and_prunes_queues() {
        let mut reg = QueueRegistry::new();
        let reply = reg
            .process(&session(1), &DiscoveryMessage::register("h1", 0))
            .unwrap();
        assert_eq!(reply.port, 6000);

        reg.process(
            &session(1),
            &DiscoveryMessage::get_input_qs("h1", 6000, &["orders", "shared"]),
        )
        .unwrap();
        reg.process(
            &session(1),
            &DiscoveryMessage::get_output_qs("h1", 6000, &["fills"]),
        )
        .unwrap();
        reg.bind_queues(QueueDirection::Input, "h2:7000", &["shared"]);

        let removed = reg.disconnect(&session(1));
        assert_eq!(removed.as_deref(), Some("h1:6000"));

        assert!(!reg.input_queues().contains_queue("orders"));
        assert!(!reg.output_queues().contains_queue("fills"));
        let shared = reg.input_queues().get("shared").unwrap();
        assert_eq!(shared.len(), 1);
        assert!(shared.contains("h2:7000"));
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut reg = QueueRegistry::new();
        assert!(reg.disconnect(&session(1)).is_none());

        reg.register(&session(1), "h1", 0).unwrap();
        assert!(reg.disconnect(&session(1)).is_some());
        assert!(reg.disconnect(&session(1)).is_none());
    }

    #[test]
    fn test_ports_not_released_on_disconnect() {
        let mut reg = QueueRegistry::new();
        reg.register(&session(1), "h1", 0).unwrap();
        reg.disconnect(&session(1));

        assert!(reg.is_port_used(6000));
        assert_eq!(reg.register(&session(2), "h2", 0).unwrap(), 6001);
    }

    #[test]
    fn test_unbind_transport_counts_bindings() {
        let mut table = BindingTable::new();
        table.bind("a", "t1");
        table.bind("b", "t1");
        table.bind("b", "t2");

        assert_eq!(table.unbind_transport("t1"), 2);
        assert_eq!(table.queue_count(), 1);
        assert_eq!(table.unbind_transport("t1"), 0);
    }
}
