// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph views derived from the binding tables.
//!
//! Three read-only views, rebuilt from scratch on every call:
//!
//! - [`BindingGraph`]: queue and server nodes with one edge per binding plus
//!   the routable producer -> queue -> consumer paths, for the live view.
//! - [`routing_digraph`]: the same routes as a DOT `digraph`.
//! - [`ChannelGraph`]: one node per peer address listing the queues it reads
//!   and writes.
//!
//! Node ids are sequence numbers assigned while building; they mean nothing
//! outside the graph that carries them.

use super::registry::{BindingTable, QueueName, TransportId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// A routable path: `producer` writes `queue`, `consumer` reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    pub producer: &'a TransportId,
    pub queue: &'a QueueName,
    pub consumer: &'a TransportId,
}

/// Every (producer, queue, consumer) triple.
///
/// Only queues bound on both sides are considered, and only when some
/// consumer of the queue is not also one of its producers.
pub fn routes<'a>(inputs: &'a BindingTable, outputs: &'a BindingTable) -> Vec<Route<'a>> {
    let mut found = Vec::new();
    for (queue, consumers) in inputs.iter() {
        let Some(producers) = outputs.get(queue) else {
            continue;
        };
        if consumers.is_subset(producers) {
            continue;
        }
        for producer in producers {
            for consumer in consumers {
                found.push(Route {
                    producer,
                    queue,
                    consumer,
                });
            }
        }
    }
    found
}

/// Node kind in the visualization schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A peer transport.
    Server,
    /// A queue.
    Database,
}

/// Node of the binding graph, in the shape the front end consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "group")]
    pub kind: NodeKind,
    /// Ids of nodes this one points at.
    pub connections: Vec<String>,
}

/// Queues, servers and the directed edges between them.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct BindingGraph {
    nodes: Vec<VisNode>,
}

impl BindingGraph {
    /// Build the graph from a consistent snapshot of both tables.
    ///
    /// Input bindings point queue -> server, output bindings server -> queue,
    /// then each route adds producer -> queue and queue -> consumer.
    pub fn build(inputs: &BindingTable, outputs: &BindingTable) -> Self {
        let mut builder = VisBuilder::default();

        for (queue, servers) in inputs.iter() {
            let q = builder.node(NodeKind::Database, queue);
            for server in servers {
                let s = builder.node(NodeKind::Server, server);
                builder.connect(q, s);
            }
        }

        for (queue, servers) in outputs.iter() {
            let q = builder.node(NodeKind::Database, queue);
            for server in servers {
                let s = builder.node(NodeKind::Server, server);
                builder.connect(s, q);
            }
        }

        for route in routes(inputs, outputs) {
            let consumer = builder.node(NodeKind::Server, route.consumer);
            let producer = builder.node(NodeKind::Server, route.producer);
            let queue = builder.node(NodeKind::Database, route.queue);
            builder.connect(queue, consumer);
            builder.connect(producer, queue);
        }

        Self {
            nodes: builder.nodes,
        }
    }

    pub fn nodes(&self) -> &[VisNode] {
        &self.nodes
    }

    /// Find a node by kind and label.
    pub fn node(&self, kind: NodeKind, label: &str) -> Option<&VisNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == kind && n.label == label)
    }

    /// All edges as `(from label, to label)`, duplicates included.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let by_id: HashMap<&str, &str> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.label.as_str()))
            .collect();

        self.nodes
            .iter()
            .flat_map(|n| {
                let by_id = &by_id;
                n.connections
                    .iter()
                    .filter_map(move |to| by_id.get(to.as_str()).map(|to| (n.label.as_str(), *to)))
            })
            .collect()
    }

    /// Number of edges from `from` to `to` (by label).
    pub fn edge_count(&self, from: &str, to: &str) -> usize {
        self.edges()
            .into_iter()
            .filter(|(f, t)| *f == from && *t == to)
            .count()
    }

    /// JSON array of nodes.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The graph wrapped in the `meshRoutes()` function the page script calls.
    pub fn to_script(&self) -> Result<String, serde_json::Error> {
        let mut script = String::from("    function meshRoutes() {\n    var inputData =\n    ");
        script.push_str(&self.to_json()?);
        script.push_str(";\nreturn inputData;\n}\n");
        Ok(script)
    }
}

#[derive(Default)]
struct VisBuilder {
    nodes: Vec<VisNode>,
    index: HashMap<(NodeKind, String), usize>,
}

impl VisBuilder {
    /// Index of the node for `(kind, label)`, created on first sight.
    fn node(&mut self, kind: NodeKind, label: &str) -> usize {
        if let Some(&idx) = self.index.get(&(kind, label.to_string())) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(VisNode {
            id: idx.to_string(),
            label: label.to_string(),
            kind,
            connections: Vec::new(),
        });
        self.index.insert((kind, label.to_string()), idx);
        idx
    }

    fn connect(&mut self, from: usize, to: usize) {
        let to_id = self.nodes[to].id.clone();
        self.nodes[from].connections.push(to_id);
    }
}

/// DOT digraph with one labeled edge per route.
///
/// ```text
/// digraph ROUTES {    "h2:7000"->"h1:6000" [label = "q:orders" ];}
/// ```
pub fn routing_digraph(inputs: &BindingTable, outputs: &BindingTable) -> String {
    let mut dot = String::from("digraph ROUTES {");
    for route in routes(inputs, outputs) {
        let _ = write!(
            dot,
            "    \"{}\"->\"{}\" [label = \"q:{}\" ];",
            route.producer, route.consumer, route.queue
        );
    }
    dot.push('}');
    dot
}

/// Named queue endpoint on a [`ChannelNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connector {
    pub name: String,
    pub label: String,
    /// True when the node reads the queue, false when it writes it.
    pub input: bool,
}

/// One peer address with the queues it consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelNode {
    pub id: usize,
    pub label: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub connectors: BTreeMap<String, Connector>,
}

impl ChannelNode {
    fn add_connector(&mut self, queue: &str, input: bool) {
        if input {
            self.inputs.push(queue.to_string());
        } else {
            self.outputs.push(queue.to_string());
        }
        self.connectors.insert(
            queue.to_string(),
            Connector {
                name: queue.to_string(),
                label: queue.to_string(),
                input,
            },
        );
    }
}

/// Per-peer connector view of the raw bindings.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ChannelGraph {
    nodes: Vec<ChannelNode>,
}

impl ChannelGraph {
    /// Build the view; inputs are visited before outputs.
    pub fn build(inputs: &BindingTable, outputs: &BindingTable) -> Self {
        let mut nodes: Vec<ChannelNode> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for (table, input) in [(inputs, true), (outputs, false)] {
            for (queue, servers) in table.iter() {
                for server in servers {
                    let idx = *index.entry(server.as_str()).or_insert_with(|| {
                        nodes.push(ChannelNode {
                            id: nodes.len(),
                            label: server.clone(),
                            name: server.clone(),
                            inputs: Vec::new(),
                            outputs: Vec::new(),
                            connectors: BTreeMap::new(),
                        });
                        nodes.len() - 1
                    });
                    nodes[idx].add_connector(queue, input);
                }
            }
        }

        Self { nodes }
    }

    pub fn nodes(&self) -> &[ChannelNode] {
        &self.nodes
    }

    /// JSON array of nodes.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
