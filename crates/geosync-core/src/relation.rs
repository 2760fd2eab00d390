//! Layer relations and the layer relation graph.
//!
//! A [`LayerRelation`] is a directed edge `origin -> destination` between
//! two layers, evaluated spatially. It is resolvable from either end: from
//! an origin feature it yields destination features and vice versa.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geometry::Geometry;
use crate::id::{LayerId, RelationId};

/// The spatial predicate of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelationType {
    Intersects,
    Distance { distance: f64 },
}

impl RelationType {
    /// Evaluates the predicate between two geometries. Symmetric.
    pub fn matches(&self, a: &Geometry, b: &Geometry) -> bool {
        match self {
            RelationType::Intersects => a.intersects(b),
            RelationType::Distance { distance } => a.distance(b) <= *distance,
        }
    }
}

/// A directed, spatially-evaluated edge between two layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRelation {
    pub id: RelationId,
    /// Name used by computation functions to address the relation.
    pub name: String,
    pub origin: LayerId,
    pub destination: LayerId,
    pub relation_type: RelationType,
}

impl LayerRelation {
    /// The layer on the other end of the relation as seen from `layer`.
    ///
    /// For a self-relation (origin == destination) this is the same layer.
    pub fn other_end(&self, layer: LayerId) -> Option<LayerId> {
        if layer == self.origin {
            Some(self.destination)
        } else if layer == self.destination {
            Some(self.origin)
        } else {
            None
        }
    }

    pub fn touches_layer(&self, layer: LayerId) -> bool {
        self.origin == layer || self.destination == layer
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidRelation {
                relation: self.id,
                reason: "relation name is empty".into(),
            });
        }
        if let RelationType::Distance { distance } = self.relation_type {
            if !distance.is_finite() || distance < 0.0 {
                return Err(CoreError::InvalidRelation {
                    relation: self.id,
                    reason: format!("distance must be a non-negative number, got {distance}"),
                });
            }
        }
        Ok(())
    }
}

/// Directed graph of layers (nodes) and relations (edges).
///
/// Answers "which relations start / end at this layer" and which layers a
/// change can cascade to.
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    graph: DiGraph<LayerId, RelationId>,
    layers: HashMap<LayerId, NodeIndex>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_relations<'a, I>(relations: I) -> Self
    where
        I: IntoIterator<Item = &'a LayerRelation>,
    {
        let mut graph = Self::new();
        for relation in relations {
            graph.add_relation(relation);
        }
        graph
    }

    fn layer_node(&mut self, layer: LayerId) -> NodeIndex {
        if let Some(&idx) = self.layers.get(&layer) {
            return idx;
        }
        let idx = self.graph.add_node(layer);
        self.layers.insert(layer, idx);
        idx
    }

    pub fn add_relation(&mut self, relation: &LayerRelation) {
        let from = self.layer_node(relation.origin);
        let to = self.layer_node(relation.destination);
        self.graph.add_edge(from, to, relation.id);
    }

    /// Removes every edge carrying `relation`. Layer nodes are kept.
    pub fn remove_relation(&mut self, relation: RelationId) {
        // Removing an edge moves the last edge into its slot, so remove
        // from the highest index down.
        let mut doomed: Vec<EdgeIndex> = self
            .graph
            .edge_indices()
            .filter(|&e| self.graph[e] == relation)
            .collect();
        doomed.sort_by(|a, b| b.cmp(a));
        for edge in doomed {
            self.graph.remove_edge(edge);
        }
    }

    /// Relations whose origin is `layer`, sorted by id.
    pub fn outgoing(&self, layer: LayerId) -> Vec<RelationId> {
        self.edges(layer, Direction::Outgoing)
    }

    /// Relations whose destination is `layer`, sorted by id.
    pub fn incoming(&self, layer: LayerId) -> Vec<RelationId> {
        self.edges(layer, Direction::Incoming)
    }

    fn edges(&self, layer: LayerId, direction: Direction) -> Vec<RelationId> {
        let Some(&idx) = self.layers.get(&layer) else {
            return Vec::new();
        };
        let mut ids: Vec<RelationId> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| *e.weight())
            .collect();
        ids.sort();
        ids
    }

    /// Layers whose features may need recomputation after a change in
    /// `layer`: the other end of every relation touching it.
    pub fn neighbour_layers(&self, layer: LayerId) -> Vec<LayerId> {
        let Some(&idx) = self.layers.get(&layer) else {
            return Vec::new();
        };
        let mut layers: Vec<LayerId> = self
            .graph
            .neighbors_undirected(idx)
            .map(|n| self.graph[n])
            .collect();
        layers.sort();
        layers.dedup();
        layers
    }

    pub fn relation_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The underlying petgraph graph, e.g. for DOT export.
    pub fn inner(&self) -> &DiGraph<LayerId, RelationId> {
        &self.graph
    }
}
