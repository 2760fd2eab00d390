//! Propagation units: the transient work descriptors the scheduler hands to
//! the task queue.
//!
//! A unit carries ids and the geometry snapshots it needs, never a feature
//! copy to write back. Executing it always re-reads current state, so units
//! can be delivered twice or out of order.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use geosync_core::geometry::Geometry;
use geosync_core::id::{FeatureId, LayerId, RelationId};

/// Why a feature is being recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Reason {
    /// The feature's own geometry or editable properties changed.
    SelfChanged,
    /// The view over the feature's layer was (re)registered.
    SchemaChanged,
    /// A relation touching the feature's layer was created, redefined or
    /// deleted.
    RelationChanged { relation: RelationId },
    /// A feature on the other side of `relation` changed or was deleted.
    RelatedFeatureChanged {
        relation: RelationId,
        feature: FeatureId,
    },
}

/// Which computed properties a recomputation evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySelection {
    #[default]
    All,
    /// Only properties whose function queries related features.
    RelationalOnly,
    Keys(BTreeSet<String>),
}

impl PropertySelection {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PropertySelection::Keys(keys.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Recompute computed properties of one feature.
    Recompute {
        feature: FeatureId,
        reason: Reason,
        selection: PropertySelection,
    },
    /// Find the features related to `origin_feature` across `relation` and
    /// schedule their relation-dependent properties.
    ///
    /// `stale_geometry` is a geometry the feature no longer has (the one
    /// before a move, or the last one before deletion). Features related
    /// to it are reached as well, so they can drop the feature.
    UpdateDestinations {
        origin_feature: FeatureId,
        origin_layer: LayerId,
        relation: RelationId,
        stale_geometry: Option<Geometry>,
    },
    /// Schedule relation-dependent properties of every feature of the
    /// relation's origin layer.
    UpdateOrigins { relation: RelationId, reason: Reason },
    /// Schedule recomputation of every feature of `layer`. The layer is
    /// captured at scheduling time, so this still works after a relation
    /// named in `reason` has been deleted.
    RecomputeLayer {
        layer: LayerId,
        reason: Reason,
        selection: PropertySelection,
    },
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationUnit {
    pub id: Uuid,
    pub kind: UnitKind,
}

impl PropagationUnit {
    pub fn new(kind: UnitKind) -> Self {
        PropagationUnit {
            id: Uuid::new_v4(),
            kind,
        }
    }

    pub fn recompute(feature: FeatureId, reason: Reason, selection: PropertySelection) -> Self {
        Self::new(UnitKind::Recompute {
            feature,
            reason,
            selection,
        })
    }

    /// The feature a recompute unit targets.
    pub fn target_feature(&self) -> Option<FeatureId> {
        match &self.kind {
            UnitKind::Recompute { feature, .. } => Some(*feature),
            _ => None,
        }
    }

    pub fn is_self_recompute(&self) -> bool {
        matches!(
            self.kind,
            UnitKind::Recompute {
                reason: Reason::SelfChanged,
                ..
            }
        )
    }
}

impl fmt::Display for PropagationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            UnitKind::Recompute { feature, .. } => write!(f, "recompute({feature})"),
            UnitKind::UpdateDestinations {
                origin_feature,
                relation,
                ..
            } => write!(f, "update-destinations({origin_feature} via {relation})"),
            UnitKind::UpdateOrigins { relation, .. } => write!(f, "update-origins({relation})"),
            UnitKind::RecomputeLayer { layer, .. } => write!(f, "recompute-layer({layer})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_get_distinct_ids() {
        let a =
            PropagationUnit::recompute(FeatureId(1), Reason::SelfChanged, PropertySelection::All);
        let b =
            PropagationUnit::recompute(FeatureId(1), Reason::SelfChanged, PropertySelection::All);
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, b.kind);
        assert!(a.is_self_recompute());
        assert_eq!(a.target_feature(), Some(FeatureId(1)));
    }

    #[test]
    fn unit_serializes_with_kind_tag() {
        let unit = PropagationUnit::new(UnitKind::UpdateOrigins {
            relation: RelationId(3),
            reason: Reason::RelatedFeatureChanged {
                relation: RelationId(3),
                feature: FeatureId(9),
            },
        });
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["kind"]["kind"], "update_origins");
        assert_eq!(json["kind"]["reason"]["reason"], "related_feature_changed");
        let back: PropagationUnit = serde_json::from_value(json).unwrap();
        assert_eq!(back, unit);
    }
}
