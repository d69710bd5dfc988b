//! Definitions of celestial bodies and the validated body hierarchy.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
};

use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    kepler::{OrbitalElements, ReferenceFrame},
    time::UT,
};

/// NAIF-style numeric body identifier.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BodyId(pub i32);

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    Star,
    Planet,
    Moon,
    Barycenter,
}

impl BodyKind {
    /// Infer the kind of a body from NAIF numbering conventions.
    pub fn from_naif(id: BodyId) -> Self {
        match id.0 {
            0..=9 => BodyKind::Barycenter,
            10 => BodyKind::Star,
            id if id >= 100 && id % 100 == 99 => BodyKind::Planet,
            _ => BodyKind::Moon,
        }
    }
}

/// Key under which an external dynamics source publishes a body's
/// parent-relative state.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExternalSourceHandle(pub BodyId);

/// How a body's position relative to its parent is obtained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Positioning {
    /// Coincident with the parent. The root is always `Fixed`.
    Fixed,
    /// Propagated from canonical elements about the parent.
    Absolute(OrbitalElements),
    /// Supplied by an external dynamics source in the parent's equatorial
    /// frame. `fallback` is propagated while no sample is available.
    Relative {
        source: ExternalSourceHandle,
        fallback: Option<OrbitalElements>,
    },
    /// Balances its siblings about the parent barycenter.
    Counterweight,
}

/// Spin of a body about its pole.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationModel {
    /// Sidereal rotation period (s); negative for retrograde rotation.
    pub period: Option<f64>,
    /// Spin angle at `epoch` (rad).
    pub offset: f64,
    pub epoch: UT,
    /// Rotation taking the body's spin-axis frame to world axes.
    pub pole: UnitQuaternion<f64>,
}

impl Default for RotationModel {
    fn default() -> Self {
        Self {
            period: None,
            offset: 0.0,
            epoch: UT::J2000,
            pole: UnitQuaternion::identity(),
        }
    }
}

impl RotationModel {
    /// Usable rotation period, if any.
    pub fn spin_period(&self) -> Option<f64> {
        self.period.filter(|p| p.is_finite() && *p != 0.0)
    }

    /// Spin angle `2π·frac((t − epoch)/period) + offset`, or `None` when the
    /// period is zero or undefined.
    pub fn spin_angle(&self, time: UT) -> Option<f64> {
        let period = self.spin_period()?;
        let elapsed = (time - self.epoch).as_seconds_f64();
        let phase = (elapsed / period).rem_euclid(1.0);
        Some(std::f64::consts::TAU * phase + self.offset)
    }
}

/// A celestial body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CelestialBody {
    pub id: BodyId,
    pub name: String,
    pub kind: BodyKind,
    /// The parent body, `None` only for the root.
    pub parent: Option<BodyId>,
    /// Mean equatorial radius (`km`)
    pub radius: f64,
    /// Standard gravitational parameter (`km^3/s^2`)
    pub gm: f64,
    /// Radius of this body's sphere of influence (`km`)
    pub soi_radius: Option<f64>,
    /// Second zonal harmonic
    pub j2: Option<f64>,
    pub positioning: Positioning,
    pub rotation: RotationModel,
}

impl CelestialBody {
    /// Frame the body's parent-relative state is natively expressed in.
    pub fn reference_frame(&self) -> ReferenceFrame {
        match self.positioning {
            Positioning::Relative { .. } => ReferenceFrame::Equatorial,
            _ => ReferenceFrame::Inertial,
        }
    }

    /// Canonical elements, including the fallback of a relatively
    /// positioned body.
    pub fn elements(&self) -> Option<&OrbitalElements> {
        match &self.positioning {
            Positioning::Absolute(elements) => Some(elements),
            Positioning::Relative { fallback, .. } => fallback.as_ref(),
            Positioning::Fixed | Positioning::Counterweight => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("the catalog is empty")]
    Empty,
    #[error("body {0} appears more than once")]
    DuplicateId(BodyId),
    #[error("no root body (every body has a parent)")]
    NoRoot,
    #[error("multiple root bodies: {0:?}")]
    MultipleRoots(Vec<BodyId>),
    #[error("body {body} names missing parent {parent}")]
    MissingParent { body: BodyId, parent: BodyId },
    #[error("bodies {0:?} form a cycle and are unreachable from the root")]
    Cycle(Vec<BodyId>),
    #[error("root body {0} must have fixed positioning")]
    RootNotFixed(BodyId),
    #[error("counterweight body {0} needs a positive gravitational parameter")]
    MasslessCounterweight(BodyId),
    #[error("body {body} orbits {parent}, which has no gravitational parameter")]
    MasslessParent { body: BodyId, parent: BodyId },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("body {0} is not in the registry")]
pub struct NotFound(pub BodyId);

/// Immutable, validated catalog of bodies forming a single rooted tree.
#[derive(Clone, Debug)]
pub struct BodyRegistry {
    bodies: HashMap<BodyId, CelestialBody>,
    children: HashMap<BodyId, Vec<BodyId>>,
    order: Vec<BodyId>,
    root: BodyId,
}

impl BodyRegistry {
    /// Validate the hierarchy and build the registry.
    pub fn new(bodies: impl IntoIterator<Item = CelestialBody>) -> Result<Self, HierarchyError> {
        let mut map = HashMap::new();
        for body in bodies {
            let id = body.id;
            if map.insert(id, body).is_some() {
                return Err(HierarchyError::DuplicateId(id));
            }
        }
        if map.is_empty() {
            return Err(HierarchyError::Empty);
        }

        let mut roots: Vec<BodyId> = map.values().filter(|b| b.is_root()).map(|b| b.id).collect();
        roots.sort();
        let root = match roots.as_slice() {
            [] => return Err(HierarchyError::NoRoot),
            [root] => *root,
            _ => return Err(HierarchyError::MultipleRoots(roots)),
        };

        let mut children: HashMap<BodyId, Vec<BodyId>> = HashMap::new();
        for body in map.values() {
            if let Some(parent) = body.parent {
                if !map.contains_key(&parent) {
                    return Err(HierarchyError::MissingParent {
                        body: body.id,
                        parent,
                    });
                }
                children.entry(parent).or_default().push(body.id);
            }
        }
        for list in children.values_mut() {
            list.sort();
        }

        let mut order = Vec::with_capacity(map.len());
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(kids) = children.get(&id) {
                queue.extend(kids.iter().copied());
            }
        }
        if order.len() != map.len() {
            let mut stranded: Vec<BodyId> =
                map.keys().filter(|id| !seen.contains(id)).copied().collect();
            stranded.sort();
            return Err(HierarchyError::Cycle(stranded));
        }

        for body in map.values() {
            match (&body.positioning, body.parent) {
                (Positioning::Fixed, None) => {}
                (_, None) => return Err(HierarchyError::RootNotFixed(body.id)),
                (Positioning::Counterweight, Some(_)) if body.gm <= 0.0 => {
                    return Err(HierarchyError::MasslessCounterweight(body.id));
                }
                (_, Some(parent)) if body.elements().is_some() && map[&parent].gm <= 0.0 => {
                    return Err(HierarchyError::MasslessParent {
                        body: body.id,
                        parent,
                    });
                }
                _ => {}
            }
        }

        Ok(Self {
            bodies: map,
            children,
            order,
            root,
        })
    }

    pub fn body(&self, id: BodyId) -> Result<&CelestialBody, NotFound> {
        self.bodies.get(&id).ok_or(NotFound(id))
    }

    pub fn by_name(&self, name: &str) -> Option<&CelestialBody> {
        self.bodies
            .values()
            .find(|b| b.name.eq_ignore_ascii_case(name))
    }

    pub fn root(&self) -> &CelestialBody {
        &self.bodies[&self.root]
    }

    pub fn root_id(&self) -> BodyId {
        self.root
    }

    pub fn parent_of(&self, id: BodyId) -> Result<Option<&CelestialBody>, NotFound> {
        match self.body(id)?.parent {
            Some(parent) => self.body(parent).map(Some),
            None => Ok(None),
        }
    }

    /// Direct children of `id`, sorted by id.
    pub fn children(&self, id: BodyId) -> &[BodyId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Bodies of one kind, in topological order.
    pub fn bodies_of_kind(&self, kind: BodyKind) -> Vec<&CelestialBody> {
        self.order
            .iter()
            .map(|id| &self.bodies[id])
            .filter(|b| b.kind == kind)
            .collect()
    }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: BodyId) -> Result<Vec<BodyId>, NotFound> {
        let mut out = Vec::new();
        let mut cur = self.body(id)?.parent;
        while let Some(parent) = cur {
            out.push(parent);
            cur = self.body(parent)?.parent;
        }
        Ok(out)
    }

    /// Every body, parents strictly before their children.
    pub fn topological_order(&self) -> &[BodyId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &CelestialBody> {
        self.order.iter().map(|id| &self.bodies[id])
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    #[test]
    fn registry_orders_parents_first() {
        let registry = BodyRegistry::new([
            body(301, Some(3), 4902.8, Positioning::Absolute(circular(384_400.0))),
            body(0, None, 1.3e11, Positioning::Fixed),
            body(399, Some(3), 398_600.4, Positioning::Counterweight),
            body(3, Some(0), 403_503.2, Positioning::Absolute(circular(1.5e8))),
        ])
        .unwrap();

        assert_eq!(registry.root_id(), BodyId(0));
        assert_eq!(
            registry.topological_order(),
            &[BodyId(0), BodyId(3), BodyId(301), BodyId(399)]
        );
        assert_eq!(registry.children(BodyId(3)), &[BodyId(301), BodyId(399)]);
        assert!(registry.children(BodyId(301)).is_empty());
        assert_eq!(registry.ancestors(BodyId(301)).unwrap(), vec![BodyId(3), BodyId(0)]);
        assert_eq!(registry.bodies_of_kind(BodyKind::Moon).len(), 1);
        assert_eq!(registry.body(BodyId(42)), Err(NotFound(BodyId(42))));
    }

    #[test]
    fn registry_rejects_malformed_trees() {
        let root = || body(0, None, 1.0, Positioning::Fixed);

        assert_eq!(
            BodyRegistry::new([root(), root()]).unwrap_err(),
            HierarchyError::DuplicateId(BodyId(0))
        );
        assert_eq!(
            BodyRegistry::new([root(), body(10, None, 1.0, Positioning::Fixed)]).unwrap_err(),
            HierarchyError::MultipleRoots(vec![BodyId(0), BodyId(10)])
        );
        assert_eq!(
            BodyRegistry::new([root(), body(1, Some(7), 1.0, Positioning::Fixed)]).unwrap_err(),
            HierarchyError::MissingParent {
                body: BodyId(1),
                parent: BodyId(7)
            }
        );
        assert_eq!(
            BodyRegistry::new([
                root(),
                body(1, Some(2), 1.0, Positioning::Fixed),
                body(2, Some(1), 1.0, Positioning::Fixed),
            ])
            .unwrap_err(),
            HierarchyError::Cycle(vec![BodyId(1), BodyId(2)])
        );
        assert_eq!(
            BodyRegistry::new([body(1, Some(1), 1.0, Positioning::Fixed)]).unwrap_err(),
            HierarchyError::NoRoot
        );
        assert_eq!(
            BodyRegistry::new([body(0, None, 1.0, Positioning::Counterweight)]).unwrap_err(),
            HierarchyError::RootNotFixed(BodyId(0))
        );
        assert_eq!(
            BodyRegistry::new([
                body(0, None, 0.0, Positioning::Fixed),
                body(1, Some(0), 1.0, Positioning::Absolute(circular(10.0))),
            ])
            .unwrap_err(),
            HierarchyError::MasslessParent {
                body: BodyId(1),
                parent: BodyId(0)
            }
        );
    }

    #[test]
    fn naif_kind_inference() {
        assert_eq!(BodyKind::from_naif(BodyId(0)), BodyKind::Barycenter);
        assert_eq!(BodyKind::from_naif(BodyId(5)), BodyKind::Barycenter);
        assert_eq!(BodyKind::from_naif(BodyId(10)), BodyKind::Star);
        assert_eq!(BodyKind::from_naif(BodyId(599)), BodyKind::Planet);
        assert_eq!(BodyKind::from_naif(BodyId(501)), BodyKind::Moon);
    }

    #[test]
    fn spin_angle_at_epoch_is_the_offset() {
        let rotation = RotationModel {
            period: Some(86_164.1),
            offset: 1.234,
            epoch: UT::new_seconds(500.0),
            pole: UnitQuaternion::identity(),
        };
        assert_eq!(rotation.spin_angle(UT::new_seconds(500.0)), Some(1.234));
        let zero = RotationModel {
            period: Some(0.0),
            ..rotation.clone()
        };
        assert_eq!(zero.spin_angle(UT::new_seconds(9_000.0)), None);
    }
}
