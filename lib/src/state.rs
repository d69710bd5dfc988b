//! Absolute body states: the "where is body B at time T" query.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::{
    bodies::{BodyId, BodyRegistry, CelestialBody, ExternalSourceHandle, NotFound, Positioning},
    frames::{self, FrameAnchor, ReferenceFrameResolver},
    kepler::{OrbitalElements, ReferenceFrame, StateVector, UnsupportedOrbitError},
    propagator::OrbitPropagator,
    time::UT,
};

#[derive(Clone, Debug, PartialEq, Error)]
pub enum StateError {
    #[error(transparent)]
    NotFound(#[from] NotFound),
    /// A parent id that is not in the registry. [`BodyRegistry::new`]
    /// rejects such trees, so a validated registry never produces this.
    #[error("body {body} refers to parent {parent}, which does not exist")]
    DanglingReference { body: BodyId, parent: BodyId },
    #[error("body {body} has an unsupported orbit: {error}")]
    UnsupportedOrbit {
        body: BodyId,
        error: UnsupportedOrbitError,
    },
    #[error(
        "no relative state published for body {body} (handle {handle:?}) and no fallback orbit"
    )]
    MissingRelativeState {
        body: BodyId,
        handle: ExternalSourceHandle,
    },
    #[error("parent {parent} of body {body} could not be resolved")]
    ParentUnavailable { body: BodyId, parent: BodyId },
}

impl StateError {
    /// Broken catalog data; never worth retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::DanglingReference { .. })
    }
}

/// A parent-relative state published by an external dynamics source, in
/// the parent's equatorial frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelativeSample {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub time: UT,
}

/// Latest samples from external dynamics sources.
///
/// One writer, any number of readers. Publishing before the tick's queries
/// is the writer's job.
#[derive(Clone, Debug, Default)]
pub struct DynamicsStore {
    samples: Arc<RwLock<HashMap<ExternalSourceHandle, RelativeSample>>>,
}

impl DynamicsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, handle: ExternalSourceHandle, sample: RelativeSample) {
        self.samples.write().insert(handle, sample);
    }

    pub fn clear(&self, handle: ExternalSourceHandle) -> Option<RelativeSample> {
        self.samples.write().remove(&handle)
    }

    pub fn get(&self, handle: ExternalSourceHandle) -> Option<RelativeSample> {
        self.samples.read().get(&handle).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

/// One body's world-frame state.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    pub id: BodyId,
    pub state: StateVector,
    pub orientation: UnitQuaternion<f64>,
    pub angular_velocity: Vector3<f64>,
    /// Carried over from an earlier time because the current one failed.
    pub stale: bool,
}

impl BodyState {
    /// The same state in render axes.
    pub fn to_render(&self) -> BodyState {
        BodyState {
            state: StateVector {
                position: frames::to_render(self.state.position),
                velocity: frames::to_render(self.state.velocity),
                ..self.state
            },
            orientation: frames::orientation_to_render(self.orientation),
            angular_velocity: frames::to_render(self.angular_velocity),
            ..*self
        }
    }
}

/// Every resolvable body at one time, parents before children.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub time: UT,
    pub bodies: Vec<BodyState>,
    /// Bodies left out, with the reason.
    #[serde(skip)]
    pub skipped: Vec<(BodyId, StateError)>,
}

impl SystemSnapshot {
    pub fn get(&self, id: BodyId) -> Option<&BodyState> {
        self.bodies.iter().find(|b| b.id == id)
    }

    pub fn to_render(&self) -> SystemSnapshot {
        SystemSnapshot {
            time: self.time,
            bodies: self.bodies.iter().map(BodyState::to_render).collect(),
            skipped: self.skipped.clone(),
        }
    }
}

type AnchorCache = HashMap<BodyId, FrameAnchor>;

/// Resolves body states from the root down.
///
/// Each query resolves the parent chain first, computing every parent's
/// orientation for the query time before any child that depends on it.
#[derive(Clone, Debug)]
pub struct StateVectorCalculator {
    registry: Arc<BodyRegistry>,
    dynamics: DynamicsStore,
    propagator: OrbitPropagator,
}

impl StateVectorCalculator {
    pub fn new(registry: Arc<BodyRegistry>, dynamics: DynamicsStore) -> Self {
        Self {
            registry,
            dynamics,
            propagator: OrbitPropagator,
        }
    }

    pub fn registry(&self) -> &Arc<BodyRegistry> {
        &self.registry
    }

    pub fn dynamics(&self) -> &DynamicsStore {
        &self.dynamics
    }

    pub fn resolver(&self) -> ReferenceFrameResolver<'_> {
        ReferenceFrameResolver::new(self)
    }

    /// Absolute state in the world frame, relative to the root.
    pub fn state_of(&self, id: BodyId, time: UT) -> Result<StateVector, StateError> {
        let anchor = self.resolve(id, time, &mut AnchorCache::new())?;
        Ok(self.world_state(&anchor, time))
    }

    /// State relative to the parent, in the parent's inertial axes.
    pub fn relative_state_of(&self, id: BodyId, time: UT) -> Result<StateVector, StateError> {
        let body = self.registry.body(id)?;
        let Some(parent_id) = body.parent else {
            return Ok(StateVector {
                position: Vector3::zeros(),
                velocity: Vector3::zeros(),
                epoch: time,
                central_body: id,
                frame: ReferenceFrame::Inertial,
            });
        };
        let mut cache = AnchorCache::new();
        let parent = self.parent(body, parent_id)?;
        let parent_anchor = self.resolve(parent_id, time, &mut cache)?;
        let (position, velocity) = self.offset_from_parent(body, parent, &parent_anchor, time)?;
        Ok(StateVector {
            position,
            velocity,
            epoch: time,
            central_body: parent_id,
            frame: ReferenceFrame::Inertial,
        })
    }

    pub fn orientation_at(&self, id: BodyId, time: UT) -> Result<UnitQuaternion<f64>, StateError> {
        Ok(self.propagator.orientation_at(self.registry.body(id)?, time))
    }

    pub fn angular_velocity(&self, id: BodyId) -> Result<Vector3<f64>, StateError> {
        Ok(self.propagator.angular_velocity(self.registry.body(id)?))
    }

    /// The body's equatorial frame at `time`.
    pub fn equatorial_anchor(&self, id: BodyId, time: UT) -> Result<FrameAnchor, StateError> {
        self.resolve(id, time, &mut AnchorCache::new())
    }

    pub fn body_state(&self, id: BodyId, time: UT) -> Result<BodyState, StateError> {
        let anchor = self.resolve(id, time, &mut AnchorCache::new())?;
        Ok(self.body_state_from(id, &anchor, time))
    }

    /// Resolve every body in topological order.
    ///
    /// Bodies that fail with a recoverable error are skipped along with their
    /// descendants; a fatal error aborts the snapshot.
    pub fn snapshot(&self, time: UT) -> Result<SystemSnapshot, StateError> {
        let mut cache = AnchorCache::new();
        let mut failed = HashSet::new();
        let mut snapshot = SystemSnapshot {
            time,
            bodies: Vec::with_capacity(self.registry.len()),
            skipped: Vec::new(),
        };

        for &id in self.registry.topological_order() {
            let body = self.registry.body(id)?;
            if let Some(parent) = body.parent.filter(|p| failed.contains(p)) {
                failed.insert(id);
                snapshot
                    .skipped
                    .push((id, StateError::ParentUnavailable { body: id, parent }));
                continue;
            }
            match self.resolve(id, time, &mut cache) {
                Ok(anchor) => snapshot.bodies.push(self.body_state_from(id, &anchor, time)),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    trace!(body = %id, %error, "skipping body in snapshot");
                    failed.insert(id);
                    snapshot.skipped.push((id, error));
                }
            }
        }
        Ok(snapshot)
    }

    fn world_state(&self, anchor: &FrameAnchor, time: UT) -> StateVector {
        StateVector {
            position: anchor.origin,
            velocity: anchor.velocity,
            epoch: time,
            central_body: self.registry.root_id(),
            frame: ReferenceFrame::Inertial,
        }
    }

    fn body_state_from(&self, id: BodyId, anchor: &FrameAnchor, time: UT) -> BodyState {
        BodyState {
            id,
            state: self.world_state(anchor, time),
            orientation: anchor.orientation,
            angular_velocity: anchor.angular_velocity,
            stale: false,
        }
    }

    fn parent(&self, body: &CelestialBody, parent: BodyId) -> Result<&CelestialBody, StateError> {
        self.registry
            .body(parent)
            .map_err(|_| StateError::DanglingReference {
                body: body.id,
                parent,
            })
    }

    /// Equatorial anchor of `id`, resolving (and caching) its ancestors first.
    fn resolve(
        &self,
        id: BodyId,
        time: UT,
        cache: &mut AnchorCache,
    ) -> Result<FrameAnchor, StateError> {
        if let Some(anchor) = cache.get(&id) {
            return Ok(*anchor);
        }
        let body = self.registry.body(id)?;
        let (origin, velocity) = match body.parent {
            None => (Vector3::zeros(), Vector3::zeros()),
            Some(parent_id) => {
                let parent = self.parent(body, parent_id)?;
                let parent_anchor = self.resolve(parent_id, time, cache)?;
                let (r, v) = self.offset_from_parent(body, parent, &parent_anchor, time)?;
                (parent_anchor.origin + r, parent_anchor.velocity + v)
            }
        };
        let anchor = FrameAnchor {
            origin,
            velocity,
            orientation: self.propagator.orientation_at(body, time),
            angular_velocity: self.propagator.angular_velocity(body),
        };
        trace!(body = %id, %time, position = ?origin, "resolved body");
        cache.insert(id, anchor);
        Ok(anchor)
    }

    /// Position and velocity of `body` relative to `parent`, world axes.
    fn offset_from_parent(
        &self,
        body: &CelestialBody,
        parent: &CelestialBody,
        parent_anchor: &FrameAnchor,
        time: UT,
    ) -> Result<(Vector3<f64>, Vector3<f64>), StateError> {
        match &body.positioning {
            Positioning::Fixed => Ok((Vector3::zeros(), Vector3::zeros())),
            Positioning::Absolute(elements) => self.propagate(body, elements, parent, time),
            Positioning::Relative { source, fallback } => {
                match (self.dynamics.get(*source), fallback) {
                    (Some(sample), _) => {
                        let (p, v) =
                            parent_anchor.state_to_world(sample.position, sample.velocity);
                        Ok((p - parent_anchor.origin, v - parent_anchor.velocity))
                    }
                    (None, Some(elements)) => self.propagate(body, elements, parent, time),
                    (None, None) => Err(StateError::MissingRelativeState {
                        body: body.id,
                        handle: *source,
                    }),
                }
            }
            Positioning::Counterweight => {
                let mut weighted_r = Vector3::zeros();
                let mut weighted_v = Vector3::zeros();
                for &sibling_id in self.registry.children(parent.id) {
                    let sibling = self.registry.body(sibling_id)?;
                    if sibling_id == body.id
                        || !matches!(
                            sibling.positioning,
                            Positioning::Absolute(_) | Positioning::Relative { .. }
                        )
                    {
                        continue;
                    }
                    let (r, v) = self.offset_from_parent(sibling, parent, parent_anchor, time)?;
                    weighted_r += sibling.gm * r;
                    weighted_v += sibling.gm * v;
                }
                Ok((-weighted_r / body.gm, -weighted_v / body.gm))
            }
        }
    }

    fn propagate(
        &self,
        body: &CelestialBody,
        elements: &OrbitalElements,
        parent: &CelestialBody,
        time: UT,
    ) -> Result<(Vector3<f64>, Vector3<f64>), StateError> {
        let sv = self
            .propagator
            .propagate(elements, parent, time)
            .map_err(|error| StateError::UnsupportedOrbit {
                body: body.id,
                error,
            })?;
        Ok((sv.position, sv.velocity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bodies::{
        fixtures::{body, circular},
        HierarchyError, RotationModel,
    };

    fn earth_moon() -> (Arc<BodyRegistry>, DynamicsStore) {
        let mut earth = body(399, Some(3), 398_600.4, Positioning::Counterweight);
        earth.rotation = RotationModel {
            period: Some(86_164.1),
            ..RotationModel::default()
        };
        let relative = |id: i32, fallback| {
            body(
                id,
                Some(399),
                0.0,
                Positioning::Relative {
                    source: ExternalSourceHandle(BodyId(id)),
                    fallback,
                },
            )
        };
        let registry = BodyRegistry::new([
            body(0, None, 1.327e11, Positioning::Fixed),
            body(3, Some(0), 403_503.2, Positioning::Absolute(circular(1.496e8))),
            earth,
            body(301, Some(3), 4_902.8, Positioning::Absolute(circular(384_400.0))),
            relative(391, Some(circular(42_164.0))),
            relative(392, None),
        ])
        .unwrap();
        (Arc::new(registry), DynamicsStore::new())
    }

    #[test]
    fn state_is_deterministic() {
        let (registry, dynamics) = earth_moon();
        let calc = StateVectorCalculator::new(registry, dynamics);
        let t = UT::new_seconds(123_456.7);
        assert_eq!(
            calc.state_of(BodyId(301), t).unwrap(),
            calc.state_of(BodyId(301), t).unwrap()
        );
    }

    #[test]
    fn relative_sample_follows_parent_rotation() {
        let (registry, dynamics) = earth_moon();
        let calc = StateVectorCalculator::new(registry, dynamics.clone());
        dynamics.publish(
            ExternalSourceHandle(BodyId(391)),
            RelativeSample {
                position: Vector3::new(42_164.0, 0.0, 0.0),
                velocity: Vector3::zeros(),
                time: UT::J2000,
            },
        );

        // a quarter of a sidereal day later the fixed equatorial point sits on +Y
        let t = UT::new_seconds(86_164.1 / 4.0);
        let sat = calc.relative_state_of(BodyId(391), t).unwrap();
        assert_eq!(sat.central_body, BodyId(399));
        assert!((sat.position - Vector3::new(0.0, 42_164.0, 0.0)).norm() < 1e-6);
        let omega = std::f64::consts::TAU / 86_164.1;
        assert!((sat.velocity - Vector3::new(-42_164.0 * omega, 0.0, 0.0)).norm() < 1e-9);

        let earth = calc.state_of(BodyId(399), t).unwrap();
        let world = calc.state_of(BodyId(391), t).unwrap();
        assert!((world.position - earth.position - sat.position).norm() < 1e-6);

        // without a sample the fallback orbit is used
        dynamics.clear(ExternalSourceHandle(BodyId(391)));
        let fallback = calc.relative_state_of(BodyId(391), t).unwrap();
        assert!((fallback.position.norm() - 42_164.0).abs() < 1e-6);
    }

    #[test]
    fn counterweight_balances_siblings() {
        let (registry, dynamics) = earth_moon();
        let calc = StateVectorCalculator::new(registry, dynamics);
        let t = UT::new_seconds(5.0e6);
        let earth = calc.relative_state_of(BodyId(399), t).unwrap();
        assert_eq!(earth.central_body, BodyId(3));
        let moon = calc.relative_state_of(BodyId(301), t).unwrap();
        let balance = 398_600.4 * earth.position + 4_902.8 * moon.position;
        assert!(balance.norm() < 1e-3);
    }

    #[test]
    fn snapshot_skips_unresolvable_bodies() {
        let (registry, dynamics) = earth_moon();
        let calc = StateVectorCalculator::new(registry, dynamics);
        let snapshot = calc.snapshot(UT::J2000).unwrap();
        assert_eq!(snapshot.bodies.len(), 5);
        assert_eq!(snapshot.skipped.len(), 1);
        assert!(matches!(
            snapshot.skipped[0],
            (BodyId(392), StateError::MissingRelativeState { .. })
        ));
        assert!(snapshot.get(BodyId(392)).is_none());
        let order: Vec<_> = snapshot.bodies.iter().map(|b| b.id).collect();
        assert_eq!(
            order,
            vec![BodyId(0), BodyId(3), BodyId(301), BodyId(399), BodyId(391)]
        );
    }

    #[test]
    fn unknown_body_is_not_found() {
        let (registry, dynamics) = earth_moon();
        let calc = StateVectorCalculator::new(registry, dynamics);
        assert_eq!(
            calc.state_of(BodyId(1234), UT::J2000),
            Err(StateError::NotFound(NotFound(BodyId(1234))))
        );
    }

    #[test]
    fn only_dangling_references_are_fatal() {
        let dangling = StateError::DanglingReference {
            body: BodyId(301),
            parent: BodyId(3),
        };
        assert!(dangling.is_fatal());
        assert!(!StateError::NotFound(NotFound(BodyId(1))).is_fatal());
        assert!(!StateError::ParentUnavailable {
            body: BodyId(301),
            parent: BodyId(3)
        }
        .is_fatal());

        // a dangling parent never makes it past registry validation
        let orphan = BodyRegistry::new([
            body(0, None, 1.327e11, Positioning::Fixed),
            body(301, Some(3), 4_902.8, Positioning::Absolute(circular(384_400.0))),
        ]);
        assert!(matches!(
            orphan,
            Err(HierarchyError::MissingParent {
                body: BodyId(301),
                parent: BodyId(3)
            })
        ));
    }
}
