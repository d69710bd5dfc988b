//! Sphere-of-influence transitions along a precomputed trajectory.
//!
//! The detector trusts the central-body tags it is given. Deciding which
//! body dominates at each sample is the tracer's job
//! ([`crate::trajectory::PatchedConicTracer`]), not this module's.

use itertools::Itertools;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    bodies::BodyId,
    state::{StateError, StateVectorCalculator},
    time::UT,
};

/// One point of a trajectory, relative to its central body in world axes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub time: UT,
    pub central_body: BodyId,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoiTransition {
    pub time: UT,
    pub from_body: BodyId,
    pub to_body: BodyId,
    /// Crossing point relative to `from_body`. When `to_body` does not
    /// resolve this is the previous sample's position, taken at that
    /// sample's time rather than at `time`.
    pub position: Vector3<f64>,
    /// World position of `from_body` at the crossing.
    pub central_body_position: Vector3<f64>,
    /// World position of `to_body` at the crossing, when it resolves.
    pub target_body_position: Option<Vector3<f64>>,
}

#[derive(Copy, Clone)]
pub struct SoiTransitionDetector<'a> {
    calculator: &'a StateVectorCalculator,
}

impl<'a> SoiTransitionDetector<'a> {
    pub fn new(calculator: &'a StateVectorCalculator) -> Self {
        Self { calculator }
    }

    /// Scan `trajectory` once and emit a transition at every sample whose
    /// central body differs from the previous sample's.
    ///
    /// Fewer than two samples yield no transitions.
    pub fn find_transitions(
        &self,
        trajectory: &[TrajectorySample],
    ) -> Result<Vec<SoiTransition>, StateError> {
        trajectory
            .iter()
            .tuple_windows()
            .filter(|(prev, cur)| prev.central_body != cur.central_body)
            .map(|(prev, cur)| self.transition(prev, cur))
            .collect()
    }

    fn transition(
        &self,
        prev: &TrajectorySample,
        cur: &TrajectorySample,
    ) -> Result<SoiTransition, StateError> {
        let central = self.calculator.state_of(prev.central_body, cur.time)?.position;
        let target = match self.calculator.state_of(cur.central_body, cur.time) {
            Ok(state) => Some(state.position),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                trace!(body = %cur.central_body, %error, "transition target does not resolve");
                None
            }
        };
        // without the target's position the last sample about the old body
        // is the best available crossing point
        let position = match target {
            Some(target) => cur.position + target - central,
            None => prev.position,
        };
        Ok(SoiTransition {
            time: cur.time,
            from_body: prev.central_body,
            to_body: cur.central_body,
            position,
            central_body_position: central,
            target_body_position: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bodies::{
            fixtures::{body, circular},
            BodyRegistry, Positioning,
        },
        state::DynamicsStore,
    };

    fn calculator() -> StateVectorCalculator {
        let registry = BodyRegistry::new([
            body(0, None, 1.327e11, Positioning::Fixed),
            body(3, Some(0), 403_503.2, Positioning::Absolute(circular(1.496e8))),
            body(4, Some(0), 42_828.4, Positioning::Absolute(circular(2.279e8))),
        ])
        .unwrap();
        StateVectorCalculator::new(Arc::new(registry), DynamicsStore::new())
    }

    fn sample(t: f64, central: i32, x: f64) -> TrajectorySample {
        TrajectorySample {
            time: UT::new_seconds(t),
            central_body: BodyId(central),
            position: Vector3::new(x, 0.0, 0.0),
            velocity: Vector3::zeros(),
        }
    }

    #[test]
    fn constant_central_body_has_no_transitions() {
        let calc = calculator();
        let detector = SoiTransitionDetector::new(&calc);
        let samples: Vec<_> = (0..20).map(|i| sample(i as f64 * 60.0, 3, 7_000.0)).collect();
        assert!(detector.find_transitions(&samples).unwrap().is_empty());
        assert!(detector.find_transitions(&samples[..1]).unwrap().is_empty());
        assert!(detector.find_transitions(&[]).unwrap().is_empty());
    }

    #[test]
    fn one_change_is_one_transition() {
        let calc = calculator();
        let detector = SoiTransitionDetector::new(&calc);
        let samples = [sample(0.0, 3, 9.0e5), sample(600.0, 0, 1.5e8)];
        let transitions = detector.find_transitions(&samples).unwrap();
        assert_eq!(transitions.len(), 1);

        let transition = transitions[0];
        assert_eq!(transition.time, UT::new_seconds(600.0));
        assert_eq!(transition.from_body, BodyId(3));
        assert_eq!(transition.to_body, BodyId(0));
        let earth = calc.state_of(BodyId(3), UT::new_seconds(600.0)).unwrap();
        assert_eq!(transition.central_body_position, earth.position);
        assert_eq!(transition.target_body_position, Some(Vector3::zeros()));
        let expected = Vector3::new(1.5e8, 0.0, 0.0) - earth.position;
        assert!((transition.position - expected).norm() < 1e-6);
    }

    #[test]
    fn every_change_is_reported_in_order() {
        let calc = calculator();
        let detector = SoiTransitionDetector::new(&calc);
        let samples = [
            sample(0.0, 3, 1.0),
            sample(1.0, 0, 1.0),
            sample(2.0, 0, 1.0),
            sample(3.0, 4, 1.0),
        ];
        let hops: Vec<_> = detector
            .find_transitions(&samples)
            .unwrap()
            .iter()
            .map(|t| (t.from_body, t.to_body))
            .collect();
        assert_eq!(hops, vec![(BodyId(3), BodyId(0)), (BodyId(0), BodyId(4))]);
    }

    #[test]
    fn unresolved_target_keeps_the_last_position() {
        let calc = calculator();
        let detector = SoiTransitionDetector::new(&calc);
        let samples = [sample(0.0, 3, 9.0e5), sample(600.0, 77, 1.0)];
        let transitions = detector.find_transitions(&samples).unwrap();
        assert_eq!(transitions.len(), 1);
        let transition = transitions[0];
        assert_eq!(transition.time, UT::new_seconds(600.0));
        assert_eq!(transition.to_body, BodyId(77));
        assert_eq!(transition.target_body_position, None);
        assert_eq!(transition.position, Vector3::new(9.0e5, 0.0, 0.0));
    }

    #[test]
    fn unknown_origin_is_an_error() {
        let calc = calculator();
        let detector = SoiTransitionDetector::new(&calc);
        let samples = [sample(0.0, 77, 1.0), sample(1.0, 0, 1.0)];
        assert!(detector.find_transitions(&samples).is_err());
    }
}
