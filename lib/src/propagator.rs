//! Keplerian propagation and axial rotation of catalog bodies.

use nalgebra::{UnitQuaternion, Vector3};

use crate::{
    bodies::{CelestialBody, RotationModel},
    kepler::{OrbitalElements, ReferenceFrame, StateVector, UnsupportedOrbitError},
    time::UT,
};

/// Stateless two-body propagator; `μ` is always the parent's GM.
#[derive(Copy, Clone, Debug, Default)]
pub struct OrbitPropagator;

impl OrbitPropagator {
    /// State of a body on `elements` about `parent`, in the parent's
    /// inertial axes.
    pub fn propagate(
        &self,
        elements: &OrbitalElements,
        parent: &CelestialBody,
        time: UT,
    ) -> Result<StateVector, UnsupportedOrbitError> {
        let (position, velocity) = elements.state_at(parent.gm, time)?;
        Ok(StateVector {
            position,
            velocity,
            epoch: time,
            central_body: parent.id,
            frame: ReferenceFrame::Inertial,
        })
    }

    /// Spin orientation of `body` at `time`: the pole followed by the spin
    /// angle about the pole. Identity when the rotation period is undefined.
    pub fn orientation_at(&self, body: &CelestialBody, time: UT) -> UnitQuaternion<f64> {
        rotation_at(&body.rotation, time)
    }

    /// World-frame spin vector of `body` (rad/s).
    pub fn angular_velocity(&self, body: &CelestialBody) -> Vector3<f64> {
        spin_vector(&body.rotation)
    }
}

pub(crate) fn rotation_at(rotation: &RotationModel, time: UT) -> UnitQuaternion<f64> {
    match rotation.spin_angle(time) {
        Some(angle) => rotation.pole * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
        None => UnitQuaternion::identity(),
    }
}

pub(crate) fn spin_vector(rotation: &RotationModel) -> Vector3<f64> {
    match rotation.spin_period() {
        Some(period) => rotation.pole * Vector3::z() * (std::f64::consts::TAU / period),
        None => Vector3::zeros(),
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::{FRAC_PI_2, TAU};

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::bodies::{
        fixtures::{body, circular},
        Positioning,
    };

    #[test]
    fn circular_orbit_keeps_its_radius() {
        let earth = body(399, Some(3), 398_600.4418, Positioning::Fixed);
        let elements = OrbitalElements {
            i: 0.4,
            lan: 1.2,
            argpe: 2.5,
            ma: 0.3,
            ..circular(42_164.0)
        };
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let t = UT::new_seconds(rng.gen_range(-1.0e8..1.0e8));
            let sv = OrbitPropagator.propagate(&elements, &earth, t).unwrap();
            assert!((sv.position.norm() - 42_164.0).abs() < 1e-6);
            assert_eq!(sv.central_body, earth.id);
            assert_eq!(sv.frame, ReferenceFrame::Inertial);
        }
    }

    #[test]
    fn open_orbit_is_rejected_without_nan() {
        let sun = body(10, Some(0), 1.327e11, Positioning::Fixed);
        let elements = OrbitalElements {
            e: 1.2,
            ..circular(1.0e8)
        };
        assert_eq!(
            OrbitPropagator.propagate(&elements, &sun, UT::J2000),
            Err(UnsupportedOrbitError::Open(1.2))
        );
    }

    #[test]
    fn zero_period_is_identity() {
        let mut planet = body(499, Some(4), 42_828.37, Positioning::Counterweight);
        planet.rotation = RotationModel {
            period: Some(0.0),
            offset: 1.0,
            epoch: UT::J2000,
            pole: UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.3),
        };
        let q = OrbitPropagator.orientation_at(&planet, UT::new_seconds(1234.0));
        assert_eq!(q, UnitQuaternion::identity());
        assert_eq!(OrbitPropagator.angular_velocity(&planet), Vector3::zeros());
    }

    #[test]
    fn orientation_at_epoch_is_the_offset() {
        let mut planet = body(599, Some(5), 1.266_865_3e8, Positioning::Counterweight);
        planet.rotation = RotationModel {
            period: Some(35_730.0),
            offset: FRAC_PI_2,
            epoch: UT::new_seconds(7_200.0),
            pole: UnitQuaternion::identity(),
        };
        let q = OrbitPropagator.orientation_at(&planet, UT::new_seconds(7_200.0));
        assert!((q.angle() - FRAC_PI_2).abs() < 1e-12);

        // one full period later the body is back where it started
        let later = OrbitPropagator.orientation_at(&planet, UT::new_seconds(7_200.0 + 35_730.0));
        assert!(q.angle_to(&later) < 1e-9);

        let omega = OrbitPropagator.angular_velocity(&planet);
        assert!((omega.z - TAU / 35_730.0).abs() < 1e-15);
    }

    #[test]
    fn retrograde_rotation_spins_backwards() {
        let mut venus = body(299, Some(2), 324_858.59, Positioning::Counterweight);
        venus.rotation = RotationModel {
            period: Some(-20_997_360.0),
            ..RotationModel::default()
        };
        assert!(OrbitPropagator.angular_velocity(&venus).z < 0.0);
    }
}
