//! Reference frames and the transforms between them.
//!
//! World axes are ecliptic J2000 with +Z up. Every frame is described by a
//! [`FrameAnchor`] (its origin, the origin's velocity, its axes and their
//! spin, all in world terms) and every conversion goes through one.

use std::f64::consts::FRAC_PI_2;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    bodies::BodyId,
    kepler::{ReferenceFrame, StateVector},
    state::{StateError, StateVectorCalculator},
    time::UT,
};

/// Up axis of the world frame.
pub const WORLD_UP: [f64; 3] = [0.0, 0.0, 1.0];
/// Up axis expected by Y-up renderers.
pub const RENDER_UP: [f64; 3] = [0.0, 1.0, 0.0];

/// The single realignment from world axes to render axes, taking
/// [`WORLD_UP`] onto [`RENDER_UP`].
pub fn render_from_world() -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -FRAC_PI_2)
}

pub fn to_render(v: Vector3<f64>) -> Vector3<f64> {
    render_from_world() * v
}

/// Re-express a world-frame orientation in render axes.
pub fn orientation_to_render(q: UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    let r = render_from_world();
    r * q * r.inverse()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    /// Inertial, centred on the root.
    World,
    /// Centred on the body, world axes.
    Orbital(BodyId),
    /// Centred on the body, rotating with it.
    Equatorial(BodyId),
}

/// Placement of a frame in world terms.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameAnchor {
    pub origin: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Rotation from the frame's axes to world axes.
    pub orientation: UnitQuaternion<f64>,
    /// Spin of the frame's axes, world frame (rad/s).
    pub angular_velocity: Vector3<f64>,
}

impl Default for FrameAnchor {
    fn default() -> Self {
        Self::world()
    }
}

impl FrameAnchor {
    pub fn world() -> Self {
        Self {
            origin: Vector3::zeros(),
            velocity: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
        }
    }

    /// The same origin with world axes.
    pub fn non_rotating(&self) -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
            ..*self
        }
    }

    pub fn point_to_world(&self, p: Vector3<f64>) -> Vector3<f64> {
        self.origin + self.orientation * p
    }

    pub fn point_from_world(&self, p: Vector3<f64>) -> Vector3<f64> {
        self.orientation.inverse_transform_vector(&(p - self.origin))
    }

    /// Position and velocity measured in this frame, expressed in world
    /// terms. The velocity picks up the transport term `ω × r`.
    pub fn state_to_world(
        &self,
        p: Vector3<f64>,
        v: Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let r = self.orientation * p;
        (
            self.origin + r,
            self.velocity + self.orientation * v + self.angular_velocity.cross(&r),
        )
    }

    pub fn state_from_world(
        &self,
        p: Vector3<f64>,
        v: Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let r = p - self.origin;
        let dv = v - self.velocity - self.angular_velocity.cross(&r);
        (
            self.orientation.inverse_transform_vector(&r),
            self.orientation.inverse_transform_vector(&dv),
        )
    }
}

/// Frame-qualified conversions backed by a [`StateVectorCalculator`].
///
/// Anchors are resolved fresh for each query time.
#[derive(Copy, Clone)]
pub struct ReferenceFrameResolver<'a> {
    calculator: &'a StateVectorCalculator,
}

impl<'a> ReferenceFrameResolver<'a> {
    pub fn new(calculator: &'a StateVectorCalculator) -> Self {
        Self { calculator }
    }

    pub fn anchor(&self, frame: Frame, time: UT) -> Result<FrameAnchor, StateError> {
        match frame {
            Frame::World => Ok(FrameAnchor::world()),
            Frame::Orbital(id) => Ok(self.calculator.equatorial_anchor(id, time)?.non_rotating()),
            Frame::Equatorial(id) => self.calculator.equatorial_anchor(id, time),
        }
    }

    /// The equatorial frame of `body`'s parent; the world frame for the root.
    pub fn parent_equatorial(&self, body: BodyId, time: UT) -> Result<FrameAnchor, StateError> {
        match self.calculator.registry().body(body)?.parent {
            Some(parent) => self.anchor(Frame::Equatorial(parent), time),
            None => Ok(FrameAnchor::world()),
        }
    }

    /// Position in the equatorial frame of `body`'s parent to world.
    pub fn to_inertial(
        &self,
        position: Vector3<f64>,
        body: BodyId,
        time: UT,
    ) -> Result<Vector3<f64>, StateError> {
        Ok(self.parent_equatorial(body, time)?.point_to_world(position))
    }

    /// World position to the equatorial frame of `body`'s parent.
    pub fn to_equatorial_of_parent(
        &self,
        position: Vector3<f64>,
        body: BodyId,
        time: UT,
    ) -> Result<Vector3<f64>, StateError> {
        Ok(self.parent_equatorial(body, time)?.point_from_world(position))
    }

    pub fn transform(
        &self,
        position: Vector3<f64>,
        from: Frame,
        to: Frame,
        time: UT,
    ) -> Result<Vector3<f64>, StateError> {
        if from == to {
            return Ok(position);
        }
        let world = self.anchor(from, time)?.point_to_world(position);
        Ok(self.anchor(to, time)?.point_from_world(world))
    }

    /// Re-express a frame-qualified state in the world frame.
    pub fn state_to_world(&self, state: &StateVector) -> Result<StateVector, StateError> {
        let frame = match state.frame {
            ReferenceFrame::Inertial => Frame::Orbital(state.central_body),
            ReferenceFrame::Equatorial => Frame::Equatorial(state.central_body),
        };
        let (position, velocity) = self
            .anchor(frame, state.epoch)?
            .state_to_world(state.position, state.velocity);
        Ok(StateVector {
            position,
            velocity,
            epoch: state.epoch,
            central_body: self.calculator.registry().root_id(),
            frame: ReferenceFrame::Inertial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spinning_anchor() -> FrameAnchor {
        FrameAnchor {
            origin: Vector3::new(1.0e8, -2.0e7, 3.0e3),
            velocity: Vector3::new(1.0, 29.0, 0.1),
            orientation: UnitQuaternion::from_euler_angles(0.4, -0.2, 2.1),
            angular_velocity: Vector3::new(0.0, 0.3, 1.0) * 7.3e-5,
        }
    }

    #[test]
    fn anchor_state_round_trip() {
        let anchor = spinning_anchor();
        let p = Vector3::new(6_778.0, 12.0, -40.0);
        let v = Vector3::new(0.1, 7.6, 0.02);
        let (wp, wv) = anchor.state_to_world(p, v);
        let (bp, bv) = anchor.state_from_world(wp, wv);
        assert!((bp - p).norm() < 1e-6);
        assert!((bv - v).norm() < 1e-9);
        assert!((anchor.point_from_world(anchor.point_to_world(p)) - p).norm() < 1e-6);
    }

    #[test]
    fn co_rotating_point_moves_in_world() {
        let anchor = FrameAnchor {
            angular_velocity: Vector3::z() * 1.0e-3,
            ..FrameAnchor::world()
        };
        let (_, v) = anchor.state_to_world(Vector3::x() * 1_000.0, Vector3::zeros());
        assert!((v - Vector3::y()).norm() < 1e-12);
    }

    #[test]
    fn render_realignment_maps_world_up() {
        let up = to_render(Vector3::from(WORLD_UP));
        assert!((up - Vector3::from(RENDER_UP)).norm() < 1e-12);

        let spin = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.7);
        let rendered = orientation_to_render(spin);
        let axis = rendered.axis().unwrap();
        assert!((axis.into_inner() - Vector3::from(RENDER_UP)).norm() < 1e-12);
        assert!((rendered.angle() - 0.7).abs() < 1e-12);
    }
}
