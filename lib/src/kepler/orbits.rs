//! Keplerian orbits.

use std::f64::consts;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{bodies::BodyId, time::UT};

/// Convergence tolerance for Kepler's equation (radians).
pub const KEPLER_TOL: f64 = 1e-10;
/// Iteration cap for Kepler's equation.
pub const KEPLER_MAXITER: u32 = 50;

/// Orbits the closed-orbit propagator cannot represent.
#[derive(Copy, Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum UnsupportedOrbitError {
    #[error("eccentricity {0} does not describe a closed orbit")]
    Open(f64),
    #[error("eccentricity {0} is negative")]
    NegativeEccentricity(f64),
    #[error("semi-major axis {0} km is not positive")]
    NonPositiveAxis(f64),
    #[error("gravitational parameter {0} km^3/s^2 is not positive")]
    NonPositiveMu(f64),
    #[error("orbital elements are not finite")]
    NonFinite,
}

#[derive(Copy, Clone, Debug, PartialEq, Error)]
pub enum PropagationError {
    #[error("universal-variable propagation did not converge after {0} iterations")]
    NonConvergence(u64),
    #[error("cannot propagate a degenerate state vector")]
    Degenerate,
}

/// Canonical Keplerian elements of a closed orbit.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitalElements {
    /// Semi-major axis (km).
    pub a: f64,
    /// Eccentricity (dimensionless).
    pub e: f64,
    /// Inclination (radians).
    pub i: f64,
    /// Longitude of ascending node (radians).
    pub lan: f64,
    /// Argument of periapsis (radians).
    pub argpe: f64,
    /// Mean anomaly at epoch (radians).
    pub ma: f64,
    /// The epoch of the mean anomaly.
    pub epoch: UT,
}

impl OrbitalElements {
    pub fn validate(&self, mu: f64) -> Result<(), UnsupportedOrbitError> {
        let finite = [self.a, self.e, self.i, self.lan, self.argpe, self.ma]
            .iter()
            .all(|x| x.is_finite());
        if !finite || !mu.is_finite() {
            return Err(UnsupportedOrbitError::NonFinite);
        }
        if self.e < 0.0 {
            return Err(UnsupportedOrbitError::NegativeEccentricity(self.e));
        }
        if self.e >= 1.0 {
            return Err(UnsupportedOrbitError::Open(self.e));
        }
        if self.a <= 0.0 {
            return Err(UnsupportedOrbitError::NonPositiveAxis(self.a));
        }
        if mu <= 0.0 {
            return Err(UnsupportedOrbitError::NonPositiveMu(mu));
        }
        Ok(())
    }

    /// Semi-latus rectum (km).
    pub fn p(&self) -> f64 {
        self.a * (1.0 - self.e.powi(2))
    }

    pub fn periapsis_radius(&self) -> f64 {
        self.a * (1.0 - self.e)
    }

    pub fn apoapsis_radius(&self) -> f64 {
        self.a * (1.0 + self.e)
    }

    /// Mean motion (rad/s).
    pub fn mean_motion(&self, mu: f64) -> f64 {
        libm::sqrt(mu / self.a.powi(3))
    }

    /// Orbital period (s).
    pub fn period(&self, mu: f64) -> f64 {
        2.0 * consts::PI / self.mean_motion(mu)
    }

    pub fn mean_anomaly_at(&self, mu: f64, time: UT) -> f64 {
        let dt = (time - self.epoch).as_seconds_f64();
        self.ma + self.mean_motion(mu) * dt
    }

    /// Position and velocity in the parent-centred inertial frame at `time`.
    pub fn state_at(
        &self,
        mu: f64,
        time: UT,
    ) -> Result<(Vector3<f64>, Vector3<f64>), UnsupportedOrbitError> {
        self.validate(mu)?;
        let ma = self.mean_anomaly_at(mu, time);
        let solution = solve_kepler(ma, self.e, KEPLER_TOL, KEPLER_MAXITER);
        if !solution.converged {
            debug!(
                ma,
                e = self.e,
                ea = solution.ea,
                "Kepler's equation did not converge, using best-effort eccentric anomaly"
            );
        }
        let ta = ea_to_ta(solution.ea, self.e);
        let (rv, vv) = self.sv_pqw(mu, ta);
        let mat = self.pqw_ijk_matrix();
        Ok((mat * rv, mat * vv))
    }

    /// Position and velocity in the perifocal coordinate system PQW at
    /// true anomaly `ta`.
    fn sv_pqw(&self, mu: f64, ta: f64) -> (Vector3<f64>, Vector3<f64>) {
        let p = self.p();
        let r = p / (1.0 + self.e * libm::cos(ta));
        let rv = r * libm::cos(ta) * Vector3::new(1.0, 0.0, 0.0)
            + r * libm::sin(ta) * Vector3::new(0.0, 1.0, 0.0);
        let vv = libm::sqrt(mu / p)
            * (-libm::sin(ta) * Vector3::new(1.0, 0.0, 0.0)
                + (self.e + libm::cos(ta)) * Vector3::new(0.0, 1.0, 0.0));
        (rv, vv)
    }

    /// Rotation by argument of periapsis, inclination and longitude of
    /// ascending node, PQW to the parent's inertial frame.
    fn pqw_ijk_matrix(&self) -> Matrix3<f64> {
        let m11 = libm::cos(self.lan) * libm::cos(self.argpe)
            - libm::sin(self.lan) * libm::sin(self.argpe) * libm::cos(self.i);
        let m12 = -libm::cos(self.lan) * libm::sin(self.argpe)
            - libm::sin(self.lan) * libm::cos(self.argpe) * libm::cos(self.i);
        let m13 = libm::sin(self.lan) * libm::sin(self.i);
        let m21 = libm::sin(self.lan) * libm::cos(self.argpe)
            + libm::cos(self.lan) * libm::sin(self.argpe) * libm::cos(self.i);
        let m22 = -libm::sin(self.lan) * libm::sin(self.argpe)
            + libm::cos(self.lan) * libm::cos(self.argpe) * libm::cos(self.i);
        let m23 = -libm::cos(self.lan) * libm::sin(self.i);
        let m31 = libm::sin(self.argpe) * libm::sin(self.i);
        let m32 = libm::cos(self.argpe) * libm::sin(self.i);
        let m33 = libm::cos(self.i);

        Matrix3::new(m11, m12, m13, m21, m22, m23, m31, m32, m33)
    }
}

/// Axes a position/velocity pair is expressed in.
///
/// The origin is always the state's central body.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceFrame {
    /// World (ecliptic J2000) axes.
    Inertial,
    /// The central body's rotating equatorial axes.
    Equatorial,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    /// Position (km).
    pub position: Vector3<f64>,
    /// Velocity (km/s).
    pub velocity: Vector3<f64>,
    pub epoch: UT,
    pub central_body: BodyId,
    pub frame: ReferenceFrame,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KeplerSolution {
    /// Eccentric anomaly (radians).
    pub ea: f64,
    pub iterations: u32,
    pub converged: bool,
}

/// Solve Kepler's equation `E - e sin E = M` by Newton-Raphson.
///
/// Stops when a step is at most `tol` or after `maxiter` steps; the last
/// iterate is returned either way.
pub fn solve_kepler(ma: f64, e: f64, tol: f64, maxiter: u32) -> KeplerSolution {
    let ma = wrap_pi(ma);
    let mut ea = if e > 0.8 {
        consts::PI.copysign(ma)
    } else if ma < 0.0 {
        ma - e
    } else {
        ma + e
    };

    for iter in 1..=maxiter {
        let step = (ea - e * libm::sin(ea) - ma) / (1.0 - e * libm::cos(ea));
        ea -= step;
        if step.abs() <= tol {
            return KeplerSolution {
                ea,
                iterations: iter,
                converged: true,
            };
        }
    }
    KeplerSolution {
        ea,
        iterations: maxiter,
        converged: false,
    }
}

pub fn ea_to_ta(ea: f64, e: f64) -> f64 {
    let beta = e / (1.0 + libm::sqrt(1.0 - e.powi(2)));
    ea + 2.0 * libm::atan2(beta * libm::sin(ea), 1.0 - beta * libm::cos(ea))
}

fn ta_to_ea(ta: f64, e: f64) -> f64 {
    2.0 * libm::atan(libm::sqrt((1.0 - e) / (1.0 + e)) * libm::tan(ta / 2.0))
}

fn wrap_pi(angle: f64) -> f64 {
    let wrapped = (angle + consts::PI).rem_euclid(consts::TAU) - consts::PI;
    if wrapped == -consts::PI {
        consts::PI
    } else {
        wrapped
    }
}

pub(crate) fn calc_c2c3(psi: f64) -> (f64, f64) {
    if psi > 1e-6 {
        let c2 = (1.0 - libm::cos(libm::sqrt(psi))) / psi;
        let c3 = (libm::sqrt(psi) - libm::sin(libm::sqrt(psi))) / (psi * libm::sqrt(psi));
        (c2, c3)
    } else if psi < -1e-6 {
        let c2 = (1.0 - libm::cosh(libm::sqrt(-psi))) / psi;
        let c3 = (libm::sinh(libm::sqrt(-psi)) - libm::sqrt(-psi)) / libm::sqrt((-psi).powi(3));
        (c2, c3)
    } else {
        (1.0 / 2.0, 1.0 / 6.0)
    }
}

/// Propagate a two-body state `delta_t` seconds with universal variables.
///
/// Works for every conic. Recommended tolerance: `tol = 1e-7`,
/// `maxiter = 500`.
pub fn propagate_universal(
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    mu: f64,
    delta_t: f64,
    tol: f64,
    maxiter: u64,
) -> Result<(Vector3<f64>, Vector3<f64>), PropagationError> {
    let norm_r0 = position.norm();
    if norm_r0 <= 0.0 || mu <= 0.0 || !norm_r0.is_finite() || !delta_t.is_finite() {
        return Err(PropagationError::Degenerate);
    }
    if delta_t == 0.0 {
        return Ok((position, velocity));
    }

    let alpha = -velocity.norm_squared() / mu + 2.0 / norm_r0;
    let sqrt_mu = libm::sqrt(mu);
    let dot_r0v0 = position.dot(&velocity);

    let mut xn_new = if alpha > 1e-6 {
        if (alpha - 1.0).abs() < f64::EPSILON {
            // first guess lands on the root; back off slightly
            sqrt_mu * delta_t * alpha * 0.97
        } else {
            sqrt_mu * delta_t * alpha
        }
    } else if alpha < -1e-6 {
        let a = 1.0 / alpha;
        delta_t.signum()
            * libm::sqrt(-a)
            * libm::log(
                (-2.0 * mu * alpha * delta_t)
                    / (dot_r0v0 + delta_t.signum() * libm::sqrt(-mu * a) * (1.0 - norm_r0 * alpha)),
            )
    } else {
        let h = position.cross(&velocity);
        let p = h.norm_squared() / mu;
        let s = libm::atan2(1.0, 3.0 * delta_t * libm::sqrt(mu / p.powi(3))) / 2.0;
        let w = libm::atan(libm::cbrt(libm::tan(s)));
        libm::sqrt(p) * 2.0 / libm::tan(2.0 * w)
    };

    let mut xn = f64::NAN;
    let mut c2 = f64::NAN;
    let mut c3 = f64::NAN;
    let mut r = f64::NAN;
    let mut psi = f64::NAN;
    let mut converged = false;
    for _ in 0..maxiter {
        xn = xn_new;
        psi = xn.powi(2) * alpha;
        (c2, c3) = calc_c2c3(psi);
        r = xn * xn * c2 + dot_r0v0 / sqrt_mu * xn * (1.0 - psi * c3) + norm_r0 * (1.0 - psi * c2);
        xn_new = xn
            + (sqrt_mu * delta_t
                - xn * xn * xn * c3
                - dot_r0v0 / sqrt_mu * xn * xn * c2
                - norm_r0 * xn * (1.0 - psi * c3))
                / r;

        if (xn_new - xn).abs() < tol {
            converged = true;
            break;
        }
    }
    if !converged || !xn.is_finite() {
        return Err(PropagationError::NonConvergence(maxiter));
    }

    let f = 1.0 - xn.powi(2) / norm_r0 * c2;
    let g = delta_t - xn.powi(3) / sqrt_mu * c3;

    let gdot = 1.0 - xn.powi(2) / r * c2;
    let fdot = sqrt_mu / (r * norm_r0) * xn * (psi * c3 - 1.0);

    Ok((f * position + g * velocity, fdot * position + gdot * velocity))
}

/// Osculating elements of a closed orbit from a parent-centred inertial
/// state.
///
/// Recommended tolerance (`tol`): `1e-8`.
pub fn elements_from_state(
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    mu: f64,
    epoch: UT,
    tol: f64,
) -> Result<OrbitalElements, UnsupportedOrbitError> {
    if mu <= 0.0 {
        return Err(UnsupportedOrbitError::NonPositiveMu(mu));
    }
    let rv = position;
    let r = rv.norm();
    let vv = velocity;
    let v = vv.norm();
    let hv = rv.cross(&vv);
    let h = hv.norm();
    if r == 0.0 || h == 0.0 || !h.is_finite() {
        return Err(UnsupportedOrbitError::NonFinite);
    }
    let nv = Vector3::new(0.0, 0.0, 1.0).cross(&hv);
    let ev = 1.0 / mu * ((v.powi(2) - mu / r) * rv - rv.dot(&vv) * vv);
    let p = h.powi(2) / mu;
    let e = ev.norm();
    if e >= 1.0 {
        return Err(UnsupportedOrbitError::Open(e));
    }
    let i = libm::acos(hv[2] / h);

    let circular = e < tol;
    let equatorial = i.abs() < tol || (consts::PI - i).abs() < tol;

    let (lan, argpe, ta) = if equatorial && !circular {
        (
            0.0,
            // Longitude of periapsis
            libm::atan2(ev[1], ev[0]),
            libm::atan2(hv.dot(&ev.cross(&rv)) / h, rv.dot(&ev)),
        )
    } else if !equatorial && circular {
        (
            libm::atan2(nv[1], nv[0]),
            0.0,
            // Argument of latitude
            libm::atan2(rv.dot(&hv.cross(&nv)) / h, rv.dot(&nv)),
        )
    } else if equatorial && circular {
        (
            0.0,
            0.0,
            // True longitude
            libm::atan2(rv[1], rv[0]),
        )
    } else {
        let lan = libm::atan2(nv[1], nv[0]);
        let px = rv.dot(&nv);
        let py = rv.dot(&hv.cross(&nv)) / h;
        let ta = libm::atan2(hv.dot(&ev.cross(&rv)) / h, rv.dot(&ev));
        let argpe = libm::atan2(py, px) - ta;
        (lan, argpe, ta)
    };

    let a = p / (1.0 - e.powi(2));
    let ea = ta_to_ea(ta, e);
    let ma = ea - e * libm::sin(ea);
    Ok(OrbitalElements {
        a,
        e,
        i,
        lan: lan.rem_euclid(consts::TAU),
        argpe: argpe.rem_euclid(consts::TAU),
        ma: ma.rem_euclid(consts::TAU),
        epoch,
    })
}

#[test]
fn kepler_residual_is_tiny_for_moderate_eccentricity() {
    for &(ma, e) in &[(1.5, 0.2056), (-2.9, 0.0549), (3.1, 0.751), (0.01, 0.95)] {
        let sol = solve_kepler(ma, e, KEPLER_TOL, KEPLER_MAXITER);
        assert!(sol.converged, "M={ma} e={e} did not converge");
        let residual = sol.ea - e * libm::sin(sol.ea) - wrap_pi(ma);
        assert!(residual.abs() < 1e-9, "M={ma} e={e} residual {residual}");
    }
}

#[test]
fn kepler_non_convergence_returns_best_effort() {
    let sol = solve_kepler(0.3, 0.999_999, KEPLER_TOL, 1);
    assert!(!sol.converged);
    assert!(sol.ea.is_finite());
    assert_eq!(sol.iterations, 1);
}

#[test]
fn open_orbits_are_rejected() {
    let elements = OrbitalElements {
        a: 10_000.0,
        e: 1.0,
        i: 0.0,
        lan: 0.0,
        argpe: 0.0,
        ma: 0.0,
        epoch: UT::J2000,
    };
    assert_eq!(
        elements.state_at(398_600.4, UT::new_seconds(60.0)),
        Err(UnsupportedOrbitError::Open(1.0))
    );
    let negative = OrbitalElements { a: -5.0, e: 0.1, ..elements };
    assert_eq!(
        negative.state_at(398_600.4, UT::J2000),
        Err(UnsupportedOrbitError::NonPositiveAxis(-5.0))
    );
}

#[test]
fn universal_propagation_matches_elements() {
    let mu = 398_600.4;
    let elements = OrbitalElements {
        a: 12_000.0,
        e: 0.3,
        i: 0.4,
        lan: 1.1,
        argpe: 2.2,
        ma: 0.5,
        epoch: UT::J2000,
    };
    let t = UT::new_seconds(5_000.0);
    let (r0, v0) = elements.state_at(mu, UT::J2000).unwrap();
    let (r1, v1) = elements.state_at(mu, t).unwrap();
    let (r, v) = propagate_universal(r0, v0, mu, 5_000.0, 1e-9, 500).unwrap();
    assert!((r - r1).norm() < 1e-3, "{r} vs {r1}");
    assert!((v - v1).norm() < 1e-6, "{v} vs {v1}");
}

#[test]
fn osculating_elements_recover_canonical_ones() {
    let mu = 126_686_531.9;
    let elements = OrbitalElements {
        a: 671_034.0,
        e: 0.009,
        i: 0.465f64.to_radians(),
        lan: 219.106f64.to_radians(),
        argpe: 88.970f64.to_radians(),
        ma: 29.298f64.to_radians(),
        epoch: UT::J2000,
    };
    let (r, v) = elements.state_at(mu, UT::J2000).unwrap();
    let osc = elements_from_state(r, v, mu, UT::J2000, 1e-8).unwrap();
    assert!((osc.a - elements.a).abs() < 1e-3);
    assert!((osc.e - elements.e).abs() < 1e-9);
    assert!((osc.i - elements.i).abs() < 1e-9);
    assert!((osc.lan - elements.lan).abs() < 1e-7);
    assert!((osc.argpe + osc.ma - elements.argpe - elements.ma).abs() < 1e-7);
}
