//! Patched-conic trajectory tracing.

use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Duration;
use tracing::trace;

use crate::{
    bodies::{BodyId, BodyRegistry, Positioning},
    kepler::{propagate_universal, PropagationError},
    soi::{SoiTransition, SoiTransitionDetector, TrajectorySample},
    state::{DynamicsStore, StateError, StateVectorCalculator},
    time::UT,
};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    #[error("trace step must be finite and positive, got {0} s")]
    InvalidStep(f64),
    #[error("start state about {0} is not finite")]
    InvalidStart(BodyId),
    #[error("{0}")]
    Worker(String),
}

/// Current state of a traced entity, relative to its central body in world
/// axes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub time: UT,
    pub central_body: BodyId,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl From<TracePoint> for TrajectorySample {
    fn from(point: TracePoint) -> Self {
        TrajectorySample {
            time: point.time,
            central_body: point.central_body,
            position: point.position,
            velocity: point.velocity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Number of samples per trace, including the start point.
    pub samples: usize,
    /// Time between samples (s).
    pub step: f64,
    pub tol: f64,
    pub maxiter: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            samples: 240,
            step: 600.0,
            tol: 1e-7,
            maxiter: 500,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub samples: Vec<TrajectorySample>,
    pub transitions: Vec<SoiTransition>,
}

/// Propagates entities on two-body arcs, switching central body at sphere
/// of influence boundaries.
///
/// Bodies positioned by an external source are placed on their fallback
/// orbits; the tracer never reads the session's dynamics store.
#[derive(Clone, Debug)]
pub struct PatchedConicTracer {
    calculator: StateVectorCalculator,
    config: TraceConfig,
}

impl PatchedConicTracer {
    pub fn new(registry: Arc<BodyRegistry>, config: TraceConfig) -> Self {
        Self {
            calculator: StateVectorCalculator::new(registry, DynamicsStore::new()),
            config,
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn trace(&self, start: &TracePoint) -> Result<Trace, TraceError> {
        let TraceConfig {
            samples: count,
            step,
            tol,
            maxiter,
        } = self.config;
        if !step.is_finite() || step <= 0.0 {
            return Err(TraceError::InvalidStep(step));
        }
        // the whole span must fit in a `Duration` past the start time
        let span = step * count.saturating_sub(1) as f64;
        let (Some(step_duration), Some(_)) = (
            Duration::checked_seconds_f64(step),
            Duration::checked_seconds_f64(span).and_then(|span| start.time.checked_add(span)),
        ) else {
            return Err(TraceError::InvalidStep(step));
        };
        if !start.position.iter().chain(start.velocity.iter()).all(|x| x.is_finite()) {
            return Err(TraceError::InvalidStart(start.central_body));
        }
        let registry = self.calculator.registry();
        registry.body(start.central_body).map_err(StateError::from)?;

        let mut samples = Vec::with_capacity(count);
        let mut cur = TrajectorySample::from(*start);
        samples.push(cur);
        for _ in 1..count {
            let mu = registry.body(cur.central_body).map_err(StateError::from)?.gm;
            let (position, velocity) =
                propagate_universal(cur.position, cur.velocity, mu, step, tol, maxiter)?;
            let time = cur
                .time
                .checked_add(step_duration)
                .ok_or(TraceError::InvalidStep(step))?;
            cur = self.retag(TrajectorySample {
                time,
                position,
                velocity,
                ..cur
            })?;
            samples.push(cur);
        }

        let transitions = SoiTransitionDetector::new(&self.calculator).find_transitions(&samples)?;
        Ok(Trace {
            samples,
            transitions,
        })
    }

    /// `point` re-expressed about the body whose sphere of influence
    /// contains it, using the same rule as [`trace`](Self::trace).
    pub fn recenter(&self, point: &TracePoint) -> Result<TracePoint, StateError> {
        let sample = self.retag(TrajectorySample::from(*point))?;
        Ok(TracePoint {
            time: sample.time,
            central_body: sample.central_body,
            position: sample.position,
            velocity: sample.velocity,
        })
    }

    /// Re-express `sample` about the body whose sphere of influence
    /// currently contains it.
    ///
    /// Leaves towards the root while outside the central body's sphere, then
    /// enters the closest candidate whose sphere contains the sample.
    /// Candidates are the central body's children, plus its siblings when it
    /// is the counterweight of a barycenter.
    fn retag(&self, sample: TrajectorySample) -> Result<TrajectorySample, StateError> {
        let registry = self.calculator.registry();
        let time = sample.time;
        let origin = self.calculator.state_of(sample.central_body, time)?;
        let world_p = origin.position + sample.position;
        let world_v = origin.velocity + sample.velocity;

        let mut central = sample.central_body;
        let mut central_pos = origin.position;
        loop {
            let body = registry.body(central)?;
            match (body.parent, body.soi_radius) {
                (Some(parent), Some(soi)) if (world_p - central_pos).norm() > soi => {
                    trace!(from = %central, to = %parent, %time, "leaving sphere of influence");
                    central = parent;
                    central_pos = self.calculator.state_of(parent, time)?.position;
                }
                _ => break,
            }
        }

        loop {
            let body = registry.body(central)?;
            let siblings: &[BodyId] = match (&body.positioning, body.parent) {
                (Positioning::Counterweight, Some(parent)) => registry.children(parent),
                _ => &[],
            };
            let mut closest: Option<(f64, BodyId, Vector3<f64>)> = None;
            for &candidate in registry.children(central).iter().chain(siblings) {
                if candidate == central {
                    continue;
                }
                let Some(soi) = registry.body(candidate)?.soi_radius else {
                    continue;
                };
                let pos = match self.calculator.state_of(candidate, time) {
                    Ok(state) => state.position,
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(_) => continue,
                };
                let distance = (world_p - pos).norm();
                if distance < soi && closest.map_or(true, |(d, _, _)| distance < d) {
                    closest = Some((distance, candidate, pos));
                }
            }
            match closest {
                Some((_, candidate, pos)) => {
                    trace!(from = %central, to = %candidate, %time, "entering sphere of influence");
                    central = candidate;
                    central_pos = pos;
                }
                None => break,
            }
        }

        if central == sample.central_body {
            return Ok(sample);
        }
        let central_v = self.calculator.state_of(central, time)?.velocity;
        Ok(TrajectorySample {
            time,
            central_body: central,
            position: world_p - central_pos,
            velocity: world_v - central_v,
        })
    }
}
