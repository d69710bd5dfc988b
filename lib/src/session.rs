//! A running simulation: registry, dynamics, calculator and clock.

use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
    bodies::{BodyId, BodyRegistry},
    state::{BodyState, DynamicsStore, StateError, StateVectorCalculator, SystemSnapshot},
    time::{SimClock, UT},
};

pub struct Simulation {
    calculator: StateVectorCalculator,
    clock: SimClock,
    /// Topological index of every body.
    order: HashMap<BodyId, usize>,
    last_known: HashMap<BodyId, BodyState>,
}

impl Simulation {
    pub fn new(registry: Arc<BodyRegistry>, start: UT) -> Self {
        let order = registry
            .topological_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        Self {
            calculator: StateVectorCalculator::new(registry, DynamicsStore::new()),
            clock: SimClock::new(start),
            order,
            last_known: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<BodyRegistry> {
        self.calculator.registry()
    }

    /// Handle for the external dynamics source.
    pub fn dynamics(&self) -> &DynamicsStore {
        self.calculator.dynamics()
    }

    pub fn calculator(&self) -> &StateVectorCalculator {
        &self.calculator
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut SimClock {
        &mut self.clock
    }

    pub fn now(&self) -> UT {
        self.clock.now()
    }

    /// Advance the clock by `wall_dt` wall-clock seconds and resolve every
    /// body at the new time.
    pub fn tick(&mut self, wall_dt: f64) -> Result<SystemSnapshot, StateError> {
        self.clock.advance(wall_dt);
        self.snapshot()
    }

    /// Resolve every body at the current time. Bodies that cannot be
    /// resolved keep their last known state, marked stale.
    pub fn snapshot(&mut self) -> Result<SystemSnapshot, StateError> {
        let mut snapshot = self.calculator.snapshot(self.clock.now())?;
        for body in &snapshot.bodies {
            self.last_known.insert(body.id, *body);
        }
        let mut carried = false;
        for (id, error) in &snapshot.skipped {
            if let Some(last) = self.last_known.get(id) {
                debug!(body = %id, %error, since = %last.state.epoch, "using stale state");
                snapshot.bodies.push(BodyState {
                    stale: true,
                    ..*last
                });
                carried = true;
            }
        }
        if carried {
            snapshot
                .bodies
                .sort_by_key(|b| self.order.get(&b.id).copied().unwrap_or(usize::MAX));
        }
        Ok(snapshot)
    }
}
