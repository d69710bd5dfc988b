//! Two-body orbital mechanics.
pub mod orbits;

pub use orbits::{
    elements_from_state, propagate_universal, solve_kepler, KeplerSolution, OrbitalElements,
    PropagationError, ReferenceFrame, StateVector, UnsupportedOrbitError,
};
