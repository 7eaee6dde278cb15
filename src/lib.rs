//! Finite-volume equation engine for coupled drift-diffusion / energy-balance
//! semiconductor transport on unstructured meshes.
//!
//! The crate is split the same way the solve is: `discretization` holds the
//! mesh and per-region control-volume bookkeeping, `physics` holds the
//! material models, the unknown layout and the residual/Jacobian assemblers
//! (region interiors and boundary/interface stitching), and `numerics` holds
//! the sparse matrix, row surgery, the damped Newton orchestrator and the
//! adaptive time stepper.

pub mod discretization;
pub mod error;
pub mod numerics;
pub mod physics;

pub use error::Error;
pub use physics::SimulationSystem;
