//! Interface between two regions of the same material system: the shared
//! unknowns are continuous and the conservation statements merge. For each
//! variable live on both sides, the non-reference row is folded into the
//! reference row (summing the two half control volumes) and replaced by
//! the equality of the two unknowns.

use nalgebra::DVector;

use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::row_surgery::RowOps;
use crate::physics::layout::{EquationLayout, Variable};
use crate::physics::SimulationSystem;

use super::BoundaryCondition;

/// Variables live on both sides of a pair, with their in-node offsets
/// (reference side first).
fn shared_variables(
    layout: &EquationLayout,
    r0: usize,
    ri: usize,
) -> impl Iterator<Item = (usize, usize)> + '_ {
    Variable::ALL.into_iter().filter_map(move |v| {
        match (layout.offset(r0, v), layout.offset(ri, v)) {
            (Some(o0), Some(oi)) => Some((o0, oi)),
            _ => None,
        }
    })
}

/// Fold every non-reference conservation row into the reference row.
pub fn preprocess(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    ops: &mut RowOps,
) {
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let g0 = system.regions[r0].fvm_nodes[f0].global_offset;
        for &(ri, fi) in &bnode.pairs[1..] {
            let gi = system.regions[ri].fvm_nodes[fi].global_offset;
            for (o0, oi) in shared_variables(layout, r0, ri) {
                ops.redirect(gi + oi, g0 + o0);
            }
        }
    }
}

/// The redirected rows hold the continuity of the unknowns across the
/// interface: x_i - x_0 = 0.
pub fn assemble_residual(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    x: &[f64],
    f: &mut DVector<f64>,
) -> Result<(), Error> {
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let g0 = system.regions[r0].fvm_nodes[f0].global_offset;
        for &(ri, fi) in &bnode.pairs[1..] {
            let gi = system.regions[ri].fvm_nodes[fi].global_offset;
            for (o0, oi) in shared_variables(layout, r0, ri) {
                f[gi + oi] += x[gi + oi] - x[g0 + o0];
            }
        }
    }
    Ok(())
}

pub fn assemble_jacobian(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    jac: &mut AijMatrix,
) -> Result<(), Error> {
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let g0 = system.regions[r0].fvm_nodes[f0].global_offset;
        for &(ri, fi) in &bnode.pairs[1..] {
            let gi = system.regions[ri].fvm_nodes[fi].global_offset;
            for (o0, oi) in shared_variables(layout, r0, ri) {
                jac.add(gi + oi, gi + oi, 1.0);
                jac.add(gi + oi, g0 + o0, -1.0);
            }
        }
    }
    Ok(())
}

pub fn reserve_pattern(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    jac: &mut AijMatrix,
) {
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let g0 = system.regions[r0].fvm_nodes[f0].global_offset;
        for &(ri, fi) in &bnode.pairs[1..] {
            let gi = system.regions[ri].fvm_nodes[fi].global_offset;
            for (o0, oi) in shared_variables(layout, r0, ri) {
                jac.reserve_entry(gi + oi, gi + oi);
                jac.reserve_entry(gi + oi, g0 + o0);
            }
        }
    }
}
