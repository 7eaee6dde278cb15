//! Inter-connect hub: a pure circuit node with no mesh footprint. Member
//! electrodes tie their circuit rows to the hub potential through their
//! series resistors; the hub itself is pinned to the applied voltage.

use nalgebra::DVector;

use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::physics::layout::EquationLayout;

use super::BoundaryCondition;

pub fn fill_value(
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    b: usize,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let (Some(slot), Some(ckt)) = (layout.electrode_offset(b), bc.circuit.as_ref()) else {
        return;
    };
    x[slot] = ckt.potential;
    l[slot] = 1.0;
}

pub fn assemble_residual(
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    b: usize,
    x: &[f64],
    f: &mut DVector<f64>,
    on_last_rank: bool,
) -> Result<(), Error> {
    let slot = layout
        .electrode_offset(b)
        .ok_or_else(|| Error::BoundaryConfiguration(format!("hub `{}` has no slot", bc.name)))?;
    let ckt = bc
        .circuit
        .as_ref()
        .ok_or_else(|| Error::BoundaryConfiguration(format!("hub `{}` has no circuit", bc.name)))?;
    if on_last_rank {
        f[slot] += x[slot] - ckt.v_app;
    }
    Ok(())
}

pub fn assemble_jacobian(
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    b: usize,
    jac: &mut AijMatrix,
    on_last_rank: bool,
) -> Result<(), Error> {
    let slot = layout
        .electrode_offset(b)
        .ok_or_else(|| Error::BoundaryConfiguration(format!("hub `{}` has no slot", bc.name)))?;
    if on_last_rank {
        jac.add(slot, slot, 1.0);
    }
    Ok(())
}

pub fn reserve_pattern(
    _bc: &BoundaryCondition,
    layout: &EquationLayout,
    b: usize,
    jac: &mut AijMatrix,
) {
    if let Some(slot) = layout.electrode_offset(b) {
        jac.reserve_entry(slot, slot);
    }
}
