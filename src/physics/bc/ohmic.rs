//! Ohmic contact: infinite recombination velocity, charge neutrality and
//! thermal equilibrium at the contact (Boltzmann statistics), plus the
//! lumped external circuit equation in the electrode slot.
//!
//! The contact current is not recomputed from fluxes: the preprocess step
//! reads the electron/hole continuity rows the region pass just assembled
//! (the exact discrete current entering the contact) before they are
//! cleared, and the Jacobian preprocess harvests the same rows' entries
//! for the circuit row. Displacement current through the contact is added
//! from the potential history in the same pass.

use nalgebra::{DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};

use crate::discretization::region::{RegionKind, SimulationRegion};
use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::row_surgery::RowOps;
use crate::numerics::transient::TimeScheme;
use crate::physics::layout::EquationLayout;
use crate::physics::material::consts::E as Q;
use crate::physics::region::{lit, VarIdx};
use crate::physics::{AdScalar, SimulationSystem};

use super::{BcScratch, BoundaryCondition};

#[derive(Clone, Copy, Debug, Default)]
pub struct OhmicContact {
    /// Heat exchange coefficient h of the contact [W/(m^2 K)]; adds
    /// h (T_ext - T) S to the lattice heat row when the temperature
    /// equation is live.
    pub heat_transfer: f64,
}

fn contact(bc: &BoundaryCondition) -> &OhmicContact {
    match &bc.variant {
        super::BcVariant::OhmicContact(c) => c,
        _ => unreachable!("dispatched on variant"),
    }
}

/// Contact equations of the reference (semiconductor) control volume,
/// generic over the AD scalar. `u` is the node's unknown block, `ve` the
/// electrode potential; writes one replacement equation per cleared row
/// into `out` and the additive heat-exchange term into `out[t]`.
fn contact_equations<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    dop: f64,
    contact: &OhmicContact,
    area: f64,
    u: &[T],
    ve: T,
    out: &mut [T],
) {
    let mat = &region.material;
    let tl: T = match idx.t {
        Some(o) => u[o].clone(),
        None => lit(region.t_external),
    };
    let vt = mat.vt(tl.clone());
    let nie = mat.nie(tl.clone());

    // psi: thermal-equilibrium boundary potential against the electrode
    let band = mat.affinity + 0.5 * mat.eg;
    let dos_shift = if mat.nc > 0.0 && mat.nv > 0.0 {
        0.5 * (mat.nc / mat.nv).ln()
    } else {
        0.0
    };
    let asinh_arg = (nie.clone().recip() * (0.5 * dop)).asinh();
    out[idx.psi] = u[idx.psi].clone() + lit::<T>(band) + vt.clone() * dos_shift
        - vt * asinh_arg
        - ve;

    // n, p: charge-neutral equilibrium densities
    if let (Some(on), Some(op)) = (idx.n, idx.p) {
        let nie2 = nie.clone() * nie;
        let disc = (nie2.clone() * 4.0 + lit::<T>(dop * dop)).sqrt();
        // take the majority density from the quadratic and the minority
        // from n_e p_e = nie^2 to avoid cancellation at heavy doping
        let (ne, pe): (T, T) = if dop >= 0.0 {
            let ne = (disc + dop) * 0.5;
            let pe = nie2 / ne.clone();
            (ne, pe)
        } else {
            let pe = (disc - dop) * 0.5;
            let ne = nie2 / pe.clone();
            (ne, pe)
        };
        out[on] = u[on].clone() - ne;
        out[op] = u[op].clone() - pe;

        // carrier temperatures equilibrate with the lattice
        if let Some(otn) = idx.tn {
            out[otn] = u[on].clone() * (u[otn].clone() - tl.clone());
        }
        if let Some(otp) = idx.tp {
            out[otp] = u[op].clone() * (u[otp].clone() - tl.clone());
        }
    }

    // lattice heat exchange with the contact metal (additive)
    if let Some(ot) = idx.t {
        out[ot] = (lit::<T>(region.t_external) - tl) * (contact.heat_transfer * area);
    }
}

/// BDF weights of d/dt over (now, last, last2) potential levels.
fn dpsi_dt_coefficients(time: &TimeScheme) -> Option<(f64, f64, f64)> {
    match *time {
        TimeScheme::Steady => None,
        TimeScheme::Bdf1 { dt } => Some((1.0 / dt, -1.0 / dt, 0.0)),
        TimeScheme::Bdf2 { dt, dt_last } => {
            let (h, h1) = (dt, dt_last);
            Some((
                (2.0 * h + h1) / (h * (h + h1)),
                -(h + h1) / (h * h1),
                h / (h1 * (h + h1)),
            ))
        }
    }
}

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
    l[slot] = 1.0 / ((1.0 + ckt.r) * bc.z_width);
}

/// Harvest the contact current from the assembled continuity rows and the
/// displacement current from the potential history; emit the clear/redirect
/// instructions for every boundary row.
#[allow(clippy::too_many_arguments)]
pub fn preprocess_residual(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    x: &[f64],
    f: &DVector<f64>,
    time: &TimeScheme,
    ops: &mut RowOps,
    scratch: &mut BcScratch,
) {
    scratch.current = 0.0;
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let region = &system.regions[r0];
        let idx = VarIdx::from_layout(layout.region(r0));
        let fvm = &region.fvm_nodes[f0];
        let g = fvm.global_offset;

        if let (Some(on), Some(op)) = (idx.n, idx.p) {
            // exact discrete conduction current into the contact
            scratch.current += Q * (f[g + op] - f[g + on]) * bc.z_width;
            ops.clear_row(g + on);
            ops.clear_row(g + op);
        }
        ops.clear_row(g + idx.psi);
        if let Some(o) = idx.tn {
            ops.clear_row(g + o);
        }
        if let Some(o) = idx.tp {
            ops.clear_row(g + o);
        }

        // displacement current through the contact's control surfaces
        if let Some((c0, c1, c2)) = dpsi_dt_coefficients(time) {
            let data = region.data(f0);
            for link in &fvm.neighbors {
                let nb = &region.fvm_nodes[link.fvm];
                let nb_data = &region.node_data[nb.data];
                let edge = &region.edges[link.edge];
                let dv_now = x[g + idx.psi] - x[nb.global_offset + idx.psi];
                let dv_last = data.psi_last - nb_data.psi_last;
                let dv_last2 = data.psi_last2 - nb_data.psi_last2;
                let de_dt = (c0 * dv_now + c1 * dv_last + c2 * dv_last2) / edge.length;
                scratch.current +=
                    region.material.eps() * edge.cv_area * de_dt * bc.z_width;
            }
        }

        // insulator control volumes under the contact edge
        for &(ri, fi) in &bnode.pairs[1..] {
            let region_i = &system.regions[ri];
            if region_i.kind == RegionKind::Semiconductor {
                continue;
            }
            let idx_i = VarIdx::from_layout(layout.region(ri));
            let gi = region_i.fvm_nodes[fi].global_offset;
            ops.clear_row(gi + idx_i.psi);
            // fold the insulator's heat balance into the reference row
            if let (Some(oi), Some(o0)) = (idx_i.t, idx.t) {
                ops.redirect(gi + oi, g + o0);
            }
        }
    }
}

/// Write the contact equations and the circuit row. The continuity, psi
/// and carrier-temperature rows were cleared by the surgery step.
#[allow(clippy::too_many_arguments)]
pub fn assemble_residual(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    x: &[f64],
    f: &mut DVector<f64>,
    time: &TimeScheme,
    scratch: &BcScratch,
    on_last_rank: bool,
) -> Result<(), Error> {
    let slot = bc
        .electrode_slot
        .ok_or_else(|| Error::BoundaryConfiguration(format!("`{}` has no slot", bc.name)))?;
    let ckt = bc
        .circuit
        .as_ref()
        .ok_or_else(|| Error::BoundaryConfiguration(format!("`{}` has no circuit", bc.name)))?;
    let ve = x[slot];
    let ohmic = contact(bc);

    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let region = &system.regions[r0];
        let idx = VarIdx::from_layout(layout.region(r0));
        let g = region.fvm_nodes[f0].global_offset;
        let dop = region.data(f0).net_doping();

        let mut out = vec![0.0f64; idx.m];
        contact_equations(
            region,
            &idx,
            dop,
            ohmic,
            bnode.area,
            &x[g..g + idx.m],
            ve,
            &mut out,
        );
        for o in 0..idx.m {
            f[g + o] += out[o];
        }

        // insulator pairs: potential continuity with the reference side
        for &(ri, fi) in &bnode.pairs[1..] {
            let region_i = &system.regions[ri];
            if region_i.kind == RegionKind::Semiconductor {
                continue;
            }
            let idx_i = VarIdx::from_layout(layout.region(ri));
            let gi = region_i.fvm_nodes[fi].global_offset;
            f[gi + idx_i.psi] += x[gi + idx_i.psi] - x[g + idx.psi];
        }
    }

    if on_last_rank {
        let v_hub = bc
            .inter_connect
            .and_then(|hub| layout.electrode_offset(hub))
            .map(|s| x[s]);
        let coef = ckt.current_coef(time, bc.inter_connect.is_some());
        f[slot] += ckt.residual_core(ve, time, v_hub) + coef * scratch.current;
    }
    Ok(())
}

/// Harvest d(contact current)/d(unknowns) from the continuity rows of the
/// contact node and emit the same surgery instructions as the residual
/// preprocess.
pub fn preprocess_jacobian(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    jac: &AijMatrix,
    time: &TimeScheme,
    ops: &mut RowOps,
    scratch: &mut BcScratch,
) {
    scratch.electrode_row.clear();
    let Some(ckt) = bc.circuit.as_ref() else {
        return;
    };
    let coef = ckt.current_coef(time, bc.inter_connect.is_some());
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let region = &system.regions[r0];
        let idx = VarIdx::from_layout(layout.region(r0));
        let fvm = &region.fvm_nodes[f0];
        let g = fvm.global_offset;

        if let (Some(on), Some(op)) = (idx.n, idx.p) {
            for &(col, v) in jac.row(g + op) {
                scratch.electrode_row.push((col, coef * Q * v * bc.z_width));
            }
            for &(col, v) in jac.row(g + on) {
                scratch.electrode_row.push((col, -coef * Q * v * bc.z_width));
            }
            ops.clear_row(g + on);
            ops.clear_row(g + op);
        }
        ops.clear_row(g + idx.psi);
        if let Some(o) = idx.tn {
            ops.clear_row(g + o);
        }
        if let Some(o) = idx.tp {
            ops.clear_row(g + o);
        }

        // displacement current sensitivities
        if let Some((c0, _, _)) = dpsi_dt_coefficients(time) {
            for link in &fvm.neighbors {
                let nb = &region.fvm_nodes[link.fvm];
                let edge = &region.edges[link.edge];
                let d = coef * region.material.eps() * edge.cv_area * c0 / edge.length
                    * bc.z_width;
                scratch.electrode_row.push((g + idx.psi, d));
                scratch.electrode_row.push((nb.global_offset + idx.psi, -d));
            }
        }

        for &(ri, fi) in &bnode.pairs[1..] {
            let region_i = &system.regions[ri];
            if region_i.kind == RegionKind::Semiconductor {
                continue;
            }
            let idx_i = VarIdx::from_layout(layout.region(ri));
            let gi = region_i.fvm_nodes[fi].global_offset;
            ops.clear_row(gi + idx_i.psi);
            if let (Some(oi), Some(o0)) = (idx_i.t, idx.t) {
                ops.redirect(gi + oi, g + o0);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn assemble_jacobian(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    x: &[f64],
    jac: &mut AijMatrix,
    time: &TimeScheme,
    scratch: &BcScratch,
    on_last_rank: bool,
) -> Result<(), Error> {
    let slot = bc
        .electrode_slot
        .ok_or_else(|| Error::BoundaryConfiguration(format!("`{}` has no slot", bc.name)))?;
    let ckt = bc
        .circuit
        .as_ref()
        .ok_or_else(|| Error::BoundaryConfiguration(format!("`{}` has no circuit", bc.name)))?;
    let ohmic = contact(bc);

    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let region = &system.regions[r0];
        let idx = VarIdx::from_layout(layout.region(r0));
        let g = region.fvm_nodes[f0].global_offset;
        let dop = region.data(f0).net_doping();
        let m = idx.m;

        // seed the node block plus the electrode potential (direction m)
        let ndir = m + 1;
        let u: Vec<DualDVec64> = (0..m)
            .map(|j| {
                DualDVec64::new(x[g + j], Derivative::derivative_generic(Dyn(ndir), U1, j))
            })
            .collect();
        let ve = DualDVec64::new(
            x[slot],
            Derivative::derivative_generic(Dyn(ndir), U1, m),
        );
        let mut out = vec![DualDVec64::from_re(0.0); m];
        contact_equations(region, &idx, dop, ohmic, bnode.area, &u, ve, &mut out);
        for o in 0..m {
            let eps = out[o].eps.clone().unwrap_generic(Dyn(ndir), U1);
            for j in 0..m {
                if eps[(j, 0)] != 0.0 {
                    jac.add(g + o, g + j, eps[(j, 0)]);
                }
            }
            if eps[(m, 0)] != 0.0 {
                jac.add(g + o, slot, eps[(m, 0)]);
            }
        }

        for &(ri, fi) in &bnode.pairs[1..] {
            let region_i = &system.regions[ri];
            if region_i.kind == RegionKind::Semiconductor {
                continue;
            }
            let idx_i = VarIdx::from_layout(layout.region(ri));
            let gi = region_i.fvm_nodes[fi].global_offset;
            jac.add(gi + idx_i.psi, gi + idx_i.psi, 1.0);
            jac.add(gi + idx_i.psi, g + idx.psi, -1.0);
        }
    }

    if on_last_rank {
        jac.add(slot, slot, ckt.d_core_d_ve(time, bc.inter_connect.is_some()));
        if let Some(hub_slot) = bc
            .inter_connect
            .and_then(|hub| layout.electrode_offset(hub))
        {
            jac.add(slot, hub_slot, -1.0);
        }
        for &(col, v) in &scratch.electrode_row {
            jac.add(slot, col, v);
        }
    }
    Ok(())
}

/// Reserve every position the boundary pass writes: the node-block columns
/// of the replacement equations, the electrode column of each boundary
/// row, and the circuit row's stencil over the contact nodes and their
/// neighbors.
pub fn reserve_pattern(
    system: &SimulationSystem,
    bc: &BoundaryCondition,
    layout: &EquationLayout,
    jac: &mut AijMatrix,
) {
    let Some(slot) = bc.electrode_slot else {
        return;
    };
    jac.reserve_entry(slot, slot);
    if let Some(hub_slot) = bc
        .inter_connect
        .and_then(|hub| layout.electrode_offset(hub))
    {
        jac.reserve_entry(slot, hub_slot);
    }
    for bnode in &bc.nodes {
        let (r0, f0) = bnode.pairs[0];
        let region = &system.regions[r0];
        let idx = VarIdx::from_layout(layout.region(r0));
        let fvm = &region.fvm_nodes[f0];
        let g = fvm.global_offset;
        for o in 0..idx.m {
            jac.reserve_entry(g + o, slot);
            jac.reserve_entry(slot, g + o);
            for j in 0..idx.m {
                jac.reserve_entry(g + o, g + j);
            }
        }
        for link in &fvm.neighbors {
            let nb_g = region.fvm_nodes[link.fvm].global_offset;
            for o in 0..idx.m {
                jac.reserve_entry(slot, nb_g + o);
            }
        }
        for &(ri, fi) in &bnode.pairs[1..] {
            let region_i = &system.regions[ri];
            let idx_i = VarIdx::from_layout(layout.region(ri));
            let gi = region_i.fvm_nodes[fi].global_offset;
            jac.reserve_entry(gi + idx_i.psi, gi + idx_i.psi);
            jac.reserve_entry(gi + idx_i.psi, g + idx.psi);
        }
    }
}
