pub mod insulator;
pub mod semiconductor;

use nalgebra::DVector;

use crate::discretization::mesh::Mesh;
use crate::discretization::region::{RegionKind, SimulationRegion};
use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::transient::TimeScheme;
use crate::physics::layout::{EquationLayout, RegionLayout, Variable};
use crate::physics::AdScalar;

/// In-node positions of the live variables of one region; `None` when the
/// variable is not part of the solve. Snapshot of the region layout taken
/// once per assembly call.
#[derive(Clone, Copy, Debug)]
pub struct VarIdx {
    pub psi: usize,
    pub n: Option<usize>,
    pub p: Option<usize>,
    pub t: Option<usize>,
    pub tn: Option<usize>,
    pub tp: Option<usize>,
    pub m: usize,
}

impl VarIdx {
    pub fn from_layout(rl: &RegionLayout) -> Self {
        Self {
            // potential is live in every family
            psi: rl.offset(Variable::Potential).unwrap_or(0),
            n: rl.offset(Variable::Electron),
            p: rl.offset(Variable::Hole),
            t: rl.offset(Variable::Temperature),
            tn: rl.offset(Variable::ElectronTemp),
            tp: rl.offset(Variable::HoleTemp),
            m: rl.n_variables,
        }
    }
}

/// Shorthand for lifting an `f64` constant into the kernel scalar.
#[inline]
pub(crate) fn lit<T: AdScalar>(x: f64) -> T {
    T::from_f64(x).unwrap()
}

/// Load x and the diagonal scaling vector L from the region's node data:
/// potential rows scale with 1/(eps * volume), all carrier/temperature rows
/// with 1/volume. Also seeds the electrode-independent part of the initial
/// guess.
pub fn fill_value(
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    match region.kind {
        RegionKind::Semiconductor => semiconductor::fill_value(region, layout, r_idx, x, l),
        RegionKind::Insulator => insulator::fill_value(region, layout, r_idx, x, l),
    }
}

pub fn assemble_residual(
    mesh: &Mesh,
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &[f64],
    f: &mut DVector<f64>,
    time: &TimeScheme,
) -> Result<(), Error> {
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::assemble_residual(mesh, region, layout, r_idx, x, f, time)
        }
        RegionKind::Insulator => {
            insulator::assemble_residual(mesh, region, layout, r_idx, x, f, time)
        }
    }
}

pub fn assemble_jacobian(
    mesh: &Mesh,
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &[f64],
    jac: &mut AijMatrix,
    time: &TimeScheme,
) -> Result<(), Error> {
    match region.kind {
        RegionKind::Semiconductor => {
            semiconductor::assemble_jacobian(mesh, region, layout, r_idx, x, jac, time)
        }
        RegionKind::Insulator => {
            insulator::assemble_jacobian(mesh, region, layout, r_idx, x, jac, time)
        }
    }
}

/// How `update_solution` treats the history slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeAdvance {
    /// Overwrite the current values only (steady solves, recovery reloads).
    Steady,
    /// Shift current -> last -> last2 before storing (accepted time step).
    Step,
}

/// Store an accepted solution back into the node data, refreshing the
/// derived per-node quantities (field magnitude, recombination).
pub fn update_solution(
    mesh: &Mesh,
    region: &mut SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &[f64],
    advance: TimeAdvance,
) {
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let e_fields = semiconductor::node_e_fields(mesh, region, &idx, x);
    let t_ambient = region.t_external;
    let material = region.material.clone();
    for fvm in 0..region.fvm_nodes.len() {
        let g = region.fvm_nodes[fvm].global_offset;
        let di = region.fvm_nodes[fvm].data;
        let data = &mut region.node_data[di];
        if advance == TimeAdvance::Step {
            data.psi_last2 = data.psi_last;
            data.n_last2 = data.n_last;
            data.p_last2 = data.p_last;
            data.t_last2 = data.t_last;
            data.tn_last2 = data.tn_last;
            data.tp_last2 = data.tp_last;
            data.psi_last = data.psi;
            data.n_last = data.n;
            data.p_last = data.p;
            data.t_last = data.t;
            data.tn_last = data.tn;
            data.tp_last = data.tp;
        }
        data.psi = x[g + idx.psi];
        if let Some(o) = idx.n {
            data.n = x[g + o];
        }
        if let Some(o) = idx.p {
            data.p = x[g + o];
        }
        data.t = idx.t.map_or(t_ambient, |o| x[g + o]);
        data.tn = idx.tn.map_or(data.t, |o| x[g + o]);
        data.tp = idx.tp.map_or(data.t, |o| x[g + o]);
        data.e_field = e_fields[fvm];
        if region.kind == RegionKind::Semiconductor {
            let nie = material.nie(data.t);
            data.recomb = material.srh(data.n, data.p, nie);
        }
    }
}
