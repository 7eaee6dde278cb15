//! Insulator regions carry no mobile carriers: a charge-free Poisson row
//! per node, plus lattice heat conduction when the temperature equation is
//! enabled. Same kernel-over-AD-scalar structure as the semiconductor
//! assembler, with a two-variable stencil at most.

use nalgebra::{DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};

use crate::discretization::mesh::Mesh;
use crate::discretization::region::{RegionEdge, SimulationRegion};
use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::transient::TimeScheme;
use crate::physics::layout::EquationLayout;
use crate::physics::region::{lit, VarIdx};
use crate::physics::AdScalar;

fn edge_kernel<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    edge: &RegionEdge,
    ua: &[T],
    ub: &[T],
    flux: &mut [T],
) {
    let mat = &region.material;
    let h = edge.length;
    let area = edge.cv_area;
    flux[idx.psi] =
        (ub[idx.psi].clone() - ua[idx.psi].clone()) * (mat.eps() / h) * area;
    if let Some(ot) = idx.t {
        flux[ot] = (ua[ot].clone() - ub[ot].clone()) * (mat.kappa / h) * area;
    }
}

fn time_kernel<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    t_last: f64,
    t_last2: f64,
    volume: f64,
    scheme: &TimeScheme,
    u: &[T],
    out: &mut [T],
) {
    let Some(ot) = idx.t else {
        return;
    };
    let (c0, c1, c2) = match *scheme {
        TimeScheme::Steady => return,
        TimeScheme::Bdf1 { dt } => (1.0 / dt, -1.0 / dt, 0.0),
        TimeScheme::Bdf2 { dt, dt_last } => {
            let (h, h1) = (dt, dt_last);
            (
                (2.0 * h + h1) / (h * (h + h1)),
                -(h + h1) / (h * h1),
                h / (h1 * (h + h1)),
            )
        }
    };
    let c = region.material.heat_capacity;
    out[ot] += (u[ot].clone() * c0 + lit::<T>(c1 * t_last + c2 * t_last2)) * (c * volume);
}

pub fn fill_value(
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let eps = region.material.eps();
    for fvm in &region.fvm_nodes {
        let g = fvm.global_offset;
        let data = &region.node_data[fvm.data];
        let inv_vol = 1.0 / fvm.volume;
        x[g + idx.psi] = data.psi;
        l[g + idx.psi] = inv_vol / eps;
        if let Some(o) = idx.t {
            x[g + o] = data.t;
            l[g + o] = inv_vol;
        }
    }
}

pub fn assemble_residual(
    _mesh: &Mesh,
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &[f64],
    f: &mut DVector<f64>,
    time: &TimeScheme,
) -> Result<(), Error> {
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let m = idx.m;
    let mut flux = vec![0.0f64; m];
    for edge in &region.edges {
        let (a, b) = edge.nodes;
        let ga = region.fvm_nodes[a].global_offset;
        let gb = region.fvm_nodes[b].global_offset;
        flux.fill(0.0);
        edge_kernel(region, &idx, edge, &x[ga..ga + m], &x[gb..gb + m], &mut flux);
        for o in 0..m {
            f[ga + o] += flux[o];
            f[gb + o] -= flux[o];
        }
    }
    let mut out = vec![0.0f64; m];
    for fvm in &region.fvm_nodes {
        let g = fvm.global_offset;
        let data = &region.node_data[fvm.data];
        out.fill(0.0);
        time_kernel(
            region,
            &idx,
            data.t_last,
            data.t_last2,
            fvm.volume,
            time,
            &x[g..g + m],
            &mut out,
        );
        for o in 0..m {
            f[g + o] += out[o];
        }
    }
    for fvm in &region.fvm_nodes {
        for o in 0..m {
            if !f[fvm.global_offset + o].is_finite() {
                return Err(Error::StencilInvariantViolation {
                    region: region.name.clone(),
                    node: fvm.node,
                    variable: "residual",
                });
            }
        }
    }
    Ok(())
}

pub fn assemble_jacobian(
    _mesh: &Mesh,
    region: &SimulationRegion,
    layout: &EquationLayout,
    r_idx: usize,
    x: &[f64],
    jac: &mut AijMatrix,
    time: &TimeScheme,
) -> Result<(), Error> {
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let m = idx.m;
    let seed = |g: usize, ndir: usize, base: usize| -> Vec<DualDVec64> {
        (0..m)
            .map(|j| {
                let eps = Derivative::derivative_generic(Dyn(ndir), U1, base + j);
                DualDVec64::new(x[g + j], eps)
            })
            .collect()
    };
    for edge in &region.edges {
        let (a, b) = edge.nodes;
        let ga = region.fvm_nodes[a].global_offset;
        let gb = region.fvm_nodes[b].global_offset;
        let ndir = 2 * m;
        let ua = seed(ga, ndir, 0);
        let ub = seed(gb, ndir, m);
        let mut flux = vec![DualDVec64::from_re(0.0); m];
        edge_kernel(region, &idx, edge, &ua, &ub, &mut flux);
        for o in 0..m {
            let eps = flux[o].eps.clone().unwrap_generic(Dyn(ndir), U1);
            for j in 0..m {
                if eps[(j, 0)] != 0.0 {
                    jac.add(ga + o, ga + j, eps[(j, 0)]);
                    jac.add(gb + o, ga + j, -eps[(j, 0)]);
                }
                if eps[(m + j, 0)] != 0.0 {
                    jac.add(ga + o, gb + j, eps[(m + j, 0)]);
                    jac.add(gb + o, gb + j, -eps[(m + j, 0)]);
                }
            }
        }
    }
    for fvm in &region.fvm_nodes {
        let g = fvm.global_offset;
        let data = &region.node_data[fvm.data];
        let u = seed(g, m, 0);
        let mut out = vec![DualDVec64::from_re(0.0); m];
        time_kernel(
            region,
            &idx,
            data.t_last,
            data.t_last2,
            fvm.volume,
            time,
            &u,
            &mut out,
        );
        for o in 0..m {
            let eps = out[o].eps.clone().unwrap_generic(Dyn(m), U1);
            for j in 0..m {
                if eps[(j, 0)] != 0.0 {
                    jac.add(g + o, g + j, eps[(j, 0)]);
                }
            }
        }
    }
    Ok(())
}
