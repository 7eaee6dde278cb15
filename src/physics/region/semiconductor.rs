//! Residual and Jacobian assembly of a semiconductor region: Poisson +
//! Scharfetter-Gummel electron/hole continuity, with optional lattice heat
//! and carrier energy balance rows, impact ionization and band-to-band
//! tunneling.
//!
//! Every physics expression lives in a kernel generic over the AD scalar;
//! the residual path instantiates it with `f64`, the Jacobian path with
//! `num_dual::DualDVec64` seeded over the stencil unknowns. The two paths
//! can therefore never drift apart.

use nalgebra::{DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};
use rayon::prelude::*;

use crate::discretization::mesh::{least_squares_gradient, Mesh};
use crate::discretization::region::{FvmNodeData, RegionEdge, SimulationRegion};
use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::transient::TimeScheme;
use crate::physics::layout::EquationLayout;
use crate::physics::material::consts::{E as Q, KB};
use crate::physics::region::{lit, VarIdx};
use crate::physics::sg::{sg_electron, sg_hole};
use crate::physics::AdScalar;

/// Per-edge quantities frozen over one Newton evaluation: field-adjusted
/// mobilities and the parallel field magnitude they were derived from.
#[derive(Clone, Copy, Debug)]
pub struct EdgeFrozen {
    pub mun: f64,
    pub mup: f64,
    pub ep: f64,
}

/// |grad psi| per node, from the least-squares vertex gradient over the
/// control-volume neighbors. Shared by the residual and Jacobian passes;
/// the field enters generation and mobility models as a frozen scalar.
pub fn node_e_fields(
    mesh: &Mesh,
    region: &SimulationRegion,
    idx: &VarIdx,
    x: &[f64],
) -> Vec<f64> {
    let mut fields = Vec::with_capacity(region.fvm_nodes.len());
    let mut scratch = Vec::new();
    for fvm in &region.fvm_nodes {
        scratch.clear();
        let psi0 = x[fvm.global_offset + idx.psi];
        for link in &fvm.neighbors {
            let nb = &region.fvm_nodes[link.fvm];
            scratch.push((
                mesh.nodes[nb.node].position,
                x[nb.global_offset + idx.psi],
            ));
        }
        let g = least_squares_gradient(mesh.nodes[fvm.node].position, psi0, &scratch);
        fields.push(g.length());
    }
    fields
}

fn precompute_edges(region: &SimulationRegion, idx: &VarIdx, x: &[f64]) -> Vec<EdgeFrozen> {
    region
        .edges
        .par_iter()
        .map(|e| {
            let ga = region.fvm_nodes[e.nodes.0].global_offset;
            let gb = region.fvm_nodes[e.nodes.1].global_offset;
            let ep = (x[ga + idx.psi] - x[gb + idx.psi]).abs() / e.length;
            if region.advanced.high_field_mobility {
                EdgeFrozen {
                    mun: region.material.mobility_n(ep),
                    mup: region.material.mobility_p(ep),
                    ep,
                }
            } else {
                EdgeFrozen {
                    mun: region.material.mun,
                    mup: region.material.mup,
                    ep,
                }
            }
        })
        .collect()
}

/// Edge stencil: `flux[v]` is added to node a's row for variable `v` and
/// subtracted from node b's (the edge term is computed once and reused with
/// a sign flip); `src_a`/`src_b` carry the non-antisymmetric edge-attached
/// generation split by partial volume.
#[allow(clippy::too_many_arguments)]
fn edge_kernel<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    edge: &RegionEdge,
    frozen: &EdgeFrozen,
    ua: &[T],
    ub: &[T],
    flux: &mut [T],
    src_a: &mut [T],
    src_b: &mut [T],
) {
    let mat = &region.material;
    let h = edge.length;
    let area = edge.cv_area;
    let va = ua[idx.psi].clone();
    let vb = ub[idx.psi].clone();

    let tl: T = match idx.t {
        Some(o) => (ua[o].clone() + ub[o].clone()) * 0.5,
        None => lit(region.t_external),
    };
    let vt = mat.vt(tl.clone());

    // Poisson: displacement flux eps * (vb - va) / h through the shared
    // control-volume surface.
    flux[idx.psi] = (vb.clone() - va.clone()) * (mat.eps() / h) * area;

    let (Some(on), Some(op)) = (idx.n, idx.p) else {
        // Poisson-only solve in a semiconductor region
        if let Some(ot) = idx.t {
            flux[ot] = (ua[ot].clone() - ub[ot].clone()) * (mat.kappa / h) * area;
        }
        return;
    };
    let na = ua[on].clone();
    let nb = ub[on].clone();
    let pa = ua[op].clone();
    let pb = ub[op].clone();

    // Scharfetter-Gummel particle currents. `sg_electron` is the particle
    // flux b -> a, so the outflow of a carries a minus sign; `sg_hole` is
    // already the outflow of a.
    let jn = sg_electron(vt.clone(), va.clone(), vb.clone(), na.clone(), nb.clone(), h)
        * frozen.mun;
    let jp = sg_hole(vt.clone(), va.clone(), vb.clone(), pa.clone(), pb.clone(), h) * frozen.mup;
    flux[on] = -jn.clone() * area;
    flux[op] = jp.clone() * area;

    // Impact ionization: edge generation proportional to the local current
    // magnitudes, split onto both endpoints by partial volume.
    if region.advanced.impact_ionization {
        let an = mat.ii_alpha_n(frozen.ep);
        let ap = mat.ii_alpha_p(frozen.ep);
        if an > 0.0 || ap > 0.0 {
            let g = jn.clone().abs() * an + jp.clone().abs() * ap;
            let (pv_a, pv_b) = edge.partial_volume;
            // continuity rows carry +(R - G) * vol
            src_a[on] -= g.clone() * pv_a;
            src_a[op] -= g.clone() * pv_a;
            src_b[on] -= g.clone() * pv_b;
            src_b[op] -= g * pv_b;
        }
    }

    // Lattice heat conduction.
    if let Some(ot) = idx.t {
        flux[ot] = (ua[ot].clone() - ub[ot].clone()) * (mat.kappa / h) * area;
    }

    // Carrier energy fluxes: conduction along the carrier temperature
    // gradient plus 5/2 kT convected by the particle current.
    if let Some(otn) = idx.tn {
        let tn_mid = (ua[otn].clone() + ub[otn].clone()) * 0.5;
        let n_mid = (na + nb) * 0.5;
        let kappa_n = n_mid * vt.clone() * (2.5 * KB * frozen.mun);
        flux[otn] = (ua[otn].clone() - ub[otn].clone()) * kappa_n * (1.0 / h) * area
            - tn_mid * jn.clone() * (2.5 * KB) * area;
    }
    if let Some(otp) = idx.tp {
        let tp_mid = (ua[otp].clone() + ub[otp].clone()) * 0.5;
        let p_mid = (pa + pb) * 0.5;
        let kappa_p = p_mid * vt * (2.5 * KB * frozen.mup);
        flux[otp] = (ua[otp].clone() - ub[otp].clone()) * kappa_p * (1.0 / h) * area
            + tp_mid * jp * (2.5 * KB) * area;
    }
}

/// Node stencil: space charge, SRH recombination, band-to-band tunneling,
/// heat sources and energy relaxation, all scaled by the control volume.
fn node_kernel<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    data: &FvmNodeData,
    volume: f64,
    e_frozen: f64,
    u: &[T],
    out: &mut [T],
) {
    let mat = &region.material;
    let tl: T = match idx.t {
        Some(o) => u[o].clone(),
        None => lit(region.t_external),
    };

    let (Some(on), Some(op)) = (idx.n, idx.p) else {
        // Poisson-only: frozen carrier densities from the node data
        out[idx.psi] +=
            lit::<T>(Q * (data.p - data.n + data.net_doping())) * volume;
        return;
    };
    let n = u[on].clone();
    let p = u[op].clone();

    // space charge
    out[idx.psi] +=
        (p.clone() - n.clone() + lit::<T>(data.net_doping())) * (Q * volume);

    let nie = mat.nie(tl.clone());
    let r = mat.srh(n.clone(), p.clone(), nie);
    let g_bbt = if region.advanced.band_to_band_tunneling {
        mat.bbt_rate(e_frozen)
    } else {
        0.0
    };
    out[on] += (r.clone() - lit::<T>(g_bbt)) * volume;
    out[op] += (r.clone() - lit::<T>(g_bbt)) * volume;

    // node-frozen mobilities, consistent with the edge pass
    let (mun, mup) = if region.advanced.high_field_mobility {
        (mat.mobility_n(e_frozen), mat.mobility_p(e_frozen))
    } else {
        (mat.mun, mat.mup)
    };
    if let Some(ot) = idx.t {
        // recombination heat + Joule heating at the frozen node field
        let h_rec = r.clone() * (Q * mat.eg);
        let joule = (n.clone() * mun + p.clone() * mup) * (Q * e_frozen * e_frozen);
        out[ot] -= (h_rec + joule) * volume;
    }
    if let Some(otn) = idx.tn {
        let relax = n.clone() * (u[otn].clone() - tl.clone()) * (1.5 * KB / mat.tau_wn);
        let p_joule = n * (Q * mun * e_frozen * e_frozen);
        out[otn] += (relax - p_joule) * volume;
    }
    if let Some(otp) = idx.tp {
        let relax = p.clone() * (u[otp].clone() - tl) * (1.5 * KB / mat.tau_wp);
        let p_joule = p * (Q * mup * e_frozen * e_frozen);
        out[otp] += (relax - p_joule) * volume;
    }
}

/// BDF time-derivative coefficients (c_now, c_last, c_last2) for the
/// current and two previous solution levels.
fn bdf_coefficients(scheme: &TimeScheme) -> Option<(f64, f64, f64)> {
    match *scheme {
        TimeScheme::Steady => None,
        TimeScheme::Bdf1 { dt } => Some((1.0 / dt, -1.0 / dt, 0.0)),
        TimeScheme::Bdf2 { dt, dt_last } => {
            let h = dt;
            let h1 = dt_last;
            Some((
                (2.0 * h + h1) / (h * (h + h1)),
                -(h + h1) / (h * h1),
                h / (h1 * (h + h1)),
            ))
        }
    }
}

/// Storage terms: d(n)/dt, d(p)/dt, lattice heat capacity and carrier
/// energy densities, discretized with BDF1/BDF2 over the stored history.
fn time_kernel<T: AdScalar>(
    region: &SimulationRegion,
    idx: &VarIdx,
    data: &FvmNodeData,
    volume: f64,
    scheme: &TimeScheme,
    u: &[T],
    out: &mut [T],
) {
    let Some((c0, c1, c2)) = bdf_coefficients(scheme) else {
        return;
    };
    let (Some(on), Some(op)) = (idx.n, idx.p) else {
        return;
    };
    out[on] += (u[on].clone() * c0 + lit::<T>(c1 * data.n_last + c2 * data.n_last2)) * volume;
    out[op] += (u[op].clone() * c0 + lit::<T>(c1 * data.p_last + c2 * data.p_last2)) * volume;
    if let Some(ot) = idx.t {
        let c = region.material.heat_capacity;
        out[ot] +=
            (u[ot].clone() * c0 + lit::<T>(c1 * data.t_last + c2 * data.t_last2)) * (c * volume);
    }
    if let Some(otn) = idx.tn {
        // w_n = 3/2 kB n Tn; history levels use the stored products
        let w_now = u[on].clone() * u[otn].clone();
        let w1 = data.n_last * data.tn_last;
        let w2 = data.n_last2 * data.tn_last2;
        out[otn] += (w_now * c0 + lit::<T>(c1 * w1 + c2 * w2)) * (1.5 * KB * volume);
    }
    if let Some(otp) = idx.tp {
        let w_now = u[op].clone() * u[otp].clone();
        let w1 = data.p_last * data.tp_last;
        let w2 = data.p_last2 * data.tp_last2;
        out[otp] += (w_now * c0 + lit::<T>(c1 * w1 + c2 * w2)) * (1.5 * KB * volume);
    }
}

/// Initial guess and diagonal scaling from the stored node state.
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
        if let Some(o) = idx.n {
            x[g + o] = data.n;
            l[g + o] = inv_vol;
        }
        if let Some(o) = idx.p {
            x[g + o] = data.p;
            l[g + o] = inv_vol;
        }
        if let Some(o) = idx.t {
            x[g + o] = data.t;
            l[g + o] = inv_vol;
        }
        if let Some(o) = idx.tn {
            x[g + o] = data.tn;
            l[g + o] = inv_vol;
        }
        if let Some(o) = idx.tp {
            x[g + o] = data.tp;
            l[g + o] = inv_vol;
        }
    }
}

fn check_finite(
    region: &SimulationRegion,
    f: &DVector<f64>,
    rows: impl Iterator<Item = (usize, usize)>,
) -> Result<(), Error> {
    for (fvm, row) in rows {
        if !f[row].is_finite() {
            return Err(Error::StencilInvariantViolation {
                region: region.name.clone(),
                node: region.fvm_nodes[fvm].node,
                variable: "residual",
            });
        }
    }
    Ok(())
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
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let m = idx.m;
    let frozen = precompute_edges(region, &idx, x);
    let e_fields = node_e_fields(mesh, region, &idx, x);

    let mut flux = vec![0.0f64; m];
    let mut src_a = vec![0.0f64; m];
    let mut src_b = vec![0.0f64; m];
    for (ei, edge) in region.edges.iter().enumerate() {
        let (a, b) = edge.nodes;
        let ga = region.fvm_nodes[a].global_offset;
        let gb = region.fvm_nodes[b].global_offset;
        flux.fill(0.0);
        src_a.fill(0.0);
        src_b.fill(0.0);
        edge_kernel(
            region,
            &idx,
            edge,
            &frozen[ei],
            &x[ga..ga + m],
            &x[gb..gb + m],
            &mut flux,
            &mut src_a,
            &mut src_b,
        );
        for o in 0..m {
            f[ga + o] += flux[o] + src_a[o];
            f[gb + o] += -flux[o] + src_b[o];
        }
    }

    let mut out = vec![0.0f64; m];
    for (fi, fvm) in region.fvm_nodes.iter().enumerate() {
        let g = fvm.global_offset;
        let data = &region.node_data[fvm.data];
        out.fill(0.0);
        node_kernel(region, &idx, data, fvm.volume, e_fields[fi], &x[g..g + m], &mut out);
        time_kernel(region, &idx, data, fvm.volume, time, &x[g..g + m], &mut out);
        for o in 0..m {
            f[g + o] += out[o];
        }
    }

    check_finite(
        region,
        f,
        region
            .fvm_nodes
            .iter()
            .enumerate()
            .flat_map(|(fi, fvm)| (0..m).map(move |o| (fi, fvm.global_offset + o))),
    )
}

/// Seed one node block with `ndir` total directions starting at `base`.
fn seed_block(x: &[f64], g: usize, m: usize, ndir: usize, base: usize) -> Vec<DualDVec64> {
    (0..m)
        .map(|j| {
            let eps = Derivative::derivative_generic(Dyn(ndir), U1, base + j);
            DualDVec64::new(x[g + j], eps)
        })
        .collect()
}

fn scatter_row(
    jac: &mut AijMatrix,
    row: usize,
    value: &DualDVec64,
    ndir: usize,
    cols: &[usize],
) {
    let eps = value.eps.clone().unwrap_generic(Dyn(ndir), U1);
    for (j, &col) in cols.iter().enumerate() {
        let v = eps[(j, 0)];
        if v != 0.0 {
            jac.add(row, col, v);
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
    let idx = VarIdx::from_layout(layout.region(r_idx));
    let m = idx.m;
    let frozen = precompute_edges(region, &idx, x);
    let e_fields = node_e_fields(mesh, region, &idx, x);

    for (ei, edge) in region.edges.iter().enumerate() {
        let (a, b) = edge.nodes;
        let ga = region.fvm_nodes[a].global_offset;
        let gb = region.fvm_nodes[b].global_offset;
        let ndir = 2 * m;
        let ua = seed_block(x, ga, m, ndir, 0);
        let ub = seed_block(x, gb, m, ndir, m);
        let mut flux = vec![DualDVec64::from_re(0.0); m];
        let mut src_a = vec![DualDVec64::from_re(0.0); m];
        let mut src_b = vec![DualDVec64::from_re(0.0); m];
        edge_kernel(
            region, &idx, edge, &frozen[ei], &ua, &ub, &mut flux, &mut src_a, &mut src_b,
        );
        let cols: Vec<usize> = (0..m).map(|j| ga + j).chain((0..m).map(|j| gb + j)).collect();
        for o in 0..m {
            let ra = flux[o].clone() + src_a[o].clone();
            scatter_row(jac, ga + o, &ra, ndir, &cols);
            let rb = -flux[o].clone() + src_b[o].clone();
            scatter_row(jac, gb + o, &rb, ndir, &cols);
        }
    }

    for (fi, fvm) in region.fvm_nodes.iter().enumerate() {
        let g = fvm.global_offset;
        let data = &region.node_data[fvm.data];
        let u = seed_block(x, g, m, m, 0);
        let mut out = vec![DualDVec64::from_re(0.0); m];
        node_kernel(region, &idx, data, fvm.volume, e_fields[fi], &u, &mut out);
        time_kernel(region, &idx, data, fvm.volume, time, &u, &mut out);
        let cols: Vec<usize> = (0..m).map(|j| g + j).collect();
        for o in 0..m {
            scatter_row(jac, g + o, &out[o], m, &cols);
        }
    }

    for fvm in region.fvm_nodes.iter() {
        for o in 0..m {
            let row = fvm.global_offset + o;
            if jac.row(row).iter().any(|(_, v)| !v.is_finite()) {
                return Err(Error::StencilInvariantViolation {
                    region: region.name.clone(),
                    node: fvm.node,
                    variable: "jacobian",
                });
            }
        }
    }
    Ok(())
}
