//! Region assembly checks: residual structure, discrete conservation and
//! agreement between the AD Jacobian and finite differences.

use approx::assert_relative_eq;
use glam::DVec3;
use nalgebra::DVector;

use semifvm::discretization::region::{RegionKind, SimulationRegion};
use semifvm::numerics::matrix::AijMatrix;
use semifvm::numerics::transient::TimeScheme;
use semifvm::physics::layout::{EquationFamily, EquationLayout, Variable};
use semifvm::physics::material::consts::E as Q;
use semifvm::physics::material::Material;
use semifvm::physics::region;
use semifvm::SimulationSystem;

use semifvm::discretization::mesh::Mesh;

const CROSS: f64 = 1e-12;

fn doped_line(xs: &[f64], dop: f64) -> SimulationSystem {
    let mut mesh = Mesh::new();
    let mut bulk = SimulationRegion::line(
        "bulk",
        RegionKind::Semiconductor,
        Material::silicon(),
        &mut mesh,
        xs,
        CROSS,
    );
    bulk.dope_uniform(dop.max(0.0), (-dop).max(0.0));
    let mut system = SimulationSystem::new(mesh);
    system.add_region(bulk);
    system
}

fn set_equilibrium(system: &mut SimulationSystem) {
    let mat = system.regions[0].material.clone();
    let nie = mat.nie(300.0);
    for fvm in 0..system.regions[0].fvm_nodes.len() {
        let data = system.regions[0].data_mut(fvm);
        let (ne, pe) = mat.equilibrium_densities(data.net_doping(), nie);
        data.psi = 0.0;
        data.n = ne;
        data.p = pe;
    }
}

fn gather(system: &SimulationSystem, layout: &EquationLayout) -> (DVector<f64>, DVector<f64>) {
    let mut x = DVector::zeros(layout.n_dofs);
    let mut l = DVector::from_element(layout.n_dofs, 1.0);
    for (r, reg) in system.regions.iter().enumerate() {
        region::fill_value(reg, layout, r, &mut x, &mut l);
    }
    (x, l)
}

fn residual(
    system: &SimulationSystem,
    layout: &EquationLayout,
    x: &[f64],
    time: &TimeScheme,
) -> DVector<f64> {
    let mut f = DVector::zeros(layout.n_dofs);
    for (r, reg) in system.regions.iter().enumerate() {
        region::assemble_residual(&system.mesh, reg, layout, r, x, &mut f, time)
            .expect("assembly must stay finite");
    }
    f
}

#[test]
fn charge_neutral_equilibrium_residual_vanishes() {
    let mut system = doped_line(&[0.0, 0.5e-6, 1.0e-6, 2.0e-6], 1e21);
    set_equilibrium(&mut system);
    let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
    let (x, _) = gather(&system, &layout);
    let f = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);
    for i in 0..layout.n_dofs {
        assert!(f[i].abs() < 1e-12, "row {i}: residual {} not at equilibrium", f[i]);
    }
}

#[test]
fn poisson_edge_flux_is_antisymmetric() {
    let mut system = doped_line(&[0.0, 1e-6], 0.0);
    let layout = EquationLayout::assign(&mut system, EquationFamily::Poisson);
    let (mut x, _) = gather(&system, &layout);
    x[1] = 0.2;
    let f = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);
    let eps = system.regions[0].material.eps();
    let expect = eps * 0.2 / 1e-6 * CROSS;
    assert!((f[0] - expect).abs() < 1e-12 * expect.abs());
    assert!((f[0] + f[1]).abs() < 1e-12 * expect.abs());
    assert!(f[0] != 0.0);
}

#[test]
fn electron_flux_telescopes_over_a_chain() {
    let mut system = doped_line(&[0.0, 0.5e-6, 1.0e-6, 1.5e-6], 0.0);
    let mat = system.regions[0].material.clone();
    let nie = mat.nie(300.0);
    // mass-action state (zero net recombination) with nonzero currents
    for fvm in 0..4 {
        let data = system.regions[0].data_mut(fvm);
        data.psi = 0.05 * fvm as f64;
        data.n = nie * (1.0 + fvm as f64);
        data.p = nie * nie / data.n;
    }
    let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
    let (x, _) = gather(&system, &layout);
    let f = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);

    let mut sum = 0.0;
    let mut max_row = 0.0f64;
    for fvm in 0..4 {
        let g = system.regions[0].fvm_nodes[fvm].global_offset;
        let row = layout.row_of(0, g, Variable::Electron).unwrap();
        sum += f[row];
        max_row = max_row.max(f[row].abs());
    }
    assert!(max_row > 0.0, "state must drive a current");
    assert!(
        sum.abs() < 1e-10 * max_row,
        "electron rows must telescope: sum {sum:e}, max {max_row:e}"
    );
}

#[test]
fn edge_fluxes_cancel_on_a_closed_loop() {
    // four control volumes on a square ring: every edge appears in exactly
    // two rows with opposite signs, so the rows must sum to zero for any
    // potential pattern, with no boundary leak to hide behind
    let mut mesh = Mesh::new();
    let mut bulk =
        SimulationRegion::new("ring", RegionKind::Semiconductor, Material::silicon());
    let corners = [
        DVec3::new(0.0, 0.0, 0.0),
        DVec3::new(1e-6, 0.0, 0.0),
        DVec3::new(1e-6, 1e-6, 0.0),
        DVec3::new(0.0, 1e-6, 0.0),
    ];
    let ids: Vec<usize> = corners
        .iter()
        .map(|&p| {
            let node = mesh.add_node(p);
            bulk.add_fvm_node(node, 1e-18)
        })
        .collect();
    for i in 0..4 {
        bulk.add_edge(ids[i], ids[(i + 1) % 4], 1e-6, CROSS);
    }
    let mut system = SimulationSystem::new(mesh);
    system.add_region(bulk);
    let layout = EquationLayout::assign(&mut system, EquationFamily::Poisson);
    let mut x = DVector::zeros(layout.n_dofs);
    x[1] = 0.2;
    x[2] = -0.1;
    x[3] = 0.4;
    let f = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);
    let max_row = (0..4).map(|i| f[i].abs()).fold(0.0, f64::max);
    assert!(max_row > 0.0, "state must drive fluxes");
    let sum: f64 = (0..4).map(|i| f[i]).sum();
    assert!(sum.abs() < 1e-12 * max_row, "rows must cancel: sum {sum:e}");
}

#[test]
fn jacobian_matches_central_differences() {
    let mut system = doped_line(&[0.0, 0.5e-6, 1.2e-6], 1e21);
    let mat = system.regions[0].material.clone();
    let nie = mat.nie(300.0);
    for fvm in 0..3 {
        let data = system.regions[0].data_mut(fvm);
        data.psi = 0.1 * fvm as f64;
        data.n = 1e20 * (1.0 + 2.0 * fvm as f64);
        data.p = nie * nie / data.n * 3.0;
    }
    let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
    let n = layout.n_dofs;
    let (x, _) = gather(&system, &layout);

    let mut jac = AijMatrix::new(n);
    region::assemble_jacobian(
        &system.mesh,
        &system.regions[0],
        &layout,
        0,
        x.as_slice(),
        &mut jac,
        &TimeScheme::Steady,
    )
    .unwrap();
    let ad = jac.to_dense();

    for j in 0..n {
        let h = 1e-6 * x[j].abs().max(1.0);
        let mut xp = x.clone();
        xp[j] += h;
        let mut xm = x.clone();
        xm[j] -= h;
        let fp = residual(&system, &layout, xp.as_slice(), &TimeScheme::Steady);
        let fm = residual(&system, &layout, xm.as_slice(), &TimeScheme::Steady);
        for i in 0..n {
            let fd = (fp[i] - fm[i]) / (2.0 * h);
            let scale = ad[(i, j)].abs().max(fd.abs());
            let row_scale = (0..n).map(|k| ad[(i, k)].abs()).fold(0.0, f64::max);
            let tol = 1e-4 * scale + 1e-9 * row_scale;
            assert!(
                (ad[(i, j)] - fd).abs() <= tol,
                "J[{i},{j}]: ad {:e} vs fd {fd:e}",
                ad[(i, j)]
            );
        }
    }
}

#[test]
fn bdf1_adds_the_storage_term() {
    let mut system = doped_line(&[0.0, 1e-6], 1e21);
    set_equilibrium(&mut system);
    // previous level differs from the current state
    for fvm in 0..2 {
        let data = system.regions[0].data_mut(fvm);
        data.n_last = data.n * 0.5;
        data.p_last = data.p * 2.0;
    }
    let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
    let (x, _) = gather(&system, &layout);
    let dt = 1e-9;
    let steady = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);
    let bdf1 = residual(&system, &layout, x.as_slice(), &TimeScheme::Bdf1 { dt });

    for fvm in 0..2 {
        let node = &system.regions[0].fvm_nodes[fvm];
        let data = system.regions[0].data(fvm);
        let n_row = layout.row_of(0, node.global_offset, Variable::Electron).unwrap();
        let p_row = layout.row_of(0, node.global_offset, Variable::Hole).unwrap();
        let dn = (data.n - data.n_last) / dt * node.volume;
        let dp = (data.p - data.p_last) / dt * node.volume;
        assert!(((bdf1[n_row] - steady[n_row]) - dn).abs() < 1e-9 * dn.abs());
        assert!(((bdf1[p_row] - steady[p_row]) - dp).abs() < 1e-9 * dp.abs());
    }
}

#[test]
fn joule_heating_uses_the_field_corrected_mobility() {
    let mut system = doped_line(&[0.0, 1e-6], 0.0);
    system.regions[0].advanced.enable_tl = true;
    let mat = system.regions[0].material.clone();
    for fvm in 0..2 {
        let data = system.regions[0].data_mut(fvm);
        data.psi = 0.2 * fvm as f64;
        data.n = 1e18;
        data.p = 1e17;
    }
    let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
    let (x, _) = gather(&system, &layout);
    let low = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);
    system.regions[0].advanced.high_field_mobility = true;
    let high = residual(&system, &layout, x.as_slice(), &TimeScheme::Steady);

    // the heat rows differ only by the Joule term, evaluated with the
    // field-corrected mobilities at the node field |grad psi|
    let e = 0.2 / 1e-6;
    for fvm in 0..2 {
        let node = &system.regions[0].fvm_nodes[fvm];
        let data = system.regions[0].data(fvm);
        let t_row = layout
            .row_of(0, node.global_offset, Variable::Temperature)
            .unwrap();
        let dmu = data.n * (mat.mobility_n(e) - mat.mun)
            + data.p * (mat.mobility_p(e) - mat.mup);
        let expect = -dmu * Q * e * e * node.volume;
        assert_relative_eq!(high[t_row] - low[t_row], expect, max_relative = 1e-9);
    }
}

#[test]
fn poisson_only_jacobian_is_the_scaled_laplacian() {
    let mut system = doped_line(&[0.0, 1e-6, 2e-6], 0.0);
    let layout = EquationLayout::assign(&mut system, EquationFamily::Poisson);
    let (x, _) = gather(&system, &layout);
    let mut jac = AijMatrix::new(layout.n_dofs);
    region::assemble_jacobian(
        &system.mesh,
        &system.regions[0],
        &layout,
        0,
        x.as_slice(),
        &mut jac,
        &TimeScheme::Steady,
    )
    .unwrap();
    let eps = system.regions[0].material.eps();
    let k = eps / 1e-6 * CROSS;
    let d = jac.to_dense();
    assert!((d[(1, 1)] + 2.0 * k).abs() < 1e-12 * k);
    assert!((d[(1, 0)] - k).abs() < 1e-12 * k);
    assert!((d[(1, 2)] - k).abs() < 1e-12 * k);
    assert!((d[(0, 0)] + k).abs() < 1e-12 * k);
}
