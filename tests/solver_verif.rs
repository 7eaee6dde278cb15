//! End-to-end nonlinear solve of a contacted bar: the equilibrium Poisson
//! problem is linear, so the damped Newton loop plus the Krylov backend
//! must recover the contact potential throughout the bulk.

use semifvm::discretization::mesh::Mesh;
use semifvm::discretization::region::{RegionKind, SimulationRegion};
use semifvm::numerics::comm::SerialComm;
use semifvm::numerics::solver::{DampingStrategy, NewtonSolver};
use semifvm::physics::bc::circuit::ExtCircuit;
use semifvm::physics::bc::BoundaryCondition;
use semifvm::physics::material::consts::{E as Q, KB};
use semifvm::physics::material::Material;
use semifvm::SimulationSystem;

#[test]
fn equilibrium_poisson_pins_the_bulk_to_the_contact_potential() {
    let mut mesh = Mesh::new();
    let mut bulk = SimulationRegion::line(
        "bulk",
        RegionKind::Semiconductor,
        Material::silicon(),
        &mut mesh,
        &[0.0, 1e-6, 2e-6],
        1e-12,
    );
    bulk.dope_uniform(1e21, 0.0);
    let mat = bulk.material.clone();
    let nie = mat.nie(300.0);
    for fvm in 0..bulk.fvm_nodes.len() {
        let d = bulk.data_mut(fvm);
        let (ne, pe) = mat.equilibrium_densities(d.net_doping(), nie);
        d.n = ne;
        d.p = pe;
    }
    let mut system = SimulationSystem::new(mesh);
    system.add_region(bulk);
    let ckt = ExtCircuit::voltage_driven(0.0, 0.0, 0.0, 0.0);
    system
        .add_bc(BoundaryCondition::ohmic("anode", ckt), &[0])
        .unwrap();

    // the problem is linear; damping would only slow the iteration down
    let solver = NewtonSolver {
        damping: DampingStrategy::None,
        rel_tol: 1e-12,
        ..NewtonSolver::default()
    };
    let report = solver
        .solve_equilibrium(&mut system, &SerialComm)
        .expect("equilibrium Poisson must converge");
    assert!(report.iterations <= 15);

    let vt = KB * 300.0 / Q;
    let expected = -(mat.affinity + 0.5 * mat.eg + 0.5 * vt * (mat.nc / mat.nv).ln()
        - vt * (1e21 / (2.0 * nie)).asinh());
    for fvm in 0..system.regions[0].fvm_nodes.len() {
        let psi = system.regions[0].data(fvm).psi;
        assert!(
            (psi - expected).abs() < 1e-3,
            "node {fvm}: psi {psi} vs {expected}"
        );
    }
    // the electrode potential was committed into the circuit state
    let ckt = system.bcs[0].circuit.as_ref().unwrap();
    assert!(ckt.potential.abs() < 1e-6);
}
