//! Damped Newton orchestration over the staged assembly pipeline.
//!
//! One nonlinear iteration is: scatter the unknowns, assemble every region,
//! let the boundary conditions harvest what they need and emit their row
//! surgery, apply the surgery, assemble the boundary equations, scale by
//! the control-volume weights, solve the linearized system, damp and
//! project the update. Regions and boundaries never see each other; the
//! pipeline ordering is the only coupling.

use std::sync::Arc;

use kryst::parallel::{NoComm, UniverseComm};
use kryst::preconditioner::PcSide;
use kryst::solver::LinearSolver;
use nalgebra::DVector;
use tracing::{debug, warn};

use crate::error::Error;
use crate::numerics::comm::Communicator;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::row_surgery::{self, RowOps};
use crate::numerics::transient::TimeScheme;
use crate::physics::bc::{self, BcScratch};
use crate::physics::layout::{EquationFamily, EquationLayout, RowKind, Variable};
use crate::physics::material::consts::{E as Q, KB};
use crate::physics::region::{self, TimeAdvance};
use crate::physics::SimulationSystem;

/// Smallest admissible carrier density after projection [m^-3].
const DENSITY_FLOOR: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DampingStrategy {
    /// Raw Newton updates.
    None,
    /// Logarithmic limiter on the largest potential update.
    Potential,
    /// Potential limiter plus a cut keeping carrier densities positive.
    PositiveDensity,
}

pub struct NewtonSolver {
    pub max_iterations: u32,
    pub rel_tol: f64,
    pub abs_tol: f64,
    pub damping: DampingStrategy,
    /// Scale of the potential limiter in thermal voltages.
    pub potential_update: f64,
    /// Reloads from the last committed state after a poisoned assembly.
    pub max_recovery: u32,
}

impl Default for NewtonSolver {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            rel_tol: 1e-7,
            abs_tol: 1e-9,
            damping: DampingStrategy::PositiveDensity,
            potential_update: 1.0,
            max_recovery: 3,
        }
    }
}

pub struct SolverReport {
    pub solution: DVector<f64>,
    pub scratches: Vec<BcScratch>,
    pub iterations: u32,
    pub residual_norm: f64,
}

impl NewtonSolver {
    /// Initial guess and control-volume scaling from the committed state.
    fn fill_values(
        &self,
        system: &SimulationSystem,
        layout: &EquationLayout,
    ) -> (DVector<f64>, DVector<f64>) {
        let n = layout.n_dofs;
        let mut x = DVector::zeros(n);
        let mut l = DVector::from_element(n, 1.0);
        for (r, region) in system.regions.iter().enumerate() {
            region::fill_value(region, layout, r, &mut x, &mut l);
        }
        for b in 0..system.bcs.len() {
            bc::fill_value(system, b, layout, &mut x, &mut l);
        }
        (x, l)
    }

    fn assemble_residual(
        &self,
        system: &SimulationSystem,
        layout: &EquationLayout,
        x: &DVector<f64>,
        l: &DVector<f64>,
        time: &TimeScheme,
        comm: &dyn Communicator,
        scratches: &mut [BcScratch],
    ) -> Result<DVector<f64>, Error> {
        let n = layout.n_dofs;
        let mut x_local = DVector::zeros(n);
        comm.scatter_to_local(x, &mut x_local);
        let xs = x_local.as_slice();

        let mut f = DVector::zeros(n);
        for (r, region) in system.regions.iter().enumerate() {
            region::assemble_residual(&system.mesh, region, layout, r, xs, &mut f, time)?;
        }

        let mut ops = RowOps::default();
        for b in 0..system.bcs.len() {
            bc::preprocess_residual(system, b, layout, xs, &f, time, &mut ops, &mut scratches[b]);
        }
        for s in scratches.iter_mut() {
            s.current = comm.sum(s.current);
        }
        row_surgery::apply_to_vector(&mut f, &ops);
        for b in 0..system.bcs.len() {
            bc::assemble_residual(
                system,
                b,
                layout,
                xs,
                &mut f,
                time,
                &scratches[b],
                comm.is_last_rank(),
            )?;
        }
        for i in 0..n {
            f[i] *= l[i];
        }
        Ok(f)
    }

    fn assemble_jacobian(
        &self,
        system: &SimulationSystem,
        layout: &EquationLayout,
        x: &DVector<f64>,
        l: &DVector<f64>,
        time: &TimeScheme,
        comm: &dyn Communicator,
        scratches: &mut [BcScratch],
    ) -> Result<AijMatrix, Error> {
        let n = layout.n_dofs;
        let mut x_local = DVector::zeros(n);
        comm.scatter_to_local(x, &mut x_local);
        let xs = x_local.as_slice();

        let mut jac = AijMatrix::new(n);
        for b in 0..system.bcs.len() {
            bc::reserve_pattern(system, b, layout, &mut jac);
        }
        for (r, region) in system.regions.iter().enumerate() {
            region::assemble_jacobian(&system.mesh, region, layout, r, xs, &mut jac, time)?;
        }

        let mut ops = RowOps::default();
        for b in 0..system.bcs.len() {
            bc::preprocess_jacobian(system, b, layout, &jac, time, &mut ops, &mut scratches[b]);
        }
        row_surgery::apply_to_matrix(&mut jac, &ops);
        for b in 0..system.bcs.len() {
            bc::assemble_jacobian(
                system,
                b,
                layout,
                xs,
                &mut jac,
                time,
                &scratches[b],
                comm.is_last_rank(),
            )?;
        }
        for i in 0..n {
            jac.scale_row(i, l[i]);
        }
        Ok(jac)
    }

    /// Jacobi-scaled BiCGSTAB solve of J dx = -f.
    fn linear_solve(&self, jac: AijMatrix, f: &DVector<f64>) -> Result<DVector<f64>, Error> {
        let n = jac.n();
        let mut csr = jac.into_csr();

        let d: Vec<f64> = (0..n)
            .map(|row| {
                let start = csr.row_ptr()[row];
                let end = csr.row_ptr()[row + 1];
                let diag = (start..end)
                    .find(|&idx| csr.col_idx()[idx] == row)
                    .map(|idx| csr.values()[idx])
                    .unwrap_or(1.0);
                if diag.abs() < 1e-12 { 1.0 } else { diag }
            })
            .collect();
        for row in 0..n {
            let scale = 1.0 / d[row];
            for v in csr.row_values_mut(row) {
                *v *= scale;
            }
        }

        let op = kryst::matrix::op::CsrOp::new(Arc::new(csr));
        let linear_tol = (f.norm() * 0.1).max(self.abs_tol).min(1e-2);
        let mut krylov = kryst::solver::bicgstab::BiCgStabSolver::new(linear_tol, 2000);
        let mut workspace = kryst::context::ksp_context::Workspace::new(n);
        krylov.setup_workspace(&mut workspace);

        let b: DVector<f64> = DVector::from_iterator(n, (0..n).map(|i| -f[i] / d[i]));
        let mut dx = DVector::from_element(n, 0.0);
        krylov
            .solve(
                &op,
                None,
                b.as_slice(),
                dx.as_mut_slice(),
                PcSide::Left,
                &UniverseComm::NoComm(NoComm {}),
                None,
                Some(&mut workspace),
            )
            .map_err(|_| Error::LinearSolveFailed)?;
        if !dx.iter().all(|v| v.is_finite()) {
            return Err(Error::LinearSolveFailed);
        }
        Ok(dx)
    }

    /// Logarithmic limiter on the largest potential update. The maximum is
    /// reduced over all ranks so every rank damps with the same factor.
    fn potential_damping_factor(
        &self,
        layout: &EquationLayout,
        dx: &DVector<f64>,
        comm: &dyn Communicator,
    ) -> f64 {
        if self.damping == DampingStrategy::None {
            return 1.0;
        }
        let vut = KB * 300.0 / Q * self.potential_update;
        let mut dv_max = 0.0f64;
        for i in 0..dx.len() {
            if layout.is_potential_row(i) {
                dv_max = dv_max.max(dx[i].abs());
            }
        }
        let dv_max = comm.max(dv_max);
        if dv_max > vut {
            let r = dv_max / vut;
            (1.0 + r).ln() / r
        } else {
            1.0
        }
    }

    /// Apply the Newton update. The potential limiter scales potential and
    /// electrode rows only; carrier and temperature rows take the full
    /// step, except that a density stepping through zero is cut back on
    /// its own row.
    fn apply_update(
        &self,
        layout: &EquationLayout,
        x: &mut DVector<f64>,
        dx: &DVector<f64>,
        comm: &dyn Communicator,
    ) {
        let w = self.potential_damping_factor(layout, dx, comm);
        for i in 0..x.len() {
            let mut s = if layout.is_potential_row(i) { w } else { 1.0 };
            if self.damping == DampingStrategy::PositiveDensity {
                if let RowKind::Region { variable, .. } = layout.row_kind(i) {
                    if matches!(variable, Variable::Electron | Variable::Hole)
                        && x[i] > 0.0
                        && x[i] + dx[i] <= 0.0
                    {
                        s = (-0.9 * x[i] / dx[i]).max(0.01);
                    }
                }
            }
            x[i] += s * dx[i];
        }
    }

    /// Clamp the iterate back into the physical range. Densities get an
    /// absolute floor; temperatures may undershoot the ambient slightly
    /// during the iteration but not run away.
    fn project(&self, system: &SimulationSystem, layout: &EquationLayout, x: &mut DVector<f64>) {
        for i in 0..x.len() {
            if let RowKind::Region { region, variable } = layout.row_kind(i) {
                let t_ext = system.regions[region].t_external;
                match variable {
                    Variable::Electron | Variable::Hole => {
                        if x[i] < DENSITY_FLOOR {
                            x[i] = DENSITY_FLOOR;
                        }
                    }
                    Variable::Temperature => {
                        if x[i] < t_ext - 50.0 {
                            x[i] = t_ext - 50.0;
                        }
                    }
                    Variable::ElectronTemp | Variable::HoleTemp => {
                        if x[i] < 0.9 * t_ext {
                            x[i] = 0.9 * t_ext;
                        }
                    }
                    Variable::Potential => {}
                }
            }
        }
    }

    /// One full nonlinear solve at a fixed time level. Does not commit:
    /// the caller decides whether the step is accepted.
    pub fn solve(
        &self,
        system: &SimulationSystem,
        layout: &EquationLayout,
        time: &TimeScheme,
        comm: &dyn Communicator,
    ) -> Result<SolverReport, Error> {
        let (mut x, l) = self.fill_values(system, layout);
        let mut scratches = vec![BcScratch::default(); system.bcs.len()];
        let mut recoveries = 0u32;
        let mut init_norm: Option<f64> = None;
        let mut res_norm = f64::INFINITY;
        let mut i = 0u32;

        while i < self.max_iterations {
            i += 1;
            let f = match self.assemble_residual(system, layout, &x, &l, time, comm, &mut scratches)
            {
                Ok(f) => f,
                Err(Error::StencilInvariantViolation { .. }) => {
                    recoveries += 1;
                    if recoveries > self.max_recovery {
                        return Err(Error::NonlinearDivergence {
                            iterations: i,
                            residual: res_norm,
                        });
                    }
                    warn!(recoveries, "poisoned residual, reloading the committed state");
                    let (x0, _) = self.fill_values(system, layout);
                    x = x0;
                    continue;
                }
                Err(e) => return Err(e),
            };

            res_norm = f.norm();
            let init = *init_norm.get_or_insert(res_norm);
            debug!(iter = i, residual = res_norm, "nonlinear iteration");
            if res_norm < self.abs_tol || (i > 1 && res_norm < self.rel_tol * init) {
                return Ok(SolverReport {
                    solution: x,
                    scratches,
                    iterations: i,
                    residual_norm: res_norm,
                });
            }

            let jac =
                match self.assemble_jacobian(system, layout, &x, &l, time, comm, &mut scratches) {
                    Ok(jac) => jac,
                    Err(Error::StencilInvariantViolation { .. }) => {
                        recoveries += 1;
                        if recoveries > self.max_recovery {
                            return Err(Error::NonlinearDivergence {
                                iterations: i,
                                residual: res_norm,
                            });
                        }
                        warn!(recoveries, "poisoned Jacobian, reloading the committed state");
                        let (x0, _) = self.fill_values(system, layout);
                        x = x0;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

            let dx = self.linear_solve(jac, &f)?;
            self.apply_update(layout, &mut x, &dx, comm);
            self.project(system, layout, &mut x);
        }

        Err(Error::NonlinearDivergence {
            iterations: self.max_iterations,
            residual: res_norm,
        })
    }

    /// Zero-bias equilibrium: nonlinear Poisson, committed on success.
    pub fn solve_equilibrium(
        &self,
        system: &mut SimulationSystem,
        comm: &dyn Communicator,
    ) -> Result<SolverReport, Error> {
        let layout = EquationLayout::assign(system, EquationFamily::Poisson);
        let report = self.solve(system, &layout, &TimeScheme::Steady, comm)?;
        commit_solution(system, &layout, &report, TimeAdvance::Steady);
        Ok(report)
    }

    /// Steady solve of the requested coupled system, committed on success.
    pub fn solve_steady_state(
        &self,
        system: &mut SimulationSystem,
        family: EquationFamily,
        comm: &dyn Communicator,
    ) -> Result<(EquationLayout, SolverReport), Error> {
        let layout = EquationLayout::assign(system, family);
        let report = self.solve(system, &layout, &TimeScheme::Steady, comm)?;
        commit_solution(system, &layout, &report, TimeAdvance::Steady);
        Ok((layout, report))
    }
}

/// Store an accepted solution into the node data and circuit state.
pub fn commit_solution(
    system: &mut SimulationSystem,
    layout: &EquationLayout,
    report: &SolverReport,
    advance: TimeAdvance,
) {
    let SimulationSystem {
        mesh,
        regions,
        bcs,
    } = system;
    for (r, region) in regions.iter_mut().enumerate() {
        region::update_solution(mesh, region, layout, r, report.solution.as_slice(), advance);
    }
    for (b, bc) in bcs.iter_mut().enumerate() {
        bc::update_solution(bc, &report.solution, &report.scratches[b]);
    }
}
