//! Time integration: backward-difference schemes and adaptive step control
//! driven by the local truncation error of the previous step.

use nalgebra::DVector;
use tracing::{info, warn};

use crate::error::Error;
use crate::numerics::comm::Communicator;
use crate::numerics::solver::{commit_solution, NewtonSolver};
use crate::physics::layout::EquationLayout;
use crate::physics::region::TimeAdvance;
use crate::physics::SimulationSystem;

/// Discretization of the time derivative for one nonlinear solve. Every
/// assembly routine receives this by reference; `Steady` drops the storage
/// terms entirely.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeScheme {
    Steady,
    Bdf1 { dt: f64 },
    Bdf2 { dt: f64, dt_last: f64 },
}

impl TimeScheme {
    pub fn dt(&self) -> Option<f64> {
        match *self {
            TimeScheme::Steady => None,
            TimeScheme::Bdf1 { dt } => Some(dt),
            TimeScheme::Bdf2 { dt, .. } => Some(dt),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepDecision {
    Accept { dt_next: f64 },
    Reject { dt_next: f64 },
}

/// Step-size controller. The error test compares the corrector against the
/// variable-step linear predictor; potential and electrode rows are left
/// out of the norm because the elliptic unknowns carry no truncation error
/// of their own.
#[derive(Clone, Copy, Debug)]
pub struct TimeStepController {
    pub ts_rtol: f64,
    pub ts_atol: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    pub growth_max: f64,
}

impl Default for TimeStepController {
    fn default() -> Self {
        Self {
            ts_rtol: 1e-3,
            ts_atol: 1.0,
            dt_min: 1e-15,
            dt_max: 1e-3,
            growth_max: 2.0,
        }
    }
}

/// Linear extrapolation of the last two accepted levels to the new time.
/// Pairs with the BDF1 corrector; the LTE weight is dt / (dt + dt_last).
pub fn predictor(x_n: &DVector<f64>, x_n1: &DVector<f64>, dt: f64, dt_last: f64) -> DVector<f64> {
    let r = dt / dt_last;
    x_n * (1.0 + r) - x_n1 * r
}

/// Quadratic extrapolation of the last three accepted levels to the new
/// time. Pairs with the BDF2 corrector; the LTE weight is
/// dt / (dt + dt_last + dt_last2).
pub fn predictor2(
    x_n: &DVector<f64>,
    x_n1: &DVector<f64>,
    x_n2: &DVector<f64>,
    dt: f64,
    dt_last: f64,
    dt_last2: f64,
) -> DVector<f64> {
    let (hn, hn1, hn2) = (dt, dt_last, dt_last2);
    let cn = 1.0 + hn * (hn + 2.0 * hn1 + hn2) / (hn1 * (hn1 + hn2));
    let cn1 = -hn * (hn + hn1 + hn2) / (hn1 * hn2);
    let cn2 = hn * (hn + hn1) / (hn2 * (hn1 + hn2));
    x_n * cn + x_n1 * cn1 + x_n2 * cn2
}

impl TimeStepController {
    /// Weighted RMS of the estimated local truncation error. `weight` is
    /// the predictor-order dependent LTE factor; a norm of one sits
    /// exactly on the tolerance.
    pub fn lte_norm(
        &self,
        layout: &EquationLayout,
        x: &DVector<f64>,
        x_pred: &DVector<f64>,
        weight: f64,
    ) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..x.len() {
            if layout.is_potential_row(i) {
                continue;
            }
            let lte = weight * (x[i] - x_pred[i]);
            let scale = self.ts_rtol * x[i].abs() + self.ts_atol;
            sum += (lte / scale) * (lte / scale);
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        (sum / count as f64).sqrt()
    }

    /// Classic error-controlled step update with a second-order exponent.
    /// A failing step at the minimum size is accepted anyway; shrinking
    /// further cannot help.
    pub fn decide(&self, norm: f64, dt: f64) -> StepDecision {
        let factor = if norm > 0.0 {
            (0.9 * norm.powf(-1.0 / 3.0)).clamp(0.1, self.growth_max)
        } else {
            self.growth_max
        };
        let dt_next = (dt * factor).clamp(self.dt_min, self.dt_max);
        if norm <= 1.0 || dt <= self.dt_min {
            StepDecision::Accept { dt_next }
        } else {
            StepDecision::Reject { dt_next }
        }
    }
}

/// Outer transient loop: BDF1 on the first step, BDF2 once two accepted
/// levels exist, LTE-based accept/reject, and bounded recovery when the
/// nonlinear solve itself fails.
pub struct TransientDriver {
    pub t_start: f64,
    pub t_end: f64,
    pub dt_initial: f64,
    pub controller: TimeStepController,
    pub newton: NewtonSolver,
    pub use_bdf2: bool,
    pub max_retries: u32,
}

impl TransientDriver {
    pub fn new(t_start: f64, t_end: f64, dt_initial: f64) -> Self {
        Self {
            t_start,
            t_end,
            dt_initial,
            controller: TimeStepController::default(),
            newton: NewtonSolver::default(),
            use_bdf2: true,
            max_retries: 8,
        }
    }

    pub fn run(
        &self,
        system: &mut SimulationSystem,
        layout: &EquationLayout,
        comm: &dyn Communicator,
        mut callback: impl FnMut(f64, &DVector<f64>),
    ) -> Result<(), Error> {
        let mut t = self.t_start;
        let mut dt = self.dt_initial;
        let mut x_prev: Option<DVector<f64>> = None;
        let mut x_prev2: Option<DVector<f64>> = None;
        let mut x_prev3: Option<DVector<f64>> = None;
        let mut dt_last: Option<f64> = None;
        let mut dt_last2: Option<f64> = None;
        let mut retries = 0u32;
        let horizon = self.t_end - 1e-12 * (self.t_end - self.t_start).abs();

        while t < horizon {
            let dt_step = dt.min(self.t_end - t);
            let scheme = match (self.use_bdf2, dt_last) {
                (true, Some(h1)) => TimeScheme::Bdf2 {
                    dt: dt_step,
                    dt_last: h1,
                },
                _ => TimeScheme::Bdf1 { dt: dt_step },
            };

            match self.newton.solve(system, layout, &scheme, comm) {
                Ok(report) => {
                    retries = 0;
                    let decision = match (&x_prev, &x_prev2, dt_last) {
                        (Some(xn), Some(xn1), Some(h1)) => {
                            // predictor order follows the corrector once
                            // three accepted levels exist
                            let (xp, weight) = match (&scheme, &x_prev3, dt_last2) {
                                (TimeScheme::Bdf2 { .. }, Some(xn2), Some(h2)) => (
                                    predictor2(xn, xn1, xn2, dt_step, h1, h2),
                                    dt_step / (dt_step + h1 + h2),
                                ),
                                _ => (
                                    predictor(xn, xn1, dt_step, h1),
                                    dt_step / (dt_step + h1),
                                ),
                            };
                            let norm = self.controller.lte_norm(
                                layout,
                                &report.solution,
                                &xp,
                                weight,
                            );
                            self.controller.decide(norm, dt_step)
                        }
                        // no history yet: take the step, hold the size
                        _ => StepDecision::Accept { dt_next: dt_step },
                    };

                    match decision {
                        StepDecision::Accept { dt_next } => {
                            commit_solution(system, layout, &report, TimeAdvance::Step);
                            for bc in &mut system.bcs {
                                if let Some(ckt) = bc.circuit.as_mut() {
                                    ckt.advance_time(dt_step);
                                }
                            }
                            t += dt_step;
                            info!(
                                t,
                                dt = dt_step,
                                iterations = report.iterations,
                                residual = report.residual_norm,
                                "time step accepted"
                            );
                            callback(t, &report.solution);
                            x_prev3 = x_prev2.take();
                            x_prev2 = x_prev.take();
                            x_prev = Some(report.solution);
                            dt_last2 = dt_last;
                            dt_last = Some(dt_step);
                            dt = dt_next;
                        }
                        StepDecision::Reject { dt_next } => {
                            warn!(t, dt = dt_step, dt_next, "time step rejected by error test");
                            dt = dt_next;
                        }
                    }
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(e);
                    }
                    dt = (dt_step * 0.5).max(self.controller.dt_min);
                    warn!(t, dt, retries, "nonlinear solve failed, halving the step");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    use crate::discretization::mesh::Mesh;
    use crate::discretization::region::{RegionKind, SimulationRegion};
    use crate::physics::layout::{EquationFamily, EquationLayout, Variable};
    use crate::physics::material::Material;
    use crate::physics::SimulationSystem;

    fn chain_layout() -> (SimulationSystem, EquationLayout) {
        let mut mesh = Mesh::new();
        let bulk = SimulationRegion::line(
            "bulk",
            RegionKind::Semiconductor,
            Material::silicon(),
            &mut mesh,
            &[0.0, 1e-6],
            1e-12,
        );
        let mut system = SimulationSystem::new(mesh);
        system.add_region(bulk);
        let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
        (system, layout)
    }

    #[test]
    fn schemes_expose_their_step() {
        assert_eq!(TimeScheme::Steady.dt(), None);
        assert_eq!(TimeScheme::Bdf1 { dt: 0.5 }.dt(), Some(0.5));
        assert_eq!(
            TimeScheme::Bdf2 {
                dt: 0.5,
                dt_last: 0.25
            }
            .dt(),
            Some(0.5)
        );
    }

    #[test]
    fn predictor_extrapolates_linear_histories_exactly() {
        // x(t) = 2t + 1 sampled at t = 0 and t = 1, predicted at t = 1.5
        let x_n1 = DVector::from_vec(vec![1.0, 1.0]);
        let x_n = DVector::from_vec(vec![3.0, 3.0]);
        let xp = predictor(&x_n, &x_n1, 0.5, 1.0);
        assert!((xp[0] - 4.0).abs() < 1e-14);
        assert!((xp[1] - 4.0).abs() < 1e-14);
    }

    #[test]
    fn quadratic_histories_are_predicted_exactly() {
        // x(t) = 3t^2 - 2t + 1 sampled at t = -3, -1, 0 with uneven steps,
        // extrapolated to t = 0.5
        let (hn, hn1, hn2) = (0.5, 1.0, 2.0);
        let q = |t: f64| 3.0 * t * t - 2.0 * t + 1.0;
        let x_n = DVector::from_element(2, q(0.0));
        let x_n1 = DVector::from_element(2, q(-hn1));
        let x_n2 = DVector::from_element(2, q(-hn1 - hn2));
        let xp = predictor2(&x_n, &x_n1, &x_n2, hn, hn1, hn2);
        assert!((xp[0] - q(hn)).abs() < 1e-12);
        assert!((xp[1] - q(hn)).abs() < 1e-12);
    }

    #[test]
    fn matching_predictor_and_corrector_give_zero_error_norm() {
        let (system, layout) = chain_layout();
        let ctrl = TimeStepController::default();
        let g = system.regions[0].fvm_nodes[0].global_offset;
        let x = DVector::from_element(layout.n_dofs, 2.0);
        assert_eq!(ctrl.lte_norm(&layout, &x, &x.clone(), 0.5), 0.0);

        // a deviation on a potential row is excluded from the norm
        let mut xp = x.clone();
        let psi_row = layout.row_of(0, g, Variable::Potential).unwrap();
        xp[psi_row] += 1.0;
        assert_eq!(ctrl.lte_norm(&layout, &x, &xp, 0.5), 0.0);

        // a deviation on a carrier row counts
        let n_row = layout.row_of(0, g, Variable::Electron).unwrap();
        xp[n_row] += 1.0;
        assert!(ctrl.lte_norm(&layout, &x, &xp, 0.5) > 0.0);
    }

    #[test]
    fn exact_prediction_grows_the_step() {
        let ctrl = TimeStepController::default();
        match ctrl.decide(0.0, 1e-6) {
            StepDecision::Accept { dt_next } => {
                assert!((dt_next - 2e-6).abs() < 1e-18);
            }
            StepDecision::Reject { .. } => panic!("zero error must accept"),
        }
    }

    #[test]
    fn large_error_shrinks_and_rejects() {
        let ctrl = TimeStepController::default();
        match ctrl.decide(8.0, 1e-6) {
            StepDecision::Reject { dt_next } => {
                // 0.9 * 8^(-1/3) = 0.45
                assert!((dt_next - 0.45e-6).abs() < 1e-18);
            }
            StepDecision::Accept { .. } => panic!("norm of 8 must reject"),
        }
    }

    #[test]
    fn floor_sized_steps_are_accepted_even_when_failing() {
        let ctrl = TimeStepController::default();
        match ctrl.decide(10.0, ctrl.dt_min) {
            StepDecision::Accept { .. } => {}
            StepDecision::Reject { .. } => panic!("cannot shrink below the floor"),
        }
    }
}
