//! SPMD collaborator seam. Every rank runs the same assembly code over the
//! control volumes it owns plus ghost copies; the orchestrator only talks
//! to this trait, so a serial run and a distributed run share one code
//! path. The distributed Krylov engine itself lives behind the linear
//! solver and is out of scope here.

use nalgebra::DVector;

pub trait Communicator {
    fn rank(&self) -> usize;
    fn n_ranks(&self) -> usize;

    /// Single-writer collective operations (circuit equations) run on the
    /// last rank, matching the electrode slots being numbered last.
    fn is_last_rank(&self) -> bool {
        self.rank() + 1 == self.n_ranks()
    }

    /// Global sum reduction.
    fn sum(&self, local: f64) -> f64;

    /// Global max reduction.
    fn max(&self, local: f64) -> f64;

    /// Scatter the global unknown vector into the rank-local ghost-extended
    /// buffer. Every locally assembled quantity reads from `local` only.
    fn scatter_to_local(&self, global: &DVector<f64>, local: &mut DVector<f64>);
}

/// Single-rank implementation: reductions are identities and the scatter is
/// a copy (local numbering equals global numbering).
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn n_ranks(&self) -> usize {
        1
    }

    fn sum(&self, local: f64) -> f64 {
        local
    }

    fn max(&self, local: f64) -> f64 {
        local
    }

    fn scatter_to_local(&self, global: &DVector<f64>, local: &mut DVector<f64>) {
        local.copy_from(global);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_comm_is_identity() {
        let comm = SerialComm;
        assert!(comm.is_last_rank());
        assert_eq!(comm.sum(3.5), 3.5);
        assert_eq!(comm.max(-1.0), -1.0);
        let g = DVector::from_vec(vec![1.0, 2.0]);
        let mut l = DVector::zeros(2);
        comm.scatter_to_local(&g, &mut l);
        assert_eq!(l, g);
    }
}
