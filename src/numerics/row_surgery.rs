//! Row redirection between the region assembly pass and the boundary
//! assembly pass.
//!
//! Boundary variants do not re-derive interior physics: where an equation
//! must move (an interface node's flux balance folding into the reference
//! region's row) or be replaced (a contact overriding a continuity row),
//! they emit (src, dst, clear) instructions. Applying them is the only
//! legal way a row changes hands; a row is either finalized by its region
//! or explicitly redirected, never both.

use nalgebra::DVector;

use crate::numerics::matrix::AijMatrix;

/// Collected row instructions of one assembly pass. `src[i]` is added into
/// `dst[i]` and then zeroed; every row in `clear` is zeroed outright.
#[derive(Clone, Debug, Default)]
pub struct RowOps {
    pub src: Vec<usize>,
    pub dst: Vec<usize>,
    pub clear: Vec<usize>,
}

impl RowOps {
    /// Move row `src` into row `dst` (and zero `src`).
    pub fn redirect(&mut self, src: usize, dst: usize) {
        self.src.push(src);
        self.dst.push(dst);
    }

    /// Zero a row so the boundary pass can rewrite it.
    pub fn clear_row(&mut self, row: usize) {
        self.clear.push(row);
    }
}

/// Apply to the residual vector: `f[dst] += f[src]; f[src] = 0`, then
/// `f[clear] = 0`.
pub fn apply_to_vector(f: &mut DVector<f64>, ops: &RowOps) {
    for (&s, &d) in ops.src.iter().zip(&ops.dst) {
        f[d] += f[s];
        f[s] = 0.0;
    }
    for &c in &ops.clear {
        f[c] = 0.0;
    }
}

/// Apply to the Jacobian: add each src row into its dst row entry-wise,
/// zero the src rows, then zero the cleared rows. Diagonals are left empty;
/// the boundary pass writes the replacement equations immediately after.
pub fn apply_to_matrix(a: &mut AijMatrix, ops: &RowOps) {
    for (&s, &d) in ops.src.iter().zip(&ops.dst) {
        a.add_row_to_row(s, d);
    }
    for &s in &ops.src {
        a.zero_row(s, 0.0);
    }
    for &c in &ops.clear {
        a.zero_row(c, 0.0);
    }
}
