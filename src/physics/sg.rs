//! Bernoulli function and Scharfetter-Gummel exponential-fitted edge
//! currents, generic over the AD scalar so the residual and Jacobian paths
//! evaluate the exact same expressions.

use num_dual::DualNum;

/// Bernoulli function B(x) = x / (exp(x) - 1), with the removable
/// singularity handled by its Taylor series. The branch is taken on the
/// real part so both AD paths follow the same expression.
pub fn bern<T: DualNum<f64>>(x: T) -> T {
    if x.re().abs() < 1e-4 {
        // B(x) = 1 - x/2 + x^2/12 + O(x^4)
        T::one() - x.clone() * 0.5 + x.clone() * x * (1.0 / 12.0)
    } else {
        x.clone() / (x.exp() - T::one())
    }
}

/// Electron particle current density along an edge from node 1 to node 2,
/// per unit mobility and edge area:
///
///   Jn = Vt/h * ( n2 * B(dv) - n1 * B(-dv) ),  dv = (v2 - v1)/Vt
///
/// Exactly zero when n follows the Boltzmann ratio exp((v2-v1)/Vt).
pub fn sg_electron<T: DualNum<f64>>(vt: T, v1: T, v2: T, n1: T, n2: T, h: f64) -> T {
    let dv = (v2 - v1) / vt.clone();
    (n2 * bern(dv.clone()) - n1 * bern(-dv)) * vt * (1.0 / h)
}

/// Hole particle current density along an edge from node 1 to node 2:
///
///   Jp = Vt/h * ( p1 * B(dv) - p2 * B(-dv) ),  dv = (v2 - v1)/Vt
pub fn sg_hole<T: DualNum<f64>>(vt: T, v1: T, v2: T, p1: T, p2: T, h: f64) -> T {
    let dv = (v2 - v1) / vt.clone();
    (p1 * bern(dv.clone()) - p2 * bern(-dv)) * vt * (1.0 / h)
}
