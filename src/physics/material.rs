use num_dual::DualNum;

/// Physical constants (SI).
pub mod consts {
    /// Boltzmann constant [J/K].
    pub const KB: f64 = 1.380649e-23;
    /// Elementary charge [C].
    pub const E: f64 = 1.602176634e-19;
    /// Vacuum permittivity [F/m].
    pub const EPS0: f64 = 8.8541878128e-12;
}

/// Homogeneous material parameters of one region.
///
/// Queries that depend on an unknown (the lattice temperature, carrier
/// densities) are generic over the AD scalar so the same expression feeds
/// both the residual (`f64`) and Jacobian (`DualDVec64`) paths. Queries
/// driven by a frozen field magnitude stay `f64`.
#[derive(Clone, Debug)]
pub struct Material {
    /// Relative permittivity.
    pub eps_r: f64,
    /// Electron affinity [V].
    pub affinity: f64,
    /// Band gap [eV].
    pub eg: f64,
    /// Effective densities of states [1/m^3].
    pub nc: f64,
    pub nv: f64,
    /// Low-field mobilities [m^2/Vs].
    pub mun: f64,
    pub mup: f64,
    /// Saturation velocities [m/s].
    pub vsat_n: f64,
    pub vsat_p: f64,
    /// SRH lifetimes [s].
    pub tau_n: f64,
    pub tau_p: f64,
    /// Impact ionization rate coefficients, alpha = a * exp(-b / E).
    pub ii_an: f64,
    pub ii_bn: f64,
    pub ii_ap: f64,
    pub ii_bp: f64,
    /// Band-to-band tunneling, G = a * E^2 * exp(-b / E).
    pub bbt_a: f64,
    pub bbt_b: f64,
    /// Lattice thermal conductivity [W/(m K)] and volumetric heat
    /// capacity [J/(m^3 K)].
    pub kappa: f64,
    pub heat_capacity: f64,
    /// Carrier energy relaxation times [s].
    pub tau_wn: f64,
    pub tau_wp: f64,
}

impl Material {
    pub fn silicon() -> Self {
        Self {
            eps_r: 11.7,
            affinity: 4.05,
            eg: 1.12,
            nc: 2.8e25,
            nv: 1.04e25,
            mun: 0.1417,
            mup: 0.0470,
            vsat_n: 1.07e5,
            vsat_p: 8.37e4,
            tau_n: 1e-7,
            tau_p: 1e-7,
            ii_an: 7.03e7,
            ii_bn: 1.231e8,
            ii_ap: 6.71e7,
            ii_bp: 1.693e8,
            bbt_a: 3.5e27,
            bbt_b: 2.25e9,
            kappa: 150.0,
            heat_capacity: 1.63e6,
            tau_wn: 1e-12,
            tau_wp: 1e-12,
        }
    }

    pub fn oxide() -> Self {
        Self {
            eps_r: 3.9,
            affinity: 0.97,
            eg: 9.0,
            nc: 0.0,
            nv: 0.0,
            mun: 0.0,
            mup: 0.0,
            vsat_n: 0.0,
            vsat_p: 0.0,
            tau_n: 0.0,
            tau_p: 0.0,
            ii_an: 0.0,
            ii_bn: 0.0,
            ii_ap: 0.0,
            ii_bp: 0.0,
            bbt_a: 0.0,
            bbt_b: 0.0,
            kappa: 1.4,
            heat_capacity: 1.67e6,
            tau_wn: 0.0,
            tau_wp: 0.0,
        }
    }

    /// Absolute permittivity [F/m].
    pub fn eps(&self) -> f64 {
        self.eps_r * consts::EPS0
    }

    /// Thermal voltage kT/q at lattice temperature `t`.
    pub fn vt<T: DualNum<f64>>(&self, t: T) -> T {
        t * (consts::KB / consts::E)
    }

    /// Intrinsic carrier density at lattice temperature `t`.
    pub fn nie<T: DualNum<f64>>(&self, t: T) -> T {
        let prefactor = (self.nc * self.nv).sqrt();
        let c = -self.eg * consts::E / (2.0 * consts::KB);
        (t.recip() * c).exp() * prefactor
    }

    /// Field-dependent electron mobility (Caughey-Thomas, beta = 2), with
    /// the driving field taken as a frozen scalar.
    pub fn mobility_n(&self, e_parallel: f64) -> f64 {
        if self.vsat_n <= 0.0 {
            return self.mun;
        }
        let r = self.mun * e_parallel.abs() / self.vsat_n;
        self.mun / (1.0 + r * r).sqrt()
    }

    /// Field-dependent hole mobility (Caughey-Thomas, beta = 1).
    pub fn mobility_p(&self, e_parallel: f64) -> f64 {
        if self.vsat_p <= 0.0 {
            return self.mup;
        }
        let r = self.mup * e_parallel.abs() / self.vsat_p;
        self.mup / (1.0 + r)
    }

    /// Net Shockley-Read-Hall recombination rate.
    pub fn srh<T: DualNum<f64>>(&self, n: T, p: T, nie: T) -> T {
        let denom = (n.clone() + nie.clone()) * self.tau_p + (p.clone() + nie.clone()) * self.tau_n;
        (n * p - nie.clone() * nie) / denom
    }

    /// Electron impact-ionization coefficient at a frozen field magnitude.
    pub fn ii_alpha_n(&self, e: f64) -> f64 {
        if e <= 0.0 {
            0.0
        } else {
            self.ii_an * (-self.ii_bn / e).exp()
        }
    }

    pub fn ii_alpha_p(&self, e: f64) -> f64 {
        if e <= 0.0 {
            0.0
        } else {
            self.ii_ap * (-self.ii_bp / e).exp()
        }
    }

    /// Band-to-band tunneling generation rate at a frozen field magnitude.
    pub fn bbt_rate(&self, e: f64) -> f64 {
        if e <= 0.0 {
            0.0
        } else {
            self.bbt_a * e * e * (-self.bbt_b / e).exp()
        }
    }

    /// Equilibrium carrier densities at net doping `dop` (charge-neutral,
    /// Boltzmann statistics).
    pub fn equilibrium_densities(&self, dop: f64, nie: f64) -> (f64, f64) {
        if dop >= 0.0 {
            let ne = 0.5 * (dop + (dop * dop + 4.0 * nie * nie).sqrt());
            (ne, nie * nie / ne)
        } else {
            let pe = 0.5 * (-dop + (dop * dop + 4.0 * nie * nie).sqrt());
            (nie * nie / pe, pe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_density_is_reasonable_for_silicon() {
        let si = Material::silicon();
        let nie = si.nie(300.0);
        // ~1e16 1/m^3 at room temperature with these band parameters
        assert!(nie > 1e14 && nie < 1e17, "nie = {nie:e}");
    }

    #[test]
    fn equilibrium_densities_satisfy_mass_action_and_neutrality() {
        let si = Material::silicon();
        let nie = si.nie(300.0);
        for &dop in &[1e21, -3e22, 0.0, 1e10] {
            let (ne, pe) = si.equilibrium_densities(dop, nie);
            assert!((ne * pe / (nie * nie) - 1.0).abs() < 1e-9);
            assert!(((ne - pe - dop) / nie.max(dop.abs())).abs() < 1e-9);
        }
    }

    #[test]
    fn srh_vanishes_in_equilibrium() {
        let si = Material::silicon();
        let nie = si.nie(300.0);
        let r = si.srh(2.0 * nie, 0.5 * nie, nie);
        assert!(r.abs() < 1e-6 * nie);
    }

    #[test]
    fn high_field_mobility_saturates() {
        let si = Material::silicon();
        assert!((si.mobility_n(0.0) - si.mun).abs() < 1e-15);
        let high = si.mobility_n(1e8);
        assert!(high < 0.01 * si.mun);
        // v = mu(E) * E approaches vsat
        assert!((high * 1e8 / si.vsat_n - 1.0).abs() < 0.05);
    }
}
