//! Lumped external circuit attached to an electrode: a series resistor and
//! inductor, a capacitor to ground, and either a voltage or a current
//! source. The electrode's scalar unknown Ve is the node between the
//! lumped elements and the contact.

use crate::numerics::transient::TimeScheme;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveMode {
    Voltage,
    Current,
}

/// Circuit state. `potential`/`current` are committed after every accepted
/// nonlinear solve; `*_old` hold the previous accepted time level;
/// `*_itering` track the running Newton iteration for diagnostics.
#[derive(Clone, Debug)]
pub struct ExtCircuit {
    pub r: f64,
    pub c: f64,
    pub l: f64,
    pub v_app: f64,
    pub i_app: f64,
    pub mode: DriveMode,

    pub potential: f64,
    pub current: f64,
    pub potential_old: f64,
    pub current_old: f64,
    /// Capacitor branch current at the previous time level.
    pub cap_current_old: f64,

    pub potential_itering: f64,
    pub current_itering: f64,
}

impl ExtCircuit {
    pub fn voltage_driven(r: f64, c: f64, l: f64, v_app: f64) -> Self {
        Self {
            r,
            c,
            l,
            v_app,
            i_app: 0.0,
            mode: DriveMode::Voltage,
            potential: 0.0,
            current: 0.0,
            potential_old: 0.0,
            current_old: 0.0,
            cap_current_old: 0.0,
            potential_itering: 0.0,
            current_itering: 0.0,
        }
    }

    pub fn current_driven(r: f64, c: f64, l: f64, i_app: f64) -> Self {
        Self {
            i_app,
            v_app: 0.0,
            mode: DriveMode::Current,
            ..Self::voltage_driven(r, c, l, 0.0)
        }
    }

    pub fn is_voltage_driven(&self) -> bool {
        self.mode == DriveMode::Voltage
    }

    /// Coefficient the accumulated electrode current (conduction plus
    /// displacement) enters the circuit row with.
    pub fn current_coef(&self, time: &TimeScheme, inter_connect: bool) -> f64 {
        if inter_connect {
            return self.r;
        }
        match (self.mode, time.dt()) {
            (DriveMode::Voltage, None) => self.r,
            (DriveMode::Voltage, Some(dt)) => self.l / dt + self.r,
            (DriveMode::Current, _) => 1.0,
        }
    }

    /// Circuit-row residual terms that do not involve the accumulated
    /// electrode current.
    ///
    /// Voltage driven, transient:
    ///   (Ve - Vapp) + (L/dt + R)(C/dt)(Ve - V_old) - (L/dt)(I_old + Ic_old)
    /// Voltage driven, steady: Ve - Vapp.
    /// Current driven: C/dt (Ve - V_old) - Iapp (steady: -Iapp).
    /// Inter-connected electrode: Ve - V_hub.
    pub fn residual_core(&self, ve: f64, time: &TimeScheme, v_hub: Option<f64>) -> f64 {
        if let Some(v_hub) = v_hub {
            return ve - v_hub;
        }
        match (self.mode, time.dt()) {
            (DriveMode::Voltage, None) => ve - self.v_app,
            (DriveMode::Voltage, Some(dt)) => {
                (ve - self.v_app)
                    + (self.l / dt + self.r) * (self.c / dt) * (ve - self.potential_old)
                    - (self.l / dt) * (self.current_old + self.cap_current_old)
            }
            (DriveMode::Current, None) => -self.i_app,
            (DriveMode::Current, Some(dt)) => {
                (self.c / dt) * (ve - self.potential_old) - self.i_app
            }
        }
    }

    /// d(residual_core)/dVe.
    pub fn d_core_d_ve(&self, time: &TimeScheme, inter_connect: bool) -> f64 {
        if inter_connect {
            return 1.0;
        }
        match (self.mode, time.dt()) {
            (DriveMode::Voltage, None) => 1.0,
            (DriveMode::Voltage, Some(dt)) => {
                1.0 + (self.l / dt + self.r) * (self.c / dt)
            }
            (DriveMode::Current, None) => 0.0,
            (DriveMode::Current, Some(dt)) => self.c / dt,
        }
    }

    /// Record the running iteration values; committed on acceptance.
    pub fn update(&mut self, ve: f64, i: f64) {
        self.potential_itering = ve;
        self.current_itering = i;
    }

    /// Commit the iteration values after an accepted nonlinear solve.
    pub fn commit(&mut self) {
        self.potential = self.potential_itering;
        self.current = self.current_itering;
    }

    /// Advance the time level after an accepted transient step.
    pub fn advance_time(&mut self, dt: f64) {
        self.cap_current_old = self.c / dt * (self.potential - self.potential_old);
        self.potential_old = self.potential;
        self.current_old = self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resistorless_voltage_drive_pins_the_electrode() {
        let ckt = ExtCircuit::voltage_driven(0.0, 0.0, 0.0, 5.0);
        let steady = TimeScheme::Steady;
        assert_eq!(ckt.residual_core(5.0, &steady, None), 0.0);
        assert_eq!(ckt.residual_core(3.0, &steady, None), -2.0);
        assert_eq!(ckt.d_core_d_ve(&steady, false), 1.0);
        // R = 0 removes the accumulated current from the circuit row
        assert_eq!(ckt.current_coef(&steady, false), 0.0);
    }

    #[test]
    fn transient_voltage_drive_couples_rlc_history() {
        let mut ckt = ExtCircuit::voltage_driven(10.0, 1e-12, 1e-9, 1.0);
        ckt.potential_old = 0.5;
        ckt.current_old = 1e-3;
        let dt = 1e-9;
        let time = TimeScheme::Bdf1 { dt };
        let core = ckt.residual_core(0.8, &time, None);
        let expect = (0.8 - 1.0) + (1.0 + 10.0) * (1e-12 / dt) * (0.8 - 0.5) - 1.0 * 1e-3;
        assert!((core - expect).abs() < 1e-12);
        assert!((ckt.current_coef(&time, false) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn inter_connect_core_tracks_the_hub() {
        let ckt = ExtCircuit::voltage_driven(2.0, 0.0, 0.0, 0.0);
        let steady = TimeScheme::Steady;
        assert_eq!(ckt.residual_core(1.5, &steady, Some(1.0)), 0.5);
        assert_eq!(ckt.current_coef(&steady, true), 2.0);
    }

    #[test]
    fn commit_and_advance_shift_history() {
        let mut ckt = ExtCircuit::voltage_driven(0.0, 2.0, 0.0, 0.0);
        ckt.update(1.0, 0.25);
        ckt.commit();
        assert_eq!(ckt.potential, 1.0);
        assert_eq!(ckt.current, 0.25);
        ckt.advance_time(0.5);
        // Ic = C/dt * (V - V_old) = 2/0.5 * 1.0
        assert_eq!(ckt.cap_current_old, 4.0);
        assert_eq!(ckt.potential_old, 1.0);
        assert_eq!(ckt.current_old, 0.25);
    }
}
