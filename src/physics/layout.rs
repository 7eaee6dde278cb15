use crate::discretization::region::{AdvancedModel, RegionKind};
use crate::physics::SimulationSystem;

/// Unknowns a control volume can carry. The in-node ordering is fixed;
/// which entries are live depends on the equation family and the region's
/// advanced-model switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variable {
    Potential,
    Electron,
    Hole,
    Temperature,
    ElectronTemp,
    HoleTemp,
}

impl Variable {
    pub const ALL: [Variable; 6] = [
        Variable::Potential,
        Variable::Electron,
        Variable::Hole,
        Variable::Temperature,
        Variable::ElectronTemp,
        Variable::HoleTemp,
    ];

    pub fn index(self) -> usize {
        match self {
            Variable::Potential => 0,
            Variable::Electron => 1,
            Variable::Hole => 2,
            Variable::Temperature => 3,
            Variable::ElectronTemp => 4,
            Variable::HoleTemp => 5,
        }
    }
}

/// Which coupled system is being solved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EquationFamily {
    /// Nonlinear Poisson only.
    Poisson,
    /// Poisson + electron/hole continuity (+ lattice heat per region).
    DriftDiffusion,
    /// Drift-diffusion + carrier energy balance equations.
    EnergyBalance,
}

/// Per-region variable set: in-node offset of each live variable.
#[derive(Clone, Debug)]
pub struct RegionLayout {
    offsets: [Option<usize>; 6],
    pub n_variables: usize,
}

impl RegionLayout {
    fn build(kind: RegionKind, advanced: &AdvancedModel, family: EquationFamily) -> Self {
        let mut live = [false; 6];
        live[Variable::Potential.index()] = true;
        if family != EquationFamily::Poisson {
            if kind == RegionKind::Semiconductor {
                live[Variable::Electron.index()] = true;
                live[Variable::Hole.index()] = true;
            }
            live[Variable::Temperature.index()] = advanced.enable_tl;
            if family == EquationFamily::EnergyBalance && kind == RegionKind::Semiconductor {
                live[Variable::ElectronTemp.index()] = advanced.enable_tn;
                live[Variable::HoleTemp.index()] = advanced.enable_tp;
            }
        }
        let mut offsets = [None; 6];
        let mut next = 0;
        for v in Variable::ALL {
            if live[v.index()] {
                offsets[v.index()] = Some(next);
                next += 1;
            }
        }
        Self {
            offsets,
            n_variables: next,
        }
    }

    pub fn offset(&self, v: Variable) -> Option<usize> {
        self.offsets[v.index()]
    }

    pub fn variables(&self) -> impl Iterator<Item = (Variable, usize)> + '_ {
        Variable::ALL
            .into_iter()
            .filter_map(|v| self.offsets[v.index()].map(|o| (v, o)))
    }
}

/// What a global row belongs to; drives damping, scaling and the LTE norm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind {
    Region { region: usize, variable: Variable },
    Electrode { bc: usize },
}

/// The explicit unknown layout of one solve: per-region variable sets, the
/// global offset of every control volume, and one scalar slot per electrode
/// boundary. Built by [`EquationLayout::assign`], passed by value into every
/// assembly call; nothing here is ambient state.
#[derive(Clone, Debug)]
pub struct EquationLayout {
    pub family: EquationFamily,
    regions: Vec<RegionLayout>,
    electrodes: Vec<Option<usize>>,
    rows: Vec<RowKind>,
    pub n_dofs: usize,
}

impl EquationLayout {
    /// Number the unknowns of `system` for `family`, writing local/global
    /// offsets into every `FvmNode` and reserving electrode slots after the
    /// mesh unknowns.
    pub fn assign(system: &mut SimulationSystem, family: EquationFamily) -> EquationLayout {
        let mut regions = Vec::with_capacity(system.regions.len());
        let mut rows = Vec::new();
        let mut next = 0usize;
        for (r, region) in system.regions.iter_mut().enumerate() {
            let rl = RegionLayout::build(region.kind, &region.advanced, family);
            for fvm in &mut region.fvm_nodes {
                fvm.local_offset = next;
                fvm.global_offset = next;
                for (v, _) in rl.variables() {
                    rows.push(RowKind::Region {
                        region: r,
                        variable: v,
                    });
                }
                next += rl.n_variables;
            }
            regions.push(rl);
        }
        let mut electrodes = Vec::with_capacity(system.bcs.len());
        for (b, bc) in system.bcs.iter_mut().enumerate() {
            if bc.needs_electrode_slot() {
                bc.electrode_slot = Some(next);
                electrodes.push(Some(next));
                rows.push(RowKind::Electrode { bc: b });
                next += 1;
            } else {
                bc.electrode_slot = None;
                electrodes.push(None);
            }
        }
        EquationLayout {
            family,
            regions,
            electrodes,
            rows,
            n_dofs: next,
        }
    }

    pub fn region(&self, r: usize) -> &RegionLayout {
        &self.regions[r]
    }

    pub fn n_variables(&self, r: usize) -> usize {
        self.regions[r].n_variables
    }

    /// In-node offset of `v` in region `r`, if live there.
    pub fn offset(&self, r: usize, v: Variable) -> Option<usize> {
        self.regions[r].offset(v)
    }

    /// Global row of variable `v` for a node with the given global offset.
    pub fn row_of(&self, r: usize, node_global_offset: usize, v: Variable) -> Option<usize> {
        self.regions[r].offset(v).map(|o| node_global_offset + o)
    }

    pub fn electrode_offset(&self, bc: usize) -> Option<usize> {
        self.electrodes[bc]
    }

    pub fn row_kind(&self, row: usize) -> RowKind {
        self.rows[row]
    }

    /// Rows the potential-damping factor applies to: every electrostatic
    /// potential unknown and every electrode slot.
    pub fn is_potential_row(&self, row: usize) -> bool {
        matches!(
            self.rows[row],
            RowKind::Region {
                variable: Variable::Potential,
                ..
            } | RowKind::Electrode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::Mesh;
    use crate::discretization::region::{RegionKind, SimulationRegion};
    use crate::physics::material::Material;

    fn two_region_system() -> SimulationSystem {
        let mut mesh = Mesh::new();
        let semi = SimulationRegion::line(
            "semi",
            RegionKind::Semiconductor,
            Material::silicon(),
            &mut mesh,
            &[0.0, 1.0, 2.0],
            1.0,
        );
        let oxide = SimulationRegion::line(
            "ox",
            RegionKind::Insulator,
            Material::oxide(),
            &mut mesh,
            &[2.0, 3.0],
            1.0,
        );
        let mut system = SimulationSystem::new(mesh);
        system.add_region(semi);
        system.add_region(oxide);
        system
    }

    #[test]
    fn poisson_layout_is_one_unknown_per_node() {
        let mut system = two_region_system();
        let layout = EquationLayout::assign(&mut system, EquationFamily::Poisson);
        assert_eq!(layout.n_dofs, 5);
        assert_eq!(layout.n_variables(0), 1);
        assert_eq!(layout.n_variables(1), 1);
        assert_eq!(layout.offset(0, Variable::Electron), None);
    }

    #[test]
    fn drift_diffusion_layout_skips_carriers_in_insulators() {
        let mut system = two_region_system();
        let layout = EquationLayout::assign(&mut system, EquationFamily::DriftDiffusion);
        assert_eq!(layout.n_variables(0), 3);
        assert_eq!(layout.n_variables(1), 1);
        assert_eq!(layout.n_dofs, 3 * 3 + 2);
        assert_eq!(layout.offset(0, Variable::Hole), Some(2));
        // second semiconductor node starts after the first's three unknowns
        assert_eq!(system.regions[0].fvm_nodes[1].global_offset, 3);
        // insulator nodes follow all semiconductor nodes
        assert_eq!(system.regions[1].fvm_nodes[0].global_offset, 9);
    }

    #[test]
    fn energy_balance_adds_temperature_rows() {
        let mut system = two_region_system();
        system.regions[0].advanced.enable_tl = true;
        system.regions[0].advanced.enable_tn = true;
        let layout = EquationLayout::assign(&mut system, EquationFamily::EnergyBalance);
        assert_eq!(layout.n_variables(0), 5);
        assert_eq!(layout.offset(0, Variable::Temperature), Some(3));
        assert_eq!(layout.offset(0, Variable::ElectronTemp), Some(4));
        assert_eq!(layout.offset(0, Variable::HoleTemp), None);
        let row0 = system.regions[0].fvm_nodes[0].global_offset;
        assert!(layout.is_potential_row(row0));
        assert!(!layout.is_potential_row(row0 + 1));
    }
}
