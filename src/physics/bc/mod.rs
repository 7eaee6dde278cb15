//! Boundary and interface stitching.
//!
//! A [`BoundaryCondition`] owns a set of boundary nodes; each node carries
//! the (region, FvmNode) pairs of every region touching it, ordered by
//! region priority so pair 0 is the reference side. Variants never
//! re-derive interior physics: they harvest what the region pass already
//! assembled (contact currents), emit row-surgery instructions, and write
//! their replacement equations after the surgery has run.

pub mod circuit;
pub mod homo_interface;
pub mod inter_connect;
pub mod ohmic;

use nalgebra::DVector;

use crate::error::Error;
use crate::numerics::matrix::AijMatrix;
use crate::numerics::row_surgery::RowOps;
use crate::numerics::transient::TimeScheme;
use crate::physics::layout::EquationLayout;
use crate::physics::SimulationSystem;
use circuit::ExtCircuit;

use crate::discretization::region::RegionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BcKind {
    /// Outer surface of the device (contacts, free surfaces).
    Boundary,
    /// Internal surface between two regions.
    Interface,
    /// A contact that also covers an interface (an electrode whose edge
    /// touches an insulator region).
    MixedBoundaryInterface,
    /// Pure circuit node tying several electrodes together.
    InterConnect,
}

/// One boundary mesh node and the per-region control volumes on it,
/// ordered by region priority (semiconductors first, then region index).
#[derive(Clone, Debug)]
pub struct BoundaryNode {
    pub node: usize,
    pub pairs: Vec<(usize, usize)>,
    /// Boundary surface area attached to this node; used by the contact
    /// heat-exchange term. Zero unless set up by the mesh importer.
    pub area: f64,
}

#[derive(Clone, Debug)]
pub enum BcVariant {
    OhmicContact(ohmic::OhmicContact),
    HomoInterface,
    InterConnectHub,
}

pub struct BoundaryCondition {
    pub name: String,
    pub kind: BcKind,
    pub variant: BcVariant,
    pub nodes: Vec<BoundaryNode>,
    pub circuit: Option<ExtCircuit>,
    /// Global offset of the electrode scalar unknown, assigned by the
    /// layout; `None` for variants without one.
    pub electrode_slot: Option<usize>,
    /// Index of the inter-connect hub this electrode hangs off, if any.
    pub inter_connect: Option<usize>,
    /// Device extension in z for 2D meshes; multiplies electrode currents.
    pub z_width: f64,
}

impl BoundaryCondition {
    pub fn ohmic(name: impl Into<String>, circuit: ExtCircuit) -> Self {
        Self {
            name: name.into(),
            kind: BcKind::Boundary,
            variant: BcVariant::OhmicContact(ohmic::OhmicContact::default()),
            nodes: Vec::new(),
            circuit: Some(circuit),
            electrode_slot: None,
            inter_connect: None,
            z_width: 1.0,
        }
    }

    pub fn homo_interface(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BcKind::Interface,
            variant: BcVariant::HomoInterface,
            nodes: Vec::new(),
            circuit: None,
            electrode_slot: None,
            inter_connect: None,
            z_width: 1.0,
        }
    }

    pub fn inter_connect_hub(name: impl Into<String>, circuit: ExtCircuit) -> Self {
        Self {
            name: name.into(),
            kind: BcKind::InterConnect,
            variant: BcVariant::InterConnectHub,
            nodes: Vec::new(),
            circuit: Some(circuit),
            electrode_slot: None,
            inter_connect: None,
            z_width: 1.0,
        }
    }

    pub fn needs_electrode_slot(&self) -> bool {
        match self.variant {
            BcVariant::OhmicContact(_) => self.circuit.is_some(),
            BcVariant::InterConnectHub => true,
            BcVariant::HomoInterface => false,
        }
    }

    /// Setup-time consistency checks; all violations are fatal.
    pub fn validate(&self, system: &SimulationSystem) -> Result<(), Error> {
        match self.variant {
            BcVariant::OhmicContact(_) => {
                for bnode in &self.nodes {
                    let (r0, _) = bnode.pairs[0];
                    if system.regions[r0].kind != RegionKind::Semiconductor {
                        return Err(Error::BoundaryConfiguration(format!(
                            "ohmic contact `{}`: node {} has no semiconductor region",
                            self.name, bnode.node
                        )));
                    }
                }
                if self.circuit.is_none() {
                    return Err(Error::BoundaryConfiguration(format!(
                        "ohmic contact `{}` has no external circuit",
                        self.name
                    )));
                }
            }
            BcVariant::HomoInterface => {
                for bnode in &self.nodes {
                    if bnode.pairs.len() < 2 {
                        return Err(Error::BoundaryConfiguration(format!(
                            "interface `{}`: node {} touches a single region",
                            self.name, bnode.node
                        )));
                    }
                }
            }
            BcVariant::InterConnectHub => {
                if !self.nodes.is_empty() {
                    return Err(Error::BoundaryConfiguration(format!(
                        "inter-connect hub `{}` must not own mesh nodes",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-boundary working state of one assembly pass: the accumulated
/// electrode current and the harvested circuit-row Jacobian entries.
#[derive(Clone, Debug, Default)]
pub struct BcScratch {
    pub current: f64,
    pub electrode_row: Vec<(usize, f64)>,
}

pub fn fill_value(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    x: &mut DVector<f64>,
    l: &mut DVector<f64>,
) {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => ohmic::fill_value(bc, layout, b, x, l),
        BcVariant::InterConnectHub => inter_connect::fill_value(bc, layout, b, x, l),
        BcVariant::HomoInterface => {}
    }
}

/// Residual preprocess: harvest conduction/displacement currents and emit
/// row-surgery instructions. Runs after the region pass, before surgery.
pub fn preprocess_residual(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    x: &[f64],
    f: &DVector<f64>,
    time: &TimeScheme,
    ops: &mut RowOps,
    scratch: &mut BcScratch,
) {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => {
            ohmic::preprocess_residual(system, bc, layout, x, f, time, ops, scratch)
        }
        BcVariant::HomoInterface => homo_interface::preprocess(system, bc, layout, ops),
        BcVariant::InterConnectHub => {}
    }
}

/// Write the boundary equations; every touched row was either cleared or
/// redirected by the surgery step.
pub fn assemble_residual(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    x: &[f64],
    f: &mut DVector<f64>,
    time: &TimeScheme,
    scratch: &BcScratch,
    on_last_rank: bool,
) -> Result<(), Error> {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => {
            ohmic::assemble_residual(system, bc, layout, x, f, time, scratch, on_last_rank)
        }
        BcVariant::HomoInterface => homo_interface::assemble_residual(system, bc, layout, x, f),
        BcVariant::InterConnectHub => {
            inter_connect::assemble_residual(bc, layout, b, x, f, on_last_rank)
        }
    }
}

pub fn preprocess_jacobian(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    jac: &AijMatrix,
    time: &TimeScheme,
    ops: &mut RowOps,
    scratch: &mut BcScratch,
) {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => {
            ohmic::preprocess_jacobian(system, bc, layout, jac, time, ops, scratch)
        }
        BcVariant::HomoInterface => homo_interface::preprocess(system, bc, layout, ops),
        BcVariant::InterConnectHub => {}
    }
}

pub fn assemble_jacobian(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    x: &[f64],
    jac: &mut AijMatrix,
    time: &TimeScheme,
    scratch: &BcScratch,
    on_last_rank: bool,
) -> Result<(), Error> {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => {
            ohmic::assemble_jacobian(system, bc, layout, x, jac, time, scratch, on_last_rank)
        }
        BcVariant::HomoInterface => homo_interface::assemble_jacobian(system, bc, layout, jac),
        BcVariant::InterConnectHub => {
            inter_connect::assemble_jacobian(bc, layout, b, jac, on_last_rank)
        }
    }
}

/// Insert explicit zeros for every position a later boundary pass writes,
/// so the compressed pattern never has to grow mid-solve.
pub fn reserve_pattern(
    system: &SimulationSystem,
    b: usize,
    layout: &EquationLayout,
    jac: &mut AijMatrix,
) {
    let bc = &system.bcs[b];
    match bc.variant {
        BcVariant::OhmicContact(_) => ohmic::reserve_pattern(system, bc, layout, jac),
        BcVariant::HomoInterface => homo_interface::reserve_pattern(system, bc, layout, jac),
        BcVariant::InterConnectHub => inter_connect::reserve_pattern(bc, layout, b, jac),
    }
}

/// Commit the running circuit values after an accepted nonlinear solve.
pub fn update_solution(bc: &mut BoundaryCondition, x: &DVector<f64>, scratch: &BcScratch) {
    if let (Some(slot), Some(ckt)) = (bc.electrode_slot, bc.circuit.as_mut()) {
        ckt.update(x[slot], scratch.current);
        ckt.commit();
    }
}
