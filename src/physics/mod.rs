pub mod bc;
pub mod layout;
pub mod material;
pub mod region;
pub mod sg;

use crate::discretization::mesh::Mesh;
use crate::discretization::region::SimulationRegion;
use crate::error::Error;
use bc::BoundaryCondition;

/// Scalar bound shared by every physics kernel: the same code evaluates the
/// residual with `f64` and the Jacobian with `num_dual::DualDVec64`.
pub trait AdScalar: nalgebra::Scalar + num_dual::DualNum<f64> + num_traits::Zero {}
impl<T: nalgebra::Scalar + num_dual::DualNum<f64> + num_traits::Zero> AdScalar for T {}

/// The whole problem: geometry, regions and boundary conditions. Regions
/// are closed worlds; every cross-region interaction goes through a
/// [`BoundaryCondition`].
pub struct SimulationSystem {
    pub mesh: Mesh,
    pub regions: Vec<SimulationRegion>,
    pub bcs: Vec<BoundaryCondition>,
}

impl SimulationSystem {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            regions: Vec::new(),
            bcs: Vec::new(),
        }
    }

    pub fn add_region(&mut self, region: SimulationRegion) -> usize {
        self.regions.push(region);
        self.regions.len() - 1
    }

    /// Register a boundary condition over a set of mesh nodes. For each
    /// node the (region, FvmNode) pairs are collected from every region
    /// touching it and ordered by region priority (semiconductors first,
    /// then by region index), so pair 0 is the reference region of a
    /// stitch. Misconfigured sets are rejected here, before any assembly.
    pub fn add_bc(
        &mut self,
        mut bc: BoundaryCondition,
        mesh_nodes: &[usize],
    ) -> Result<usize, Error> {
        for &node in mesh_nodes {
            let mut pairs = Vec::new();
            for (r, region) in self.regions.iter().enumerate() {
                if let Some(fvm) = region.fvm_node_by_mesh_node(node) {
                    pairs.push((r, fvm));
                }
            }
            if pairs.is_empty() {
                return Err(Error::BoundaryConfiguration(format!(
                    "boundary `{}`: mesh node {} belongs to no region",
                    bc.name, node
                )));
            }
            pairs.sort_by_key(|&(r, _)| (self.regions[r].kind.priority(), r));
            bc.nodes.push(bc::BoundaryNode {
                node,
                pairs,
                area: 0.0,
            });
        }
        bc.validate(self)?;
        self.bcs.push(bc);
        Ok(self.bcs.len() - 1)
    }
}
