use glam::DVec3;

use crate::discretization::mesh::Mesh;
use crate::physics::material::Material;

/// Region family. Interface pair ordering puts semiconductors first, so a
/// semiconductor control volume is always the reference side of a stitch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Semiconductor,
    Insulator,
}

impl RegionKind {
    /// Deterministic interface priority; lower sorts first.
    pub fn priority(self) -> u8 {
        match self {
            RegionKind::Semiconductor => 0,
            RegionKind::Insulator => 1,
        }
    }
}

/// Per-region physics switches. All default to off; the unknown layout and
/// the assemblers both consult these, so flipping one reshapes the system.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvancedModel {
    pub enable_tl: bool,
    pub enable_tn: bool,
    pub enable_tp: bool,
    pub impact_ionization: bool,
    pub band_to_band_tunneling: bool,
    pub high_field_mobility: bool,
    /// Clamp per-edge partial areas/volumes to be non-negative. Obtuse
    /// elements otherwise produce negative Voronoi weights.
    pub truncate_cv: bool,
}

/// Link from one control volume to a neighbor, through a region edge.
#[derive(Clone, Copy, Debug)]
pub struct NeighborLink {
    /// Index of the neighbor `FvmNode` within the same region.
    pub fvm: usize,
    /// Index of the shared `RegionEdge`.
    pub edge: usize,
}

/// A control volume of one region. Several `FvmNode`s in different regions
/// may share the same mesh `Node` at an interface.
pub struct FvmNode {
    /// Mesh node this control volume sits on.
    pub node: usize,
    /// Index into the region's `node_data`.
    pub data: usize,
    pub volume: f64,
    /// Offset of this node's first unknown in the rank-local vector.
    /// (Re)assigned whenever the equation layout changes.
    pub local_offset: usize,
    /// Offset of this node's first unknown in the global vector.
    pub global_offset: usize,
    /// False for ghost copies of nodes owned by another rank.
    pub on_processor: bool,
    pub neighbors: Vec<NeighborLink>,
}

impl FvmNode {
    pub fn neighbor_edge(&self, other: usize) -> Option<usize> {
        self.neighbors
            .iter()
            .find(|l| l.fvm == other)
            .map(|l| l.edge)
    }
}

/// Solution and derived state of one control volume. Written only by
/// `update_solution` after an accepted nonlinear solve; `*_last` and
/// `*_last2` hold the two previous accepted time levels for BDF2/LTE.
#[derive(Clone, Debug)]
pub struct FvmNodeData {
    pub psi: f64,
    pub n: f64,
    pub p: f64,
    pub t: f64,
    pub tn: f64,
    pub tp: f64,

    pub psi_last: f64,
    pub n_last: f64,
    pub p_last: f64,
    pub t_last: f64,
    pub tn_last: f64,
    pub tp_last: f64,

    pub psi_last2: f64,
    pub n_last2: f64,
    pub p_last2: f64,
    pub t_last2: f64,
    pub tn_last2: f64,
    pub tp_last2: f64,

    /// Donor / acceptor concentrations, fixed after setup.
    pub nd: f64,
    pub na: f64,

    /// |grad psi| at the node, refreshed on accepted solves.
    pub e_field: f64,
    /// Net SRH recombination, refreshed by `update_solution`.
    pub recomb: f64,
}

impl FvmNodeData {
    pub fn new(t_ambient: f64) -> Self {
        Self {
            psi: 0.0,
            n: 0.0,
            p: 0.0,
            t: t_ambient,
            tn: t_ambient,
            tp: t_ambient,
            psi_last: 0.0,
            n_last: 0.0,
            p_last: 0.0,
            t_last: t_ambient,
            tn_last: t_ambient,
            tp_last: t_ambient,
            psi_last2: 0.0,
            n_last2: 0.0,
            p_last2: 0.0,
            t_last2: t_ambient,
            tn_last2: t_ambient,
            tp_last2: t_ambient,
            nd: 0.0,
            na: 0.0,
            e_field: 0.0,
            recomb: 0.0,
        }
    }

    pub fn net_doping(&self) -> f64 {
        self.nd - self.na
    }
}

/// One edge of a region's control-volume graph: the pair of FvmNodes it
/// connects, the shared control-volume surface, and the partial volumes the
/// edge contributes to each endpoint (used by edge-attached generation
/// terms such as impact ionization).
#[derive(Clone, Debug)]
pub struct RegionEdge {
    /// FvmNode indices (a, b) within this region.
    pub nodes: (usize, usize),
    pub length: f64,
    pub cv_area: f64,
    pub partial_volume: (f64, f64),
    /// Cell the edge belongs to, when cell-level gradients are needed.
    pub cell: Option<usize>,
}

/// A mesh element restricted to one region; only used for vertex-gradient
/// reconstruction of cell-attached terms.
#[derive(Clone, Debug)]
pub struct RegionCell {
    /// FvmNode indices of the vertices.
    pub nodes: Vec<usize>,
    pub volume: f64,
}

/// One homogeneous material region: its control volumes, edges, cells and
/// material model. Regions never reference each other; all cross-region
/// coupling goes through boundary conditions.
pub struct SimulationRegion {
    pub name: String,
    pub kind: RegionKind,
    pub material: Material,
    pub advanced: AdvancedModel,
    /// Ambient temperature; also the heat-sink temperature of contacts.
    pub t_external: f64,
    pub fvm_nodes: Vec<FvmNode>,
    pub node_data: Vec<FvmNodeData>,
    pub edges: Vec<RegionEdge>,
    pub cells: Vec<RegionCell>,
}

impl SimulationRegion {
    pub fn new(name: impl Into<String>, kind: RegionKind, material: Material) -> Self {
        Self {
            name: name.into(),
            kind,
            material,
            advanced: AdvancedModel::default(),
            t_external: 300.0,
            fvm_nodes: Vec::new(),
            node_data: Vec::new(),
            edges: Vec::new(),
            cells: Vec::new(),
        }
    }

    /// Add a control volume on mesh node `node`. Returns the FvmNode index.
    pub fn add_fvm_node(&mut self, node: usize, volume: f64) -> usize {
        let data = self.node_data.len();
        self.node_data.push(FvmNodeData::new(self.t_external));
        let idx = self.fvm_nodes.len();
        self.fvm_nodes.push(FvmNode {
            node,
            data,
            volume,
            local_offset: 0,
            global_offset: 0,
            on_processor: true,
            neighbors: Vec::new(),
        });
        idx
    }

    /// Connect two control volumes. `cv_area` is the shared control-volume
    /// surface; both are clamped to zero when truncation is on. Partial
    /// volumes default to an even split of the edge prism.
    pub fn add_edge(&mut self, a: usize, b: usize, length: f64, cv_area: f64) -> usize {
        let area = if self.advanced.truncate_cv {
            cv_area.max(0.0)
        } else {
            cv_area
        };
        let half = 0.5 * area * length * 0.5;
        let idx = self.edges.len();
        self.edges.push(RegionEdge {
            nodes: (a, b),
            length,
            cv_area: area,
            partial_volume: (half, half),
            cell: None,
        });
        self.fvm_nodes[a].neighbors.push(NeighborLink { fvm: b, edge: idx });
        self.fvm_nodes[b].neighbors.push(NeighborLink { fvm: a, edge: idx });
        idx
    }

    pub fn add_cell(&mut self, nodes: Vec<usize>, volume: f64) -> usize {
        self.cells.push(RegionCell { nodes, volume });
        self.cells.len() - 1
    }

    /// Look up the control volume sitting on a mesh node.
    pub fn fvm_node_by_mesh_node(&self, node: usize) -> Option<usize> {
        self.fvm_nodes.iter().position(|f| f.node == node)
    }

    pub fn data(&self, fvm: usize) -> &FvmNodeData {
        &self.node_data[self.fvm_nodes[fvm].data]
    }

    pub fn data_mut(&mut self, fvm: usize) -> &mut FvmNodeData {
        &mut self.node_data[self.fvm_nodes[fvm].data]
    }

    pub fn position(&self, mesh: &Mesh, fvm: usize) -> DVec3 {
        mesh.nodes[self.fvm_nodes[fvm].node].position
    }

    /// Build a uniform 1D chain of control volumes along x, with the given
    /// cross section. Handy for line devices and verification problems.
    pub fn line(
        name: impl Into<String>,
        kind: RegionKind,
        material: Material,
        mesh: &mut Mesh,
        xs: &[f64],
        cross_section: f64,
    ) -> Self {
        let mut region = Self::new(name, kind, material);
        let mut fvm_ids = Vec::with_capacity(xs.len());
        for (i, &x) in xs.iter().enumerate() {
            let left = if i > 0 { (x - xs[i - 1]) * 0.5 } else { 0.0 };
            let right = if i + 1 < xs.len() {
                (xs[i + 1] - x) * 0.5
            } else {
                0.0
            };
            let node = mesh.add_node(DVec3::new(x, 0.0, 0.0));
            fvm_ids.push(region.add_fvm_node(node, (left + right) * cross_section));
        }
        for i in 1..xs.len() {
            region.add_edge(fvm_ids[i - 1], fvm_ids[i], xs[i] - xs[i - 1], cross_section);
        }
        region
    }

    /// Uniform doping over every node of the region.
    pub fn dope_uniform(&mut self, nd: f64, na: f64) {
        for d in &mut self.node_data {
            d.nd = nd;
            d.na = na;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::material::Material;

    #[test]
    fn line_region_geometry() {
        let mut mesh = Mesh::new();
        let region = SimulationRegion::line(
            "bulk",
            RegionKind::Semiconductor,
            Material::silicon(),
            &mut mesh,
            &[0.0, 1.0, 3.0],
            2.0,
        );
        assert_eq!(region.fvm_nodes.len(), 3);
        assert_eq!(region.edges.len(), 2);
        // end node: half of the first segment times the cross section
        assert!((region.fvm_nodes[0].volume - 1.0).abs() < 1e-12);
        // middle node spans half of each adjacent segment
        assert!((region.fvm_nodes[1].volume - 3.0).abs() < 1e-12);
        assert_eq!(region.fvm_nodes[1].neighbors.len(), 2);
        assert_eq!(region.fvm_nodes[0].neighbor_edge(1), Some(0));
        assert_eq!(region.fvm_nodes[0].neighbor_edge(2), None);
    }

    #[test]
    fn truncation_clamps_negative_areas() {
        let mut region =
            SimulationRegion::new("r", RegionKind::Semiconductor, Material::silicon());
        region.advanced.truncate_cv = true;
        let a = region.add_fvm_node(0, 1.0);
        let b = region.add_fvm_node(1, 1.0);
        let e = region.add_edge(a, b, 1.0, -0.25);
        assert_eq!(region.edges[e].cv_area, 0.0);
    }
}
