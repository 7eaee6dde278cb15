use glam::DVec3;
use nalgebra::{Matrix3, Vector3};

/// A geometric mesh point. Globally unique; shared by every region-local
/// control volume sitting on it.
pub struct Node {
    pub id: usize,
    pub position: DVec3,
    /// Owning rank in an SPMD run. Serial runs leave this at 0.
    pub processor_id: usize,
}

/// The geometric node arena. Connectivity and control-volume geometry live
/// in the regions; the mesh only owns positions and ownership.
#[derive(Default)]
pub struct Mesh {
    pub nodes: Vec<Node>,
}

impl Mesh {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add_node(&mut self, position: DVec3) -> usize {
        self.add_node_on(position, 0)
    }

    pub fn add_node_on(&mut self, position: DVec3, processor_id: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            position,
            processor_id,
        });
        id
    }

    pub fn distance(&self, a: usize, b: usize) -> f64 {
        (self.nodes[a].position - self.nodes[b].position).length()
    }
}

/// Least-squares gradient of a vertex field around `origin`, from neighbor
/// positions and values. Degenerate directions (1D/2D point sets) are
/// regularized so the in-plane components stay exact and the out-of-plane
/// component comes out zero.
pub fn least_squares_gradient(
    origin: DVec3,
    origin_value: f64,
    neighbors: &[(DVec3, f64)],
) -> DVec3 {
    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for (pos, value) in neighbors {
        let d = *pos - origin;
        let dv = value - origin_value;
        let r = Vector3::new(d.x, d.y, d.z);
        ata += r * r.transpose();
        atb += r * dv;
    }
    // Tikhonov floor keeps the normal equations invertible for collinear
    // or coplanar stencils. Scaled by the stencil itself so fine meshes
    // are not biased.
    let scale = ata.diagonal().amax();
    if scale <= 0.0 {
        return DVec3::ZERO;
    }
    let reg = 1e-12 * scale;
    for i in 0..3 {
        ata[(i, i)] += reg;
    }
    match ata.lu().solve(&atb) {
        Some(g) => DVec3::new(g[0], g[1], g[2]),
        None => DVec3::ZERO,
    }
}
