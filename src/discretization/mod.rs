pub mod mesh;
pub mod region;
